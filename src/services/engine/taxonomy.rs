//! Families of derived output columns.
//!
//! Built-in formulas declare their family and output columns directly. The
//! suffix markers are only consulted for engines that return output without
//! naming the columns they derived.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DerivedFamily {
    Numeric,
    Text,
    Aggregate,
    Reshape,
    SelectionFilter,
    /// Columns a column-selection step copied out of a source file.
    Selected,
    /// Columns produced by matching keys across files.
    ExactMatch,
}

impl DerivedFamily {
    pub const ALL: [DerivedFamily; 7] = [
        DerivedFamily::Numeric,
        DerivedFamily::Text,
        DerivedFamily::Aggregate,
        DerivedFamily::Reshape,
        DerivedFamily::SelectionFilter,
        DerivedFamily::Selected,
        DerivedFamily::ExactMatch,
    ];

    /// Name fragments that mark a column as belonging to this family.
    pub fn markers(self) -> &'static [&'static str] {
        match self {
            DerivedFamily::Numeric => &["_add", "_subtract", "_multiply", "_divide"],
            DerivedFamily::Text => &["_upper", "_lower", "_trim", "_length", "_proper"],
            DerivedFamily::Aggregate => &["_sum", "_count", "_avg", "_unique_count"],
            DerivedFamily::Reshape => &["_pivot", "_depivot"],
            DerivedFamily::SelectionFilter => &["_filtered", "_dedup"],
            DerivedFamily::Selected => &["_selected"],
            DerivedFamily::ExactMatch => &["_lookup", "_exact_match"],
        }
    }

    /// Guesses the family of a column from its name alone.
    pub fn classify(column: &str) -> Option<DerivedFamily> {
        let lowered = column.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|family| family.markers().iter().any(|marker| lowered.contains(marker)))
    }
}

/// Columns of `columns` whose names carry a derived-family marker.
pub fn classify_columns(columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .filter(|column| DerivedFamily::classify(column).is_some())
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_marker() {
        assert_eq!(DerivedFamily::classify("Name_upper"), Some(DerivedFamily::Text));
        assert_eq!(DerivedFamily::classify("price_add"), Some(DerivedFamily::Numeric));
        assert_eq!(DerivedFamily::classify("qty_unique_count"), Some(DerivedFamily::Aggregate));
        assert_eq!(DerivedFamily::classify("attribute_depivot"), Some(DerivedFamily::Reshape));
        assert_eq!(DerivedFamily::classify("Name"), None);
    }

    #[test]
    fn error_marker_is_not_derived() {
        assert!(classify_columns(&[crate::models::ERROR_COLUMN.to_string()]).is_empty());
    }

    #[test]
    fn input_columns_with_reserved_suffix_are_misclassified() {
        // A user column literally named like an aggregate output. Only the
        // declared-columns path avoids this.
        assert_eq!(DerivedFamily::classify("sales_sum"), Some(DerivedFamily::Aggregate));
    }
}

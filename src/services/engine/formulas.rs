use super::taxonomy::DerivedFamily;
use crate::models::Record;
use once_cell::sync::Lazy;
use serde_json::Value;
use smallvec::{smallvec, SmallVec};
use std::collections::HashMap;

/// The structural formula that reads across every imported file.
pub const LOOKUP_FORMULA: &str = "VLOOKUP";

pub const DEPIVOT_ATTRIBUTE: &str = "attribute_depivot";
pub const DEPIVOT_VALUE: &str = "value_depivot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOp {
    Upper,
    Lower,
    Trim,
    Length,
    ProperCase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Count,
    Average,
    UniqueCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReshapeOp {
    Depivot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equals,
    RemoveDuplicates,
}

/// A built-in formula. Each variant owns the names of the columns it adds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formula {
    Text(TextOp),
    Numeric(NumericOp),
    Aggregate(AggregateOp),
    Reshape(ReshapeOp),
    Filter(FilterOp),
    Lookup,
}

impl Formula {
    pub fn name(&self) -> &'static str {
        match self {
            Formula::Text(TextOp::Upper) => "UPPER",
            Formula::Text(TextOp::Lower) => "LOWER",
            Formula::Text(TextOp::Trim) => "TRIM",
            Formula::Text(TextOp::Length) => "TEXT_LENGTH",
            Formula::Text(TextOp::ProperCase) => "PROPER_CASE",
            Formula::Numeric(NumericOp::Add) => "ADD",
            Formula::Numeric(NumericOp::Subtract) => "SUBTRACT",
            Formula::Numeric(NumericOp::Multiply) => "MULTIPLY",
            Formula::Numeric(NumericOp::Divide) => "DIVIDE",
            Formula::Aggregate(AggregateOp::Sum) => "SUM",
            Formula::Aggregate(AggregateOp::Count) => "COUNT",
            Formula::Aggregate(AggregateOp::Average) => "AVERAGE",
            Formula::Aggregate(AggregateOp::UniqueCount) => "UNIQUE_COUNT",
            Formula::Reshape(ReshapeOp::Depivot) => "DEPIVOT",
            Formula::Filter(FilterOp::Equals) => "FILTER",
            Formula::Filter(FilterOp::RemoveDuplicates) => "REMOVE_DUPLICATES",
            Formula::Lookup => LOOKUP_FORMULA,
        }
    }

    pub fn family(&self) -> DerivedFamily {
        match self {
            Formula::Text(_) => DerivedFamily::Text,
            Formula::Numeric(_) => DerivedFamily::Numeric,
            Formula::Aggregate(_) => DerivedFamily::Aggregate,
            Formula::Reshape(_) => DerivedFamily::Reshape,
            Formula::Filter(_) => DerivedFamily::SelectionFilter,
            Formula::Lookup => DerivedFamily::ExactMatch,
        }
    }

    /// Whether the formula needs every imported file rather than one stream.
    pub fn requires_all_sources(&self) -> bool {
        matches!(self, Formula::Lookup)
    }

    /// Columns this formula adds for the given target and parameters.
    pub fn output_columns(&self, target: &str, parameters: &Record) -> SmallVec<[String; 2]> {
        let suffix = match self {
            Formula::Text(TextOp::Upper) => "upper",
            Formula::Text(TextOp::Lower) => "lower",
            Formula::Text(TextOp::Trim) => "trim",
            Formula::Text(TextOp::Length) => "length",
            Formula::Text(TextOp::ProperCase) => "proper",
            Formula::Numeric(NumericOp::Add) => "add",
            Formula::Numeric(NumericOp::Subtract) => "subtract",
            Formula::Numeric(NumericOp::Multiply) => "multiply",
            Formula::Numeric(NumericOp::Divide) => "divide",
            Formula::Aggregate(AggregateOp::Sum) => "sum",
            Formula::Aggregate(AggregateOp::Count) => "count",
            Formula::Aggregate(AggregateOp::Average) => "avg",
            Formula::Aggregate(AggregateOp::UniqueCount) => "unique_count",
            Formula::Filter(FilterOp::Equals) => "filtered",
            Formula::Filter(FilterOp::RemoveDuplicates) => "dedup",
            Formula::Reshape(ReshapeOp::Depivot) => {
                return smallvec![DEPIVOT_ATTRIBUTE.to_string(), DEPIVOT_VALUE.to_string()];
            }
            Formula::Lookup => {
                let returned = parameters
                    .get("return_column")
                    .and_then(Value::as_str)
                    .unwrap_or(target);
                return smallvec![format!("{}_lookup", returned)];
            }
        };
        smallvec![format!("{}_{}", target, suffix)]
    }
}

/// Formulas addressable by name, case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct FormulaRegistry {
    formulas: HashMap<&'static str, Formula>,
}

impl FormulaRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for formula in [
            Formula::Text(TextOp::Upper),
            Formula::Text(TextOp::Lower),
            Formula::Text(TextOp::Trim),
            Formula::Text(TextOp::Length),
            Formula::Text(TextOp::ProperCase),
            Formula::Numeric(NumericOp::Add),
            Formula::Numeric(NumericOp::Subtract),
            Formula::Numeric(NumericOp::Multiply),
            Formula::Numeric(NumericOp::Divide),
            Formula::Aggregate(AggregateOp::Sum),
            Formula::Aggregate(AggregateOp::Count),
            Formula::Aggregate(AggregateOp::Average),
            Formula::Aggregate(AggregateOp::UniqueCount),
            Formula::Reshape(ReshapeOp::Depivot),
            Formula::Filter(FilterOp::Equals),
            Formula::Filter(FilterOp::RemoveDuplicates),
            Formula::Lookup,
        ] {
            registry.register(formula);
        }
        registry
    }

    pub fn register(&mut self, formula: Formula) {
        self.formulas.insert(formula.name(), formula);
    }

    pub fn get(&self, name: &str) -> Option<Formula> {
        self.formulas.get(name.trim().to_ascii_uppercase().as_str()).copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.formulas.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

pub static BUILTIN_FORMULAS: Lazy<FormulaRegistry> = Lazy::new(FormulaRegistry::builtin);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(BUILTIN_FORMULAS.get("upper"), Some(Formula::Text(TextOp::Upper)));
        assert_eq!(BUILTIN_FORMULAS.get(" vlookup "), Some(Formula::Lookup));
        assert_eq!(BUILTIN_FORMULAS.get("DIVIDE_BY_ZERO"), None);
    }

    #[test]
    fn formulas_declare_their_output_columns() {
        let none = Record::new();
        assert_eq!(Formula::Text(TextOp::Upper).output_columns("Name", &none).to_vec(), vec!["Name_upper"]);
        assert_eq!(
            Formula::Reshape(ReshapeOp::Depivot).output_columns("id", &none).to_vec(),
            vec![DEPIVOT_ATTRIBUTE, DEPIVOT_VALUE]
        );

        let mut params = Record::new();
        params.insert("return_column".into(), Value::from("region"));
        assert_eq!(Formula::Lookup.output_columns("customer_id", &params).to_vec(), vec!["region_lookup"]);
    }

    #[test]
    fn declared_columns_agree_with_family_markers() {
        let none = Record::new();
        for name in BUILTIN_FORMULAS.names() {
            let formula = BUILTIN_FORMULAS.get(name).unwrap();
            for column in formula.output_columns("col", &none) {
                assert_eq!(DerivedFamily::classify(&column), Some(formula.family()), "{}", column);
            }
        }
    }
}

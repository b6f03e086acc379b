use crate::models::{DisplayMode, Record, StepResult};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectedView {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

/// Narrows a step's output for display.
///
/// `Step` shows everything the step saw and produced. `Final` keeps only
/// derived columns; rows are never dropped, a row with no derived values
/// becomes an empty record.
pub fn project(columns: &[String], rows: &[Record], mode: DisplayMode, derived: &[String]) -> ProjectedView {
    match mode {
        DisplayMode::Step => ProjectedView {
            columns: columns.to_vec(),
            rows: rows.to_vec(),
        },
        DisplayMode::Final => {
            let derived: HashSet<&str> = derived.iter().map(String::as_str).collect();
            let surviving: Vec<String> = columns
                .iter()
                .filter(|column| derived.contains(column.as_str()))
                .cloned()
                .collect();
            let keep: HashSet<&str> = surviving.iter().map(String::as_str).collect();

            let rows = rows
                .par_iter()
                .map(|row| {
                    row.iter()
                        .filter(|(key, _)| keep.contains(key.as_str()))
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect::<Record>()
                })
                .collect();

            ProjectedView { columns: surviving, rows }
        }
    }
}

pub fn project_result(result: &StepResult, mode: DisplayMode) -> ProjectedView {
    project(&result.columns, &result.rows, mode, &result.derived_columns)
}

//! Decides which datasets a step reads.

use crate::models::{columns_of, DatasetId, FileType, Record, SourceDataset, StepKind, WorkflowStep};
use crate::services::engine::formulas::BUILTIN_FORMULAS;
use std::sync::Arc;

/// What the step before this one left behind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreviousOutput<'a> {
    /// First step of the chain.
    None,
    Rows(&'a [Record]),
    /// An upstream step failed and the chain was reset.
    Reset { failed_step: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOrigin {
    AllSources,
    Chained { from_step: usize },
    /// Empty on purpose: an upstream failure left nothing to chain from.
    Blocked { failed_step: usize },
}

#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub datasets: Vec<Arc<SourceDataset>>,
    pub origin: InputOrigin,
}

impl ResolvedInput {
    /// Rows of every resolved dataset, in dataset order.
    pub fn rows(&self) -> impl Iterator<Item = &Record> {
        self.datasets.iter().flat_map(|d| d.rows.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

/// Name of the synthetic dataset wrapping step `index`'s output.
pub fn chained_dataset_name(index: usize) -> String {
    format!("step_{}_output", index)
}

/// Formulas that read across files take every imported file, not the chain.
fn reads_all_sources(step: &WorkflowStep) -> bool {
    BUILTIN_FORMULAS
        .get(&step.source)
        .is_some_and(|formula| formula.requires_all_sources())
}

/// Picks a step's input. First matching rule wins:
///
/// 1. column selections read the imported files;
/// 2. formulas that read across files read the imported files;
/// 3. functions after a step with output read that output;
/// 4. everything else reads the imported files.
///
/// A function step whose predecessor failed gets an empty input instead.
/// Resolution never fails.
pub fn resolve(
    step: &WorkflowStep,
    step_index: usize,
    all_sources: &[Arc<SourceDataset>],
    previous: PreviousOutput<'_>,
) -> ResolvedInput {
    let all = || ResolvedInput {
        datasets: all_sources.to_vec(),
        origin: InputOrigin::AllSources,
    };

    match step.kind {
        StepKind::ColumnSelection => all(),
        StepKind::Function if reads_all_sources(step) => all(),
        StepKind::Function => match previous {
            PreviousOutput::Rows(rows) if !rows.is_empty() && step_index > 0 => {
                let from_step = step_index - 1;
                let dataset = SourceDataset {
                    id: DatasetId::new(),
                    name: chained_dataset_name(from_step),
                    file_type: FileType::Derived,
                    rows: Arc::new(rows.to_vec()),
                    columns: columns_of(rows),
                    sheets: None,
                    active_sheet: None,
                    raw: None,
                    total_rows: None,
                };
                ResolvedInput {
                    datasets: vec![Arc::new(dataset)],
                    origin: InputOrigin::Chained { from_step },
                }
            }
            PreviousOutput::Reset { failed_step } => ResolvedInput {
                datasets: Vec::new(),
                origin: InputOrigin::Blocked { failed_step },
            },
            _ => all(),
        },
        StepKind::Other => all(),
    }
}

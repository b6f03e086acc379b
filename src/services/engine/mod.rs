//! The transformation engine contract and the built-in formula engine.
//!
//! The preview pipeline only talks to [`TransformEngine`]. What a formula
//! does to the data is the engine's business.

pub mod formula_engine;
pub mod formulas;
pub mod taxonomy;

pub use formula_engine::FormulaEngine;
pub use formulas::{Formula, FormulaRegistry};
pub use taxonomy::DerivedFamily;

use crate::models::{Record, SourceDataset, WorkflowStep};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Unknown formula: {0}")]
    UnknownFormula(String),
    #[error("Step {step} has no target column")]
    MissingTarget { step: String },
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("Column {column} not found in {dataset}")]
    UnknownColumn { column: String, dataset: String },
    #[error("Division by zero")]
    DivisionByZero,
}

/// What an engine hands back for one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    /// At most `sample_size` rows.
    pub rows: Vec<Record>,
    pub columns: Vec<String>,
    /// Row count before sampling.
    pub row_count: usize,
    /// Output columns the step computed. `None` when the engine does not say.
    pub derived_columns: Option<Vec<String>>,
}

impl EngineOutput {
    pub fn empty() -> Self {
        Self {
            derived_columns: Some(Vec::new()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait TransformEngine: Send + Sync {
    async fn process_step(
        &self,
        step: &WorkflowStep,
        inputs: &[Arc<SourceDataset>],
        sample_size: usize,
    ) -> Result<EngineOutput, EngineError>;
}

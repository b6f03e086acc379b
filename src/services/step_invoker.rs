use crate::models::{Record, SourceDataset, StepResult, WorkflowStep};
use crate::services::engine::taxonomy::classify_columns;
use crate::services::engine::{EngineError, TransformEngine};
use crate::services::input_resolver::{InputOrigin, ResolvedInput};
use crate::services::materializer::{MaterializationCache, MaterializeError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Why a single step produced no result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepFailure {
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Materializes a step's input and hands it to the engine.
pub struct StepInvoker {
    engine: Arc<dyn TransformEngine>,
    materializer: Arc<MaterializationCache>,
    preview_row_cap: usize,
}

impl StepInvoker {
    pub fn new(engine: Arc<dyn TransformEngine>, materializer: Arc<MaterializationCache>, preview_row_cap: usize) -> Self {
        Self {
            engine,
            materializer,
            preview_row_cap,
        }
    }

    /// Effective row bound for a run: the sample size, else the preview cap.
    pub fn row_cap(&self, sample_size: Option<usize>) -> usize {
        sample_size.unwrap_or(self.preview_row_cap)
    }

    pub async fn invoke(
        &self,
        step: &WorkflowStep,
        step_index: usize,
        input: &ResolvedInput,
        sample_size: Option<usize>,
    ) -> Result<StepResult, StepFailure> {
        let start = Instant::now();
        let row_cap = self.row_cap(sample_size);

        let datasets = input
            .datasets
            .iter()
            .map(|dataset| self.materializer.materialize(dataset, row_cap))
            .collect::<Result<Vec<Arc<SourceDataset>>, _>>()?;

        let output = self.engine.process_step(step, &datasets, row_cap).await?;

        // Engines that do not declare their outputs fall back to name markers.
        let derived_columns = output
            .derived_columns
            .unwrap_or_else(|| classify_columns(&output.columns));

        Ok(StepResult {
            step_index,
            memory_usage: estimate_memory(&output.rows),
            rows: output.rows,
            columns: output.columns,
            row_count: output.row_count,
            execution_time_ms: start.elapsed().as_millis() as u64,
            sample_size: row_cap,
            derived_columns,
            failure: None,
            blocked_by: match input.origin {
                InputOrigin::Blocked { failed_step } => Some(failed_step),
                _ => None,
            },
        })
    }
}

/// Rough in-memory footprint of a row sample, in bytes.
pub fn estimate_memory(rows: &[Record]) -> u64 {
    fn value_size(value: &Value) -> usize {
        std::mem::size_of::<Value>()
            + match value {
                Value::String(s) => s.len(),
                Value::Array(items) => items.iter().map(value_size).sum(),
                Value::Object(map) => map.iter().map(|(k, v)| k.len() + value_size(v)).sum(),
                _ => 0,
            }
    }

    rows.iter()
        .map(|row| row.iter().map(|(k, v)| k.len() + value_size(v)).sum::<usize>())
        .sum::<usize>() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileType;
    use crate::services::engine::{EngineOutput, FormulaEngine};
    use crate::services::input_resolver::{resolve, PreviousOutput};
    use crate::services::materializer::tests::CountingParser;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn invoker_with(engine: Arc<dyn TransformEngine>, parser: Arc<CountingParser>) -> StepInvoker {
        StepInvoker::new(engine, Arc::new(MaterializationCache::new(parser, 16)), 1000)
    }

    fn raw_sources() -> Vec<Arc<SourceDataset>> {
        vec![Arc::new(SourceDataset::from_raw_text(
            "people.csv",
            FileType::Csv,
            "Name,Age\nann,31\nbob,42\ncat,27\n",
        ))]
    }

    #[tokio::test]
    async fn materializes_raw_input_once_per_cap() {
        let parser = Arc::new(CountingParser::default());
        let invoker = invoker_with(Arc::new(FormulaEngine::default()), parser.clone());
        let sources = raw_sources();
        let step = WorkflowStep::function("s1", 0, "UPPER").with_target("Name");
        let input = resolve(&step, 0, &sources, PreviousOutput::None);

        let first = invoker.invoke(&step, 0, &input, Some(2)).await.unwrap();
        let second = invoker.invoke(&step, 0, &input, Some(2)).await.unwrap();

        assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.rows, second.rows);
        assert_eq!(first.rows.len(), 2);
        assert_eq!(first.sample_size, 2);
        assert_eq!(first.derived_columns, vec!["Name_upper"]);
    }

    #[tokio::test]
    async fn unset_sample_size_uses_preview_cap() {
        let parser = Arc::new(CountingParser::default());
        let invoker = invoker_with(Arc::new(FormulaEngine::default()), parser);
        let sources = raw_sources();
        let step = WorkflowStep::function("s1", 0, "LOWER").with_target("Name");
        let input = resolve(&step, 0, &sources, PreviousOutput::None);

        let result = invoker.invoke(&step, 0, &input, None).await.unwrap();
        assert_eq!(result.sample_size, 1000);
        assert_eq!(result.row_count, 3);
    }

    #[tokio::test]
    async fn undeclared_outputs_are_classified_by_name() {
        struct Opaque;
        #[async_trait]
        impl TransformEngine for Opaque {
            async fn process_step(
                &self,
                _step: &WorkflowStep,
                _inputs: &[Arc<SourceDataset>],
                _sample_size: usize,
            ) -> Result<EngineOutput, EngineError> {
                Ok(EngineOutput {
                    rows: vec![serde_json::from_value(json!({"Name": "ann", "Name_upper": "ANN"})).unwrap()],
                    columns: vec!["Name".into(), "Name_upper".into()],
                    row_count: 1,
                    derived_columns: None,
                })
            }
        }

        let invoker = invoker_with(Arc::new(Opaque), Arc::new(CountingParser::default()));
        let step = WorkflowStep::function("s1", 0, "UPPER");
        let input = resolve(&step, 0, &[], PreviousOutput::None);
        let result = invoker.invoke(&step, 4, &input, Some(5)).await.unwrap();
        assert_eq!(result.step_index, 4);
        assert_eq!(result.derived_columns, vec!["Name_upper"]);
        assert!(result.memory_usage > 0);
    }

    #[tokio::test]
    async fn engine_rejection_is_a_step_failure() {
        let invoker = invoker_with(Arc::new(FormulaEngine::default()), Arc::new(CountingParser::default()));
        let sources = raw_sources();
        let step = WorkflowStep::function("s1", 0, "DIVIDE_BY_ZERO");
        let input = resolve(&step, 0, &sources, PreviousOutput::None);
        let err = invoker.invoke(&step, 0, &input, Some(10)).await.unwrap_err();
        assert_eq!(err, StepFailure::Engine(EngineError::UnknownFormula("DIVIDE_BY_ZERO".into())));
    }
}

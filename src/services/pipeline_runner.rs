//! Sequential execution of a workflow over a bounded sample.
//!
//! Each step's input comes from the input resolver, each step runs through
//! the step invoker, and a failing step is replaced by a sentinel result so
//! the rest of the workflow still previews.

use crate::models::{SourceDataset, StepResult, WorkflowStep};
use crate::services::input_resolver::{resolve, InputOrigin, PreviousOutput};
use crate::services::observer::RunObserver;
use crate::services::step_invoker::StepInvoker;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Failures of the run as a whole. Step failures never surface here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("Duplicate step order {order} (steps {first} and {second})")]
    DuplicateOrder { order: u32, first: String, second: String },
    #[error("Step order must be contiguous from 0: expected {expected}, found {found}")]
    NonContiguousOrder { expected: u32, found: u32 },
    #[error("Duplicate step id {0}")]
    DuplicateId(String),
}

/// Orders steps by `order` and checks it runs 0, 1, 2, ... with unique ids.
pub fn order_steps(steps: &[WorkflowStep]) -> Result<Vec<&WorkflowStep>, PipelineError> {
    let mut ordered: Vec<&WorkflowStep> = steps.iter().collect();
    ordered.sort_by_key(|step| step.order);

    let mut ids = HashSet::new();
    for (position, step) in ordered.iter().enumerate() {
        if !ids.insert(step.id.as_str()) {
            return Err(PipelineError::DuplicateId(step.id.clone()));
        }
        let expected = position as u32;
        if step.order != expected {
            if position > 0 && ordered[position - 1].order == step.order {
                return Err(PipelineError::DuplicateOrder {
                    order: step.order,
                    first: ordered[position - 1].id.clone(),
                    second: step.id.clone(),
                });
            }
            return Err(PipelineError::NonContiguousOrder {
                expected,
                found: step.order,
            });
        }
    }
    Ok(ordered)
}

pub struct PipelineRunner {
    invoker: StepInvoker,
    observer: Arc<dyn RunObserver>,
}

impl PipelineRunner {
    pub fn new(invoker: StepInvoker, observer: Arc<dyn RunObserver>) -> Self {
        Self { invoker, observer }
    }

    /// Runs every step in order and returns one result per step.
    ///
    /// Only a malformed step list fails the run; a failing step becomes a
    /// sentinel result and resets the chain for the steps after it.
    pub async fn run(
        &self,
        generation: u64,
        steps: &[WorkflowStep],
        sources: &[Arc<SourceDataset>],
        sample_size: Option<usize>,
    ) -> Result<Vec<StepResult>, PipelineError> {
        let ordered = order_steps(steps)?;
        self.observer.on_run_start(generation, ordered.len());

        let mut results: Vec<StepResult> = Vec::with_capacity(ordered.len());
        let mut failed_upstream: Option<usize> = None;

        for (index, step) in ordered.into_iter().enumerate() {
            let previous = match (failed_upstream, results.last()) {
                (Some(failed_step), _) => PreviousOutput::Reset { failed_step },
                (None, Some(last)) => PreviousOutput::Rows(&last.rows),
                (None, None) => PreviousOutput::None,
            };
            let input = resolve(step, index, sources, previous);
            self.observer.on_step_start(index, step);

            let result = match self.invoker.invoke(step, index, &input, sample_size).await {
                Ok(mut result) => {
                    if let InputOrigin::Chained { .. } = input.origin {
                        if let Some(last) = results.last() {
                            carry_derived(&mut result, &last.derived_columns);
                        }
                    }
                    // A blocked step that produced nothing keeps the chain reset.
                    if !(result.blocked_by.is_some() && result.rows.is_empty()) {
                        failed_upstream = None;
                    }
                    result
                }
                Err(error) => {
                    self.observer.on_error(index, step, &error);
                    failed_upstream = Some(index);
                    StepResult::sentinel(index, error.to_string())
                }
            };

            self.observer.on_step_end(&result);
            results.push(result);
        }

        self.observer.on_run_end(generation, &results);
        Ok(results)
    }
}

/// Adds the previous step's derived columns that survive in `result`.
fn carry_derived(result: &mut StepResult, previous: &[String]) {
    let own: HashSet<&str> = result.derived_columns.iter().map(String::as_str).collect();
    let merged: Vec<String> = result
        .columns
        .iter()
        .filter(|column| own.contains(column.as_str()) || previous.contains(column))
        .cloned()
        .collect();
    // Keep declared columns the engine listed but did not emit as columns.
    let missing: Vec<String> = result
        .derived_columns
        .iter()
        .filter(|column| !merged.contains(column))
        .cloned()
        .collect();
    result.derived_columns = merged.into_iter().chain(missing).collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileType, Record};
    use crate::services::engine::FormulaEngine;
    use crate::services::materializer::MaterializationCache;
    use crate::services::observer::NoopObserver;
    use crate::services::step_invoker::StepFailure;
    use parking_lot::Mutex;
    use serde_json::json;

    fn runner_with_observer(observer: Arc<dyn RunObserver>) -> PipelineRunner {
        let invoker = StepInvoker::new(
            Arc::new(FormulaEngine::default()),
            Arc::new(MaterializationCache::default()),
            1000,
        );
        PipelineRunner::new(invoker, observer)
    }

    fn runner() -> PipelineRunner {
        runner_with_observer(Arc::new(NoopObserver))
    }

    fn sources() -> Vec<Arc<SourceDataset>> {
        let rows: Vec<Record> = serde_json::from_value(json!([{"Name": "ann"}, {"Name": "bob"}])).unwrap();
        vec![Arc::new(SourceDataset::from_rows("people.csv", FileType::Csv, rows))]
    }

    #[test]
    fn order_must_be_contiguous_and_unique() {
        let a = WorkflowStep::function("a", 0, "UPPER");
        let b = WorkflowStep::function("b", 2, "UPPER");
        assert_eq!(
            order_steps(&[a.clone(), b]).unwrap_err(),
            PipelineError::NonContiguousOrder { expected: 1, found: 2 }
        );

        let dup = WorkflowStep::function("c", 0, "UPPER");
        assert!(matches!(
            order_steps(&[a.clone(), dup]).unwrap_err(),
            PipelineError::DuplicateOrder { order: 0, .. }
        ));

        let same_id = WorkflowStep::function("a", 1, "LOWER");
        assert_eq!(order_steps(&[a, same_id]).unwrap_err(), PipelineError::DuplicateId("a".into()));
    }

    #[test]
    fn steps_run_in_order_field_sequence() {
        let second = WorkflowStep::function("second", 1, "LOWER");
        let first = WorkflowStep::function("first", 0, "UPPER");
        let steps = [second, first];
        let ordered = order_steps(&steps).unwrap();
        assert_eq!(ordered[0].id, "first");
        assert_eq!(ordered[1].id, "second");
    }

    #[tokio::test]
    async fn chained_functions_accumulate_derived_columns() {
        let steps = vec![
            WorkflowStep::function("s1", 0, "UPPER").with_target("Name"),
            WorkflowStep::function("s2", 1, "TEXT_LENGTH").with_target("Name_upper"),
        ];
        let results = runner().run(1, &steps, &sources(), Some(10)).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[1].rows[0]["Name_upper_length"], json!(3));
        assert_eq!(results[1].derived_columns, vec!["Name_upper", "Name_upper_length"]);
    }

    #[tokio::test]
    async fn failure_resets_chain_without_aborting() {
        let steps = vec![
            WorkflowStep::function("s1", 0, "DIVIDE_BY_ZERO"),
            WorkflowStep::function("s2", 1, "UPPER").with_target("Name"),
            WorkflowStep::column_selection("s3", 2, "people.csv", "Name"),
            WorkflowStep::function("s4", 3, "UPPER").with_target("Name"),
        ];
        let results = runner().run(1, &steps, &sources(), Some(10)).await.unwrap();

        assert_eq!(results.len(), 4);
        assert!(results[0].is_sentinel());
        assert_eq!(results[0].columns, vec!["Error"]);

        assert!(results[1].rows.is_empty());
        assert_eq!(results[1].blocked_by, Some(0));

        // Column selection reads the files again, which restarts the chain.
        assert_eq!(results[2].rows.len(), 2);
        assert_eq!(results[2].blocked_by, None);
        assert_eq!(results[3].rows[1]["Name_upper"], json!("BOB"));
    }

    #[tokio::test]
    async fn empty_step_list_produces_empty_run() {
        let results = runner().run(1, &[], &sources(), None).await.unwrap();
        assert!(results.is_empty());
    }

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl RunObserver for Recording {
        fn on_run_start(&self, generation: u64, steps: usize) {
            self.events.lock().push(format!("run-start {} {}", generation, steps));
        }
        fn on_step_start(&self, index: usize, _step: &WorkflowStep) {
            self.events.lock().push(format!("start {}", index));
        }
        fn on_step_end(&self, result: &StepResult) {
            self.events.lock().push(format!("end {}", result.step_index));
        }
        fn on_error(&self, index: usize, _step: &WorkflowStep, error: &StepFailure) {
            self.events.lock().push(format!("error {} {}", index, error));
        }
        fn on_run_end(&self, generation: u64, results: &[StepResult]) {
            self.events.lock().push(format!("run-end {} {}", generation, results.len()));
        }
    }

    #[tokio::test]
    async fn observer_sees_every_step() {
        let observer = Arc::new(Recording::default());
        let steps = vec![
            WorkflowStep::function("s1", 0, "NOPE"),
            WorkflowStep::function("s2", 1, "UPPER").with_target("Name"),
        ];
        runner_with_observer(observer.clone())
            .run(7, &steps, &sources(), Some(5))
            .await
            .unwrap();

        let events = observer.events.lock().clone();
        assert_eq!(
            events,
            vec![
                "run-start 7 2",
                "start 0",
                "error 0 Unknown formula: NOPE",
                "end 0",
                "start 1",
                "end 1",
                "run-end 7 2",
            ]
        );
    }
}

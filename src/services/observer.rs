use crate::models::{StepResult, WorkflowStep};
use crate::services::step_invoker::StepFailure;

/// Side channel for pipeline progress. The runner reports here instead of
/// logging from its control flow.
pub trait RunObserver: Send + Sync {
    fn on_run_start(&self, _generation: u64, _steps: usize) {}
    fn on_step_start(&self, _index: usize, _step: &WorkflowStep) {}
    fn on_step_end(&self, _result: &StepResult) {}
    fn on_error(&self, _index: usize, _step: &WorkflowStep, _error: &StepFailure) {}
    fn on_run_end(&self, _generation: u64, _results: &[StepResult]) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Forwards run progress to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_run_start(&self, generation: u64, steps: usize) {
        tracing::info!(generation, steps, "Starting preview run");
    }

    fn on_step_start(&self, index: usize, step: &WorkflowStep) {
        tracing::debug!(index, step_id = %step.id, kind = ?step.kind, source = %step.source, "Running step");
    }

    fn on_step_end(&self, result: &StepResult) {
        tracing::info!(
            index = result.step_index,
            rows = result.rows.len(),
            row_count = result.row_count,
            elapsed_ms = result.execution_time_ms,
            blocked_by = ?result.blocked_by,
            "Step finished"
        );
    }

    fn on_error(&self, index: usize, step: &WorkflowStep, error: &StepFailure) {
        tracing::warn!(index, step_id = %step.id, error = %error, "Step failed, continuing with empty input");
    }

    fn on_run_end(&self, generation: u64, results: &[StepResult]) {
        let failed = results.iter().filter(|r| r.is_sentinel()).count();
        tracing::info!(generation, steps = results.len(), failed, "Preview run finished");
    }
}

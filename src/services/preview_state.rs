//! The last published run and the flags around it.
//!
//! Every refresh takes a new run generation. A run only publishes if its
//! generation is still the latest when it finishes; superseded runs are
//! dropped without touching results or error state.

use crate::models::{DisplayMode, PipelineRun, SourceDataset, StepResult, WorkflowStep};
use crate::services::output_projector::{project_result, ProjectedView};
use crate::services::pipeline_runner::PipelineRunner;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct RunInputs {
    steps: Vec<WorkflowStep>,
    sample_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RefreshOutcome {
    /// Inputs matched the last trigger; nothing ran.
    Unchanged,
    Published { generation: u64, steps: usize },
    Superseded { generation: u64 },
    Failed { generation: u64, message: String },
}

#[derive(Debug, Default)]
struct Inner {
    sources: Vec<Arc<SourceDataset>>,
    last_inputs: Option<RunInputs>,
    published: Option<PipelineRun>,
    error: Option<String>,
    loading_generation: Option<u64>,
    display_mode: DisplayMode,
    selected_step: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub name: String,
    pub file_type: crate::models::FileType,
    pub materialized: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewSnapshot {
    pub generation: u64,
    pub loading: bool,
    pub error: Option<String>,
    pub display_mode: DisplayMode,
    pub selected_step: Option<usize>,
    pub step_count: usize,
    pub failed_steps: Vec<usize>,
    pub sample_size: Option<usize>,
    pub sources: Vec<SourceSummary>,
}

pub struct PreviewState {
    runner: PipelineRunner,
    generation: AtomicU64,
    inner: RwLock<Inner>,
}

impl PreviewState {
    pub fn new(runner: PipelineRunner) -> Self {
        Self {
            runner,
            generation: AtomicU64::new(0),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Replaces the imported file set. Does not start a run.
    pub fn set_sources(&self, sources: Vec<SourceDataset>) {
        self.inner.write().sources = sources.into_iter().map(Arc::new).collect();
    }

    /// Runs the pipeline if the steps or sample size differ from the last trigger.
    pub async fn update(&self, steps: Vec<WorkflowStep>, sample_size: Option<usize>) -> RefreshOutcome {
        let inputs = RunInputs { steps, sample_size };
        {
            let mut inner = self.inner.write();
            if inner.last_inputs.as_ref() == Some(&inputs) {
                return RefreshOutcome::Unchanged;
            }
            inner.last_inputs = Some(inputs.clone());
        }
        self.refresh(inputs).await
    }

    /// Re-runs the last inputs, whether or not they changed.
    pub async fn retry(&self) -> RefreshOutcome {
        let inputs = self.inner.read().last_inputs.clone();
        match inputs {
            Some(inputs) => self.refresh(inputs).await,
            None => RefreshOutcome::Unchanged,
        }
    }

    async fn refresh(&self, inputs: RunInputs) -> RefreshOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let sources = {
            let mut inner = self.inner.write();
            if inputs.steps.is_empty() {
                inner.published = Some(PipelineRun {
                    generation,
                    sample_size: inputs.sample_size,
                    results: Vec::new(),
                    completed_at: Utc::now(),
                });
                inner.error = None;
                inner.loading_generation = None;
                inner.selected_step = None;
                return RefreshOutcome::Published { generation, steps: 0 };
            }
            inner.loading_generation = Some(generation);
            inner.sources.clone()
        };

        let outcome = self
            .runner
            .run(generation, &inputs.steps, &sources, inputs.sample_size)
            .await;

        let mut inner = self.inner.write();
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "Discarding superseded preview run");
            return RefreshOutcome::Superseded { generation };
        }
        inner.loading_generation = None;

        match outcome {
            Ok(results) => {
                let steps = results.len();
                if inner.selected_step.is_some_and(|idx| idx >= steps) {
                    inner.selected_step = steps.checked_sub(1);
                }
                inner.published = Some(PipelineRun {
                    generation,
                    sample_size: inputs.sample_size,
                    results,
                    completed_at: Utc::now(),
                });
                inner.error = None;
                RefreshOutcome::Published { generation, steps }
            }
            Err(e) => {
                tracing::error!(generation, error = %e, "Preview run failed");
                let message = e.to_string();
                inner.published = None;
                inner.error = Some(message.clone());
                RefreshOutcome::Failed { generation, message }
            }
        }
    }

    pub fn get_result(&self, step_index: usize) -> Option<StepResult> {
        self.inner
            .read()
            .published
            .as_ref()
            .and_then(|run| run.results.get(step_index).cloned())
    }

    pub fn get_projected_view(&self, step_index: usize, mode: DisplayMode) -> Option<ProjectedView> {
        let inner = self.inner.read();
        let result = inner.published.as_ref()?.results.get(step_index)?;
        Some(project_result(result, mode))
    }

    /// The selected step (else the last one) in the active display mode.
    pub fn active_view(&self) -> Option<ProjectedView> {
        let (index, mode) = {
            let inner = self.inner.read();
            let last = inner.published.as_ref()?.results.len().checked_sub(1)?;
            (inner.selected_step.unwrap_or(last), inner.display_mode)
        };
        self.get_projected_view(index, mode)
    }

    pub fn published_run(&self) -> Option<PipelineRun> {
        self.inner.read().published.clone()
    }

    pub fn current_run_error(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.read().loading_generation.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.inner.read().display_mode
    }

    pub fn set_display_mode(&self, mode: DisplayMode) {
        self.inner.write().display_mode = mode;
    }

    pub fn selected_step(&self) -> Option<usize> {
        self.inner.read().selected_step
    }

    /// Selects a step of the published run. Returns false if it does not exist.
    pub fn select_step(&self, step_index: usize) -> bool {
        let mut inner = self.inner.write();
        let exists = inner
            .published
            .as_ref()
            .is_some_and(|run| step_index < run.results.len());
        if exists {
            inner.selected_step = Some(step_index);
        }
        exists
    }

    pub fn snapshot(&self) -> PreviewSnapshot {
        let inner = self.inner.read();
        let results = inner.published.as_ref().map(|run| run.results.as_slice()).unwrap_or(&[]);
        PreviewSnapshot {
            generation: self.generation.load(Ordering::SeqCst),
            loading: inner.loading_generation.is_some(),
            error: inner.error.clone(),
            display_mode: inner.display_mode,
            selected_step: inner.selected_step,
            step_count: results.len(),
            failed_steps: results.iter().filter(|r| r.is_sentinel()).map(|r| r.step_index).collect(),
            sample_size: inner.published.as_ref().and_then(|run| run.sample_size),
            sources: inner
                .sources
                .iter()
                .map(|source| SourceSummary {
                    name: source.name.clone(),
                    file_type: source.file_type,
                    materialized: !source.needs_materialization(),
                    columns: source.columns.clone(),
                })
                .collect(),
        }
    }
}

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod routes;
pub mod services;

use services::engine::{FormulaEngine, TransformEngine};
use services::materializer::{DelimitedTextParser, MaterializationCache};
use services::observer::TracingObserver;
use services::pipeline_runner::PipelineRunner;
use services::preview_state::PreviewState;
use services::step_invoker::StepInvoker;

// Application state
pub struct AppState {
    pub config: config::Config,
    pub preview: PreviewState,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: config::Config) -> Self {
        Self::with_engine(config, Arc::new(FormulaEngine::default()))
    }

    /// Builds the state around a caller-supplied transformation engine.
    pub fn with_engine(config: config::Config, engine: Arc<dyn TransformEngine>) -> Self {
        let materializer = Arc::new(MaterializationCache::new(
            Arc::new(DelimitedTextParser),
            config.cache_capacity,
        ));
        let invoker = StepInvoker::new(engine, materializer, config.preview_row_cap);
        let runner = PipelineRunner::new(invoker, Arc::new(TracingObserver));

        Self {
            preview: PreviewState::new(runner),
            http: reqwest::Client::new(),
            config,
        }
    }
}

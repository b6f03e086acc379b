pub mod engine;
pub mod excel;
pub mod import;
pub mod input_resolver;
pub mod materializer;
pub mod observer;
pub mod output_projector;
pub mod pipeline_runner;
pub mod preview_state;
pub mod step_invoker;

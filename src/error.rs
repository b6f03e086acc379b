use axum::{
    response::{IntoResponse, Response},
    http::StatusCode,
};
use serde_json::json;
use axum::Json;
use thiserror::Error;

use crate::services::import::ImportError;
use crate::services::pipeline_runner::PipelineError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Pipeline run failed: {0}")]
    RunFailed(String),
    #[error("Upstream fetch failed: {0}")]
    Upstream(String),
    #[error("File processing error: {0}")]
    FileProcessingError(String),
}

impl From<ImportError> for AppError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Fetch(msg) => AppError::Upstream(msg),
            ImportError::TooLarge { .. } | ImportError::UnsupportedType(_) | ImportError::MissingContent(_) => {
                AppError::InvalidInput(err.to_string())
            }
            ImportError::Decode(_) => AppError::FileProcessingError(err.to_string()),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError::RunFailed(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RunFailed(_) => StatusCode::CONFLICT,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::FileProcessingError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

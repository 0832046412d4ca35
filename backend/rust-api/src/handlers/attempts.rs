use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use validator::Validate;

use crate::{
    models::{AutosaveRequest, GradeRequest, StartAttemptRequest, SubmitMode, SubmitStepRequest},
    services::{step_log::StepLogError, AppState},
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<StepLogError> for ApiError {
    fn from(err: StepLogError) -> Self {
        match err {
            StepLogError::NotFound(_) => ApiError::NotFound(err.to_string()),
            StepLogError::Conflict { .. } | StepLogError::AttemptFinished(_) => {
                ApiError::Conflict(err.to_string())
            }
            StepLogError::CorruptLog { .. } | StepLogError::Storage(_) => {
                tracing::error!("Step log failure: {:#}", err);
                ApiError::Internal("Failed to process attempt".to_string())
            }
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(message)).into_response()
    }
}

/// POST /api/v1/attempts - Start an attempt
pub async fn start_attempt(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartAttemptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;

    tracing::info!(
        "Starting attempt for question_id={}, user_id={}",
        req.question_id,
        req.user_id
    );

    let view = state.attempt_service().start_attempt(&req).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /api/v1/attempts/{id} - Render an attempt
pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.attempt_service().render(&attempt_id).await?;
    Ok(Json(view))
}

/// POST /api/v1/attempts/{id}/steps - Submit a response
pub async fn submit_step(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    Json(req): Json<SubmitStepRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;

    let service = state.attempt_service();
    let expected = req.expected_last_step_id.as_deref();

    let response = match req.mode {
        SubmitMode::Save => service.save_response(&attempt_id, req.data, expected).await?,
        SubmitMode::Append => {
            service
                .append_real_step(&attempt_id, req.data, expected)
                .await?
        }
        SubmitMode::Finish => {
            service
                .finish_attempt(&attempt_id, req.data, expected)
                .await?
        }
    };

    Ok(Json(response))
}

/// POST /api/v1/attempts/{id}/autosave - Autosave a draft
pub async fn autosave(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    Json(req): Json<AutosaveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;

    let response = state
        .attempt_service()
        .append_autosave_step(
            &attempt_id,
            req.data,
            req.expected_last_step_id.as_deref(),
        )
        .await?;

    Ok(Json(response))
}

/// POST /api/v1/attempts/{id}/grade - Record a grader's verdict
pub async fn grade(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    Json(req): Json<GradeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;

    tracing::info!("Grading attempt {} as {:?}", attempt_id, req.state);

    let response = state
        .attempt_service()
        .grade_attempt(
            &attempt_id,
            req.state,
            req.data,
            req.expected_last_step_id.as_deref(),
        )
        .await?;

    Ok(Json(response))
}

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::dispatcher::DispatchError;

/// Ошибки приемника вебхуков. Каждая превращается в корректный HTTP ответ.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Validation error")]
    Validation,

    #[error("{0}")]
    InvalidSignature(&'static str),

    #[error("Forbidden")]
    Forbidden,

    /// Обработчик упал, и ошибку никто не обработал.
    #[error(transparent)]
    Handler(#[from] DispatchError),
}

// Тело ответа: {"status": "..."}
#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub status: String,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (code, status) = match &self {
            WebhookError::Validation | WebhookError::InvalidSignature(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            WebhookError::Forbidden => (StatusCode::UNAUTHORIZED, self.to_string()),
            WebhookError::Handler(err) => {
                error!(error = %err, "Unhandled error while processing webhook");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
            }
        };
        (code, Json(StatusBody { status })).into_response()
    }
}

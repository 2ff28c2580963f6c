use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatcher::DispatchError;

/// Ошибка произвольного пользовательского кода (хуки, плагины, обработчики).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum QiwiError {
    #[error("Ошибка сети или HTTP запроса: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Ошибка сериализации/десериализации JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Ошибка API QIWI (Статус: {status}): {message}")]
    ApiError {
        status: StatusCode,
        message: String,
        error_details: Option<QiwiApiError>, // Детали ошибки от API
    },

    #[error("Неверный URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Неверное значение заголовка: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Отсутствует обязательное поле: {0}")]
    MissingField(String),

    #[error("Ошибка конфигурации: {0}")]
    Configuration(String),

    #[error("Ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),

    #[error("Некорректный base64 ключ вебхука: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Ошибка в хуке жизненного цикла: {0}")]
    Hook(BoxError),
}

impl QiwiError {
    /// `true`, если API ответило 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, QiwiError::ApiError { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

// Тело ошибки, которое возвращает edge.qiwi.com
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QiwiApiError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub error_code: String, // Например, "auth.forbidden"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dt_stamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

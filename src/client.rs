use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Method, Response};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::errors::{QiwiApiError, QiwiError};
use crate::models::{History, HistoryQuery, Transaction, WebhookInfo, WebhookKey};

// --- Константы ---
const QIWI_API_BASE_URL: &str = "https://edge.qiwi.com/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Максимальный размер страницы истории, который отдает QIWI.
pub const MAX_HISTORY_ROWS: u32 = 50;

// hookType=1: вебхук по HTTP, txnType=2: входящие и исходящие
const HOOK_TYPE_WEB: &str = "1";
const TXN_TYPE_BOTH: &str = "2";

/// То, что ядру диспетчеризации нужно от клиента API.
///
/// Поллинг использует только `history`, приемник вебхуков только
/// `resolve_webhook_key` и `p2p_secret`, исполнитель вызывает `close`
/// при остановке.
#[async_trait]
pub trait PaymentApi: Send + Sync {
    /// Возвращает историю операций, самые свежие первыми.
    async fn history(&self, query: &HistoryQuery) -> Result<Vec<Transaction>, QiwiError>;

    /// Регистрирует вебхук на `public_url` и возвращает его base64 ключ.
    async fn resolve_webhook_key(&self, public_url: &Url) -> Result<String, QiwiError> {
        Err(QiwiError::Configuration(format!(
            "клиент не умеет получать ключ вебхука для {public_url}"
        )))
    }

    /// Секретный ключ P2P, которым подписываются вебхуки счетов.
    fn p2p_secret(&self) -> Option<String> {
        None
    }

    /// Освобождает HTTP сессию.
    async fn close(&self) -> Result<(), QiwiError> {
        Ok(())
    }
}

// --- Клиент QIWI Кошелька ---

pub struct QiwiWallet {
    session: Mutex<Option<ReqwestClient>>, // Создается лениво, см. ensure_ready
    api_access_token: String,
    phone_number: Option<String>,
    secret_p2p: Option<String>,
    base_url: String,
}

impl QiwiWallet {
    /// Создает новый клиент QIWI API.
    ///
    /// # Arguments
    ///
    /// * `api_access_token` - Токен доступа к API кошелька.
    pub fn new(api_access_token: impl Into<String>) -> Self {
        QiwiWallet {
            session: Mutex::new(None),
            api_access_token: api_access_token.into(),
            phone_number: None,
            secret_p2p: None,
            base_url: QIWI_API_BASE_URL.to_string(),
        }
    }

    /// Номер кошелька, нужен для истории платежей. Плюс в начале допускается.
    pub fn with_phone_number(mut self, phone_number: impl Into<String>) -> Self {
        let phone: String = phone_number.into();
        self.phone_number = Some(phone.trim_start_matches('+').to_string());
        self
    }

    /// Секретный ключ P2P для проверки подписи вебхуков счетов.
    pub fn with_secret_p2p(mut self, secret_p2p: impl Into<String>) -> Self {
        self.secret_p2p = Some(secret_p2p.into());
        self
    }

    /// Устанавливает кастомный базовый URL (для тестирования или прокси).
    pub fn set_base_url(mut self, base_url: String) -> Self {
        self.base_url = if base_url.ends_with('/') {
            base_url
        } else {
            format!("{base_url}/")
        };
        self
    }

    /// Новый экземпляр с той же конфигурацией и собственной (еще не
    /// созданной) HTTP сессией.
    pub fn clone_config(&self) -> Self {
        QiwiWallet {
            session: Mutex::new(None),
            api_access_token: self.api_access_token.clone(),
            phone_number: self.phone_number.clone(),
            secret_p2p: self.secret_p2p.clone(),
            base_url: self.base_url.clone(),
        }
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    /// Открыта ли сейчас HTTP сессия.
    pub fn is_session_open(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Возвращает HTTP сессию, создавая ее при первом обращении.
    pub fn ensure_ready(&self) -> Result<ReqwestClient, QiwiError> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = session.as_ref() {
            return Ok(client.clone());
        }
        let client = ReqwestClient::builder().timeout(REQUEST_TIMEOUT).build()?;
        debug!("HTTP session created");
        *session = Some(client.clone());
        Ok(client)
    }

    // Внутренний метод для отправки запросов
    async fn send_request<T: Serialize>(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(String, String)],
        body: Option<&T>,
    ) -> Result<Response, QiwiError> {
        let client = self.ensure_ready()?;
        let url = Url::parse(&self.base_url)?.join(endpoint)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json")); // Явно указываем, что ждем JSON

        let mut request_builder = client
            .request(method, url)
            .bearer_auth(&self.api_access_token)
            .headers(headers);

        if !query.is_empty() {
            request_builder = request_builder.query(query);
        }
        if let Some(payload) = body {
            request_builder = request_builder.json(payload);
        }

        let response = request_builder.send().await?;
        debug!(status = %response.status(), endpoint, "QIWI API responded");
        Ok(response)
    }

    // Внутренний метод для обработки ответа и парсинга JSON
    async fn process_response<R: for<'de> Deserialize<'de>>(
        &self,
        response: Response,
    ) -> Result<R, QiwiError> {
        let status = response.status();
        if status.is_success() {
            response.json::<R>().await.map_err(QiwiError::Reqwest)
        } else {
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Не удалось прочитать тело ответа".to_string());
            // Пытаемся распарсить как ошибку API
            let api_error_details: Option<QiwiApiError> = serde_json::from_str(&body_text).ok();
            Err(QiwiError::ApiError {
                status,
                message: body_text,
                error_details: api_error_details,
            })
        }
    }

    // Для запросов, у которых тело ответа нас не интересует
    async fn expect_success(&self, response: Response) -> Result<(), QiwiError> {
        self.process_response::<serde_json::Value>(response)
            .await
            .map(|_| ())
            .or_else(|err| match err {
                // Пустое тело при 2xx тоже успех
                QiwiError::Reqwest(e) if e.is_decode() => Ok(()),
                other => Err(other),
            })
    }

    /// Получает историю платежей кошелька.
    ///
    /// # Arguments
    ///
    /// * `query` - Параметры выборки. `rows` ограничивается значением `MAX_HISTORY_ROWS`,
    ///   даты передаются только парой.
    pub async fn fetch_history(&self, query: &HistoryQuery) -> Result<History, QiwiError> {
        let phone = self
            .phone_number
            .as_deref()
            .ok_or_else(|| QiwiError::MissingField("phone_number".to_string()))?;
        let endpoint = format!("payment-history/v2/persons/{phone}/payments");

        let rows = query.rows.clamp(1, MAX_HISTORY_ROWS);
        let mut params = vec![
            ("rows".to_string(), rows.to_string()),
            ("operation".to_string(), query.operation.as_str().to_string()),
        ];
        for (index, source) in query.sources.iter().enumerate() {
            params.push((format!("sources[{index}]"), source.clone()));
        }
        // API принимает startDate и endDate только вместе
        if let (Some(start), Some(end)) = (query.start_date, query.end_date) {
            params.push((
                "startDate".to_string(),
                start.to_rfc3339_opts(SecondsFormat::Secs, false),
            ));
            params.push((
                "endDate".to_string(),
                end.to_rfc3339_opts(SecondsFormat::Secs, false),
            ));
        }

        let response = self
            .send_request::<()>(Method::GET, &endpoint, &params, None)
            .await?;
        self.process_response(response).await
    }

    /// Возвращает активный вебхук, если он есть.
    pub async fn active_webhook(&self) -> Result<Option<WebhookInfo>, QiwiError> {
        let response = self
            .send_request::<()>(Method::GET, "payment-notifier/v1/hooks/active", &[], None)
            .await?;
        match self.process_response(response).await {
            Ok(info) => Ok(Some(info)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Регистрирует новый вебхук на входящие и исходящие платежи.
    ///
    /// # Arguments
    ///
    /// * `url` - Публичный адрес, на который QIWI будет отправлять уведомления.
    pub async fn register_webhook(&self, url: &Url) -> Result<WebhookInfo, QiwiError> {
        let params = vec![
            ("hookType".to_string(), HOOK_TYPE_WEB.to_string()),
            ("param".to_string(), url.to_string()),
            ("txnType".to_string(), TXN_TYPE_BOTH.to_string()),
        ];
        let response = self
            .send_request::<()>(Method::PUT, "payment-notifier/v1/hooks", &params, None)
            .await?;
        self.process_response(response).await
    }

    /// Удаляет вебхук.
    pub async fn delete_webhook(&self, hook_id: &str) -> Result<(), QiwiError> {
        let endpoint = format!("payment-notifier/v1/hooks/{hook_id}");
        let response = self
            .send_request::<()>(Method::DELETE, &endpoint, &[], None)
            .await?;
        self.expect_success(response).await
    }

    /// Получает base64 ключ, которым подписываются уведомления вебхука.
    pub async fn webhook_secret_key(&self, hook_id: &str) -> Result<String, QiwiError> {
        let endpoint = format!("payment-notifier/v1/hooks/{hook_id}/key");
        let response = self
            .send_request::<()>(Method::GET, &endpoint, &[], None)
            .await?;
        let key: WebhookKey = self.process_response(response).await?;
        Ok(key.key)
    }

    /// Привязывает вебхук к `url` и возвращает его ключ.
    ///
    /// Если активный вебхук уже смотрит на этот адрес, он переиспользуется,
    /// иначе старый удаляется и регистрируется новый.
    pub async fn bind_webhook(&self, url: &Url) -> Result<String, QiwiError> {
        let hook_id = match self.active_webhook().await? {
            Some(active) if active.hook_parameters.url == url.as_str() => active.hook_id,
            Some(active) => {
                info!(hook_id = %active.hook_id, "Replacing webhook bound to another url");
                self.delete_webhook(&active.hook_id).await?;
                self.register_webhook(url).await?.hook_id
            }
            None => self.register_webhook(url).await?.hook_id,
        };
        self.webhook_secret_key(&hook_id).await
    }
}

#[async_trait]
impl PaymentApi for QiwiWallet {
    async fn history(&self, query: &HistoryQuery) -> Result<Vec<Transaction>, QiwiError> {
        Ok(self.fetch_history(query).await?.data)
    }

    async fn resolve_webhook_key(&self, public_url: &Url) -> Result<String, QiwiError> {
        self.bind_webhook(public_url).await
    }

    fn p2p_secret(&self) -> Option<String> {
        self.secret_p2p.clone()
    }

    async fn close(&self) -> Result<(), QiwiError> {
        let closed = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if closed.is_some() {
            debug!("HTTP session closed");
        }
        Ok(())
    }
}

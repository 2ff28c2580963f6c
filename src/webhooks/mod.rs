//! Приемник вебхуков QIWI.
//!
//! На каждый вид уведомлений свой POST маршрут. Запрос разбирается,
//! проверяется на повтор, сверяется подпись, и только потом событие
//! уходит в диспетчер.

pub mod collision;
pub mod config;
pub mod error;
pub mod ip_filter;
pub mod signature;
pub mod views;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::post;
use std::sync::Arc;

pub use collision::{CollisionDetector, Fingerprint};
pub use config::{BillWebhookConfig, TransactionWebhookConfig, WebhookConfig, WebhookSecrets};
pub use error::WebhookError;
pub use ip_filter::{Cidr, IpAllowList, ip_filter_middleware};

use crate::dispatcher::{Dispatcher, HandlerContext};

/// Все, что нужно обработчикам маршрутов.
pub struct WebhookState {
    pub dispatcher: Arc<Dispatcher>,
    pub context: HandlerContext,
    pub secrets: WebhookSecrets,
    pub collisions: CollisionDetector,
}

impl WebhookState {
    pub fn new(dispatcher: Arc<Dispatcher>, context: HandlerContext, secrets: WebhookSecrets) -> Self {
        WebhookState {
            dispatcher,
            context,
            secrets,
            collisions: CollisionDetector::new(),
        }
    }
}

/// Собирает роутер. Маршрут поднимается, только если он включен в
/// конфиге и для него есть ключ.
pub fn webhook_router(state: Arc<WebhookState>, config: &WebhookConfig) -> Router {
    let mut router = Router::new();
    if let (Some(transactions), Some(_)) = (&config.transactions, &state.secrets.transaction_key) {
        router = router.route(&transactions.path, post(views::transaction_webhook));
    }
    if let (Some(bills), Some(_)) = (&config.bills, &state.secrets.bill_secret) {
        router = router.route(&bills.path, post(views::bill_webhook));
    }
    let router = router.with_state(state);

    match &config.ip_filter {
        Some(allow_list) => router.layer(from_fn_with_state(
            Arc::new(allow_list.clone()),
            ip_filter_middleware,
        )),
        None => router,
    }
}

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::WebhookState;
use super::collision::Fingerprint;
use super::error::WebhookError;
use super::signature::{verify_bill, verify_transaction};
use crate::dispatcher::Event;
use crate::models::{BillWebhook, TransactionWebhook};

/// Заголовок с подписью уведомления о счете.
pub const BILL_SIGNATURE_HEADER: &str = "X-Api-Signature-SHA256";

// Разбирает тело и считает отпечаток по каноническому JSON
fn parse_update<T: DeserializeOwned>(body: &[u8]) -> Result<(T, Fingerprint), WebhookError> {
    let raw: serde_json::Value = serde_json::from_slice(body).map_err(|err| {
        debug!(error = %err, "Webhook body is not JSON");
        WebhookError::Validation
    })?;
    let fingerprint = Fingerprint::of(&raw);
    let update = serde_json::from_value(raw).map_err(|err| {
        debug!(error = %err, "Webhook body does not match schema");
        WebhookError::Validation
    })?;
    Ok((update, fingerprint))
}

fn transaction_ok() -> Response {
    "ok".into_response()
}

fn bill_ok() -> Response {
    Json(serde_json::json!({"error": "0"})).into_response()
}

/// POST с уведомлением кошелька об операции.
#[tracing::instrument(skip_all)]
pub async fn transaction_webhook(
    State(state): State<Arc<WebhookState>>,
    body: Bytes,
) -> Result<Response, WebhookError> {
    let (update, fingerprint) = parse_update::<TransactionWebhook>(&body)?;
    if state.collisions.has_collision(&fingerprint) {
        debug!(txn_id = %update.payment.txn_id, "Duplicate transaction webhook");
        return Ok(transaction_ok());
    }

    let key = state
        .secrets
        .transaction_key
        .as_deref()
        .ok_or(WebhookError::InvalidSignature("Invalid hash of transaction."))?;
    if !verify_transaction(&update, key) {
        warn!(txn_id = %update.payment.txn_id, "Invalid transaction webhook signature");
        return Err(WebhookError::InvalidSignature("Invalid hash of transaction."));
    }
    // Параллельный запрос с тем же телом мог успеть раньше
    if !state.collisions.remember(fingerprint) {
        return Ok(transaction_ok());
    }

    info!(txn_id = %update.payment.txn_id, test = update.test, "Transaction webhook received");
    state
        .dispatcher
        .process_event(Event::TransactionWebhook(update), &state.context)
        .await?;
    Ok(transaction_ok())
}

/// POST с уведомлением о смене статуса счета P2P.
#[tracing::instrument(skip_all)]
pub async fn bill_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, WebhookError> {
    let (update, fingerprint) = parse_update::<BillWebhook>(&body)?;
    if state.collisions.has_collision(&fingerprint) {
        debug!(bill_id = %update.bill.bill_id, "Duplicate bill webhook");
        return Ok(bill_ok());
    }

    let signature = headers
        .get(BILL_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let secret = state
        .secrets
        .bill_secret
        .as_deref()
        .ok_or(WebhookError::InvalidSignature("Invalid hash of bill."))?;
    if !verify_bill(&update.bill, secret, signature) {
        warn!(bill_id = %update.bill.bill_id, "Invalid bill webhook signature");
        return Err(WebhookError::InvalidSignature("Invalid hash of bill."));
    }
    if !state.collisions.remember(fingerprint) {
        return Ok(bill_ok());
    }

    info!(
        bill_id = %update.bill.bill_id,
        status = update.bill.status.value.as_str(),
        "Bill webhook received"
    );
    state
        .dispatcher
        .process_event(Event::Bill(update), &state.context)
        .await?;
    Ok(bill_ok())
}

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::errors::QiwiError;
use crate::models::{Bill, TransactionWebhook, WebhookPayment};

type HmacSha256 = Hmac<Sha256>;

/// Порядок полей, если QIWI не прислал `signFields`.
pub const DEFAULT_SIGN_FIELDS: &str = "sum.currency,sum.amount,type,account,txnId";

/// HMAC-SHA256 от `message`, в hex.
pub fn sign(key: &[u8], message: &str) -> Result<String, QiwiError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| QiwiError::Configuration(format!("Некорректный ключ HMAC: {err}")))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Сравнивает подпись из запроса с ожидаемой за постоянное время.
pub fn verify(key: &[u8], message: &str, provided_hex: &str) -> bool {
    let Ok(provided) = hex::decode(provided_hex.trim()) else {
        debug!("Signature is not valid hex");
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(message.as_bytes());
    let expected = mac.finalize().into_bytes();
    expected.len() == provided.len() && bool::from(expected.as_slice().ct_eq(&provided))
}

/// Раскодирует ключ вебхука кошелька.
pub fn decode_webhook_key(key_base64: &str) -> Result<Vec<u8>, QiwiError> {
    Ok(STANDARD.decode(key_base64.trim())?)
}

pub fn bill_signed_string(bill: &Bill) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        bill.amount.currency,
        bill.amount.value,
        bill.bill_id,
        bill.site_id,
        bill.status.value.as_str()
    )
}

pub fn verify_bill(bill: &Bill, secret_p2p: &[u8], signature: &str) -> bool {
    verify(secret_p2p, &bill_signed_string(bill), signature)
}

fn payment_field(payment: &WebhookPayment, name: &str) -> Option<String> {
    let value = match name {
        "sum.currency" => payment.sum.currency.to_string(),
        "sum.amount" => payment.sum.amount.to_string(),
        "type" => payment.transaction_type.as_str().to_string(),
        "account" => payment.account.clone(),
        "txnId" => payment.txn_id.clone(),
        "status" => serde_json::to_value(payment.status)
            .ok()?
            .as_str()?
            .to_string(),
        "personId" => payment.person_id?.to_string(),
        "date" => payment.date.to_rfc3339(),
        _ => return None,
    };
    Some(value)
}

/// Строка, которую подписывает QIWI, или `None`, если в `signFields`
/// есть неизвестное поле.
pub fn transaction_signed_string(payment: &WebhookPayment) -> Option<String> {
    let fields = payment
        .sign_fields
        .as_deref()
        .filter(|fields| !fields.trim().is_empty())
        .unwrap_or(DEFAULT_SIGN_FIELDS);
    let parts = fields
        .split(',')
        .map(|name| payment_field(payment, name.trim()))
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("|"))
}

pub fn verify_transaction(update: &TransactionWebhook, key: &[u8]) -> bool {
    match transaction_signed_string(&update.payment) {
        Some(message) => verify(key, &message, &update.hash),
        None => {
            debug!(sign_fields = ?update.payment.sign_fields, "Unknown field in signFields");
            false
        }
    }
}

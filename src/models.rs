use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

// --- Общие структуры ---

// Сумма в истории платежей и в вебхуках кошелька
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sum {
    pub amount: serde_json::Number, // Храним число как пришло, оно участвует в подписи
    pub currency: i64,              // Код валюты ISO 4217 (643 = RUB)
}

impl Sum {
    pub fn value(&self) -> f64 {
        self.amount.as_f64().unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    In,
    Out,
    QiwiCard,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::In => "IN",
            TransactionType::Out => "OUT",
            TransactionType::QiwiCard => "QIWI_CARD",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Waiting,
    Success,
    Error,
}

// Фильтр операций для запроса истории
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    #[default]
    All,
    In,
    Out,
    QiwiCard,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::All => "ALL",
            OperationType::In => "IN",
            OperationType::Out => "OUT",
            OperationType::QiwiCard => "QIWI_CARD",
        }
    }
}

// --- История платежей ---

// Провайдер платежа (в истории приходит объектом)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
}

// Одна операция из истории кошелька
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub txn_id: i64, // Монотонно растущий идентификатор
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<i64>,
    pub date: DateTime<FixedOffset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: TransactionStatus,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trm_txn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>, // Номер кошелька/карты контрагента
    pub sum: Sum,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission: Option<Sum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<Sum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency_rate: Option<f64>,
}

// Ответ payment-history
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct History {
    pub data: Vec<Transaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_txn_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_txn_date: Option<DateTime<FixedOffset>>,
}

/// Параметры запроса истории платежей.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub rows: u32,
    pub operation: OperationType,
    pub sources: Vec<String>, // "QW_RUB", "CARD", ...
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        HistoryQuery {
            rows: crate::client::MAX_HISTORY_ROWS,
            operation: OperationType::All,
            sources: Vec::new(),
            start_date: None,
            end_date: None,
        }
    }
}

// --- Вебхуки кошелька ---

// Платеж внутри вебхука. Поля приходят в немного других типах, чем в истории
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayment {
    pub txn_id: String,
    pub date: DateTime<FixedOffset>,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<serde_json::Value>, // Строка или число, в зависимости от версии API
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<i64>,
    pub account: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<serde_json::Value>,
    pub sum: Sum,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission: Option<Sum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<Sum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign_fields: Option<String>, // Порядок полей для подписи
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionWebhook {
    pub message_id: String,
    pub hook_id: String,
    pub payment: WebhookPayment,
    pub hash: String, // HMAC-SHA256 в hex
    pub version: String,
    #[serde(default)]
    pub test: bool,
}

// --- Вебхуки P2P счетов ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillStatus {
    Waiting,
    Paid,
    Rejected,
    Expired,
    Partial,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Waiting => "WAITING",
            BillStatus::Paid => "PAID",
            BillStatus::Rejected => "REJECTED",
            BillStatus::Expired => "EXPIRED",
            BillStatus::Partial => "PARTIAL",
        }
    }
}

// Сумма счета: в P2P API значение передается строкой ("10.00")
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BillAmount {
    pub value: String,
    pub currency: String, // "RUB"
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BillStatusInfo {
    pub value: BillStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_date_time: Option<DateTime<FixedOffset>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Customer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bill {
    pub site_id: String,
    pub bill_id: String,
    pub amount: BillAmount,
    pub status: BillStatusInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<Customer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_fields: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date_time: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_date_time: Option<DateTime<FixedOffset>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BillWebhook {
    pub bill: Bill,
    pub version: String,
}

// --- Управление вебхуками ---

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HookParameters {
    pub url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WebhookInfo {
    pub hook_id: String,
    pub hook_parameters: HookParameters,
    pub hook_type: String, // "WEB"
    pub txn_type: String,  // "IN", "OUT", "BOTH"
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebhookKey {
    pub key: String, // base64
}

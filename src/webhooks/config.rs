use serde::Deserialize;
use tracing::info;
use url::Url;

use super::ip_filter::IpAllowList;
use super::signature::decode_webhook_key;
use crate::client::PaymentApi;
use crate::errors::QiwiError;

pub const DEFAULT_TRANSACTION_PATH: &str = "/webhooks/qiwi/operation_history/";
pub const DEFAULT_BILL_PATH: &str = "/webhooks/qiwi/bills/";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransactionWebhookConfig {
    pub path: String,
    /// Ключ вебхука в base64. Если не задан, берется у API по `public_url`.
    pub key_base64: Option<String>,
    /// Адрес, по которому QIWI достучится до этого сервера.
    pub public_url: Option<Url>,
}

impl Default for TransactionWebhookConfig {
    fn default() -> Self {
        TransactionWebhookConfig {
            path: DEFAULT_TRANSACTION_PATH.to_string(),
            key_base64: None,
            public_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BillWebhookConfig {
    pub path: String,
    /// Секретный ключ P2P. Если не задан, берется у клиента API.
    pub secret_p2p: Option<String>,
}

impl Default for BillWebhookConfig {
    fn default() -> Self {
        BillWebhookConfig {
            path: DEFAULT_BILL_PATH.to_string(),
            secret_p2p: None,
        }
    }
}

/// Настройки HTTP сервера для вебхуков. `None` в маршруте выключает маршрут.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub host: String,
    pub port: u16,
    pub transactions: Option<TransactionWebhookConfig>,
    pub bills: Option<BillWebhookConfig>,
    pub ip_filter: Option<IpAllowList>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            transactions: Some(TransactionWebhookConfig::default()),
            bills: Some(BillWebhookConfig::default()),
            ip_filter: None,
        }
    }
}

/// Ключи, с которыми реально поднимаются маршруты.
#[derive(Clone, Default)]
pub struct WebhookSecrets {
    pub transaction_key: Option<Vec<u8>>,
    pub bill_secret: Option<Vec<u8>>,
}

impl std::fmt::Debug for WebhookSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSecrets")
            .field("transaction_key", &self.transaction_key.as_ref().map(|_| "***"))
            .field("bill_secret", &self.bill_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

impl WebhookConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Достает ключи для включенных маршрутов.
    ///
    /// Ключ вебхука кошелька, если он не задан, запрашивается у API: это
    /// сетевой запрос, который регистрирует вебхук на `public_url`.
    /// Если ключ взять неоткуда, возвращается `QiwiError::Configuration`.
    pub async fn resolve<A: PaymentApi + ?Sized>(&self, api: &A) -> Result<WebhookSecrets, QiwiError> {
        if self.transactions.is_none() && self.bills.is_none() {
            return Err(QiwiError::Configuration(
                "не включен ни один маршрут вебхуков".to_string(),
            ));
        }

        let bill_secret = match &self.bills {
            Some(bills) => {
                let secret = bills.secret_p2p.clone().or_else(|| api.p2p_secret()).ok_or_else(|| {
                    QiwiError::Configuration(
                        "для вебхуков счетов нужен секретный ключ P2P".to_string(),
                    )
                })?;
                Some(secret.into_bytes())
            }
            None => None,
        };

        let transaction_key = match &self.transactions {
            Some(TransactionWebhookConfig {
                key_base64: Some(key),
                ..
            }) => Some(decode_webhook_key(key)?),
            Some(TransactionWebhookConfig {
                key_base64: None,
                public_url: Some(url),
                ..
            }) => {
                info!(%url, "Requesting webhook key from QIWI");
                let key = api.resolve_webhook_key(url).await?;
                Some(decode_webhook_key(&key)?)
            }
            Some(_) => {
                return Err(QiwiError::Configuration(
                    "для вебхуков кошелька нужен key_base64 или public_url".to_string(),
                ));
            }
            None => None,
        };

        Ok(WebhookSecrets {
            transaction_key,
            bill_secret,
        })
    }
}

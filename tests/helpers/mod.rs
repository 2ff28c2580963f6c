//! Общие заготовки для интеграционных тестов.

#![allow(dead_code)]

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use url::Url;

use qiwi_rs::dispatcher::SharedEvent;
use qiwi_rs::models::{HistoryQuery, Transaction};
use qiwi_rs::webhooks::signature;
use qiwi_rs::{Handler, HandlerContext, HandlerError, PaymentApi, QiwiError, handler_fn};

pub const P2P_SECRET: &str = "eyJ2ZXJzaW9uIjoiUDJQIiwiZGF0YSI6";
pub const HOOK_KEY: &[u8] = b"hook-secret-key";

/// Клиент API с заранее заданными страницами истории.
///
/// Страницы отдаются по очереди, после последней повторяется последняя
/// успешная.
#[derive(Default)]
pub struct StubApi {
    pub pages: Mutex<VecDeque<Result<Vec<Transaction>, String>>>,
    pub last_page: Mutex<Vec<Transaction>>,
    pub queries: Mutex<Vec<HistoryQuery>>,
    pub calls: Mutex<Vec<Instant>>,
    pub closed: AtomicBool,
    pub close_calls: AtomicUsize,
    pub webhook_key: Option<String>,
    pub secret_p2p: Option<String>,
}

impl StubApi {
    pub fn with_pages(pages: Vec<Result<Vec<Transaction>, String>>) -> Self {
        StubApi {
            pages: Mutex::new(pages.into()),
            ..StubApi::default()
        }
    }

    pub fn history_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentApi for StubApi {
    async fn history(&self, query: &HistoryQuery) -> Result<Vec<Transaction>, QiwiError> {
        self.calls.lock().unwrap().push(Instant::now());
        self.queries.lock().unwrap().push(query.clone());
        let next = self.pages.lock().unwrap().pop_front();
        match next {
            Some(Ok(page)) => {
                *self.last_page.lock().unwrap() = page.clone();
                Ok(page)
            }
            Some(Err(message)) => Err(QiwiError::ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message,
                error_details: None,
            }),
            None => Ok(self.last_page.lock().unwrap().clone()),
        }
    }

    async fn resolve_webhook_key(&self, public_url: &Url) -> Result<String, QiwiError> {
        self.webhook_key
            .clone()
            .ok_or_else(|| QiwiError::Configuration(format!("no key for {public_url}")))
    }

    fn p2p_secret(&self) -> Option<String> {
        self.secret_p2p.clone()
    }

    async fn close(&self) -> Result<(), QiwiError> {
        self.closed.store(true, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Операция из истории. Чем больше `id`, тем она новее.
pub fn transaction(id: i64) -> Transaction {
    serde_json::from_value(json!({
        "txnId": id,
        "personId": 79991112233_i64,
        "date": format!("2024-01-01T12:{:02}:00+03:00", id % 60),
        "errorCode": 0,
        "status": "SUCCESS",
        "type": "IN",
        "account": "+79990000000",
        "sum": {"amount": 100, "currency": 643},
        "comment": format!("order-{id}")
    }))
    .unwrap()
}

/// Страница истории в порядке QIWI: самые новые первыми.
pub fn page(ids: &[i64]) -> Vec<Transaction> {
    let mut ids = ids.to_vec();
    ids.sort_unstable_by(|a, b| b.cmp(a));
    ids.into_iter().map(transaction).collect()
}

/// Все события, которые дошли до обработчика.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<SharedEvent>>>,
}

impl Recorder {
    pub fn handler(&self) -> impl Handler + 'static {
        let events = self.events.clone();
        handler_fn(move |event: SharedEvent, _ctx: HandlerContext| {
            let events = events.clone();
            async move {
                events.lock().unwrap().push(event);
                Ok::<(), HandlerError>(())
            }
        })
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn transaction_ids(&self) -> Vec<i64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| event.transaction_id())
            .collect()
    }

    pub fn events(&self) -> Vec<SharedEvent> {
        self.events.lock().unwrap().clone()
    }
}

pub fn bill_payload(bill_id: &str) -> Value {
    json!({
        "bill": {
            "siteId": "9hh4jb-00",
            "billId": bill_id,
            "amount": {"value": "1.00", "currency": "RUB"},
            "status": {"value": "PAID", "changedDateTime": "2018-03-05T11:27:41+03:00"},
            "customer": {"phone": "78710009999", "email": "test@example.com", "account": "454678"},
            "customFields": {},
            "comment": "Text comment",
            "creationDateTime": "2018-03-05T11:27:41+03:00",
            "expirationDateTime": "2018-04-13T14:30:00+03:00"
        },
        "version": "1"
    })
}

/// Подпись счета так, как ее считает QIWI.
pub fn bill_signature(payload: &Value, secret: &str) -> String {
    let bill = &payload["bill"];
    let message = format!(
        "{}|{}|{}|{}|{}",
        bill["amount"]["currency"].as_str().unwrap(),
        bill["amount"]["value"].as_str().unwrap(),
        bill["billId"].as_str().unwrap(),
        bill["siteId"].as_str().unwrap(),
        bill["status"]["value"].as_str().unwrap(),
    );
    signature::sign(secret.as_bytes(), &message).unwrap()
}

/// Уведомление кошелька с правильным `hash`.
pub fn transaction_payload(txn_id: &str, key: &[u8]) -> Value {
    let mut payload = json!({
        "messageId": "7814c49d-2d29-4b14-b2dc-36b377c76156",
        "hookId": "5e2027d1-f5f3-4ad1-b409-058b8b8a8c22",
        "payment": {
            "txnId": txn_id,
            "date": "2018-06-27T13:39:00+03:00",
            "type": "IN",
            "status": "SUCCESS",
            "errorCode": "0",
            "personId": 78000008000_i64,
            "account": "+78000008000",
            "comment": "",
            "provider": 7,
            "sum": {"amount": 1, "currency": 643},
            "commission": {"amount": 0, "currency": 643},
            "total": {"amount": 1, "currency": 643},
            "signFields": "sum.currency,sum.amount,type,account,txnId"
        },
        "hash": "",
        "version": "1.0.0",
        "test": false
    });
    let message = format!("643|1|IN|+78000008000|{txn_id}");
    payload["hash"] = Value::String(signature::sign(key, &message).unwrap());
    payload
}

/// Ждет, пока условие не станет истинным, но не дольше пары секунд.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}

//! HTTP тесты приемника вебхуков.
//!
//! Роутер гоняется через `oneshot`, без поднятия сервера: состояние
//! (множество отпечатков) живет в `Arc<WebhookState>` и переживает клоны
//! роутера.

mod helpers;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::routing::post;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

use helpers::{
    HOOK_KEY, P2P_SECRET, Recorder, bill_payload, bill_signature, transaction_payload,
};
use qiwi_rs::dispatcher::filters;
use qiwi_rs::models::BillStatus;
use qiwi_rs::webhooks::config::{DEFAULT_BILL_PATH, DEFAULT_TRANSACTION_PATH};
use qiwi_rs::webhooks::views::BILL_SIGNATURE_HEADER;
use qiwi_rs::webhooks::{
    IpAllowList, WebhookConfig, WebhookSecrets, WebhookState, ip_filter_middleware, webhook_router,
};
use qiwi_rs::{Dispatcher, Event, HandlerContext, HandlerError, handler_fn};

fn secrets() -> WebhookSecrets {
    WebhookSecrets {
        transaction_key: Some(HOOK_KEY.to_vec()),
        bill_secret: Some(P2P_SECRET.as_bytes().to_vec()),
    }
}

fn app_with(dispatcher: Dispatcher, secrets: WebhookSecrets, config: &WebhookConfig) -> Router {
    let state = WebhookState::new(Arc::new(dispatcher), HandlerContext::new(), secrets);
    webhook_router(Arc::new(state), config)
}

/// Роутер с одним записывающим обработчиком на счета и на операции.
fn recording_app() -> (Router, Recorder, Recorder) {
    let bills = Recorder::default();
    let transactions = Recorder::default();
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .bill_handler(vec![], bills.handler())
        .transaction_handler(vec![], transactions.handler());
    let app = app_with(dispatcher, secrets(), &WebhookConfig::default());
    (app, bills, transactions)
}

fn post_json(path: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("Content-Type", "application/json")
}

fn bill_request(body: &[u8], signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(DEFAULT_BILL_PATH)
        .header("Content-Type", "application/json")
        .header(BILL_SIGNATURE_HEADER, signature)
        .body(Body::from(body.to_vec()))
        .unwrap()
}

fn transaction_request(body: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(DEFAULT_TRANSACTION_PATH)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_vec()))
        .unwrap()
}

async fn read_body(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn read_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&read_body(response).await).unwrap()
}

// --- Счета ---

/// Подписанный счет доходит до обработчика, ответ `{"error":"0"}`.
#[tokio::test]
async fn test_signed_bill_is_dispatched() {
    let (app, bills, transactions) = recording_app();
    let payload = bill_payload("cc961e8d-d4d6-4f02-b737-2297e51fb48e");
    let body = serde_json::to_vec(&payload).unwrap();
    let signature = bill_signature(&payload, P2P_SECRET);

    let response = app.oneshot(bill_request(&body, &signature)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await, json!({"error": "0"}));
    assert_eq!(bills.count(), 1);
    assert_eq!(transactions.count(), 0);
    let events = bills.events();
    assert_eq!(
        events[0].bill_id(),
        Some("cc961e8d-d4d6-4f02-b737-2297e51fb48e")
    );
    assert!(matches!(&*events[0], Event::Bill(hook) if hook.bill.status.value == BillStatus::Paid));
}

/// Повторная доставка тех же байтов подтверждается, но обработчик не вызывается.
#[tokio::test]
async fn test_duplicate_bill_is_acknowledged_once() {
    let (app, bills, _) = recording_app();
    let payload = bill_payload("dup-1");
    let body = serde_json::to_vec(&payload).unwrap();
    let signature = bill_signature(&payload, P2P_SECRET);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(bill_request(&body, &signature))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await, json!({"error": "0"}));
    }

    assert_eq!(bills.count(), 1);
}

/// Тот же счет, отформатированный по-другому, считается дубликатом.
#[tokio::test]
async fn test_duplicate_detection_ignores_formatting() {
    let (app, bills, _) = recording_app();
    let payload = bill_payload("dup-2");
    let signature = bill_signature(&payload, P2P_SECRET);
    let compact = serde_json::to_vec(&payload).unwrap();
    let pretty = serde_json::to_vec_pretty(&payload).unwrap();

    for body in [compact, pretty] {
        let response = app
            .clone()
            .oneshot(bill_request(&body, &signature))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(bills.count(), 1);
}

#[tokio::test]
async fn test_bill_with_wrong_signature_is_rejected() {
    let (app, bills, _) = recording_app();
    let payload = bill_payload("bad-sig");
    let body = serde_json::to_vec(&payload).unwrap();
    let signature = bill_signature(&payload, "another-secret");

    let response = app.oneshot(bill_request(&body, &signature)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        read_json(response).await,
        json!({"status": "Invalid hash of bill."})
    );
    assert_eq!(bills.count(), 0);
}

/// Отклоненный по подписи запрос не запоминается: следующая доставка с
/// правильной подписью обрабатывается.
#[tokio::test]
async fn test_rejected_bill_is_not_remembered() {
    let (app, bills, _) = recording_app();
    let payload = bill_payload("retry");
    let body = serde_json::to_vec(&payload).unwrap();

    let response = app
        .clone()
        .oneshot(bill_request(&body, "00"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let signature = bill_signature(&payload, P2P_SECRET);
    let response = app.oneshot(bill_request(&body, &signature)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(bills.count(), 1);
}

#[tokio::test]
async fn test_bill_without_signature_header_is_rejected() {
    let (app, bills, _) = recording_app();
    let body = serde_json::to_vec(&bill_payload("no-header")).unwrap();
    let request = post_json(DEFAULT_BILL_PATH)
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(bills.count(), 0);
}

/// Фильтры обработчика применяются и к вебхукам.
#[tokio::test]
async fn test_bill_filters_apply() {
    let paid = Recorder::default();
    let other = Recorder::default();
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .bill_handler(vec![filters::bill_status(BillStatus::Rejected)], other.handler())
        .bill_handler(vec![filters::bill_status(BillStatus::Paid)], paid.handler());
    let app = app_with(dispatcher, secrets(), &WebhookConfig::default());

    let payload = bill_payload("filtered");
    let body = serde_json::to_vec(&payload).unwrap();
    let response = app
        .oneshot(bill_request(&body, &bill_signature(&payload, P2P_SECRET)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(paid.count(), 1);
    assert_eq!(other.count(), 0);
}

// --- Операции кошелька ---

#[tokio::test]
async fn test_signed_transaction_is_dispatched_once() {
    let (app, _, transactions) = recording_app();
    let body = serde_json::to_vec(&transaction_payload("13353941550", HOOK_KEY)).unwrap();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(transaction_request(&body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_body(response).await, b"ok");
    }

    assert_eq!(transactions.transaction_ids(), vec![13353941550]);
}

/// Подделанный `hash` дает 400 и не доходит до обработчиков.
#[tokio::test]
async fn test_tampered_transaction_hash_is_rejected() {
    let (app, _, transactions) = recording_app();
    let mut payload = transaction_payload("13353941550", HOOK_KEY);
    let hash = payload["hash"].as_str().unwrap().to_string();
    let tampered = if hash.starts_with('0') {
        format!("1{}", &hash[1..])
    } else {
        format!("0{}", &hash[1..])
    };
    payload["hash"] = Value::String(tampered);
    let body = serde_json::to_vec(&payload).unwrap();

    let response = app.oneshot(transaction_request(&body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        read_json(response).await,
        json!({"status": "Invalid hash of transaction."})
    );
    assert_eq!(transactions.count(), 0);
}

/// Изменение подписанного поля при старом `hash` тоже отклоняется.
#[tokio::test]
async fn test_tampered_signed_field_is_rejected() {
    let (app, _, transactions) = recording_app();
    let mut payload = transaction_payload("13353941550", HOOK_KEY);
    payload["payment"]["sum"]["amount"] = json!(1000);
    let body = serde_json::to_vec(&payload).unwrap();

    let response = app.oneshot(transaction_request(&body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(transactions.count(), 0);
}

// --- Ошибки запроса ---

#[tokio::test]
async fn test_malformed_body_is_validation_error() {
    let (app, bills, transactions) = recording_app();

    let cases = [
        (DEFAULT_TRANSACTION_PATH, b"not json".to_vec()),
        (DEFAULT_TRANSACTION_PATH, br#"{"messageId": "x"}"#.to_vec()),
        (DEFAULT_BILL_PATH, br#"{"bill": {"billId": 1}}"#.to_vec()),
    ];
    for (path, body) in cases {
        let request = post_json(path)
            .header(BILL_SIGNATURE_HEADER, "00")
            .body(Body::from(body))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await, json!({"status": "Validation error"}));
    }

    assert_eq!(bills.count(), 0);
    assert_eq!(transactions.count(), 0);
}

#[tokio::test]
async fn test_only_post_is_routed() {
    let (app, _, _) = recording_app();
    let request = Request::builder()
        .method("GET")
        .uri(DEFAULT_BILL_PATH)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

/// Маршрут без ключа не поднимается.
#[tokio::test]
async fn test_route_without_secret_is_not_mounted() {
    let secrets = WebhookSecrets {
        transaction_key: Some(HOOK_KEY.to_vec()),
        bill_secret: None,
    };
    let app = app_with(Dispatcher::new(), secrets, &WebhookConfig::default());
    let payload = bill_payload("unmounted");
    let body = serde_json::to_vec(&payload).unwrap();

    let response = app
        .oneshot(bill_request(&body, &bill_signature(&payload, P2P_SECRET)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Необработанная ошибка обработчика превращается в 500.
#[tokio::test]
async fn test_unhandled_handler_error_is_internal_error() {
    let mut dispatcher = Dispatcher::new();
    dispatcher.bill_handler(
        vec![],
        handler_fn(|_event, _ctx| async { Err::<(), _>(HandlerError::failed("database is down")) }),
    );
    let app = app_with(dispatcher, secrets(), &WebhookConfig::default());
    let payload = bill_payload("boom");
    let body = serde_json::to_vec(&payload).unwrap();

    let response = app
        .oneshot(bill_request(&body, &bill_signature(&payload, P2P_SECRET)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(read_json(response).await, json!({"status": "Internal error"}));
}

/// Ошибку обработчика перехватил обработчик ошибок: ответ успешный.
#[tokio::test]
async fn test_error_handler_turns_failure_into_success() {
    let errors = Recorder::default();
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .bill_handler(
            vec![],
            handler_fn(|_event, _ctx| async { Err::<(), _>(HandlerError::failed("database is down")) }),
        )
        .error_handler(vec![], errors.handler());
    let app = app_with(dispatcher, secrets(), &WebhookConfig::default());
    let payload = bill_payload("recovered");
    let body = serde_json::to_vec(&payload).unwrap();

    let response = app
        .oneshot(bill_request(&body, &bill_signature(&payload, P2P_SECRET)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(errors.count(), 1);
}

// --- Фильтр по IP ---

fn ip_filtered_stub() -> Router {
    let allow_list = IpAllowList::parse(["79.142.16.0/20"]).unwrap();
    Router::new()
        .route("/", post(|| async { "stub" }))
        .layer(from_fn_with_state(Arc::new(allow_list), ip_filter_middleware))
}

fn forwarded_request(ip: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/")
        .header("X-Forwarded-For", ip)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_ip_filter_accepts_forwarded_address_inside_cidr() {
    let response = ip_filtered_stub()
        .oneshot(forwarded_request("79.142.16.2"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await, b"stub");
}

#[tokio::test]
async fn test_ip_filter_rejects_address_outside_cidr() {
    let response = ip_filtered_stub()
        .oneshot(forwarded_request("10.0.0.5"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

fn peer_request(peer: &str) -> Request<Body> {
    let peer: SocketAddr = peer.parse().unwrap();
    Request::builder()
        .method("POST")
        .uri("/")
        .extension(ConnectInfo(peer))
        .body(Body::empty())
        .unwrap()
}

/// Без `X-Forwarded-For` проверяется адрес TCP соединения.
#[tokio::test]
async fn test_ip_filter_accepts_peer_address_inside_cidr() {
    let response = ip_filtered_stub()
        .oneshot(peer_request("79.142.16.9:43210"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await, b"stub");
}

#[tokio::test]
async fn test_ip_filter_rejects_peer_address_outside_cidr() {
    let response = ip_filtered_stub()
        .oneshot(peer_request("10.0.0.5:43210"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Берется только первый адрес цепочки прокси.
#[tokio::test]
async fn test_ip_filter_uses_first_forwarded_hop() {
    let response = ip_filtered_stub()
        .oneshot(forwarded_request("10.0.0.5, 79.142.16.2"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Фильтр срабатывает до разбора тела.
#[tokio::test]
async fn test_ip_filter_runs_before_validation() {
    let config = WebhookConfig {
        ip_filter: Some(IpAllowList::qiwi()),
        ..WebhookConfig::default()
    };
    let app = app_with(Dispatcher::new(), secrets(), &config);
    let request = post_json(DEFAULT_TRANSACTION_PATH)
        .header("X-Forwarded-For", "10.0.0.5")
        .body(Body::from("not json"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

//! Бот, который пишет в лог каждый входящий платеж.
//!
//! QIWI_TOKEN=... QIWI_PHONE=+7... cargo run --example echo
//! С QIWI_SECRET_P2P поднимается сервер для вебхуков счетов вместо поллинга.

use std::sync::Arc;

use qiwi_rs::dispatcher::filters;
use qiwi_rs::models::TransactionType;
use qiwi_rs::webhooks::config::BillWebhookConfig;
use qiwi_rs::{
    BoxError, Dispatcher, Executor, HandlerContext, HandlerError, PollingConfig, QiwiError,
    QiwiWallet, WebhookConfig, handler_fn,
};
use tracing::{error, info};

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qiwi_rs=debug,echo=info".into()),
        )
        .init();

    let token = std::env::var("QIWI_TOKEN")?;
    let phone = std::env::var("QIWI_PHONE")?;
    let secret_p2p = std::env::var("QIWI_SECRET_P2P").ok();

    let mut wallet = QiwiWallet::new(token).with_phone_number(phone);
    if let Some(secret) = &secret_p2p {
        wallet = wallet.with_secret_p2p(secret.clone());
    }

    let mut dispatcher = Dispatcher::new();
    dispatcher
        .transaction_handler(
            vec![filters::transaction_type(TransactionType::In) & !filters::amount_at_least(1_000_000.0)],
            handler_fn(|event, _ctx| async move {
                info!(
                    txn_id = ?event.transaction_id(),
                    amount = ?event.amount(),
                    comment = ?event.comment(),
                    "Incoming payment"
                );
                Ok::<(), HandlerError>(())
            }),
        )
        .bill_handler(
            vec![],
            handler_fn(|event, _ctx| async move {
                info!(bill_id = ?event.bill_id(), amount = ?event.amount(), "Bill updated");
                Ok::<(), HandlerError>(())
            }),
        )
        .error_handler(
            vec![],
            handler_fn(|event, _ctx| async move {
                if let qiwi_rs::Event::Error(failure) = &*event {
                    error!(error = %failure.error, kind = %failure.origin.kind(), "Handler failed");
                }
                Ok::<(), HandlerError>(())
            }),
        );

    let executor = Executor::new(Arc::new(wallet), dispatcher)
        .on_startup(|_ctx: HandlerContext| async {
            info!("Echo bot started");
            Ok::<(), BoxError>(())
        })
        .on_shutdown_blocking(|_ctx| {
            info!("Echo bot stopped");
            Ok(())
        });

    let result: Result<(), QiwiError> = match secret_p2p {
        Some(_) => executor.start_webhook(WebhookConfig {
            transactions: None,
            bills: Some(BillWebhookConfig::default()),
            ..WebhookConfig::default()
        }),
        None => executor.start_polling(PollingConfig {
            skip_updates: true,
            ..PollingConfig::default()
        }),
    };
    result?;
    Ok(())
}

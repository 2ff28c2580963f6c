//! Клиент QIWI Кошелька и P2P с диспетчеризацией входящих платежей.
//!
//! Платежи приходят либо поллингом истории (`Executor::start_polling`),
//! либо вебхуками (`Executor::start_webhook`), и в обоих случаях попадают
//! в `Dispatcher`, где их разбирают зарегистрированные обработчики.

pub mod client;
pub mod dispatcher;
pub mod errors;
pub mod executor;
pub mod models;
pub mod polling;
pub mod shutdown;
pub mod webhooks;

pub use client::{MAX_HISTORY_ROWS, PaymentApi, QiwiWallet};
pub use dispatcher::{
    API_CLIENT_KEY, Dispatcher, Event, EventKind, Filter, Handler, HandlerContext, HandlerError,
    HandlerResult, SharedEvent, handler_fn,
};
pub use errors::{BoxError, QiwiApiError, QiwiError};
pub use executor::{Executor, Plugin, PollingHandle};
pub use polling::{Poller, PollingConfig};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use webhooks::{WebhookConfig, webhook_router};

// --- Пример использования ---
// Полный пример лежит в demos/echo.rs (cargo run --example echo)

// fn main() -> Result<(), qiwi_rs::QiwiError> {
//     let wallet = QiwiWallet::new(token).with_phone_number("+79991112233");
//
//     let mut dispatcher = Dispatcher::new();
//     dispatcher.transaction_handler(
//         vec![filters::amount_at_least(100.0)],
//         handler_fn(|event, _ctx| async move {
//             println!("Новый платеж: {:?}", event.transaction_id());
//             Ok(())
//         }),
//     );
//
//     Executor::new(Arc::new(wallet), dispatcher).start_polling(PollingConfig::default())
// }

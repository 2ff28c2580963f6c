//! Реестр обработчиков событий.
//!
//! Для каждого вида событий (операция, счет, ошибка) хранится упорядоченная
//! цепочка пар «фильтры + обработчик». Регистрация идет через `&mut self`
//! до запуска, после этого диспетчер живет в `Arc` и только читается.

pub mod context;
pub mod filters;
pub mod handler;

use chrono::{DateTime, FixedOffset};
use futures::future::join_all;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub use context::{API_CLIENT_KEY, HandlerContext};
pub use filters::Filter;
pub use handler::{Handler, HandlerError, HandlerResult, handler_fn};

use crate::errors::BoxError;
use crate::models::{BillWebhook, Sum, Transaction, TransactionWebhook};

pub type SharedEvent = Arc<Event>;

/// Ошибка обработчика, которую никто не обработал.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Transaction,
    Bill,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Transaction => "transaction",
            EventKind::Bill => "bill",
            EventKind::Error => "error",
        })
    }
}

/// Упавший обработчик вместе с событием, на котором он упал.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: SharedError,
    pub origin: SharedEvent,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Операция, найденная поллингом истории.
    Transaction(Transaction),
    /// Операция, пришедшая вебхуком.
    TransactionWebhook(TransactionWebhook),
    Bill(BillWebhook),
    Error(ErrorEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Transaction(_) | Event::TransactionWebhook(_) => EventKind::Transaction,
            Event::Bill(_) => EventKind::Bill,
            Event::Error(_) => EventKind::Error,
        }
    }

    pub fn transaction_id(&self) -> Option<i64> {
        match self {
            Event::Transaction(txn) => Some(txn.txn_id),
            Event::TransactionWebhook(hook) => hook.payment.txn_id.parse().ok(),
            _ => None,
        }
    }

    pub fn bill_id(&self) -> Option<&str> {
        match self {
            Event::Bill(hook) => Some(&hook.bill.bill_id),
            _ => None,
        }
    }

    pub fn sum(&self) -> Option<&Sum> {
        match self {
            Event::Transaction(txn) => Some(&txn.sum),
            Event::TransactionWebhook(hook) => Some(&hook.payment.sum),
            _ => None,
        }
    }

    /// Сумма как число, для счетов тоже.
    pub fn amount(&self) -> Option<f64> {
        match self {
            Event::Bill(hook) => hook.bill.amount.value.parse().ok(),
            other => other.sum().map(Sum::value),
        }
    }

    /// Номер кошелька/карты контрагента.
    pub fn account(&self) -> Option<&str> {
        match self {
            Event::Transaction(txn) => txn.account.as_deref(),
            Event::TransactionWebhook(hook) => Some(&hook.payment.account),
            _ => None,
        }
    }

    pub fn comment(&self) -> Option<&str> {
        match self {
            Event::Transaction(txn) => txn.comment.as_deref(),
            Event::TransactionWebhook(hook) => hook.payment.comment.as_deref(),
            Event::Bill(hook) => hook.bill.comment.as_deref(),
            Event::Error(_) => None,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            Event::Transaction(txn) => Some(txn.date),
            Event::TransactionWebhook(hook) => Some(hook.payment.date),
            Event::Bill(hook) => hook
                .bill
                .status
                .changed_date_time
                .or(hook.bill.creation_date_time),
            Event::Error(err) => err.origin.timestamp(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("необработанная ошибка в обработчике события {kind}: {error}")]
    Unhandled { kind: EventKind, error: SharedError },

    #[error("обработчик ошибок упал на событии {kind}: {error}")]
    ErrorHandlerFailed { kind: EventKind, error: SharedError },
}

struct Registration {
    filters: Vec<Filter>,
    handler: Box<dyn Handler>,
}

/// Упорядоченная цепочка обработчиков одного вида событий.
pub struct HandlerChain {
    registrations: Vec<Registration>,
    stop_on_first_match: bool,
}

impl Default for HandlerChain {
    fn default() -> Self {
        HandlerChain {
            registrations: Vec::new(),
            stop_on_first_match: true,
        }
    }
}

impl HandlerChain {
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    // Ok(true), если хотя бы один обработчик отработал
    async fn notify(&self, event: &SharedEvent, ctx: &HandlerContext) -> Result<bool, BoxError> {
        let mut handled = false;
        for (position, registration) in self.registrations.iter().enumerate() {
            if !filters::check_all(&registration.filters, event).await {
                continue;
            }
            match registration
                .handler
                .process(Arc::clone(event), ctx.clone())
                .await
            {
                Ok(()) => {
                    handled = true;
                    if self.stop_on_first_match {
                        break;
                    }
                }
                Err(HandlerError::Skip) => {
                    debug!(position, kind = %event.kind(), "Handler skipped event");
                }
                Err(HandlerError::Cancel) => {
                    debug!(position, kind = %event.kind(), "Handler cancelled the chain");
                    break;
                }
                Err(HandlerError::Failed(err)) => return Err(err),
            }
        }
        Ok(handled)
    }
}

#[derive(Default)]
pub struct Dispatcher {
    transaction_handlers: HandlerChain,
    bill_handlers: HandlerChain,
    error_handlers: HandlerChain,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self, kind: EventKind) -> &HandlerChain {
        match kind {
            EventKind::Transaction => &self.transaction_handlers,
            EventKind::Bill => &self.bill_handlers,
            EventKind::Error => &self.error_handlers,
        }
    }

    fn chain_mut(&mut self, kind: EventKind) -> &mut HandlerChain {
        match kind {
            EventKind::Transaction => &mut self.transaction_handlers,
            EventKind::Bill => &mut self.bill_handlers,
            EventKind::Error => &mut self.error_handlers,
        }
    }

    /// Добавляет обработчик в конец цепочки `kind`.
    pub fn register(
        &mut self,
        kind: EventKind,
        filters: Vec<Filter>,
        handler: impl Handler + 'static,
    ) -> &mut Self {
        self.chain_mut(kind).registrations.push(Registration {
            filters,
            handler: Box::new(handler),
        });
        self
    }

    pub fn transaction_handler(
        &mut self,
        filters: Vec<Filter>,
        handler: impl Handler + 'static,
    ) -> &mut Self {
        self.register(EventKind::Transaction, filters, handler)
    }

    pub fn bill_handler(&mut self, filters: Vec<Filter>, handler: impl Handler + 'static) -> &mut Self {
        self.register(EventKind::Bill, filters, handler)
    }

    pub fn error_handler(&mut self, filters: Vec<Filter>, handler: impl Handler + 'static) -> &mut Self {
        self.register(EventKind::Error, filters, handler)
    }

    /// По умолчанию цепочка останавливается на первом сработавшем
    /// обработчике. При `false` вызываются все подходящие.
    pub fn set_stop_on_first_match(&mut self, kind: EventKind, stop: bool) -> &mut Self {
        self.chain_mut(kind).stop_on_first_match = stop;
        self
    }

    pub fn handlers_count(&self, kind: EventKind) -> usize {
        self.chain(kind).len()
    }

    /// Прогоняет событие через цепочку его вида.
    ///
    /// Если обработчик упал, ошибка уходит в цепочку обработчиков ошибок.
    /// Если ее некому обработать, возвращается [`DispatchError`].
    pub async fn process_event(
        &self,
        event: impl Into<SharedEvent>,
        ctx: &HandlerContext,
    ) -> Result<(), DispatchError> {
        let event: SharedEvent = event.into();
        let kind = event.kind();
        let error: SharedError = match self.chain(kind).notify(&event, ctx).await {
            Ok(_) => return Ok(()),
            Err(err) => Arc::from(err),
        };

        if kind == EventKind::Error || self.error_handlers.is_empty() {
            return Err(DispatchError::Unhandled { kind, error });
        }

        warn!(%kind, error = %error, "Handler failed, routing to error handlers");
        let error_event: SharedEvent = Arc::new(Event::Error(ErrorEvent {
            error: Arc::clone(&error),
            origin: event,
        }));
        match self.error_handlers.notify(&error_event, ctx).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DispatchError::Unhandled { kind, error }),
            Err(err) => Err(DispatchError::ErrorHandlerFailed {
                kind,
                error: Arc::from(err),
            }),
        }
    }

    /// Обрабатывает пачку событий конкурентно и дожидается всех.
    /// Возвращает первую по порядку ошибку.
    pub async fn feed_events<I>(&self, events: I, ctx: &HandlerContext) -> Result<(), DispatchError>
    where
        I: IntoIterator<Item = Event>,
    {
        let results = join_all(events.into_iter().map(|event| self.process_event(event, ctx))).await;
        results.into_iter().collect()
    }
}

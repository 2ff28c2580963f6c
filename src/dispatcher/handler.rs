use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;

use super::{HandlerContext, SharedEvent};
use crate::errors::{BoxError, QiwiError};

/// Результат обработчика, кроме успешного.
///
/// `Skip` и `Cancel` это сигналы управления цепочкой, а не ошибки: диспетчер
/// перехватывает их сам.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Перейти к следующему обработчику цепочки.
    #[error("обработчик пропустил событие")]
    Skip,

    /// Остановить цепочку этого вида событий.
    #[error("обработка события отменена")]
    Cancel,

    #[error(transparent)]
    Failed(BoxError),
}

impl HandlerError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        HandlerError::Failed(err.into())
    }
}

impl From<QiwiError> for HandlerError {
    fn from(err: QiwiError) -> Self {
        HandlerError::Failed(Box::new(err))
    }
}

impl From<BoxError> for HandlerError {
    fn from(err: BoxError) -> Self {
        HandlerError::Failed(err)
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Обработчик события.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn process(&self, event: SharedEvent, ctx: HandlerContext) -> HandlerResult;
}

/// Обработчик из замыкания, см. [`handler_fn`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(SharedEvent, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn process(&self, event: SharedEvent, ctx: HandlerContext) -> HandlerResult {
        (self.f)(event, ctx).await
    }
}

/// Оборачивает асинхронное замыкание в [`Handler`].
///
/// ```rust,ignore
/// dispatcher.transaction_handler(vec![], handler_fn(|event, _ctx| async move {
///     tracing::info!(id = ?event.transaction_id(), "got payment");
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(SharedEvent, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

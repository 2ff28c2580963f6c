//! Фильтры событий.
//!
//! Фильтр представляет собой дерево `Leaf`/`And`/`Or`/`Not`, которое вычисляется
//! небольшим интерпретатором в [`Filter::check`]. Листья: произвольные
//! предикаты, синхронные или асинхронные.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::marker::PhantomData;
use std::ops::{BitAnd, BitOr, Not};
use std::sync::Arc;

use super::{Event, SharedEvent};
use crate::models::{BillStatus, TransactionType};

/// Предикат над событием.
#[async_trait]
pub trait Predicate: Send + Sync {
    async fn check(&self, event: &SharedEvent) -> bool;
}

#[derive(Clone)]
pub enum Filter {
    Leaf(Arc<dyn Predicate>),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Фильтр из синхронной функции.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Filter::Leaf(Arc::new(SyncPredicate(f)))
    }

    /// Фильтр из асинхронной функции.
    pub fn new_async<F, Fut>(f: F) -> Self
    where
        F: Fn(SharedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Filter::Leaf(Arc::new(AsyncPredicate {
            f,
            _fut: PhantomData,
        }))
    }

    pub fn from_predicate(predicate: impl Predicate + 'static) -> Self {
        Filter::Leaf(Arc::new(predicate))
    }

    pub fn and(self, other: Filter) -> Self {
        and(self, other)
    }

    pub fn or(self, other: Filter) -> Self {
        or(self, other)
    }

    pub fn negate(self) -> Self {
        not(self)
    }

    /// Вычисляет фильтр. `And` и `Or` ленивые: правая ветка не
    /// вычисляется, если результат уже известен.
    pub fn check<'a>(&'a self, event: &'a SharedEvent) -> BoxFuture<'a, bool> {
        async move {
            match self {
                Filter::Leaf(predicate) => predicate.check(event).await,
                Filter::And(left, right) => left.check(event).await && right.check(event).await,
                Filter::Or(left, right) => left.check(event).await || right.check(event).await,
                Filter::Not(inner) => !inner.check(event).await,
            }
        }
        .boxed()
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::Leaf(_) => write!(f, "Leaf"),
            Filter::And(l, r) => write!(f, "And({l:?}, {r:?})"),
            Filter::Or(l, r) => write!(f, "Or({l:?}, {r:?})"),
            Filter::Not(inner) => write!(f, "Not({inner:?})"),
        }
    }
}

pub fn and(left: Filter, right: Filter) -> Filter {
    Filter::And(Box::new(left), Box::new(right))
}

pub fn or(left: Filter, right: Filter) -> Filter {
    Filter::Or(Box::new(left), Box::new(right))
}

pub fn not(inner: Filter) -> Filter {
    Filter::Not(Box::new(inner))
}

impl BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Filter) -> Filter {
        and(self, rhs)
    }
}

impl BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Filter) -> Filter {
        or(self, rhs)
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        not(self)
    }
}

/// Проверяет все фильтры по порядку, останавливаясь на первом ложном.
pub(crate) async fn check_all(filters: &[Filter], event: &SharedEvent) -> bool {
    for filter in filters {
        if !filter.check(event).await {
            return false;
        }
    }
    true
}

struct SyncPredicate<F>(F);

#[async_trait]
impl<F> Predicate for SyncPredicate<F>
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    async fn check(&self, event: &SharedEvent) -> bool {
        (self.0)(&**event)
    }
}

struct AsyncPredicate<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> Predicate for AsyncPredicate<F, Fut>
where
    F: Fn(SharedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn check(&self, event: &SharedEvent) -> bool {
        (self.f)(Arc::clone(event)).await
    }
}

// --- Готовые фильтры ---

/// Операции кошелька заданного типа (и из истории, и из вебхуков).
pub fn transaction_type(expected: TransactionType) -> Filter {
    Filter::new(move |event| match event {
        Event::Transaction(txn) => txn.transaction_type == expected,
        Event::TransactionWebhook(hook) => hook.payment.transaction_type == expected,
        _ => false,
    })
}

/// Сумма операции или счета не меньше `minimum`.
pub fn amount_at_least(minimum: f64) -> Filter {
    Filter::new(move |event| event.amount().is_some_and(|amount| amount >= minimum))
}

/// Валюта операции по числовому коду ISO 4217.
pub fn currency(code: i64) -> Filter {
    Filter::new(move |event| event.sum().is_some_and(|sum| sum.currency == code))
}

pub fn bill_status(expected: BillStatus) -> Filter {
    Filter::new(move |event| match event {
        Event::Bill(hook) => hook.bill.status.value == expected,
        _ => false,
    })
}

/// Комментарий к операции или счету совпадает с `expected`.
pub fn comment_equals(expected: impl Into<String>) -> Filter {
    let expected = expected.into();
    Filter::new(move |event| event.comment() == Some(expected.as_str()))
}

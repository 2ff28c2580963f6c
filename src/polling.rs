//! Поллинг истории платежей.
//!
//! API кошелька умеет только отдавать историю, поэтому поток событий
//! собирается так: раз в `refetch_timeout` забираем последнюю страницу,
//! отбираем операции с `txn_id` больше watermark, отдаем их диспетчеру и
//! сдвигаем watermark. При ошибке следующая попытка откладывается на
//! `backoff_timeout`.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{MAX_HISTORY_ROWS, PaymentApi};
use crate::dispatcher::{Dispatcher, Event, HandlerContext};
use crate::errors::QiwiError;
use crate::models::{HistoryQuery, OperationType};
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Пауза между успешными итерациями.
    pub refetch_timeout: Duration,
    /// Пауза после ошибки.
    pub backoff_timeout: Duration,
    /// Размер страницы, не больше `MAX_HISTORY_ROWS`.
    pub rows: u32,
    pub operation: OperationType,
    /// Не отдавать обработчикам операции, которые уже были в истории при старте.
    pub skip_updates: bool,
    /// Начало окна выборки. при `None` берется просто последняя страница.
    pub get_updates_from: Option<DateTime<Utc>>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            refetch_timeout: Duration::from_secs(5),
            backoff_timeout: Duration::from_secs(40),
            rows: MAX_HISTORY_ROWS,
            operation: OperationType::All,
            skip_updates: false,
            get_updates_from: None,
        }
    }
}

/// Что произошло за одну итерацию.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub dispatched: usize,
    /// Операции, отброшенные из-за `skip_updates`.
    pub skipped: usize,
    pub page_saturated: bool,
}

pub struct Poller<A: PaymentApi + ?Sized> {
    api: Arc<A>,
    dispatcher: Arc<Dispatcher>,
    context: HandlerContext,
    config: PollingConfig,
    watermark: Option<i64>,
    // Была ли уже хоть одна успешная выборка
    initialized: bool,
    get_updates_from: Option<DateTime<Utc>>,
}

impl<A: PaymentApi + ?Sized> Poller<A> {
    pub fn new(
        api: Arc<A>,
        dispatcher: Arc<Dispatcher>,
        context: HandlerContext,
        config: PollingConfig,
    ) -> Self {
        let get_updates_from = config.get_updates_from;
        Poller {
            api,
            dispatcher,
            context,
            config,
            watermark: None,
            initialized: false,
            get_updates_from,
        }
    }

    /// Наибольший уже обработанный `txn_id`.
    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn get_updates_from(&self) -> Option<DateTime<Utc>> {
        self.get_updates_from
    }

    fn rows(&self) -> u32 {
        self.config.rows.clamp(1, MAX_HISTORY_ROWS)
    }

    fn query(&self) -> HistoryQuery {
        HistoryQuery {
            rows: self.rows(),
            operation: self.config.operation,
            sources: Vec::new(),
            start_date: self.get_updates_from,
            end_date: self.get_updates_from.map(|_| Utc::now()),
        }
    }

    /// Одна итерация: забрать, сравнить, раздать, сдвинуть watermark.
    ///
    /// Watermark сдвигается только если все обработчики отработали; при
    /// ошибке операции этой итерации будут выданы повторно.
    #[tracing::instrument(skip(self), fields(watermark = ?self.watermark))]
    pub async fn tick(&mut self) -> Result<TickReport, QiwiError> {
        let history = self.api.history(&self.query()).await?;
        let mut report = TickReport {
            fetched: history.len(),
            ..TickReport::default()
        };
        let first_fetch = !self.initialized;
        self.initialized = true;
        let Some(max_id) = history.iter().map(|txn| txn.txn_id).max() else {
            if first_fetch && self.config.skip_updates {
                debug!("History is empty, nothing to skip");
            }
            return Ok(report);
        };

        // Страница забита до предела: часть операций могла не влезть,
        // поэтому окно начинается с самой старой из полученных
        if history.len() >= self.rows() as usize {
            report.page_saturated = true;
            if let Some(oldest) = history.iter().map(|txn| txn.date).min() {
                self.get_updates_from = Some(oldest.with_timezone(&Utc));
                debug!(from = %oldest, "History page saturated, moving window start");
            }
        }

        let watermark = match self.watermark {
            Some(watermark) => watermark,
            None if first_fetch && self.config.skip_updates => {
                report.skipped = history.len();
                self.watermark = Some(max_id);
                info!(skipped = report.skipped, watermark = max_id, "Skipping pending updates");
                return Ok(report);
            }
            // Первая выборка: новой считается только первая операция страницы
            // (самая свежая), остальные уже обработаны
            None if first_fetch => {
                let seed = history[0].txn_id - 1;
                self.watermark = Some(seed);
                seed
            }
            // Первая выборка была пустой: все операции новые
            None => i64::MIN,
        };

        let mut fresh: Vec<_> = history
            .into_iter()
            .filter(|txn| txn.txn_id > watermark)
            .collect();
        fresh.sort_by_key(|txn| txn.txn_id);
        report.dispatched = fresh.len();

        if !fresh.is_empty() {
            debug!(count = fresh.len(), "Dispatching new transactions");
            self.dispatcher
                .feed_events(fresh.into_iter().map(Event::Transaction), &self.context)
                .await?;
        }

        self.watermark = Some(watermark.max(max_id));
        Ok(report)
    }

    /// Крутит итерации до сигнала остановки.
    ///
    /// Сигнал проверяется только между итерациями, поэтому уже начатая
    /// раздача событий всегда доводится до конца.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!(
            refetch = ?self.config.refetch_timeout,
            backoff = ?self.config.backoff_timeout,
            "Start polling"
        );
        while !shutdown.is_triggered() {
            let pause = match self.tick().await {
                Ok(report) => {
                    if report.dispatched > 0 {
                        debug!(?report, "Polling tick finished");
                    }
                    self.config.refetch_timeout
                }
                Err(err) => {
                    error!(error = %err, "Polling tick failed, backing off");
                    self.config.backoff_timeout
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.wait() => break,
            }
        }
        info!(watermark = ?self.watermark, "Polling stopped");
    }
}

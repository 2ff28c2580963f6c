//! Точка входа: хуки запуска и остановки, плагины, выбор режима
//! (поллинг или вебхуки) и аккуратное освобождение ресурсов.

use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::PaymentApi;
use crate::dispatcher::{API_CLIENT_KEY, Dispatcher, HandlerContext};
use crate::errors::{BoxError, QiwiError};
use crate::polling::{Poller, PollingConfig};
use crate::shutdown::Shutdown;
use crate::webhooks::{WebhookConfig, WebhookState, webhook_router};

/// Хук запуска или остановки. Получает общий контекст.
pub type Hook = Box<dyn Fn(HandlerContext) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Внешний компонент, который живет рядом с поллингом или сервером
/// (например, бот со своим циклом опроса).
///
/// `install` запускается в отдельной задаче и может работать сколько угодно.
/// При остановке вызывается `shutdown`, после чего задача `install`
/// прерывается.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn install(&self, ctx: HandlerContext) -> Result<(), BoxError>;

    async fn shutdown(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

pub struct Executor<A: PaymentApi + 'static> {
    api: Arc<A>,
    dispatcher: Arc<Dispatcher>,
    context: HandlerContext,
    plugins: Vec<Arc<dyn Plugin>>,
    on_startup: Vec<Hook>,
    on_shutdown: Vec<Hook>,
    shutdown: Shutdown,
}

impl<A: PaymentApi + 'static> Executor<A> {
    /// Создает исполнитель.
    ///
    /// # Arguments
    ///
    /// * `api` - Клиент API. Кладется в контекст под ключом `API_CLIENT_KEY`
    ///   и закрывается при остановке.
    /// * `dispatcher` - Заполненный реестр обработчиков.
    pub fn new(api: Arc<A>, dispatcher: Dispatcher) -> Self {
        Executor {
            api,
            dispatcher: Arc::new(dispatcher),
            context: HandlerContext::new(),
            plugins: Vec::new(),
            on_startup: Vec::new(),
            on_shutdown: Vec::new(),
            shutdown: Shutdown::new(),
        }
    }

    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Асинхронный хук запуска. Хуки вызываются по порядку регистрации,
    /// первая ошибка прерывает запуск.
    pub fn on_startup<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_startup.push(boxed_hook(hook));
        self
    }

    /// Синхронный вариант `on_startup`.
    pub fn on_startup_blocking<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HandlerContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.on_startup.push(blocking_hook(hook));
        self
    }

    /// Хук остановки. Хуки остановки запускаются одновременно, ошибка
    /// одного не мешает остальным и закрытию сессии.
    pub fn on_shutdown<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_shutdown.push(boxed_hook(hook));
        self
    }

    pub fn on_shutdown_blocking<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HandlerContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.on_shutdown.push(blocking_hook(hook));
        self
    }

    /// Заменяет контекст, который получают обработчики и хуки.
    pub fn with_context(mut self, context: HandlerContext) -> Self {
        self.context = context;
        self
    }

    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    /// Хэндл, через который можно остановить исполнитель из другой задачи.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    // --- Поллинг ---

    /// Блокирующий запуск поллинга. Работает до Ctrl-C или `Shutdown::trigger`.
    pub fn start_polling(self, config: PollingConfig) -> Result<(), QiwiError> {
        build_runtime()?.block_on(self.run_polling(config))
    }

    pub async fn run_polling(self, config: PollingConfig) -> Result<(), QiwiError> {
        let plugin_tasks = self.startup().await?;
        let poller = self.spawn_poller(config);
        wait_for_shutdown(self.shutdown.clone()).await;
        self.teardown(Some(poller), plugin_tasks).await
    }

    /// Запускает поллинг в фоне и сразу возвращает управление.
    ///
    /// Хуки запуска к возврату уже отработали. Ctrl-C здесь не слушается,
    /// остановка только через `PollingHandle`.
    pub async fn start_non_blocking_polling(
        self,
        config: PollingConfig,
    ) -> Result<PollingHandle, QiwiError> {
        let plugin_tasks = self.startup().await?;
        let poller = self.spawn_poller(config);
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            self.shutdown.wait().await;
            self.teardown(Some(poller), plugin_tasks).await
        });
        Ok(PollingHandle { shutdown, task })
    }

    fn spawn_poller(&self, config: PollingConfig) -> JoinHandle<()> {
        let poller = Poller::new(
            self.api.clone(),
            self.dispatcher.clone(),
            self.context.clone(),
            config,
        );
        tokio::spawn(poller.run(self.shutdown.subscribe()))
    }

    // --- Вебхуки ---

    /// Блокирующий запуск HTTP сервера для вебхуков.
    pub fn start_webhook(self, config: WebhookConfig) -> Result<(), QiwiError> {
        build_runtime()?.block_on(self.run_webhook(config))
    }

    /// Достает ключи (возможно, регистрируя вебхук через API), поднимает
    /// сервер на `config.bind_address()` и работает до остановки.
    ///
    /// Ошибка конфигурации возвращается до вызова хуков и до того, как
    /// занят порт.
    pub async fn run_webhook(self, config: WebhookConfig) -> Result<(), QiwiError> {
        let state = self.webhook_state(&config).await?;
        let plugin_tasks = self.startup().await?;
        let listener = match TcpListener::bind(config.bind_address()).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(address = %config.bind_address(), error = %err, "Unable to bind webhook server");
                self.teardown(None, plugin_tasks).await?;
                return Err(QiwiError::Io(err));
            }
        };
        self.serve(listener, state, &config, plugin_tasks).await
    }

    /// То же, что `run_webhook`, но на уже открытом сокете.
    pub async fn serve_webhook(
        self,
        listener: TcpListener,
        config: WebhookConfig,
    ) -> Result<(), QiwiError> {
        let state = self.webhook_state(&config).await?;
        let plugin_tasks = self.startup().await?;
        self.serve(listener, state, &config, plugin_tasks).await
    }

    async fn webhook_state(&self, config: &WebhookConfig) -> Result<Arc<WebhookState>, QiwiError> {
        let secrets = config.resolve(self.api.as_ref()).await?;
        Ok(Arc::new(WebhookState::new(
            self.dispatcher.clone(),
            self.context.clone(),
            secrets,
        )))
    }

    async fn serve(
        self,
        listener: TcpListener,
        state: Arc<WebhookState>,
        config: &WebhookConfig,
        plugin_tasks: Vec<JoinHandle<()>>,
    ) -> Result<(), QiwiError> {
        let app = webhook_router(state, config);
        match listener.local_addr() {
            Ok(address) => info!(%address, "Webhook server listening"),
            Err(err) => warn!(error = %err, "Webhook server address unknown"),
        }

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait_for_shutdown(self.shutdown.clone()))
        .await;
        // Сервер мог упасть сам, остальным задачам тоже пора
        self.shutdown.trigger();

        self.teardown(None, plugin_tasks).await?;
        served.map_err(QiwiError::Io)
    }

    // --- Жизненный цикл ---

    async fn startup(&self) -> Result<Vec<JoinHandle<()>>, QiwiError> {
        self.context.insert_arc(API_CLIENT_KEY, self.api.clone());

        for hook in &self.on_startup {
            if let Err(err) = hook(self.context.clone()).await {
                error!(error = %err, "Startup hook failed");
                if let Err(close_err) = self.api.close().await {
                    warn!(error = %close_err, "Unable to close API client");
                }
                return Err(QiwiError::Hook(err));
            }
        }

        let tasks = self
            .plugins
            .iter()
            .map(|plugin| {
                let plugin = plugin.clone();
                let ctx = self.context.clone();
                info!(plugin = plugin.name(), "Installing plugin");
                tokio::spawn(async move {
                    if let Err(err) = plugin.install(ctx).await {
                        error!(plugin = plugin.name(), error = %err, "Plugin failed");
                    }
                })
            })
            .collect();
        Ok(tasks)
    }

    /// Освобождение ресурсов идет в отдельной задаче, поэтому отмена
    /// вызывающего future его не обрывает.
    async fn teardown(
        self,
        poller: Option<JoinHandle<()>>,
        plugin_tasks: Vec<JoinHandle<()>>,
    ) -> Result<(), QiwiError> {
        let Executor {
            api,
            context,
            plugins,
            on_shutdown,
            shutdown,
            ..
        } = self;
        shutdown.trigger();

        let cleanup = tokio::spawn(async move {
            if let Some(poller) = poller {
                if let Err(err) = poller.await {
                    error!(error = %err, "Polling task panicked");
                }
            }

            let results = join_all(on_shutdown.iter().map(|hook| hook(context.clone()))).await;
            for err in results.into_iter().filter_map(Result::err) {
                error!(error = %err, "Shutdown hook failed");
            }

            let results = join_all(plugins.iter().map(|plugin| plugin.shutdown())).await;
            for (plugin, result) in plugins.iter().zip(results) {
                if let Err(err) = result {
                    error!(plugin = plugin.name(), error = %err, "Plugin shutdown failed");
                }
            }
            for task in plugin_tasks {
                task.abort();
            }

            api.close().await?;
            info!("Executor stopped");
            Ok::<(), QiwiError>(())
        });

        cleanup.await.map_err(|err| QiwiError::Hook(err.into()))?
    }
}

/// Хэндл фонового поллинга.
pub struct PollingHandle {
    shutdown: Shutdown,
    task: JoinHandle<Result<(), QiwiError>>,
}

impl PollingHandle {
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Останавливает поллинг и ждет, пока отработают хуки остановки.
    pub async fn stop(self) -> Result<(), QiwiError> {
        self.shutdown.trigger();
        self.task.await.map_err(|err| QiwiError::Hook(err.into()))?
    }
}

fn boxed_hook<F, Fut>(hook: F) -> Hook
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(hook(ctx)))
}

fn blocking_hook<F>(hook: F) -> Hook
where
    F: Fn(&HandlerContext) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Box::new(move |ctx| {
        let result = hook(&ctx);
        Box::pin(async move { result })
    })
}

fn build_runtime() -> Result<tokio::runtime::Runtime, QiwiError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

async fn wait_for_shutdown(shutdown: Shutdown) {
    tokio::select! {
        _ = shutdown.wait() => {}
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                shutdown.trigger();
            }
            Err(err) => {
                warn!(error = %err, "Unable to listen for Ctrl-C");
                shutdown.wait().await;
            }
        },
    }
}

//! Handler registry and the dispatch executor.
//!
//! Timer rows carry a symbolic `(module, function)` handler name plus an
//! opaque argument payload. Applications register handlers under those names
//! at startup; because handler identities are stable across restarts, a
//! timer created before a deploy still resolves after it.

use crate::timer::Timer;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A named action a timer can fire. The payload codec is the handler's own
/// business; the scheduler hands the bytes over untouched.
#[async_trait::async_trait]
pub trait TimerHandler: Send + Sync {
    async fn call(&self, arguments: &[u8]) -> anyhow::Result<()>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> TimerHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, arguments: &[u8]) -> anyhow::Result<()> {
        (self.f)(arguments.to_vec()).await
    }
}

/// Startup-time registry mapping `(module, function)` names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<(String, String), Arc<dyn TimerHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        module: impl Into<String>,
        function: impl Into<String>,
        handler: Arc<dyn TimerHandler>,
    ) {
        let mut handlers = self.handlers.write().await;
        handlers.insert((module.into(), function.into()), handler);
    }

    /// Register an async closure taking the raw payload.
    pub async fn register_fn<F, Fut>(
        &self,
        module: impl Into<String>,
        function: impl Into<String>,
        f: F,
    ) where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(module, function, Arc::new(FnHandler { f })).await;
    }

    pub async fn get(&self, module: &str, function: &str) -> Option<Arc<dyn TimerHandler>> {
        let handlers = self.handlers.read().await;
        handlers
            .get(&(module.to_string(), function.to_string()))
            .cloned()
    }
}

/// Dispatches a claimed timer's action.
///
/// Fire-and-forget contract: `dispatch` must return immediately, run the
/// action on its own task, and swallow every fault internally (reporting it
/// through logging). The worker never waits on a dispatched action.
pub trait Executor: Send + Sync {
    fn dispatch(&self, timer: &Timer);
}

/// [`Executor`] backed by a [`HandlerRegistry`]. Each dispatch runs on its
/// own spawned task; a missing handler or a handler error is logged with the
/// timer's identifying fields and goes no further.
#[derive(Clone)]
pub struct RegistryExecutor {
    registry: Arc<HandlerRegistry>,
}

impl RegistryExecutor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

impl Executor for RegistryExecutor {
    fn dispatch(&self, timer: &Timer) {
        let registry = self.registry.clone();
        let id = timer.id;
        let module = timer.module.clone();
        let function = timer.function.clone();
        let arguments = timer.arguments.clone();

        tokio::spawn(async move {
            let Some(handler) = registry.get(&module, &function).await else {
                tracing::error!(
                    timer_id = %id,
                    module = %module,
                    function = %function,
                    "no handler registered for timer"
                );
                return;
            };

            if let Err(error) = handler.call(&arguments).await {
                tracing::error!(
                    timer_id = %id,
                    module = %module,
                    function = %function,
                    %error,
                    "timer handler failed"
                );
            }
        });
    }
}

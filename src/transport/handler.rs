use crate::messages::Message;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Asynchronous per-message callback.
///
/// Used for the user processing callback, the success and dead-letter sinks,
/// and the handler a consumer client drives for each delivered record.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a shared handler.
///
/// ```rust,ignore
/// let sink = handler_fn(|msg| async move {
///     println!("delivered {}", msg.topic);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

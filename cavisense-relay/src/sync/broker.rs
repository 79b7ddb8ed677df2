use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Receives every message delivered on a subscribed channel.
///
/// A subscription never invokes its handler concurrently with itself: the
/// next message is only read after the previous `handle` call returned.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, channel: &str, payload: String);
}

/// Named-channel publish/subscribe bus shared by all relay processes.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish to every current subscriber of `channel`, this process included.
    ///
    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize>;

    /// Start delivering messages on `channel` to `handler`.
    ///
    /// Link failures are logged and retried underneath; the returned handle
    /// stays valid until cancelled.
    fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Subscription;

    /// Stop all subscriptions and release connections
    async fn close(&self) {}
}

/// Handle to a running subscription task. Dropping it cancels the task.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    #[must_use]
    pub const fn new(channel: String, cancel_token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            channel,
            cancel_token,
            task: Some(task),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.cancel_token.is_cancelled()
            && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel without waiting for the task to exit
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Cancel and wait until the task has exited.
    ///
    /// A handler invocation that is already running completes first.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(channel = %self.channel, error = %e, "Subscription task ended abnormally");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[derive(Debug, Clone)]
struct ChannelMessage {
    channel: Arc<str>,
    payload: Arc<str>,
}

/// In-process broker built on a `tokio::sync::broadcast` channel
///
/// Every relay holding a clone of the same `Arc<MemoryBroker>` sees the same
/// traffic, which makes it a stand-in for Redis in single-node mode and in
/// multi-instance tests.
pub struct MemoryBroker {
    sender: broadcast::Sender<ChannelMessage>,
    cancel_token: CancellationToken,
}

impl MemoryBroker {
    /// Messages buffered per subscriber before it starts lagging
    pub const CHANNEL_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CHANNEL_CAPACITY);
        Self {
            sender,
            cancel_token: CancellationToken::new(),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::BrokerUnavailable("broker closed".to_string()));
        }

        let message = ChannelMessage {
            channel: Arc::from(channel),
            payload: Arc::from(payload),
        };

        // No receivers is not an error: nobody is listening yet.
        Ok(self.sender.send(message).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Subscription {
        // Receiver is created before returning so nothing published after
        // `subscribe` is missed.
        let mut receiver = self.sender.subscribe();
        let cancel_token = self.cancel_token.child_token();
        let task_cancel = cancel_token.clone();
        let channel_name = channel.to_string();

        let task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = task_cancel.cancelled() => {
                        debug!(channel = %channel_name, "In-memory subscription cancelled");
                        return;
                    }
                    message = receiver.recv() => message,
                };

                match message {
                    Ok(message) if *message.channel == *channel_name => {
                        handler.handle(&message.channel, message.payload.to_string()).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            channel = %channel_name,
                            skipped = skipped,
                            "In-memory subscriber lagged, messages dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(channel = %channel_name, "In-memory broker closed");
                        return;
                    }
                }
            }
        });

        Subscription::new(channel.to_string(), cancel_token, task)
    }

    async fn close(&self) {
        self.cancel_token.cancel();
    }
}

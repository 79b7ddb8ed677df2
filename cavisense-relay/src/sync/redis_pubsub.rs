use async_trait::async_trait;
use futures::stream::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client as RedisClient};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cavisense_core::metrics::LINK_ERRORS;

use super::broker::{Broker, MessageHandler, Subscription};
use crate::error::{Error, Result};

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Redis Pub/Sub broker
///
/// Publishing goes through one cached multiplexed connection that is dropped
/// and re-established after any failure. Every subscription owns a dedicated
/// Pub/Sub connection supervised by a background task that reconnects with
/// exponential backoff.
pub struct RedisBroker {
    client: RedisClient,
    publisher: Mutex<Option<MultiplexedConnection>>,
    op_timeout: Duration,
    cancel_token: CancellationToken,
}

enum SubscriberExit {
    /// Shutdown was requested
    Cancelled,
    /// Connection was healthy before it dropped
    Disconnected,
    /// Could not connect or subscribe
    ConnectFailed(Error),
}

impl RedisBroker {
    pub fn new(redis_url: &str, op_timeout: Duration) -> Result<Self> {
        let client = RedisClient::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        Ok(Self {
            client,
            publisher: Mutex::new(None),
            op_timeout,
            cancel_token: CancellationToken::new(),
        })
    }

    async fn publisher_connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.publisher.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = timeout(self.op_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::BrokerUnavailable("Timed out connecting to Redis".to_string()))?
            .map_err(|e| Error::BrokerUnavailable(format!("Failed to connect to Redis: {e}")))?;

        info!("Redis publisher connected");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn try_publish(&self, channel: &str, payload: String) -> Result<usize> {
        let mut conn = self.publisher_connection().await?;
        timeout(self.op_timeout, conn.publish::<_, _, usize>(channel, payload))
            .await
            .map_err(|_| Error::BrokerUnavailable("Timed out publishing".to_string()))?
            .map_err(|e| Error::BrokerUnavailable(format!("Failed to publish: {e}")))
    }

    /// Supervise one subscription until cancelled
    async fn supervise(
        client: RedisClient,
        channel: String,
        handler: Arc<dyn MessageHandler>,
        op_timeout: Duration,
        cancel: CancellationToken,
    ) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            if cancel.is_cancelled() {
                info!(channel = %channel, "Redis subscriber task cancelled");
                return;
            }

            match Self::run_subscriber(&client, &channel, handler.as_ref(), op_timeout, &cancel).await {
                SubscriberExit::Cancelled => {
                    info!(channel = %channel, "Redis subscriber task cancelled");
                    return;
                }
                SubscriberExit::Disconnected => {
                    LINK_ERRORS.with_label_values(&["subscribe"]).inc();
                    error!(
                        channel = %channel,
                        "Redis subscriber stream ended (connection lost), reconnecting after {}s",
                        INITIAL_BACKOFF_SECS
                    );
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
                SubscriberExit::ConnectFailed(e) => {
                    LINK_ERRORS.with_label_values(&["subscribe"]).inc();
                    error!(
                        channel = %channel,
                        error = %e,
                        backoff_secs = backoff_secs,
                        "Redis subscriber failed to connect, retrying after backoff"
                    );
                }
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!(channel = %channel, "Redis subscriber task cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }

            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn run_subscriber(
        client: &RedisClient,
        channel: &str,
        handler: &dyn MessageHandler,
        op_timeout: Duration,
        cancel: &CancellationToken,
    ) -> SubscriberExit {
        let mut pubsub = match timeout(op_timeout, client.get_async_pubsub()).await {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(Error::BrokerUnavailable(format!(
                    "Failed to get Redis Pub/Sub connection: {e}"
                )));
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::BrokerUnavailable(
                    "Timed out getting Redis Pub/Sub connection".to_string(),
                ));
            }
        };

        match timeout(op_timeout, pubsub.subscribe(channel)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(Error::BrokerUnavailable(format!(
                    "Failed to subscribe to {channel}: {e}"
                )));
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::BrokerUnavailable(format!(
                    "Timed out subscribing to {channel}"
                )));
            }
        }

        info!(channel = %channel, "Redis subscriber connected");

        let mut stream = pubsub.on_message();

        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => return SubscriberExit::Cancelled,
                msg = stream.next() => msg,
            };

            let Some(msg) = msg else {
                return SubscriberExit::Disconnected;
            };

            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Invalid payload");
                    continue;
                }
            };

            debug!(channel = %channel, bytes = payload.len(), "Message received from Redis");
            handler.handle(msg.get_channel_name(), payload).await;
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::BrokerUnavailable("broker closed".to_string()));
        }

        match self.try_publish(channel, payload).await {
            Ok(receivers) => {
                debug!(channel = %channel, receivers = receivers, "Published to Redis");
                Ok(receivers)
            }
            Err(e) => {
                LINK_ERRORS.with_label_values(&["publish"]).inc();
                // Force a fresh connection on the next attempt
                self.publisher.lock().await.take();
                Err(e)
            }
        }
    }

    fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Subscription {
        let cancel_token = self.cancel_token.child_token();
        let task = tokio::spawn(Self::supervise(
            self.client.clone(),
            channel.to_string(),
            handler,
            self.op_timeout,
            cancel_token.clone(),
        ));

        Subscription::new(channel.to_string(), cancel_token, task)
    }

    async fn close(&self) {
        info!("Shutting down Redis broker");
        self.cancel_token.cancel();
        self.publisher.lock().await.take();
    }
}

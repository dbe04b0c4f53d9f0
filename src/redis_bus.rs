// =============================================================================
// Redis transport — shared connection + reconnect-with-backoff helpers
// =============================================================================
//
// Every long-lived Redis consumer (C3 ingestor, C5 warmup requester, C9
// broadcaster, C11 websocket server) shares the same reconnect shape: on
// transport error, drop the connection, sleep with exponential backoff
// (base 1s, cap 60s), try again. Each retry loop owns its `Backoff` for the
// duration of that one connect/subscribe attempt, so a later reconnect
// starts fresh rather than carrying over a grown delay. Factored out once
// rather than copied per component, the way the teacher factors its
// kline-stream reconnect loop into one function reused by every stream
// consumer.
// =============================================================================

use std::time::Duration;

use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use tracing::warn;

pub struct Backoff {
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            cap: Duration::from_secs(60),
            current: Duration::from_secs(1),
        }
    }

    pub async fn sleep_and_grow(&mut self) {
        tokio::time::sleep(self.current).await;
        self.current = (self.current * 2).min(self.cap);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Connect with retry; only returns once a connection is established. Used
/// at task startup and after every transport error.
pub async fn connect_with_retry(redis_url: &str) -> ConnectionManager {
    let mut backoff = Backoff::new();
    loop {
        match redis::Client::open(redis_url) {
            Ok(client) => match client.get_tokio_connection_manager().await {
                Ok(conn) => return conn,
                Err(err) => {
                    warn!(error = %err, "redis connection manager failed, retrying");
                }
            },
            Err(err) => {
                warn!(error = %err, "invalid redis url, retrying");
            }
        }
        backoff.sleep_and_grow().await;
    }
}

/// Open a dedicated pubsub connection with retry, subscribed to `channel`.
pub async fn subscribe_with_retry(redis_url: &str, channel: &str) -> PubSub {
    let mut backoff = Backoff::new();
    loop {
        match redis::Client::open(redis_url) {
            Ok(client) => match client.get_async_connection().await {
                Ok(conn) => {
                    let mut pubsub = conn.into_pubsub();
                    if pubsub.subscribe(channel).await.is_ok() {
                        return pubsub;
                    }
                    warn!(channel, "redis subscribe failed, retrying");
                }
                Err(err) => {
                    warn!(error = %err, channel, "redis connect failed, retrying");
                }
            },
            Err(err) => {
                warn!(error = %err, "invalid redis url, retrying");
            }
        }
        backoff.sleep_and_grow().await;
    }
}

pub async fn publish_json(
    conn: &mut ConnectionManager,
    channel: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let payload = serde_json::to_string(value)?;
    let _: () = conn.publish(channel, payload).await?;
    Ok(())
}

pub async fn set_json(
    conn: &mut ConnectionManager,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let payload = serde_json::to_string(value)?;
    let _: () = conn.set(key, payload).await?;
    Ok(())
}

pub async fn get_json(
    conn: &mut ConnectionManager,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn.get(key).await?;
    Ok(match raw {
        Some(s) => serde_json::from_str(&s).ok(),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let mut b = Backoff::new();
        assert_eq!(b.current, Duration::from_secs(1));
        b.current = b.current * 2;
        assert_eq!(b.current, Duration::from_secs(2));
        b.current = Duration::from_secs(40) * 2;
        let capped = b.current.min(b.cap);
        assert_eq!(capped, Duration::from_secs(60));
    }
}

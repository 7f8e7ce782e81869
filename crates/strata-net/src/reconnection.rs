//! Reconnecting to a host after the connection dropped.
//!
//! Delays come from the same exponential backoff with jitter used for chunk
//! I/O retries, with connection-sized defaults.

use std::time::Duration;

use strata_world::RetryPolicy;
use tokio::sync::mpsc;

use crate::routing::NetEvent;
use crate::tcp_client::{ClientConfig, GameClient};

/// Backoff for reconnect attempts: 1 s doubling to 30 s, ten attempts.
pub fn reconnect_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        initial_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        max_delay: Duration::from_secs(30),
        jitter: 0.25,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    #[error("gave up reconnecting after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Connects, retrying with backoff until `policy` runs out of attempts. The
/// first attempt is made immediately.
pub async fn reconnect(
    config: &ClientConfig,
    policy: &RetryPolicy,
    events: mpsc::Sender<NetEvent>,
) -> Result<GameClient, ReconnectError> {
    let mut backoff = policy.backoff();
    loop {
        match GameClient::connect(config, events.clone()).await {
            Ok(client) => {
                if backoff.attempts() > 0 {
                    tracing::info!(attempts = backoff.attempts() + 1, "reconnected to host");
                }
                return Ok(client);
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        attempt = backoff.attempts(),
                        ?delay,
                        error = %e,
                        "connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(ReconnectError::Exhausted {
                        attempts: backoff.attempts(),
                        last_error: e.to_string(),
                    });
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::event_channel;
    use tokio::net::TcpListener;

    async fn unused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[test]
    fn test_policy_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..reconnect_policy()
        };
        let mut backoff = policy.backoff();
        let delays: Vec<Duration> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(delays.len(), 9);
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let config = ClientConfig {
            server_addr: unused_addr().await,
            ..ClientConfig::default()
        };
        let (tx, _rx) = event_channel(1);
        let err = reconnect(&config, &RetryPolicy::immediate(3), tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReconnectError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_connects_once_host_is_back() {
        let addr = unused_addr().await;
        let config = ClientConfig {
            server_addr: addr.clone(),
            ..ClientConfig::default()
        };
        let policy = RetryPolicy {
            max_attempts: 50,
            initial_delay: Duration::from_millis(20),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
        };

        let host = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let listener = TcpListener::bind(&addr).await.unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            stream
        });

        let (tx, _rx) = event_channel(4);
        let client = reconnect(&config, &policy, tx).await.unwrap();
        let _stream = host.await.unwrap();
        client.close().await;
    }
}

//! Broker connection lifecycle with bounded exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use streamer_core::WorkerId;
use streamer_events::{Broker, BrokerError, BrokerSession};

use crate::stats::PipelineStats;

/// Where a [`ConnectionManager`] is in its lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reconnect schedule: retry `i` (0-indexed) waits `min(base * 2^i, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retries allowed after the initial attempt before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("broker unreachable after {attempts} reconnect attempts: {source}")]
pub struct ConnectionExhausted {
    pub attempts: u32,
    #[source]
    pub source: BrokerError,
}

/// Owns the connect/reconnect loop for one pipeline instance.
///
/// `&mut self` on every transition keeps at most one connect in flight. The
/// attempt counter and backoff only reset once a session is fully set up
/// (connected and every queue declared).
pub struct ConnectionManager<B: Broker> {
    worker: WorkerId,
    broker: B,
    policy: ReconnectPolicy,
    queues: Vec<String>,
    state: ConnectionState,
    attempts: u32,
    stats: Arc<PipelineStats>,
}

impl<B: Broker> ConnectionManager<B> {
    /// `queues` are declared (durable) on every new session.
    pub fn new(
        worker: WorkerId,
        broker: B,
        policy: ReconnectPolicy,
        queues: Vec<String>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            worker,
            broker,
            policy,
            queues,
            state: ConnectionState::Disconnected,
            attempts: 0,
            stats,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries spent since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Open a session, backing off between failures until the retry budget is
    /// spent.
    pub async fn connect(&mut self) -> Result<B::Session, ConnectionExhausted> {
        loop {
            self.state = ConnectionState::Connecting;

            match self.open().await {
                Ok(session) => {
                    self.state = ConnectionState::Connected;
                    self.attempts = 0;
                    info!(worker = %self.worker, "connected to broker");
                    return Ok(session);
                }
                Err(err) => {
                    self.state = ConnectionState::Disconnected;
                    warn!(worker = %self.worker, error = %err, "broker connection failed");

                    if self.attempts >= self.policy.max_attempts {
                        return Err(ConnectionExhausted {
                            attempts: self.attempts,
                            source: err,
                        });
                    }
                    self.back_off().await;
                }
            }
        }
    }

    /// Replace a session that reported a connection fault.
    pub async fn retry_connection(&mut self) -> Result<B::Session, ConnectionExhausted> {
        self.state = ConnectionState::Disconnected;
        self.stats.record_reconnect();
        self.back_off().await;
        self.connect().await
    }

    async fn open(&self) -> Result<B::Session, BrokerError> {
        let session = self.broker.connect().await?;
        for queue in &self.queues {
            session.declare_queue(queue).await?;
        }
        Ok(session)
    }

    async fn back_off(&mut self) {
        let delay = self.policy.delay_for_retry(self.attempts);
        self.attempts += 1;
        info!(
            worker = %self.worker,
            attempt = self.attempts,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Attempt {} of {} to reconnect to broker",
            self.attempts,
            self.policy.max_attempts
        );
        tokio::time::sleep(delay).await;
    }
}

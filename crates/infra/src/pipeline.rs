//! One pipeline instance: connection manager, primary consumer and retry
//! coordinator sharing a single broker session at a time.

use std::convert::Infallible;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use streamer_core::WorkerId;
use streamer_events::{Broker, BrokerError, BrokerSession};

use crate::config::StreamerConfig;
use crate::connection::{ConnectionExhausted, ConnectionManager, ReconnectPolicy};
use crate::consumer::PrimaryConsumer;
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::sink::StorageSink;
use crate::stats::PipelineStats;
use crate::store::{DocumentStore, StoreError};

/// Why a pipeline instance (or the worker hosting it) stopped.
///
/// Every variant is fatal for the process.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    ConnectionExhausted(#[from] ConnectionExhausted),

    #[error("failed to subscribe to primary queue {queue}: {source}")]
    Subscription {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("store setup failed: {0}")]
    Store(#[from] StoreError),

    #[error("failed to start {worker}: {reason}")]
    WorkerSpawn { worker: WorkerId, reason: String },

    #[error("{worker} panicked")]
    WorkerPanicked { worker: WorkerId },
}

pub struct Pipeline<B: Broker> {
    worker: WorkerId,
    connection: ConnectionManager<B>,
    consumer: PrimaryConsumer,
    retry: RetryCoordinator,
    stats: Arc<PipelineStats>,
}

impl<B: Broker> Pipeline<B> {
    pub fn new(
        worker: WorkerId,
        broker: B,
        store: Arc<dyn DocumentStore>,
        config: &StreamerConfig,
    ) -> Self {
        let stats = Arc::new(PipelineStats::new());
        let sink = StorageSink::new(worker, store);

        let connection = ConnectionManager::new(
            worker,
            broker,
            ReconnectPolicy {
                max_attempts: config.max_connection_retry_count,
                base_delay: config.initial_retry_delay(),
                max_delay: config.max_retry_delay(),
            },
            vec![
                config.queue_name.clone(),
                config.retry_queue_name.clone(),
                config.dead_letter_queue_name.clone(),
            ],
            stats.clone(),
        );

        let consumer = PrimaryConsumer::new(
            worker,
            &config.queue_name,
            &config.retry_queue_name,
            config.prefetch_count,
            sink.clone(),
            stats.clone(),
        );

        let retry = RetryCoordinator::new(
            worker,
            &config.retry_queue_name,
            &config.dead_letter_queue_name,
            config.prefetch_count,
            RetryPolicy {
                max_retry_count: config.max_retry_count,
                cooldown: config.retry_timeout(),
                max_escalations: config.escalation_limit(),
            },
            sink,
            stats.clone(),
        );

        Self {
            worker,
            connection,
            consumer,
            retry,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Serve until a fatal error. Connection faults are absorbed by
    /// reconnecting; only an exhausted retry budget or a failed primary
    /// subscription ends the instance.
    pub async fn run(mut self) -> Result<Infallible, PipelineError> {
        info!(worker = %self.worker, queue = %self.consumer.queue(), "pipeline starting");

        let result = self.serve_forever().await;

        if let Err(err) = &result {
            error!(
                worker = %self.worker,
                error = %err,
                stats = ?self.stats.snapshot(),
                "pipeline stopped"
            );
        }
        result
    }

    async fn serve_forever(&mut self) -> Result<Infallible, PipelineError> {
        let mut session = self.connection.connect().await?;

        loop {
            let fault = self.serve(&session).await?;
            warn!(worker = %self.worker, error = %fault, "broker session lost, reconnecting");
            drop(session);
            session = self.connection.retry_connection().await?;
        }
    }

    /// Run consumer and retry coordinator on `session` until it faults.
    async fn serve(&self, session: &B::Session) -> Result<BrokerError, PipelineError> {
        let stream = match self.consumer.subscribe(session).await {
            Ok(stream) => stream,
            Err(err) if err.is_connection_fault() => return Ok(err),
            Err(source) => {
                return Err(PipelineError::Subscription {
                    queue: self.consumer.queue().to_string(),
                    source,
                });
            }
        };

        tokio::select! {
            fault = session.closed() => Ok(fault),
            fault = self.consumer.consume(session, stream) => Ok(fault),
            never = self.retry.run(session) => match never {},
        }
    }
}

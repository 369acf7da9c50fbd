//! Retry coordinator.
//!
//! Two cooperating loops per pipeline instance:
//!
//! - **Intake**: consumes the persistent retry queue. Each delivery waits out
//!   the cooldown, is admitted to the buffer, and is acked once the drain that
//!   picked it up has finished. Subscribe/consume faults restart the intake
//!   after the cooldown, indefinitely.
//! - **Drainer**: the sole owner of the [`RetryBuffer`]. It empties the buffer
//!   FIFO, re-queueing failed envelopes with `retry_count + 1` until the
//!   in-process budget is spent, then escalates them back to the retry queue
//!   or, past the escalation cap, to the dead-letter queue.
//!
//! Admissions flow from intake to drainer over a bounded channel.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use streamer_core::WorkerId;
use streamer_events::{BrokerError, BrokerSession, DeadLetter, Delivery, DeliveryStream, Envelope};

use crate::sink::StorageSink;
use crate::stats::PipelineStats;

use super::buffer::RetryBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// In-process re-attempts before escalating.
    pub max_retry_count: u32,
    /// Wait between taking a message off the retry queue and admitting it.
    pub cooldown: Duration,
    /// Trips through the retry queue before dead-lettering; `None` is unbounded.
    pub max_escalations: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            cooldown: Duration::from_millis(5_000),
            max_escalations: Some(5),
        }
    }
}

/// Tally of one buffer drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub stored: u32,
    pub retried: u32,
    pub escalated: u32,
    pub dead_lettered: u32,
    pub dropped: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Escalation {
    Requeued,
    DeadLettered,
    Dropped,
}

struct Admission {
    envelope: Envelope,
    drained: oneshot::Sender<()>,
}

#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    worker: WorkerId,
    retry_queue: String,
    dead_letter_queue: String,
    prefetch: u16,
    policy: RetryPolicy,
    sink: StorageSink,
    stats: Arc<PipelineStats>,
}

impl RetryCoordinator {
    pub fn new(
        worker: WorkerId,
        retry_queue: impl Into<String>,
        dead_letter_queue: impl Into<String>,
        prefetch: u16,
        policy: RetryPolicy,
        sink: StorageSink,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            worker,
            retry_queue: retry_queue.into(),
            dead_letter_queue: dead_letter_queue.into(),
            prefetch,
            policy,
            sink,
            stats,
        }
    }

    /// Run intake and drainer on `session`. Never returns; dropping the
    /// future stops both loops.
    pub async fn run<S>(&self, session: &S) -> Infallible
    where
        S: BrokerSession + ?Sized,
    {
        let (admissions_tx, admissions_rx) = mpsc::channel(usize::from(self.prefetch.max(1)));
        let (never, _) = tokio::join!(
            self.intake(session, admissions_tx),
            self.drainer(session, admissions_rx)
        );
        never
    }

    async fn intake<S>(&self, session: &S, admissions: mpsc::Sender<Admission>) -> Infallible
    where
        S: BrokerSession + ?Sized,
    {
        loop {
            let consumer_tag = format!("{}-retry-{}", self.worker, Uuid::now_v7());
            match session.subscribe(&self.retry_queue, &consumer_tag).await {
                Ok(stream) => {
                    info!(worker = %self.worker, queue = %self.retry_queue, "consuming retry queue");
                    let fault = self.consume(session, stream, &admissions).await;
                    warn!(
                        worker = %self.worker,
                        queue = %self.retry_queue,
                        error = %fault,
                        "retry queue consumption stopped"
                    );
                }
                Err(err) => {
                    warn!(
                        worker = %self.worker,
                        queue = %self.retry_queue,
                        error = %err,
                        "failed to subscribe to retry queue"
                    );
                }
            }

            debug!(
                worker = %self.worker,
                delay_ms = self.policy.cooldown.as_millis() as u64,
                "restarting retry queue intake after cooldown"
            );
            tokio::time::sleep(self.policy.cooldown).await;
        }
    }

    async fn consume<S>(
        &self,
        session: &S,
        stream: DeliveryStream,
        admissions: &mpsc::Sender<Admission>,
    ) -> BrokerError
    where
        S: BrokerSession + ?Sized,
    {
        let result = stream
            .try_for_each_concurrent(usize::from(self.prefetch), |delivery| async move {
                self.admit(session, admissions, delivery).await
            })
            .await;

        match result {
            Err(err) => err,
            Ok(()) => BrokerError::Closed,
        }
    }

    async fn admit<S>(
        &self,
        session: &S,
        admissions: &mpsc::Sender<Admission>,
        delivery: Delivery,
    ) -> Result<(), BrokerError>
    where
        S: BrokerSession + ?Sized,
    {
        tokio::time::sleep(self.policy.cooldown).await;

        match Envelope::decode(delivery.payload()) {
            Ok(envelope) => {
                let (drained, done) = oneshot::channel();
                admissions
                    .send(Admission { envelope, drained })
                    .await
                    .map_err(|_| BrokerError::Closed)?;
                // The drainer drops the sender only if it went away mid-drain.
                done.await.map_err(|_| BrokerError::Closed)?;
            }
            Err(err) => {
                warn!(
                    worker = %self.worker,
                    queue = %self.retry_queue,
                    error = %err,
                    "retry queue payload is not an envelope"
                );
                let letter = DeadLetter::undecodable(delivery.payload(), &self.retry_queue, err.to_string());
                self.dead_letter(session, letter).await;
            }
        }

        delivery.ack().await
    }

    async fn drainer<S>(&self, session: &S, mut admissions: mpsc::Receiver<Admission>) -> Infallible
    where
        S: BrokerSession + ?Sized,
    {
        let mut buffer = RetryBuffer::new();

        loop {
            let Some(first) = admissions.recv().await else {
                return std::future::pending().await;
            };

            let mut waiting = vec![first.drained];
            buffer.push(first.envelope);
            while let Ok(next) = admissions.try_recv() {
                buffer.push(next.envelope);
                waiting.push(next.drained);
            }

            let report = self.drain(session, &mut buffer).await;
            debug!(worker = %self.worker, ?report, "retry buffer drained");

            for drained in waiting {
                let _ = drained.send(());
            }
        }
    }

    /// Empty `buffer`, oldest first, until nothing is left.
    pub async fn drain<S>(&self, session: &S, buffer: &mut RetryBuffer) -> DrainReport
    where
        S: BrokerSession + ?Sized,
    {
        let mut report = DrainReport::default();

        while let Some(envelope) = buffer.pop() {
            let failure = match envelope.call_start() {
                Ok(record) => self.sink.store(&record).await.err().map(|e| e.to_string()),
                Err(err) => Some(err.to_string()),
            };

            let Some(failure) = failure else {
                self.stats.record_stored();
                report.stored += 1;
                continue;
            };

            if envelope.retry_count() < self.policy.max_retry_count {
                debug!(
                    worker = %self.worker,
                    retry_count = envelope.retry_count() + 1,
                    error = %failure,
                    "re-queueing envelope in retry buffer"
                );
                self.stats.record_retried();
                report.retried += 1;
                buffer.push(envelope.next_retry());
                continue;
            }

            match self.escalate(session, envelope, failure).await {
                Escalation::Requeued => report.escalated += 1,
                Escalation::DeadLettered => report.dead_lettered += 1,
                Escalation::Dropped => report.dropped += 1,
            }
        }

        report
    }

    async fn escalate<S>(&self, session: &S, envelope: Envelope, failure: String) -> Escalation
    where
        S: BrokerSession + ?Sized,
    {
        let exhausted = self
            .policy
            .max_escalations
            .is_some_and(|max| envelope.escalation_count() >= max);

        if exhausted {
            warn!(
                worker = %self.worker,
                retry_count = envelope.retry_count(),
                escalation_count = envelope.escalation_count(),
                error = %failure,
                "escalations exhausted, dead-lettering envelope"
            );
            let letter = DeadLetter::exhausted(envelope, &self.retry_queue, failure);
            return self.dead_letter(session, letter).await;
        }

        let escalated = envelope.escalated();
        let published = match escalated.encode() {
            Ok(payload) => session
                .publish(&self.retry_queue, payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match published {
            Ok(()) => {
                info!(
                    worker = %self.worker,
                    queue = %self.retry_queue,
                    retry_count = escalated.retry_count(),
                    escalation_count = escalated.escalation_count(),
                    error = %failure,
                    "in-process retries exhausted, escalated to retry queue"
                );
                self.stats.record_escalated();
                Escalation::Requeued
            }
            Err(reason) => {
                error!(
                    worker = %self.worker,
                    queue = %self.retry_queue,
                    error = %reason,
                    "failed to re-publish to retry queue, message dropped"
                );
                self.stats.record_dropped();
                Escalation::Dropped
            }
        }
    }

    async fn dead_letter<S>(&self, session: &S, letter: DeadLetter) -> Escalation
    where
        S: BrokerSession + ?Sized,
    {
        let published = match letter.encode() {
            Ok(payload) => session
                .publish(&self.dead_letter_queue, payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match published {
            Ok(()) => {
                self.stats.record_dead_lettered();
                Escalation::DeadLettered
            }
            Err(reason) => {
                error!(
                    worker = %self.worker,
                    queue = %self.dead_letter_queue,
                    error = %reason,
                    "failed to publish dead letter, message dropped"
                );
                self.stats.record_dropped();
                Escalation::Dropped
            }
        }
    }
}

//! AMQP 0-9-1 broker (RabbitMQ) via `lapin`.
//!
//! - **Durable queues**: declared on every connect, idempotently
//! - **Persistent messages**: published through the default exchange with
//!   delivery mode 2
//! - **Manual acks**: deliveries stay unacked until the pipeline acks them;
//!   the broker redelivers them if the connection drops first
//! - **Publisher confirms**: the channel is put in confirm mode and a nacked
//!   publish is reported as [`BrokerError::Publish`]
//! - **Fault reporting**: connection errors raised by lapin's I/O loop are
//!   forwarded to [`BrokerSession::closed`]

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::{debug, error, instrument};

use streamer_events::{
    Acknowledger, Broker, BrokerError, BrokerSession, Delivery, DeliveryStream, DeliveryTag,
};

/// AMQP delivery mode marking a message as persistent.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Connects to an AMQP broker at a fixed URL.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    /// * `url` - AMQP connection URL (e.g., "amqp://localhost")
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Session = AmqpSession;

    async fn connect(&self) -> Result<Self::Session, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let (fault_tx, fault_rx) = watch::channel(None);
        connection.on_error(move |err| {
            error!(error = %err, "AMQP connection error");
            fault_tx.send_replace(Some(err.to_string()));
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        debug!(channel_id = channel.id(), "AMQP channel open");

        Ok(AmqpSession {
            _connection: connection,
            channel,
            faults: fault_rx,
        })
    }
}

/// One AMQP connection and one channel on it.
pub struct AmqpSession {
    // Held so the connection lives as long as the session.
    _connection: Connection,
    channel: Channel,
    faults: watch::Receiver<Option<String>>,
}

impl core::fmt::Debug for AmqpSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AmqpSession")
            .field("channel_id", &self.channel.id())
            .finish_non_exhaustive()
    }
}

/// Only a broker nack fails a publish; `Ack` carrying a returned message
/// cannot happen without the `mandatory` flag.
fn check_confirmation(queue: &str, confirmation: &Confirmation) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Nack(_) => Err(BrokerError::Publish {
            queue: queue.to_string(),
            reason: "broker nacked the message".to_string(),
        }),
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

fn map_lapin_error(err: lapin::Error, fallback: impl FnOnce(String) -> BrokerError) -> BrokerError {
    match err {
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
            BrokerError::Connection(err.to_string())
        }
        other => fallback(other.to_string()),
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(|e| {
                map_lapin_error(e, |reason| BrokerError::Declare {
                    queue: queue.to_string(),
                    reason,
                })
            })?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| map_lapin_error(e, BrokerError::Channel))
    }

    #[instrument(skip(self), err)]
    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                map_lapin_error(e, |reason| BrokerError::Subscribe {
                    queue: queue.to_string(),
                    reason,
                })
            })?;

        let queue = queue.to_string();
        let stream = consumer.map(move |item| {
            item.map(|delivery| {
                let tag = DeliveryTag::new(delivery.delivery_tag);
                Delivery::new(
                    tag,
                    queue.clone(),
                    delivery.data,
                    Box::new(AmqpAcker {
                        acker: delivery.acker,
                    }),
                )
            })
            .map_err(|e| BrokerError::Connection(e.to_string()))
        });

        Ok(stream.boxed())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let publish_err = |reason: String| BrokerError::Publish {
            queue: queue.to_string(),
            reason,
        };

        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY_MODE),
            )
            .await
            .map_err(|e| map_lapin_error(e, publish_err))?
            .await
            .map_err(|e| map_lapin_error(e, publish_err))?;

        check_confirmation(queue, &confirmation)
    }

    async fn closed(&self) -> BrokerError {
        let mut faults = self.faults.clone();
        match faults.wait_for(Option::is_some).await {
            Ok(fault) => BrokerError::Connection(fault.clone().unwrap_or_default()),
            Err(_) => BrokerError::Closed,
        }
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack {
                tag,
                reason: e.to_string(),
            })
    }
}

//! Kafka broker driver
//!
//! Wraps an rdkafka [`FutureProducer`]. `publish` waits for the delivery
//! report, so a returned [`Delivery`] means the broker acknowledged the
//! message with the configured `acks`.
//!
//! Building with this feature needs the native librdkafka toolchain.

use bytes::Bytes;
use herald_pool::Context;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::driver::{BrokerDriver, DriverError};
use crate::message::Delivery;

/// Publishes to one topic with a shared producer.
pub struct KafkaBroker {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaBroker {
    /// Create the producer. librdkafka connects lazily.
    pub fn new(config: &BrokerConfig) -> Result<Self, DriverError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.endpoint)
            .set("acks", &config.acks)
            .set("retries", config.retries.to_string())
            .set("batch.size", config.batch_size.to_string())
            .set("linger.ms", config.linger.as_millis().to_string())
            .set(
                "message.timeout.ms",
                config.delivery_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| DriverError::protocol("invalid kafka producer config").with_source(e))?;

        debug!(endpoint = %config.endpoint, topic = %config.topic, "created kafka producer");
        Ok(Self {
            producer,
            topic: config.topic.clone(),
            delivery_timeout: config.delivery_timeout,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl BrokerDriver for KafkaBroker {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn publish(
        &self,
        _ctx: &Context,
        key: &str,
        payload: Bytes,
    ) -> Result<Delivery, DriverError> {
        let record = FutureRecord::to(&self.topic)
            .key(key)
            .payload(payload.as_ref());

        match self.producer.send(record, Timeout::After(Duration::ZERO)).await {
            Ok((partition, offset)) => Ok(Delivery {
                partition: Some(partition),
                offset: Some(offset),
            }),
            Err((error, _message)) => Err(classify(error)),
        }
    }

    async fn close(&self, _ctx: &Context) -> Result<(), DriverError> {
        let producer = self.producer.clone();
        let timeout = self.delivery_timeout;
        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| DriverError::protocol("kafka flush task failed").with_source(e))?;
        flushed.map_err(classify)?;
        info!(topic = %self.topic, "kafka producer flushed");
        Ok(())
    }
}

fn classify(error: KafkaError) -> DriverError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageTimedOut | RDKafkaErrorCode::OperationTimedOut) => {
            DriverError::timeout("kafka delivery").with_source(error)
        }
        Some(
            RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::QueueFull,
        )
        | None => DriverError::connection("kafka producer").with_source(error),
        Some(_) => DriverError::rejected("kafka rejected message").with_source(error),
    }
}

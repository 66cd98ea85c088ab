//! JetStream consumer for the inbound transaction feed

use crate::config::NatsConfig;
use anyhow::{Context, Result};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream, Message,
};
use std::time::Duration;
use tracing::{info, warn};

fn stream_config(config: &NatsConfig) -> stream::Config {
    stream::Config {
        name: config.stream_name.clone(),
        subjects: vec![config.transaction_subject.clone()],
        ..Default::default()
    }
}

fn consumer_config(config: &NatsConfig) -> pull::Config {
    pull::Config {
        durable_name: Some(config.consumer_name.clone()),
        filter_subject: config.transaction_subject.clone(),
        ack_policy: AckPolicy::Explicit,
        ack_wait: Duration::from_secs(config.ack_wait_secs),
        ..Default::default()
    }
}

/// Durable pull consumer on the transaction stream.
///
/// Delivery is at-least-once: messages are acknowledged by the caller only
/// after the batch holding them has been persisted.
pub struct TransactionConsumer {
    consumer: PullConsumer,
    subject: String,
}

impl TransactionConsumer {
    /// Connect to NATS and bind the durable consumer, creating the stream
    /// and consumer when missing.
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url)
            .await
            .with_context(|| format!("Failed to connect to NATS at {}", config.url))?;
        info!(url = %config.url, "Connected to NATS");

        let context = jetstream::new(client);
        let stream = context
            .get_or_create_stream(stream_config(config))
            .await
            .with_context(|| format!("Failed to open stream {}", config.stream_name))?;

        let consumer = stream
            .get_or_create_consumer(&config.consumer_name, consumer_config(config))
            .await
            .with_context(|| format!("Failed to bind consumer {}", config.consumer_name))?;

        info!(
            stream = %config.stream_name,
            subject = %config.transaction_subject,
            consumer = %config.consumer_name,
            ack_wait_secs = config.ack_wait_secs,
            "Transaction consumer ready"
        );
        Ok(Self {
            consumer,
            subject: config.transaction_subject.clone(),
        })
    }

    /// Continuous message stream
    pub async fn messages(&self) -> Result<pull::Stream> {
        self.consumer
            .messages()
            .await
            .context("Failed to start message stream")
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Acknowledge and clear delivered messages. Returns how many were acked.
pub async fn ack_all(messages: &mut Vec<Message>) -> usize {
    let mut acked = 0;
    for message in messages.drain(..) {
        match message.ack().await {
            Ok(()) => acked += 1,
            Err(e) => warn!(subject = %message.subject, error = %e, "Failed to ack message"),
        }
    }
    acked
}

#[cfg(test)]
mod tests {
    // Delivery itself needs a running NATS server
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_stream_and_consumer_configs() {
        let config = AppConfig::default().nats;

        let stream = stream_config(&config);
        assert_eq!(stream.name, "TRANSACTIONS");
        assert_eq!(stream.subjects, vec!["transactions".to_string()]);

        let consumer = consumer_config(&config);
        assert_eq!(consumer.durable_name.as_deref(), Some("anomaly-detector"));
        assert_eq!(consumer.filter_subject, "transactions");
        assert!(matches!(consumer.ack_policy, AckPolicy::Explicit));
        assert_eq!(consumer.ack_wait, Duration::from_secs(300));
    }

    #[test]
    fn test_ack_wait_follows_config() {
        let config = NatsConfig {
            ack_wait_secs: 900,
            ..AppConfig::default().nats
        };
        assert_eq!(consumer_config(&config).ack_wait, Duration::from_secs(900));
    }
}

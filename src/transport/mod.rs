//! Broker transport abstraction
//!
//! The dispatcher only sees [`Transport`]: deliveries arrive on a channel and
//! each one must be settled exactly once with [`Transport::ack`] or
//! [`Transport::reject`]. MQTT v5 is the shipped binding.

pub mod mqtt;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One inbound message awaiting settlement
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Transport-local handle used to settle this delivery
    pub tag: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    /// The broker flagged this as a possible duplicate (MQTT DUP)
    pub redelivered: bool,
}

impl Delivery {
    pub fn new(tag: u64, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            tag,
            topic: topic.into(),
            payload,
            redelivered: false,
        }
    }
}

/// Transport abstraction for broker communication
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn connect(&mut self) -> Result<(), Self::Error>;

    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Subscribe to the request topic with manual acknowledgement
    async fn subscribe_requests(&mut self) -> Result<(), Self::Error>;

    /// Publish `payload` to `topic` with at-least-once delivery
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error>;

    /// Acknowledge a delivery; the broker will not redeliver it
    async fn ack(&self, delivery: &Delivery) -> Result<(), Self::Error>;

    /// Reject a delivery without requeue, routing it to the dead-letter path
    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), Self::Error>;

    fn is_connected(&self) -> bool;

    fn connection_state(&self) -> Option<mqtt::ConnectionState>;

    fn is_permanently_disconnected(&self) -> bool;

    /// Where received deliveries are forwarded
    fn set_delivery_sender(&self, sender: mpsc::Sender<Delivery>);
}

pub type MqttTransport = mqtt::MqttClient;

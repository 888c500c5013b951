//! MQTT v5 binding of the [`Transport`](crate::transport::Transport) trait
//!
//! Pure decisions are separated from I/O:
//!
//! - [`connection`] - connection states, backoff and broker options
//! - [`message_handler`] - event routing and delivery bookkeeping
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`client`] - the rumqttc client and its reconnect supervisor
//!
//! Requests are consumed on a persistent session with manual
//! acknowledgements. MQTT has no negative acknowledgement, so a rejection
//! republishes the request to the dead-letter topic and then acknowledges
//! the original.
//!
//! ```rust,no_run
//! use imagetask_worker::config::WorkerConfig;
//! use imagetask_worker::transport::{mqtt::MqttClient, Transport};
//!
//! # tokio_test::block_on(async {
//! let config = WorkerConfig::load_from_file("worker.toml".as_ref())?;
//! let mut client = MqttClient::new(&config.worker.id, config.mqtt.clone(), 1)?;
//! client.connect().await?;
//! client.subscribe_requests().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{
    DeliveryForwarder, EventRoute, MessageHandler, ORIGINAL_TOPIC_PROPERTY,
    REJECT_REASON_PROPERTY,
};

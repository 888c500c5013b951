//! Message routing for MQTT events and delivery bookkeeping
//!
//! [`MessageHandler`] holds the pure routing decisions. [`DeliveryForwarder`]
//! tags each inbound publish, keeps the raw packet until the delivery is
//! settled, and hands the [`Delivery`] to the dispatcher.

use crate::transport::Delivery;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, PublishProperties};
use rumqttc::v5::Event;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// User property carrying the reason a request was dead-lettered
pub const REJECT_REASON_PROPERTY: &str = "x-reject-reason";
/// User property carrying the topic the rejected request arrived on
pub const ORIGINAL_TOPIC_PROPERTY: &str = "x-original-topic";

pub struct MessageHandler;

impl MessageHandler {
    /// Only fresh publishes on the request topic become deliveries
    pub fn should_process_message(topic: &str, retain: bool, expected_topic: &str) -> bool {
        if retain {
            debug!("Ignoring retained message on topic: {}", topic);
            return false;
        }

        if topic != expected_topic {
            debug!("Topic mismatch: expected {}, got {}", expected_topic, topic);
            return false;
        }

        true
    }

    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(publish.clone()),
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Properties attached to a dead-lettered request
    pub fn dead_letter_properties(original_topic: &str, reason: &str) -> PublishProperties {
        PublishProperties {
            user_properties: vec![
                (REJECT_REASON_PROPERTY.to_string(), reason.to_string()),
                (ORIGINAL_TOPIC_PROPERTY.to_string(), original_topic.to_string()),
            ],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived(Publish),
    Disconnected,
    SubscriptionConfirmed { packet_id: u16 },
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Tags inbound publishes and remembers them until settled
#[derive(Default)]
pub struct DeliveryForwarder {
    sender: Option<mpsc::Sender<Delivery>>,
    pending: HashMap<u64, Publish>,
    /// Deliveries that arrived before a sender was installed
    backlog: Vec<Delivery>,
    next_tag: u64,
}

impl DeliveryForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the dispatcher channel and return any deliveries buffered
    /// before it existed, in arrival order. The caller forwards them.
    pub fn set_sender(&mut self, sender: mpsc::Sender<Delivery>) -> Vec<Delivery> {
        self.sender = Some(sender);
        std::mem::take(&mut self.backlog)
    }

    /// Record `publish` as pending and return the delivery plus the channel to
    /// send it on. The caller sends after releasing the forwarder lock.
    ///
    /// Without a sender the delivery is buffered and `None` is returned; the
    /// publish stays pending so it can still be settled later.
    pub fn register(&mut self, publish: Publish) -> Option<(Delivery, mpsc::Sender<Delivery>)> {
        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = Delivery {
            tag,
            topic: String::from_utf8_lossy(&publish.topic).to_string(),
            payload: publish.payload.to_vec(),
            redelivered: publish.dup,
        };
        self.pending.insert(tag, publish);

        match self.sender.clone() {
            Some(sender) => Some((delivery, sender)),
            None => {
                warn!(tag, "Request arrived before the dispatcher was ready; buffering it");
                self.backlog.push(delivery);
                None
            }
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Remove and return the raw publish for `tag`
    pub fn take(&mut self, tag: u64) -> Option<Publish> {
        self.pending.remove(&tag)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forget every unsettled publish.
    ///
    /// Packet ids are only meaningful on the connection that received them;
    /// after a reconnect the broker redelivers whatever was never acked.
    pub fn clear_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.backlog.clear();
        dropped
    }
}

//! Impure I/O for the MQTT client
//!
//! Owns the rumqttc client, the reconnect supervisor task and the pending
//! delivery table. Pure decisions live in the sibling modules.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{DeliveryForwarder, EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::observability::metrics::metrics;
use crate::transport::{Delivery, Transport};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Publish;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, EventLoop};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CLIENT_CHANNEL_CAPACITY: usize = 10;

/// MQTT v5 transport with manual acknowledgements and dead-letter rejection
pub struct MqttClient {
    worker_id: String,
    config: MqttSection,
    receive_maximum: u16,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: std::sync::Mutex<Option<EventLoop>>,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    forwarder: Arc<Mutex<DeliveryForwarder>>,
}

impl MqttClient {
    /// `receive_maximum` caps unacknowledged requests in flight; pass the
    /// number of dispatch workers.
    pub fn new(
        worker_id: &str,
        config: MqttSection,
        receive_maximum: u16,
    ) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(worker_id, &config, receive_maximum)?;

        Ok(MqttClient {
            worker_id: worker_id.to_string(),
            config,
            receive_maximum,
            client: Arc::new(Mutex::new(client)),
            event_loop: std::sync::Mutex::new(Some(event_loop)),
            event_loop_handle: None,
            state_rx: None,
            shutdown_tx: None,
            reconnect_config: ReconnectConfig::default(),
            subscribed_topics: Arc::new(Mutex::new(Vec::new())),
            forwarder: Arc::new(Mutex::new(DeliveryForwarder::new())),
        })
    }

    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    fn create_connection(
        worker_id: &str,
        config: &MqttSection,
        receive_maximum: u16,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(worker_id, config, receive_maximum)?;
        Ok(AsyncClient::new(mqtt_options, CLIENT_CHANNEL_CAPACITY))
    }

    /// Wait until the supervisor reports the first ConnAck
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        waited.unwrap_or_else(|_| {
            Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            ))
        })
    }

    /// Start the event loop supervisor and wait for the broker's ConnAck
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.state_rx = Some(state_rx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        metrics().mqtt_connection_attempt();
        let supervisor = Supervisor {
            worker_id: self.worker_id.clone(),
            config: self.config.clone(),
            receive_maximum: self.receive_maximum,
            client: self.client.clone(),
            state_tx,
            shutdown_rx,
            reconnect_config: self.reconnect_config.clone(),
            subscribed_topics: self.subscribed_topics.clone(),
            forwarder: self.forwarder.clone(),
            reconnect_attempts: 0,
        };
        self.event_loop_handle = Some(tokio::spawn(supervisor.run(event_loop)));

        let timeout = HealthMonitor::calculate_connection_timeout(&self.reconnect_config);
        Self::wait_for_connection_confirmation(state_rx, timeout).await
    }

    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        if self.event_loop_handle.is_some() {
            let client = self.client.lock().await;
            if let Err(e) = client.disconnect().await {
                warn!("MQTT disconnect request failed: {}", e);
            }
        }

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("MQTT event loop shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT event loop ended with error: {}", e),
                Err(_) => warn!("MQTT event loop didn't shut down in time"),
                _ => {}
            }
        }

        let dropped = self.forwarder.lock().await.clear_pending();
        if dropped > 0 {
            warn!(dropped, "Disconnected with unsettled deliveries; the broker will redeliver them");
        }

        info!("MQTT client disconnected");
        Ok(())
    }

    /// Current connection state, None before `connect()`
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    async fn take_pending(&self, delivery: &Delivery) -> Result<Publish, MqttError> {
        self.forwarder
            .lock()
            .await
            .take(delivery.tag)
            .ok_or(MqttError::UnknownDelivery(delivery.tag))
    }
}

/// Event loop driver: routes packets, forwards requests, reconnects
struct Supervisor {
    worker_id: String,
    config: MqttSection,
    receive_maximum: u16,
    client: Arc<Mutex<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    forwarder: Arc<Mutex<DeliveryForwarder>>,
    reconnect_attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!(worker_id = %self.worker_id, "Starting MQTT event loop supervisor");

        loop {
            let keep_running = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    changed.is_ok() && !*self.shutdown_rx.borrow()
                }
                event = event_loop.poll() => match event {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        self.handle_route(route, &mut event_loop).await
                    }
                    Err(e) => self.handle_error(e, &mut event_loop).await,
                },
            };

            if !keep_running {
                break;
            }
        }

        info!(worker_id = %self.worker_id, "MQTT event loop stopped");
    }

    async fn handle_route(&mut self, route: EventRoute, event_loop: &mut EventLoop) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let _ = self
                    .state_tx
                    .send(HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived));
                metrics().mqtt_connection_established();
                self.reconnect_attempts = 0;
                self.resubscribe().await;
                true
            }
            EventRoute::MessageReceived(publish) => {
                self.handle_publish(publish).await;
                true
            }
            EventRoute::Disconnected => {
                let _ = self.state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::DisconnectedByBroker,
                ));
                metrics().mqtt_connection_lost();
                self.reconnect(event_loop).await
            }
            EventRoute::SubscriptionConfirmed { packet_id } => {
                debug!(target: "mqtt_transport", "Subscription confirmed (pkid {})", packet_id);
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_error(&mut self, error: ConnectionError, event_loop: &mut EventLoop) -> bool {
        let was_connected = matches!(*self.state_tx.borrow(), ConnectionState::Connected);
        let _ = self.state_tx.send(HealthMonitor::determine_next_state(
            ConnectionEvent::NetworkError(error.to_string()),
        ));
        if was_connected {
            metrics().mqtt_connection_lost();
        } else {
            metrics().mqtt_connection_failed();
        }
        self.reconnect(event_loop).await
    }

    async fn handle_publish(&self, publish: Publish) {
        metrics().mqtt_message_received();
        let topic = String::from_utf8_lossy(&publish.topic).to_string();

        if !MessageHandler::should_process_message(&topic, publish.retain, &self.config.request_topic)
        {
            // Still settle it, or it would pin a receive slot for the whole session
            if publish.qos != QoS::AtMostOnce {
                if let Err(e) = self.client.lock().await.ack(&publish).await {
                    warn!("Failed to ack ignored message on {}: {}", topic, e);
                }
            }
            return;
        }

        let registered = self.forwarder.lock().await.register(publish);
        if let Some((delivery, sender)) = registered {
            debug!(target: "mqtt_transport", tag = delivery.tag, redelivered = delivery.redelivered, "Forwarding delivery");
            if let Err(e) = sender.send(delivery).await {
                error!("Failed to forward delivery to dispatcher: {}", e);
            }
        }
    }

    async fn resubscribe(&self) {
        let topics = self.subscribed_topics.lock().await.clone();
        let client = self.client.lock().await;
        for topic in topics {
            match client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                Ok(()) => debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic),
                Err(e) => error!("Failed to re-subscribe to {}: {}", topic, e),
            }
        }
    }

    /// Returns false when the supervisor should stop
    async fn reconnect(&mut self, event_loop: &mut EventLoop) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                let _ = self.state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::ReconnectionStarted(attempt),
                ));
                info!("Attempting reconnection {} after {}ms delay", attempt, delay_ms);

                if !self.interruptible_sleep(delay_ms).await {
                    return false;
                }

                let dropped = self.forwarder.lock().await.clear_pending();
                if dropped > 0 {
                    warn!(dropped, "Connection lost with unsettled deliveries; awaiting broker redelivery");
                }

                metrics().mqtt_connection_attempt();
                match MqttClient::create_connection(
                    &self.worker_id,
                    &self.config,
                    self.receive_maximum,
                ) {
                    Ok((client, new_event_loop)) => {
                        *event_loop = new_event_loop;
                        *self.client.lock().await = client;
                    }
                    Err(e) => error!("Failed to create new connection: {}", e),
                }
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown requested, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts } => {
                let reason = format!("Max reconnection attempts ({max_attempts}) exceeded");
                let _ = self.state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::PermanentFailure(reason),
                ));
                false
            }
        }
    }

    /// Returns false if shutdown was requested during the sleep
    async fn interruptible_sleep(&mut self, delay_ms: u64) -> bool {
        tokio::select! {
            changed = self.shutdown_rx.changed() => {
                changed.is_ok() && !*self.shutdown_rx.borrow()
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn subscribe_requests(&mut self) -> Result<(), Self::Error> {
        self.check_connection_state()?;

        let topic = self.config.request_topic.clone();
        info!("Subscribing to request topic: {}", topic);
        self.client
            .lock()
            .await
            .subscribe(topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;

        let mut topics = self.subscribed_topics.lock().await;
        if !topics.contains(&topic) {
            topics.push(topic);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        self.check_connection_state()?;

        self.client
            .lock()
            .await
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        let publish = self.take_pending(delivery).await?;
        self.client
            .lock()
            .await
            .ack(&publish)
            .await
            .map_err(|e| MqttError::AckFailed(Box::new(e)))
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), Self::Error> {
        let publish = self.take_pending(delivery).await?;
        self.check_connection_state()?;

        let properties = MessageHandler::dead_letter_properties(&delivery.topic, reason);
        let client = self.client.lock().await;
        client
            .publish_with_properties(
                self.config.dead_letter_topic.as_str(),
                QoS::AtLeastOnce,
                false,
                publish.payload.clone(),
                properties,
            )
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        // Only settle the original once its dead-letter copy is queued
        client
            .ack(&publish)
            .await
            .map_err(|e| MqttError::AckFailed(Box::new(e)))?;

        warn!(
            tag = delivery.tag,
            reason,
            dead_letter_topic = %self.config.dead_letter_topic,
            "Delivery dead-lettered"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    fn set_delivery_sender(&self, sender: mpsc::Sender<Delivery>) {
        let backlog = match self.forwarder.try_lock() {
            Ok(mut forwarder) => forwarder.set_sender(sender.clone()),
            Err(_) => {
                let forwarder = self.forwarder.clone();
                tokio::spawn(async move {
                    let backlog = forwarder.lock().await.set_sender(sender.clone());
                    forward_backlog(sender, backlog).await;
                });
                return;
            }
        };
        if !backlog.is_empty() {
            tokio::spawn(forward_backlog(sender, backlog));
        }
    }
}

async fn forward_backlog(sender: mpsc::Sender<Delivery>, backlog: Vec<Delivery>) {
    for delivery in backlog {
        debug!(target: "mqtt_transport", tag = delivery.tag, "Forwarding buffered delivery");
        if let Err(e) = sender.send(delivery).await {
            error!("Failed to forward buffered delivery to dispatcher: {}", e);
            break;
        }
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

//! Worker lifecycle: connect, subscribe, consume, shut down
//!
//! Dependencies are injected; [`WorkerLifecycle::start`] wires them into a
//! [`Dispatcher`] shared by `worker.concurrency` consumer tasks. Each task
//! takes one delivery, runs it to settlement, then takes the next.

use crate::config::{FailurePolicy, WorkerConfig};
use crate::dispatcher::consumer::Dispatcher;
use crate::executor::ImageExecutor;
use crate::idempotency::{ClaimingStore, IdempotencyStore};
use crate::observability::health::{HealthCheck, HealthServer};
use crate::observability::metrics::metrics;
use crate::publisher::ResponsePublisher;
use crate::resolution::FallbackClassifier;
use crate::storage::ImageStore;
use crate::transport::{Delivery, Transport};
use crate::{lifecycle_span, mqtt_span};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WorkerLifecycle<T>
where
    T: Transport + 'static,
{
    config: WorkerConfig,
    transport: Option<T>,
    running_transport: Option<Arc<T>>,
    idempotency: Arc<dyn IdempotencyStore>,
    executor: Arc<dyn ImageExecutor>,
    image_store: Arc<dyn ImageStore>,
    classifier: Option<FallbackClassifier>,
    health_server: Option<Arc<HealthServer>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    worker_handles: Vec<JoinHandle<()>>,
    health_check_handle: Option<JoinHandle<()>>,
}

impl<T> WorkerLifecycle<T>
where
    T: Transport + 'static,
{
    pub fn new(
        config: WorkerConfig,
        transport: T,
        idempotency: Arc<dyn IdempotencyStore>,
        executor: Arc<dyn ImageExecutor>,
        image_store: Arc<dyn ImageStore>,
    ) -> Self {
        Self {
            config,
            transport: Some(transport),
            running_transport: None,
            idempotency,
            executor,
            image_store,
            classifier: None,
            health_server: None,
            shutdown_tx: None,
            worker_handles: Vec::new(),
            health_check_handle: None,
        }
    }

    pub fn with_classifier(mut self, classifier: FallbackClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn set_health_server(&mut self, health_server: Arc<HealthServer>) {
        self.health_server = Some(health_server);
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker.id
    }

    /// The shared transport once started
    pub fn transport(&self) -> Option<&Arc<T>> {
        self.running_transport.as_ref()
    }

    pub fn is_running(&self) -> bool {
        !self.worker_handles.is_empty()
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        match (&self.transport, &self.running_transport) {
            (Some(transport), _) => transport.is_permanently_disconnected(),
            (None, Some(transport)) => transport.is_permanently_disconnected(),
            (None, None) => false,
        }
    }

    /// Delivery channel sized to the broker's in-flight window
    fn create_delivery_channel(concurrency: usize) -> (mpsc::Sender<Delivery>, mpsc::Receiver<Delivery>) {
        mpsc::channel(concurrency.max(1))
    }

    async fn check_idempotency(store: &dyn IdempotencyStore) -> HealthCheck {
        match store.health_check().await {
            Ok(()) => HealthCheck::healthy("idempotency store reachable"),
            Err(e) => HealthCheck::unhealthy(format!("idempotency store unavailable: {e}")),
        }
    }

    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        let Some(mut transport) = self.transport.take() else {
            return Err(LifecycleError::InitializationError(
                "Worker already started".to_string(),
            ));
        };
        info!(worker_id = %self.config.worker.id, "Starting worker lifecycle");
        metrics().set_worker_state("starting");

        // A persistent session pushes queued requests right after CONNACK,
        // so the channel must exist before connecting
        let concurrency = self.config.worker.concurrency.max(1);
        let (delivery_tx, delivery_rx) = Self::create_delivery_channel(concurrency);
        transport.set_delivery_sender(delivery_tx);

        async {
            transport
                .connect()
                .await
                .map_err(|e| LifecycleError::TransportError(Box::new(e)))?;
            info!("Broker transport connected");
            transport
                .subscribe_requests()
                .await
                .map_err(|e| LifecycleError::TransportError(Box::new(e)))?;
            info!(topic = %self.config.mqtt.request_topic, "Subscribed to request topic");
            Ok::<(), LifecycleError>(())
        }
        .instrument(mqtt_span!(operation = "connect_and_subscribe"))
        .await?;

        let idempotency_health = Self::check_idempotency(self.idempotency.as_ref()).await;
        if !idempotency_health.is_healthy() {
            if self.config.idempotency.failure_policy == FailurePolicy::FailClosed {
                return Err(LifecycleError::InitializationError(
                    idempotency_health.message.unwrap_or_default(),
                ));
            }
            warn!(
                "Idempotency store unhealthy at startup; continuing under fail-open policy"
            );
        }
        if let Some(health) = &self.health_server {
            health.set_health_check("idempotency", idempotency_health).await;
            health.set_mqtt_connected(transport.is_connected());
        }

        let transport = Arc::new(transport);
        let publisher = ResponsePublisher::new(
            transport.clone(),
            self.config.mqtt.response_topic.clone(),
            &self.config.publisher,
        );
        let mut dispatcher = Dispatcher::new(
            transport.clone(),
            ClaimingStore::new(
                self.idempotency.clone(),
                self.config.idempotency.failure_policy,
            ),
            publisher,
            self.executor.clone(),
            self.image_store.clone(),
        );
        if let Some(classifier) = self.classifier.take() {
            dispatcher = dispatcher.with_classifier(classifier);
        }
        if let Some(health) = &self.health_server {
            dispatcher = dispatcher.with_health_server(health.clone());
        }
        let dispatcher = Arc::new(dispatcher);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receiver = Arc::new(Mutex::new(delivery_rx));
        for index in 0..concurrency {
            self.worker_handles.push(Self::spawn_consumer(
                index,
                dispatcher.clone(),
                receiver.clone(),
                shutdown_rx.clone(),
            ));
        }
        self.shutdown_tx = Some(shutdown_tx);

        self.health_check_handle = Some(Self::spawn_health_monitor(
            transport.clone(),
            self.idempotency.clone(),
            self.health_server.clone(),
        ));
        self.running_transport = Some(transport);

        metrics().set_worker_state("running");
        info!(concurrency, "Worker lifecycle started");
        Ok(())
    }

    fn spawn_consumer(
        index: usize,
        dispatcher: Arc<Dispatcher<T>>,
        receiver: Arc<Mutex<mpsc::Receiver<Delivery>>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                debug!("Consumer started");
                loop {
                    let next = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            delivery = receiver.recv() => delivery,
                            _ = shutdown_rx.changed() => None,
                        }
                    };

                    match next {
                        Some(delivery) => {
                            dispatcher.handle_delivery(delivery).await;
                        }
                        None => break,
                    }
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                debug!("Consumer stopped");
            }
            .instrument(lifecycle_span!(consumer = index)),
        )
    }

    /// Periodically refresh the health endpoint's view of the transport and store
    fn spawn_health_monitor(
        transport: Arc<T>,
        idempotency: Arc<dyn IdempotencyStore>,
        health_server: Option<Arc<HealthServer>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            interval.tick().await;

            loop {
                interval.tick().await;

                let check = Self::check_idempotency(idempotency.as_ref()).await;
                let connected = transport.is_connected();
                if !check.is_healthy() {
                    warn!(
                        message = check.message.as_deref().unwrap_or_default(),
                        "Idempotency store health check failed"
                    );
                }
                metrics().update_health_status(check.is_healthy() && connected);
                if let Some(health) = &health_server {
                    health.set_mqtt_connected(connected);
                    health.set_health_check("idempotency", check).await;
                }
            }
        })
    }

    /// Stop taking deliveries, let in-flight ones settle, then disconnect
    pub async fn shutdown(&mut self) -> Result<(), LifecycleError> {
        info!(worker_id = %self.config.worker.id, "Shutting down worker");
        metrics().set_worker_state("stopping");

        if let Some(handle) = self.health_check_handle.take() {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Health monitor shutdown error: {}", e);
                }
            }
        }

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        for handle in self.worker_handles.drain(..) {
            let abort = handle.abort_handle();
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!("Consumer shutdown error: {}", e),
                Err(_) => {
                    warn!("Consumer did not drain in time; aborting, the broker will redeliver");
                    abort.abort();
                }
            }
        }

        if let Some(transport) = self.running_transport.take() {
            match Arc::try_unwrap(transport) {
                Ok(mut transport) => {
                    if let Err(e) = transport.disconnect().await {
                        warn!("Error disconnecting transport: {}", e);
                    }
                }
                Err(_) => debug!("Transport still shared at shutdown; dropping reference"),
            }
        }

        metrics().set_worker_state("stopped");
        info!("Worker shutdown complete");
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Configuration error")]
    ConfigurationError(#[source] crate::config::ConfigError),
    #[error("Transport error")]
    TransportError(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Initialization error: {0}")]
    InitializationError(String),
}

impl From<crate::config::ConfigError> for LifecycleError {
    fn from(err: crate::config::ConfigError) -> Self {
        LifecycleError::ConfigurationError(err)
    }
}

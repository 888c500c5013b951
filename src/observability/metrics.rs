//! Thread-safe metrics collection
//!
//! Atomic counters for the per-delivery state machine, the idempotency store,
//! the publisher and the MQTT connection, plus a bounded window of processing
//! times for percentiles. Exposed through `/metrics` on the health server.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Processing-time samples kept for percentiles
const MAX_TIMING_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

pub struct MetricsCollector {
    // Delivery state machine
    requests_received: Counter,
    requests_claimed: Counter,
    duplicates: Counter,
    malformed: Counter,
    validation_failures: Counter,
    clarifications: Counter,
    executed: Counter,
    executor_failures: Counter,
    in_flight: AtomicU64,

    // Outcomes at the broker
    acks: Counter,
    rejects: Counter,

    // Publisher
    responses_published: Counter,
    publish_retries: Counter,
    publish_failures: Counter,

    // Idempotency store
    claim_failures_open: Counter,
    claim_failures_closed: Counter,
    commit_failures: Counter,
    release_failures: Counter,

    // Fallback classifier
    classifier_calls: Counter,
    classifier_overrides: Counter,

    // MQTT connection
    mqtt_connected: AtomicBool,
    connection_attempts: Counter,
    connections_established: Counter,
    connection_failures: Counter,
    messages_received: Counter,
    connection_start_time: AtomicU64,

    processing_times: Mutex<Vec<u64>>,

    // Lifecycle
    worker_state: Mutex<String>,
    uptime_start: AtomicU64,
    health_status: AtomicBool,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            requests_received: Counter::default(),
            requests_claimed: Counter::default(),
            duplicates: Counter::default(),
            malformed: Counter::default(),
            validation_failures: Counter::default(),
            clarifications: Counter::default(),
            executed: Counter::default(),
            executor_failures: Counter::default(),
            in_flight: AtomicU64::new(0),
            acks: Counter::default(),
            rejects: Counter::default(),
            responses_published: Counter::default(),
            publish_retries: Counter::default(),
            publish_failures: Counter::default(),
            claim_failures_open: Counter::default(),
            claim_failures_closed: Counter::default(),
            commit_failures: Counter::default(),
            release_failures: Counter::default(),
            classifier_calls: Counter::default(),
            classifier_overrides: Counter::default(),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: Counter::default(),
            connections_established: Counter::default(),
            connection_failures: Counter::default(),
            messages_received: Counter::default(),
            connection_start_time: AtomicU64::new(0),
            processing_times: Mutex::new(Vec::new()),
            worker_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            health_status: AtomicBool::new(true),
        }
    }

    // Delivery state machine
    pub fn request_received(&self) {
        self.requests_received.incr();
    }

    pub fn request_claimed(&self) {
        self.requests_claimed.incr();
    }

    pub fn duplicate_delivery(&self) {
        self.duplicates.incr();
    }

    pub fn malformed_request(&self) {
        self.malformed.incr();
    }

    pub fn validation_failed(&self) {
        self.validation_failures.incr();
    }

    pub fn clarification_returned(&self) {
        self.clarifications.incr();
    }

    pub fn execution_succeeded(&self) {
        self.executed.incr();
    }

    pub fn execution_failed(&self) {
        self.executor_failures.incr();
    }

    pub fn processing_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processing_finished(&self, duration: Duration) {
        // saturating: reset() may run while a delivery is in flight
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        self.record_processing_time(duration);
    }

    fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > MAX_TIMING_SAMPLES {
                times.remove(0);
            }
        }
    }

    pub fn delivery_acked(&self) {
        self.acks.incr();
    }

    pub fn delivery_rejected(&self) {
        self.rejects.incr();
    }

    // Publisher
    pub fn response_published(&self) {
        self.responses_published.incr();
    }

    pub fn publish_retry(&self) {
        self.publish_retries.incr();
    }

    pub fn publish_failed(&self) {
        self.publish_failures.incr();
    }

    // Idempotency store
    pub fn claim_failed_open(&self) {
        self.claim_failures_open.incr();
    }

    pub fn claim_failed_closed(&self) {
        self.claim_failures_closed.incr();
    }

    pub fn commit_failed(&self) {
        self.commit_failures.incr();
    }

    pub fn release_failed(&self) {
        self.release_failures.incr();
    }

    // Fallback classifier
    pub fn classifier_called(&self, changed_outcome: bool) {
        self.classifier_calls.incr();
        if changed_outcome {
            self.classifier_overrides.incr();
        }
    }

    // MQTT
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.incr();
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.incr();
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.incr();
        self.mqtt_connection_lost();
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.incr();
    }

    // Lifecycle
    pub fn set_worker_state(&self, state: &str) {
        if let Ok(mut current) = self.worker_state.lock() {
            *current = state.to_string();
        }
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.requests_received,
            &self.requests_claimed,
            &self.duplicates,
            &self.malformed,
            &self.validation_failures,
            &self.clarifications,
            &self.executed,
            &self.executor_failures,
            &self.acks,
            &self.rejects,
            &self.responses_published,
            &self.publish_retries,
            &self.publish_failures,
            &self.claim_failures_open,
            &self.claim_failures_closed,
            &self.commit_failures,
            &self.release_failures,
            &self.classifier_calls,
            &self.classifier_overrides,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.messages_received,
        ] {
            counter.reset();
        }
        self.in_flight.store(0, Ordering::Relaxed);
        self.mqtt_connection_lost();
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        if let Ok(mut times) = self.processing_times.lock() {
            times.clear();
        }
        self.set_worker_state("initializing");
    }

    fn processing_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.processing_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.processing_time_statistics();
        let connected = self.mqtt_connected.load(Ordering::Relaxed);
        let start = self.connection_start_time.load(Ordering::Relaxed);

        MetricsSnapshot {
            requests: RequestMetrics {
                received: self.requests_received.get(),
                claimed: self.requests_claimed.get(),
                duplicates: self.duplicates.get(),
                malformed: self.malformed.get(),
                validation_failures: self.validation_failures.get(),
                clarifications: self.clarifications.get(),
                executed: self.executed.get(),
                executor_failures: self.executor_failures.get(),
                in_flight: self.in_flight.load(Ordering::Relaxed),
                acks: self.acks.get(),
                rejects: self.rejects.get(),
                avg_processing_time_ms: avg,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
                processing_time_p99_ms: p99,
            },
            publisher: PublisherMetrics {
                published: self.responses_published.get(),
                retries: self.publish_retries.get(),
                failures: self.publish_failures.get(),
            },
            idempotency: IdempotencyMetrics {
                claim_failures_open: self.claim_failures_open.get(),
                claim_failures_closed: self.claim_failures_closed.get(),
                commit_failures: self.commit_failures.get(),
                release_failures: self.release_failures.get(),
            },
            classifier: ClassifierMetrics {
                calls: self.classifier_calls.get(),
                overrides: self.classifier_overrides.get(),
            },
            mqtt: MqttMetrics {
                connected,
                connection_attempts: self.connection_attempts.get(),
                connections_established: self.connections_established.get(),
                connection_failures: self.connection_failures.get(),
                messages_received: self.messages_received.get(),
                connection_duration_seconds: if connected && start > 0 {
                    now.saturating_sub(start)
                } else {
                    0
                },
            },
            lifecycle: LifecycleMetrics {
                current_state: self
                    .worker_state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                healthy: self.health_status.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests: RequestMetrics,
    pub publisher: PublisherMetrics,
    pub idempotency: IdempotencyMetrics,
    pub classifier: ClassifierMetrics,
    pub mqtt: MqttMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct RequestMetrics {
    pub received: u64,
    pub claimed: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub validation_failures: u64,
    pub clarifications: u64,
    pub executed: u64,
    pub executor_failures: u64,
    pub in_flight: u64,
    pub acks: u64,
    pub rejects: u64,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
    pub processing_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct PublisherMetrics {
    pub published: u64,
    pub retries: u64,
    pub failures: u64,
}

#[derive(Debug, Serialize)]
pub struct IdempotencyMetrics {
    pub claim_failures_open: u64,
    pub claim_failures_closed: u64,
    pub commit_failures: u64,
    pub release_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct ClassifierMetrics {
    pub calls: u64,
    pub overrides: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub messages_received: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub healthy: bool,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_request_metrics() {
        let collector = MetricsCollector::new();

        collector.request_received();
        collector.request_claimed();
        collector.processing_started();
        collector.execution_succeeded();
        collector.delivery_acked();
        collector.processing_finished(Duration::from_millis(1500));

        let metrics = collector.get_metrics();
        assert_eq!(metrics.requests.received, 1);
        assert_eq!(metrics.requests.claimed, 1);
        assert_eq!(metrics.requests.executed, 1);
        assert_eq!(metrics.requests.acks, 1);
        assert_eq!(metrics.requests.in_flight, 0);
        assert!(metrics.requests.avg_processing_time_ms > 1400.0);
    }

    #[test]
    fn test_publisher_and_idempotency_metrics() {
        let collector = MetricsCollector::new();

        collector.publish_retry();
        collector.publish_retry();
        collector.publish_failed();
        collector.claim_failed_open();
        collector.commit_failed();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.publisher.retries, 2);
        assert_eq!(metrics.publisher.failures, 1);
        assert_eq!(metrics.idempotency.claim_failures_open, 1);
        assert_eq!(metrics.idempotency.commit_failures, 1);
    }

    #[test]
    fn test_classifier_metrics() {
        let collector = MetricsCollector::new();

        collector.classifier_called(false);
        collector.classifier_called(true);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.classifier.calls, 2);
        assert_eq!(metrics.classifier.overrides, 1);
    }

    #[test]
    fn test_mqtt_metrics() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_attempt();
        collector.mqtt_connection_established();
        collector.mqtt_message_received();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.mqtt.connection_attempts, 1);
        assert_eq!(metrics.mqtt.connections_established, 1);
        assert_eq!(metrics.mqtt.messages_received, 1);
        assert!(metrics.mqtt.connected);

        collector.mqtt_connection_lost();
        assert!(!collector.get_metrics().mqtt.connected);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.request_received();
                        collector.duplicate_delivery();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.requests.received, 1000);
        assert_eq!(metrics.requests.duplicates, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);

        assert!((p50 - 5.5).abs() < 0.1, "P50: expected ~5.5, got {p50}");
        assert!((p95 - 9.5).abs() < 0.1, "P95: expected ~9.5, got {p95}");
        assert_eq!(percentile(&data, 0.0), 1.0);
        assert_eq!(percentile(&data, 100.0), 10.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_processing_time_window_is_bounded() {
        let collector = MetricsCollector::new();

        for i in 0..1500 {
            collector.processing_finished(Duration::from_millis(i));
        }

        let len = collector.processing_times.lock().unwrap().len();
        assert_eq!(len, MAX_TIMING_SAMPLES);
        assert_eq!(collector.get_metrics().requests.in_flight, 0);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.request_received();
        collector.mqtt_connection_established();
        collector.set_worker_state("running");

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.requests.received, 0);
        assert!(!metrics.mqtt.connected);
        assert_eq!(metrics.lifecycle.current_state, "initializing");
    }
}

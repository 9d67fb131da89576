//! MQTT transport listener.
//!
//! Maintains a persistent connection to the broker, subscribes to the
//! configured topic patterns, and appends every inbound message to the
//! shared rotation log.
//!
//! # Connection Lifecycle
//!
//! The rumqttc event loop reconnects on the next poll after a connection
//! error; this listener logs the error, waits a short delay, and keeps
//! polling. Every `ConnAck` (initial connect and each reconnect) re-issues
//! the topic subscriptions. Subscription failures are logged and counted,
//! never fatal to the process.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS, Transport};
use tracing::{debug, info, warn};

use impeller_core::RawRecord;

use crate::error::{Error, Result};
use crate::rotation::RotationLog;

/// Configuration for the broker listener.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker hostname.
    pub host: String,

    /// Broker port.
    pub port: u16,

    /// Optional username for broker authentication.
    pub username: Option<String>,

    /// Optional password for broker authentication.
    pub password: Option<String>,

    /// Enable TLS on the connection.
    pub tls: bool,

    /// Topic patterns to subscribe to. Empty falls back to wildcard-all.
    pub topics: Vec<String>,

    /// Client identifier presented to the broker.
    pub client_id: String,

    /// Keep-alive interval.
    pub keep_alive: Duration,

    /// Delay before re-polling after a connection error.
    pub reconnect_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            tls: false,
            topics: vec!["#".to_string()],
            client_id: "impeller-ingest".to_string(),
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Statistics collected by the listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Messages received and buffered.
    pub messages: usize,

    /// Successful connections, including reconnects.
    pub connects: usize,

    /// Subscriptions that could not be established.
    pub subscribe_failures: usize,
}

struct Counters {
    messages: AtomicUsize,
    connects: AtomicUsize,
    subscribe_failures: AtomicUsize,
}

/// Long-running broker listener feeding the rotation log.
pub struct BrokerListener {
    config: BrokerConfig,
    log: Arc<RotationLog>,
    client: Mutex<Option<AsyncClient>>,
    running: AtomicBool,
    counters: Counters,
}

impl BrokerListener {
    /// Create a new listener over the given rotation log.
    pub fn new(config: BrokerConfig, log: Arc<RotationLog>) -> Self {
        Self {
            config,
            log,
            client: Mutex::new(None),
            running: AtomicBool::new(false),
            counters: Counters {
                messages: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                subscribe_failures: AtomicUsize::new(0),
            },
        }
    }

    /// Whether the listener loop is currently active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current statistics.
    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            messages: self.counters.messages.load(Ordering::Relaxed),
            connects: self.counters.connects.load(Ordering::Relaxed),
            subscribe_failures: self.counters.subscribe_failures.load(Ordering::Relaxed),
        }
    }

    /// Connect to the broker and process messages until [`disconnect`] is
    /// called.
    ///
    /// Connection errors are retried after `reconnect_delay`; they never
    /// terminate the loop.
    ///
    /// [`disconnect`]: Self::disconnect
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Transport("listener already running".to_string()));
        }

        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);

        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user, pass);
        }
        if self.config.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        *self.client.lock() = Some(client.clone());

        info!(
            "Connecting to broker {}:{} ({} topic pattern(s))",
            self.config.host,
            self.config.port,
            self.topic_patterns().len()
        );

        while self.running.load(Ordering::SeqCst) {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.counters.connects.fetch_add(1, Ordering::Relaxed);
                    counter!("broker_connects_total").increment(1);
                    gauge!("broker_connected").set(1.0);
                    info!("Connected to broker {}:{}", self.config.host, self.config.port);
                    self.subscribe_all(&client).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_publish(publish);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    gauge!("broker_connected").set(0.0);
                    warn!("Broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    gauge!("broker_connected").set(0.0);
                    counter!("broker_connection_errors_total").increment(1);
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(
                        "Broker connection error: {e}; retrying in {:?}",
                        self.config.reconnect_delay
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }

        gauge!("broker_connected").set(0.0);
        info!("Broker listener stopped");
        Ok(())
    }

    /// Stop delivery and release the connection.
    ///
    /// Idempotent: calling it on a stopped listener does nothing.
    pub async fn disconnect(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                debug!("Broker disconnect: {e}");
            }
        }
        info!("Broker listener disconnected");
    }

    /// The configured topic patterns, falling back to wildcard-all.
    fn topic_patterns(&self) -> Vec<String> {
        let patterns: Vec<String> = self
            .config
            .topics
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if patterns.is_empty() {
            vec!["#".to_string()]
        } else {
            patterns
        }
    }

    /// Subscribe to every configured pattern. Failures are logged, not fatal.
    async fn subscribe_all(&self, client: &AsyncClient) {
        for topic in self.topic_patterns() {
            match client.subscribe(&topic, QoS::AtLeastOnce).await {
                Ok(()) => info!("Subscribed to topic: {topic}"),
                Err(e) => {
                    self.counters.subscribe_failures.fetch_add(1, Ordering::Relaxed);
                    counter!("broker_subscribe_failures_total").increment(1);
                    warn!("Failed to subscribe to {topic}: {e}");
                }
            }
        }
    }

    /// Buffer an inbound message and run the rotation check.
    fn handle_publish(&self, publish: Publish) {
        let record = record_from_publish(&publish);
        debug!(
            "Message on {}: {} bytes (qos {})",
            record.topic,
            publish.payload.len(),
            record.qos
        );

        self.log.append(record);
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        counter!("broker_messages_total").increment(1);

        // Rotation failures must not take down message delivery; the
        // records stay buffered for the next attempt.
        if let Err(e) = self.log.check_rotation() {
            warn!("Rotation failed, keeping records buffered: {e}");
        }
    }
}

/// Build a raw record from an inbound publish packet.
fn record_from_publish(publish: &Publish) -> RawRecord {
    RawRecord {
        captured_at: Utc::now(),
        topic: publish.topic.clone(),
        payload: String::from_utf8_lossy(&publish.payload).into_owned(),
        qos: publish.qos as u8,
        retain: publish.retain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use impeller_core::SourceRegistry;
    use crate::rotation::RotationConfig;
    use tempfile::TempDir;

    fn test_listener(topics: Vec<String>) -> (BrokerListener, TempDir) {
        let tmp = TempDir::new().unwrap();
        let log = RotationLog::new(
            RotationConfig {
                log_root: tmp.path().to_path_buf(),
                ..Default::default()
            },
            SourceRegistry::default(),
        )
        .unwrap();
        let config = BrokerConfig {
            topics,
            ..Default::default()
        };
        (BrokerListener::new(config, Arc::new(log)), tmp)
    }

    #[test]
    fn test_record_from_publish() {
        let publish = Publish::new(
            "sensors/ITU-693/EngRPM",
            QoS::AtLeastOnce,
            r#"{"ITU-693":{"P1":{"RPM":1500}}}"#,
        );
        let record = record_from_publish(&publish);
        assert_eq!(record.topic, "sensors/ITU-693/EngRPM");
        assert_eq!(record.qos, 1);
        assert!(!record.retain);
        assert!(record.payload.contains("RPM"));
    }

    #[test]
    fn test_topic_patterns_fallback_to_wildcard() {
        let (listener, _tmp) = test_listener(vec![]);
        assert_eq!(listener.topic_patterns(), vec!["#".to_string()]);

        let (listener, _tmp) = test_listener(vec![" ".to_string(), String::new()]);
        assert_eq!(listener.topic_patterns(), vec!["#".to_string()]);
    }

    #[test]
    fn test_topic_patterns_trimmed() {
        let (listener, _tmp) = test_listener(vec![" sensors/# ".to_string()]);
        assert_eq!(listener.topic_patterns(), vec!["sensors/#".to_string()]);
    }

    #[test]
    fn test_handle_publish_buffers_record() {
        let (listener, _tmp) = test_listener(vec![]);
        let publish = Publish::new(
            "sensors/ITU-693/EngRPM",
            QoS::AtMostOnce,
            r#"{"ITU-693":{"P1":{"RPM":1500}}}"#,
        );

        listener.handle_publish(publish);

        assert_eq!(listener.log.buffered(), 1);
        assert_eq!(listener.stats().messages, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_when_stopped() {
        let (listener, _tmp) = test_listener(vec![]);
        assert!(!listener.is_running());
        listener.disconnect().await;
        listener.disconnect().await;
        assert!(!listener.is_running());
    }
}

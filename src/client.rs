//! High-level client facade over one connection.
//!
//! [`MqClient`] orchestrates the engine against a single broker
//! connection: it drives the login handshake, opens one channel, declares
//! the configured exchange and queue and binds them (in that fixed order)
//! when the channel becomes ready, publishes, consumes, and surfaces
//! connectivity transitions to the embedding application.
//!
//! The embedder owns the transport and its event loop: it calls
//! [`MqClient::feed`] with received bytes and
//! [`MqClient::transport_failed`] when the link drops. Every error path
//! records a message retrievable via [`MqClient::last_error`], overwritten
//! by the most recent failure.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;

use crate::config::{MqInfo, Roles};
use crate::connection::Connection;
use crate::error::{MqError, Result};
use crate::heartbeat::HeartbeatMonitor;
use crate::transport::Transport;

/// The single channel number the facade uses.
const CHANNEL_ID: u16 = 1;

type ConnectionErrorFn = Box<dyn FnMut() + Send>;
type DeliveredFn = Box<dyn FnMut(Bytes) + Send>;

struct ClientInner {
    info: MqInfo,
    heartbeat_secs: u16,
    /// Roles as configured; restored when the client is restarted.
    configured_roles: Roles,
    /// Effective roles; demoted to none on fatal errors.
    roles: Roles,
    last_error: Option<String>,
    consecutive_failures: u32,
    connection: Option<Arc<Mutex<Connection>>>,
    monitor: HeartbeatMonitor,
    on_connection_error: Option<ConnectionErrorFn>,
    on_message_delivered: Option<DeliveredFn>,
}

/// Client facade owning one logical broker connection.
pub struct MqClient {
    inner: Arc<Mutex<ClientInner>>,
}

impl MqClient {
    /// Create a client for the given endpoint, roles, and heartbeat
    /// interval in seconds.
    ///
    /// Non-consumer roles run without heartbeats: the interval is forced
    /// to zero.
    #[must_use]
    pub fn new(info: MqInfo, roles: Roles, heartbeat_secs: u16) -> Self {
        let heartbeat_secs = if roles.is_consumer() { heartbeat_secs } else { 0 };
        Self {
            inner: Arc::new(Mutex::new(ClientInner {
                info,
                heartbeat_secs,
                configured_roles: roles,
                roles,
                last_error: None,
                consecutive_failures: 0,
                connection: None,
                monitor: HeartbeatMonitor::new(),
                on_connection_error: None,
                on_message_delivered: None,
            })),
        }
    }

    /// Register the callback fired when the connection fails or the
    /// server closes it.
    pub fn on_connection_error(&self, callback: impl FnMut() + Send + 'static) {
        self.lock().on_connection_error = Some(Box::new(callback));
    }

    /// Register the callback fired with the body of each consumed message.
    pub fn on_message_delivered(&self, callback: impl FnMut(Bytes) + Send + 'static) {
        self.lock().on_message_delivered = Some(Box::new(callback));
    }

    /// Begin the handshake over an established transport and wire the
    /// declare-exchange → declare-queue → bind sequence to run once the
    /// channel is ready.
    ///
    /// The transport must already be connected; waiting for that is the
    /// embedder's job.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Config`] for invalid configuration or a missing
    /// role, and a transport error if the greeting cannot be written.
    pub fn start(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let (info, roles, heartbeat_secs) = {
            let mut inner = self.lock();
            inner.monitor.stop();
            inner.connection = None;
            inner.roles = inner.configured_roles;
            if inner.roles.is_none() {
                let error = MqError::config("cannot start with no roles configured");
                inner.last_error = Some(error.to_string());
                return Err(error);
            }
            if let Err(error) = inner.info.validate() {
                inner.last_error = Some(error.to_string());
                return Err(error);
            }
            (inner.info.clone(), inner.roles, inner.heartbeat_secs)
        };

        let connection = Connection::start(
            transport,
            info.login.clone(),
            info.vhost.clone(),
            heartbeat_secs,
        )
        .inspect_err(|error| {
            self.lock().last_error = Some(error.to_string());
        })?;

        let connection = Arc::new(Mutex::new(connection));
        let weak_inner = Arc::downgrade(&self.inner);
        let weak_connection = Arc::downgrade(&connection);

        // Nothing else can reach this connection yet, so wiring callbacks
        // under its lock cannot contend.
        {
            let mut conn = connection.lock().expect("connection lock");

            let inner_for_open = weak_inner.clone();
            conn.set_on_open(move |tuning| {
                let Some(inner) = inner_for_open.upgrade() else {
                    return;
                };
                let mut inner = inner.lock().expect("client lock");
                if inner.roles.is_consumer() && tuning.heartbeat != 0 {
                    let interval = Duration::from_secs(u64::from(tuning.heartbeat));
                    inner.monitor.start(interval, weak_connection.clone());
                }
            });

            let inner_for_failure = weak_inner.clone();
            conn.set_on_failure(move |reason| {
                report_failure(&inner_for_failure, reason);
            });

            let channel = conn
                .open_channel(CHANNEL_ID, roles)
                .inspect_err(|error| {
                    self.lock().last_error = Some(error.to_string());
                })?;

            let inner_for_ready = weak_inner.clone();
            let setup = info.clone();
            channel.set_on_ready(move |channel| {
                let on_error = |label: &'static str| {
                    let weak = inner_for_ready.clone();
                    move |reason: &str| {
                        report_failure(&weak, &format!("{label}: {reason}"));
                    }
                };
                let _ = channel
                    .declare_exchange(&setup.exchange, setup.exchange_kind, true)
                    .on_error(on_error("declare exchange"));
                let _ = channel
                    .declare_queue(&setup.queue, true)
                    .on_error(on_error("declare queue"));
                let _ = channel
                    .bind_queue(&setup.exchange, &setup.queue, setup.effective_binding_key())
                    .on_error(on_error("bind queue"));
                if let Some(inner) = inner_for_ready.upgrade() {
                    inner.lock().expect("client lock").consecutive_failures = 0;
                }
            });

            let inner_for_error = weak_inner;
            channel.set_on_error(move |_, reason| {
                report_failure(&inner_for_error, &format!("channel error: {reason}"));
            });
        }

        self.lock().connection = Some(connection);
        Ok(())
    }

    /// Drain received bytes into the connection's parse loop.
    ///
    /// Returns the number of bytes consumed. The embedder retains the
    /// unconsumed tail and calls again once at least the connection's next
    /// expected byte count has arrived.
    ///
    /// # Errors
    ///
    /// Returns the fatal error when the stream is malformed; the
    /// connection is failed and the error recorded.
    pub fn feed(&self, bytes: &[u8]) -> Result<usize> {
        let connection = self.connection()?;
        let mut conn = connection.lock().expect("connection lock");

        let mut consumed = 0;
        loop {
            let expected = conn.expected();
            if expected == 0 || bytes.len() - consumed < expected {
                break;
            }
            match conn.parse(&bytes[consumed..]) {
                Ok(0) => break,
                Ok(n) => consumed += n,
                Err(error) => {
                    drop(conn);
                    self.lock().last_error = Some(format!("parse failed: {error}"));
                    return Err(error);
                }
            }
        }
        Ok(consumed)
    }

    /// Publish `message` to the configured exchange.
    ///
    /// May be called from any thread; the connection lock serialises
    /// concurrent publishers so frame bytes never interleave.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Role`] without sending bytes when the publisher
    /// role is missing, [`MqError::ConnectionClosed`] when no connection is
    /// active, and [`MqError::Operation`] when the channel refuses the
    /// publish.
    pub fn publish(&self, message: &[u8]) -> Result<()> {
        let (exchange, routing_key) = {
            let mut inner = self.lock();
            if !inner.roles.is_publisher() {
                let error = MqError::Role {
                    required: "publisher",
                };
                inner.last_error = Some(format!("publish: {error}"));
                return Err(error);
            }
            (
                inner.info.exchange.clone(),
                inner.info.effective_routing_key().to_string(),
            )
        };

        let connection = self.connection()?;
        let mut conn = connection.lock().expect("connection lock");
        let Some(channel) = conn.channel_mut(CHANNEL_ID) else {
            drop(conn);
            self.lock().last_error = Some("publish: channel is not open".into());
            return Err(MqError::ChannelClosed);
        };

        let deferred = channel.publish(&exchange, &routing_key, Bytes::copy_from_slice(message));
        if let Some(reason) = deferred.birth_failure() {
            drop(conn);
            self.lock().last_error = Some(format!("publish: {reason}"));
            return Err(MqError::Operation { reason });
        }
        Ok(())
    }

    /// Start consuming from the configured queue.
    ///
    /// Each complete message fires the
    /// [`on_message_delivered`](Self::on_message_delivered) callback and is
    /// acknowledged automatically afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Role`] without sending bytes when the consumer
    /// role is missing, [`MqError::ConnectionClosed`] when no connection is
    /// active, and [`MqError::Operation`] when the channel refuses the
    /// subscription.
    pub fn start_consuming(&self) -> Result<()> {
        let queue = {
            let mut inner = self.lock();
            if !inner.roles.is_consumer() {
                let error = MqError::Role {
                    required: "consumer",
                };
                inner.last_error = Some(format!("consume: {error}"));
                return Err(error);
            }
            inner.info.queue.clone()
        };

        let weak_inner = Arc::downgrade(&self.inner);
        let weak_for_error = weak_inner.clone();

        let connection = self.connection()?;
        let mut conn = connection.lock().expect("connection lock");
        let Some(channel) = conn.channel_mut(CHANNEL_ID) else {
            drop(conn);
            self.lock().last_error = Some("consume: channel is not open".into());
            return Err(MqError::ChannelClosed);
        };

        let consumer = channel
            .consume(&queue)
            .on_received(move |delivery| {
                deliver_to_embedder(&weak_inner, delivery.body.clone());
            })
            .on_error(move |reason| {
                report_failure(&weak_for_error, &format!("consume: {reason}"));
            });

        if let Some(reason) = consumer.deferred().birth_failure() {
            drop(conn);
            self.lock().last_error = Some(format!("consume: {reason}"));
            return Err(MqError::Operation { reason });
        }
        Ok(())
    }

    /// Cap unacknowledged deliveries at `prefetch`.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::ConnectionClosed`] when no connection is active
    /// and [`MqError::Operation`] when the channel refuses the request.
    pub fn set_qos(&self, prefetch: u16) -> Result<()> {
        self.with_channel("set qos", |channel| channel.set_qos(prefetch))
    }

    /// Drop every message waiting in the configured queue.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::ConnectionClosed`] when no connection is active
    /// and [`MqError::Operation`] when the channel refuses the request.
    pub fn purge_queue(&self) -> Result<()> {
        let queue = self.lock().info.queue.clone();
        self.with_channel("purge queue", move |channel| channel.purge_queue(&queue))
    }

    /// Close the channel and connection and stop the heartbeat monitor.
    pub fn release(&self) {
        let connection = {
            let mut inner = self.lock();
            inner.monitor.stop();
            inner.connection.take()
        };
        if let Some(connection) = connection {
            let mut conn = connection.lock().expect("connection lock");
            if let Some(channel) = conn.channel_mut(CHANNEL_ID) {
                if channel.usable() {
                    let _ = channel.close();
                }
            }
            conn.close();
        }
    }

    /// Forward a transport failure reported by the embedder's event loop.
    ///
    /// Fails the connection, fires the connection-error callback, and
    /// releases the instance.
    pub fn transport_failed(&self, reason: &str) {
        let connection = {
            let inner = self.lock();
            inner.connection.clone()
        };
        if let Some(connection) = connection {
            connection
                .lock()
                .expect("connection lock")
                .fail(&format!("transport failed: {reason}"));
        }
        self.lock().last_error = Some(format!("transport failed: {reason}"));
        self.release();
    }

    /// The most recent error message, overwritten on every new failure.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Consecutive failure count; reset when the channel comes up.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Effective roles; none after a fatal error until restarted.
    #[must_use]
    pub fn roles(&self) -> Roles {
        self.lock().roles
    }

    fn with_channel(
        &self,
        label: &'static str,
        op: impl FnOnce(&mut crate::channel::Channel) -> crate::deferred::Deferred,
    ) -> Result<()> {
        let connection = self.connection()?;
        let mut conn = connection.lock().expect("connection lock");
        let Some(channel) = conn.channel_mut(CHANNEL_ID) else {
            drop(conn);
            self.lock().last_error = Some(format!("{label}: channel is not open"));
            return Err(MqError::ChannelClosed);
        };
        let weak = Arc::downgrade(&self.inner);
        let deferred = op(channel).on_error(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.lock().expect("client lock").last_error = Some(reason.to_string());
            }
        });
        if let Some(reason) = deferred.birth_failure() {
            drop(conn);
            self.lock().last_error = Some(format!("{label}: {reason}"));
            return Err(MqError::Operation { reason });
        }
        Ok(())
    }

    fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        self.lock()
            .connection
            .clone()
            .ok_or(MqError::ConnectionClosed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientInner> {
        self.inner.lock().expect("client lock")
    }
}

/// Record a failure, bump the counter, demote the roles, and fire the
/// connection-error callback outside the lock.
fn report_failure(weak: &Weak<Mutex<ClientInner>>, reason: &str) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let callback = {
        let mut inner = inner.lock().expect("client lock");
        inner.last_error = Some(reason.to_string());
        inner.consecutive_failures += 1;
        inner.roles = Roles::NONE;
        tracing::error!(
            reason,
            count = inner.consecutive_failures,
            "connectivity failure"
        );
        inner.on_connection_error.take()
    };
    if let Some(mut callback) = callback {
        callback();
        let mut inner = inner.lock().expect("client lock");
        if inner.on_connection_error.is_none() {
            inner.on_connection_error = Some(callback);
        }
    }
}

/// Hand a delivered body to the embedder's callback outside the lock.
fn deliver_to_embedder(weak: &Weak<Mutex<ClientInner>>, body: Bytes) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let callback = inner
        .lock()
        .expect("client lock")
        .on_message_delivered
        .take();
    if let Some(mut callback) = callback {
        callback(body);
        let mut inner = inner.lock().expect("client lock");
        if inner.on_message_delivered.is_none() {
            inner.on_message_delivered = Some(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeKind, Login};
    use crate::transport::MockTransport;

    fn info() -> MqInfo {
        MqInfo {
            host: "localhost".into(),
            port: 5672,
            login: Login::new("guest", "guest"),
            vhost: "/".into(),
            exchange: "orders".into(),
            exchange_kind: ExchangeKind::Direct,
            queue: "orders.new".into(),
            routing_key: "new".into(),
            binding_key: "new".into(),
        }
    }

    #[test]
    fn publish_without_publisher_role_fails_without_io() {
        let client = MqClient::new(info(), Roles::CONSUMER, 30);
        let transport = Arc::new(MockTransport::new());
        client
            .start(Arc::clone(&transport) as Arc<dyn Transport>)
            .expect("start");
        transport.take_sent();

        let error = client.publish(b"message").expect_err("no publisher role");
        assert!(matches!(error, MqError::Role { required: "publisher" }));
        assert!(transport.sent().is_empty());
        assert!(client.last_error().expect("recorded").contains("publisher"));
    }

    #[test]
    fn consume_without_consumer_role_fails_without_io() {
        let client = MqClient::new(info(), Roles::PUBLISHER, 30);
        let transport = Arc::new(MockTransport::new());
        client
            .start(Arc::clone(&transport) as Arc<dyn Transport>)
            .expect("start");
        transport.take_sent();

        let error = client.start_consuming().expect_err("no consumer role");
        assert!(matches!(error, MqError::Role { required: "consumer" }));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn non_consumer_roles_run_without_heartbeats() {
        let client = MqClient::new(info(), Roles::PUBLISHER, 30);
        assert_eq!(client.lock().heartbeat_secs, 0);

        let client = MqClient::new(info(), Roles::BOTH, 30);
        assert_eq!(client.lock().heartbeat_secs, 30);
    }

    #[test]
    fn start_rejects_missing_roles_and_bad_config() {
        let client = MqClient::new(info(), Roles::NONE, 0);
        let transport = Arc::new(MockTransport::new());
        let error = client
            .start(Arc::clone(&transport) as Arc<dyn Transport>)
            .expect_err("no roles");
        assert!(matches!(error, MqError::Config { .. }));
        assert!(transport.sent().is_empty());

        let mut bad = info();
        bad.exchange = String::new();
        let client = MqClient::new(bad, Roles::BOTH, 0);
        assert!(client.start(Arc::new(MockTransport::new()) as Arc<dyn Transport>).is_err());
        assert!(client.last_error().expect("recorded").contains("exchange"));
    }

    #[test]
    fn operations_before_start_report_connection_closed() {
        let client = MqClient::new(info(), Roles::BOTH, 0);
        assert!(matches!(
            client.publish(b"m"),
            Err(MqError::ConnectionClosed)
        ));
        assert!(matches!(client.feed(&[1, 2, 3]), Err(MqError::ConnectionClosed)));
    }

    #[test]
    fn last_error_is_overwritten_not_accumulated() {
        let client = MqClient::new(info(), Roles::CONSUMER, 0);
        let transport = Arc::new(MockTransport::new());
        client
            .start(Arc::clone(&transport) as Arc<dyn Transport>)
            .expect("start");

        let _ = client.publish(b"one").expect_err("role error");
        let first = client.last_error().expect("first error");
        assert!(first.contains("publish"));

        // a later failure replaces the message instead of appending
        let garbage = [0x42u8, 0, 0, 0, 0, 0, 0, 0];
        let _ = client.feed(&garbage).expect_err("malformed stream");
        let second = client.last_error().expect("second error");
        assert!(second.contains("parse failed"));
        assert_ne!(first, second);
    }

    #[test]
    fn release_without_start_is_harmless() {
        let client = MqClient::new(info(), Roles::BOTH, 0);
        client.release();
        client.transport_failed("socket reset");
        assert!(client.last_error().expect("recorded").contains("socket reset"));
    }
}

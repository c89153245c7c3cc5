//! Channel state machine and request dispatch.
//!
//! A [`Channel`] is a lightweight virtual connection multiplexed over the
//! physical one. It owns the table of in-flight requests awaiting server
//! replies, the consumer reassemblers keyed by consumer tag, and the
//! channel-level ready/error hooks. Replies for synchronous methods arrive
//! in the order the requests were issued, so the pending table is a FIFO: a
//! reply that does not match the front entry is a protocol violation and
//! puts the channel into the error state.
//!
//! Request-style operations never block and never fire callbacks from
//! within the issuing call: when an operation cannot be sent the returned
//! handle is born failed and rejected on the next dispatch pass.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use crate::config::{ExchangeKind, Roles};
use crate::consumer::{AckPolicy, DeferredConsumer, Reassembler};
use crate::deferred::Deferred;
use crate::error::{MqError, Result};
use crate::frame::{ClassMethod, Frame, FrameType};
use crate::method;
use crate::outbound::FrameSink;

/// Lifecycle of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// `channel.open` sent, waiting for the broker's confirmation.
    Opening,
    /// Open with no requests in flight.
    Ready,
    /// Open with at least one request awaiting its reply.
    Busy,
    /// `channel.close` sent, waiting for `channel.close-ok`.
    Closing,
    /// Closed cleanly.
    Closed,
    /// Failed; no further operations are possible.
    Error,
}

/// Stored state; `Busy` is derived from the pending table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stored {
    Opening,
    Ready,
    Closing,
    Closed,
    Error,
}

struct Pending {
    expects: ClassMethod,
    deferred: Deferred,
    consumer: Option<DeferredConsumer>,
}

enum Scheduled {
    Resolve(Deferred, Bytes),
    Reject(Deferred, String),
}

type ReadyHook = Box<dyn FnOnce(&mut Channel) + Send>;
type ErrorHook = Box<dyn FnOnce(&mut Channel, &str) + Send>;

/// One logical channel and its in-flight request state.
pub struct Channel {
    id: u16,
    sink: FrameSink,
    roles: Roles,
    state: Stored,
    pending: VecDeque<Pending>,
    scheduled: Vec<Scheduled>,
    consumers: HashMap<String, Reassembler>,
    /// Consumer tag the next header/body frames belong to.
    current_delivery: Option<String>,
    last_delivery_tag: u64,
    on_ready: Option<ReadyHook>,
    on_error: Option<ErrorHook>,
}

impl Channel {
    /// Create the channel and send `channel.open`. While the connection
    /// handshake is still running the frame is held back and flushed when
    /// the connection opens.
    pub(crate) fn open(id: u16, sink: FrameSink, roles: Roles) -> Result<Self> {
        sink.send(Frame::method(id, method::channel_open()))?;
        Ok(Self {
            id,
            sink,
            roles,
            state: Stored::Opening,
            pending: VecDeque::new(),
            scheduled: Vec::new(),
            consumers: HashMap::new(),
            current_delivery: None,
            last_delivery_tag: 0,
            on_ready: None,
            on_error: None,
        })
    }

    /// Channel number within the connection.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        match self.state {
            Stored::Opening => ChannelState::Opening,
            Stored::Ready if self.pending.is_empty() => ChannelState::Ready,
            Stored::Ready => ChannelState::Busy,
            Stored::Closing => ChannelState::Closing,
            Stored::Closed => ChannelState::Closed,
            Stored::Error => ChannelState::Error,
        }
    }

    /// Whether operations may still be issued.
    #[must_use]
    pub fn usable(&self) -> bool {
        matches!(self.state, Stored::Opening | Stored::Ready)
    }

    /// Register the hook fired once when the channel becomes ready.
    pub fn set_on_ready(&mut self, hook: impl FnOnce(&mut Channel) + Send + 'static) {
        self.on_ready = Some(Box::new(hook));
    }

    /// Register the hook fired once if the channel fails.
    pub fn set_on_error(&mut self, hook: impl FnOnce(&mut Channel, &str) + Send + 'static) {
        self.on_error = Some(Box::new(hook));
    }

    // -----------------------------------------------------------------------
    // Request-style operations
    // -----------------------------------------------------------------------

    /// Declare an exchange (durable by default at the facade level).
    pub fn declare_exchange(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Deferred {
        if exchange.is_empty() {
            return self.schedule_failed("exchange name is empty");
        }
        self.request(
            method::exchange_declare(exchange, kind.as_str(), durable),
            ClassMethod::EXCHANGE_DECLARE_OK,
        )
    }

    /// Declare a queue.
    pub fn declare_queue(&mut self, queue: &str, durable: bool) -> Deferred {
        if queue.is_empty() {
            return self.schedule_failed("queue name is empty");
        }
        self.request(
            method::queue_declare(queue, durable),
            ClassMethod::QUEUE_DECLARE_OK,
        )
    }

    /// Bind a queue to an exchange under a binding key.
    pub fn bind_queue(&mut self, exchange: &str, queue: &str, key: &str) -> Deferred {
        if exchange.is_empty() || queue.is_empty() {
            return self.schedule_failed("exchange or queue name is empty");
        }
        self.request(
            method::queue_bind(exchange, queue, key),
            ClassMethod::QUEUE_BIND_OK,
        )
    }

    /// Cap unacknowledged deliveries at `prefetch` messages.
    pub fn set_qos(&mut self, prefetch: u16) -> Deferred {
        self.request(method::basic_qos(prefetch), ClassMethod::BASIC_QOS_OK)
    }

    /// Drop every message currently sitting in `queue`.
    pub fn purge_queue(&mut self, queue: &str) -> Deferred {
        if queue.is_empty() {
            return self.schedule_failed("queue name is empty");
        }
        self.request(method::queue_purge(queue), ClassMethod::QUEUE_PURGE_OK)
    }

    /// Publish `body` to `exchange` under `routing_key`.
    ///
    /// The broker sends no reply; the returned handle resolves on the next
    /// dispatch pass once the frames are written. Requires the publisher
    /// role. The body is split across frames at the negotiated size.
    pub fn publish(&mut self, exchange: &str, routing_key: &str, body: Bytes) -> Deferred {
        if !self.roles.is_publisher() {
            return self.schedule_failed("publish requires the publisher role");
        }
        if !self.usable() {
            return self.schedule_failed("channel is not usable");
        }

        let deferred = Deferred::new();
        let result = self.send_publish_frames(exchange, routing_key, &body);
        match result {
            Ok(()) => {
                self.scheduled
                    .push(Scheduled::Resolve(deferred.clone(), Bytes::new()));
                deferred
            }
            Err(error) => self.schedule_failed(error.to_string()),
        }
    }

    fn send_publish_frames(&mut self, exchange: &str, routing_key: &str, body: &Bytes) -> Result<()> {
        self.sink.send(Frame::method(
            self.id,
            method::basic_publish(exchange, routing_key),
        ))?;
        let header = method::ContentHeader::for_publish(body.len() as u64);
        self.sink.send(Frame::header(self.id, header.encode()))?;

        let capacity = self.sink.body_capacity();
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + capacity).min(body.len());
            self.sink.send(Frame::body(self.id, body.slice(offset..end)))?;
            offset = end;
        }
        Ok(())
    }

    /// Start consuming from `queue` in explicit-acknowledgement mode.
    ///
    /// Requires the consumer role. Register delivery callbacks on the
    /// returned handle before the broker can confirm the subscription,
    /// i.e. fluently on the same statement.
    pub fn consume(&mut self, queue: &str) -> DeferredConsumer {
        if !self.roles.is_consumer() {
            return DeferredConsumer::new(
                self.schedule_failed("consume requires the consumer role"),
            );
        }
        if queue.is_empty() {
            return DeferredConsumer::new(self.schedule_failed("queue name is empty"));
        }
        if !self.usable() {
            return DeferredConsumer::new(self.schedule_failed("channel is not usable"));
        }

        let deferred = Deferred::new();
        match self.sink.send(Frame::method(self.id, method::basic_consume(queue))) {
            Ok(()) => {
                let consumer = DeferredConsumer::new(deferred.clone());
                self.pending.push_back(Pending {
                    expects: ClassMethod::BASIC_CONSUME_OK,
                    deferred,
                    consumer: Some(consumer.clone()),
                });
                consumer
            }
            Err(error) => DeferredConsumer::new(self.schedule_failed(error.to_string())),
        }
    }

    /// Acknowledge a delivered message by its delivery tag.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::ChannelClosed`] when the channel is unusable, or
    /// a transport error if the frame cannot be written.
    pub fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        if !self.usable() {
            return Err(MqError::ChannelClosed);
        }
        self.sink
            .send(Frame::method(self.id, method::basic_ack(delivery_tag)))
    }

    /// Close the channel. Operations still awaiting replies are rejected
    /// immediately, in the order they were issued.
    pub fn close(&mut self) -> Deferred {
        if !self.usable() {
            return self.schedule_failed("channel is not usable");
        }

        for entry in self.pending.drain(..) {
            entry.deferred.reject("channel closed");
        }

        let deferred = Deferred::new();
        let close_payload = method::close(ClassMethod::CHANNEL_CLOSE, 200, "OK");
        match self.sink.send(Frame::method(self.id, close_payload)) {
            Ok(()) => {
                self.state = Stored::Closing;
                self.pending.push_back(Pending {
                    expects: ClassMethod::CHANNEL_CLOSE_OK,
                    deferred: deferred.clone(),
                    consumer: None,
                });
                deferred
            }
            Err(error) => self.schedule_failed(error.to_string()),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    /// Route one decoded frame into the channel.
    ///
    /// Protocol violations local to this channel transition it to the
    /// error state and are handled here; only malformed bytes, which mean
    /// the whole stream is corrupt, propagate upward.
    pub(crate) fn handle_frame(&mut self, frame: &Frame) -> Result<()> {
        if matches!(self.state, Stored::Closed | Stored::Error) {
            tracing::debug!(channel = self.id, "frame for finished channel dropped");
            return Ok(());
        }
        match frame.frame_type {
            FrameType::Method => self.handle_method(frame),
            FrameType::Header => {
                let header = method::ContentHeader::decode(&frame.payload)?;
                self.route_header(&header);
                Ok(())
            }
            FrameType::Body => {
                self.route_body(&frame.payload);
                Ok(())
            }
            FrameType::Heartbeat => {
                // heartbeats live on channel 0; tolerated here as a no-op
                Ok(())
            }
        }
    }

    fn handle_method(&mut self, frame: &Frame) -> Result<()> {
        let cm = frame.class_method()?;
        let args = &frame.payload[4..];

        match cm {
            ClassMethod::CHANNEL_OPEN_OK => {
                self.state = Stored::Ready;
                if let Some(hook) = self.on_ready.take() {
                    hook(self);
                }
                Ok(())
            }
            ClassMethod::CHANNEL_CLOSE => {
                let close = method::parse_close(args)?;
                let _ = self
                    .sink
                    .send(Frame::method(self.id, method::close_ok(ClassMethod::CHANNEL_CLOSE_OK)));
                self.fail(&format!(
                    "server closed channel: {} {}",
                    close.reply_code, close.reply_text
                ));
                Ok(())
            }
            ClassMethod::CHANNEL_CLOSE_OK => {
                self.state = Stored::Closed;
                if let Some(entry) = self.pending.pop_front() {
                    if entry.expects == ClassMethod::CHANNEL_CLOSE_OK {
                        entry.deferred.resolve(Bytes::new());
                    } else {
                        entry.deferred.reject("channel closed");
                    }
                }
                self.consumers.clear();
                Ok(())
            }
            ClassMethod::BASIC_DELIVER => {
                let deliver = method::parse_deliver(args)?;
                self.route_deliver(deliver);
                Ok(())
            }
            ClassMethod::BASIC_CONSUME_OK => {
                let tag = method::parse_consume_ok(args)?;
                self.finish_consume(&tag);
                Ok(())
            }
            ClassMethod::EXCHANGE_DECLARE_OK
            | ClassMethod::QUEUE_DECLARE_OK
            | ClassMethod::QUEUE_BIND_OK
            | ClassMethod::QUEUE_PURGE_OK
            | ClassMethod::BASIC_QOS_OK => {
                self.finish_request(cm, frame.payload.slice(4..));
                Ok(())
            }
            other => {
                if self.state == Stored::Closing {
                    tracing::debug!(channel = self.id, method = %other, "late reply ignored while closing");
                } else {
                    self.fail(&format!("unexpected method {other}"));
                }
                Ok(())
            }
        }
    }

    /// Resolve the front pending request with the reply arguments.
    fn finish_request(&mut self, cm: ClassMethod, args: Bytes) {
        if self.state == Stored::Closing {
            tracing::debug!(channel = self.id, method = %cm, "late reply ignored while closing");
            return;
        }
        match self.pending.pop_front() {
            Some(entry) if entry.expects == cm => entry.deferred.resolve(args),
            Some(entry) => {
                entry.deferred.reject("out-of-order reply");
                self.fail(&format!("reply {cm} did not match the oldest pending request"));
            }
            None => self.fail(&format!("reply {cm} with no pending request")),
        }
    }

    fn finish_consume(&mut self, tag: &str) {
        if self.state == Stored::Closing {
            return;
        }
        match self.pending.pop_front() {
            Some(entry) if entry.expects == ClassMethod::BASIC_CONSUME_OK => {
                if let Some(consumer) = entry.consumer {
                    let (callbacks, ack_policy) = consumer.take_callbacks();
                    self.consumers.insert(
                        tag.to_string(),
                        Reassembler::new(tag.to_string(), ack_policy, callbacks),
                    );
                }
                entry.deferred.resolve(Bytes::copy_from_slice(tag.as_bytes()));
            }
            Some(entry) => {
                entry.deferred.reject("out-of-order reply");
                self.fail("consume-ok did not match the oldest pending request");
            }
            None => self.fail("consume-ok with no pending request"),
        }
    }

    fn route_deliver(&mut self, deliver: method::Deliver) {
        if self.state == Stored::Closing {
            return;
        }
        if deliver.delivery_tag <= self.last_delivery_tag {
            tracing::warn!(
                channel = self.id,
                tag = deliver.delivery_tag,
                last = self.last_delivery_tag,
                "delivery tag did not increase"
            );
        }
        self.last_delivery_tag = deliver.delivery_tag;

        let tag = deliver.consumer_tag.clone();
        let Some(reassembler) = self.consumers.get_mut(&tag) else {
            self.fail(&format!("delivery for unknown consumer {tag}"));
            return;
        };
        match reassembler.begin(deliver) {
            Ok(()) => self.current_delivery = Some(tag),
            Err(error) => self.fail(&error.to_string()),
        }
    }

    fn route_header(&mut self, header: &method::ContentHeader) {
        if self.state == Stored::Closing {
            return;
        }
        let Some(tag) = self.current_delivery.clone() else {
            self.fail("content header without a delivery in progress");
            return;
        };
        let Some(reassembler) = self.consumers.get_mut(&tag) else {
            self.fail(&format!("content header for unknown consumer {tag}"));
            return;
        };
        match reassembler.header(header) {
            Ok(Some(delivery)) => self.complete_delivery(&tag, delivery.delivery_tag),
            Ok(None) => {}
            Err(error) => self.fail(&error.to_string()),
        }
    }

    fn route_body(&mut self, chunk: &Bytes) {
        if self.state == Stored::Closing {
            return;
        }
        let Some(tag) = self.current_delivery.clone() else {
            self.fail("body frame without a delivery in progress");
            return;
        };
        let Some(reassembler) = self.consumers.get_mut(&tag) else {
            self.fail(&format!("body frame for unknown consumer {tag}"));
            return;
        };
        match reassembler.data(chunk) {
            Ok(Some(delivery)) => self.complete_delivery(&tag, delivery.delivery_tag),
            Ok(None) => {}
            Err(error) => self.fail(&error.to_string()),
        }
    }

    fn complete_delivery(&mut self, tag: &str, delivery_tag: u64) {
        self.current_delivery = None;
        let auto_ack = self
            .consumers
            .get(tag)
            .is_some_and(|r| r.ack_policy() == AckPolicy::AutoAfterDelivery);
        if auto_ack {
            if let Err(error) = self.ack(delivery_tag) {
                tracing::warn!(channel = self.id, %error, "automatic acknowledgement failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Failure and scheduling
    // -----------------------------------------------------------------------

    /// Move the channel into the error state: reject every pending request
    /// in issue order, demote the roles, and fire the error hook once.
    pub(crate) fn fail(&mut self, reason: &str) {
        if matches!(self.state, Stored::Error | Stored::Closed) {
            return;
        }
        tracing::error!(channel = self.id, reason, "channel failed");
        self.state = Stored::Error;
        self.roles = Roles::NONE;
        self.current_delivery = None;
        self.consumers.clear();
        for entry in self.pending.drain(..) {
            entry.deferred.reject(reason);
        }
        if let Some(hook) = self.on_error.take() {
            hook(self, reason);
        }
    }

    /// Run the scheduled resolutions queued by earlier calls.
    pub(crate) fn dispatch_scheduled(&mut self) {
        for entry in std::mem::take(&mut self.scheduled) {
            match entry {
                Scheduled::Resolve(deferred, payload) => deferred.resolve(payload),
                Scheduled::Reject(deferred, reason) => deferred.reject(&reason),
            }
        }
    }

    fn schedule_failed(&mut self, reason: impl Into<String>) -> Deferred {
        let reason = reason.into();
        let deferred = Deferred::failed(reason.clone());
        self.scheduled
            .push(Scheduled::Reject(deferred.clone(), reason));
        deferred
    }

    fn request(&mut self, payload: Bytes, expects: ClassMethod) -> Deferred {
        if !self.usable() {
            return self.schedule_failed("channel is not usable");
        }
        match self.sink.send(Frame::method(self.id, payload)) {
            Ok(()) => {
                let deferred = Deferred::new();
                self.pending.push_back(Pending {
                    expects,
                    deferred: deferred.clone(),
                    consumer: None,
                });
                deferred
            }
            Err(error) => self.schedule_failed(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::frame::FRAME_OVERHEAD;
    use crate::method::ArgWriter;
    use crate::transport::{MockTransport, Transport};

    fn channel_with(roles: Roles) -> (Channel, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let sink = FrameSink::new(Arc::clone(&transport) as Arc<dyn Transport>);
        sink.release().expect("direct mode");
        let mut channel = Channel::open(1, sink, roles).expect("open frame");
        transport.take_sent();
        // the broker confirms the channel
        channel
            .handle_frame(&Frame::method(
                1,
                ArgWriter::new(ClassMethod::CHANNEL_OPEN_OK).long_str(b"").finish(),
            ))
            .expect("open-ok");
        (channel, transport)
    }

    fn reply(cm: ClassMethod) -> Frame {
        Frame::method(1, ArgWriter::new(cm).finish())
    }

    fn consume_ok(tag: &str) -> Frame {
        Frame::method(
            1,
            ArgWriter::new(ClassMethod::BASIC_CONSUME_OK).short_str(tag).finish(),
        )
    }

    fn deliver_frames(tag: &str, delivery_tag: u64, body: &[u8]) -> Vec<Frame> {
        let deliver = ArgWriter::new(ClassMethod::BASIC_DELIVER)
            .short_str(tag)
            .u64(delivery_tag)
            .bits(&[false])
            .short_str("orders")
            .short_str("new")
            .finish();
        let header = method::ContentHeader {
            class: 60,
            body_size: body.len() as u64,
            properties: Bytes::from_static(&[0, 0]),
        };
        vec![
            Frame::method(1, deliver),
            Frame::header(1, header.encode()),
            Frame::body(1, Bytes::copy_from_slice(body)),
        ]
    }

    #[test]
    fn open_confirms_and_fires_ready_once() {
        let transport = Arc::new(MockTransport::new());
        let sink = FrameSink::new(Arc::clone(&transport) as Arc<dyn Transport>);
        sink.release().expect("direct mode");
        let mut channel = Channel::open(1, sink, Roles::BOTH).expect("open");
        assert_eq!(channel.state(), ChannelState::Opening);
        assert!(!transport.sent().is_empty());

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        channel.set_on_ready(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        channel
            .handle_frame(&reply(ClassMethod::CHANNEL_OPEN_OK))
            .expect("open-ok");
        assert_eq!(channel.state(), ChannelState::Ready);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_without_role_sends_no_bytes() {
        let (mut channel, transport) = channel_with(Roles::CONSUMER);
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let _handle = channel
            .publish("orders", "new", Bytes::from_static(b"m"))
            .on_error(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            });

        assert!(transport.sent().is_empty());
        assert_eq!(errors.load(Ordering::SeqCst), 0, "fires on dispatch, not inline");
        channel.dispatch_scheduled();
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn consume_without_role_sends_no_bytes() {
        let (mut channel, transport) = channel_with(Roles::PUBLISHER);
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let _handle = channel.consume("orders.new").on_error(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        assert!(transport.sent().is_empty());
        channel.dispatch_scheduled();
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replies_resolve_pending_requests_in_fifo_order() {
        let (mut channel, _transport) = channel_with(Roles::BOTH);
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        let _declare = channel
            .declare_exchange("orders", ExchangeKind::Direct, true)
            .on_success(move |_| o.lock().expect("order").push("exchange"));
        let o = Arc::clone(&order);
        let _queue = channel
            .declare_queue("orders.new", true)
            .on_success(move |_| o.lock().expect("order").push("queue"));

        assert_eq!(channel.state(), ChannelState::Busy);
        channel
            .handle_frame(&reply(ClassMethod::EXCHANGE_DECLARE_OK))
            .expect("declare-ok");
        channel
            .handle_frame(&reply(ClassMethod::QUEUE_DECLARE_OK))
            .expect("declare-ok");

        assert_eq!(&*order.lock().expect("order"), &["exchange", "queue"]);
        assert_eq!(channel.state(), ChannelState::Ready);
    }

    #[test]
    fn mismatched_reply_fails_the_channel() {
        let (mut channel, _transport) = channel_with(Roles::BOTH);
        let _declare = channel.declare_exchange("orders", ExchangeKind::Direct, true);

        let failures = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&failures);
        channel.set_on_error(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        channel
            .handle_frame(&reply(ClassMethod::QUEUE_BIND_OK))
            .expect("reply routed");
        assert_eq!(channel.state(), ChannelState::Error);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(!channel.usable());
    }

    #[test]
    fn close_rejects_pending_operations_in_issue_order() {
        let (mut channel, _transport) = channel_with(Roles::BOTH);
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        let _first = channel
            .declare_exchange("orders", ExchangeKind::Direct, true)
            .on_error(move |reason| o.lock().expect("order").push(format!("first: {reason}")));
        let o = Arc::clone(&order);
        let _second = channel
            .declare_queue("orders.new", true)
            .on_error(move |reason| o.lock().expect("order").push(format!("second: {reason}")));

        let _closing = channel.close();
        assert_eq!(channel.state(), ChannelState::Closing);
        assert_eq!(
            &*order.lock().expect("order"),
            &["first: channel closed", "second: channel closed"]
        );

        channel
            .handle_frame(&reply(ClassMethod::CHANNEL_CLOSE_OK))
            .expect("close-ok");
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn server_close_errors_pending_and_demotes_roles() {
        let (mut channel, transport) = channel_with(Roles::BOTH);
        let _pending = channel.declare_queue("orders.new", true);
        transport.take_sent();

        let close = Frame::method(
            1,
            ArgWriter::new(ClassMethod::CHANNEL_CLOSE)
                .u16(406)
                .short_str("precondition failed")
                .u16(0)
                .u16(0)
                .finish(),
        );
        channel.handle_frame(&close).expect("server close");

        assert_eq!(channel.state(), ChannelState::Error);
        // close-ok went out before the channel failed
        assert!(transport.take_sent().len() >= FRAME_OVERHEAD);
        // further publishes are refused without bytes
        let _handle = channel.publish("orders", "new", Bytes::from_static(b"m"));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn publish_splits_body_at_the_negotiated_frame_size() {
        let (mut channel, transport) = channel_with(Roles::PUBLISHER);
        channel.sink.set_frame_max(FRAME_OVERHEAD as u32 + 4);

        let body = Bytes::from_static(b"0123456789");
        let _handle = channel.publish("orders", "new", body);

        let wire = transport.take_sent();
        // method + header + three body frames (4 + 4 + 2 bytes)
        let mut offset = 0;
        let mut frames = Vec::new();
        let codec = crate::codec::FrameCodec::new(1024);
        while offset < wire.len() {
            match codec.decode(&wire[offset..]).expect("well-formed") {
                crate::codec::Decoded::Frame { frame, consumed } => {
                    offset += consumed;
                    frames.push(frame);
                }
                crate::codec::Decoded::Incomplete { .. } => panic!("truncated publish output"),
            }
        }
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[2].payload.len(), 4);
        assert_eq!(frames[3].payload.len(), 4);
        assert_eq!(frames[4].payload.len(), 2);
        let rejoined: Vec<u8> = frames[2..]
            .iter()
            .flat_map(|f| f.payload.iter().copied())
            .collect();
        assert_eq!(rejoined, b"0123456789");
    }

    #[test]
    fn consume_then_delivery_reassembles_and_auto_acks() {
        let (mut channel, transport) = channel_with(Roles::CONSUMER);
        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&received);
        let _consumer = channel.consume("orders.new").on_received(move |delivery| {
            r.lock().expect("received").push(delivery.body.to_vec());
        });
        transport.take_sent();

        channel.handle_frame(&consume_ok("ctag-1")).expect("consume-ok");
        for frame in deliver_frames("ctag-1", 1, b"payload") {
            channel.handle_frame(&frame).expect("delivery frames");
        }

        assert_eq!(&*received.lock().expect("received"), &[b"payload".to_vec()]);
        // the automatic acknowledgement is the only outbound frame
        let wire = transport.take_sent();
        let codec = crate::codec::FrameCodec::new(1024);
        match codec.decode(&wire).expect("ack frame") {
            crate::codec::Decoded::Frame { frame, consumed } => {
                assert_eq!(consumed, wire.len());
                assert_eq!(frame.class_method().expect("ids"), ClassMethod::BASIC_ACK);
            }
            crate::codec::Decoded::Incomplete { .. } => panic!("no ack emitted"),
        }
    }

    #[test]
    fn delivery_for_unknown_consumer_fails_the_channel() {
        let (mut channel, _transport) = channel_with(Roles::CONSUMER);
        for frame in deliver_frames("ghost", 1, b"x").into_iter().take(1) {
            channel.handle_frame(&frame).expect("routed");
        }
        assert_eq!(channel.state(), ChannelState::Error);
    }
}

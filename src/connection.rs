//! Connection state machine: login handshake, frame parsing, channel
//! multiplexing.
//!
//! The connection is driven sans-io by whatever loop owns the transport:
//! the embedder feeds received bytes to [`Connection::parse`] in a loop,
//! handing over the largest contiguous slice of at least
//! [`Connection::expected`] bytes until fewer than that remain. The
//! connection consumes only complete frames; the embedder retains the
//! unconsumed tail.
//!
//! Outbound traffic from channels created during the handshake is held
//! back and flushed the moment `connection.open-ok` arrives, so callers
//! can open channels and issue requests immediately after construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::channel::Channel;
use crate::codec::{Decoded, FrameCodec};
use crate::config::{Login, Roles};
use crate::error::{MqError, Result};
use crate::frame::{ClassMethod, FRAME_HEADER_SIZE, Frame, FrameType};
use crate::method;
use crate::outbound::FrameSink;
use crate::transport::Transport;

/// Frame size the client offers during tuning when the server leaves the
/// choice open.
const CLIENT_FRAME_MAX: u32 = 131_072;

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Greeting sent; login negotiation in progress.
    Handshaking,
    /// Handshake acknowledged; channels are flowing.
    Open,
    /// `connection.close` sent, waiting for the confirmation.
    Closing,
    /// Closed, cleanly or by the server.
    Closed,
    /// Failed on a transport, codec, or protocol error.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandshakeStep {
    AwaitStart,
    AwaitTune,
    AwaitOpenOk,
    Done,
}

/// Parameters negotiated during tuning.
#[derive(Clone, Copy, Debug, Default)]
pub struct Tuning {
    /// Highest channel number either side will use; 0 while unknown.
    pub channel_max: u16,
    /// Largest frame either side will send.
    pub frame_max: u32,
    /// Effective heartbeat interval in seconds; 0 disables heartbeats.
    pub heartbeat: u16,
}

type OpenHook = Box<dyn FnOnce(&Tuning) + Send>;
type FailureHook = Box<dyn FnOnce(&str) + Send>;

/// One physical connection and the channels multiplexed over it.
pub struct Connection {
    sink: FrameSink,
    codec: FrameCodec,
    login: Login,
    vhost: String,
    requested_heartbeat: u16,
    state: ConnectionState,
    step: HandshakeStep,
    tuning: Tuning,
    channels: HashMap<u16, Channel>,
    expected: usize,
    peer_activity: Option<Instant>,
    on_open: Option<OpenHook>,
    on_failure: Option<FailureHook>,
}

impl Connection {
    /// Send the protocol greeting and begin the login handshake.
    ///
    /// The transport must already be connected; establishing it is the
    /// embedder's precondition.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the greeting cannot be written.
    pub fn start(
        transport: Arc<dyn Transport>,
        login: Login,
        vhost: impl Into<String>,
        requested_heartbeat: u16,
    ) -> Result<Self> {
        let sink = FrameSink::new(transport);
        sink.send_raw(method::PROTOCOL_HEADER)?;
        Ok(Self {
            sink,
            codec: FrameCodec::default(),
            login,
            vhost: vhost.into(),
            requested_heartbeat,
            state: ConnectionState::Handshaking,
            step: HandshakeStep::AwaitStart,
            tuning: Tuning::default(),
            channels: HashMap::new(),
            expected: FRAME_HEADER_SIZE,
            peer_activity: None,
            on_open: None,
            on_failure: None,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether new work may still be issued over this connection.
    #[must_use]
    pub fn usable(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Handshaking | ConnectionState::Open
        )
    }

    /// Minimum bytes the next [`parse`](Self::parse) call needs to make
    /// progress.
    #[must_use]
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Negotiated tuning parameters; meaningful once the connection is open.
    #[must_use]
    pub fn tuning(&self) -> Tuning {
        self.tuning
    }

    /// Instant the peer last produced any frame, heartbeats included.
    #[must_use]
    pub fn peer_activity(&self) -> Option<Instant> {
        self.peer_activity
    }

    /// Register the hook fired once when the handshake completes.
    pub fn set_on_open(&mut self, hook: impl FnOnce(&Tuning) + Send + 'static) {
        self.on_open = Some(Box::new(hook));
    }

    /// Register the hook fired once if the connection fails or the server
    /// closes it.
    pub fn set_on_failure(&mut self, hook: impl FnOnce(&str) + Send + 'static) {
        self.on_failure = Some(Box::new(hook));
    }

    /// Open a channel with the given number and role set.
    ///
    /// `channel.open` is sent immediately, or held back until the
    /// handshake completes.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Config`] for channel number 0, a number already
    /// in use, or one above the negotiated maximum, and
    /// [`MqError::ConnectionClosed`] when the connection is unusable.
    pub fn open_channel(&mut self, id: u16, roles: Roles) -> Result<&mut Channel> {
        if !self.usable() {
            return Err(MqError::ConnectionClosed);
        }
        if id == 0 {
            return Err(MqError::config("channel 0 is reserved for the connection"));
        }
        if self.tuning.channel_max != 0 && id > self.tuning.channel_max {
            return Err(MqError::config(format!(
                "channel {id} exceeds negotiated maximum {}",
                self.tuning.channel_max
            )));
        }
        if self.channels.contains_key(&id) {
            return Err(MqError::config(format!("channel {id} is already open")));
        }
        let channel = Channel::open(id, self.sink.clone(), roles)?;
        Ok(self.channels.entry(id).or_insert(channel))
    }

    /// Borrow an open channel mutably.
    pub fn channel_mut(&mut self, id: u16) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    /// Consume as many complete frames from `data` as are present.
    ///
    /// Returns the number of bytes consumed; the caller keeps the rest and
    /// calls again once at least [`expected`](Self::expected) bytes are
    /// available. Once the connection is closed or failed this is a no-op
    /// returning 0.
    ///
    /// # Errors
    ///
    /// Returns the fatal error when the stream is malformed or a frame
    /// violates the protocol; the connection is already failed when this
    /// happens.
    pub fn parse(&mut self, data: &[u8]) -> Result<usize> {
        if matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Failed
        ) {
            return Ok(0);
        }

        self.dispatch_scheduled();

        let mut consumed = 0;
        while consumed < data.len() {
            match self.codec.decode(&data[consumed..]) {
                Ok(Decoded::Frame { frame, consumed: used }) => {
                    consumed += used;
                    self.expected = FRAME_HEADER_SIZE;
                    self.handle_frame(&frame)?;
                    if !matches!(
                        self.state,
                        ConnectionState::Handshaking | ConnectionState::Open | ConnectionState::Closing
                    ) {
                        break;
                    }
                }
                Ok(Decoded::Incomplete { needed }) => {
                    self.expected = needed;
                    break;
                }
                Err(error) => {
                    self.fail(&error.to_string());
                    return Err(MqError::Codec(error));
                }
            }
        }
        Ok(consumed)
    }

    /// Send a heartbeat frame. Skipped silently unless the connection is
    /// open.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the frame cannot be written.
    pub fn heartbeat(&mut self) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Ok(());
        }
        self.sink.send(Frame::heartbeat())
    }

    /// Begin an orderly shutdown. Returns false when the connection is not
    /// in a state that can be closed.
    pub fn close(&mut self) -> bool {
        if !self.usable() {
            return false;
        }
        let payload = method::close(ClassMethod::CONNECTION_CLOSE, 200, "OK");
        if self
            .send_handshake(&Frame::method(0, payload))
            .is_err()
        {
            return false;
        }
        self.state = ConnectionState::Closing;
        true
    }

    /// Run scheduled deferred resolutions on every channel.
    pub fn dispatch_scheduled(&mut self) {
        for channel in self.channels.values_mut() {
            channel.dispatch_scheduled();
        }
    }

    fn handle_frame(&mut self, frame: &Frame) -> Result<()> {
        self.peer_activity = Some(Instant::now());

        if frame.frame_type == FrameType::Heartbeat {
            tracing::trace!("heartbeat received");
            return Ok(());
        }

        if frame.channel == 0 {
            return self.handle_connection_frame(frame);
        }

        match self.channels.get_mut(&frame.channel) {
            Some(channel) => {
                if let Err(error) = channel.handle_frame(frame) {
                    // malformed bytes mean the stream itself is corrupt
                    self.fail(&error.to_string());
                    return Err(error);
                }
                Ok(())
            }
            None => {
                let reason = format!("frame for unknown channel {}", frame.channel);
                self.fail(&reason);
                Err(MqError::protocol(reason))
            }
        }
    }

    fn handle_connection_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.frame_type != FrameType::Method {
            let reason = format!("{:?} frame on channel 0", frame.frame_type);
            self.fail(&reason);
            return Err(MqError::protocol(reason));
        }

        let cm = frame.class_method()?;
        let args = &frame.payload[4..];

        match cm {
            ClassMethod::CONNECTION_START if self.step == HandshakeStep::AwaitStart => {
                self.on_start(args)
            }
            ClassMethod::CONNECTION_TUNE if self.step == HandshakeStep::AwaitTune => {
                self.on_tune(args)
            }
            ClassMethod::CONNECTION_OPEN_OK if self.step == HandshakeStep::AwaitOpenOk => {
                self.on_open_ok()
            }
            ClassMethod::CONNECTION_CLOSE => self.on_server_close(args),
            ClassMethod::CONNECTION_CLOSE_OK if self.state == ConnectionState::Closing => {
                self.state = ConnectionState::Closed;
                self.shutdown_channels("connection closed");
                self.sink.close();
                Ok(())
            }
            other => {
                let reason = format!("unexpected connection method {other}");
                self.fail(&reason);
                Err(MqError::protocol(reason))
            }
        }
    }

    fn on_start(&mut self, args: &[u8]) -> Result<()> {
        let start = method::parse_start(args).inspect_err(|e| self.fail(&e.to_string()))?;
        if (start.version_major, start.version_minor) != method::VERSION {
            let reason = format!(
                "server speaks {}-{}, client speaks {}-{}",
                start.version_major,
                start.version_minor,
                method::VERSION.0,
                method::VERSION.1
            );
            self.fail(&reason);
            return Err(MqError::protocol(reason));
        }
        let start_ok = method::start_ok(&self.login.user, &self.login.password);
        self.send_handshake(&Frame::method(0, start_ok))?;
        self.step = HandshakeStep::AwaitTune;
        Ok(())
    }

    fn on_tune(&mut self, args: &[u8]) -> Result<()> {
        let tune = method::parse_tune(args).inspect_err(|e| self.fail(&e.to_string()))?;

        let frame_max = match tune.frame_max {
            0 => CLIENT_FRAME_MAX,
            server => server.min(CLIENT_FRAME_MAX),
        };
        self.tuning = Tuning {
            channel_max: tune.channel_max,
            frame_max,
            heartbeat: self.requested_heartbeat,
        };
        self.codec.set_max_frame_size(frame_max);
        self.sink.set_frame_max(frame_max);

        let tune_ok = method::tune_ok(tune.channel_max, frame_max, self.requested_heartbeat);
        self.send_handshake(&Frame::method(0, tune_ok))?;
        let open = method::connection_open(&self.vhost);
        self.send_handshake(&Frame::method(0, open))?;
        self.step = HandshakeStep::AwaitOpenOk;
        Ok(())
    }

    fn on_open_ok(&mut self) -> Result<()> {
        self.step = HandshakeStep::Done;
        self.state = ConnectionState::Open;
        tracing::info!(vhost = %self.vhost, "connection open");
        if let Err(error) = self.sink.release() {
            self.fail(&error.to_string());
            return Err(error);
        }
        if let Some(hook) = self.on_open.take() {
            hook(&self.tuning);
        }
        Ok(())
    }

    fn on_server_close(&mut self, args: &[u8]) -> Result<()> {
        let close = method::parse_close(args).inspect_err(|e| self.fail(&e.to_string()))?;
        let _ = self.send_handshake(&Frame::method(
            0,
            method::close_ok(ClassMethod::CONNECTION_CLOSE_OK),
        ));

        let was_closing = self.state == ConnectionState::Closing;
        self.state = ConnectionState::Closed;
        let reason = format!(
            "server closed connection: {} {}",
            close.reply_code, close.reply_text
        );
        self.shutdown_channels(&reason);
        self.sink.close();
        if !was_closing {
            tracing::warn!(reason, "connection closed by server");
            if let Some(hook) = self.on_failure.take() {
                hook(&reason);
            }
        }
        Ok(())
    }

    /// Transition to `Failed`, rejecting everything pending on every
    /// channel and firing the failure hook once.
    pub fn fail(&mut self, reason: &str) {
        if matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Failed
        ) {
            return;
        }
        tracing::error!(reason, "connection failed");
        self.state = ConnectionState::Failed;
        self.shutdown_channels(reason);
        self.sink.close();
        if let Some(hook) = self.on_failure.take() {
            hook(reason);
        }
    }

    fn shutdown_channels(&mut self, reason: &str) {
        for channel in self.channels.values_mut() {
            channel.fail(reason);
        }
    }

    /// Handshake traffic bypasses the hold-back queue: these frames must
    /// go out before the sink is released.
    fn send_handshake(&self, frame: &Frame) -> Result<()> {
        self.sink.send_raw(&FrameCodec::encode(frame))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::method::ArgWriter;
    use crate::transport::MockTransport;

    fn server_frame(cm: ClassMethod, build: impl FnOnce(ArgWriter) -> ArgWriter) -> Vec<u8> {
        let payload = build(ArgWriter::new(cm)).finish();
        FrameCodec::encode(&Frame::method(0, payload)).to_vec()
    }

    fn start_frame() -> Vec<u8> {
        server_frame(ClassMethod::CONNECTION_START, |w| {
            w.u8(0)
                .u8(9)
                .empty_table()
                .long_str(b"PLAIN")
                .long_str(b"en_US")
        })
    }

    fn tune_frame() -> Vec<u8> {
        server_frame(ClassMethod::CONNECTION_TUNE, |w| {
            w.u16(2047).u32(131_072).u16(60)
        })
    }

    fn open_ok_frame() -> Vec<u8> {
        server_frame(ClassMethod::CONNECTION_OPEN_OK, |w| w.short_str(""))
    }

    fn connect() -> (Connection, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let connection = Connection::start(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Login::new("guest", "guest"),
            "/",
            30,
        )
        .expect("greeting");
        (connection, transport)
    }

    fn complete_handshake(connection: &mut Connection) {
        connection.parse(&start_frame()).expect("start");
        connection.parse(&tune_frame()).expect("tune");
        connection.parse(&open_ok_frame()).expect("open-ok");
    }

    #[test]
    fn greeting_goes_out_first() {
        let (_connection, transport) = connect();
        assert_eq!(transport.sent(), method::PROTOCOL_HEADER);
    }

    #[test]
    fn handshake_walks_start_tune_open() {
        let (mut connection, transport) = connect();
        transport.take_sent();

        connection.parse(&start_frame()).expect("start");
        let codec = FrameCodec::new(CLIENT_FRAME_MAX);
        let wire = transport.take_sent();
        let Decoded::Frame { frame, .. } = codec.decode(&wire).expect("start-ok") else {
            panic!("no start-ok frame");
        };
        assert_eq!(
            frame.class_method().expect("ids"),
            ClassMethod::CONNECTION_START_OK
        );
        assert_eq!(connection.state(), ConnectionState::Handshaking);

        connection.parse(&tune_frame()).expect("tune");
        let wire = transport.take_sent();
        let Decoded::Frame { frame, consumed } = codec.decode(&wire).expect("tune-ok") else {
            panic!("no tune-ok frame");
        };
        assert_eq!(
            frame.class_method().expect("ids"),
            ClassMethod::CONNECTION_TUNE_OK
        );
        let Decoded::Frame { frame, .. } = codec.decode(&wire[consumed..]).expect("open") else {
            panic!("no connection.open frame");
        };
        assert_eq!(
            frame.class_method().expect("ids"),
            ClassMethod::CONNECTION_OPEN
        );

        connection.parse(&open_ok_frame()).expect("open-ok");
        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(connection.tuning().frame_max, 131_072);
        assert_eq!(connection.tuning().heartbeat, 30, "client interval is echoed");
    }

    #[test]
    fn channel_open_is_held_until_the_handshake_completes() {
        let (mut connection, transport) = connect();
        connection
            .open_channel(1, Roles::BOTH)
            .expect("channel during handshake");
        transport.take_sent();

        connection.parse(&start_frame()).expect("start");
        connection.parse(&tune_frame()).expect("tune");
        transport.take_sent();

        connection.parse(&open_ok_frame()).expect("open-ok");
        let wire = transport.take_sent();
        let codec = FrameCodec::new(CLIENT_FRAME_MAX);
        let Decoded::Frame { frame, .. } = codec.decode(&wire).expect("flushed") else {
            panic!("channel.open was not flushed");
        };
        assert_eq!(frame.channel, 1);
        assert_eq!(
            frame.class_method().expect("ids"),
            ClassMethod::CHANNEL_OPEN
        );
    }

    #[test]
    fn expected_tracks_partial_frames() {
        let (mut connection, _transport) = connect();
        assert_eq!(connection.expected(), FRAME_HEADER_SIZE);

        let frame = start_frame();
        let consumed = connection.parse(&frame[..3]).expect("short header");
        assert_eq!(consumed, 0);
        assert_eq!(connection.expected(), FRAME_HEADER_SIZE);

        let consumed = connection.parse(&frame[..10]).expect("short payload");
        assert_eq!(consumed, 0);
        assert_eq!(connection.expected(), frame.len());

        let consumed = connection.parse(&frame).expect("whole frame");
        assert_eq!(consumed, frame.len());
        assert_eq!(connection.expected(), FRAME_HEADER_SIZE);
    }

    #[test]
    fn malformed_stream_fails_the_connection_and_parse_becomes_noop() {
        let (mut connection, _transport) = connect();
        let garbage = [0x42u8, 0, 0, 0, 0, 0, 0, 0];
        let failures: Arc<std::sync::Mutex<Vec<String>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let f = Arc::clone(&failures);
        connection.set_on_failure(move |reason| {
            f.lock().expect("failures").push(reason.to_string());
        });

        assert!(connection.parse(&garbage).is_err());
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert!(!connection.usable());
        assert_eq!(failures.lock().expect("failures").len(), 1);

        // dead connections ignore further input
        assert_eq!(connection.parse(&start_frame()).expect("no-op"), 0);
    }

    #[test]
    fn frame_for_unknown_channel_is_fatal() {
        let (mut connection, _transport) = connect();
        complete_handshake(&mut connection);

        let stray = FrameCodec::encode(&Frame::body(9, Bytes::from_static(b"x")));
        assert!(connection.parse(&stray).is_err());
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[test]
    fn heartbeat_frames_refresh_peer_activity() {
        let (mut connection, _transport) = connect();
        complete_handshake(&mut connection);
        let before = connection.peer_activity();

        let beat = FrameCodec::encode(&Frame::heartbeat());
        connection.parse(&beat).expect("heartbeat");
        assert!(connection.peer_activity() >= before);
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[test]
    fn close_handshake_reaches_closed() {
        let (mut connection, transport) = connect();
        complete_handshake(&mut connection);
        transport.take_sent();

        assert!(connection.close());
        assert_eq!(connection.state(), ConnectionState::Closing);
        assert!(!connection.close(), "closing twice is refused");

        let close_ok = server_frame(ClassMethod::CONNECTION_CLOSE_OK, |w| w);
        connection.parse(&close_ok).expect("close-ok");
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn server_close_rejects_pending_channel_operations() {
        let (mut connection, _transport) = connect();
        complete_handshake(&mut connection);
        connection.open_channel(1, Roles::BOTH).expect("channel");

        let open_ok = ArgWriter::new(ClassMethod::CHANNEL_OPEN_OK).long_str(b"").finish();
        let wire = FrameCodec::encode(&Frame::method(1, open_ok));
        connection.parse(&wire).expect("channel open-ok");

        let errors: Arc<std::sync::Mutex<Vec<String>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        let _pending = connection
            .channel_mut(1)
            .expect("channel")
            .declare_queue("orders.new", true)
            .on_error(move |reason| e.lock().expect("errors").push(reason.to_string()));

        let close = server_frame(ClassMethod::CONNECTION_CLOSE, |w| {
            w.u16(320).short_str("shutdown").u16(0).u16(0)
        });
        connection.parse(&close).expect("server close");

        assert_eq!(connection.state(), ConnectionState::Closed);
        let errors = errors.lock().expect("errors");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("320"));
    }

    #[test]
    fn heartbeat_is_skipped_until_open() {
        let (mut connection, transport) = connect();
        transport.take_sent();
        connection.heartbeat().expect("skipped");
        assert!(transport.sent().is_empty());

        complete_handshake(&mut connection);
        transport.take_sent();
        connection.heartbeat().expect("sent");
        assert_eq!(transport.sent(), FrameCodec::encode(&Frame::heartbeat()));
    }
}

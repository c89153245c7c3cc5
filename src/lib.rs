//! Public API for the `mqwire` library.
//!
//! This crate is a client-side engine for the AMQP 0-9-1 wire protocol
//! over a reliable byte stream: incremental frame parsing, the
//! connection/channel handshake and lifecycle state machines, deferred
//! per-request completion, consumer message reassembly, and heartbeat
//! liveness. The physical transport stays outside; the engine consumes it
//! through the [`transport::Transport`] interface and is fed received
//! bytes by the embedder's event loop.

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod deferred;
pub mod error;
pub mod frame;
pub mod heartbeat;
mod method;
mod outbound;
pub mod transport;

pub use channel::{Channel, ChannelState};
pub use client::MqClient;
pub use codec::{CodecError, Decoded, FrameCodec};
pub use config::{ExchangeKind, Login, MqInfo, Roles};
pub use connection::{Connection, ConnectionState, Tuning};
pub use consumer::{AckPolicy, DeferredConsumer, Delivery, ReassemblyError};
pub use deferred::Deferred;
pub use error::{MqError, Result};
pub use frame::{ClassMethod, Frame, FrameType};
pub use heartbeat::HeartbeatMonitor;
pub use transport::{MockTransport, Transport};

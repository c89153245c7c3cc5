//! Transport collaborator interface.
//!
//! The engine does not implement a transport. It consumes one through this
//! trait: a full-duplex byte stream whose outbound half is `send`, and
//! whose inbound half is whatever event loop the embedder runs, draining
//! received bytes into [`Connection::parse`](crate::connection::Connection::parse)
//! or [`MqClient::feed`](crate::client::MqClient::feed).

use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Outbound half of the byte-stream transport the engine writes to.
///
/// `send` must accept the bytes in order; the engine never interleaves the
/// bytes of two frames within one logical connection.
pub trait Transport: Send + Sync {
    /// Write `bytes` to the peer.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] when the transport can no longer carry
    /// bytes. The engine treats this as fatal to the connection.
    fn send(&self, bytes: &[u8]) -> io::Result<()>;
}

/// In-memory transport that records everything sent through it.
///
/// Used by the crate's own tests and useful to embedders for driving the
/// engine against scripted broker bytes.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<u8>>,
    broken: AtomicBool,
}

impl MockTransport {
    /// Create an empty recording transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All bytes sent so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<u8> {
        self.sent.lock().expect("mock transport lock").clone()
    }

    /// Drain and return the bytes sent so far.
    #[must_use]
    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut *self.sent.lock().expect("mock transport lock"))
    }

    /// Make every subsequent `send` fail, simulating a dropped link.
    pub fn break_link(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link broken"));
        }
        self.sent
            .lock()
            .expect("mock transport lock")
            .extend_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_records_in_order() {
        let transport = MockTransport::new();
        transport.send(b"ab").expect("send");
        transport.send(b"cd").expect("send");
        assert_eq!(transport.sent(), b"abcd");
        assert_eq!(transport.take_sent(), b"abcd");
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn broken_link_fails_sends() {
        let transport = MockTransport::new();
        transport.break_link();
        assert!(transport.send(b"x").is_err());
    }
}

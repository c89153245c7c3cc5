//! Shared handle for writing frames to the transport.
//!
//! [`FrameSink`] is the single egress point for the connection and every
//! channel multiplexed over it. While the login handshake is still in
//! flight, channel traffic is held back in order and flushed the moment the
//! connection opens, so callers can issue requests immediately after
//! constructing a channel. Cloning the sink is cheap; all clones share one
//! queue and one transport.

use std::sync::{Arc, Mutex};

use crate::codec::{DEFAULT_FRAME_MAX, FrameCodec};
use crate::error::{MqError, Result};
use crate::frame::{FRAME_OVERHEAD, Frame};
use crate::transport::Transport;

struct SinkInner {
    transport: Arc<dyn Transport>,
    /// Handshake finished; frames go straight to the transport.
    ready: bool,
    /// Frames issued before the handshake finished, in issue order.
    held: Vec<Frame>,
    frame_max: u32,
    closed: bool,
}

/// Cheaply cloneable egress handle shared by a connection and its channels.
#[derive(Clone)]
pub(crate) struct FrameSink {
    inner: Arc<Mutex<SinkInner>>,
}

impl FrameSink {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkInner {
                transport,
                ready: false,
                held: Vec::new(),
                frame_max: DEFAULT_FRAME_MAX,
                closed: false,
            })),
        }
    }

    /// Write raw bytes immediately, bypassing the hold-back queue. Only the
    /// protocol greeting and handshake replies use this path.
    pub(crate) fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let inner = self.lock();
        if inner.closed {
            return Err(MqError::ConnectionClosed);
        }
        inner.transport.send(bytes).map_err(MqError::Transport)
    }

    /// Write one frame, or hold it back if the handshake is still running.
    pub(crate) fn send(&self, frame: Frame) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(MqError::ConnectionClosed);
        }
        if inner.ready {
            let wire = FrameCodec::encode(&frame);
            inner.transport.send(&wire).map_err(MqError::Transport)
        } else {
            inner.held.push(frame);
            Ok(())
        }
    }

    /// Mark the handshake complete and flush everything held back.
    pub(crate) fn release(&self) -> Result<()> {
        let (transport, held) = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(MqError::ConnectionClosed);
            }
            inner.ready = true;
            (Arc::clone(&inner.transport), std::mem::take(&mut inner.held))
        };
        for frame in held {
            transport
                .send(&FrameCodec::encode(&frame))
                .map_err(MqError::Transport)?;
        }
        Ok(())
    }

    /// Adopt the negotiated maximum frame size.
    pub(crate) fn set_frame_max(&self, frame_max: u32) {
        self.lock().frame_max = frame_max;
    }

    pub(crate) fn frame_max(&self) -> u32 {
        self.lock().frame_max
    }

    /// Largest body payload that fits one frame under the negotiated limit.
    pub(crate) fn body_capacity(&self) -> usize {
        let frame_max = self.frame_max() as usize;
        frame_max.saturating_sub(FRAME_OVERHEAD).max(1)
    }

    /// Stop accepting frames; held-back frames are dropped.
    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.held.clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkInner> {
        self.inner.lock().expect("frame sink lock")
    }
}

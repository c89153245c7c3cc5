//! Wire-level frame model.
//!
//! An AMQP 0-9-1 connection exchanges frames of four kinds. Every frame
//! belongs to a channel (channel 0 carries connection-level traffic), and
//! method frames additionally identify the operation they carry via a
//! class/method id pair at the start of their payload.

use bytes::Bytes;

use crate::codec::CodecError;

/// Number of bytes in a frame header (`type`, `channel`, `payload size`).
pub const FRAME_HEADER_SIZE: usize = 7;

/// Sentinel octet terminating every frame.
pub const FRAME_END: u8 = 0xCE;

/// Fixed per-frame overhead: header plus the end octet.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// Kind discriminant carried in the first octet of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// A protocol method invocation or reply.
    Method = 1,
    /// A content header announcing the body size of a message.
    Header = 2,
    /// A chunk of message body.
    Body = 3,
    /// A liveness probe. Always on channel 0 with an empty payload.
    Heartbeat = 8,
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Method),
            2 => Ok(Self::Header),
            3 => Ok(Self::Body),
            8 => Ok(Self::Heartbeat),
            other => Err(CodecError::UnknownFrameType { value: other }),
        }
    }
}

/// A complete protocol frame.
///
/// The payload is held as [`Bytes`] so routing a frame between the decoder,
/// the channel dispatcher, and the consumer reassembler never copies it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub frame_type: FrameType,
    /// Channel the frame belongs to; 0 is the connection itself.
    pub channel: u16,
    /// Raw payload between the frame header and the end octet.
    pub payload: Bytes,
}

impl Frame {
    /// Build a method frame for `channel` from an encoded method payload.
    #[must_use]
    pub fn method(channel: u16, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Method,
            channel,
            payload,
        }
    }

    /// Build a content header frame.
    #[must_use]
    pub fn header(channel: u16, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Header,
            channel,
            payload,
        }
    }

    /// Build a body frame carrying one chunk of message content.
    #[must_use]
    pub fn body(channel: u16, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Body,
            channel,
            payload,
        }
    }

    /// Build a heartbeat frame.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self {
            frame_type: FrameType::Heartbeat,
            channel: 0,
            payload: Bytes::new(),
        }
    }

    /// Peek the class/method pair of a method frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] when the frame is not a method
    /// frame or the payload is shorter than the four id bytes.
    pub fn class_method(&self) -> Result<ClassMethod, CodecError> {
        if self.frame_type != FrameType::Method || self.payload.len() < 4 {
            return Err(CodecError::Malformed {
                context: "method frame class/method ids",
            });
        }
        let class = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let method = u16::from_be_bytes([self.payload[2], self.payload[3]]);
        Ok(ClassMethod { class, method })
    }
}

/// Identifier of a protocol operation: a class id and a method id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassMethod {
    /// Class the method belongs to.
    pub class: u16,
    /// Method within the class.
    pub method: u16,
}

impl ClassMethod {
    pub const CONNECTION_START: Self = Self::new(10, 10);
    pub const CONNECTION_START_OK: Self = Self::new(10, 11);
    pub const CONNECTION_TUNE: Self = Self::new(10, 30);
    pub const CONNECTION_TUNE_OK: Self = Self::new(10, 31);
    pub const CONNECTION_OPEN: Self = Self::new(10, 40);
    pub const CONNECTION_OPEN_OK: Self = Self::new(10, 41);
    pub const CONNECTION_CLOSE: Self = Self::new(10, 50);
    pub const CONNECTION_CLOSE_OK: Self = Self::new(10, 51);

    pub const CHANNEL_OPEN: Self = Self::new(20, 10);
    pub const CHANNEL_OPEN_OK: Self = Self::new(20, 11);
    pub const CHANNEL_CLOSE: Self = Self::new(20, 40);
    pub const CHANNEL_CLOSE_OK: Self = Self::new(20, 41);

    pub const EXCHANGE_DECLARE: Self = Self::new(40, 10);
    pub const EXCHANGE_DECLARE_OK: Self = Self::new(40, 11);

    pub const QUEUE_DECLARE: Self = Self::new(50, 10);
    pub const QUEUE_DECLARE_OK: Self = Self::new(50, 11);
    pub const QUEUE_BIND: Self = Self::new(50, 20);
    pub const QUEUE_BIND_OK: Self = Self::new(50, 21);
    pub const QUEUE_PURGE: Self = Self::new(50, 30);
    pub const QUEUE_PURGE_OK: Self = Self::new(50, 31);

    pub const BASIC_QOS: Self = Self::new(60, 10);
    pub const BASIC_QOS_OK: Self = Self::new(60, 11);
    pub const BASIC_CONSUME: Self = Self::new(60, 20);
    pub const BASIC_CONSUME_OK: Self = Self::new(60, 21);
    pub const BASIC_PUBLISH: Self = Self::new(60, 40);
    pub const BASIC_DELIVER: Self = Self::new(60, 60);
    pub const BASIC_ACK: Self = Self::new(60, 80);

    /// Construct a [`ClassMethod`] from raw ids.
    #[must_use]
    pub const fn new(class: u16, method: u16) -> Self {
        Self { class, method }
    }
}

impl std::fmt::Display for ClassMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.class, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_discriminants_round_trip() {
        for ty in [
            FrameType::Method,
            FrameType::Header,
            FrameType::Body,
            FrameType::Heartbeat,
        ] {
            assert_eq!(FrameType::try_from(ty as u8).expect("known type"), ty);
        }
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let err = FrameType::try_from(4).expect_err("4 is not a frame type");
        assert!(matches!(err, CodecError::UnknownFrameType { value: 4 }));
    }

    #[test]
    fn class_method_peek() {
        let frame = Frame::method(1, Bytes::from_static(&[0, 60, 0, 21, 0xFF]));
        assert_eq!(
            frame.class_method().expect("valid ids"),
            ClassMethod::BASIC_CONSUME_OK
        );
    }

    #[test]
    fn class_method_peek_rejects_short_payload() {
        let frame = Frame::method(1, Bytes::from_static(&[0, 60]));
        assert!(frame.class_method().is_err());
    }

    #[test]
    fn heartbeat_is_connection_level_and_empty() {
        let frame = Frame::heartbeat();
        assert_eq!(frame.channel, 0);
        assert!(frame.payload.is_empty());
    }
}

//! Method and content-header payload marshalling.
//!
//! AMQP 0-9-1 method frames carry `[class:2][method:2]` followed by
//! method-specific fields: big-endian integers, short strings
//! (`[len:1][bytes]`), long strings (`[len:4][bytes]`), packed bit flags,
//! and field tables. The engine writes field tables empty and skips them on
//! read; the table contents are not interpreted.
//!
//! Only the methods the engine speaks are implemented. Truncated or
//! malformed arguments surface as [`CodecError::Malformed`] rather than a
//! panic: the bytes come from the peer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::CodecError;
use crate::frame::ClassMethod;

/// Protocol greeting the client sends before any frame.
pub const PROTOCOL_HEADER: &[u8] = b"AMQP\x00\x00\x09\x01";

/// Protocol version the engine implements.
pub const VERSION: (u8, u8) = (0, 9);

fn malformed(context: &'static str) -> CodecError {
    CodecError::Malformed { context }
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

/// Cursor over a method payload's argument bytes.
pub(crate) struct ArgReader<'a> {
    buf: &'a [u8],
    context: &'static str,
}

impl<'a> ArgReader<'a> {
    pub(crate) fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self { buf, context }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(malformed(self.context));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub(crate) fn short_str(&mut self) -> Result<String, CodecError> {
        let len = usize::from(self.u8()?);
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed(self.context))
    }

    pub(crate) fn long_str(&mut self) -> Result<Bytes, CodecError> {
        let len = self.u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    /// Skip a field table without interpreting its entries.
    pub(crate) fn skip_table(&mut self) -> Result<(), CodecError> {
        let len = self.u32()? as usize;
        self.take(len)?;
        Ok(())
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

/// Builder for a method payload, starting with the class/method ids.
pub(crate) struct ArgWriter {
    buf: BytesMut,
}

impl ArgWriter {
    pub(crate) fn new(cm: ClassMethod) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(cm.class);
        buf.put_u16(cm.method);
        Self { buf }
    }

    pub(crate) fn u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    pub(crate) fn u16(mut self, v: u16) -> Self {
        self.buf.put_u16(v);
        self
    }

    pub(crate) fn u32(mut self, v: u32) -> Self {
        self.buf.put_u32(v);
        self
    }

    pub(crate) fn u64(mut self, v: u64) -> Self {
        self.buf.put_u64(v);
        self
    }

    /// Write a short string. Lengths above 255 cannot occur: every short
    /// string the engine sends is validated at the configuration boundary.
    pub(crate) fn short_str(mut self, s: &str) -> Self {
        debug_assert!(s.len() <= u8::MAX as usize);
        self.buf.put_u8(u8::try_from(s.len()).unwrap_or(u8::MAX));
        self.buf.put_slice(&s.as_bytes()[..s.len().min(255)]);
        self
    }

    pub(crate) fn long_str(mut self, s: &[u8]) -> Self {
        self.buf
            .put_u32(u32::try_from(s.len()).expect("long string below 4 GiB"));
        self.buf.put_slice(s);
        self
    }

    /// Write the flags in order, packed least-significant-bit first.
    pub(crate) fn bits(mut self, flags: &[bool]) -> Self {
        debug_assert!(flags.len() <= 8);
        let mut octet = 0u8;
        for (i, &flag) in flags.iter().enumerate() {
            if flag {
                octet |= 1 << i;
            }
        }
        self.buf.put_u8(octet);
        self
    }

    /// Write an empty field table.
    pub(crate) fn empty_table(mut self) -> Self {
        self.buf.put_u32(0);
        self
    }

    pub(crate) fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

// ---------------------------------------------------------------------------
// Outbound methods
// ---------------------------------------------------------------------------

/// `connection.start-ok` with PLAIN authentication.
#[must_use]
pub(crate) fn start_ok(user: &str, password: &str) -> Bytes {
    let mut response = Vec::with_capacity(user.len() + password.len() + 2);
    response.push(0);
    response.extend_from_slice(user.as_bytes());
    response.push(0);
    response.extend_from_slice(password.as_bytes());

    ArgWriter::new(ClassMethod::CONNECTION_START_OK)
        .empty_table()
        .short_str("PLAIN")
        .long_str(&response)
        .short_str("en_US")
        .finish()
}

/// `connection.tune-ok` echoing the parameters the client accepts.
#[must_use]
pub(crate) fn tune_ok(channel_max: u16, frame_max: u32, heartbeat: u16) -> Bytes {
    ArgWriter::new(ClassMethod::CONNECTION_TUNE_OK)
        .u16(channel_max)
        .u32(frame_max)
        .u16(heartbeat)
        .finish()
}

/// `connection.open` for a virtual host.
#[must_use]
pub(crate) fn connection_open(vhost: &str) -> Bytes {
    ArgWriter::new(ClassMethod::CONNECTION_OPEN)
        .short_str(vhost)
        .short_str("")
        .bits(&[false])
        .finish()
}

/// `connection.close` / `channel.close` share the same argument layout.
#[must_use]
pub(crate) fn close(cm: ClassMethod, reply_code: u16, reply_text: &str) -> Bytes {
    ArgWriter::new(cm)
        .u16(reply_code)
        .short_str(reply_text)
        .u16(0)
        .u16(0)
        .finish()
}

/// `connection.close-ok` / `channel.close-ok` carry no arguments.
#[must_use]
pub(crate) fn close_ok(cm: ClassMethod) -> Bytes {
    ArgWriter::new(cm).finish()
}

/// `channel.open`.
#[must_use]
pub(crate) fn channel_open() -> Bytes {
    ArgWriter::new(ClassMethod::CHANNEL_OPEN).short_str("").finish()
}

/// `exchange.declare`.
#[must_use]
pub(crate) fn exchange_declare(exchange: &str, kind: &str, durable: bool) -> Bytes {
    ArgWriter::new(ClassMethod::EXCHANGE_DECLARE)
        .u16(0)
        .short_str(exchange)
        .short_str(kind)
        // passive, durable, auto-delete, internal, no-wait
        .bits(&[false, durable, false, false, false])
        .empty_table()
        .finish()
}

/// `queue.declare`.
#[must_use]
pub(crate) fn queue_declare(queue: &str, durable: bool) -> Bytes {
    ArgWriter::new(ClassMethod::QUEUE_DECLARE)
        .u16(0)
        .short_str(queue)
        // passive, durable, exclusive, auto-delete, no-wait
        .bits(&[false, durable, false, false, false])
        .empty_table()
        .finish()
}

/// `queue.bind`.
#[must_use]
pub(crate) fn queue_bind(exchange: &str, queue: &str, routing_key: &str) -> Bytes {
    ArgWriter::new(ClassMethod::QUEUE_BIND)
        .u16(0)
        .short_str(queue)
        .short_str(exchange)
        .short_str(routing_key)
        .bits(&[false])
        .empty_table()
        .finish()
}

/// `queue.purge`.
#[must_use]
pub(crate) fn queue_purge(queue: &str) -> Bytes {
    ArgWriter::new(ClassMethod::QUEUE_PURGE)
        .u16(0)
        .short_str(queue)
        .bits(&[false])
        .finish()
}

/// `basic.qos`.
#[must_use]
pub(crate) fn basic_qos(prefetch_count: u16) -> Bytes {
    ArgWriter::new(ClassMethod::BASIC_QOS)
        .u32(0)
        .u16(prefetch_count)
        .bits(&[false])
        .finish()
}

/// `basic.consume` with an empty tag (the server assigns one). The no-ack
/// flag stays clear: deliveries are acknowledged explicitly.
#[must_use]
pub(crate) fn basic_consume(queue: &str) -> Bytes {
    ArgWriter::new(ClassMethod::BASIC_CONSUME)
        .u16(0)
        .short_str(queue)
        .short_str("")
        // no-local, no-ack, exclusive, no-wait
        .bits(&[false, false, false, false])
        .empty_table()
        .finish()
}

/// `basic.publish`.
#[must_use]
pub(crate) fn basic_publish(exchange: &str, routing_key: &str) -> Bytes {
    ArgWriter::new(ClassMethod::BASIC_PUBLISH)
        .u16(0)
        .short_str(exchange)
        .short_str(routing_key)
        // mandatory, immediate
        .bits(&[false, false])
        .finish()
}

/// `basic.ack`.
#[must_use]
pub(crate) fn basic_ack(delivery_tag: u64) -> Bytes {
    ArgWriter::new(ClassMethod::BASIC_ACK)
        .u64(delivery_tag)
        .bits(&[false])
        .finish()
}

// ---------------------------------------------------------------------------
// Inbound methods
// ---------------------------------------------------------------------------

/// Arguments of `connection.start`.
#[derive(Clone, Debug)]
pub(crate) struct Start {
    pub version_major: u8,
    pub version_minor: u8,
}

pub(crate) fn parse_start(args: &[u8]) -> Result<Start, CodecError> {
    let mut r = ArgReader::new(args, "connection.start arguments");
    let version_major = r.u8()?;
    let version_minor = r.u8()?;
    r.skip_table()?;
    r.long_str()?;
    r.long_str()?;
    Ok(Start {
        version_major,
        version_minor,
    })
}

/// Arguments of `connection.tune`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Tune {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

pub(crate) fn parse_tune(args: &[u8]) -> Result<Tune, CodecError> {
    let mut r = ArgReader::new(args, "connection.tune arguments");
    Ok(Tune {
        channel_max: r.u16()?,
        frame_max: r.u32()?,
        heartbeat: r.u16()?,
    })
}

/// Arguments of `connection.close` and `channel.close`.
#[derive(Clone, Debug)]
pub(crate) struct Close {
    pub reply_code: u16,
    pub reply_text: String,
}

pub(crate) fn parse_close(args: &[u8]) -> Result<Close, CodecError> {
    let mut r = ArgReader::new(args, "close arguments");
    Ok(Close {
        reply_code: r.u16()?,
        reply_text: r.short_str()?,
    })
}

/// Arguments of `queue.declare-ok`.
#[derive(Clone, Debug)]
pub(crate) struct QueueDeclareOk {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

pub(crate) fn parse_queue_declare_ok(args: &[u8]) -> Result<QueueDeclareOk, CodecError> {
    let mut r = ArgReader::new(args, "queue.declare-ok arguments");
    Ok(QueueDeclareOk {
        queue: r.short_str()?,
        message_count: r.u32()?,
        consumer_count: r.u32()?,
    })
}

pub(crate) fn parse_consume_ok(args: &[u8]) -> Result<String, CodecError> {
    let mut r = ArgReader::new(args, "basic.consume-ok arguments");
    r.short_str()
}

/// Arguments of `basic.deliver`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Deliver {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

pub(crate) fn parse_deliver(args: &[u8]) -> Result<Deliver, CodecError> {
    let mut r = ArgReader::new(args, "basic.deliver arguments");
    Ok(Deliver {
        consumer_tag: r.short_str()?,
        delivery_tag: r.u64()?,
        redelivered: r.u8()? & 1 != 0,
        exchange: r.short_str()?,
        routing_key: r.short_str()?,
    })
}

// ---------------------------------------------------------------------------
// Content header
// ---------------------------------------------------------------------------

/// Payload of a content header frame: the class it belongs to, the total
/// body size, and the raw property bytes (flags included), carried opaquely
/// as delivery metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ContentHeader {
    pub class: u16,
    pub body_size: u64,
    pub properties: Bytes,
}

impl ContentHeader {
    pub(crate) fn for_publish(body_size: u64) -> Self {
        Self {
            class: ClassMethod::BASIC_PUBLISH.class,
            body_size,
            // property flags only, all clear
            properties: Bytes::from_static(&[0, 0]),
        }
    }

    #[must_use]
    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.properties.len());
        buf.put_u16(self.class);
        buf.put_u16(0);
        buf.put_u64(self.body_size);
        buf.extend_from_slice(&self.properties);
        buf.freeze()
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ArgReader::new(payload, "content header");
        let class = r.u16()?;
        let _weight = r.u16()?;
        let body_size = r.u64()?;
        let properties = Bytes::copy_from_slice(r.remaining());
        if properties.len() < 2 {
            return Err(malformed("content header"));
        }
        Ok(Self {
            class,
            body_size,
            properties,
        })
    }
}

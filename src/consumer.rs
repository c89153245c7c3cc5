//! Consumer-side message reassembly.
//!
//! A broker delivers one logical message as a run of frames on the
//! consumer's channel: a `basic.deliver` method frame, a content header
//! declaring the body size, and zero or more body frames. [`Reassembler`]
//! merges that run back into a single [`Delivery`], firing the registered
//! phase callbacks along the way and the composite `received` callback once
//! the declared size has been reached.
//!
//! One reassembler exists per consumer tag. A new deliver frame while a
//! message is still being accumulated, or body bytes beyond the declared
//! size, are protocol violations: the accumulation is discarded with an
//! error rather than silently merged.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::deferred::Deferred;
use crate::method::{ContentHeader, Deliver};

/// Errors raised while reassembling a consumed message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    /// A deliver frame arrived while a message was still accumulating.
    #[error("new delivery for consumer {tag} while a message is still being assembled")]
    DeliverWhileAssembling {
        /// Consumer tag the overlapping delivery arrived on.
        tag: String,
    },

    /// A content header arrived with no deliver frame before it.
    #[error("content header without a preceding delivery")]
    HeaderWithoutDeliver,

    /// A body frame arrived before the content header.
    #[error("body frame without a preceding content header")]
    BodyWithoutHeader,

    /// Accumulated body bytes exceeded the size the header declared.
    #[error("body overflow: header declared {declared} bytes, received {received}")]
    BodyOverflow {
        /// Size the content header declared.
        declared: u64,
        /// Bytes received including the overflowing frame.
        received: u64,
    },
}

/// A fully reassembled consumed message with its delivery metadata.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Consumer the message was delivered to.
    pub consumer_tag: String,
    /// Channel-scoped, monotonically increasing delivery identifier used
    /// to acknowledge this message.
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Raw property bytes from the content header.
    pub properties: Bytes,
    /// The complete message body.
    pub body: Bytes,
}

type BeginFn = Box<dyn FnMut(&str) + Send>;
type SizeFn = Box<dyn FnMut(u64) + Send>;
type HeadersFn = Box<dyn FnMut(&[u8]) + Send>;
type DataFn = Box<dyn FnMut(&[u8]) + Send>;
type DeliveredFn = Box<dyn FnMut(&Delivery) + Send>;

/// Callback slots a consumer may populate. Phase callbacks and the
/// composite `received` callback are independently optional.
#[derive(Default)]
pub(crate) struct ConsumerCallbacks {
    pub(crate) begin: Option<BeginFn>,
    pub(crate) size: Option<SizeFn>,
    pub(crate) headers: Option<HeadersFn>,
    pub(crate) data: Option<DataFn>,
    pub(crate) complete: Option<DeliveredFn>,
    pub(crate) received: Option<DeliveredFn>,
}

/// When the channel acknowledges deliveries on the consumer's behalf.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge each delivery right after its callbacks return.
    #[default]
    AutoAfterDelivery,
    /// The embedder calls [`Channel::ack`](crate::channel::Channel::ack)
    /// itself.
    Manual,
}

enum Phase {
    Idle,
    AwaitingHeader {
        deliver: Deliver,
    },
    Accumulating {
        deliver: Deliver,
        properties: Bytes,
        declared: u64,
        body: BytesMut,
    },
}

/// Per-consumer state machine merging deliver/header/body frame runs.
pub(crate) struct Reassembler {
    tag: String,
    ack_policy: AckPolicy,
    callbacks: ConsumerCallbacks,
    phase: Phase,
}

impl Reassembler {
    pub(crate) fn new(tag: String, ack_policy: AckPolicy, callbacks: ConsumerCallbacks) -> Self {
        Self {
            tag,
            ack_policy,
            callbacks,
            phase: Phase::Idle,
        }
    }

    pub(crate) fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    /// Start a new accumulation from a deliver frame.
    pub(crate) fn begin(&mut self, deliver: Deliver) -> Result<(), ReassemblyError> {
        if !matches!(self.phase, Phase::Idle) {
            self.phase = Phase::Idle;
            return Err(ReassemblyError::DeliverWhileAssembling {
                tag: self.tag.clone(),
            });
        }
        if let Some(callback) = &mut self.callbacks.begin {
            callback(&deliver.consumer_tag);
        }
        self.phase = Phase::AwaitingHeader { deliver };
        Ok(())
    }

    /// Accept the content header. Zero-length bodies complete immediately.
    pub(crate) fn header(
        &mut self,
        header: &ContentHeader,
    ) -> Result<Option<Delivery>, ReassemblyError> {
        let Phase::AwaitingHeader { deliver } = std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            return Err(ReassemblyError::HeaderWithoutDeliver);
        };

        if let Some(callback) = &mut self.callbacks.size {
            callback(header.body_size);
        }
        if let Some(callback) = &mut self.callbacks.headers {
            callback(&header.properties);
        }

        if header.body_size == 0 {
            return Ok(Some(self.emit(deliver, header.properties.clone(), Bytes::new())));
        }

        self.phase = Phase::Accumulating {
            deliver,
            properties: header.properties.clone(),
            declared: header.body_size,
            body: BytesMut::with_capacity(usize::try_from(header.body_size).unwrap_or(0)),
        };
        Ok(None)
    }

    /// Accept one body frame; returns the delivery once the declared size
    /// is reached.
    pub(crate) fn data(&mut self, chunk: &Bytes) -> Result<Option<Delivery>, ReassemblyError> {
        let Phase::Accumulating {
            deliver,
            properties,
            declared,
            mut body,
        } = std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            return Err(ReassemblyError::BodyWithoutHeader);
        };

        let received = body.len() as u64 + chunk.len() as u64;
        if received > declared {
            return Err(ReassemblyError::BodyOverflow { declared, received });
        }

        if let Some(callback) = &mut self.callbacks.data {
            callback(chunk);
        }
        body.extend_from_slice(chunk);

        if received == declared {
            return Ok(Some(self.emit(deliver, properties, body.freeze())));
        }

        self.phase = Phase::Accumulating {
            deliver,
            properties,
            declared,
            body,
        };
        Ok(None)
    }

    fn emit(&mut self, deliver: Deliver, properties: Bytes, body: Bytes) -> Delivery {
        let delivery = Delivery {
            consumer_tag: deliver.consumer_tag,
            delivery_tag: deliver.delivery_tag,
            redelivered: deliver.redelivered,
            exchange: deliver.exchange,
            routing_key: deliver.routing_key,
            properties,
            body,
        };
        if let Some(callback) = &mut self.callbacks.complete {
            callback(&delivery);
        }
        if let Some(callback) = &mut self.callbacks.received {
            callback(&delivery);
        }
        delivery
    }
}

/// Pending consume request: a [`Deferred`] extended with the consumer
/// callback slots.
///
/// Callbacks registered here travel onto the consumer's [`Reassembler`]
/// when the broker confirms the subscription, so register them fluently
/// right after calling [`Channel::consume`](crate::channel::Channel::consume),
/// before the confirmation can possibly arrive.
#[derive(Clone)]
pub struct DeferredConsumer {
    deferred: Deferred,
    callbacks: Arc<Mutex<ConsumerCallbacks>>,
    ack_policy: Arc<Mutex<AckPolicy>>,
}

impl DeferredConsumer {
    pub(crate) fn new(deferred: Deferred) -> Self {
        Self {
            deferred,
            callbacks: Arc::new(Mutex::new(ConsumerCallbacks::default())),
            ack_policy: Arc::new(Mutex::new(AckPolicy::default())),
        }
    }

    /// The underlying deferred handle.
    #[must_use]
    pub fn deferred(&self) -> &Deferred {
        &self.deferred
    }

    pub(crate) fn take_callbacks(&self) -> (ConsumerCallbacks, AckPolicy) {
        (
            std::mem::take(&mut *self.callbacks.lock().expect("consumer callbacks lock")),
            *self.ack_policy.lock().expect("ack policy lock"),
        )
    }

    /// Register the success callback; it receives the server-assigned
    /// consumer tag.
    #[must_use]
    pub fn on_success(self, callback: impl FnOnce(&str) + Send + 'static) -> Self {
        let deferred = self.deferred.clone().on_success(move |payload| {
            callback(&String::from_utf8_lossy(&payload));
        });
        Self { deferred, ..self }
    }

    /// Register the error callback.
    #[must_use]
    pub fn on_error(self, callback: impl FnOnce(&str) + Send + 'static) -> Self {
        let deferred = self.deferred.clone().on_error(callback);
        Self { deferred, ..self }
    }

    /// Choose how deliveries are acknowledged. The default acknowledges
    /// automatically after the delivery callbacks return.
    #[must_use]
    pub fn with_ack_policy(self, policy: AckPolicy) -> Self {
        *self.ack_policy.lock().expect("ack policy lock") = policy;
        self
    }

    /// Called when the first frame of a new message arrives.
    #[must_use]
    pub fn on_begin(self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.callbacks.lock().expect("consumer callbacks lock").begin = Some(Box::new(callback));
        self
    }

    /// Called when the message size is known.
    #[must_use]
    pub fn on_size(self, callback: impl FnMut(u64) + Send + 'static) -> Self {
        self.callbacks.lock().expect("consumer callbacks lock").size = Some(Box::new(callback));
        self
    }

    /// Called with the raw header property bytes.
    #[must_use]
    pub fn on_headers(self, callback: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.callbacks.lock().expect("consumer callbacks lock").headers = Some(Box::new(callback));
        self
    }

    /// Called for each chunk of body data, zero or more times per message.
    #[must_use]
    pub fn on_data(self, callback: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.callbacks.lock().expect("consumer callbacks lock").data = Some(Box::new(callback));
        self
    }

    /// Called once the message is complete, with delivery metadata.
    #[must_use]
    pub fn on_complete(self, callback: impl FnMut(&Delivery) + Send + 'static) -> Self {
        self.callbacks.lock().expect("consumer callbacks lock").complete = Some(Box::new(callback));
        self
    }

    /// Composite callback: one invocation per fully assembled message.
    #[must_use]
    pub fn on_received(self, callback: impl FnMut(&Delivery) + Send + 'static) -> Self {
        self.callbacks.lock().expect("consumer callbacks lock").received = Some(Box::new(callback));
        self
    }
}

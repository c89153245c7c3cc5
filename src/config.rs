//! Broker endpoint configuration and client roles.
//!
//! [`MqInfo`] names everything the client needs to reach a broker and wire
//! an exchange to a queue. It is immutable once the client starts. The
//! exchange type is validated against the fixed protocol set locally, so a
//! typo is rejected before any bytes are sent.

use std::str::FromStr;

use crate::error::MqError;

/// Login credentials presented during the connection handshake.
#[derive(Clone)]
pub struct Login {
    /// User name.
    pub user: String,
    /// Password, sent via the PLAIN mechanism.
    pub password: String,
}

impl Login {
    /// Construct credentials.
    #[must_use]
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Login {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Login")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The fixed set of exchange types the protocol defines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route on an exact routing-key match.
    Direct,
    /// Route to every bound queue.
    Fanout,
    /// Route on a dotted-pattern routing-key match.
    Topic,
    /// Route on message header values.
    Headers,
}

impl ExchangeKind {
    /// Wire name of the exchange type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            other => Err(MqError::config(format!("unknown exchange type: {other}"))),
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which sides of the messaging contract this client participates in.
///
/// A role gates operations: publishing requires [`Roles::PUBLISHER`],
/// consuming requires [`Roles::CONSUMER`]. A fatal error demotes the
/// client to [`Roles::NONE`], suppressing further operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Roles {
    publisher: bool,
    consumer: bool,
}

impl Roles {
    /// No roles; every gated operation fails.
    pub const NONE: Self = Self {
        publisher: false,
        consumer: false,
    };

    /// Publisher only.
    pub const PUBLISHER: Self = Self {
        publisher: true,
        consumer: false,
    };

    /// Consumer only.
    pub const CONSUMER: Self = Self {
        publisher: false,
        consumer: true,
    };

    /// Both publisher and consumer.
    pub const BOTH: Self = Self {
        publisher: true,
        consumer: true,
    };

    /// Whether the publisher role is present.
    #[must_use]
    pub fn is_publisher(&self) -> bool {
        self.publisher
    }

    /// Whether the consumer role is present.
    #[must_use]
    pub fn is_consumer(&self) -> bool {
        self.consumer
    }

    /// Whether no role is present.
    #[must_use]
    pub fn is_none(&self) -> bool {
        !self.publisher && !self.consumer
    }
}

/// Everything needed to reach a broker and wire an exchange to a queue.
#[derive(Clone, Debug)]
pub struct MqInfo {
    /// Broker host name or address. Carried for the embedder's transport;
    /// the engine itself never dials.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Login credentials.
    pub login: Login,
    /// Virtual host to open.
    pub vhost: String,
    /// Exchange to declare and publish to.
    pub exchange: String,
    /// Type of the exchange.
    pub exchange_kind: ExchangeKind,
    /// Queue to declare and consume from.
    pub queue: String,
    /// Routing key for published messages. Empty means "use the queue name".
    pub routing_key: String,
    /// Binding key tying the queue to the exchange. Empty means "use the
    /// queue name".
    pub binding_key: String,
}

impl MqInfo {
    /// Routing key actually used when publishing.
    #[must_use]
    pub fn effective_routing_key(&self) -> &str {
        if self.routing_key.is_empty() {
            &self.queue
        } else {
            &self.routing_key
        }
    }

    /// Binding key actually used when binding the queue.
    #[must_use]
    pub fn effective_binding_key(&self) -> &str {
        if self.binding_key.is_empty() {
            &self.queue
        } else {
            &self.binding_key
        }
    }

    /// Check the fields that must be non-empty before any frame is built.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<(), MqError> {
        if self.exchange.is_empty() {
            return Err(MqError::config("exchange name is empty"));
        }
        if self.queue.is_empty() {
            return Err(MqError::config("queue name is empty"));
        }
        if self.exchange.len() > 255 || self.queue.len() > 255 {
            return Err(MqError::config("exchange and queue names are limited to 255 bytes"));
        }
        if self.effective_routing_key().len() > 255 || self.effective_binding_key().len() > 255 {
            return Err(MqError::config("routing and binding keys are limited to 255 bytes"));
        }
        Ok(())
    }
}

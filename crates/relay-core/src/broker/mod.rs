// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message broker abstraction.
//!
//! A [`Broker`] is a thin transport over one topic exchange. Routing key
//! rules live in [`routing`]; the request/admin channel semantics live in
//! [`BrokerGateway`].

pub mod amqp;
pub mod gateway;
pub mod memory;
pub mod routing;

pub use self::amqp::AmqpBroker;
pub use self::gateway::{BrokerGateway, GatewayConfig};
pub use self::memory::MemoryBroker;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use relay_model::QueueDefinition;
use thiserror::Error;

/// Broker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// A mandatory publish matched no queue.
    #[error("no queue bound for routing key '{routing_key}'")]
    Unroutable {
        /// Key that failed to route.
        routing_key: String,
    },

    /// The broker rejected a publish.
    #[error("publish to '{routing_key}' was not acknowledged")]
    Nacked {
        /// Key of the rejected publish.
        routing_key: String,
    },

    /// Queue does not exist.
    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    /// Operation exceeded its time budget.
    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),

    /// Connection or channel failure.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// Management API failure.
    #[error("broker management error: {0}")]
    Management(String),
}

impl From<lapin::Error> for BrokerError {
    fn from(error: lapin::Error) -> Self {
        Self::Connection(error.to_string())
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(error: reqwest::Error) -> Self {
        Self::Management(error.to_string())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    /// Body bytes.
    pub body: Vec<u8>,
    /// String headers, e.g. `request_id`.
    pub headers: BTreeMap<String, String>,
    /// Content type.
    pub content_type: String,
    /// Publishing application.
    pub app_id: String,
    /// Per-message TTL.
    pub expiration: Option<Duration>,
    /// Priority.
    pub priority: Option<u8>,
}

/// A message taken off a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Body bytes.
    pub body: Vec<u8>,
    /// String headers.
    pub headers: BTreeMap<String, String>,
}

/// Topic exchange transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short name recorded as an instance's `queue_type`.
    fn kind(&self) -> &'static str;

    /// Connection URL handed to plugins authenticating as `user`.
    fn plugin_url(&self, user: &str, password: &str) -> String;

    /// Declare a durable topic exchange. Idempotent.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a queue. Idempotent for identical arguments.
    async fn declare_queue(&self, queue: &QueueDefinition) -> Result<()>;

    /// Bind a queue to the exchange under a routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish with `mandatory` set and wait for the broker's confirm.
    /// Fails with [`BrokerError::Unroutable`] when no queue matched.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()>;

    /// Take one message without requeueing it. `None` when empty.
    async fn get_message(&self, queue: &str) -> Result<Option<InboundMessage>>;

    /// Current depth. [`BrokerError::QueueNotFound`] when missing.
    async fn message_count(&self, queue: &str) -> Result<u32>;

    /// Delete a queue. [`BrokerError::QueueNotFound`] when missing.
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Forcibly close every connection consuming from `queue`.
    async fn disconnect_consumers(&self, queue: &str) -> Result<()>;

    /// Apply a TTL to queues whose name matches `pattern`.
    async fn set_queue_expiry_policy(&self, name: &str, pattern: &str, ttl: Duration)
    -> Result<()>;

    /// Connectivity probe.
    async fn is_alive(&self) -> bool;
}

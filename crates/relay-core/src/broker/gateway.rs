// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker gateway.
//!
//! Owns the two logical channels on the topic exchange:
//!
//! - **request**: `system.version.instance`, one durable priority queue per
//!   instance, messages carry the serialised request and a `request_id`
//!   header.
//! - **admin**: `admin`-prefixed keys, one auto-delete queue per instance
//!   bound to every prefix of its key, used for `_start`, `_stop` and
//!   `_status` control messages.
//!
//! Single publishes are bounded by the configured publish timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use relay_model::{
    CommandType, Instance, QueueArgs, QueueDefinition, QueueInfo, Request, RequestStatus,
    RequestUpdate, System,
};
use serde_json::json;
use tracing::{debug, info, warn};

use super::routing::{self, ADMIN_PREFIX};
use super::{Broker, BrokerError, OutboundMessage, Result};
use crate::catalog::Catalog;
use crate::wait_map::BlockingWaitMap;

/// Control command asking a plugin to start consuming.
pub const START_COMMAND: &str = "_start";
/// Control command asking a plugin to shut down.
pub const STOP_COMMAND: &str = "_stop";
/// Control command asking a plugin to report a heartbeat.
pub const STATUS_COMMAND: &str = "_status";

/// Name of the admin queue expiry policy.
pub const ADMIN_EXPIRY_POLICY: &str = "admin_queue_expiry";

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Topic exchange.
    pub exchange: String,
    /// `app_id` stamped on every message.
    pub app_id: String,
    /// Upper bound on a single publish.
    pub publish_timeout: Duration,
    /// TTL for abandoned admin queues.
    pub admin_expiry: Duration,
    /// Broker user handed to plugins.
    pub plugin_user: String,
    /// Broker password handed to plugins.
    pub plugin_password: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            exchange: "relay".to_string(),
            app_id: "relay".to_string(),
            publish_timeout: Duration::from_secs(5),
            admin_expiry: Duration::from_secs(3600),
            plugin_user: "guest".to_string(),
            plugin_password: "guest".to_string(),
        }
    }
}

/// Request and admin channels over one topic exchange.
pub struct BrokerGateway {
    broker: Arc<dyn Broker>,
    catalog: Arc<dyn Catalog>,
    config: GatewayConfig,
    wait_map: Arc<BlockingWaitMap>,
}

impl BrokerGateway {
    /// Create a gateway.
    pub fn new(broker: Arc<dyn Broker>, catalog: Arc<dyn Catalog>, config: GatewayConfig) -> Self {
        Self {
            broker,
            catalog,
            config,
            wait_map: Arc::new(BlockingWaitMap::new()),
        }
    }

    /// Share `wait_map` so requests cancelled by a queue clear wake their
    /// blocking callers.
    pub fn with_wait_map(mut self, wait_map: Arc<BlockingWaitMap>) -> Self {
        self.wait_map = wait_map;
        self
    }

    /// Waiters woken when a cleared request is cancelled.
    pub fn wait_map(&self) -> &Arc<BlockingWaitMap> {
        &self.wait_map
    }

    /// Underlying transport.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Gateway settings.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Declare the topic exchange and publish the admin queue expiry policy.
    pub async fn declare_exchange(&self) -> Result<()> {
        self.broker.declare_exchange(&self.config.exchange).await?;
        self.broker
            .set_queue_expiry_policy(
                ADMIN_EXPIRY_POLICY,
                &format!("^{ADMIN_PREFIX}.*"),
                self.config.admin_expiry,
            )
            .await?;
        info!(exchange = %self.config.exchange, "Exchange declared");
        Ok(())
    }

    /// Create a queue and bind it to every key.
    pub async fn setup_queue(
        &self,
        name: &str,
        args: QueueArgs,
        routing_keys: &[String],
    ) -> Result<QueueDefinition> {
        let definition = QueueDefinition {
            name: name.to_string(),
            args,
        };
        self.broker.declare_queue(&definition).await?;
        for key in routing_keys {
            self.broker
                .bind_queue(name, &self.config.exchange, key)
                .await?;
        }
        debug!(queue = name, keys = ?routing_keys, "Queue set up");
        Ok(definition)
    }

    /// Provision the request and admin queues of an instance.
    pub async fn setup_instance_queues(
        &self,
        system: &System,
        instance: &Instance,
    ) -> Result<QueueInfo> {
        let request_name = routing::request_key(&system.name, &system.version, &instance.name);
        let mut request_args = QueueArgs {
            durable: true,
            auto_delete: false,
            arguments: BTreeMap::new(),
        };
        request_args
            .arguments
            .insert("x-max-priority".to_string(), json!(1));
        let request = self
            .setup_queue(
                &request_name,
                request_args,
                &routing::request_binding_keys(
                    &system.name,
                    &system.version,
                    &instance.name,
                    None,
                ),
            )
            .await?;

        let admin_name = routing::admin_queue_name(&system.name, &system.version, &instance.name);
        let admin = self
            .setup_queue(
                &admin_name,
                QueueArgs {
                    durable: false,
                    auto_delete: true,
                    arguments: BTreeMap::new(),
                },
                &routing::admin_binding_keys(&system.name, &system.version, &instance.name, None),
            )
            .await?;

        Ok(QueueInfo {
            admin: Some(admin),
            request: Some(request),
            url: Some(
                self.broker
                    .plugin_url(&self.config.plugin_user, &self.config.plugin_password),
            ),
        })
    }

    async fn publish_bounded(&self, routing_key: &str, message: OutboundMessage) -> Result<()> {
        let timeout = self.config.publish_timeout;
        tokio::time::timeout(
            timeout,
            self.broker
                .publish(&self.config.exchange, routing_key, message),
        )
        .await
        .map_err(|_| BrokerError::Timeout(timeout))?
    }

    fn message(&self, request: &Request) -> Result<OutboundMessage> {
        let body = serde_json::to_vec(request)
            .map_err(|e| BrokerError::Connection(format!("cannot encode request: {e}")))?;
        let mut headers = BTreeMap::new();
        if let Some(id) = &request.id {
            headers.insert("request_id".to_string(), id.clone());
        }
        Ok(OutboundMessage {
            body,
            headers,
            content_type: "text/plain".to_string(),
            app_id: self.config.app_id.clone(),
            expiration: None,
            priority: None,
        })
    }

    /// Publish a request on its instance's routing key, or `routing_key`.
    pub async fn publish_request(&self, request: &Request, routing_key: Option<&str>) -> Result<()> {
        let key = match routing_key {
            Some(key) => key.to_string(),
            None => routing::request_key(
                &request.system,
                &request.system_version,
                &request.instance_name,
            ),
        };
        let message = self.message(request)?;
        self.publish_bounded(&key, message).await?;
        debug!(request = %request, routing_key = %key, "Request published");
        Ok(())
    }

    /// Publish an ephemeral control command on an admin key.
    pub async fn publish_admin(
        &self,
        command: &str,
        routing_key: &str,
        target: Option<(&System, &Instance)>,
        expiration: Option<Duration>,
    ) -> Result<()> {
        let mut request = match target {
            Some((system, instance)) => {
                Request::new(&system.name, &system.version, &instance.name, command)
            }
            None => Request::new("", "", "", command),
        };
        request.command_type = Some(CommandType::Ephemeral);
        request.id = Some(uuid::Uuid::new_v4().to_string());

        let mut message = self.message(&request)?;
        message.expiration = expiration;
        self.publish_bounded(routing_key, message).await
    }

    /// Admin key of an instance.
    pub fn admin_key(system: &System, instance: &Instance) -> String {
        routing::admin_key(&system.name, &system.version, &instance.name, None)
    }

    /// Queue depth, `None` when the queue does not exist.
    pub async fn queue_message_count(&self, queue: &str) -> Result<Option<u32>> {
        match self.broker.message_count(queue).await {
            Ok(count) => Ok(Some(count)),
            Err(BrokerError::QueueNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Drain a queue one message at a time, cancelling each request found.
    ///
    /// Trusts the initial depth but stops early if the broker runs dry
    /// first, since consumers may race the purge. Returns messages removed.
    pub async fn clear_queue(&self, queue: &str) -> Result<u32> {
        let Some(depth) = self.queue_message_count(queue).await? else {
            return Ok(0);
        };

        let mut removed = 0;
        for _ in 0..depth {
            let Some(message) = self.broker.get_message(queue).await? else {
                debug!(queue, removed, depth, "Queue emptied before counted depth");
                break;
            };
            removed += 1;

            let request: Request = match serde_json::from_slice(&message.body) {
                Ok(request) => request,
                Err(e) => {
                    warn!(queue, error = %e, "Discarded unparseable message");
                    continue;
                }
            };
            let Some(id) = request.id.or_else(|| message.headers.get("request_id").cloned())
            else {
                continue;
            };
            match self
                .catalog
                .update_request(&id, &RequestUpdate::status(RequestStatus::Canceled))
                .await
            {
                Ok((_, outcome)) if outcome.completed => {
                    self.wait_map.signal(&id);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(request_id = %id, error = %e, "Could not cancel cleared request")
                }
            }
        }
        info!(queue, removed, "Queue cleared");
        Ok(removed)
    }

    /// Best-effort queue teardown: optionally drop consumers, clear, delete.
    ///
    /// A missing queue at any step is ignored; other failures are logged and
    /// the remaining steps still run.
    pub async fn destroy_queue(&self, queue: &str, force_disconnect: bool) {
        if force_disconnect {
            match self.broker.disconnect_consumers(queue).await {
                Ok(()) | Err(BrokerError::QueueNotFound(_)) => {}
                Err(e) => warn!(queue, error = %e, "Failed to disconnect consumers"),
            }
        }

        match self.clear_queue(queue).await {
            Ok(_) | Err(BrokerError::QueueNotFound(_)) => {}
            Err(e) => warn!(queue, error = %e, "Failed to clear queue"),
        }

        match self.broker.delete_queue(queue).await {
            Ok(()) => info!(queue, "Queue deleted"),
            Err(BrokerError::QueueNotFound(_)) => {}
            Err(e) => warn!(queue, error = %e, "Failed to delete queue"),
        }
    }

    /// Short-timeout liveness probe.
    pub async fn is_alive(&self) -> bool {
        tokio::time::timeout(Duration::from_secs(2), self.broker.is_alive())
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::catalog::MemoryCatalog;

    fn gateway() -> (Arc<MemoryBroker>, Arc<MemoryCatalog>, BrokerGateway) {
        let broker = Arc::new(MemoryBroker::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let gateway = BrokerGateway::new(
            broker.clone(),
            catalog.clone(),
            GatewayConfig::default(),
        );
        (broker, catalog, gateway)
    }

    fn echo() -> (System, Instance) {
        (System::new("echo", "1.0.0"), Instance::new("default"))
    }

    #[tokio::test]
    async fn test_declare_exchange_sets_policy() {
        let (broker, _, gateway) = gateway();
        gateway.declare_exchange().await.unwrap();
        let policies = broker.policies();
        let (pattern, ttl) = &policies[ADMIN_EXPIRY_POLICY];
        assert_eq!(pattern, "^admin.*");
        assert_eq!(*ttl, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_instance_queues() {
        let (broker, _, gateway) = gateway();
        let (system, instance) = echo();
        let info = gateway
            .setup_instance_queues(&system, &instance)
            .await
            .unwrap();

        let request = info.request.unwrap();
        assert_eq!(request.name, "echo.1-0-0.default");
        assert!(request.args.durable);
        assert_eq!(request.args.arguments["x-max-priority"], json!(1));

        let admin = info.admin.unwrap();
        assert!(admin.args.auto_delete);
        assert_eq!(broker.bindings(&admin.name).len(), 4);
        assert!(info.url.is_some());
    }

    #[tokio::test]
    async fn test_publish_request_header_and_key() {
        let (broker, _, gateway) = gateway();
        let (system, instance) = echo();
        gateway
            .setup_instance_queues(&system, &instance)
            .await
            .unwrap();

        let mut request = Request::new("echo", "1.0.0", "default", "say");
        request.id = Some("r-1".into());
        gateway.publish_request(&request, None).await.unwrap();

        let messages = broker.peek("echo.1-0-0.default");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message.headers["request_id"], "r-1");
        assert_eq!(messages[0].message.content_type, "text/plain");
        assert_eq!(messages[0].message.app_id, "relay");
    }

    #[tokio::test]
    async fn test_unroutable_request() {
        let (_, _, gateway) = gateway();
        let request = Request::new("ghost", "1.0.0", "default", "say");
        let err = gateway.publish_request(&request, None).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unroutable { .. }));
    }

    #[tokio::test]
    async fn test_admin_fanout_reaches_every_instance() {
        let (broker, _, gateway) = gateway();
        let system = System::new("echo", "1.0.0");
        let a = gateway
            .setup_instance_queues(&system, &Instance::new("a"))
            .await
            .unwrap();
        let b = gateway
            .setup_instance_queues(&system, &Instance::new("b"))
            .await
            .unwrap();

        gateway
            .publish_admin(STATUS_COMMAND, ADMIN_PREFIX, None, None)
            .await
            .unwrap();
        assert_eq!(broker.peek(&a.admin.unwrap().name).len(), 1);
        assert_eq!(broker.peek(&b.admin.unwrap().name).len(), 1);
        assert!(broker.peek(&a.request.unwrap().name).is_empty());
    }

    #[tokio::test]
    async fn test_clear_queue_cancels_requests() {
        let (broker, catalog, gateway) = gateway();
        let (system, instance) = echo();
        let info = gateway
            .setup_instance_queues(&system, &instance)
            .await
            .unwrap();
        let queue = info.request.unwrap().name;

        let stored = catalog
            .create_request(Request::new("echo", "1.0.0", "default", "say"))
            .await
            .unwrap();
        let id = stored.id.clone().unwrap();
        let waiter = gateway.wait_map().register(&id);
        gateway.publish_request(&stored, None).await.unwrap();

        assert_eq!(gateway.clear_queue(&queue).await.unwrap(), 1);
        assert_eq!(broker.message_count(&queue).await.unwrap(), 0);
        let reloaded = catalog.get_request(&id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, RequestStatus::Canceled);
        assert!(waiter.wait(Some(Duration::from_millis(10))).await);
    }

    #[tokio::test]
    async fn test_message_count_unknown_for_missing_queue() {
        let (_, _, gateway) = gateway();
        assert_eq!(gateway.queue_message_count("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_destroy_queue_is_best_effort() {
        let (broker, _, gateway) = gateway();
        let (system, instance) = echo();
        let info = gateway
            .setup_instance_queues(&system, &instance)
            .await
            .unwrap();
        let queue = info.request.unwrap().name;
        broker.attach_consumer(&queue);

        gateway.destroy_queue(&queue, true).await;
        assert!(!broker.queue_names().contains(&queue));

        // Second teardown hits missing queues at every step and still returns.
        gateway.destroy_queue(&queue, true).await;
    }
}

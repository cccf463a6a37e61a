// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RabbitMQ backend.
//!
//! AMQP traffic goes through `lapin` on one long-lived connection with a
//! fresh channel per operation. Policy and consumer management go through
//! the RabbitMQ management HTTP API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{
    BasicGetOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::tcp::OwnedTLSConfig;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use relay_model::QueueDefinition;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError, InboundMessage, OutboundMessage, Result};
use crate::config::BrokerConfig;

/// RabbitMQ broker.
pub struct AmqpBroker {
    config: BrokerConfig,
    connection: Mutex<Option<Connection>>,
    http: reqwest::Client,
    ca_pem: Option<String>,
}

impl AmqpBroker {
    /// Build a broker client. No connection is made until first use.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let ca_pem = match &config.ca_cert {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                BrokerError::Connection(format!("cannot read CA bundle {}: {e}", path.display()))
            })?),
            None => None,
        };

        let mut http = reqwest::Client::builder().timeout(Duration::from_secs(10));
        if let Some(pem) = &ca_pem {
            http = http.add_root_certificate(reqwest::Certificate::from_pem(pem.as_bytes())?);
        }

        Ok(Self {
            config,
            connection: Mutex::new(None),
            http: http.build()?,
            ca_pem,
        })
    }

    fn connection_uri(&self) -> String {
        format!(
            "{}?heartbeat={}",
            self.config
                .amqp_url(&self.config.user, &self.config.password),
            self.config.heartbeat.as_secs()
        )
    }

    async fn channel(&self) -> Result<Channel> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref()
            && connection.status().connected()
        {
            return Ok(connection.create_channel().await?);
        }

        let uri = self.connection_uri();
        let properties = ConnectionProperties::default();
        let connection = match &self.ca_pem {
            Some(pem) => {
                let tls = OwnedTLSConfig {
                    identity: None,
                    cert_chain: Some(pem.clone()),
                };
                Connection::connect_with_config(&uri, properties, tls).await?
            }
            None => Connection::connect(&uri, properties).await?,
        };
        info!(host = %self.config.host, port = self.config.port, "Connected to broker");

        let channel = connection.create_channel().await?;
        *guard = Some(connection);
        Ok(channel)
    }

    async fn close(channel: Channel) {
        if let Err(e) = channel.close(200, "done").await {
            debug!(error = %e, "Channel close failed");
        }
    }

    fn management(&self, path: &str) -> String {
        format!(
            "{}/api/{}/{}",
            self.config.management_url(),
            path,
            urlencoding::encode(&self.config.vhost)
        )
    }

    async fn management_send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        Ok(request
            .basic_auth(&self.config.user, Some(&self.config.password))
            .send()
            .await?)
    }
}

fn is_not_found(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::ProtocolError(e) if matches!(e.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}

fn map_queue_error(queue: &str, error: lapin::Error) -> BrokerError {
    if is_not_found(&error) {
        BrokerError::QueueNotFound(queue.to_string())
    } else {
        error.into()
    }
}

fn field_table(values: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in values {
        let amqp = match value {
            Value::Bool(b) => AMQPValue::Boolean(*b),
            Value::Number(n) if n.is_i64() => AMQPValue::LongLongInt(n.as_i64().unwrap_or_default()),
            Value::Number(n) => AMQPValue::Double(n.as_f64().unwrap_or_default()),
            Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
            other => AMQPValue::LongString(LongString::from(other.to_string())),
        };
        table.insert(ShortString::from(key.clone()), amqp);
    }
    table
}

fn string_headers(table: Option<&FieldTable>) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    if let Some(table) = table {
        for (key, value) in table.inner() {
            let text = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => continue,
            };
            headers.insert(key.as_str().to_string(), text);
        }
    }
    headers
}

#[async_trait]
impl Broker for AmqpBroker {
    fn kind(&self) -> &'static str {
        "rabbitmq"
    }

    fn plugin_url(&self, user: &str, password: &str) -> String {
        self.config.amqp_url(user, password)
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Self::close(channel).await;
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueDefinition) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.args.durable,
                    auto_delete: queue.args.auto_delete,
                    ..Default::default()
                },
                field_table(&queue.args.arguments),
            )
            .await?;
        Self::close(channel).await;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_queue_error(queue, e))?;
        Self::close(channel).await;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let mut headers = FieldTable::default();
        for (key, value) in &message.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.clone()))
            .with_app_id(ShortString::from(message.app_id.clone()))
            .with_headers(headers);
        if let Some(ttl) = message.expiration {
            properties =
                properties.with_expiration(ShortString::from(ttl.as_millis().to_string()));
        }
        if let Some(priority) = message.priority {
            properties = properties.with_priority(priority);
        }

        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &message.body,
                properties,
            )
            .await?
            .await?;
        Self::close(channel).await;

        match confirmation {
            Confirmation::Ack(Some(_returned)) => Err(BrokerError::Unroutable {
                routing_key: routing_key.to_string(),
            }),
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(BrokerError::Nacked {
                routing_key: routing_key.to_string(),
            }),
        }
    }

    async fn get_message(&self, queue: &str) -> Result<Option<InboundMessage>> {
        let channel = self.channel().await?;
        let message = channel
            .basic_get(queue, BasicGetOptions { no_ack: true })
            .await
            .map_err(|e| map_queue_error(queue, e))?;
        Self::close(channel).await;
        Ok(message.map(|m| InboundMessage {
            headers: string_headers(m.delivery.properties.headers().as_ref()),
            body: m.delivery.data,
        }))
    }

    async fn message_count(&self, queue: &str) -> Result<u32> {
        let channel = self.channel().await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_queue_error(queue, e))?;
        Self::close(channel).await;
        Ok(declared.message_count())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| map_queue_error(queue, e))?;
        Self::close(channel).await;
        Ok(())
    }

    async fn disconnect_consumers(&self, queue: &str) -> Result<()> {
        let url = format!("{}/{}", self.management("queues"), urlencoding::encode(queue));
        let response = self.management_send(self.http.get(&url)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let details: Value = response.error_for_status()?.json().await?;

        let connections = details["consumer_details"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|c| c["channel_details"]["connection_name"].as_str())
            .map(str::to_string)
            .collect::<std::collections::BTreeSet<_>>();

        for name in connections {
            let url = format!(
                "{}/api/connections/{}",
                self.config.management_url(),
                urlencoding::encode(&name)
            );
            let response = self.management_send(self.http.delete(&url)).await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
            if let Err(e) = response.error_for_status() {
                warn!(queue, connection = %name, error = %e, "Failed to close consumer connection");
            }
        }
        Ok(())
    }

    async fn set_queue_expiry_policy(
        &self,
        name: &str,
        pattern: &str,
        ttl: Duration,
    ) -> Result<()> {
        let url = format!("{}/{}", self.management("policies"), urlencoding::encode(name));
        let body = json!({
            "pattern": pattern,
            "definition": {"expires": ttl.as_millis() as u64},
            "apply-to": "queues",
            "priority": 1,
        });
        self.management_send(self.http.put(&url).json(&body))
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        match tokio::time::timeout(Duration::from_secs(2), self.channel()).await {
            Ok(Ok(channel)) => {
                Self::close(channel).await;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn broker_for(server: &MockServer) -> AmqpBroker {
        let address = server.address();
        AmqpBroker::new(BrokerConfig {
            host: address.ip().to_string(),
            admin_port: address.port(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_field_table_types() {
        let mut args = BTreeMap::new();
        args.insert("x-max-priority".to_string(), json!(1));
        let table = field_table(&args);
        assert_eq!(
            table.inner().get(&ShortString::from("x-max-priority")),
            Some(&AMQPValue::LongLongInt(1))
        );
    }

    #[tokio::test]
    async fn test_expiry_policy_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/policies/%2F/admin_expiry"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        broker_for(&server)
            .set_queue_expiry_policy("admin_expiry", "^admin.*", Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_consumers_closes_connections() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/queues/%2F/echo.1-0-0.default"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "consumer_details": [
                    {"channel_details": {"connection_name": "plugin-1"}},
                    {"channel_details": {"connection_name": "plugin-1"}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/connections/plugin-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        broker_for(&server)
            .disconnect_consumers("echo.1-0-0.default")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_missing_queue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = broker_for(&server)
            .disconnect_consumers("gone")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::QueueNotFound(_)));
    }
}

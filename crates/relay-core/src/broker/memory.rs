// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process topic exchange.
//!
//! Implements the same routing, mandatory-publish and expiration rules as
//! the AMQP backend. Used by tests and single-process development setups.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use relay_model::QueueDefinition;
use tokio::time::Instant;

use super::routing::topic_matches;
use super::{Broker, BrokerError, InboundMessage, OutboundMessage, Result};

/// A message held by the in-memory broker.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// The message as published.
    pub message: OutboundMessage,
    /// Routing key it was published under.
    pub routing_key: String,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Queue {
    definition: QueueDefinition,
    messages: VecDeque<StoredMessage>,
    consumers: usize,
}

impl Queue {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.messages.retain(|m| !m.expired(now));
    }
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    bindings: Vec<(String, String, String)>,
    policies: BTreeMap<String, (String, Duration)>,
}

/// In-process broker.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<State>,
    alive: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            alive: AtomicBool::new(true),
        }
    }
}

impl MemoryBroker {
    /// Empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Simulate the broker going away or coming back.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Unexpired messages on a queue, oldest first, without consuming them.
    pub fn peek(&self, queue: &str) -> Vec<StoredMessage> {
        let mut state = self.state();
        match state.queues.get_mut(queue) {
            Some(q) => {
                q.purge_expired();
                q.messages.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Names of declared queues.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Declared definition of a queue.
    pub fn queue_definition(&self, queue: &str) -> Option<QueueDefinition> {
        self.state().queues.get(queue).map(|q| q.definition.clone())
    }

    /// Routing keys bound to a queue.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.state()
            .bindings
            .iter()
            .filter(|(_, q, _)| q == queue)
            .map(|(_, _, key)| key.clone())
            .collect()
    }

    /// Pretend a consumer attached to `queue`.
    pub fn attach_consumer(&self, queue: &str) {
        if let Some(q) = self.state().queues.get_mut(queue) {
            q.consumers += 1;
        }
    }

    /// Consumers currently attached.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.consumers)
    }

    /// Registered expiry policies as `name -> (pattern, ttl)`.
    pub fn policies(&self) -> BTreeMap<String, (String, Duration)> {
        self.state().policies.clone()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Connection("broker unavailable".to_string()))
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn plugin_url(&self, user: &str, _password: &str) -> String {
        format!("memory://{user}@localhost/")
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_alive()?;
        self.state().exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueDefinition) -> Result<()> {
        self.ensure_alive()?;
        self.state()
            .queues
            .entry(queue.name.clone())
            .or_insert_with(|| Queue {
                definition: queue.clone(),
                ..Default::default()
            });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let binding = (
            exchange.to_string(),
            queue.to_string(),
            routing_key.to_string(),
        );
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state();
        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(e, _, key)| e == exchange && topic_matches(key, routing_key))
            .map(|(_, q, _)| q.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if targets.is_empty() {
            return Err(BrokerError::Unroutable {
                routing_key: routing_key.to_string(),
            });
        }

        let expires_at = message.expiration.map(|ttl| Instant::now() + ttl);
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.messages.push_back(StoredMessage {
                    message: message.clone(),
                    routing_key: routing_key.to_string(),
                    expires_at,
                });
            }
        }
        Ok(())
    }

    async fn get_message(&self, queue: &str) -> Result<Option<InboundMessage>> {
        self.ensure_alive()?;
        let mut state = self.state();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        q.purge_expired();
        Ok(q.messages.pop_front().map(|m| InboundMessage {
            body: m.message.body,
            headers: m.message.headers,
        }))
    }

    async fn message_count(&self, queue: &str) -> Result<u32> {
        self.ensure_alive()?;
        let mut state = self.state();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        q.purge_expired();
        Ok(q.messages.len() as u32)
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state();
        if state.queues.remove(queue).is_none() {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        state.bindings.retain(|(_, q, _)| q != queue);
        Ok(())
    }

    async fn disconnect_consumers(&self, queue: &str) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.state();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        q.consumers = 0;
        Ok(())
    }

    async fn set_queue_expiry_policy(
        &self,
        name: &str,
        pattern: &str,
        ttl: Duration,
    ) -> Result<()> {
        self.ensure_alive()?;
        self.state()
            .policies
            .insert(name.to_string(), (pattern.to_string(), ttl));
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

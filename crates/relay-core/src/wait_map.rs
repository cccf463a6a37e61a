// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blocking request wait map.
//!
//! Turns an asynchronous completion update into a synchronous response. A
//! blocking caller registers the request id *before* publishing, waits on the
//! returned [`WaitRegistration`], and the completion handler calls
//! [`BlockingWaitMap::signal`]. A signal that lands before the caller starts
//! waiting is not lost.
//!
//! The map only covers this process. Blocking callers in a multi-process
//! deployment need sticky routing back to the submitting process.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

/// Process-wide `request_id -> completion event` map.
#[derive(Debug, Default)]
pub struct BlockingWaitMap {
    events: DashMap<String, Arc<Notify>>,
}

impl BlockingWaitMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `request_id`.
    ///
    /// The entry lives until the returned guard is dropped, so every exit
    /// path of the caller removes it.
    pub fn register(self: &Arc<Self>, request_id: &str) -> WaitRegistration {
        let event = Arc::new(Notify::new());
        self.events.insert(request_id.to_string(), event.clone());
        WaitRegistration {
            map: Arc::clone(self),
            request_id: request_id.to_string(),
            event,
        }
    }

    /// Wake the caller waiting on `request_id`. Returns false when nobody is
    /// registered.
    pub fn signal(&self, request_id: &str) -> bool {
        match self.events.get(request_id) {
            Some(event) => {
                event.notify_one();
                debug!(request_id, "Signalled blocking waiter");
                true
            }
            None => false,
        }
    }

    /// Whether a waiter is registered for `request_id`.
    pub fn contains(&self, request_id: &str) -> bool {
        self.events.contains_key(request_id)
    }

    /// Registered waiters.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A registered wait. Dropping it removes the map entry.
#[derive(Debug)]
pub struct WaitRegistration {
    map: Arc<BlockingWaitMap>,
    request_id: String,
    event: Arc<Notify>,
}

impl WaitRegistration {
    /// Request being waited on.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the signal. `None` waits forever. Returns false on timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.event.notified())
                .await
                .is_ok(),
            None => {
                self.event.notified().await;
                true
            }
        }
    }
}

impl Drop for WaitRegistration {
    fn drop(&mut self) {
        // Only remove our own event; a re-registration may have replaced it.
        self.map
            .events
            .remove_if(&self.request_id, |_, event| Arc::ptr_eq(event, &self.event));
    }
}

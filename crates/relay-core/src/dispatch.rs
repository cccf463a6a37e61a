// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request dispatch.
//!
//! Validate, persist, publish, and optionally wait for completion. The
//! dispatcher is also the entry point for completion updates, which is where
//! blocking waiters are woken.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use relay_model::{CommandType, Request, RequestStatus, RequestUpdate};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, BrokerGateway};
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::validator::{CommandChoicesSource, RequestValidator};
use crate::wait_map::BlockingWaitMap;

/// Error class recorded on a request whose publish could not be routed.
pub const PUBLISH_ROUTE_FAILURE: &str = "PublishRouteFailure";

/// Error class recorded on a request whose publish failed otherwise.
pub const PUBLISH_FAILURE: &str = "PublishException";

/// Validates, stores and publishes requests.
pub struct RequestDispatcher {
    catalog: Arc<dyn Catalog>,
    gateway: Arc<BrokerGateway>,
    validator: Arc<RequestValidator>,
    wait_map: Arc<BlockingWaitMap>,
    choices_timeout: Duration,
    shutting_down: AtomicBool,
}

impl RequestDispatcher {
    /// Create a dispatcher.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        gateway: Arc<BrokerGateway>,
        validator: Arc<RequestValidator>,
        wait_map: Arc<BlockingWaitMap>,
    ) -> Self {
        Self {
            catalog,
            gateway,
            validator,
            wait_map,
            choices_timeout: Duration::from_secs(30),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// How long a command-choices lookup may take.
    pub fn with_choices_timeout(mut self, timeout: Duration) -> Self {
        self.choices_timeout = timeout;
        self
    }

    /// The wait map completion updates signal.
    pub fn wait_map(&self) -> &Arc<BlockingWaitMap> {
        &self.wait_map
    }

    /// Refuse new requests from now on.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Validate and dispatch a new request.
    ///
    /// With `blocking`, waits up to `timeout` (forever when `None`) for the
    /// request to complete and returns it as stored. Otherwise returns the
    /// request as created. `EPHEMERAL` requests are published without being
    /// stored and never block.
    pub async fn process_request(
        &self,
        request: Request,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<Request> {
        self.ensure_running()?;
        let request = self.validator.validate_with(request, Some(self), 0).await?;
        self.submit(request, blocking, timeout).await
    }

    async fn submit(
        &self,
        mut request: Request,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<Request> {
        request.status = RequestStatus::Created;

        if request.effective_command_type() == CommandType::Ephemeral {
            request.id = Some(uuid::Uuid::new_v4().to_string());
            self.gateway.publish_request(&request, None).await?;
            debug!(request = %request, "Ephemeral request published");
            return Ok(request);
        }

        let request = self.catalog.create_request(request).await?;
        let id = request
            .id
            .clone()
            .ok_or_else(|| Error::not_found("request", "<unsaved>"))?;

        // Registered before publishing so a fast completion is not missed.
        let registration = blocking.then(|| self.wait_map.register(&id));

        self.publish(&request, &id).await?;
        info!(request = %request, blocking, "Request dispatched");

        let Some(registration) = registration else {
            return Ok(request);
        };
        if !registration.wait(timeout).await {
            return Err(Error::WaitTimeout {
                request_id: id,
                timeout: timeout.unwrap_or_default(),
            });
        }
        self.catalog
            .get_request(&id)
            .await?
            .ok_or_else(|| Error::not_found("request", id))
    }

    async fn publish(&self, request: &Request, id: &str) -> Result<()> {
        let Err(e) = self.gateway.publish_request(request, None).await else {
            return Ok(());
        };

        let error_class = match e {
            BrokerError::Unroutable { .. } => PUBLISH_ROUTE_FAILURE,
            _ => PUBLISH_FAILURE,
        };
        error!(request = %request, error = %e, "Publish failed");
        if let Err(update_err) = self
            .catalog
            .update_request(id, &RequestUpdate::error(error_class, e.to_string()))
            .await
        {
            warn!(request_id = id, error = %update_err, "Could not record publish failure");
        }
        Err(e.into())
    }

    /// Publish a stored request again, e.g. after it was created by the REST
    /// layer.
    pub async fn process_existing(&self, request_id: &str) -> Result<Request> {
        self.ensure_running()?;
        let request = self
            .catalog
            .get_request(request_id)
            .await?
            .ok_or_else(|| Error::not_found("request", request_id))?;
        if request.is_completed() {
            return Err(relay_model::ModelError::AlreadyCompleted {
                status: request.status,
            }
            .into());
        }
        self.publish(&request, request_id).await?;
        Ok(request)
    }

    /// Apply a completion update and wake a blocking waiter if the request
    /// just completed.
    pub async fn update_request(&self, request_id: &str, update: &RequestUpdate) -> Result<Request> {
        let (request, outcome) = self.catalog.update_request(request_id, update).await?;
        if outcome.completed {
            debug!(request = %request, status = %request.status, "Request completed");
            self.wait_map.signal(request_id);
        }
        Ok(request)
    }

    /// Cancel a request that has not completed.
    pub async fn cancel_request(&self, request_id: &str) -> Result<Request> {
        self.update_request(request_id, &RequestUpdate::status(RequestStatus::Canceled))
            .await
    }
}

#[async_trait]
impl CommandChoicesSource for RequestDispatcher {
    async fn run_choices_command(&self, request: Request, depth: usize) -> Result<Request> {
        self.ensure_running()?;
        let request = self
            .validator
            .validate_with(request, Some(self), depth)
            .await?;
        self.submit(request, true, Some(self.choices_timeout)).await
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for relay-core.
//!
//! Every failure maps to a stable code, an HTTP-equivalent status and one of
//! the RPC exception kinds in one place, so callers never translate errors
//! themselves.

use std::time::Duration;

use relay_model::{InstanceStatus, ModelError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::BrokerError;
use crate::catalog::CatalogError;
use crate::loader::PluginValidationError;
use crate::runner::RunnerError;
use crate::validator::ValidationError;

/// Result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Relay core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The validator rejected a request.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A model invariant was violated.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Catalog failure.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Broker failure, including unroutable publishes.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A plugin directory failed validation.
    #[error(transparent)]
    PluginValidation(#[from] PluginValidationError),

    /// Runner failure.
    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// Entity lookup failed.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Entity kind.
        kind: &'static str,
        /// Id or name that was looked up.
        id: String,
    },

    /// A plugin cannot be started from its current state.
    #[error("plugin {unique_name} cannot be started from status {status}")]
    PluginStartup {
        /// Runner unique name.
        unique_name: String,
        /// Status it was in.
        status: InstanceStatus,
    },

    /// Reload attempted while an instance is running.
    #[error("system {system} has running instances")]
    BusyInstances {
        /// `name-version` of the system.
        system: String,
    },

    /// A blocking wait elapsed.
    #[error("request {request_id} did not complete within {timeout:?}")]
    WaitTimeout {
        /// Request being waited on.
        request_id: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// An RPC argument is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The core is shutting down.
    #[error("relay core is shutting down")]
    Shutdown,

    /// I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode or decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// RPC exception kinds surfaced to the REST layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorKind {
    /// The request or its parameters are invalid.
    InvalidRequest,
    /// The broker refused or could not route a publish.
    PublishException,
    /// A system definition or configuration is invalid.
    InvalidSystem,
    /// A uniqueness or state conflict.
    ConflictException,
    /// Anything else.
    InternalError,
}

/// Error payload carried by RPC error frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Exception kind.
    pub kind: RpcErrorKind,
    /// Stable error code, see [`Error::kind`].
    pub code: String,
    /// HTTP-equivalent status.
    pub status: u16,
    /// Human readable message.
    pub message: String,
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable SCREAMING_SNAKE code for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.kind(),
            Self::Model(ModelError::AlreadyCompleted { .. }) => "REQUEST_ALREADY_COMPLETED",
            Self::Model(_) => "MODEL_VALIDATION_ERROR",
            Self::Catalog(CatalogError::NotFound { .. }) => "NOT_FOUND",
            Self::Catalog(CatalogError::Conflict(_)) => "CONFLICT_ERROR",
            Self::Catalog(CatalogError::Model(ModelError::AlreadyCompleted { .. })) => {
                "REQUEST_ALREADY_COMPLETED"
            }
            Self::Catalog(CatalogError::Model(_)) => "MODEL_VALIDATION_ERROR",
            Self::Catalog(_) => "CATALOG_ERROR",
            Self::Broker(BrokerError::Unroutable { .. }) => "PUBLISH_ROUTE_FAILURE",
            Self::Broker(_) => "BROKER_ERROR",
            Self::PluginValidation(_) => "PLUGIN_VALIDATION_ERROR",
            Self::Runner(_) => "RUNNER_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::PluginStartup { .. } => "PLUGIN_STARTUP_ERROR",
            Self::BusyInstances { .. } => "BUSY_INSTANCES",
            Self::WaitTimeout { .. } => "WAIT_TIMEOUT",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Shutdown => "SHUTDOWN_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "MODEL_VALIDATION_ERROR",
        }
    }

    /// HTTP-equivalent status code.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            "MODEL_VALIDATION_ERROR" | "PLUGIN_VALIDATION_ERROR" | "INVALID_ARGUMENT" => 400,
            "UNKNOWN_SYSTEM" | "UNKNOWN_INSTANCE" | "UNKNOWN_COMMAND" | "NOT_FOUND" => 404,
            "WAIT_TIMEOUT" => 408,
            "PLUGIN_STARTUP_ERROR" | "BUSY_INSTANCES" | "CONFLICT_ERROR"
            | "REQUEST_ALREADY_COMPLETED" => 409,
            "PUBLISH_ROUTE_FAILURE" | "BROKER_ERROR" => 502,
            "SHUTDOWN_ERROR" => 503,
            _ => 500,
        }
    }

    /// RPC exception kind.
    pub fn rpc_kind(&self) -> RpcErrorKind {
        match self {
            Self::Validation(_)
            | Self::Json(_)
            | Self::NotFound { .. }
            | Self::WaitTimeout { .. }
            | Self::InvalidArgument(_) => RpcErrorKind::InvalidRequest,
            Self::Catalog(CatalogError::NotFound { .. }) => RpcErrorKind::InvalidRequest,
            Self::Broker(_) => RpcErrorKind::PublishException,
            Self::Model(ModelError::AlreadyCompleted { .. })
            | Self::Catalog(CatalogError::Model(ModelError::AlreadyCompleted { .. }))
            | Self::Catalog(CatalogError::Conflict(_))
            | Self::PluginStartup { .. }
            | Self::BusyInstances { .. } => RpcErrorKind::ConflictException,
            Self::Model(_) | Self::Catalog(CatalogError::Model(_)) | Self::PluginValidation(_) => {
                RpcErrorKind::InvalidSystem
            }
            _ => RpcErrorKind::InternalError,
        }
    }

    /// Convert this error to its RPC payload.
    pub fn rpc_error(&self) -> RpcError {
        RpcError {
            kind: self.rpc_kind(),
            code: self.kind().to_string(),
            status: self.status_code(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::Bound;
    use relay_model::RequestStatus;

    #[test]
    fn test_validation_error_codes() {
        let err = Error::from(ValidationError::UnknownSystem {
            system: "echo".into(),
            version: "1.0.0".into(),
        });
        assert_eq!(err.kind(), "UNKNOWN_SYSTEM");
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.rpc_kind(), RpcErrorKind::InvalidRequest);

        let err = Error::from(ValidationError::BoundsError {
            key: "count".into(),
            bound: Bound::Minimum,
            limit: 1.0,
            actual: 0.0,
        });
        assert_eq!(err.kind(), "MODEL_VALIDATION_ERROR");
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("minimum"));
    }

    #[test]
    fn test_publish_route_failure() {
        let err = Error::from(BrokerError::Unroutable {
            routing_key: "echo.1-0-0.default".into(),
        });
        assert_eq!(err.kind(), "PUBLISH_ROUTE_FAILURE");
        assert_eq!(err.status_code(), 502);
        assert_eq!(err.rpc_error().kind, RpcErrorKind::PublishException);
    }

    #[test]
    fn test_conflicts() {
        let err = Error::BusyInstances {
            system: "echo-1.0.0".into(),
        };
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.rpc_kind(), RpcErrorKind::ConflictException);

        let err = Error::from(CatalogError::Model(ModelError::AlreadyCompleted {
            status: RequestStatus::Success,
        }));
        assert_eq!(err.kind(), "REQUEST_ALREADY_COMPLETED");
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_wait_timeout() {
        let err = Error::WaitTimeout {
            request_id: "r1".into(),
            timeout: Duration::from_millis(50),
        };
        assert_eq!(err.status_code(), 408);
        let rpc = err.rpc_error();
        assert_eq!(rpc.code, "WAIT_TIMEOUT");
        assert!(rpc.message.contains("r1"));
    }
}

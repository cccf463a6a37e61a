// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Model invariant errors.

use thiserror::Error;

use crate::{InstanceStatus, RequestStatus};

/// Violations of the data model's structural invariants.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ModelError {
    /// A required field was empty.
    #[error("{entity} field '{field}' must not be empty")]
    EmptyField {
        /// Entity kind, e.g. "system".
        entity: &'static str,
        /// Field name.
        field: &'static str,
    },

    /// Two children of the same parent share a name.
    #[error("duplicate {entity} name '{name}'")]
    DuplicateName {
        /// Entity kind, e.g. "command".
        entity: &'static str,
        /// Offending name.
        name: String,
    },

    /// A system declares more instances than it allows.
    #[error("system has {count} instances but max_instances is {max}")]
    TooManyInstances {
        /// Declared instance count.
        count: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The choices value does not match its declared type.
    #[error("parameter '{key}' has malformed choices: {reason}")]
    MalformedChoices {
        /// Parameter key.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// `has_parent` disagrees with `parent`.
    #[error("request has_parent={has_parent} does not match parent reference")]
    ParentMismatch {
        /// The flag as stored.
        has_parent: bool,
    },

    /// A completed request may not change.
    #[error("request is already completed with status {status}")]
    AlreadyCompleted {
        /// The terminal status.
        status: RequestStatus,
    },

    /// Illegal request status transition.
    #[error("request status cannot move from {from} to {to}")]
    InvalidRequestTransition {
        /// Current status.
        from: RequestStatus,
        /// Requested status.
        to: RequestStatus,
    },

    /// Illegal instance status transition.
    #[error("instance status cannot move from {from} to {to}")]
    InvalidInstanceTransition {
        /// Current status.
        from: InstanceStatus,
        /// Requested status.
        to: InstanceStatus,
    },
}

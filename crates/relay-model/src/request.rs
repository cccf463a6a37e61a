// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Requests and the rules for completing them.
//!
//! A request moves `CREATED -> IN_PROGRESS -> {SUCCESS, ERROR, CANCELED}`,
//! and may jump from `CREATED` straight to a completed state. Once
//! completed it never changes again; repeating the exact completion is
//! accepted as a no-op so plugins may retry their final update.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ModelError;
use crate::system::{CommandType, OutputType, string_enum};

/// Request lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Stored, not yet picked up.
    #[default]
    Created,
    /// A plugin is working on it.
    InProgress,
    /// Completed successfully.
    Success,
    /// Completed with an error.
    Error,
    /// Withdrawn before completion.
    Canceled,
}

string_enum!(RequestStatus {
    Created => "CREATED",
    InProgress => "IN_PROGRESS",
    Success => "SUCCESS",
    Error => "ERROR",
    Canceled => "CANCELED",
});

impl RequestStatus {
    /// `SUCCESS`, `ERROR` or `CANCELED`.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Canceled)
    }

    fn can_transition_to(&self, next: RequestStatus) -> bool {
        match self {
            Self::Created => true,
            Self::InProgress => next != Self::Created,
            _ => *self == next,
        }
    }
}

/// A single invocation of a command on an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Catalog id, assigned when stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Target system name.
    pub system: String,
    /// Target system version.
    pub system_version: String,
    /// Target instance name.
    pub instance_name: String,
    /// Command name.
    pub command: String,
    /// Copied from the command during validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<CommandType>,
    /// Copied from the command during validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<OutputType>,
    /// Parameter values.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Free text from the requester.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Result text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Error type reported by the plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    /// Lifecycle state.
    #[serde(default)]
    pub status: RequestStatus,
    /// Parent request id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Mirrors `parent.is_some()`.
    #[serde(default)]
    pub has_parent: bool,
    /// Who asked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Set when stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Set on every change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Request {
    /// New `CREATED` request with no parameters.
    pub fn new(
        system: impl Into<String>,
        system_version: impl Into<String>,
        instance_name: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            system: system.into(),
            system_version: system_version.into(),
            instance_name: instance_name.into(),
            command: command.into(),
            command_type: None,
            output_type: None,
            parameters: Map::new(),
            comment: None,
            output: None,
            error_class: None,
            status: RequestStatus::Created,
            parent: None,
            has_parent: false,
            requester: None,
            metadata: Map::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Builder-style parameter setter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Sets or clears the parent, keeping `has_parent` in step.
    pub fn set_parent(&mut self, parent: Option<String>) {
        self.has_parent = parent.is_some();
        self.parent = parent;
    }

    /// Effective command type, `ACTION` when unvalidated.
    pub fn effective_command_type(&self) -> CommandType {
        self.command_type.unwrap_or_default()
    }

    /// Whether the request is in a completed state.
    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    /// Applies a plugin update.
    ///
    /// Returns which parts changed and whether this update completed the
    /// request. Completed requests reject any update that would change them.
    pub fn apply_update(
        &mut self,
        update: &RequestUpdate,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, ModelError> {
        if self.status.is_completed() {
            if update.is_noop_for(self) {
                return Ok(UpdateOutcome::default());
            }
            return Err(ModelError::AlreadyCompleted {
                status: self.status,
            });
        }

        if let Some(next) = update.status
            && !self.status.can_transition_to(next)
        {
            return Err(ModelError::InvalidRequestTransition {
                from: self.status,
                to: next,
            });
        }

        let changed = !update.is_noop_for(self);
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(output) = &update.output {
            self.output = Some(output.clone());
        }
        if let Some(error_class) = &update.error_class {
            self.error_class = Some(error_class.clone());
        }
        if changed {
            self.updated_at = Some(now);
        }

        Ok(UpdateOutcome {
            changed,
            completed: self.status.is_completed(),
        })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]-{}.{}",
            self.system, self.instance_name, self.system_version, self.command
        )?;
        if let Some(id) = &self.id {
            write!(f, " ({id})")?;
        }
        Ok(())
    }
}

/// Partial update sent by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestUpdate {
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    /// New output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// New error class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
}

impl RequestUpdate {
    /// Update that only sets the status.
    pub fn status(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Update that completes a request successfully.
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: Some(RequestStatus::Success),
            output: Some(output.into()),
            error_class: None,
        }
    }

    /// Update that completes a request with an error.
    pub fn error(error_class: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            status: Some(RequestStatus::Error),
            output: Some(output.into()),
            error_class: Some(error_class.into()),
        }
    }

    /// True when every field present already holds that value.
    pub fn is_noop_for(&self, request: &Request) -> bool {
        self.status.is_none_or(|s| s == request.status)
            && self
                .output
                .as_ref()
                .is_none_or(|o| request.output.as_ref() == Some(o))
            && self
                .error_class
                .as_ref()
                .is_none_or(|e| request.error_class.as_ref() == Some(e))
    }
}

/// Result of [`Request::apply_update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Something was modified.
    pub changed: bool,
    /// The request is now completed. Only true for the update that
    /// performed the completion.
    pub completed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::new("echo", "1.0.0", "default", "say")
    }

    #[test]
    fn test_created_to_in_progress_to_success() {
        let mut req = request();
        let now = Utc::now();

        let outcome = req
            .apply_update(&RequestUpdate::status(RequestStatus::InProgress), now)
            .unwrap();
        assert!(outcome.changed);
        assert!(!outcome.completed);

        let outcome = req
            .apply_update(&RequestUpdate::success("hello"), now)
            .unwrap();
        assert!(outcome.completed);
        assert_eq!(req.status, RequestStatus::Success);
        assert_eq!(req.output.as_deref(), Some("hello"));
    }

    #[test]
    fn test_created_may_complete_directly() {
        let mut req = request();
        let outcome = req
            .apply_update(&RequestUpdate::error("ValueError", "boom"), Utc::now())
            .unwrap();
        assert!(outcome.completed);
        assert_eq!(req.error_class.as_deref(), Some("ValueError"));
    }

    #[test]
    fn test_in_progress_cannot_go_back_to_created() {
        let mut req = request();
        req.status = RequestStatus::InProgress;
        let err = req
            .apply_update(&RequestUpdate::status(RequestStatus::Created), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidRequestTransition { .. }));
    }

    #[test]
    fn test_completed_request_is_immutable() {
        let mut req = request();
        req.apply_update(&RequestUpdate::success("done"), Utc::now())
            .unwrap();

        let err = req
            .apply_update(&RequestUpdate::success("different"), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            ModelError::AlreadyCompleted {
                status: RequestStatus::Success
            }
        );
        assert_eq!(req.output.as_deref(), Some("done"));
    }

    #[test]
    fn test_duplicate_completion_is_noop() {
        let mut req = request();
        let first = req
            .apply_update(&RequestUpdate::success("done"), Utc::now())
            .unwrap();
        assert!(first.completed);

        let second = req
            .apply_update(&RequestUpdate::success("done"), Utc::now())
            .unwrap();
        assert!(!second.changed);
        assert!(!second.completed);
    }

    #[test]
    fn test_set_parent_keeps_flag_in_step() {
        let mut req = request();
        req.set_parent(Some("abc".into()));
        assert!(req.has_parent);
        req.set_parent(None);
        assert!(!req.has_parent);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relay data model.
//!
//! Plain serde types shared by every relay component: the system catalog
//! (systems, commands, parameters, instances), requests and their completion
//! rules, and scheduled jobs.
//!
//! Entities never hold pointers to each other. A command is resolved through
//! its owning [`System`], an instance through the system that lists it, and a
//! request names its parent by id only.
//!
//! ```text
//! System ──┬── Command ── Parameter ── Choices
//!          └── Instance ── QueueInfo
//! Request ── parent id ──▶ Request
//! Job ── Trigger + RequestTemplate
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod job;
pub mod request;
pub mod system;
mod validate;

pub use error::ModelError;
pub use job::{Job, JobStatus, RequestTemplate, Trigger};
pub use request::{Request, RequestStatus, RequestUpdate, UpdateOutcome};
pub use system::{
    Choices, ChoicesDetails, ChoicesDisplay, ChoicesType, Command, CommandType, Instance,
    InstanceStatus, OutputType, Parameter, ParameterType, QueueArgs, QueueDefinition, QueueInfo,
    StatusInfo, System,
};

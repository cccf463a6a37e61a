// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC surface consumed by the REST layer.
//!
//! Length-prefixed JSON frames over TCP. Each call is an [`RpcRequest`]
//! tagged by method name; failures come back as error frames carrying an
//! [`RpcError`](crate::error::RpcError).

pub mod client;
pub mod frame;
pub mod handlers;
pub mod server;

pub use client::{ClientError, RpcClient};
pub use handlers::{CoreHandlerState, ProcessRequestParams, RpcRequest, SystemPatch, SystemQuery};
pub use server::{RpcServer, ServerError};

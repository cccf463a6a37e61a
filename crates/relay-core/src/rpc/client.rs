// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP client for the RPC surface, used by the REST layer and tests.

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use super::handlers::RpcRequest;
use crate::error::RpcError;

/// Errors that can occur in the RPC client
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing failure.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The server answered with an error frame.
    #[error("{}: {}", .0.code, .0.message)]
    Remote(RpcError),

    /// The server answered with something other than a response.
    #[error("unexpected {0:?} frame")]
    UnexpectedFrame(MessageType),

    /// Connecting took too long.
    #[error("connection timed out after {0}ms")]
    Timeout(u64),
}

/// Client holding one connection. Calls on it are serialised.
pub struct RpcClient {
    stream: Mutex<TcpStream>,
}

impl RpcClient {
    /// Connect to a server.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(timeout.as_millis() as u64))??;
        stream.set_nodelay(true)?;
        debug!(%addr, "connected to RPC server");
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    /// Send a call and return the raw JSON result.
    #[instrument(skip(self, request))]
    pub async fn call(&self, request: &RpcRequest) -> Result<Value, ClientError> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &Frame::request(request)?).await?;

        let frame = read_frame(&mut *stream).await?;
        match frame.message_type {
            MessageType::Response => Ok(frame.decode()?),
            MessageType::Error => Err(ClientError::Remote(frame.decode()?)),
            other => Err(ClientError::UnexpectedFrame(other)),
        }
    }

    /// Send a call and decode the result.
    pub async fn call_as<T: DeserializeOwned>(&self, request: &RpcRequest) -> Result<T, ClientError> {
        let value = self.call(request).await?;
        Ok(serde_json::from_value(value).map_err(FrameError::from)?)
    }
}

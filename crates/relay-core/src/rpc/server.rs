// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP server for the RPC surface.
//!
//! A connection carries any number of calls, answered in order. At most
//! `max_workers` calls run at once across all connections; further calls
//! wait for a permit.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use super::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use super::handlers::{CoreHandlerState, RpcRequest, handle_call};
use crate::error::{RpcError, RpcErrorKind};

/// Errors that can occur in the RPC server
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener could not be bound.
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    /// Framing failure on a connection.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// RPC server bound to a TCP address.
pub struct RpcServer {
    listener: TcpListener,
    workers: Arc<Semaphore>,
}

impl RpcServer {
    /// Bind the listener.
    pub async fn bind(addr: SocketAddr, max_workers: usize) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %listener.local_addr()?,
            max_workers,
            "RPC server bound"
        );
        Ok(Self {
            listener,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
        })
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown_rx` flips to true.
    pub async fn run(
        self,
        state: Arc<CoreHandlerState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        info!("RPC server running");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("RPC server received shutdown signal");
                        break;
                    }
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            debug!(%remote_addr, "accepted connection");
                            let state = state.clone();
                            let workers = self.workers.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state, workers).await {
                                    error!(%remote_addr, "Connection error: {}", e);
                                }
                                debug!(%remote_addr, "connection closed");
                            });
                        }
                        Err(e) => warn!("failed to accept connection: {}", e),
                    }
                }
            }
        }

        info!("RPC server stopped");
        Ok(())
    }
}

/// Serve calls on one connection until the peer closes it.
async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<CoreHandlerState>,
    workers: Arc<Semaphore>,
) -> Result<(), ServerError> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let reply = match decode_call(&frame) {
            Ok(request) => {
                let Ok(_permit) = workers.acquire().await else {
                    warn!("worker pool closed, dropping connection");
                    return Ok(());
                };
                match handle_call(&state, request).await {
                    Ok(value) => Frame::response(&value)?,
                    Err(e) => {
                        debug!(code = e.kind(), error = %e, "Call failed");
                        Frame::error(&e.rpc_error())?
                    }
                }
            }
            Err(e) => Frame::error(&e)?,
        };
        write_frame(&mut stream, &reply).await?;
    }
}

fn decode_call(frame: &Frame) -> Result<RpcRequest, RpcError> {
    if frame.message_type != MessageType::Request {
        return Err(invalid_request(format!(
            "expected a request frame, got {:?}",
            frame.message_type
        )));
    }
    frame.decode().map_err(|e| {
        warn!(error = %e, "Received malformed call");
        invalid_request(e.to_string())
    })
}

fn invalid_request(message: String) -> RpcError {
    RpcError {
        kind: RpcErrorKind::InvalidRequest,
        code: "INVALID_REQUEST".to_string(),
        status: 400,
        message,
    }
}

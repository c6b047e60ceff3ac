//! Port-forwards multiplexed over one tunnel
//!
//! Each open port gets a task that owns the workload stream. Client `data`
//! frames reach it through a channel; bytes read from the workload go back
//! as base64 `portforward_response` frames.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use podlink_cluster::{ForwardIo, WorkloadChannel};
use podlink_common::wire::{
    PortForwardAction, PortForwardRequest, PortForwardResponse, PortForwardStatus, ServerMessage,
};

use super::mux::send;

/// Read size for bytes coming back from the workload
const READ_CHUNK: usize = 16 * 1024;

/// Client writes buffered per port
const INBOUND_BUFFER: usize = 64;

/// Open port-forwards of one tunnel
pub(super) struct PortForwards {
    channel: Arc<dyn WorkloadChannel>,
    out: mpsc::Sender<Message>,
    cancel: CancellationToken,
    open: HashMap<u16, mpsc::Sender<Vec<u8>>>,
}

impl PortForwards {
    pub(super) fn new(
        channel: Arc<dyn WorkloadChannel>,
        out: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            out,
            cancel,
            open: HashMap::new(),
        }
    }

    pub(super) async fn handle(&mut self, request: PortForwardRequest) {
        let port = request.port;
        match request.action {
            PortForwardAction::Open => self.open(port).await,
            PortForwardAction::Data => self.write(port, request.data).await,
            PortForwardAction::Close => {
                // The task notices the closed channel and reports `closed`
                if self.open.remove(&port).is_none() {
                    self.fail(port, "port not open").await;
                }
            }
        }
    }

    async fn open(&mut self, port: u16) {
        // A forward whose task already ended can be reopened
        self.open.retain(|_, tx| !tx.is_closed());
        if self.open.contains_key(&port) {
            self.fail(port, "port already open").await;
            return;
        }

        let io = match self.channel.port_forward(port).await {
            Ok(io) => io,
            Err(e) => {
                debug!(port, error = %e, "Port-forward failed to open");
                self.fail(port, e.to_string()).await;
                return;
            }
        };

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        self.open.insert(port, tx);
        send(
            &self.out,
            ServerMessage::PortforwardResponse(PortForwardResponse::status(
                port,
                PortForwardStatus::Opened,
            )),
        )
        .await;

        info!(port, "Port-forward opened");
        tokio::spawn(pump(port, io, rx, self.out.clone(), self.cancel.clone()));
    }

    async fn write(&mut self, port: u16, data: Option<String>) {
        let bytes = match STANDARD.decode(data.unwrap_or_default()) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(port, format!("invalid base64 data: {}", e)).await;
                return;
            }
        };

        let delivered = match self.open.get(&port) {
            Some(tx) => tx.send(bytes).await.is_ok(),
            None => false,
        };
        if !delivered {
            self.open.remove(&port);
            self.fail(port, "port not open").await;
        }
    }

    async fn fail(&self, port: u16, message: impl Into<String>) {
        send(&self.out, error_response(port, message.into())).await;
    }
}

fn error_response(port: u16, message: String) -> ServerMessage {
    ServerMessage::PortforwardResponse(PortForwardResponse {
        port,
        status: PortForwardStatus::Error,
        data: None,
        message: Some(message),
    })
}

/// Relay one forwarded port until either side closes or the tunnel ends
async fn pump(
    port: u16,
    mut io: Box<dyn ForwardIo>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    out: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_CHUNK];

    let last = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            read = io.read(&mut buf) => match read {
                Ok(0) => break Some(PortForwardResponse::status(port, PortForwardStatus::Closed)),
                Ok(n) => {
                    let response = PortForwardResponse {
                        port,
                        status: PortForwardStatus::Data,
                        data: Some(STANDARD.encode(&buf[..n])),
                        message: None,
                    };
                    if !send(&out, ServerMessage::PortforwardResponse(response)).await {
                        break None;
                    }
                }
                Err(e) => break Some(PortForwardResponse {
                    port,
                    status: PortForwardStatus::Error,
                    data: None,
                    message: Some(e.to_string()),
                }),
            },
            inbound = rx.recv() => match inbound {
                Some(bytes) => {
                    if let Err(e) = io.write_all(&bytes).await {
                        break Some(PortForwardResponse {
                            port,
                            status: PortForwardStatus::Error,
                            data: None,
                            message: Some(e.to_string()),
                        });
                    }
                }
                None => {
                    let _ = io.shutdown().await;
                    break Some(PortForwardResponse::status(port, PortForwardStatus::Closed));
                }
            },
        }
    };

    if let Some(response) = last {
        debug!(port, status = ?response.status, "Port-forward ended");
        send(&out, ServerMessage::PortforwardResponse(response)).await;
    }
}

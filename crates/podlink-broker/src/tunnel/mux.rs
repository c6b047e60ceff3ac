//! Per-connection tunnel loop
//!
//! One reader loop per tunnel dispatches inbound frames. Exec and file
//! operations go through a single ordered worker, port-forwards run as
//! their own tasks, and a writer task owns the socket's sending half.
//! Dropping out of the loop cancels all of them.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use podlink_cluster::WorkloadChannel;
use podlink_common::wire::{ClientMessage, ServerMessage};

use super::forward::PortForwards;
use super::ops::{self, Operation};
use crate::registry::{EndReason, SessionRegistry, TunnelLease};

/// Frames buffered towards the client
const OUTBOUND_BUFFER: usize = 256;

/// Exec / file operations queued behind the one in flight
const OPERATION_QUEUE: usize = 32;

/// How long the writer may take to flush the final frames
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// WebSocket normal closure
const CLOSE_NORMAL: u16 = 1000;

/// Everything a bound tunnel needs
pub struct TunnelContext {
    /// Registry the session lives in
    pub registry: SessionRegistry,
    /// The session's tunnel slot
    pub lease: TunnelLease,
    /// Remote execution against the session's workload
    pub channel: Arc<dyn WorkloadChannel>,
    /// Close the tunnel after this long without an inbound frame
    pub idle_timeout: Duration,
}

#[derive(Debug)]
enum CloseCause {
    Client,
    Transport(String),
    Idle,
    Expired,
    SessionEnded(EndReason),
}

/// Encode a reply as a text frame
pub(super) fn frame(message: ServerMessage) -> Message {
    Message::Text(message.encode().into())
}

/// Queue a reply; false once the writer is gone
pub(super) async fn send(out: &mpsc::Sender<Message>, message: ServerMessage) -> bool {
    out.send(frame(message)).await.is_ok()
}

/// Relay a bound tunnel until it closes, then end its session
pub async fn run_tunnel<Si, St, E>(sink: Si, mut stream: St, ctx: TunnelContext)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    let TunnelContext {
        registry,
        mut lease,
        channel,
        idle_timeout,
    } = ctx;
    let session = lease.session().clone();

    let cancel = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_loop(sink, out_rx));

    let (ops_tx, ops_rx) = mpsc::channel::<Operation>(OPERATION_QUEUE);
    let worker = tokio::spawn(ops::run_worker(
        channel.clone(),
        ops_rx,
        out_tx.clone(),
        cancel.child_token(),
    ));
    let mut forwards = PortForwards::new(channel, out_tx.clone(), cancel.child_token());

    info!(
        session_id = %session.id,
        workload = %session.workload.name,
        namespace = %session.workload.namespace,
        "Tunnel bound"
    );

    let remaining = (session.expires_at - Utc::now()).to_std().unwrap_or_default();
    let expiry = tokio::time::sleep(remaining);
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(expiry);
    tokio::pin!(idle);

    let cause = loop {
        tokio::select! {
            reason = lease.ended() => break CloseCause::SessionEnded(reason),
            _ = &mut expiry => break CloseCause::Expired,
            _ = &mut idle => break CloseCause::Idle,
            inbound = stream.next() => {
                idle.as_mut().reset(Instant::now() + idle_timeout);
                match inbound {
                    None | Some(Ok(Message::Close(_))) => break CloseCause::Client,
                    Some(Err(e)) => break CloseCause::Transport(e.to_string()),
                    Some(Ok(Message::Text(text))) => {
                        dispatch(text.as_str(), &ops_tx, &mut forwards, &out_tx).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        send(&out_tx, ServerMessage::error("binary frames are not supported")).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    // Cancels the in-flight operation and every port-forward
    cancel.cancel();
    drop(ops_tx);
    drop(forwards);
    let _ = worker.await;

    let notice = match &cause {
        CloseCause::SessionEnded(reason) => Some((reason.message(), reason.as_str())),
        CloseCause::Expired => Some((EndReason::Expired.message(), EndReason::Expired.as_str())),
        CloseCause::Idle => Some(("tunnel idle timeout", "idle_timeout")),
        CloseCause::Client | CloseCause::Transport(_) => None,
    };

    // The session dies with its tunnel
    let end_reason = match &cause {
        CloseCause::SessionEnded(_) => None,
        CloseCause::Expired => Some(EndReason::Expired),
        _ => Some(EndReason::TunnelClosed),
    };
    if let Some(reason) = end_reason {
        if let Err(e) = registry.end(&session.id, reason).await {
            debug!(session_id = %session.id, error = %e, "Session already ended");
        }
    }

    if let Some((message, reason)) = notice {
        send(&out_tx, ServerMessage::error_with_reason(message, reason)).await;
        let _ = out_tx
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_NORMAL,
                reason: reason.to_string().into(),
            })))
            .await;
    }
    drop(out_tx);

    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        warn!(session_id = %session.id, "Tunnel writer did not drain in time");
    }

    info!(session_id = %session.id, cause = ?cause, "Tunnel closed");
    drop(lease);
}

async fn dispatch(
    text: &str,
    ops_tx: &mpsc::Sender<Operation>,
    forwards: &mut PortForwards,
    out: &mpsc::Sender<Message>,
) {
    let operation = match ClientMessage::decode(text) {
        Ok(ClientMessage::PortForward(request)) => {
            forwards.handle(request).await;
            return;
        }
        Ok(ClientMessage::Exec(request)) => Operation::Exec(request),
        Ok(ClientMessage::File(request)) => Operation::File(request),
        Err(e) => {
            debug!(error = %e, "Rejected tunnel frame");
            send(out, ServerMessage::error(e.to_string())).await;
            return;
        }
    };

    if let Err(e) = ops_tx.try_send(operation) {
        let message = match e {
            mpsc::error::TrySendError::Full(_) => "too many queued operations",
            mpsc::error::TrySendError::Closed(_) => "tunnel is closing",
        };
        send(out, ServerMessage::error(message)).await;
    }
}

async fn write_loop<Si>(mut sink: Si, mut rx: mpsc::Receiver<Message>)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "Tunnel write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

//! Exec and file operations
//!
//! Processed one at a time in arrival order, so responses come back in the
//! order their requests were sent. Each response also echoes the request's
//! `id` when one was given.

use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use podlink_cluster::{collect_output, ExecOutput, ExecSpec, WorkloadChannel};
use podlink_common::wire::{
    ExecRequest, ExecResponse, FileOperation, FileRequest, FileResponse, ServerMessage,
};

use super::mux::send;

/// A queued operation
#[derive(Debug)]
pub(super) enum Operation {
    Exec(ExecRequest),
    File(FileRequest),
}

/// Run queued operations until the queue closes or the tunnel is cancelled
pub(super) async fn run_worker(
    channel: Arc<dyn WorkloadChannel>,
    mut rx: mpsc::Receiver<Operation>,
    out: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        let operation = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(operation) => operation,
                None => break,
            },
        };

        let run = async {
            match operation {
                Operation::Exec(request) => run_exec(channel.as_ref(), request, &out).await,
                Operation::File(request) => run_file(channel.as_ref(), request, &out).await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Cancelled in-flight operation");
                break;
            }
            _ = run => {}
        }
    }
}

/// Decodes output chunks as UTF-8 without splitting a character across
/// two responses. Invalid sequences are replaced.
#[derive(Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Truncated multi-byte sequence at the end; hold it back
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(complete);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

#[instrument(skip_all, fields(command = %request.command, id = ?request.id))]
async fn run_exec(channel: &dyn WorkloadChannel, request: ExecRequest, out: &mpsc::Sender<Message>) {
    let id = request.id.clone();
    let spec = ExecSpec {
        argv: request.argv(),
        stdin: request.stdin.map(String::into_bytes),
        container: request.container,
    };

    let mut process = match channel.exec(spec).await {
        Ok(process) => process,
        Err(e) => {
            debug!(error = %e, "Exec failed to start");
            send(
                out,
                ServerMessage::ExecResponse(ExecResponse {
                    id,
                    stderr: Some(e.to_string()),
                    done: true,
                    ..Default::default()
                }),
            )
            .await;
            return;
        }
    };

    let mut stdout = Utf8Chunker::default();
    let mut stderr = Utf8Chunker::default();

    while let Some(chunk) = process.output_rx().recv().await {
        let response = match chunk {
            ExecOutput::Stdout(data) => ExecResponse {
                id: id.clone(),
                stdout: Some(stdout.push(&data)),
                ..Default::default()
            },
            ExecOutput::Stderr(data) => ExecResponse {
                id: id.clone(),
                stderr: Some(stderr.push(&data)),
                ..Default::default()
            },
        };
        if response.stdout.as_deref() == Some("") || response.stderr.as_deref() == Some("") {
            continue;
        }
        if !send(out, ServerMessage::ExecResponse(response)).await {
            return;
        }
    }

    let mut done = match process.finish().await {
        Ok(code) => {
            debug!(exit_code = code, "Exec finished");
            ExecResponse {
                exit_code: Some(code),
                ..Default::default()
            }
        }
        Err(e) => ExecResponse {
            stderr: Some(e.to_string()),
            ..Default::default()
        },
    };
    done.id = id;
    done.done = true;
    if let Some(tail) = stdout.finish() {
        done.stdout = Some(tail);
    }
    if let Some(tail) = stderr.finish() {
        done.stderr = Some(match done.stderr.take() {
            Some(error) => format!("{}{}", tail, error),
            None => tail,
        });
    }

    send(out, ServerMessage::ExecResponse(done)).await;
}

/// Command implementing a file primitive inside the workload
fn file_command(request: &FileRequest) -> Result<(FileOperation, ExecSpec), String> {
    let operation: FileOperation = request.operation.parse()?;
    if request.path.is_empty() {
        return Err("path is required".to_string());
    }
    let path = request.path.clone();

    let (argv, stdin): (Vec<&str>, Option<Vec<u8>>) = match operation {
        FileOperation::Read => (vec!["cat", "--", &path], None),
        FileOperation::Write => (
            vec!["sh", "-c", "cat > \"$1\"", "sh", &path],
            Some(request.content.clone().unwrap_or_default().into_bytes()),
        ),
        FileOperation::List => (vec!["ls", "-la", "--", &path], None),
        FileOperation::Delete => (vec!["rm", "-rf", "--", &path], None),
    };

    Ok((
        operation,
        ExecSpec {
            argv: argv.into_iter().map(String::from).collect(),
            stdin,
            container: None,
        },
    ))
}

#[instrument(skip_all, fields(operation = %request.operation, path = %request.path))]
async fn run_file(channel: &dyn WorkloadChannel, request: FileRequest, out: &mpsc::Sender<Message>) {
    let failure = |error: String| FileResponse {
        id: request.id.clone(),
        success: false,
        error: Some(error),
        ..Default::default()
    };

    let response = match file_command(&request) {
        Err(error) => failure(error),
        Ok((operation, spec)) => {
            let result = match channel.exec(spec).await {
                Ok(process) => collect_output(process).await,
                Err(e) => Err(e),
            };
            match result {
                Err(e) => failure(e.to_string()),
                Ok(output) if output.exit_code != 0 => {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    failure(if stderr.is_empty() {
                        format!("{} failed with exit code {}", operation, output.exit_code)
                    } else {
                        stderr
                    })
                }
                Ok(output) => FileResponse {
                    id: request.id.clone(),
                    success: true,
                    content: match operation {
                        FileOperation::Read | FileOperation::List => {
                            Some(String::from_utf8_lossy(&output.stdout).into_owned())
                        }
                        FileOperation::Write | FileOperation::Delete => None,
                    },
                    error: None,
                },
            }
        }
    };

    debug!(success = response.success, "File operation finished");
    send(out, ServerMessage::FileResponse(response)).await;
}

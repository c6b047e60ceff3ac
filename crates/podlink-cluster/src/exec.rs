//! Remote execution against a single workload
//!
//! The tunnel multiplexer talks to these traits only. [`KubeConnector`]
//! implements them with kube-rs, authenticating every call with the
//! session's scoped bearer token rather than the broker's own identity.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, AttachedProcess};
use kube::config::AuthInfo;
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::error::ExecError;
use podlink_common::{ScopedCredential, WorkloadLocation};

/// Read size for process output
const OUTPUT_CHUNK: usize = 4096;

/// Buffered output chunks per process
const OUTPUT_BUFFER: usize = 64;

/// One command to run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecSpec {
    /// Program and arguments
    pub argv: Vec<String>,
    /// Bytes written to stdin, which is then closed
    pub stdin: Option<Vec<u8>>,
    /// Container to run in; the pod's default when unset
    pub container: Option<String>,
}

/// A chunk of process output
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecOutput {
    /// Bytes from stdout
    Stdout(Vec<u8>),
    /// Bytes from stderr
    Stderr(Vec<u8>),
}

/// A running command
#[async_trait]
pub trait ExecProcess: Send {
    /// Output chunks in arrival order; yields `None` once both streams end
    fn output_rx(&mut self) -> &mut mpsc::Receiver<ExecOutput>;

    /// Wait for the exit code. Call after `output_rx` is drained.
    async fn finish(self: Box<Self>) -> Result<i32, ExecError>;
}

/// Byte stream to a forwarded port
pub trait ForwardIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardIo for T {}

/// Operations against one workload, authorized by one credential
#[async_trait]
pub trait WorkloadChannel: Send + Sync {
    /// Start a command
    async fn exec(&self, spec: ExecSpec) -> Result<Box<dyn ExecProcess>, ExecError>;

    /// Open a stream to `port` inside the workload
    async fn port_forward(&self, port: u16) -> Result<Box<dyn ForwardIo>, ExecError>;
}

/// Builds a [`WorkloadChannel`] from a scoped credential
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait WorkloadConnector: Send + Sync {
    /// Connect to `workload` using `credential`
    async fn connect(
        &self,
        workload: &WorkloadLocation,
        credential: &ScopedCredential,
    ) -> Result<Arc<dyn WorkloadChannel>, ExecError>;
}

/// Everything a finished command produced
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectedOutput {
    /// All stdout bytes
    pub stdout: Vec<u8>,
    /// All stderr bytes
    pub stderr: Vec<u8>,
    /// Process exit code
    pub exit_code: i32,
}

/// Drain a process to completion
pub async fn collect_output(mut process: Box<dyn ExecProcess>) -> Result<CollectedOutput, ExecError> {
    let mut out = CollectedOutput::default();
    while let Some(chunk) = process.output_rx().recv().await {
        match chunk {
            ExecOutput::Stdout(data) => out.stdout.extend_from_slice(&data),
            ExecOutput::Stderr(data) => out.stderr.extend_from_slice(&data),
        }
    }
    out.exit_code = process.finish().await?;
    Ok(out)
}

/// Exit code carried by the exec status
///
/// A missing status or `Success` is exit code 0. A non-zero exit arrives as
/// a `Failure` with reason `NonZeroExitCode` and the code in an `ExitCode`
/// cause. Any other failure is an error.
pub fn exit_code_from_status(status: Option<&Status>) -> Result<i32, ExecError> {
    let Some(status) = status else {
        return Ok(0);
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }

    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|c| c.message.as_deref())
            .and_then(|m| m.trim().parse::<i32>().ok());
        if let Some(code) = code {
            return Ok(code);
        }
    }

    Err(ExecError::Remote(
        status
            .message
            .clone()
            .unwrap_or_else(|| "command failed without a status message".to_string()),
    ))
}

/// [`WorkloadConnector`] that talks to the cluster API with kube-rs
#[derive(Clone)]
pub struct KubeConnector {
    base: kube::Config,
}

impl KubeConnector {
    /// Use `base` for the cluster URL and TLS roots. Its credentials are
    /// discarded for every connection.
    pub fn new(base: kube::Config) -> Self {
        Self { base }
    }
}

#[async_trait]
impl WorkloadConnector for KubeConnector {
    async fn connect(
        &self,
        workload: &WorkloadLocation,
        credential: &ScopedCredential,
    ) -> Result<Arc<dyn WorkloadChannel>, ExecError> {
        let mut config = self.base.clone();
        config.auth_info = AuthInfo {
            token: Some(credential.bearer_token().to_string().into()),
            ..Default::default()
        };

        let client = Client::try_from(config).map_err(|e| ExecError::Connect(e.to_string()))?;

        Ok(Arc::new(KubeChannel {
            pods: Api::namespaced(client, &workload.namespace),
            workload: workload.name.clone(),
        }))
    }
}

struct KubeChannel {
    pods: Api<Pod>,
    workload: String,
}

#[async_trait]
impl WorkloadChannel for KubeChannel {
    #[instrument(skip(self, spec), fields(workload = %self.workload))]
    async fn exec(&self, spec: ExecSpec) -> Result<Box<dyn ExecProcess>, ExecError> {
        let mut params = AttachParams::default()
            .stdin(spec.stdin.is_some())
            .stdout(true)
            .stderr(true);
        if let Some(container) = spec.container {
            params = params.container(container);
        }

        debug!(program = ?spec.argv.first(), "Starting exec");

        let attached = self
            .pods
            .exec(&self.workload, spec.argv, &params)
            .await
            .map_err(|e| ExecError::Start(e.to_string()))?;

        Ok(Box::new(KubeExecProcess::new(attached, spec.stdin)))
    }

    #[instrument(skip(self), fields(workload = %self.workload))]
    async fn port_forward(&self, port: u16) -> Result<Box<dyn ForwardIo>, ExecError> {
        let mut forwarder = self
            .pods
            .portforward(&self.workload, &[port])
            .await
            .map_err(|e| ExecError::PortForward(e.to_string()))?;

        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| ExecError::PortForward(format!("no stream for port {}", port)))?;

        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!(port, error = %e, "Port-forward ended with error");
            }
        });

        Ok(Box::new(stream))
    }
}

/// Process backed by a kube-rs [`AttachedProcess`]
struct KubeExecProcess {
    output_rx: mpsc::Receiver<ExecOutput>,
    tasks: Vec<JoinHandle<()>>,
    attached: AttachedProcess,
}

impl KubeExecProcess {
    fn new(mut attached: AttachedProcess, stdin: Option<Vec<u8>>) -> Self {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);
        let mut tasks = vec![];

        if let Some(stdout) = attached.stdout() {
            let tx = output_tx.clone();
            tasks.push(tokio::spawn(async move {
                forward_reader_to_channel(stdout, tx, ExecOutput::Stdout).await;
            }));
        }

        if let Some(stderr) = attached.stderr() {
            let tx = output_tx.clone();
            tasks.push(tokio::spawn(async move {
                forward_reader_to_channel(stderr, tx, ExecOutput::Stderr).await;
            }));
        }

        drop(output_tx);

        // Written from a task so a process that fills its output buffers
        // before reading all of stdin cannot stall us. Dropping the writer
        // closes stdin.
        if let (Some(data), Some(mut writer)) = (stdin, attached.stdin()) {
            tasks.push(tokio::spawn(async move {
                if let Err(e) = writer.write_all(&data).await {
                    debug!(error = %e, "Failed to write stdin");
                }
                let _ = writer.shutdown().await;
            }));
        }

        Self {
            output_rx,
            tasks,
            attached,
        }
    }
}

#[async_trait]
impl ExecProcess for KubeExecProcess {
    fn output_rx(&mut self) -> &mut mpsc::Receiver<ExecOutput> {
        &mut self.output_rx
    }

    async fn finish(mut self: Box<Self>) -> Result<i32, ExecError> {
        let status = match self.attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        for task in self.tasks.drain(..) {
            task.abort();
        }
        exit_code_from_status(status.as_ref())
    }
}

impl Drop for KubeExecProcess {
    fn drop(&mut self) {
        // Cancelled mid-stream: stop the readers and the stdin writer
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn forward_reader_to_channel<R, F>(mut reader: R, tx: mpsc::Sender<ExecOutput>, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(Vec<u8>) -> ExecOutput,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Reader error");
                break;
            }
        }
    }
}

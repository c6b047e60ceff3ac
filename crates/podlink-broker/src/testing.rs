//! In-memory stand-ins for the cluster and the workload

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use podlink_cluster::{
    ClusterApiError, ExecError, ExecOutput, ExecProcess, ExecSpec, ForwardIo, IssuedBearer,
    MinterConfig, PrincipalApi, ScopedMinter, WorkloadChannel, WorkloadConnector,
};
use podlink_common::{ScopedCredential, WorkloadLocation, WorkloadStatus};
use podlink_identity::MockIdentityExchange;

use crate::locator::MockWorkloadLocator;
use crate::registry::{RegistryConfig, SessionRegistry, SessionTokenSigner};
use crate::server::AppState;

pub(crate) const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

/// Port the fake workload echoes on
pub(crate) const ECHO_PORT: u16 = 8888;

pub(crate) fn alice_workload() -> WorkloadLocation {
    WorkloadLocation {
        name: "nb-alice".into(),
        namespace: "user-alice".into(),
        status: WorkloadStatus::Running,
    }
}

/// Service accounts and bindings in a fake cluster
#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    inner: Arc<FakeClusterState>,
}

#[derive(Default)]
struct FakeClusterState {
    principals: Mutex<HashSet<(String, String)>>,
    bindings: Mutex<HashSet<(String, String)>>,
    fail_binding: Mutex<bool>,
}

impl FakeCluster {
    pub(crate) fn principals(&self) -> Vec<(String, String)> {
        self.inner.principals.lock().iter().cloned().collect()
    }

    pub(crate) fn has_principal(&self, namespace: &str, name: &str) -> bool {
        self.inner
            .principals
            .lock()
            .contains(&(namespace.to_string(), name.to_string()))
    }

    pub(crate) fn binding_count(&self) -> usize {
        self.inner.bindings.lock().len()
    }

    pub(crate) fn fail_bindings(&self) {
        *self.inner.fail_binding.lock() = true;
    }
}

#[async_trait]
impl PrincipalApi for FakeCluster {
    async fn create_principal(
        &self,
        namespace: &str,
        name: &str,
        _workload: &str,
    ) -> Result<(), ClusterApiError> {
        self.inner
            .principals
            .lock()
            .insert((namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn ensure_role(&self, _namespace: &str, workload: &str) -> Result<String, ClusterApiError> {
        Ok(podlink_cluster::principal::role_name(workload))
    }

    async fn create_binding(
        &self,
        namespace: &str,
        binding: &str,
        _principal: &str,
        _role: &str,
    ) -> Result<(), ClusterApiError> {
        if *self.inner.fail_binding.lock() {
            return Err(ClusterApiError("rolebindings is forbidden".into()));
        }
        self.inner
            .bindings
            .lock()
            .insert((namespace.to_string(), binding.to_string()));
        Ok(())
    }

    async fn request_token(
        &self,
        _namespace: &str,
        principal: &str,
        ttl_secs: i64,
    ) -> Result<IssuedBearer, ClusterApiError> {
        Ok(IssuedBearer {
            token: Zeroizing::new(format!("bearer-{}", principal)),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
        })
    }

    async fn delete_binding(&self, namespace: &str, binding: &str) -> Result<(), ClusterApiError> {
        self.inner
            .bindings
            .lock()
            .remove(&(namespace.to_string(), binding.to_string()));
        Ok(())
    }

    async fn delete_principal(&self, namespace: &str, name: &str) -> Result<(), ClusterApiError> {
        self.inner
            .principals
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

/// A workload with an in-memory filesystem
///
/// Understands the handful of commands the tunnel issues: `echo`, `cat`,
/// the `sh -c 'cat > "$1"'` write, `ls`, `rm`, `false` and `sleep`, which
/// never exits. Port 8888 echoes.
#[derive(Default)]
pub(crate) struct FakeWorkload {
    files: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<Vec<String>>>,
}

impl FakeWorkload {
    pub(crate) fn file(&self, path: &str) -> Option<String> {
        self.files.lock().get(path).cloned()
    }

    pub(crate) fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }

    fn run(&self, argv: &[String], stdin: Option<Vec<u8>>) -> Result<ScriptedProcess, ExecError> {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        let stdin = stdin.map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        let process = match args.as_slice() {
            ["echo", rest @ ..] => ScriptedProcess::ok(format!("{}\n", rest.join(" "))),
            ["cat"] => ScriptedProcess::ok(stdin.unwrap_or_default()),
            ["cat", "--", path] => match self.files.lock().get(*path) {
                Some(content) => ScriptedProcess::ok(content.clone()),
                None => ScriptedProcess::failed(
                    format!("cat: {}: No such file or directory\n", path),
                    1,
                ),
            },
            ["sh", "-c", "cat > \"$1\"", "sh", path] => {
                self.files
                    .lock()
                    .insert(path.to_string(), stdin.unwrap_or_default());
                ScriptedProcess::ok(String::new())
            }
            ["ls", "-la", "--", path] => {
                let listing: Vec<String> = self
                    .files
                    .lock()
                    .keys()
                    .filter(|name| name.starts_with(*path))
                    .cloned()
                    .collect();
                if listing.is_empty() {
                    ScriptedProcess::failed(
                        format!("ls: cannot access '{}': No such file or directory\n", path),
                        2,
                    )
                } else {
                    ScriptedProcess::ok(format!("{}\n", listing.join("\n")))
                }
            }
            ["rm", "-rf", "--", path] => {
                self.files.lock().retain(|name, _| !name.starts_with(*path));
                ScriptedProcess::ok(String::new())
            }
            ["false"] => ScriptedProcess::failed(String::new(), 1),
            ["sleep", ..] => ScriptedProcess::hanging(),
            [program, ..] => {
                return Err(ExecError::Start(format!(
                    "executable file not found in $PATH: {}",
                    program
                )))
            }
            [] => return Err(ExecError::Start("empty command".into())),
        };
        Ok(process)
    }
}

#[async_trait]
impl WorkloadChannel for FakeWorkload {
    async fn exec(&self, spec: ExecSpec) -> Result<Box<dyn ExecProcess>, ExecError> {
        self.commands.lock().push(spec.argv.clone());
        Ok(Box::new(self.run(&spec.argv, spec.stdin)?))
    }

    async fn port_forward(&self, port: u16) -> Result<Box<dyn ForwardIo>, ExecError> {
        if port != ECHO_PORT {
            return Err(ExecError::PortForward(format!(
                "connection refused on port {}",
                port
            )));
        }

        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match server.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if server.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(client))
    }
}

struct ScriptedProcess {
    rx: mpsc::Receiver<ExecOutput>,
    exit_code: i32,
    // Keeps the output open forever
    _hold: Option<mpsc::Sender<ExecOutput>>,
}

impl ScriptedProcess {
    fn new(stdout: String, stderr: String, exit_code: i32, hang: bool) -> Self {
        let (tx, rx) = mpsc::channel(4);
        if !stdout.is_empty() {
            let _ = tx.try_send(ExecOutput::Stdout(stdout.into_bytes()));
        }
        if !stderr.is_empty() {
            let _ = tx.try_send(ExecOutput::Stderr(stderr.into_bytes()));
        }
        Self {
            rx,
            exit_code,
            _hold: hang.then_some(tx),
        }
    }

    fn ok(stdout: String) -> Self {
        Self::new(stdout, String::new(), 0, false)
    }

    fn failed(stderr: String, exit_code: i32) -> Self {
        Self::new(String::new(), stderr, exit_code, false)
    }

    fn hanging() -> Self {
        Self::new(String::new(), String::new(), 0, true)
    }
}

#[async_trait]
impl ExecProcess for ScriptedProcess {
    fn output_rx(&mut self) -> &mut mpsc::Receiver<ExecOutput> {
        &mut self.rx
    }

    async fn finish(self: Box<Self>) -> Result<i32, ExecError> {
        Ok(self.exit_code)
    }
}

/// Hands out the same [`FakeWorkload`] for every credential
#[derive(Default)]
pub(crate) struct FakeConnector {
    pub(crate) workload: Arc<FakeWorkload>,
    connected_with: Mutex<Vec<String>>,
}

impl FakeConnector {
    /// Bearer tokens the tunnel connected with
    pub(crate) fn bearers(&self) -> Vec<String> {
        self.connected_with.lock().clone()
    }
}

#[async_trait]
impl WorkloadConnector for FakeConnector {
    async fn connect(
        &self,
        _workload: &WorkloadLocation,
        credential: &ScopedCredential,
    ) -> Result<Arc<dyn WorkloadChannel>, ExecError> {
        self.connected_with
            .lock()
            .push(credential.bearer_token().to_string());
        let channel: Arc<dyn WorkloadChannel> = self.workload.clone();
        Ok(channel)
    }
}

/// A broker wired to fakes
pub(crate) struct TestApp {
    pub(crate) state: AppState,
    pub(crate) cluster: FakeCluster,
    pub(crate) connector: Arc<FakeConnector>,
}

/// Build broker state around the given identity and locator mocks
pub(crate) fn test_app(
    identity: MockIdentityExchange,
    locator: MockWorkloadLocator,
    registry_config: RegistryConfig,
) -> TestApp {
    let cluster = FakeCluster::default();
    let minter = ScopedMinter::new(cluster.clone(), MinterConfig::default());
    let connector = Arc::new(FakeConnector::default());

    let registry = SessionRegistry::new(
        Arc::new(minter),
        SessionTokenSigner::new(SECRET).expect("test secret is long enough"),
        registry_config,
    );

    let state = AppState {
        identity: Arc::new(identity),
        locator: Arc::new(locator),
        registry,
        connector: connector.clone(),
        public_url: None,
        tunnel_idle_timeout: Duration::from_secs(60),
    };

    TestApp {
        state,
        cluster,
        connector,
    }
}

pub(crate) fn default_registry_config() -> RegistryConfig {
    RegistryConfig {
        session_ttl: Duration::from_secs(3600),
        token_ttl: Duration::from_secs(900),
    }
}

//! Podlink - session broker for workload-scoped cluster access

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zeroize::Zeroizing;

use podlink_broker::{
    AppState, BrokerConfig, HubConfig, HubWorkloadLocator, SessionRegistry, SessionSettings,
    SessionTokenSigner, TlsFiles,
};
use podlink_cluster::{KubeConnector, KubePrincipalApi, MinterConfig, ScopedMinter};
use podlink_identity::{OidcConfig, OidcExchange, ProviderEndpoints};

/// Podlink - hands out minute-lived, workload-scoped cluster access over a
/// single authenticated tunnel
#[derive(Parser, Debug)]
#[command(name = "podlink", version, about, long_about = None)]
struct Cli {
    /// HTTP bind address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Base for tunnel URLs; `wss://<Host header>` when unset
    #[arg(long, env = "PUBLIC_URL")]
    public_url: Option<String>,

    /// PEM certificate chain; TLS is served when both cert and key are set
    #[arg(long, env = "TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, env = "TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// HS256 secret for session tokens (at least 32 bytes)
    #[arg(long, env = "SESSION_SECRET", hide_env_values = true)]
    session_secret: String,

    /// Absolute session lifetime in seconds
    #[arg(long, env = "SESSION_TTL_SECS", default_value = "3600")]
    session_ttl_secs: u64,

    /// Session token lifetime in seconds; must be shorter than the credential lifetime
    #[arg(long, env = "SESSION_TOKEN_TTL_SECS", default_value = "900")]
    session_token_ttl_secs: u64,

    /// Bearer-token lifetime requested from the cluster, in seconds
    ///
    /// Clamped to the session lifetime, never below 600.
    #[arg(long, env = "CREDENTIAL_TTL_SECS", default_value = "3600")]
    credential_ttl_secs: u64,

    /// Period of the expired-session sweep in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "300")]
    sweep_interval_secs: u64,

    /// Close a tunnel after this many seconds without client frames
    #[arg(long, env = "TUNNEL_IDLE_TIMEOUT_SECS", default_value = "1800")]
    tunnel_idle_timeout_secs: u64,

    /// Grace period for in-flight requests on shutdown, in seconds
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "30")]
    shutdown_grace_secs: u64,

    /// Identity provider base URL
    #[arg(long, env = "OIDC_ISSUER", default_value = "https://cilogon.org")]
    oidc_issuer: String,

    /// Resolve provider endpoints from `/.well-known/openid-configuration`
    /// instead of the issuer's fixed paths
    #[arg(long, env = "OIDC_DISCOVERY")]
    oidc_discovery: bool,

    /// OAuth client id
    #[arg(long, env = "OIDC_CLIENT_ID")]
    oidc_client_id: String,

    /// OAuth client secret
    #[arg(long, env = "OIDC_CLIENT_SECRET", hide_env_values = true)]
    oidc_client_secret: String,

    /// Redirect URL registered with the provider
    #[arg(long, env = "OIDC_REDIRECT_URL")]
    oidc_redirect_url: String,

    /// Requested scopes, space separated
    #[arg(long, env = "OIDC_SCOPES", default_value = "openid email profile")]
    oidc_scopes: String,

    /// Provider hint appended to the authorization URL as `selected_idp`
    #[arg(long, env = "OIDC_SELECTED_IDP")]
    oidc_selected_idp: Option<String>,

    /// Timeout for each identity provider and hub call, in seconds
    #[arg(long, env = "OIDC_TIMEOUT_SECS", default_value = "30")]
    oidc_timeout_secs: u64,

    /// Hub API base URL
    #[arg(long, env = "HUB_API_URL")]
    hub_api_url: String,

    /// Hub API token
    #[arg(long, env = "HUB_API_TOKEN", hide_env_values = true)]
    hub_api_token: Option<String>,

    /// Workload namespace is this prefix plus the username
    #[arg(long, env = "NAMESPACE_PREFIX", default_value = "user-")]
    namespace_prefix: String,

    /// Workload name is this prefix plus the username
    #[arg(long, env = "WORKLOAD_PREFIX", default_value = "nb-")]
    workload_prefix: String,

    /// Upper bound on waiting for a workload to become ready, in seconds
    #[arg(long, env = "WORKLOAD_READY_TIMEOUT_SECS", default_value = "300")]
    workload_ready_timeout_secs: u64,

    /// Delay between workload readiness checks, in seconds
    #[arg(long, env = "WORKLOAD_POLL_INTERVAL_SECS", default_value = "2")]
    workload_poll_interval_secs: u64,
}

impl Cli {
    fn broker_config(&self) -> BrokerConfig {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        };

        BrokerConfig {
            listen_addr: self.listen_addr,
            public_url: self.public_url.clone(),
            tls,
            session: SessionSettings {
                secret: Zeroizing::new(self.session_secret.as_bytes().to_vec()),
                session_ttl: Duration::from_secs(self.session_ttl_secs),
                token_ttl: Duration::from_secs(self.session_token_ttl_secs),
                credential_ttl: Duration::from_secs(self.credential_ttl_secs),
                sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            },
            tunnel_idle_timeout: Duration::from_secs(self.tunnel_idle_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    fn oidc_config(&self) -> OidcConfig {
        OidcConfig {
            issuer: self.oidc_issuer.clone(),
            client_id: self.oidc_client_id.clone(),
            client_secret: Zeroizing::new(self.oidc_client_secret.clone()),
            redirect_url: self.oidc_redirect_url.clone(),
            scopes: self
                .oidc_scopes
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            selected_idp: self.oidc_selected_idp.clone(),
            timeout: Duration::from_secs(self.oidc_timeout_secs),
        }
    }

    fn hub_config(&self) -> HubConfig {
        HubConfig {
            api_url: self.hub_api_url.clone(),
            api_token: self.hub_api_token.clone().map(Zeroizing::new),
            namespace_prefix: self.namespace_prefix.clone(),
            workload_prefix: self.workload_prefix.clone(),
            ready_timeout: Duration::from_secs(self.workload_ready_timeout_secs),
            poll_interval: Duration::from_secs(self.workload_poll_interval_secs),
            request_timeout: Duration::from_secs(self.oidc_timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Every TLS client and the optional TLS listener use aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.broker_config();
    config.validate()?;

    let oidc = cli.oidc_config();
    oidc.validate()?;
    let endpoints = if cli.oidc_discovery {
        ProviderEndpoints::discover(&oidc.issuer, oidc.timeout).await?
    } else {
        ProviderEndpoints::from_issuer(&oidc.issuer)
    };
    let identity = OidcExchange::new(oidc, endpoints)?;

    let locator = HubWorkloadLocator::new(cli.hub_config())?;

    let kube_config = kube::Config::infer()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load cluster config: {}", e))?;
    let client = Client::try_from(kube_config.clone())
        .map_err(|e| anyhow::anyhow!("Failed to create cluster client: {}", e))?;

    let minter = ScopedMinter::new(
        KubePrincipalApi::new(client),
        MinterConfig {
            token_ttl: config.credential_ttl(),
            ..MinterConfig::default()
        },
    );
    let signer = SessionTokenSigner::new(&config.session.secret)?;
    let registry = SessionRegistry::new(Arc::new(minter), signer, config.registry_config());

    let state = AppState {
        identity: Arc::new(identity),
        locator: Arc::new(locator),
        registry,
        connector: Arc::new(KubeConnector::new(kube_config)),
        public_url: config.public_url.clone(),
        tunnel_idle_timeout: config.tunnel_idle_timeout,
    };

    info!(
        session_ttl_secs = config.session.session_ttl.as_secs(),
        token_ttl_secs = config.session.token_ttl.as_secs(),
        credential_ttl_secs = config.credential_ttl().as_secs(),
        "Broker configured"
    );

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
            shutdown.cancel();
        });
    }

    podlink_broker::serve(&config, state, shutdown).await?;
    info!("Broker stopped");
    Ok(())
}

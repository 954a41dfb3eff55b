//! Spaceport - tenant virtual clusters driven by a backend event stream

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use spaceport_agent::pinger::DEFAULT_PING_INTERVAL;
use spaceport_agent::{
    build_router, BackendClient, ClusterPing, EventStream, HttpBackendClient, KubeSpecStore,
    OAuthClientCredentials, Pinger, StreamConfig, TokenSource, WsConnector,
};
use spaceport_common::crd::{HostCluster, Project};
use spaceport_common::registry::ResourceRegistry;
use spaceport_common::retry::{retry_with_backoff, RetryConfig};
use spaceport_common::telemetry::{init_tracing, TelemetryConfig};
use spaceport_common::FIELD_MANAGER;
use spaceport_operator::controller_runner::{build_host_controllers, build_project_controllers};
use spaceport_operator::health::{self, Readiness};
use spaceport_operator::values::ValuesDefaults;

/// Spaceport - provisions per-tenant virtual clusters on a shared host
#[derive(Parser, Debug)]
#[command(name = "spaceport", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "SPACEPORT_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Project and HostCluster controllers (default mode)
    Controller(ControllerArgs),
    /// Run the event-stream agent
    ///
    /// Subscribes to the backend's event channel for this host cluster,
    /// turns events into Project and Configuration writes, and pings the
    /// backend on a fixed interval.
    Agent(AgentArgs),
}

/// Health server address when none is configured
const DEFAULT_HEALTH_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 8081);

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Address of the health server
    #[arg(long, env = "SPACEPORT_HEALTH_ADDR", default_value_t = DEFAULT_HEALTH_ADDR)]
    health_addr: SocketAddr,

    /// Ingress class for tenant API ingresses
    #[arg(long, env = "SPACEPORT_INGRESS_CLASS")]
    ingress_class: Option<String>,

    /// Domain under which tenant API hosts are published
    #[arg(long, env = "SPACEPORT_INGRESS_DOMAIN")]
    ingress_domain: Option<String>,

    /// OIDC issuer for tenant API servers
    #[arg(long, env = "SPACEPORT_OIDC_ISSUER_URL")]
    oidc_issuer_url: Option<String>,

    /// OIDC client id for tenant API servers
    #[arg(long, env = "SPACEPORT_OIDC_CLIENT_ID")]
    oidc_client_id: Option<String>,

    /// Backend API base URL; enables project status reports
    #[arg(long, env = "SPACEPORT_BACKEND_URL")]
    backend_url: Option<String>,

    /// OAuth token endpoint used for status reports
    #[arg(long, env = "SPACEPORT_TOKEN_URL")]
    token_url: Option<String>,

    /// OAuth client id used for status reports
    #[arg(long, env = "SPACEPORT_CLIENT_ID")]
    client_id: Option<String>,

    /// OAuth client secret used for status reports
    #[arg(long, env = "SPACEPORT_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            health_addr: DEFAULT_HEALTH_ADDR,
            ingress_class: None,
            ingress_domain: None,
            oidc_issuer_url: None,
            oidc_client_id: None,
            backend_url: None,
            token_url: None,
            client_id: None,
            client_secret: None,
        }
    }
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Event stream URL
    #[arg(long, env = "SPACEPORT_STREAM_URL")]
    stream_url: String,

    /// Channel to subscribe to
    #[arg(long, env = "SPACEPORT_CHANNEL", default_value = "ClusterChannel")]
    channel: String,

    /// Backend identifier of this host cluster
    #[arg(long, env = "SPACEPORT_CLUSTER_ID")]
    cluster_id: i64,

    /// OAuth client id
    #[arg(long, env = "SPACEPORT_CLIENT_ID")]
    client_id: String,

    /// OAuth client secret
    #[arg(long, env = "SPACEPORT_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,

    /// OAuth token endpoint
    #[arg(long, env = "SPACEPORT_TOKEN_URL")]
    token_url: String,

    /// Backend API base URL
    #[arg(long, env = "SPACEPORT_API_URL")]
    api_url: String,

    /// Drop outbound messages while disconnected instead of queueing them
    #[arg(long, env = "SPACEPORT_NO_BACKLOG")]
    no_backlog: bool,

    /// Seconds between backend pings
    #[arg(long, env = "SPACEPORT_PING_INTERVAL", default_value_t = DEFAULT_PING_INTERVAL.as_secs())]
    ping_interval: u64,

    /// Region reported in pings
    #[arg(long, env = "SPACEPORT_REGION", default_value = "")]
    region: String,

    /// Infrastructure provider reported in pings
    #[arg(long, env = "SPACEPORT_PROVIDER", default_value = "")]
    provider: String,

    /// Identifier of this agent instance reported in pings
    #[arg(long, env = "SPACEPORT_AGENT_IDENTIFIER", default_value = "")]
    agent_identifier: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in [Project::crd(), HostCluster::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_tracing(TelemetryConfig { json: cli.log_json })?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
        Some(Commands::Agent(args)) => run_agent(args).await,
    }
}

/// Ensure the spaceport CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Project::crd(), HostCluster::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_crd", || async {
            crds.patch(&name, &params, &Patch::Apply(&crd)).await
        })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("All spaceport CRDs installed/updated");
    Ok(())
}

/// Client-credential token source, when all three settings are present
fn token_source(
    http: &reqwest::Client,
    token_url: Option<&str>,
    client_id: Option<&str>,
    client_secret: Option<&str>,
) -> Option<Arc<dyn TokenSource>> {
    match (token_url, client_id, client_secret) {
        (Some(url), Some(id), Some(secret)) => Some(Arc::new(OAuthClientCredentials::new(
            http.clone(),
            url,
            id,
            secret,
        ))),
        _ => None,
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let registry = Arc::new(ResourceRegistry::new());
    let defaults = ValuesDefaults {
        ingress_class: args.ingress_class,
        ingress_domain: args.ingress_domain,
        oidc_issuer_url: args.oidc_issuer_url,
        oidc_client_id: args.oidc_client_id,
    };

    let backend: Option<Arc<dyn BackendClient>> = match args.backend_url.as_deref() {
        Some(url) => {
            let http = reqwest::Client::new();
            let tokens = token_source(
                &http,
                args.token_url.as_deref(),
                args.client_id.as_deref(),
                args.client_secret.as_deref(),
            )
            .ok_or_else(|| {
                anyhow::anyhow!("--backend-url requires --token-url, --client-id and --client-secret")
            })?;
            tracing::info!(url = %url, "Project status reports enabled");
            Some(Arc::new(HttpBackendClient::new(http, url, tokens)?))
        }
        None => None,
    };

    tracing::info!("Starting controllers:");
    let mut controllers = build_host_controllers(client.clone());
    controllers.extend(build_project_controllers(
        client, registry, defaults, backend,
    ));

    let readiness = Readiness::default();
    let cancel = CancellationToken::new();
    let health_server = {
        let readiness = readiness.clone();
        let cancel = cancel.clone();
        let addr = args.health_addr;
        tokio::spawn(async move {
            if let Err(e) = health::serve(addr, readiness, cancel).await {
                tracing::error!(error = %e, "health server failed");
            }
        })
    };

    readiness.set_ready();
    futures::future::join_all(controllers).await;

    cancel.cancel();
    if let Err(e) = health_server.await {
        tracing::debug!(error = %e, "health server task did not finish cleanly");
    }
    tracing::info!("spaceport controller shutting down");
    Ok(())
}

async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let version = client
        .apiserver_version()
        .await
        .map(|info| info.git_version)
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to read server version");
            String::new()
        });

    let http = reqwest::Client::new();
    let tokens: Arc<dyn TokenSource> = Arc::new(OAuthClientCredentials::new(
        http.clone(),
        args.token_url,
        args.client_id,
        args.client_secret,
    ));

    let registry = Arc::new(ResourceRegistry::new());
    let store = Arc::new(KubeSpecStore::new(client, registry.clone()));
    let router = Arc::new(build_router(store, registry));

    let config = StreamConfig {
        url: args.stream_url.clone(),
        channel: args.channel,
        cluster_id: args.cluster_id,
        use_backlog: !args.no_backlog,
        ..Default::default()
    };
    let (stream, _handle) = EventStream::new(
        config,
        Arc::new(WsConnector::new(args.stream_url)),
        tokens.clone(),
        router,
    )?;

    let backend = Arc::new(HttpBackendClient::new(http, &args.api_url, tokens)?);
    let pinger = Pinger::new(
        backend,
        args.cluster_id,
        ClusterPing {
            version,
            region: args.region,
            provider: args.provider,
            agent_identifier: args.agent_identifier,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        },
        Duration::from_secs(args.ping_interval.max(1)),
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
        shutdown.cancel();
    });

    tracing::info!(cluster_id = args.cluster_id, "starting agent");
    tokio::join!(stream.run(cancel.clone()), pinger.run(cancel));
    tracing::info!("spaceport agent shutting down");
    Ok(())
}

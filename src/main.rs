//! kube-applier - GitOps reconciliation agent for Kubernetes

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_applier::client::{ClusterClient, KubeClusterClient};
use kube_applier::git::{GitRepository, Repository};
use kube_applier::kubectl::KubectlClient;
use kube_applier::run::{Runner, Scheduler, Strongboxer, DEFAULT_RUNNER_WORKER_COUNT};
use kube_applier::sysutil::{self, SystemClock};
use kube_applier::webserver::{self, AppState};

// The repository mirror atomically places the working tree at REPO_PATH
// once its initial pull finishes, so it will not be present immediately.
const WAIT_FOR_REPO_INTERVAL: Duration = Duration::from_secs(1);
const WAIT_FOR_REPO_TIMEOUT: Duration = Duration::from_secs(120);

/// kube-applier - applies manifests from a git working tree, one Waybill per
/// namespace
#[derive(Parser, Debug)]
#[command(name = "kube-applier", version, about, long_about = None)]
struct Config {
    /// Path of the git working tree maintained by the repository mirror
    #[arg(long, env = "REPO_PATH")]
    repo_path: PathBuf,

    /// Listen port for metrics, health and force-run requests
    #[arg(long, env = "LISTEN_PORT", default_value_t = 8080)]
    listen_port: u16,

    /// Format string for commit diff links shown in statuses; must contain %s
    #[arg(long, env = "DIFF_URL_FORMAT", default_value = "")]
    diff_url_format: String,

    /// Seconds between git head checks
    #[arg(long, env = "POLL_INTERVAL_SECONDS", default_value_t = 5)]
    poll_interval_seconds: u64,

    /// Fallback runInterval, in seconds, for Waybills that do not set one
    #[arg(long, env = "FULL_RUN_INTERVAL_SECONDS", default_value_t = 3600)]
    full_run_interval_seconds: u64,

    /// Seconds between Waybill list syncs
    #[arg(long, env = "WAYBILL_POLL_INTERVAL_SECONDS", default_value_t = 60)]
    waybill_poll_interval_seconds: u64,

    /// Force server-side dry-run for every namespace
    #[arg(long, env = "DRY_RUN", default_value_t = false)]
    dry_run: bool,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Number of runner workers
    #[arg(long, env = "WORKER_COUNT", default_value_t = DEFAULT_RUNNER_WORKER_COUNT)]
    worker_count: usize,

    /// Resource kinds (group/version/Kind) never pruned, comma-separated
    #[arg(long, env = "PRUNE_BLACKLIST", value_delimiter = ',', num_args = 0..)]
    prune_blacklist: Vec<String>,

    /// SSH key used to clone repositories for Waybills without their own
    #[arg(long, env = "DEFAULT_GIT_SSH_KEY_PATH")]
    default_git_ssh_key_path: Option<PathBuf>,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if !self.diff_url_format.is_empty() && !self.diff_url_format.contains("%s") {
            anyhow::bail!(
                "invalid DIFF_URL_FORMAT, must contain %s: {}",
                self.diff_url_format
            );
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    sysutil::wait_for_dir(&config.repo_path, WAIT_FOR_REPO_INTERVAL, WAIT_FOR_REPO_TIMEOUT)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let cluster: Arc<dyn ClusterClient> = Arc::new(
        KubeClusterClient::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("failed to create the cluster client: {}", e))?,
    );
    let repository: Arc<dyn Repository> = Arc::new(GitRepository::new(&config.repo_path));

    let runner = Runner {
        clock: Arc::new(SystemClock),
        cluster: cluster.clone(),
        invoker: Arc::new(KubectlClient::default()),
        repository: repository.clone(),
        strongbox: Arc::new(Strongboxer),
        default_git_ssh_key_path: config.default_git_ssh_key_path.clone(),
        dry_run: config.dry_run,
        prune_blacklist: config.prune_blacklist.clone(),
        worker_count: config.worker_count,
    };
    let runner = runner.start();

    let mut scheduler = Scheduler::new(
        Arc::new(SystemClock),
        cluster.clone(),
        repository,
        runner.queue(),
        Duration::from_secs(config.waybill_poll_interval_seconds),
        Duration::from_secs(config.poll_interval_seconds),
        Duration::from_secs(config.full_run_interval_seconds),
    );
    scheduler.start();
    tracing::info!("scheduler started");

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let state = AppState::new(cluster, runner.queue());
    let webserver = tokio::spawn(async move {
        if let Err(e) = webserver::serve(addr, state).await {
            tracing::error!(error = %e, "webserver error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("failed to listen for shutdown signal: {}", e))?;

    tracing::info!("shutting down");
    scheduler.stop();
    drop(scheduler);
    webserver.abort();
    // Workers drain any queued requests before exiting
    runner.stop().await;

    tracing::info!("kube-applier shut down");
    Ok(())
}

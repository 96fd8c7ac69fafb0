//! The runner worker pool.
//!
//! Workers dequeue run requests and own the full request lifecycle: delegate
//! token resolution, prunable-resource discovery, workspace construction,
//! SSH and keyring provisioning, the repository clone, the apply invocation
//! and the status writeback. Failures before the apply step are captured as
//! request failures on the Waybill with a Warning event.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::EventType;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::ssh;
use super::{Request, StrongboxProvisioner, DEFAULT_WORKER_QUEUE_SIZE};
use crate::client::ClusterClient;
use crate::crd::{Waybill, WaybillStatus, WaybillStatusRun};
use crate::git::Repository;
use crate::kubectl::{ApplyInvoker, ApplyOptions, ApplyOutcome, DryRunStrategy};
use crate::metrics;
use crate::sysutil::{Clock, Workspace};
use crate::Error;

/// Secret type expected for the delegate service account token
const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Deadline for status writes that happen outside a run's own timeout
const STATUS_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Manages the full process of apply runs: workers read requests from the
/// queue, apply the referenced subtree and write results back to the Waybill
pub struct Runner {
    /// Wall clock for run timestamps
    pub clock: Arc<dyn Clock>,
    /// Cluster access with the applier's own identity
    pub cluster: Arc<dyn ClusterClient>,
    /// The apply pipeline
    pub invoker: Arc<dyn ApplyInvoker>,
    /// The mirrored git working tree
    pub repository: Arc<dyn Repository>,
    /// Strongbox provisioning
    pub strongbox: Arc<dyn StrongboxProvisioner>,
    /// Process-wide fallback SSH key for Waybills without their own
    pub default_git_ssh_key_path: Option<PathBuf>,
    /// Force server-side dry-run for every run
    pub dry_run: bool,
    /// Process-wide prune blacklist, merged with each Waybill's
    pub prune_blacklist: Vec<String>,
    /// Number of workers
    pub worker_count: usize,
}

/// Handle over the started worker pool
pub struct RunnerHandle {
    queue: mpsc::Sender<Request>,
    workers: Vec<JoinHandle<()>>,
}

impl RunnerHandle {
    /// A sender for enqueueing run requests
    pub fn queue(&self) -> mpsc::Sender<Request> {
        self.queue.clone()
    }

    /// Graceful shutdown: close the queue and wait for the workers to drain
    /// it and exit. Senders cloned from [`RunnerHandle::queue`] must be
    /// dropped by their owners for the drain to finish.
    pub async fn stop(self) {
        drop(self.queue);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

impl Runner {
    /// Start the worker pool and return its handle
    pub fn start(self) -> RunnerHandle {
        let worker_count = self.worker_count.max(1);
        let (tx, rx) = mpsc::channel(DEFAULT_WORKER_QUEUE_SIZE);
        let rx = Arc::new(Mutex::new(rx));
        let runner = Arc::new(self);
        let workers = (0..worker_count)
            .map(|_| tokio::spawn(apply_worker(runner.clone(), rx.clone())))
            .collect();
        RunnerHandle { queue: tx, workers }
    }

    /// Process a single request end-to-end
    pub(crate) async fn process_request(&self, request: &Request) -> Result<(), Error> {
        let waybill_id = request.waybill.id();
        info!(waybill = %waybill_id, "started apply run");
        metrics::get().update_run_request(request.type_, &request.waybill, -1);

        if request.waybill.spec.run_timeout <= 0 {
            return Err(Error::config(
                "runTimeout must be a positive number of seconds",
            ));
        }
        let deadline =
            Instant::now() + Duration::from_secs(request.waybill.spec.run_timeout as u64);

        let token = with_deadline(deadline, self.get_delegate_token(&request.waybill))
            .await
            .map_err(|e| Error::secret(format!("failed fetching delegate token: {}", e)))?;

        // Discovery runs under the delegate identity so that pruning cannot
        // exceed the delegate's rights.
        let delegate = self.cluster.delegate(&token).await?;
        let (cluster_resources, namespaced_resources) = with_deadline(
            deadline,
            delegate.prunable_resource_gvks(request.waybill.namespace()),
        )
        .await
        .map_err(|e| Error::apply(format!("could not compute list of prunable resources: {}", e)))?;

        let workspace = Workspace::create(request.waybill.namespace(), request.waybill.name())
            .map_err(|e| Error::config(format!("could not setup temporary directories: {}", e)))?;

        let mut environment = Vec::new();
        let git_ssh = with_deadline(
            deadline,
            ssh::setup_git_ssh(
                self.cluster.as_ref(),
                &request.waybill,
                workspace.home(),
                self.default_git_ssh_key_path.as_deref(),
            ),
        )
        .await
        .map_err(|e| Error::secret(format!("failed setting up repository clone: {}", e)))?;
        environment.push(git_ssh);
        // HOME points inside the workspace so SSH cannot pick up ambient keys
        environment.push((
            "HOME".to_string(),
            workspace.home().to_string_lossy().into_owned(),
        ));
        // The keyring must be in place before the clone so the checkout
        // filter can decrypt, and STRONGBOX_HOME must reach the manifest
        // build for remote bases.
        with_deadline(
            deadline,
            self.strongbox
                .setup_keyring(self.cluster.as_ref(), &request.waybill, workspace.home()),
        )
        .await
        .map_err(|e| Error::secret(format!("failed setting up repository clone: {}", e)))?;
        environment.push((
            "STRONGBOX_HOME".to_string(),
            workspace.home().to_string_lossy().into_owned(),
        ));

        let commit = with_deadline(
            deadline,
            self.repository.clone_local(
                &environment,
                workspace.repo(),
                request.waybill.repository_path(),
            ),
        )
        .await
        .map_err(|e| Error::git(format!("failed setting up repository clone: {}", e)))?;

        if request.waybill.spec.git_ssh_secret_ref.is_some() {
            ssh::update_repo_base_addresses(workspace.repo())?;
        }

        with_deadline(
            deadline,
            self.strongbox.setup_git_config(&request.waybill, &environment),
        )
        .await?;

        let mut waybill = request.waybill.clone();
        let apply_path = workspace.repo().join(waybill.repository_path());
        self.apply(
            deadline,
            request,
            &mut waybill,
            &apply_path,
            &token,
            environment,
            &cluster_resources,
            &namespaced_resources,
            &commit,
        )
        .await;

        // The run deadline may already have expired if the apply timed out;
        // the outcome still has to be persisted.
        let status_deadline = deadline.max(Instant::now() + STATUS_WRITE_TIMEOUT);
        if let Err(e) = self.update_waybill_status(status_deadline, &waybill).await {
            warn!(waybill = %waybill_id, error = %e, "could not update waybill status");
            self.cluster
                .emit_waybill_event(
                    &waybill,
                    EventType::Warning,
                    "WaybillUpdateStatusFailed",
                    &e.to_string(),
                )
                .await;
        }

        if let Some(last_run) = waybill.status.as_ref().and_then(|s| s.last_run.as_ref()) {
            if last_run.success {
                debug!(
                    waybill = %waybill_id,
                    command = %last_run.command,
                    "apply run output:\n{}",
                    last_run.output
                );
            } else {
                warn!(
                    waybill = %waybill_id,
                    "apply run encountered errors:\n{}",
                    last_run.error_message
                );
            }
        }

        metrics::get().update_from_last_run(&waybill);

        info!(waybill = %waybill_id, "finished apply run");
        Ok(())
    }

    /// Invoke the apply pipeline and record the outcome on the in-memory
    /// Waybill snapshot
    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        deadline: Instant,
        request: &Request,
        waybill: &mut Waybill,
        apply_path: &std::path::Path,
        token: &str,
        environment: Vec<(String, String)>,
        cluster_resources: &[String],
        namespaced_resources: &[String],
        commit: &str,
    ) {
        let started = self.clock.now();
        let dry_run_strategy = if self.dry_run || waybill.spec.dry_run {
            DryRunStrategy::Server
        } else {
            DryRunStrategy::None
        };
        let options = ApplyOptions {
            namespace: waybill.namespace().to_string(),
            dry_run_strategy,
            environment,
            prune_whitelist: prune_whitelist(
                waybill,
                cluster_resources,
                namespaced_resources,
                &self.prune_blacklist,
            ),
            server_side: waybill.spec.server_side_apply,
            token: token.to_string(),
        };

        let outcome = match tokio::time::timeout_at(
            deadline,
            self.invoker.apply(apply_path, &options),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ApplyOutcome {
                command: String::new(),
                output: String::new(),
                error_message: Some(format!(
                    "apply run exceeded the configured runTimeout of {}s",
                    waybill.spec.run_timeout
                )),
            },
        };
        let finished = self.clock.now();

        waybill.status = Some(WaybillStatus {
            last_run: Some(WaybillStatusRun {
                command: outcome.command,
                commit: commit.to_string(),
                error_message: outcome.error_message.clone().unwrap_or_default(),
                finished: Some(Time(finished)),
                output: outcome.output,
                started: Some(Time(started)),
                success: outcome.error_message.is_none(),
                type_: request.type_.to_string(),
            }),
        });
    }

    /// Fetch the latest version of the Waybill and overwrite its status.
    /// This tolerates spec edits made while the run was in flight.
    async fn update_waybill_status(&self, deadline: Instant, waybill: &Waybill) -> Result<(), Error> {
        let mut latest = with_deadline(
            deadline,
            self.cluster.get_waybill(waybill.namespace(), waybill.name()),
        )
        .await?;
        latest.status = waybill.status.clone();
        with_deadline(deadline, self.cluster.update_waybill_status(&latest)).await
    }

    /// Capture a request failure that occurred before the apply was
    /// attempted: emit a Warning event and record an empty, failed lastRun
    pub(crate) async fn capture_request_failure(&self, request: &Request, err: Error) {
        let waybill_id = request.waybill.id();
        error!(waybill = %waybill_id, error = %err, "run request failed");
        self.cluster
            .emit_waybill_event(
                &request.waybill,
                EventType::Warning,
                "WaybillRunRequestFailed",
                &err.to_string(),
            )
            .await;

        let deadline = Instant::now() + STATUS_WRITE_TIMEOUT;
        let mut latest = match with_deadline(
            deadline,
            self.cluster
                .get_waybill(request.waybill.namespace(), request.waybill.name()),
        )
        .await
        {
            Ok(wb) => wb,
            Err(e) => {
                error!(waybill = %waybill_id, error = %e, "cannot get waybill to capture request error");
                return;
            }
        };
        let now = self.clock.now();
        latest.status = Some(WaybillStatus {
            last_run: Some(WaybillStatusRun {
                command: String::new(),
                commit: String::new(),
                error_message: err.to_string(),
                finished: Some(Time(now)),
                output: String::new(),
                started: Some(Time(now)),
                success: false,
                type_: request.type_.to_string(),
            }),
        });
        if let Err(e) = with_deadline(deadline, self.cluster.update_waybill_status(&latest)).await {
            error!(waybill = %waybill_id, error = %e, "failed to update waybill with request failure");
        }
    }

    async fn get_delegate_token(&self, waybill: &Waybill) -> Result<String, Error> {
        let secret = self
            .cluster
            .get_secret(
                waybill.namespace(),
                &waybill.spec.delegate_service_account_secret_ref,
            )
            .await?;
        let secret_id = format!(
            "{}/{}",
            secret.metadata.namespace.as_deref().unwrap_or_default(),
            secret.metadata.name.as_deref().unwrap_or_default()
        );
        if secret.type_.as_deref() != Some(SERVICE_ACCOUNT_TOKEN_TYPE) {
            return Err(Error::secret(format!(
                r#"secret "{}" is not of type {}"#,
                secret_id, SERVICE_ACCOUNT_TOKEN_TYPE
            )));
        }
        let token = secret
            .data
            .as_ref()
            .and_then(|d| d.get("token"))
            .ok_or_else(|| {
                Error::secret(format!(
                    r#"secret "{}" does not contain key 'token'"#,
                    secret_id
                ))
            })?;
        String::from_utf8(token.0.clone())
            .map_err(|_| Error::secret(format!(r#"secret "{}" token is not valid UTF-8"#, secret_id)))
    }
}

async fn apply_worker(runner: Arc<Runner>, queue: Arc<Mutex<mpsc::Receiver<Request>>>) {
    loop {
        // The lock is held only while waiting for the next request; requests
        // themselves are processed concurrently across workers.
        let request = { queue.lock().await.recv().await };
        let Some(request) = request else {
            break;
        };
        if let Err(e) = runner.process_request(&request).await {
            runner.capture_request_failure(&request, e).await;
        }
    }
}

/// Run a fallible step under the request deadline
async fn with_deadline<T>(
    deadline: Instant,
    fut: impl std::future::Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::apply("run timed out")),
    }
}

/// Assemble the prune allow-list for a run: namespaced kinds, optionally
/// cluster-scoped kinds, minus the merged blacklists
fn prune_whitelist(
    waybill: &Waybill,
    cluster_resources: &[String],
    namespaced_resources: &[String],
    process_blacklist: &[String],
) -> Vec<String> {
    let mut whitelist = Vec::new();
    if waybill.prune() {
        whitelist.extend_from_slice(namespaced_resources);
        if waybill.spec.prune_cluster_resources {
            whitelist.extend_from_slice(cluster_resources);
        }
        let blacklist: HashSet<&String> = process_blacklist
            .iter()
            .chain(waybill.spec.prune_blacklist.iter())
            .collect();
        whitelist.retain(|w| !blacklist.contains(w));
    }
    whitelist
}

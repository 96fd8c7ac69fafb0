//! The scheduler: keeps the live set of Waybills, runs one timer per tenant
//! and polls the git working tree for changes, enqueueing typed run
//! requests for the runner.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{enqueue, Request, RunType};
use crate::client::ClusterClient;
use crate::crd::Waybill;
use crate::git::Repository;
use crate::metrics;
use crate::sysutil::Clock;

/// Grace period used by the in-flight guard when a Waybill carries no
/// usable runTimeout
const IN_FLIGHT_MIN_WINDOW_SECS: i64 = 60;

struct TenantTimer {
    handle: JoinHandle<()>,
    run_interval: i64,
    repository_path: String,
    initial_run_queued: bool,
}

impl Drop for TenantTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Default)]
struct SchedulerState {
    waybills: HashMap<String, Waybill>,
    timers: HashMap<String, TenantTimer>,
    git_last_queued_hash: String,
}

struct SchedulerInner {
    clock: Arc<dyn Clock>,
    cluster: Arc<dyn ClusterClient>,
    repository: Arc<dyn Repository>,
    queue: mpsc::Sender<Request>,
    fallback_run_interval: Duration,
    state: Mutex<SchedulerState>,
}

/// Periodically syncs Waybills from the cluster, arms one timer per tenant
/// and enqueues polling runs when the git working tree changes
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    waybill_poll_interval: Duration,
    git_poll_interval: Duration,
    tickers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler feeding the given run queue
    pub fn new(
        clock: Arc<dyn Clock>,
        cluster: Arc<dyn ClusterClient>,
        repository: Arc<dyn Repository>,
        queue: mpsc::Sender<Request>,
        waybill_poll_interval: Duration,
        git_poll_interval: Duration,
        fallback_run_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                clock,
                cluster,
                repository,
                queue,
                fallback_run_interval,
                state: Mutex::new(SchedulerState::default()),
            }),
            waybill_poll_interval,
            git_poll_interval,
            tickers: Vec::new(),
        }
    }

    /// Start the Waybill sync and git poll tickers
    pub fn start(&mut self) {
        if !self.tickers.is_empty() {
            warn!("scheduler is already started, will not do anything");
            return;
        }
        let inner = self.inner.clone();
        let waybill_poll_interval = self.waybill_poll_interval;
        self.tickers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(waybill_poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.sync_waybills().await;
            }
        }));

        let inner = self.inner.clone();
        let git_poll_interval = self.git_poll_interval;
        self.tickers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(git_poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.poll_git().await;
            }
        }));
    }

    /// Stop the tickers and all per-tenant timers
    pub fn stop(&mut self) {
        for ticker in self.tickers.drain(..) {
            ticker.abort();
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.timers.clear();
        state.waybills.clear();
    }
}

impl SchedulerInner {
    /// List Waybills, refresh spec metrics and reconcile the timer map.
    /// Listing failures keep the previous tenant map until the next sync.
    async fn sync_waybills(self: &Arc<Self>) {
        let waybills = match self.cluster.list_waybills().await {
            Ok(waybills) => waybills,
            Err(e) => {
                warn!(error = %e, "could not list waybills");
                return;
            }
        };

        let mut initial_runs = Vec::new();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let mut seen = HashSet::new();
            for waybill in waybills {
                metrics::get().update_waybill_spec(&waybill);
                let namespace = waybill.namespace().to_string();
                let unchanged = state.timers.get(&namespace).is_some_and(|timer| {
                    timer.run_interval == waybill.spec.run_interval
                        && timer.repository_path == waybill.spec.repository_path
                });
                if !unchanged {
                    match state.timers.remove(&namespace) {
                        Some(previous) => {
                            // Material spec change: rearm with the new
                            // interval. The initial-run marker survives.
                            let mut timer = self.arm_timer(&waybill);
                            timer.initial_run_queued = previous.initial_run_queued;
                            state.timers.insert(namespace.clone(), timer);
                        }
                        None => {
                            let mut timer = self.arm_timer(&waybill);
                            let has_run = waybill
                                .status
                                .as_ref()
                                .and_then(|s| s.last_run.as_ref())
                                .is_some();
                            if !has_run {
                                timer.initial_run_queued = true;
                                initial_runs.push(waybill.clone());
                            }
                            state.timers.insert(namespace.clone(), timer);
                        }
                    }
                }
                seen.insert(namespace.clone());
                state.waybills.insert(namespace, waybill);
            }
            state.waybills.retain(|namespace, _| seen.contains(namespace));
            state.timers.retain(|namespace, _| seen.contains(namespace));
        }

        // A tenant that has never run is applied immediately rather than
        // waiting out its full interval.
        for waybill in initial_runs {
            enqueue(&self.queue, RunType::ScheduledRun, &waybill).await;
        }
    }

    fn arm_timer(self: &Arc<Self>, waybill: &Waybill) -> TenantTimer {
        let namespace = waybill.namespace().to_string();
        let interval = self.effective_run_interval(waybill);
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; the
            // initial run is handled by the sync instead.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = {
                    let state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.waybills.get(&namespace).cloned()
                };
                if let Some(waybill) = snapshot {
                    enqueue(&inner.queue, RunType::ScheduledRun, &waybill).await;
                }
            }
        });
        TenantTimer {
            handle,
            run_interval: waybill.spec.run_interval,
            repository_path: waybill.spec.repository_path.clone(),
            initial_run_queued: false,
        }
    }

    fn effective_run_interval(&self, waybill: &Waybill) -> Duration {
        if waybill.spec.run_interval > 0 {
            Duration::from_secs(waybill.spec.run_interval as u64)
        } else {
            self.fallback_run_interval
        }
    }

    /// Check the head of the working tree and enqueue polling runs for
    /// tenants whose subtree changed since their last applied commit. The
    /// last-queued hash only advances when every tenant was examined.
    async fn poll_git(self: &Arc<Self>) {
        let head = match self.repository.hash_for_path("").await {
            Ok(head) => head,
            Err(e) => {
                warn!(error = %e, "could not determine the repository head");
                return;
            }
        };
        let (last_queued, waybills) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (
                state.git_last_queued_hash.clone(),
                state.waybills.values().cloned().collect::<Vec<_>>(),
            )
        };
        // Before the first Waybill sync lands there is nothing to compare
        // the head against; leave the last-queued hash untouched.
        if waybills.is_empty() || head == last_queued {
            return;
        }

        let now = self.clock.now();
        let mut complete = true;
        for waybill in waybills {
            if run_in_flight(&waybill, now) {
                debug!(waybill = %waybill.id(), "skipping polling run, a run is in flight");
                continue;
            }
            match self.repository.hash_for_path(waybill.repository_path()).await {
                Ok(subtree_head) => {
                    let last_commit = waybill
                        .status
                        .as_ref()
                        .and_then(|s| s.last_run.as_ref())
                        .map(|lr| lr.commit.as_str())
                        .unwrap_or_default();
                    if last_commit != subtree_head {
                        enqueue(&self.queue, RunType::PollingRun, &waybill).await;
                    }
                }
                Err(e) => {
                    warn!(waybill = %waybill.id(), error = %e, "could not determine the subtree head");
                    complete = false;
                }
            }
        }
        if complete {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.git_last_queued_hash = head;
        }
    }
}

/// Whether the Waybill's last run appears to still be executing.
///
/// A record whose `finished` predates `started` marks a run in flight; it is
/// trusted only within the run's own timeout, since a run cannot outlive it.
/// Two workers never process the same tenant concurrently because polling
/// runs are withheld while this holds; forced runs are the sole exception.
fn run_in_flight(waybill: &Waybill, now: DateTime<Utc>) -> bool {
    let Some(last_run) = waybill.status.as_ref().and_then(|s| s.last_run.as_ref()) else {
        return false;
    };
    let Some(started) = last_run.started.as_ref() else {
        return false;
    };
    let terminal = last_run
        .finished
        .as_ref()
        .is_some_and(|finished| finished.0 >= started.0);
    if terminal {
        return false;
    }
    let window =
        chrono::Duration::seconds(waybill.spec.run_timeout.max(IN_FLIGHT_MIN_WINDOW_SECS));
    now - started.0 < window
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::crd::{WaybillSpec, WaybillStatus, WaybillStatusRun};
    use crate::git::MockRepository;
    use crate::sysutil::SystemClock;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ObjectMeta;

    fn waybill(namespace: &str, run_interval: i64) -> Waybill {
        Waybill {
            metadata: ObjectMeta {
                name: Some("main".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: WaybillSpec {
                run_interval,
                run_timeout: 300,
                ..Default::default()
            },
            status: None,
        }
    }

    fn with_last_run(mut wb: Waybill, commit: &str, finished_after_started: bool) -> Waybill {
        let started = chrono::Utc::now();
        let finished = if finished_after_started {
            started + chrono::Duration::seconds(1)
        } else {
            started - chrono::Duration::seconds(1)
        };
        wb.status = Some(WaybillStatus {
            last_run: Some(WaybillStatusRun {
                commit: commit.to_string(),
                started: Some(Time(started)),
                finished: Some(Time(finished)),
                success: true,
                ..Default::default()
            }),
        });
        wb
    }

    fn scheduler_with(
        cluster: MockClusterClient,
        repository: MockRepository,
        queue: mpsc::Sender<Request>,
    ) -> Scheduler {
        Scheduler::new(
            Arc::new(SystemClock),
            Arc::new(cluster),
            Arc::new(repository),
            queue,
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(3600),
        )
    }

    mod in_flight_guard {
        use super::*;

        #[test]
        fn no_status_means_no_run_in_flight() {
            let wb = waybill("foo", 5);
            assert!(!run_in_flight(&wb, chrono::Utc::now()));
        }

        #[test]
        fn a_terminal_run_is_not_in_flight() {
            let wb = with_last_run(waybill("foo", 5), "abc", true);
            assert!(!run_in_flight(&wb, chrono::Utc::now()));
        }

        #[test]
        fn a_started_but_unfinished_run_is_in_flight() {
            let wb = with_last_run(waybill("foo", 5), "abc", false);
            assert!(run_in_flight(&wb, chrono::Utc::now()));
        }

        #[test]
        fn stale_in_flight_records_expire_after_the_run_timeout() {
            let wb = with_last_run(waybill("foo", 5), "abc", false);
            let later = chrono::Utc::now() + chrono::Duration::seconds(301);
            assert!(!run_in_flight(&wb, later));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_new_tenant_without_a_last_run_is_applied_immediately() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_list_waybills()
            .returning(|| Ok(vec![waybill("foo", 3600)]));
        let mut repository = MockRepository::new();
        // The repo poller finds nothing so only the initial run is queued
        repository
            .expect_hash_for_path()
            .returning(|_| Err(crate::Error::git("repository not ready")));

        let (tx, mut rx) = mpsc::channel(8);
        let mut scheduler = scheduler_with(cluster, repository, tx);
        scheduler.start();

        let request = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("expected an initial run")
            .unwrap();
        assert_eq!(request.type_, RunType::ScheduledRun);
        assert_eq!(request.waybill.namespace(), "foo");

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn tenants_with_a_last_run_wait_for_their_timer() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_waybills().returning(|| {
            Ok(vec![with_last_run(waybill("foo", 60), "head", true)])
        });
        let mut repository = MockRepository::new();
        repository
            .expect_hash_for_path()
            .returning(|_| Ok("head".to_string()));

        let (tx, mut rx) = mpsc::channel(8);
        let mut scheduler = scheduler_with(cluster, repository, tx);
        scheduler.start();

        // No initial run and no polling run (commit matches the head)
        assert!(tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .is_err());

        // The per-tenant timer fires after runInterval
        let request = tokio::time::timeout(Duration::from_secs(61), rx.recv())
            .await
            .expect("expected a scheduled run")
            .unwrap();
        assert_eq!(request.type_, RunType::ScheduledRun);

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn a_changed_subtree_triggers_a_polling_run() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_waybills().returning(|| {
            Ok(vec![with_last_run(
                waybill("polling", 3600),
                "old-commit",
                true,
            )])
        });
        let mut repository = MockRepository::new();
        repository
            .expect_hash_for_path()
            .returning(|_| Ok("new-commit".to_string()));

        let (tx, mut rx) = mpsc::channel(8);
        let mut scheduler = scheduler_with(cluster, repository, tx);
        scheduler.start();

        let request = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("expected a polling run")
            .unwrap();
        assert_eq!(request.type_, RunType::PollingRun);
        assert_eq!(request.waybill.namespace(), "polling");

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn an_up_to_date_subtree_does_not_trigger_polling_runs() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_waybills().returning(|| {
            Ok(vec![with_last_run(waybill("current", 3600), "head", true)])
        });
        let mut repository = MockRepository::new();
        repository
            .expect_hash_for_path()
            .returning(|_| Ok("head".to_string()));

        let (tx, mut rx) = mpsc::channel(8);
        let mut scheduler = scheduler_with(cluster, repository, tx);
        scheduler.start();

        assert!(tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .is_err());

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn a_material_spec_change_rearms_the_timer() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        // First sync sees a slow tenant, later syncs see a fast one
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_waybills().returning(move || {
            let interval = if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                3600
            } else {
                30
            };
            Ok(vec![with_last_run(waybill("rearm", interval), "head", true)])
        });
        let mut repository = MockRepository::new();
        repository
            .expect_hash_for_path()
            .returning(|_| Ok("head".to_string()));

        let (tx, mut rx) = mpsc::channel(8);
        let mut scheduler = scheduler_with(cluster, repository, tx);
        scheduler.start();

        // Well before the original hour-long interval, the rearmed timer
        // fires at the new cadence.
        let request = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("expected a scheduled run at the new interval")
            .unwrap();
        assert_eq!(request.type_, RunType::ScheduledRun);
        assert_eq!(request.waybill.namespace(), "rearm");

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_tenants_have_their_timer_stopped() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_waybills().returning(move || {
            if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![with_last_run(waybill("gone", 30), "head", true)])
            } else {
                Ok(Vec::new())
            }
        });
        let mut repository = MockRepository::new();
        repository
            .expect_hash_for_path()
            .returning(|_| Ok("head".to_string()));

        let (tx, mut rx) = mpsc::channel(8);
        let mut scheduler = scheduler_with(cluster, repository, tx);
        scheduler.start();

        // The tenant disappears on the second sync (5s), before its 30s
        // timer ever fires.
        assert!(tokio::time::timeout(Duration::from_secs(90), rx.recv())
            .await
            .is_err());

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn listing_failures_keep_the_previous_tenant_map() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_waybills().returning(move || {
            if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![with_last_run(waybill("stable", 60), "head", true)])
            } else {
                Err(crate::Error::apply("the server is currently unable"))
            }
        });
        let mut repository = MockRepository::new();
        repository
            .expect_hash_for_path()
            .returning(|_| Ok("head".to_string()));

        let (tx, mut rx) = mpsc::channel(8);
        let mut scheduler = scheduler_with(cluster, repository, tx);
        scheduler.start();

        // After the first sync succeeds, later failures must not drop the
        // tenant: its timer still fires.
        let request = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("expected a scheduled run")
            .unwrap();
        assert_eq!(request.type_, RunType::ScheduledRun);
        assert_eq!(request.waybill.namespace(), "stable");
        assert!(calls.load(Ordering::SeqCst) > 1);

        scheduler.stop();
    }
}

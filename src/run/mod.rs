//! Scheduling and execution of apply runs.
//!
//! The [`Scheduler`] watches Waybills and the git working tree and enqueues
//! typed run requests; the [`Runner`] worker pool dequeues them, builds a
//! hermetic per-run workspace and drives the apply pipeline.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::crd::Waybill;
use crate::metrics;

mod policy;
mod runner;
mod scheduler;
mod ssh;
mod strongbox;

pub use runner::{Runner, RunnerHandle};
pub use scheduler::Scheduler;
pub use strongbox::{StrongboxProvisioner, Strongboxer};

#[cfg(test)]
pub use strongbox::MockStrongboxProvisioner;

/// Default number of runner workers
pub const DEFAULT_RUNNER_WORKER_COUNT: usize = 2;

/// Capacity of the run request queue
pub const DEFAULT_WORKER_QUEUE_SIZE: usize = 512;

/// How long an enqueue attempt may wait for a queue slot
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// What triggered a run request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunType {
    /// Triggered by the per-tenant timer
    ScheduledRun,
    /// Triggered by a change in the git working tree
    PollingRun,
    /// Requested by an operator; bypasses autoApply
    ForcedRun,
    /// Reserved for re-running failed runs
    FailedRun,
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunType::ScheduledRun => "ScheduledRun",
            RunType::PollingRun => "PollingRun",
            RunType::ForcedRun => "ForcedRun",
            RunType::FailedRun => "FailedRun",
        };
        write!(f, "{}", s)
    }
}

/// An apply run request: the kind of trigger plus a snapshot of the Waybill
/// taken at enqueue time
#[derive(Clone, Debug)]
pub struct Request {
    /// What triggered the request
    pub type_: RunType,
    /// Waybill snapshot
    pub waybill: Waybill,
}

/// Attempt to add a run request to the queue, giving up after five seconds.
///
/// Non-forced requests are dropped silently when the Waybill has autoApply
/// disabled. The call never blocks beyond the enqueue timeout: when the
/// queue stays full the request is dropped and counted in
/// `run_queue_failures`.
pub async fn enqueue(queue: &mpsc::Sender<Request>, type_: RunType, waybill: &Waybill) {
    let id = waybill.id();
    if type_ != RunType::ForcedRun && !waybill.auto_apply() {
        debug!(waybill = %id, %type_, "run ignored, waybill autoApply is disabled");
        return;
    }
    let request = Request {
        type_,
        waybill: waybill.clone(),
    };
    match queue.send_timeout(request, ENQUEUE_TIMEOUT).await {
        Ok(()) => {
            debug!(waybill = %id, %type_, "run queued");
            metrics::get().update_run_request(type_, waybill, 1);
        }
        Err(_) => {
            error!(waybill = %id, %type_, "timed out trying to queue a run, run queue is full");
            metrics::get().add_run_request_queue_failure(type_, waybill);
        }
    }
}

//! Coordinator lifecycle state machine and drain-then-teardown shutdown.
//!
//! The lifecycle has exactly one legal path: `Running -> Draining ->
//! Terminated`. Entry into `Draining` is a compare-and-set, so however
//! many shutdown sentinels arrive, only the first observer drives the
//! drain; everyone else no-ops.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::gateway::{
    BlobGateway, ComputeGateway, InstanceStateFilter, QueueGateway, QueueId, BUNDLE_PREFIX,
    COORDINATOR_ROLE, ROLE_TAG,
};

use super::autoscaler::AutoscalingController;
use super::session::{DemandCounter, ReplyQueueRegistry, SessionMap};

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const TERMINATED: u8 = 2;

/// Coordinator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Accepting submissions and dispatching work.
    Running,
    /// No new submissions; waiting for outstanding batches to finish.
    Draining,
    /// All resources torn down.
    Terminated,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Draining => write!(f, "draining"),
            LifecycleState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Atomic lifecycle cell with one legal forward path.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => LifecycleState::Running,
            DRAINING => LifecycleState::Draining,
            _ => LifecycleState::Terminated,
        }
    }

    /// Attempts the `Running -> Draining` transition.
    ///
    /// Returns `true` for the single winner; all later callers get
    /// `false` and must not drive the drain.
    pub fn begin_drain(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, DRAINING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Attempts the `Draining -> Terminated` transition.
    pub fn mark_terminated(&self) -> bool {
        self.state
            .compare_exchange(DRAINING, TERMINATED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn is_draining(&self) -> bool {
        self.state() == LifecycleState::Draining
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == LifecycleState::Terminated
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the drain-then-teardown sequence once shutdown begins.
pub struct TerminationCoordinator {
    lifecycle: Arc<Lifecycle>,
    demand: Arc<DemandCounter>,
    sessions: Arc<SessionMap>,
    queues: Arc<dyn QueueGateway>,
    blob: Arc<dyn BlobGateway>,
    compute: Arc<dyn ComputeGateway>,
    autoscaler: Arc<AutoscalingController>,
    reply_queues: Arc<ReplyQueueRegistry>,
    control_queues: Vec<QueueId>,
    drain_poll: Duration,
}

impl TerminationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        demand: Arc<DemandCounter>,
        sessions: Arc<SessionMap>,
        queues: Arc<dyn QueueGateway>,
        blob: Arc<dyn BlobGateway>,
        compute: Arc<dyn ComputeGateway>,
        autoscaler: Arc<AutoscalingController>,
        reply_queues: Arc<ReplyQueueRegistry>,
        control_queues: Vec<QueueId>,
        drain_poll: Duration,
    ) -> Self {
        Self {
            lifecycle,
            demand,
            sessions,
            queues,
            blob,
            compute,
            autoscaler,
            reply_queues,
            control_queues,
            drain_poll,
        }
    }

    /// Blocks until every dispatched batch has resolved and every client
    /// has received its report, then tears the farm down.
    ///
    /// Teardown is best-effort: individual gateway failures are logged
    /// and do not abort the remaining cleanup.
    pub async fn drain_and_teardown(&self) {
        info!("draining: waiting for outstanding batches and live sessions");

        loop {
            let demand = self.demand.current();
            let live_sessions = self.sessions.len();
            if demand <= 0 && live_sessions == 0 {
                break;
            }
            debug!(demand, live_sessions, "drain in progress");
            tokio::time::sleep(self.drain_poll).await;
        }

        info!("drained; tearing down farm resources");

        self.autoscaler.stop_all().await;

        for queue in self.reply_queues.drain() {
            if let Err(e) = self.queues.delete_queue(&queue).await {
                warn!(error = %e, queue = %queue, "failed to delete reply queue");
            }
        }

        for queue in &self.control_queues {
            if let Err(e) = self.queues.delete_queue(queue).await {
                warn!(error = %e, queue = %queue, "failed to delete control queue");
            }
        }

        match self.blob.list_by_prefix("").await {
            Ok(keys) => {
                for key in keys {
                    if key.starts_with(BUNDLE_PREFIX) {
                        continue;
                    }
                    if let Err(e) = self.blob.delete(&key).await {
                        warn!(error = %e, key = %key, "failed to delete blob");
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to list blobs for teardown"),
        }

        match self
            .compute
            .list_instances_by_tag(ROLE_TAG, COORDINATOR_ROLE, InstanceStateFilter::Running)
            .await
        {
            Ok(instances) => {
                for instance in instances {
                    if let Err(e) = self.compute.stop_instance(&instance).await {
                        warn!(error = %e, instance = %instance, "failed to stop coordinator instance");
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to list coordinator instances"),
        }

        self.lifecycle.mark_terminated();
        info!("coordinator terminated");
    }
}

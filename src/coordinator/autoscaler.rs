//! Demand-driven worker pool reconciliation.
//!
//! A deliberately greedy control loop: every dispatch or result event
//! triggers a reconciliation that compares current global demand against
//! the live pool and starts or stops instances one at a time. Scale-down
//! removes the most recently started worker first.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::gateway::{ComputeGateway, InstanceId, ROLE_TAG, WORKER_ROLE};
use crate::metrics;

use super::session::DemandCounter;

/// Lifecycle state of a pooled worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Instance is provisioned and serving batches.
    Running,
    /// A stop was attempted and failed; retried on the next pass.
    Stopping,
}

/// A live worker known to the pool.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Compute instance identifier.
    pub id: InstanceId,
    /// Current lifecycle state.
    pub state: WorkerState,
    /// When the instance was started.
    pub started_at: DateTime<Utc>,
}

/// Reconciles the worker pool against global demand.
pub struct AutoscalingController {
    compute: Arc<dyn ComputeGateway>,
    demand: Arc<DemandCounter>,
    pool: Mutex<Vec<WorkerHandle>>,
    max_instances: usize,
    headroom: usize,
    image: String,
    tags: HashMap<String, String>,
}

impl AutoscalingController {
    /// Creates a controller with an empty pool.
    pub fn new(
        compute: Arc<dyn ComputeGateway>,
        demand: Arc<DemandCounter>,
        max_instances: usize,
        headroom: usize,
        image: impl Into<String>,
    ) -> Self {
        let mut tags = HashMap::new();
        tags.insert(ROLE_TAG.to_string(), WORKER_ROLE.to_string());

        Self {
            compute,
            demand,
            pool: Mutex::new(Vec::new()),
            max_instances,
            headroom,
            image: image.into(),
            tags,
        }
    }

    /// Reconciles pool size with current demand.
    ///
    /// Safe to call concurrently from the dispatch and result paths; the
    /// whole read-decide-act sequence runs under one lock. Equal demand
    /// and pool size performs no gateway calls.
    pub async fn reconcile(&self) {
        let mut pool = self.pool.lock().await;
        let demand = self.demand.current().max(0) as usize;
        let current = pool.len();

        if demand > current {
            self.scale_up(&mut pool, demand).await;
        } else if demand < current {
            self.scale_down(&mut pool, demand).await;
        }

        metrics::set_pool_size(pool.len());
    }

    async fn scale_up(&self, pool: &mut Vec<WorkerHandle>, demand: usize) {
        let capacity = self
            .max_instances
            .saturating_sub(self.headroom)
            .saturating_sub(pool.len());
        let to_start = (demand - pool.len()).min(capacity);

        debug!(
            demand,
            current = pool.len(),
            cap = self.max_instances,
            to_start,
            "scaling worker pool up"
        );

        for _ in 0..to_start {
            match self.compute.start_instance(&self.image, &self.tags).await {
                Ok(id) => {
                    info!(instance = %id, pool_size = pool.len() + 1, "started worker");
                    pool.push(WorkerHandle {
                        id,
                        state: WorkerState::Running,
                        started_at: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to start worker instance, skipping");
                }
            }
        }
    }

    async fn scale_down(&self, pool: &mut Vec<WorkerHandle>, demand: usize) {
        let to_stop = pool.len() - demand;

        debug!(
            demand,
            current = pool.len(),
            to_stop,
            "scaling worker pool down"
        );

        for _ in 0..to_stop {
            let Some(handle) = pool.last_mut() else {
                break;
            };
            handle.state = WorkerState::Stopping;
            let id = handle.id.clone();

            match self.compute.stop_instance(&id).await {
                Ok(()) => {
                    pool.pop();
                    info!(instance = %id, pool_size = pool.len(), "stopped worker");
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        instance = %id,
                        "failed to stop worker, retrying on next reconciliation"
                    );
                    break;
                }
            }
        }
    }

    /// Stops every pooled worker. Used during farm teardown; failures are
    /// logged and the handle discarded regardless.
    pub async fn stop_all(&self) {
        let mut pool = self.pool.lock().await;
        for handle in pool.drain(..) {
            if let Err(e) = self.compute.stop_instance(&handle.id).await {
                warn!(error = %e, instance = %handle.id, "failed to stop worker during teardown");
            } else {
                info!(instance = %handle.id, "stopped worker during teardown");
            }
        }
        metrics::set_pool_size(0);
    }

    /// Current pool size.
    pub async fn pool_size(&self) -> usize {
        self.pool.lock().await.len()
    }

    /// Identifiers of pooled workers, in start order.
    pub async fn pooled_instances(&self) -> Vec<InstanceId> {
        self.pool
            .lock()
            .await
            .iter()
            .map(|handle| handle.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryComputeGateway;

    fn controller(
        max_instances: usize,
        headroom: usize,
    ) -> (
        Arc<MemoryComputeGateway>,
        Arc<DemandCounter>,
        AutoscalingController,
    ) {
        let compute = Arc::new(MemoryComputeGateway::new());
        let demand = Arc::new(DemandCounter::new());
        let controller = AutoscalingController::new(
            Arc::clone(&compute) as Arc<dyn ComputeGateway>,
            Arc::clone(&demand),
            max_instances,
            headroom,
            "worker:test",
        );
        (compute, demand, controller)
    }

    #[tokio::test]
    async fn test_scale_up_matches_demand() {
        let (compute, demand, controller) = controller(9, 0);
        for _ in 0..4 {
            demand.increment();
        }

        controller.reconcile().await;

        assert_eq!(controller.pool_size().await, 4);
        assert_eq!(compute.start_calls(), 4);
    }

    #[tokio::test]
    async fn test_demand_spike_hits_cap_exactly() {
        let (compute, demand, controller) = controller(9, 0);
        for _ in 0..9 {
            demand.increment();
        }

        controller.reconcile().await;

        assert_eq!(controller.pool_size().await, 9);
        assert_eq!(compute.start_calls(), 9);
    }

    #[tokio::test]
    async fn test_headroom_reserves_coordinator_slot() {
        let (compute, demand, controller) = controller(9, 1);
        for _ in 0..20 {
            demand.increment();
        }

        controller.reconcile().await;

        assert_eq!(controller.pool_size().await, 8);
        assert_eq!(compute.start_calls(), 8);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_cap() {
        let (_, demand, controller) = controller(5, 1);
        for _ in 0..100 {
            demand.increment();
        }

        controller.reconcile().await;
        controller.reconcile().await;

        assert!(controller.pool_size().await <= 4);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent_at_steady_state() {
        let (compute, demand, controller) = controller(9, 0);
        for _ in 0..3 {
            demand.increment();
        }
        controller.reconcile().await;

        let starts = compute.start_calls();
        let stops = compute.stop_calls();

        controller.reconcile().await;
        controller.reconcile().await;

        assert_eq!(compute.start_calls(), starts);
        assert_eq!(compute.stop_calls(), stops);
    }

    #[tokio::test]
    async fn test_scale_down_removes_most_recent_first() {
        let (compute, demand, controller) = controller(9, 0);
        for _ in 0..3 {
            demand.increment();
        }
        controller.reconcile().await;
        let started = controller.pooled_instances().await;

        demand.decrement();
        demand.decrement();
        controller.reconcile().await;

        assert_eq!(controller.pool_size().await, 1);
        assert_eq!(
            controller.pooled_instances().await,
            vec![started[0].clone()]
        );
        assert_eq!(
            compute.stopped_order(),
            vec![started[2].clone(), started[1].clone()]
        );
    }

    #[tokio::test]
    async fn test_start_failure_is_skipped() {
        let (compute, demand, controller) = controller(9, 0);
        for _ in 0..3 {
            demand.increment();
        }
        compute.fail_next_starts(1);

        controller.reconcile().await;

        // Three attempts, one failed: pool grows by the two successes.
        assert_eq!(compute.start_calls(), 3);
        assert_eq!(controller.pool_size().await, 2);
    }

    #[tokio::test]
    async fn test_stop_failure_retried_next_pass() {
        let (compute, demand, controller) = controller(9, 0);
        for _ in 0..2 {
            demand.increment();
        }
        controller.reconcile().await;

        demand.decrement();
        demand.decrement();
        compute.fail_next_stops(1);
        controller.reconcile().await;

        // First stop failed, pass ended; both workers still pooled.
        assert_eq!(controller.pool_size().await, 2);

        controller.reconcile().await;
        assert_eq!(controller.pool_size().await, 0);
    }

    #[tokio::test]
    async fn test_stop_all_clears_pool() {
        let (compute, demand, controller) = controller(9, 0);
        for _ in 0..3 {
            demand.increment();
        }
        controller.reconcile().await;

        controller.stop_all().await;

        assert_eq!(controller.pool_size().await, 0);
        assert_eq!(compute.running_count(), 0);
    }
}

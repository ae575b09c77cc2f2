//! Coordinator wiring and the two message consumption loops.
//!
//! Two long-lived polling loops run concurrently: one on the client
//! submission queue, one on the worker result queue. Each received
//! message is handed to a bounded pool of concurrent handlers so that a
//! slow blob read or compute call on one message never blocks intake of
//! the next. The only intentional suspension point in steady state is
//! the bounded queue receive.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{ConfigError, FarmConfig};
use crate::gateway::{
    BlobGateway, ComputeGateway, GatewayError, QueueGateway, QueueId, BUNDLE_PREFIX,
    COMPLETED_PREFIX, DISPATCH_QUEUE, OUTPUT_PREFIX, RESULT_QUEUE, SUBMISSION_PREFIX,
    SUBMISSION_QUEUE,
};

use super::aggregator::ResultAggregator;
use super::autoscaler::AutoscalingController;
use super::dispatcher::TaskDispatcher;
use super::lifecycle::{Lifecycle, TerminationCoordinator};
use super::session::{DemandCounter, ReplyQueueRegistry, SessionMap};

/// Errors that can occur while building or running the coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A gateway failed during startup.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// The orchestration engine: owns all shared state and runs the
/// consumption loops until the farm terminates.
pub struct Coordinator {
    config: FarmConfig,
    queues: Arc<dyn QueueGateway>,
    lifecycle: Arc<Lifecycle>,
    demand: Arc<DemandCounter>,
    sessions: Arc<SessionMap>,
    autoscaler: Arc<AutoscalingController>,
    dispatcher: Arc<TaskDispatcher>,
    aggregator: Arc<ResultAggregator>,
    termination: Arc<TerminationCoordinator>,
    drain_signal: Arc<Notify>,
    submission_queue: QueueId,
    result_queue: QueueId,
}

impl Coordinator {
    /// Builds the engine: validates configuration, ensures the reserved
    /// blob prefixes and control queues exist, and wires the four
    /// components around the shared state.
    pub async fn new(
        config: FarmConfig,
        queues: Arc<dyn QueueGateway>,
        blob: Arc<dyn BlobGateway>,
        compute: Arc<dyn ComputeGateway>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        for prefix in [
            SUBMISSION_PREFIX,
            COMPLETED_PREFIX,
            OUTPUT_PREFIX,
            BUNDLE_PREFIX,
        ] {
            blob.ensure_prefix(prefix).await?;
        }

        let submission_queue = queues.create_queue(SUBMISSION_QUEUE).await?;
        let result_queue = queues.create_queue(RESULT_QUEUE).await?;
        let dispatch_queue = queues.create_queue(DISPATCH_QUEUE).await?;

        let lifecycle = Arc::new(Lifecycle::new());
        let demand = Arc::new(DemandCounter::new());
        let sessions = Arc::new(SessionMap::new());
        let reply_queues = Arc::new(ReplyQueueRegistry::new());
        let drain_signal = Arc::new(Notify::new());

        let autoscaler = Arc::new(AutoscalingController::new(
            Arc::clone(&compute),
            Arc::clone(&demand),
            config.max_instances,
            config.coordinator_headroom,
            config.worker_image.clone(),
        ));

        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&queues),
            Arc::clone(&blob),
            Arc::clone(&sessions),
            Arc::clone(&demand),
            Arc::clone(&lifecycle),
            Arc::clone(&autoscaler),
            Arc::clone(&drain_signal),
            submission_queue.clone(),
            dispatch_queue.clone(),
            config.tasks_per_worker,
        ));

        let aggregator = Arc::new(ResultAggregator::new(
            Arc::clone(&queues),
            Arc::clone(&blob),
            Arc::clone(&sessions),
            Arc::clone(&demand),
            Arc::clone(&autoscaler),
            Arc::clone(&reply_queues),
            result_queue.clone(),
        ));

        let termination = Arc::new(TerminationCoordinator::new(
            Arc::clone(&lifecycle),
            Arc::clone(&demand),
            Arc::clone(&sessions),
            Arc::clone(&queues),
            Arc::clone(&blob),
            Arc::clone(&compute),
            Arc::clone(&autoscaler),
            Arc::clone(&reply_queues),
            vec![
                submission_queue.clone(),
                result_queue.clone(),
                dispatch_queue,
            ],
            config.drain_poll_interval,
        ));

        Ok(Self {
            config,
            queues,
            lifecycle,
            demand,
            sessions,
            autoscaler,
            dispatcher,
            aggregator,
            termination,
            drain_signal,
            submission_queue,
            result_queue,
        })
    }

    /// Runs the engine until the farm is terminated.
    ///
    /// Without a shutdown sentinel this never returns: the loops keep
    /// polling and the termination task keeps waiting.
    pub async fn run(&self) -> Result<(), CoordinatorError> {
        info!(
            tasks_per_worker = self.config.tasks_per_worker,
            max_instances = self.config.max_instances,
            handler_concurrency = self.config.handler_concurrency,
            "coordinator running"
        );

        let submission = self.spawn_submission_loop();
        let result = self.spawn_result_loop();
        let termination = self.spawn_termination_task();

        if let Err(e) = submission.await {
            error!(error = %e, "submission loop task failed");
        }
        if let Err(e) = result.await {
            error!(error = %e, "result loop task failed");
        }
        if let Err(e) = termination.await {
            error!(error = %e, "termination task failed");
        }

        info!("coordinator shut down");
        Ok(())
    }

    /// Polls the client submission queue while the farm is running.
    fn spawn_submission_loop(&self) -> JoinHandle<()> {
        let queues = Arc::clone(&self.queues);
        let dispatcher = Arc::clone(&self.dispatcher);
        let lifecycle = Arc::clone(&self.lifecycle);
        let queue = self.submission_queue.clone();
        let poll_wait = self.config.poll_wait;
        let concurrency = self.config.handler_concurrency;

        tokio::spawn(async move {
            let handlers = Arc::new(Semaphore::new(concurrency));
            info!("submission loop started");

            while lifecycle.is_running() {
                match queues.receive(&queue, poll_wait).await {
                    Ok(Some(message)) => {
                        let Ok(permit) = Arc::clone(&handlers).acquire_owned().await else {
                            break;
                        };
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = dispatcher.handle_submission(message).await {
                                error!(error = %e, "submission handler failed");
                            }
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "failed to receive from submission queue");
                        tokio::time::sleep(poll_wait).await;
                    }
                }
            }

            info!("submission loop stopped");
        })
    }

    /// Polls the worker result queue while batches are outstanding, or
    /// while new demand can still appear.
    fn spawn_result_loop(&self) -> JoinHandle<()> {
        let queues = Arc::clone(&self.queues);
        let aggregator = Arc::clone(&self.aggregator);
        let lifecycle = Arc::clone(&self.lifecycle);
        let demand = Arc::clone(&self.demand);
        let queue = self.result_queue.clone();
        let poll_wait = self.config.poll_wait;
        let concurrency = self.config.handler_concurrency;

        tokio::spawn(async move {
            let handlers = Arc::new(Semaphore::new(concurrency));
            info!("result loop started");

            loop {
                // Keep polling while work is outstanding, or while nothing
                // is outstanding but shutdown has not begun.
                let current = demand.current();
                if !(current > 0 || (current == 0 && lifecycle.is_running())) {
                    break;
                }

                match queues.receive(&queue, poll_wait).await {
                    Ok(Some(message)) => {
                        let Ok(permit) = Arc::clone(&handlers).acquire_owned().await else {
                            break;
                        };
                        let aggregator = Arc::clone(&aggregator);
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = aggregator.handle_result(message).await {
                                error!(error = %e, "result handler failed");
                            }
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "failed to receive from result queue");
                        tokio::time::sleep(poll_wait).await;
                    }
                }
            }

            info!("result loop stopped");
        })
    }

    /// Waits for the drain signal, then drives drain and teardown.
    fn spawn_termination_task(&self) -> JoinHandle<()> {
        let termination = Arc::clone(&self.termination);
        let signal = Arc::clone(&self.drain_signal);

        tokio::spawn(async move {
            signal.notified().await;
            termination.drain_and_teardown().await;
        })
    }

    /// Lifecycle cell, for observation.
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Global demand counter, for observation.
    pub fn demand(&self) -> Arc<DemandCounter> {
        Arc::clone(&self.demand)
    }

    /// Live session map, for observation.
    pub fn sessions(&self) -> Arc<SessionMap> {
        Arc::clone(&self.sessions)
    }

    /// Pool controller, for observation.
    pub fn autoscaler(&self) -> Arc<AutoscalingController> {
        Arc::clone(&self.autoscaler)
    }
}

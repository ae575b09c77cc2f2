//! End-to-end farm tests against the in-memory gateways.
//!
//! A real coordinator and worker runtime run as tasks in-process; only
//! the gateways are synthetic. Task URLs are intentionally unfetchable,
//! so every task resolves to an error outcome line, which exercises the
//! full accounting, completion and shutdown paths without any network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use docfarm::config::FarmConfig;
use docfarm::coordinator::{Coordinator, LifecycleState};
use docfarm::gateway::{
    completed_key, reply_queue_name, submission_key, BlobGateway, ComputeGateway,
    MemoryBlobGateway, MemoryComputeGateway, MemoryQueueGateway, QueueGateway, QueueId,
    BUNDLE_PREFIX, CLIENT_ID_ATTR, DISPATCH_QUEUE, RESULT_QUEUE, SHUTDOWN_SENTINEL,
    SUBMISSION_QUEUE,
};
use docfarm::worker::WorkerRuntime;

struct Farm {
    queues: Arc<MemoryQueueGateway>,
    blob: Arc<MemoryBlobGateway>,
    compute: Arc<MemoryComputeGateway>,
    coordinator: Arc<Coordinator>,
    config: FarmConfig,
    run_handle: JoinHandle<()>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl Farm {
    async fn start(with_worker: bool) -> Self {
        Self::start_with(test_config(), with_worker).await
    }

    async fn start_with(config: FarmConfig, with_worker: bool) -> Self {
        let queues = Arc::new(MemoryQueueGateway::new());
        let blob = Arc::new(MemoryBlobGateway::new());
        let compute = Arc::new(MemoryComputeGateway::new());

        let coordinator = Arc::new(
            Coordinator::new(
                config.clone(),
                Arc::clone(&queues) as Arc<dyn QueueGateway>,
                Arc::clone(&blob) as Arc<dyn BlobGateway>,
                Arc::clone(&compute) as Arc<dyn ComputeGateway>,
            )
            .await
            .expect("coordinator builds"),
        );

        let run_handle = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator.run().await.expect("coordinator runs");
            })
        };

        let mut farm = Self {
            queues,
            blob,
            compute,
            coordinator,
            config,
            run_handle,
            worker_handles: Vec::new(),
        };
        if with_worker {
            farm.spawn_worker().await;
        }
        farm
    }

    async fn spawn_worker(&mut self) {
        let runtime = WorkerRuntime::new(
            Arc::clone(&self.queues) as Arc<dyn QueueGateway>,
            Arc::clone(&self.blob) as Arc<dyn BlobGateway>,
            &self.config,
        )
        .await
        .expect("worker runtime builds");

        self.worker_handles.push(tokio::spawn(async move {
            let _ = runtime.run().await;
        }));
    }

    async fn submit(&self, client_id: &str, lines: &[String]) {
        let key = submission_key(client_id);
        self.blob
            .put(&key, &lines.join("\n"))
            .await
            .expect("task list stored");

        let submissions = self
            .queues
            .create_queue(SUBMISSION_QUEUE)
            .await
            .expect("submission queue");
        let mut attributes = HashMap::new();
        attributes.insert(CLIENT_ID_ATTR.to_string(), client_id.to_string());
        self.queues
            .send(&submissions, &key, attributes)
            .await
            .expect("submission sent");
    }

    async fn send_sentinel(&self) {
        let submissions = self
            .queues
            .create_queue(SUBMISSION_QUEUE)
            .await
            .expect("submission queue");
        self.queues
            .send(&submissions, SHUTDOWN_SENTINEL, HashMap::new())
            .await
            .expect("sentinel sent");
    }

    async fn shutdown(self) {
        for handle in &self.worker_handles {
            handle.abort();
        }
        self.run_handle.abort();
    }
}

fn test_config() -> FarmConfig {
    FarmConfig::default()
        .with_tasks_per_worker(3)
        .with_handler_concurrency(4)
        .with_poll_wait(Duration::from_millis(20))
        .with_drain_poll_interval(Duration::from_millis(20))
        .with_max_instances(9)
        .with_coordinator_headroom(1)
}

fn task_lines(tag: &str, n: usize) -> Vec<String> {
    // Unsupported scheme: the worker's fetch fails immediately without
    // touching the network, so every task yields an error outcome line.
    (0..n)
        .map(|i| format!("TOTEXT ftp://docs.example/{tag}-{i}.pdf"))
        .collect()
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_seven_tasks_full_cycle_and_teardown() {
    let farm = Farm::start(true).await;
    let blob = Arc::clone(&farm.blob);
    let lifecycle = farm.coordinator.lifecycle();
    let demand = farm.coordinator.demand();
    let sessions = farm.coordinator.sessions();

    // Control queues exist before any traffic.
    let queue_names = farm.queues.queue_names();
    for name in [SUBMISSION_QUEUE, RESULT_QUEUE, DISPATCH_QUEUE] {
        assert!(queue_names.contains(&name.to_string()));
    }

    // A code bundle that must survive teardown.
    farm.blob
        .put(&format!("{BUNDLE_PREFIX}worker.bin"), "bundle")
        .await
        .expect("bundle stored");

    farm.submit("client-7", &task_lines("doc", 7)).await;

    let report_key = completed_key("client-7");
    wait_until("client report", || {
        blob.keys().contains(&report_key)
    })
    .await;

    // All 7 outcomes in one report, none lost to batching.
    let report = farm.blob.get(&report_key).await.expect("report readable");
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(lines.len(), 7);
    for i in 0..7 {
        assert!(
            report.contains(&format!("doc-{i}.pdf")),
            "outcome for doc-{i} missing from report"
        );
    }

    // Demand resolved, accounting clean.
    wait_until("demand settles", || demand.current() == 0).await;
    assert!(sessions.is_empty());

    // Completion notice carries the report key.
    let reply = farm
        .queues
        .receive(
            &QueueId(reply_queue_name("client-7")),
            Duration::from_millis(200),
        )
        .await
        .expect("receive")
        .expect("completion notice present");
    assert_eq!(reply.body, report_key);

    // Cooperative shutdown: drain, then teardown.
    farm.send_sentinel().await;
    wait_until("termination", || lifecycle.is_terminated()).await;
    assert_eq!(lifecycle.state(), LifecycleState::Terminated);

    for handle in &farm.worker_handles {
        handle.abort();
    }

    // Queues gone, workers deprovisioned, only the bundle prefix kept.
    assert!(farm.queues.queue_names().is_empty());
    assert_eq!(farm.compute.running_count(), 0);
    let survivors = farm.blob.keys();
    assert!(!survivors.is_empty());
    assert!(survivors.iter().all(|key| key.starts_with(BUNDLE_PREFIX)));

    farm.shutdown().await;
}

#[tokio::test]
async fn test_two_clients_get_isolated_reports() {
    let farm = Farm::start(true).await;
    let blob = Arc::clone(&farm.blob);
    let demand = farm.coordinator.demand();
    let sessions = farm.coordinator.sessions();

    farm.submit("alpha", &task_lines("alpha", 4)).await;
    farm.submit("beta", &task_lines("beta", 5)).await;

    let alpha_key = completed_key("alpha");
    let beta_key = completed_key("beta");
    wait_until("both reports", || {
        let keys = blob.keys();
        keys.contains(&alpha_key) && keys.contains(&beta_key)
    })
    .await;

    let alpha = farm.blob.get(&alpha_key).await.expect("alpha report");
    let beta = farm.blob.get(&beta_key).await.expect("beta report");

    assert_eq!(alpha.lines().count(), 4);
    assert_eq!(beta.lines().count(), 5);
    for i in 0..4 {
        assert!(alpha.contains(&format!("alpha-{i}.pdf")));
    }
    for i in 0..5 {
        assert!(beta.contains(&format!("beta-{i}.pdf")));
    }
    assert!(!alpha.contains("beta-"));
    assert!(!beta.contains("alpha-"));

    wait_until("demand settles", || demand.current() == 0).await;
    assert!(sessions.is_empty());

    farm.shutdown().await;
}

#[tokio::test]
async fn test_malformed_lines_reported_not_dropped() {
    let farm = Farm::start(true).await;
    let blob = Arc::clone(&farm.blob);

    let lines = vec![
        "TOTEXT ftp://docs.example/good.pdf".to_string(),
        "this is not a task".to_string(),
        "TODIGEST ftp://docs.example/other.pdf".to_string(),
    ];
    farm.submit("mixed", &lines).await;

    let report_key = completed_key("mixed");
    wait_until("mixed report", || blob.keys().contains(&report_key)).await;

    let report = farm.blob.get(&report_key).await.expect("report");
    assert_eq!(report.lines().count(), 3);
    assert!(report.contains("invalid task line 'this is not a task'"));
    assert!(report.contains("good.pdf"));
    assert!(report.contains("other.pdf"));

    farm.shutdown().await;
}

#[tokio::test]
async fn test_drain_waits_for_outstanding_batches() {
    let mut farm = Farm::start(false).await;
    let lifecycle = farm.coordinator.lifecycle();
    let demand = farm.coordinator.demand();

    // Two batches dispatched, no worker to resolve them.
    farm.submit("patient", &task_lines("pending", 6)).await;
    wait_until("demand reaches 2", || demand.current() == 2).await;
    let compute = Arc::clone(&farm.compute);
    wait_until("workers provisioned", || compute.running_count() > 0).await;

    farm.send_sentinel().await;
    wait_until("drain begins", || lifecycle.is_draining()).await;

    // Outstanding work keeps the farm in draining, resources intact.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(lifecycle.state(), LifecycleState::Draining);
    assert!(farm.compute.running_count() > 0);

    // A submission arriving after drain began is never dispatched.
    farm.submit("latecomer", &task_lines("late", 3)).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(demand.current(), 2);

    // Once a worker resolves the two batches, teardown completes.
    farm.spawn_worker().await;
    wait_until("termination", || lifecycle.is_terminated()).await;

    for handle in &farm.worker_handles {
        handle.abort();
    }
    assert_eq!(farm.compute.running_count(), 0);
    assert_eq!(demand.current(), 0);

    farm.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_sentinel_is_harmless() {
    let farm = Farm::start(true).await;
    let lifecycle = farm.coordinator.lifecycle();

    farm.send_sentinel().await;
    farm.send_sentinel().await;

    wait_until("termination", || lifecycle.is_terminated()).await;
    assert_eq!(lifecycle.state(), LifecycleState::Terminated);

    farm.shutdown().await;
}

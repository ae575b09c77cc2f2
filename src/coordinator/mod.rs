//! The orchestration engine: turns two unordered, at-least-once message
//! streams into correct per-client task accounting, demand-driven
//! autoscaling and a race-free cooperative shutdown.
//!
//! # Architecture
//!
//! ```text
//!   clients ──► client-submissions ──► TaskDispatcher ──► coordinator-dispatch ──► workers
//!                                          │                                         │
//!                                          ▼                                         │
//!                                   ClientSession map ◄── ResultAggregator ◄── worker-results
//!                                          │                      │
//!                                          ▼                      ▼
//!                                    GlobalDemand ──► AutoscalingController ──► compute pool
//!                                          │
//!                                          ▼
//!                                 TerminationCoordinator (drain ──► teardown)
//! ```
//!
//! Two polling loops (submissions, results) each dispatch into a bounded
//! handler pool. Dispatcher and aggregator share the session map and the
//! global demand counter; every mutation triggers a pool reconciliation.
//! A shutdown sentinel flips the lifecycle to draining, after which the
//! termination coordinator waits for all outstanding work and tears the
//! farm down.
//!
//! # Consistency
//!
//! - One async mutex per client session: a client's counter and buffer
//!   mutate atomically relative to each other, different clients in
//!   parallel.
//! - Global demand is a single atomic; it always equals the sum of live
//!   sessions' pending counts.
//! - The pool's read-decide-act sequence runs under one lock, shared by
//!   both calling paths.
//! - The lifecycle cell allows exactly one `Running -> Draining` winner.

pub mod aggregator;
pub mod autoscaler;
pub mod dispatcher;
pub mod engine;
pub mod lifecycle;
pub mod session;

pub use aggregator::{AggregateError, ResultAggregator};
pub use autoscaler::{AutoscalingController, WorkerHandle, WorkerState};
pub use dispatcher::{DispatchError, TaskDispatcher};
pub use engine::{Coordinator, CoordinatorError};
pub use lifecycle::{Lifecycle, LifecycleState, TerminationCoordinator};
pub use session::{ClientSession, DemandCounter, ReplyQueueRegistry, SessionMap};

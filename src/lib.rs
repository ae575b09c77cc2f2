//! docfarm: elastic document-processing task farm.
//!
//! Clients submit task lists, the coordinator fans batches out across a
//! demand-scaled pool of worker instances, and each client gets back one
//! aggregated report. This library provides the coordinator's
//! orchestration engine plus the worker runtime, the submission client
//! and the gateway abstractions they all share.

// Core modules
pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod gateway;
pub mod metrics;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use client::{ClientError, SubmitClient};
pub use config::{ConfigError, FarmConfig};
pub use coordinator::{Coordinator, CoordinatorError, LifecycleState};
pub use gateway::GatewayError;
pub use task::{OperationKind, Task, TaskBatch};
pub use worker::{WorkerError, WorkerRuntime};

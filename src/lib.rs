//! Hypertune - CRD-driven Kubernetes operator for hyperparameter search
//!
//! An `Experiment` declares a search space, an objective and a trial budget.
//! Three controllers cooperate through resource state only:
//!
//! - the Experiment controller admits Trials up to the configured
//!   parallelism and decides when the search is done;
//! - the Trial controller runs each Trial as a training job and collects its
//!   metrics;
//! - the Suggestion controller serves the search algorithm and records the
//!   assignments it proposes.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Experiment, Trial, Suggestion)
//! - [`controller`] - Reconcile loops for the three CRDs
//! - [`runner`] - Controller construction for the binary
//! - [`provider`] - Job providers normalizing training-job status
//! - [`template`] - Trial manifest rendering
//! - [`algorithm`] - gRPC client for algorithm endpoints
//! - [`observation`] - gRPC client for the metric store
//! - [`config`] - Operator configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod algorithm;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod grpc;
pub mod observation;
pub mod proto;
pub mod provider;
pub mod retry;
pub mod runner;
pub mod telemetry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager for server-side apply of status and CRDs
pub const FIELD_MANAGER: &str = "hypertune-controller";

/// Port served by every algorithm Deployment
pub const ALGORITHM_PORT: i32 = 6789;

/// Default address of the observation store
pub const DEFAULT_DB_MANAGER_ADDRESS: &str = "hypertune-db-manager.hypertune:6789";

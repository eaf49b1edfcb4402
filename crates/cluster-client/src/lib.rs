//! Cluster API client for the VM operator
//!
//! Wraps the handful of Kubernetes API operations the operator needs behind
//! a trait so the reconciler, secret manager and pool manager can be tested
//! against an in-memory mock.
//!
//! - **Child objects**: get, create, merge-patch with optimistic concurrency,
//!   delete (ConfigMap, Secret, PVC, Pod, Service)
//! - **VirtualMachine**: status and spec patches, event publishing
//! - **Watches**: list plus watch-from-resourceVersion through [`WatchSource`]

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod cluster_trait;
pub mod watch;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::ClusterClient;
pub use cluster_trait::ClusterClientTrait;
pub use error::ClusterError;
pub use models::*;
pub use watch::{KubeWatchSource, WatchChange, WatchSource, WatchStream};
#[cfg(feature = "test-util")]
pub use mock::{ApiCall, MockClusterClient, MockWatchSource, Verb};

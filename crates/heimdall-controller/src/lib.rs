//! heimdall-controller: reconciliation of PrometheusRules against ingresses
//!
//! [`Controller`] runs the event loop, [`Reconciler`] performs one pass for
//! one ingress, and [`RuleStore`] is the seam to the cluster.

pub mod controller;
pub mod index;
pub mod kube;
pub mod reconcile;
pub mod store;

pub use crate::controller::{
    Controller, ControllerConfig, ControllerHandle, Notification, SyncState,
};
pub use crate::index::OwnershipIndex;
pub use crate::kube::{store_error, watch_ingresses, watch_rules, KubeStore};
pub use crate::reconcile::{PassStats, Plan, Reconciler};
pub use crate::store::{MemoryStore, RuleStore, StoreCall, StoreError};

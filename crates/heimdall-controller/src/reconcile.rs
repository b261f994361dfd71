//! One reconciliation pass: desired rules vs. owned rules, then store calls.
//!
//! A pass never fails as a whole. Each create/update/delete is attempted on
//! its own; failures are logged, counted and left for the next pass.

use crate::index::OwnershipIndex;
use crate::store::{RuleStore, StoreError};
use heimdall_core::{ObjectKey, PrometheusRule};
use heimdall_rules::{DesiredState, RuleRenderer};
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Store calls needed to move one ingress's rules to the desired state.
#[derive(Debug, Default)]
pub struct Plan {
    pub create: Vec<PrometheusRule>,
    pub update: Vec<PrometheusRule>,
    pub delete: Vec<ObjectKey>,
    /// Desired rules already in place.
    pub unchanged: usize,
}

impl Plan {
    /// Diff desired rules against the rules the source currently owns.
    ///
    /// A rule present on both sides is only updated when its content
    /// differs, so planning against converged state yields no calls.
    pub fn compute(
        desired: &DesiredState,
        actual: &BTreeMap<String, Arc<PrometheusRule>>,
    ) -> Self {
        let mut plan = Plan::default();
        for (name, rule) in &desired.rules {
            match actual.get(name) {
                None => plan.create.push(rule.clone()),
                Some(current) if rule.same_content(current) => plan.unchanged += 1,
                Some(_) => plan.update.push(rule.clone()),
            }
        }
        plan.delete = actual
            .keys()
            .filter(|name| !desired.contains(name))
            .map(|name| ObjectKey::new(desired.source.namespace.clone(), name.clone()))
            .collect();
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Outcome of one or more passes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub warnings: usize,
}

impl PassStats {
    /// Store calls that went through.
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    pub fn merge(&mut self, other: PassStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.warnings += other.warnings;
    }
}

impl std::fmt::Display for PassStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created={} updated={} deleted={} unchanged={} failed={} warnings={}",
            self.created, self.updated, self.deleted, self.unchanged, self.failed, self.warnings
        )
    }
}

pub struct Reconciler {
    renderer: Arc<RuleRenderer>,
    store: Arc<dyn RuleStore>,
    index: Arc<OwnershipIndex>,
    store_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        renderer: Arc<RuleRenderer>,
        store: Arc<dyn RuleStore>,
        index: Arc<OwnershipIndex>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            renderer,
            store,
            index,
            store_timeout,
        }
    }

    pub fn index(&self) -> &Arc<OwnershipIndex> {
        &self.index
    }

    /// Add/update path: converge the ingress's rules on its annotations.
    pub async fn reconcile(&self, ingress: &Ingress) -> PassStats {
        let desired = DesiredState::for_source(&self.renderer, ingress);
        for warning in &desired.warnings {
            warn!("[ingress][{}] {}", desired.source.identifier(), warning);
        }
        let mut stats = self.converge(&desired).await;
        stats.warnings = desired.warnings.len();
        stats
    }

    /// Delete path: the ingress is gone, so everything it owned goes too.
    pub async fn cleanup(&self, source: &ObjectKey) -> PassStats {
        self.converge(&DesiredState::empty(source.clone())).await
    }

    async fn converge(&self, desired: &DesiredState) -> PassStats {
        let actual = self.index.owned_by(&desired.source);
        let plan = Plan::compute(desired, &actual);
        let mut stats = PassStats {
            unchanged: plan.unchanged,
            ..Default::default()
        };
        if plan.is_empty() {
            debug!("[ingress][{}] in sync ({} rules)", desired.source.identifier(), plan.unchanged);
            return stats;
        }

        let source = desired.source.identifier();

        for rule in &plan.create {
            let key = ObjectKey::of(rule);
            match self.call(self.store.create(rule)).await {
                Ok(stored) => {
                    info!("[ingress][{}] created rule {}", source, key);
                    self.index.apply(stored);
                    stats.created += 1;
                }
                Err(e) => {
                    warn!("[ingress][{}] error creating rule {}: {}", source, key, e);
                    stats.failed += 1;
                }
            }
        }

        for rule in &plan.update {
            let key = ObjectKey::of(rule);
            match self.call(self.store.replace(rule)).await {
                Ok(stored) => {
                    info!("[ingress][{}] updated rule {}", source, key);
                    self.index.apply(stored);
                    stats.updated += 1;
                }
                Err(e) => {
                    warn!("[ingress][{}] error updating rule {}: {}", source, key, e);
                    stats.failed += 1;
                }
            }
        }

        for key in &plan.delete {
            match self.call(self.store.delete(key)).await {
                Ok(()) => {
                    info!("[ingress][{}] deleted rule {}", source, key);
                    self.index.remove(key);
                    stats.deleted += 1;
                }
                Err(StoreError::NotFound(_)) => {
                    debug!("[ingress][{}] rule {} already gone", source, key);
                    self.index.remove(key);
                    stats.deleted += 1;
                }
                Err(e) => {
                    warn!("[ingress][{}] error deleting rule {}: {}", source, key, e);
                    stats.failed += 1;
                }
            }
        }

        stats
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }
}

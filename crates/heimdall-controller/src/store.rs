//! Rule store abstraction: where create/update/delete calls land.
//!
//! The reconciler only ever talks to a [`RuleStore`]. Kubernetes is one
//! backend ([`crate::kube::KubeStore`]); [`MemoryStore`] keeps everything in
//! process and records every call, for tests and dry runs.

use crate::controller::Notification;
use heimdall_core::{ObjectKey, PrometheusRule};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),

    #[error("{0} not found")]
    NotFound(ObjectKey),

    #[error("conflict on {key}: {message}")]
    Conflict { key: ObjectKey, message: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("api error: {0}")]
    Api(String),
}

/// Backing store for derived rules. Every call is independently atomic.
#[async_trait::async_trait]
pub trait RuleStore: Send + Sync {
    /// Create a rule that does not exist yet. Returns the stored object.
    async fn create(&self, rule: &PrometheusRule) -> Result<PrometheusRule, StoreError>;

    /// Overwrite an existing rule without a resource-version precondition.
    async fn replace(&self, rule: &PrometheusRule) -> Result<PrometheusRule, StoreError>;

    /// Delete a rule by namespace and name.
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Where the rules go, for log lines.
    fn describe(&self) -> String;
}

/// One call made against a [`MemoryStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreCall {
    Create(ObjectKey),
    Replace(ObjectKey),
    Delete(ObjectKey),
}

impl StoreCall {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::Create(k) | Self::Replace(k) | Self::Delete(k) => k,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    rules: BTreeMap<ObjectKey, PrometheusRule>,
    calls: Vec<StoreCall>,
    failures: HashMap<ObjectKey, StoreError>,
    next_version: u64,
}

/// In-process store. Behaves like the API server as far as heimdall can
/// tell: uids and resource versions are assigned, creating an existing rule
/// or touching a missing one fails, and (optionally) every change is echoed
/// back as a watch notification.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    echo: Option<mpsc::UnboundedSender<Notification>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo every successful change to `tx`, like a rule watch would.
    pub fn with_echo(tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            echo: Some(tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put a rule in place without recording a call (test fixtures,
    /// rules somebody else created).
    pub fn seed(&self, rule: PrometheusRule) -> PrometheusRule {
        let mut state = self.lock();
        let stored = stamp(&mut state, rule);
        state.rules.insert(ObjectKey::of(&stored), stored.clone());
        stored
    }

    /// Make the next call touching `key` fail with `err`.
    pub fn fail_next(&self, key: ObjectKey, err: StoreError) {
        self.lock().failures.insert(key, err);
    }

    pub fn get(&self, key: &ObjectKey) -> Option<PrometheusRule> {
        self.lock().rules.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.lock().rules.keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<PrometheusRule> {
        self.lock().rules.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    /// Drain the call log.
    pub fn take_calls(&self) -> Vec<StoreCall> {
        std::mem::take(&mut self.lock().calls)
    }

    fn emit(&self, notification: Notification) {
        if let Some(tx) = &self.echo {
            let _ = tx.send(notification);
        }
    }

    fn begin(&self, call: StoreCall) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let mut state = self.lock();
        let key = call.key().clone();
        state.calls.push(call);
        match state.failures.remove(&key) {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

fn stamp(state: &mut MemoryState, mut rule: PrometheusRule) -> PrometheusRule {
    state.next_version += 1;
    let version = state.next_version;
    if rule.metadata.uid.is_none() {
        rule.metadata.uid = Some(format!("memory-{}", version));
    }
    rule.metadata.resource_version = Some(version.to_string());
    rule
}

#[async_trait::async_trait]
impl RuleStore for MemoryStore {
    async fn create(&self, rule: &PrometheusRule) -> Result<PrometheusRule, StoreError> {
        let key = ObjectKey::of(rule);
        let stored = {
            let mut state = self.begin(StoreCall::Create(key.clone()))?;
            if state.rules.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key));
            }
            let stored = stamp(&mut state, rule.clone());
            state.rules.insert(key, stored.clone());
            stored
        };
        self.emit(Notification::RuleApplied(stored.clone()));
        Ok(stored)
    }

    async fn replace(&self, rule: &PrometheusRule) -> Result<PrometheusRule, StoreError> {
        let key = ObjectKey::of(rule);
        let stored = {
            let mut state = self.begin(StoreCall::Replace(key.clone()))?;
            let Some(existing) = state.rules.get(&key) else {
                return Err(StoreError::NotFound(key));
            };
            let mut next = rule.clone();
            next.metadata.uid = existing.uid();
            let stored = stamp(&mut state, next);
            state.rules.insert(key, stored.clone());
            stored
        };
        self.emit(Notification::RuleApplied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let removed = {
            let mut state = self.begin(StoreCall::Delete(key.clone()))?;
            state
                .rules
                .remove(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?
        };
        self.emit(Notification::RuleDeleted(removed));
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

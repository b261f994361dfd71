//! Ownership index: which ingress owns which rule, as last observed.
//!
//! Built only from rule notifications (and the controller's own successful
//! writes), never from ingress state. Rules without an Ingress controller
//! reference are not heimdall's and never enter the index.

use heimdall_core::{ingress_owner, ObjectKey, PrometheusRule};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

struct Entry {
    owner: ObjectKey,
    rule: Arc<PrometheusRule>,
}

#[derive(Default)]
struct IndexState {
    rules: HashMap<ObjectKey, Entry>,
    by_owner: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
}

impl IndexState {
    fn insert(&mut self, key: ObjectKey, owner: ObjectKey, rule: PrometheusRule) {
        self.unlink(&key);
        self.by_owner
            .entry(owner.clone())
            .or_default()
            .insert(key.clone());
        self.rules.insert(
            key,
            Entry {
                owner,
                rule: Arc::new(rule),
            },
        );
    }

    fn unlink(&mut self, key: &ObjectKey) -> Option<Entry> {
        let entry = self.rules.remove(key)?;
        if let Some(owned) = self.by_owner.get_mut(&entry.owner) {
            owned.remove(key);
            if owned.is_empty() {
                self.by_owner.remove(&entry.owner);
            }
        }
        Some(entry)
    }
}

#[derive(Default)]
pub struct OwnershipIndex {
    state: RwLock<IndexState>,
}

impl OwnershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an added or updated rule. Returns its owner, or `None` if the
    /// rule is not (or no longer) owned by an ingress.
    pub fn apply(&self, rule: PrometheusRule) -> Option<ObjectKey> {
        let key = ObjectKey::of(&rule);
        let mut state = self.write();
        match ingress_owner(&rule) {
            Some(owner) => {
                state.insert(key, owner.clone(), rule);
                Some(owner)
            }
            None => {
                state.unlink(&key);
                None
            }
        }
    }

    /// Forget a deleted rule. Returns the owner it had.
    pub fn remove(&self, key: &ObjectKey) -> Option<ObjectKey> {
        self.write().unlink(key).map(|e| e.owner)
    }

    /// Replace the whole index after a relist.
    pub fn replace_all(&self, rules: impl IntoIterator<Item = PrometheusRule>) {
        let mut fresh = IndexState::default();
        for rule in rules {
            if let Some(owner) = ingress_owner(&rule) {
                fresh.insert(ObjectKey::of(&rule), owner, rule);
            }
        }
        *self.write() = fresh;
    }

    /// Rules owned by `source`, keyed by rule name.
    pub fn owned_by(&self, source: &ObjectKey) -> BTreeMap<String, Arc<PrometheusRule>> {
        let state = self.read();
        state
            .by_owner
            .get(source)
            .into_iter()
            .flatten()
            .filter_map(|key| {
                state
                    .rules
                    .get(key)
                    .map(|e| (key.name.clone(), e.rule.clone()))
            })
            .collect()
    }

    pub fn owner_of(&self, key: &ObjectKey) -> Option<ObjectKey> {
        self.read().rules.get(key).map(|e| e.owner.clone())
    }

    /// Every ingress that owns at least one rule.
    pub fn owners(&self) -> BTreeSet<ObjectKey> {
        self.read().by_owner.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

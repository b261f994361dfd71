//! Reconcile controller: the event loop.
//!
//! Ingress and PrometheusRule notifications arrive on one channel. Ingresses
//! are cached by identity, rules feed the [`OwnershipIndex`], and every
//! change schedules a pass for the affected ingress. Passes run on a
//! `JoinSet`; passes for one ingress are serialized by a per-key mutex while
//! different ingresses run in parallel.
//!
//! A scheduled pass does not carry the object that triggered it. It reads
//! the cache once it holds the key's lock: a live ingress is reconciled, a
//! missing one has its rules cleaned up. Several notifications for the same
//! key that arrive before its pass starts collapse into that one pass.

use crate::index::OwnershipIndex;
use crate::reconcile::{PassStats, Reconciler};
use crate::store::RuleStore;
use dashmap::{DashMap, DashSet};
use heimdall_core::{HeimdallConfig, ObjectKey, PrometheusRule};
use heimdall_rules::RuleRenderer;
use k8s_openapi::api::networking::v1::Ingress;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the watches report.
#[derive(Debug, Clone)]
pub enum Notification {
    SourceApplied(Ingress),
    SourceDeleted(Ingress),
    /// Full list of ingresses (initial list or relist).
    SourcesListed(Vec<Ingress>),
    RuleApplied(PrometheusRule),
    RuleDeleted(PrometheusRule),
    /// Full list of rules (initial list or relist).
    RulesListed(Vec<PrometheusRule>),
}

/// Where an ingress is in its lifecycle, as far as the controller knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unseen,
    Reconciling,
    Synced,
    /// Cleaned up after the ingress went away. Dropped at the next resync,
    /// after which the key reads as `Unseen` again.
    Removed,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub sync_interval: Duration,
    pub store_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            store_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&HeimdallConfig> for ControllerConfig {
    fn from(config: &HeimdallConfig) -> Self {
        Self {
            sync_interval: config.sync_interval(),
            store_timeout: config.store_timeout(),
        }
    }
}

struct Shared {
    reconciler: Reconciler,
    sources: DashMap<ObjectKey, Arc<Ingress>>,
    states: DashMap<ObjectKey, SyncState>,
    locks: DashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>,
    pending: DashSet<ObjectKey>,
    sources_listed: AtomicBool,
    rules_listed: AtomicBool,
    totals: Mutex<PassStats>,
}

impl Shared {
    fn lock_for(&self, key: &ObjectKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.locks.entry(key.clone()).or_default())
    }

    fn release_lock(&self, key: &ObjectKey) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn ready(&self) -> bool {
        self.sources_listed.load(Ordering::Acquire) && self.rules_listed.load(Ordering::Acquire)
    }

    async fn pass(&self, key: ObjectKey) -> PassStats {
        let lock = self.lock_for(&key);
        let guard = lock.lock().await;
        self.pending.remove(&key);

        let source = self.sources.get(&key).map(|entry| Arc::clone(entry.value()));
        let stats = match source {
            Some(ingress) => {
                self.states.insert(key.clone(), SyncState::Reconciling);
                let stats = self.reconciler.reconcile(&ingress).await;
                self.states.insert(key.clone(), SyncState::Synced);
                stats
            }
            None => {
                let stats = self.reconciler.cleanup(&key).await;
                self.states.insert(key.clone(), SyncState::Removed);
                stats
            }
        };
        if stats.changes() > 0 || stats.failed > 0 {
            info!("[ingress][{}] pass done: {}", key.identifier(), stats);
        }

        drop(guard);
        drop(lock);
        self.release_lock(&key);
        stats
    }
}

/// Read-only view of a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    shared: Arc<Shared>,
}

impl ControllerHandle {
    pub fn state(&self, key: &ObjectKey) -> SyncState {
        self.shared
            .states
            .get(key)
            .map(|s| *s.value())
            .unwrap_or(SyncState::Unseen)
    }

    /// Both the ingress list and the rule list have been observed.
    pub fn is_ready(&self) -> bool {
        self.shared.ready()
    }

    pub fn index(&self) -> &Arc<OwnershipIndex> {
        self.shared.reconciler.index()
    }

    /// Stats of every pass finished so far.
    pub fn totals(&self) -> PassStats {
        *self.shared.totals.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Controller {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Notification>,
    tasks: JoinSet<PassStats>,
    config: ControllerConfig,
    store: String,
}

impl Controller {
    /// Build a controller and the sender its watches feed.
    pub fn new(
        renderer: Arc<RuleRenderer>,
        store: Arc<dyn RuleStore>,
        config: ControllerConfig,
    ) -> (Self, mpsc::UnboundedSender<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Self::with_receiver(renderer, store, config, rx);
        (controller, tx)
    }

    /// Build a controller reading from an existing channel. Used when the
    /// store needs the sender before the controller exists.
    pub fn with_receiver(
        renderer: Arc<RuleRenderer>,
        store: Arc<dyn RuleStore>,
        config: ControllerConfig,
        rx: mpsc::UnboundedReceiver<Notification>,
    ) -> Self {
        let description = store.describe();
        let reconciler = Reconciler::new(
            renderer,
            store,
            Arc::new(OwnershipIndex::new()),
            config.store_timeout,
        );
        Self {
            shared: Arc::new(Shared {
                reconciler,
                sources: DashMap::new(),
                states: DashMap::new(),
                locks: DashMap::new(),
                pending: DashSet::new(),
                sources_listed: AtomicBool::new(false),
                rules_listed: AtomicBool::new(false),
                totals: Mutex::new(PassStats::default()),
            }),
            rx,
            tasks: JoinSet::new(),
            config,
            store: description,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Passes scheduled or running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Apply one notification to the caches and schedule whatever passes
    /// it calls for.
    pub fn dispatch(&mut self, notification: Notification) {
        match notification {
            Notification::SourceApplied(ingress) => {
                let key = ObjectKey::of(&ingress);
                debug!("[ingress][{}] applied", key.identifier());
                self.shared.sources.insert(key.clone(), Arc::new(ingress));
                self.schedule(key);
            }
            Notification::SourceDeleted(ingress) => {
                let key = ObjectKey::of(&ingress);
                debug!("[ingress][{}] deleted", key.identifier());
                self.shared.sources.remove(&key);
                self.schedule(key);
            }
            Notification::SourcesListed(ingresses) => {
                info!("listed {} ingresses", ingresses.len());
                self.shared.sources.clear();
                for ingress in ingresses {
                    self.shared
                        .sources
                        .insert(ObjectKey::of(&ingress), Arc::new(ingress));
                }
                self.shared.sources_listed.store(true, Ordering::Release);
                self.resync();
            }
            Notification::RuleApplied(rule) => {
                let key = ObjectKey::of(&rule);
                let owner = self.index().apply(rule);
                if let Some(owner) = owner.filter(|o| !self.shared.sources.contains_key(o)) {
                    debug!("[rule][{}] owner {} is gone", key, owner);
                    self.schedule(owner);
                }
            }
            Notification::RuleDeleted(rule) => {
                let key = ObjectKey::of(&rule);
                let owner = self.index().remove(&key);
                if let Some(owner) = owner {
                    if self.shared.sources.contains_key(&owner) {
                        debug!("[rule][{}] deleted under live owner {}", key, owner);
                        self.schedule(owner);
                    }
                }
            }
            Notification::RulesListed(rules) => {
                info!("listed {} rules", rules.len());
                self.index().replace_all(rules);
                self.shared.rules_listed.store(true, Ordering::Release);
                self.resync();
            }
        }
    }

    /// Schedule a pass for every live ingress and for every owner in the
    /// index that is no longer live. Returns the number of keys scheduled.
    ///
    /// `Removed` states from earlier cleanups are forgotten here; an owner
    /// that still has rules is scheduled again and gets a fresh one.
    pub fn resync(&mut self) -> usize {
        if !self.shared.ready() {
            debug!("resync held until ingresses and rules have been listed");
            return 0;
        }
        self.shared
            .states
            .retain(|_, state| *state != SyncState::Removed);

        let mut keys: Vec<ObjectKey> = self
            .shared
            .sources
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let live = keys.len();
        keys.extend(
            self.index()
                .owners()
                .into_iter()
                .filter(|owner| !self.shared.sources.contains_key(owner)),
        );
        let orphaned = keys.len() - live;
        debug!("resync: {} live ingresses, {} orphaned owners", live, orphaned);

        let total = keys.len();
        for key in keys {
            self.schedule(key);
        }
        total
    }

    /// Wait for every scheduled pass. Returns the stats of the passes
    /// collected by this call.
    pub async fn settle(&mut self) -> PassStats {
        let mut stats = PassStats::default();
        while let Some(joined) = self.tasks.join_next().await {
            if let Some(s) = self.collect(joined) {
                stats.merge(s);
            }
        }
        stats
    }

    /// Run until cancelled or until the notification channel closes.
    ///
    /// On channel close, passes already scheduled are allowed to finish. On
    /// cancellation they are aborted.
    pub async fn run(mut self, cancel: CancellationToken) -> PassStats {
        let period = self.config.sync_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "controller started (store: {}, resync every {:?})",
            self.store, period
        );

        let mut closed = false;
        loop {
            if closed && self.tasks.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("controller cancelled, aborting {} passes", self.tasks.len());
                    self.tasks.shutdown().await;
                    break;
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.collect(joined);
                }
                msg = self.rx.recv(), if !closed => match msg {
                    Some(notification) => self.dispatch(notification),
                    None => {
                        info!("notification channel closed, draining {} passes", self.tasks.len());
                        closed = true;
                    }
                },
                _ = ticker.tick(), if !closed => {
                    let scheduled = self.resync();
                    debug!("periodic resync scheduled {} passes", scheduled);
                }
            }
        }

        let totals = self.handle().totals();
        info!("controller stopped: {}", totals);
        totals
    }

    fn index(&self) -> &Arc<OwnershipIndex> {
        self.shared.reconciler.index()
    }

    fn schedule(&mut self, key: ObjectKey) {
        if !self.shared.ready() {
            return;
        }
        if !self.shared.pending.insert(key.clone()) {
            debug!("[ingress][{}] pass already queued", key.identifier());
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.tasks.spawn(async move { shared.pass(key).await });
    }

    fn collect(&self, joined: Result<PassStats, JoinError>) -> Option<PassStats> {
        match joined {
            Ok(stats) => {
                self.shared
                    .totals
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .merge(stats);
                Some(stats)
            }
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                warn!("reconciliation task failed: {}", e);
                None
            }
        }
    }
}

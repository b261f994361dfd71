//! Kubernetes backend: `KubeStore` and the watch pumps that feed the controller.

use crate::controller::Notification;
use crate::store::{RuleStore, StoreError};
use futures::StreamExt;
use heimdall_core::{ObjectKey, PrometheusRule};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Field manager for server-side apply.
pub const FIELD_MANAGER: &str = "heimdall";

/// Rule store backed by the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<PrometheusRule> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map an API error onto the store's error kinds.
pub fn store_error(key: &ObjectKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(key.clone())
        }
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict {
            key: key.clone(),
            message: resp.message,
        },
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(key.clone()),
        other => StoreError::Api(other.to_string()),
    }
}

#[async_trait::async_trait]
impl RuleStore for KubeStore {
    async fn create(&self, rule: &PrometheusRule) -> Result<PrometheusRule, StoreError> {
        let key = ObjectKey::of(rule);
        self.api(&key.namespace)
            .create(&PostParams::default(), rule)
            .await
            .map_err(|e| store_error(&key, e))
    }

    /// Server-side apply with forced ownership: no resource-version
    /// precondition, last writer wins.
    async fn replace(&self, rule: &PrometheusRule) -> Result<PrometheusRule, StoreError> {
        let key = ObjectKey::of(rule);
        let mut body = rule.clone();
        body.metadata.resource_version = None;
        body.metadata.managed_fields = None;
        self.api(&key.namespace)
            .patch(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&body),
            )
            .await
            .map_err(|e| store_error(&key, e))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| store_error(key, e))
    }

    fn describe(&self) -> String {
        "kubernetes".into()
    }
}

/// `Api` over one namespace, or every namespace when `namespace` is `None`.
pub fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Feed ingress notifications to the controller until cancelled.
pub async fn watch_ingresses(
    client: Client,
    namespace: Option<String>,
    tx: mpsc::UnboundedSender<Notification>,
    cancel: CancellationToken,
) {
    let api: Api<Ingress> = scoped_api(client, namespace.as_deref());
    pump(
        "ingress",
        api,
        tx,
        cancel,
        Notification::SourceApplied,
        Notification::SourceDeleted,
        Notification::SourcesListed,
    )
    .await
}

/// Feed PrometheusRule notifications to the controller until cancelled.
pub async fn watch_rules(
    client: Client,
    namespace: Option<String>,
    tx: mpsc::UnboundedSender<Notification>,
    cancel: CancellationToken,
) {
    let api: Api<PrometheusRule> = scoped_api(client, namespace.as_deref());
    pump(
        "rule",
        api,
        tx,
        cancel,
        Notification::RuleApplied,
        Notification::RuleDeleted,
        Notification::RulesListed,
    )
    .await
}

/// Translate one watcher stream into notifications. Initial list and relist
/// pages are buffered and sent as a single `listed` notification.
async fn pump<K>(
    kind: &'static str,
    api: Api<K>,
    tx: mpsc::UnboundedSender<Notification>,
    cancel: CancellationToken,
    applied: fn(K) -> Notification,
    deleted: fn(K) -> Notification,
    listed: fn(Vec<K>) -> Notification,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    info!("[{}] watch started", kind);
    let mut stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut page: Vec<K> = Vec::new();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!("[{}] watch error: {}", kind, e);
                continue;
            }
            None => break,
        };
        let notification = match event {
            Event::Init => {
                page.clear();
                continue;
            }
            Event::InitApply(obj) => {
                page.push(obj);
                continue;
            }
            Event::InitDone => {
                debug!("[{}] list complete ({} objects)", kind, page.len());
                listed(std::mem::take(&mut page))
            }
            Event::Apply(obj) => applied(obj),
            Event::Delete(obj) => deleted(obj),
        };
        if tx.send(notification).is_err() {
            debug!("[{}] controller gone", kind);
            break;
        }
    }
    info!("[{}] watch stopped", kind);
}

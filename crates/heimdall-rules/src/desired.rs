//! Desired state of one ingress, recomputed from scratch on every pass.

use crate::render::{RenderWarning, RuleRenderer};
use heimdall_core::{ObjectKey, PrometheusRule};
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct DesiredState {
    pub source: ObjectKey,
    /// Rules that should exist, keyed by name (all in the source's namespace).
    pub rules: BTreeMap<String, PrometheusRule>,
    pub warnings: Vec<RenderWarning>,
}

impl DesiredState {
    pub fn for_source(renderer: &RuleRenderer, ingress: &Ingress) -> Self {
        let rendered = renderer.render(ingress);
        Self {
            source: ObjectKey::of(ingress),
            rules: rendered.rules,
            warnings: rendered.warnings,
        }
    }

    /// Desired state of an ingress that no longer exists.
    pub fn empty(source: ObjectKey) -> Self {
        Self {
            source,
            rules: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = ObjectKey> + '_ {
        self.rules
            .keys()
            .map(|name| ObjectKey::new(self.source.namespace.clone(), name.clone()))
    }
}

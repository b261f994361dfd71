//! PrometheusRule resources (monitoring.coreos.com/v1)
//!
//! Only the parts of the prometheus-operator schema heimdall renders and
//! compares. The CRD itself is installed by the operator, never by us.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "PrometheusRule",
    plural = "prometheusrules",
    namespaced,
    schema = "disabled"
)]
pub struct PrometheusRuleSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<RuleGroup>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_response_strategy: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A single alerting or recording rule.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    pub expr: IntOrString,
    #[serde(default, rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Rule {
    pub fn alert(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            alert: Some(name.into()),
            record: None,
            expr: IntOrString::String(expr.into()),
            for_: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// The expression as text, whichever way it was written.
    pub fn expr_str(&self) -> String {
        match &self.expr {
            IntOrString::Int(i) => i.to_string(),
            IntOrString::String(s) => s.clone(),
        }
    }
}

impl PrometheusRule {
    /// Whether `other` already carries everything heimdall manages on `self`.
    ///
    /// Spec and owner references must match exactly. Labels and annotations
    /// only need to match on the keys `self` declares: server-side apply
    /// leaves keys owned by other field managers in place, so extra keys on
    /// `other` are not a difference. Server-populated metadata (uid,
    /// resourceVersion, managedFields, ...) is ignored.
    pub fn same_content(&self, other: &PrometheusRule) -> bool {
        let meta = &self.metadata;
        let seen = &other.metadata;
        self.spec == other.spec
            && declared_subset(meta.labels.as_ref(), seen.labels.as_ref())
            && declared_subset(meta.annotations.as_ref(), seen.annotations.as_ref())
            && meta.owner_references.as_deref().unwrap_or_default()
                == seen.owner_references.as_deref().unwrap_or_default()
    }
}

fn declared_subset(
    wanted: Option<&BTreeMap<String, String>>,
    seen: Option<&BTreeMap<String, String>>,
) -> bool {
    wanted
        .into_iter()
        .flatten()
        .all(|(k, v)| seen.and_then(|m| m.get(k)) == Some(v))
}

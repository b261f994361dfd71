//! Conversion of pre-operator heimdall `Alert` resources into PrometheusRules.
//!
//! Used once per cluster when moving off the old alert CRD: feed it the
//! exported alerts, apply what comes out.

use heimdall_core::{PrometheusRule, PrometheusRuleSpec, Result, Rule, RuleGroup};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Annotation that carried the human readable summary on legacy alerts.
pub const LEGACY_SUMMARY_ANNOTATION: &str = "heimdall.uswitch.com/summary";

#[derive(Deserialize, Debug, Clone)]
pub struct LegacyAlert {
    pub metadata: LegacyMetadata,
    pub spec: LegacyAlertSpec,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LegacyMetadata {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LegacyAlertSpec {
    pub expr: String,
    #[serde(default, rename = "for")]
    pub for_: Option<String>,
}

pub fn convert_alert(alert: &LegacyAlert) -> PrometheusRule {
    let meta = &alert.metadata;

    let mut rule = Rule::alert(meta.name.clone(), alert.spec.expr.clone());
    rule.for_ = alert.spec.for_.clone();
    if let Some(summary) = meta.annotations.get(LEGACY_SUMMARY_ANNOTATION) {
        rule.annotations.insert("summary".into(), summary.clone());
    }
    rule.labels.insert("name".into(), meta.name.clone());
    rule.labels.insert("namespace".into(), meta.namespace.clone());
    rule.labels
        .extend(meta.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut out = PrometheusRule::new(
        &meta.name,
        PrometheusRuleSpec {
            groups: vec![RuleGroup {
                name: format!("{}.rules", meta.name),
                rules: vec![rule],
                ..Default::default()
            }],
        },
    );
    out.metadata.namespace = Some(meta.namespace.clone());
    out.metadata.labels = Some(BTreeMap::from([("role".into(), "alert-rules".into())]));
    out
}

/// Convert a multi-document YAML stream of legacy alerts. Empty documents
/// are skipped.
pub fn convert_documents(input: &str) -> Result<Vec<PrometheusRule>> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(input) {
        if let Some(alert) = Option::<LegacyAlert>::deserialize(doc)? {
            out.push(convert_alert(&alert));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::to_yaml_stream;
    use kube::ResourceExt;

    const ALERTS: &str = r#"
apiVersion: heimdall.uswitch.com/v1alpha1
kind: Alert
metadata:
  name: payments-5xx
  namespace: payments
  annotations:
    heimdall.uswitch.com/summary: Too many errors
  labels:
    team: payments
spec:
  expr: rate(errors[5m]) > 1
  for: 2m
---
apiVersion: heimdall.uswitch.com/v1alpha1
kind: Alert
metadata:
  name: search-latency
  namespace: search
spec:
  expr: latency > 1
"#;

    #[test]
    fn converts_each_document() {
        let rules = convert_documents(ALERTS).unwrap();
        assert_eq!(rules.len(), 2);

        let first = &rules[0];
        assert_eq!(first.name_any(), "payments-5xx");
        assert_eq!(first.namespace().as_deref(), Some("payments"));
        assert_eq!(first.labels().get("role").map(String::as_str), Some("alert-rules"));

        let group = &first.spec.groups[0];
        assert_eq!(group.name, "payments-5xx.rules");
        let rule = &group.rules[0];
        assert_eq!(rule.alert.as_deref(), Some("payments-5xx"));
        assert_eq!(rule.for_.as_deref(), Some("2m"));
        assert_eq!(rule.annotations["summary"], "Too many errors");
        assert_eq!(rule.labels["team"], "payments");
        assert_eq!(rule.labels["namespace"], "payments");
        assert_eq!(rule.labels["name"], "payments-5xx");

        let second = &rules[1].spec.groups[0].rules[0];
        assert!(second.annotations.is_empty());
        assert!(second.for_.is_none());
    }

    #[test]
    fn yaml_stream_contains_every_rule() {
        let rules = convert_documents(ALERTS).unwrap();
        let out = to_yaml_stream(&rules).unwrap();
        assert_eq!(out.matches("---\n").count(), 2);
        assert!(out.contains("kind: PrometheusRule"));
        assert!(out.contains("search-latency.rules"));
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(convert_documents("metadata: {name: x}\n").is_err());
    }
}

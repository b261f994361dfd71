//! Tests for heimdall-rules: template library loading and rule rendering

use heimdall_core::{AnnotationPrefix, Error};
use heimdall_rules::*;
use k8s_openapi::api::networking::v1::{Ingress, IngressRule, IngressSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::path::Path;

const PREFIX: &str = "com.uswitch.heimdall";

const LATENCY: &str = r#"apiVersion: monitoring.coreos.com/v1
kind: PrometheusRule
metadata:
  name: {{name}}-latency-rule
  namespace: {{namespace}}
spec:
  groups:
  - name: {{identifier}}.latency
    rules:
    - alert: IngressLatency
      expr: latency_seconds{ingress="{{name}}", host="{{host}}"} > {{threshold}}
      for: 5m
"#;

const ERRORS: &str = r#"apiVersion: monitoring.coreos.com/v1
kind: PrometheusRule
metadata:
  name: {{name}}-errors-rule
spec:
  groups:
  - name: {{identifier}}.errors
    rules:
    - alert: IngressErrors
      expr: error_rate{ingress="{{name}}"} > {{threshold}}
      labels:
        team: {{ingress.metadata.labels.team}}
"#;

fn ingress(ns: &str, name: &str, annotations: &[(&str, &str)]) -> Ingress {
    let annotations: BTreeMap<String, String> = annotations
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Ingress {
        metadata: ObjectMeta {
            namespace: Some(ns.into()),
            name: Some(name.into()),
            uid: Some(format!("uid-{}", name)),
            annotations: Some(annotations),
            labels: Some(BTreeMap::from([("team".to_string(), "edge".to_string())])),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(format!("{}.example.com", name)),
                http: None,
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn key(template: &str) -> String {
    format!("{}/{}", PREFIX, template)
}

fn renderer(templates: &[(&str, &str)]) -> RuleRenderer {
    let library = TemplateLibrary::from_sources(templates.iter().copied()).unwrap();
    RuleRenderer::new(library, AnnotationPrefix::new(PREFIX))
}

fn write(dir: &Path, file: &str, body: &str) {
    std::fs::write(dir.join(file), body).unwrap();
}

// ===========================================================================
// TemplateLibrary
// ===========================================================================

#[test]
fn library_loads_tmpl_files_by_stem() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "latency.tmpl", LATENCY);
    write(tmp.path(), "errors.tmpl", ERRORS);
    write(tmp.path(), "README.md", "{{#if}}");
    std::fs::create_dir(tmp.path().join("nested.tmpl")).unwrap();
    write(&tmp.path().join("nested.tmpl"), "deep.tmpl", "x");

    let lib = TemplateLibrary::load(tmp.path()).unwrap();
    assert_eq!(lib.names(), vec!["errors", "latency"]);
    assert_eq!(lib.len(), 2);
    assert!(lib.get("deep").is_none());
}

#[test]
fn library_empty_directory_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "notes.txt", "hello");
    assert!(matches!(
        TemplateLibrary::load(tmp.path()),
        Err(Error::EmptyLibrary(_))
    ));
}

#[test]
fn library_missing_directory_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    assert!(matches!(
        TemplateLibrary::load(tmp.path().join("absent")),
        Err(Error::TemplateDir { .. })
    ));
}

#[test]
fn library_one_bad_file_fails_the_load() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "latency.tmpl", LATENCY);
    write(tmp.path(), "broken.tmpl", "{{#each things}}never closed");
    let err = TemplateLibrary::load(tmp.path()).err().unwrap();
    assert!(matches!(err, Error::TemplateCompile { ref name, .. } if name == "broken"));
}

// ===========================================================================
// RuleRenderer
// ===========================================================================

#[test]
fn renders_latency_rule_with_threshold() {
    let r = renderer(&[("latency", LATENCY)]);
    let out = r.render(&ingress("ns", "foo", &[(&key("latency"), "500")]));

    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
    assert_eq!(out.rules.len(), 1);
    let rule = &out.rules["foo-latency-rule"];
    assert_eq!(rule.namespace().as_deref(), Some("ns"));

    let group = &rule.spec.groups[0];
    assert_eq!(group.name, "ns.foo.latency");
    let expr = group.rules[0].expr_str();
    assert!(expr.ends_with("> 500"), "{}", expr);
    assert!(expr.contains(r#"host="foo.example.com""#), "{}", expr);
}

#[test]
fn owner_reference_points_at_ingress() {
    let r = renderer(&[("latency", LATENCY)]);
    let out = r.render(&ingress("ns", "foo", &[(&key("latency"), "1")]));
    let owners = out.rules["foo-latency-rule"].owner_references();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "Ingress");
    assert_eq!(owners[0].name, "foo");
    assert_eq!(owners[0].uid, "uid-foo");
    assert_eq!(owners[0].controller, Some(true));
    assert_eq!(owners[0].block_owner_deletion, Some(true));
}

#[test]
fn missing_namespace_defaults_to_ingress_namespace() {
    let r = renderer(&[("errors", ERRORS)]);
    let out = r.render(&ingress("payments", "api", &[(&key("errors"), "0.1")]));
    let rule = &out.rules["api-errors-rule"];
    assert_eq!(rule.namespace().as_deref(), Some("payments"));
    assert_eq!(rule.spec.groups[0].rules[0].labels["team"], "edge");
}

#[test]
fn no_annotations_no_rules() {
    let r = renderer(&[("latency", LATENCY)]);
    let out = r.render(&ingress("ns", "foo", &[]));
    assert!(out.rules.is_empty());
    assert!(out.warnings.is_empty());
}

#[test]
fn foreign_prefixes_are_never_looked_up() {
    let r = renderer(&[("latency", LATENCY)]);
    let out = r.render(&ingress(
        "ns",
        "foo",
        &[
            ("nginx.ingress.kubernetes.io/latency", "500"),
            ("com.uswitch.heimdallish/latency", "500"),
            ("latency", "500"),
        ],
    ));
    assert!(out.rules.is_empty());
    // A lookup miss would have produced a warning.
    assert!(out.warnings.is_empty());
}

#[test]
fn unknown_template_warns_and_others_still_render() {
    let r = renderer(&[("latency", LATENCY)]);
    let out = r.render(&ingress(
        "ns",
        "foo",
        &[(&key("unknown"), "1"), (&key("latency"), "500")],
    ));
    assert_eq!(out.rules.len(), 1);
    assert!(out.rules.contains_key("foo-latency-rule"));
    assert_eq!(
        out.warnings,
        vec![RenderWarning::TemplateLookupMiss {
            key: key("unknown"),
            template: "unknown".into(),
        }]
    );
}

#[test]
fn execution_failure_drops_only_that_annotation() {
    let r = renderer(&[
        ("latency", LATENCY),
        ("needs-owner", "metadata:\n  name: {{ingress.metadata.labels.owner}}\n"),
    ]);
    let out = r.render(&ingress(
        "ns",
        "foo",
        &[(&key("needs-owner"), "1"), (&key("latency"), "500")],
    ));
    assert_eq!(out.rules.len(), 1);
    assert_eq!(out.warnings.len(), 1);
    assert!(matches!(
        &out.warnings[0],
        RenderWarning::TemplateExecution { template, .. } if template == "needs-owner"
    ));
}

#[test]
fn parse_failure_drops_only_that_annotation() {
    let r = renderer(&[("latency", LATENCY), ("junk", "metadata: [unclosed {{threshold}}")]);
    let out = r.render(&ingress(
        "ns",
        "foo",
        &[(&key("junk"), "1"), (&key("latency"), "500")],
    ));
    assert_eq!(out.rules.len(), 1);
    assert!(matches!(
        &out.warnings[0],
        RenderWarning::DocumentParse { template, .. } if template == "junk"
    ));
}

#[test]
fn oversized_document_is_a_parse_warning() {
    let library = TemplateLibrary::from_sources([("latency", LATENCY)]).unwrap();
    let r = RuleRenderer::new(library, AnnotationPrefix::new(PREFIX)).with_max_document_bytes(16);
    let out = r.render(&ingress("ns", "foo", &[(&key("latency"), "500")]));
    assert!(out.rules.is_empty());
    assert_eq!(out.warnings[0].template(), "latency");
}

#[test]
fn foreign_namespace_is_rejected() {
    let r = renderer(&[(
        "elsewhere",
        "apiVersion: monitoring.coreos.com/v1\nkind: PrometheusRule\nmetadata:\n  name: x\n  namespace: monitoring\nspec: {}\n",
    )]);
    let out = r.render(&ingress("ns", "foo", &[(&key("elsewhere"), "1")]));
    assert!(out.rules.is_empty());
    assert!(matches!(
        &out.warnings[0],
        RenderWarning::ForeignNamespace { namespace, expected, .. }
            if namespace == "monitoring" && expected == "ns"
    ));
}

#[test]
fn name_collision_last_key_wins() {
    let fixed = |n: &str| {
        format!(
            "apiVersion: monitoring.coreos.com/v1\nkind: PrometheusRule\nmetadata:\n  name: shared\nspec:\n  groups:\n  - name: {}\n    rules: []\n",
            n
        )
    };
    let a = fixed("from-a");
    let b = fixed("from-b");
    let r = renderer(&[("a", a.as_str()), ("b", b.as_str())]);
    let out = r.render(&ingress("ns", "foo", &[(&key("b"), "1"), (&key("a"), "1")]));
    assert_eq!(out.rules.len(), 1);
    assert_eq!(out.rules["shared"].spec.groups[0].name, "from-b");
}

#[test]
fn rendering_is_deterministic() {
    let r = renderer(&[("latency", LATENCY), ("errors", ERRORS)]);
    let ing = ingress(
        "ns",
        "foo",
        &[(&key("latency"), "500"), (&key("errors"), "0.5")],
    );
    let first = r.render(&ing);
    let second = r.render(&ing);
    assert_eq!(
        first.rules.keys().collect::<Vec<_>>(),
        second.rules.keys().collect::<Vec<_>>()
    );
    for (name, rule) in &first.rules {
        assert!(rule.same_content(&second.rules[name]));
    }
}

// ===========================================================================
// DesiredState
// ===========================================================================

#[test]
fn desired_state_scopes_to_source() {
    let r = renderer(&[("latency", LATENCY), ("errors", ERRORS)]);
    let ing = ingress(
        "ns",
        "foo",
        &[(&key("latency"), "500"), (&key("errors"), "0.5"), (&key("nope"), "1")],
    );
    let desired = DesiredState::for_source(&r, &ing);
    assert_eq!(desired.source.to_string(), "ns/foo");
    assert!(desired.contains("foo-latency-rule"));
    assert!(desired.contains("foo-errors-rule"));
    assert_eq!(desired.warnings.len(), 1);
    let keys: Vec<String> = desired.keys().map(|k| k.to_string()).collect();
    assert_eq!(keys, vec!["ns/foo-errors-rule", "ns/foo-latency-rule"]);
}

#[test]
fn desired_state_empty() {
    let desired = DesiredState::empty(heimdall_core::ObjectKey::new("ns", "gone"));
    assert!(desired.is_empty());
    assert_eq!(desired.keys().count(), 0);
}

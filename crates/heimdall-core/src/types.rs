//! Core types for heimdall

use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Annotation prefix reserved for heimdall when none is configured.
pub const DEFAULT_ANNOTATION_PREFIX: &str = "com.uswitch.heimdall";

/// API groups an Ingress owner reference may carry. Rules written before the
/// move to `networking.k8s.io` still point at `extensions`.
const INGRESS_GROUPS: &[&str] = &["networking.k8s.io", "extensions"];

/// Namespace-qualified identity of a namespaced object.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of any kube object. Cluster-scoped objects get an empty namespace.
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }

    /// `namespace.name`, the identifier handed to templates.
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The `<prefix>/` part of heimdall annotation keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotationPrefix(String);

impl AnnotationPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix: String = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        Self(prefix)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Template name carried by an annotation key, or `None` if the key does
    /// not belong to heimdall. Only the exact `<prefix>/` is cut off.
    pub fn template_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.0.as_str())?.strip_prefix('/')
    }

    /// Full annotation key for a template name.
    pub fn key_for(&self, template: &str) -> String {
        format!("{}/{}", self.0, template)
    }
}

impl Default for AnnotationPrefix {
    fn default() -> Self {
        Self::new(DEFAULT_ANNOTATION_PREFIX)
    }
}

impl std::fmt::Display for AnnotationPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Controller owner reference pointing at an Ingress.
///
/// Marks the ingress as the managing controller and blocks its foreground
/// deletion until the rule is gone, so the cluster GC cascades as well.
pub fn ingress_owner_ref(ingress: &Ingress) -> OwnerReference {
    OwnerReference {
        api_version: Ingress::api_version(&()).into_owned(),
        kind: Ingress::kind(&()).into_owned(),
        name: ingress.name_any(),
        uid: ingress.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Ingress recorded as the controlling owner of an object, if any.
///
/// Owner references are namespace-local, so the owner lives in the object's
/// own namespace.
pub fn ingress_owner<K: Resource>(obj: &K) -> Option<ObjectKey> {
    let namespace = obj.namespace().unwrap_or_default();
    obj.owner_references()
        .iter()
        .find(|r| r.controller == Some(true) && is_ingress_ref(r))
        .map(|r| ObjectKey::new(namespace, r.name.clone()))
}

fn is_ingress_ref(r: &OwnerReference) -> bool {
    let group = r.api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("");
    r.kind == "Ingress" && INGRESS_GROUPS.contains(&group)
}

/// Host of the first ingress rule, empty if the ingress has none.
pub fn first_host(ingress: &Ingress) -> String {
    ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .and_then(|rules| rules.iter().find_map(|r| r.host.clone()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ingress(ns: &str, name: &str) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                namespace: Some(ns.into()),
                name: Some(name.into()),
                uid: Some("uid-1".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn prefix_strip_is_exact() {
        let prefix = AnnotationPrefix::new("com.uswitch.heimdall");
        assert_eq!(prefix.template_name("com.uswitch.heimdall/latency"), Some("latency"));
        // A character-set trim would eat the leading "l" and "a" here.
        assert_eq!(prefix.template_name("com.uswitch.heimdall/all-5xx"), Some("all-5xx"));
        assert_eq!(prefix.template_name("com.uswitch.heimdallx/latency"), None);
        assert_eq!(prefix.template_name("other.io/latency"), None);
        assert_eq!(prefix.template_name("com.uswitch.heimdall/"), Some(""));
    }

    #[test]
    fn prefix_trailing_slash_ignored() {
        let prefix = AnnotationPrefix::new("example.com/");
        assert_eq!(prefix.as_str(), "example.com");
        assert_eq!(prefix.key_for("errors"), "example.com/errors");
    }

    #[test]
    fn owner_ref_round_trips_to_key() {
        let ing = ingress("ns", "foo");
        let owner = ingress_owner_ref(&ing);
        assert_eq!(owner.kind, "Ingress");
        assert_eq!(owner.api_version, "networking.k8s.io/v1");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(true));

        let mut other = ingress("ns", "rule");
        other.metadata.owner_references = Some(vec![owner]);
        assert_eq!(ingress_owner(&other), Some(ObjectKey::new("ns", "foo")));
    }

    #[test]
    fn non_controller_refs_are_not_owners() {
        let mut owner = ingress_owner_ref(&ingress("ns", "foo"));
        owner.controller = None;
        let mut other = ingress("ns", "rule");
        other.metadata.owner_references = Some(vec![owner]);
        assert_eq!(ingress_owner(&other), None);
    }

    #[test]
    fn legacy_extensions_refs_are_owners() {
        let mut owner = ingress_owner_ref(&ingress("ns", "foo"));
        owner.api_version = "extensions/v1beta1".into();
        let mut other = ingress("ns", "rule");
        other.metadata.owner_references = Some(vec![owner]);
        assert_eq!(ingress_owner(&other), Some(ObjectKey::new("ns", "foo")));
    }

    #[test]
    fn identifier_and_display() {
        let key = ObjectKey::new("ns", "foo");
        assert_eq!(key.identifier(), "ns.foo");
        assert_eq!(key.to_string(), "ns/foo");
    }
}

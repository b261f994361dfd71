//! Rule renderer: turns an ingress's heimdall annotations into PrometheusRules.
//!
//! One annotation, one template execution, at most one rule. Anything that
//! goes wrong with a single annotation becomes a [`RenderWarning`] and the
//! annotation is dropped; the other annotations are unaffected.

use crate::library::TemplateLibrary;
use heimdall_core::{first_host, ingress_owner_ref, AnnotationPrefix, ObjectKey, PrometheusRule};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Bytes inspected to decide between JSON and YAML.
const SNIFF_LEN: usize = 1024;

/// Default ceiling on a rendered document.
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 64 * 1024;

/// Why an annotation produced no rule.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderWarning {
    #[error("no template for \"{template}\" (annotation {key})")]
    TemplateLookupMiss { key: String, template: String },

    #[error("error executing template {template}: {message}")]
    TemplateExecution { template: String, message: String },

    #[error("error parsing output of template {template}: {message}")]
    DocumentParse { template: String, message: String },

    #[error("template {template} rendered {rule} into namespace {namespace}, rules must live in {expected}")]
    ForeignNamespace {
        template: String,
        rule: String,
        namespace: String,
        expected: String,
    },
}

impl RenderWarning {
    pub fn template(&self) -> &str {
        match self {
            Self::TemplateLookupMiss { template, .. }
            | Self::TemplateExecution { template, .. }
            | Self::DocumentParse { template, .. }
            | Self::ForeignNamespace { template, .. } => template,
        }
    }
}

/// What a template sees.
#[derive(Serialize, Debug)]
pub struct TemplateParameters<'a> {
    /// `namespace.name` of the ingress.
    pub identifier: String,
    pub namespace: String,
    pub name: String,
    /// Host of the first ingress rule, empty if none.
    pub host: String,
    /// Value of the annotation being rendered.
    pub threshold: &'a str,
    pub ingress: &'a Ingress,
}

/// Result of rendering one ingress.
#[derive(Debug, Default)]
pub struct Rendered {
    /// Rules keyed by their declared name.
    pub rules: BTreeMap<String, PrometheusRule>,
    pub warnings: Vec<RenderWarning>,
}

pub struct RuleRenderer {
    library: TemplateLibrary,
    prefix: AnnotationPrefix,
    max_document_bytes: usize,
}

impl RuleRenderer {
    pub fn new(library: TemplateLibrary, prefix: AnnotationPrefix) -> Self {
        Self {
            library,
            prefix,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }

    pub fn with_max_document_bytes(mut self, limit: usize) -> Self {
        self.max_document_bytes = limit;
        self
    }

    /// Render every heimdall annotation on `ingress`.
    ///
    /// Annotations are visited in key order, so when two of them render a
    /// rule with the same name the one with the greater key wins.
    pub fn render(&self, ingress: &Ingress) -> Rendered {
        let source = ObjectKey::of(ingress);
        let owner = ingress_owner_ref(ingress);
        let host = first_host(ingress);
        let mut out = Rendered::default();

        for (key, value) in ingress.annotations() {
            let Some(template_name) = self.prefix.template_name(key) else {
                continue;
            };

            let Some(template) = self.library.get(template_name) else {
                out.warnings.push(RenderWarning::TemplateLookupMiss {
                    key: key.clone(),
                    template: template_name.to_string(),
                });
                continue;
            };

            let params = TemplateParameters {
                identifier: source.identifier(),
                namespace: source.namespace.clone(),
                name: source.name.clone(),
                host: host.clone(),
                threshold: value,
                ingress,
            };

            let text = match template.execute(&params) {
                Ok(t) => t,
                Err(message) => {
                    out.warnings.push(RenderWarning::TemplateExecution {
                        template: template_name.to_string(),
                        message,
                    });
                    continue;
                }
            };

            let mut rule = match decode_rule(&text, self.max_document_bytes) {
                Ok(r) => r,
                Err(message) => {
                    out.warnings.push(RenderWarning::DocumentParse {
                        template: template_name.to_string(),
                        message,
                    });
                    continue;
                }
            };

            let rule_name = rule.name_any();
            let declared = rule.metadata.namespace.clone().filter(|ns| !ns.is_empty());
            match declared {
                None => rule.metadata.namespace = Some(source.namespace.clone()),
                Some(ns) if ns == source.namespace => {}
                Some(ns) => {
                    out.warnings.push(RenderWarning::ForeignNamespace {
                        template: template_name.to_string(),
                        rule: rule_name,
                        namespace: ns,
                        expected: source.namespace.clone(),
                    });
                    continue;
                }
            }

            rule.metadata.owner_references = Some(vec![owner.clone()]);
            out.rules.insert(rule_name, rule);
        }

        out
    }
}

/// Decode a rendered document as YAML or JSON.
///
/// Documents over `limit` bytes are refused before parsing. Only the first
/// YAML document is read; anything after a `---` separator is ignored.
pub fn decode_rule(text: &str, limit: usize) -> Result<PrometheusRule, String> {
    if text.len() > limit {
        return Err(format!(
            "rendered document is {} bytes, limit is {}",
            text.len(),
            limit
        ));
    }

    let head = &text.as_bytes()[..text.len().min(SNIFF_LEN)];
    let is_json = head.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{');

    let rule: PrometheusRule = if is_json {
        serde_json::from_str(text).map_err(|e| e.to_string())?
    } else {
        let doc = serde_yaml::Deserializer::from_str(text)
            .next()
            .ok_or_else(|| "empty document".to_string())?;
        PrometheusRule::deserialize(doc).map_err(|e| e.to_string())?
    };

    match rule.metadata.name.as_deref() {
        Some(name) if !name.is_empty() => Ok(rule),
        _ => Err("document has no metadata.name".into()),
    }
}

/// Render rules as a `---` separated YAML stream.
pub fn to_yaml_stream<'a>(
    rules: impl IntoIterator<Item = &'a PrometheusRule>,
) -> heimdall_core::Result<String> {
    let mut out = String::new();
    for rule in rules {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(rule)?);
    }
    Ok(out)
}

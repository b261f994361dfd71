//! heimdall-rules: template library and PrometheusRule rendering
//!
//! Pure functions of (templates, ingress). Nothing in this crate talks to
//! the cluster.

pub mod desired;
pub mod legacy;
pub mod library;
pub mod render;

pub use desired::DesiredState;
pub use library::{TemplateLibrary, TemplateRef, TEMPLATE_EXTENSION};
pub use render::{
    decode_rule, to_yaml_stream, RenderWarning, Rendered, RuleRenderer, TemplateParameters,
    DEFAULT_MAX_DOCUMENT_BYTES,
};

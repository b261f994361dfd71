//! heimdall core - resource types, configuration and error handling

pub mod config;
pub mod error;
pub mod rule;
pub mod types;

pub use config::{HeimdallConfig, LogConfig};
pub use error::{Error, Result};
pub use rule::{PrometheusRule, PrometheusRuleSpec, Rule, RuleGroup};
pub use types::*;

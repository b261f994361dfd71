//! heimdall configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults for anything the file leaves out. CLI flags are
//! applied on top by the binary.

use crate::error::{Error, Result};
use crate::types::{AnnotationPrefix, DEFAULT_ANNOTATION_PREFIX};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeimdallConfig {
    /// Directory holding the `*.tmpl` rule templates.
    pub templates: PathBuf,
    /// Namespace to watch. Empty watches every namespace.
    pub namespace: String,
    /// Annotation prefix heimdall owns, without the trailing `/`.
    pub annotation_prefix: String,
    /// Seconds between full resyncs of every ingress.
    pub sync_interval_secs: u64,
    /// Upper bound on a single create/update/delete call, in seconds.
    pub store_timeout_secs: u64,
    /// Largest rendered rule document accepted, in bytes.
    pub max_document_bytes: usize,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Emit JSON log lines instead of human readable ones.
    pub json: bool,
    /// Lower the default filter to debug.
    pub debug: bool,
}

impl Default for HeimdallConfig {
    fn default() -> Self {
        Self {
            templates: PathBuf::from("templates"),
            namespace: String::new(),
            annotation_prefix: DEFAULT_ANNOTATION_PREFIX.into(),
            sync_interval_secs: 60,
            store_timeout_secs: 10,
            max_document_bytes: 64 * 1024,
            log: LogConfig::default(),
        }
    }
}

impl HeimdallConfig {
    /// Load config from a TOML file. A missing file yields the defaults; a
    /// file that exists but does not parse or validate is a startup error.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_secs == 0 {
            return Err(Error::config("sync_interval_secs must be positive"));
        }
        if self.store_timeout_secs == 0 {
            return Err(Error::config("store_timeout_secs must be positive"));
        }
        if self.max_document_bytes == 0 {
            return Err(Error::config("max_document_bytes must be positive"));
        }
        if self.annotation_prefix.trim_end_matches('/').is_empty() {
            return Err(Error::config("annotation_prefix must not be empty"));
        }
        Ok(())
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// `None` means cluster-wide.
    pub fn namespace_scope(&self) -> Option<&str> {
        Some(self.namespace.as_str()).filter(|ns| !ns.is_empty())
    }

    pub fn prefix(&self) -> AnnotationPrefix {
        AnnotationPrefix::new(self.annotation_prefix.clone())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

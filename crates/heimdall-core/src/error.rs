//! Error types for heimdall
//!
//! Everything in here is a configuration error: it aborts startup.
//! Per-annotation and per-store-call failures have their own types in the
//! crates that detect them and never reach this enum.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot read template directory {}: {source}", path.display())]
    TemplateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template {name} failed to load: {message}")]
    TemplateCompile { name: String, message: String },

    #[error("no templates defined in {}", .0.display())]
    EmptyLibrary(PathBuf),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    TomlError(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn template_dir(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::TemplateDir {
            path: path.into(),
            source,
        }
    }

    pub fn template_compile(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TemplateCompile {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}

//! Template library: every `*.tmpl` file in one directory, compiled once.
//!
//! The library is immutable after load. Template names are the file stems,
//! matched case-sensitively against the part of an annotation key after the
//! heimdall prefix.

use handlebars::Handlebars;
use heimdall_core::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File extension that marks a file as a template.
pub const TEMPLATE_EXTENSION: &str = "tmpl";

pub struct TemplateLibrary {
    registry: Handlebars<'static>,
}

/// A template found in the library, ready to execute.
#[derive(Clone, Copy)]
pub struct TemplateRef<'a> {
    registry: &'a Handlebars<'static>,
    name: &'a str,
}

impl TemplateRef<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    /// Execute the template. Referencing a field the parameters do not have
    /// is an error, not an empty string.
    pub fn execute<T: Serialize>(&self, params: &T) -> std::result::Result<String, String> {
        self.registry
            .render(self.name, params)
            .map_err(|e| e.to_string())
    }
}

impl TemplateLibrary {
    /// Load every template in `dir` (non-recursive). Fails on the first file
    /// that does not compile, and when the directory holds no templates.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| Error::template_dir(dir, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::template_dir(dir, e))?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == TEMPLATE_EXTENSION) {
                files.push(path);
            }
        }
        files.sort();

        let mut sources = Vec::with_capacity(files.len());
        for path in files {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                return Err(Error::template_compile(
                    path.display().to_string(),
                    "file name is not valid UTF-8",
                ));
            };
            let body = std::fs::read_to_string(&path)
                .map_err(|e| Error::template_compile(name, e.to_string()))?;
            debug!("read template {} from {}", name, path.display());
            sources.push((name.to_string(), body));
        }

        let library = Self::compile(sources, dir.display().to_string())?;
        info!(
            "Loaded {} templates from {}: {}",
            library.len(),
            dir.display(),
            library.names().join(", ")
        );
        Ok(library)
    }

    /// Build a library from in-memory `(name, body)` pairs, with the same
    /// validation as [`TemplateLibrary::load`].
    pub fn from_sources<I, N, B>(sources: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, B)>,
        N: Into<String>,
        B: Into<String>,
    {
        let sources = sources
            .into_iter()
            .map(|(n, b)| (n.into(), b.into()))
            .collect();
        Self::compile(sources, "<memory>".into())
    }

    fn compile(sources: Vec<(String, String)>, origin: String) -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(true);

        for (name, body) in sources {
            registry
                .register_template_string(&name, body)
                .map_err(|e| Error::template_compile(&name, e.to_string()))?;
        }

        if registry.get_templates().is_empty() {
            return Err(Error::EmptyLibrary(PathBuf::from(origin)));
        }

        Ok(Self { registry })
    }

    pub fn get<'a>(&'a self, name: &'a str) -> Option<TemplateRef<'a>> {
        self.registry
            .has_template(name)
            .then_some(TemplateRef {
                registry: &self.registry,
                name,
            })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .registry
            .get_templates()
            .keys()
            .map(|s| s.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.registry.get_templates().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Prompt template registry and rendering.
//!
//! [`PromptManager`] owns a minijinja environment pre-loaded with the
//! built-in grading templates. Deployments can override or extend the
//! built-ins by pointing [`load_dir`](PromptManager::load_dir) at a
//! directory of `.j2` / `.jinja` files; a file named `grade/rubric.j2`
//! replaces the built-in rubric wholesale.

use std::path::Path;

use minijinja::Environment;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PmError;

/// Built-in templates compiled into the binary.
///
/// Each entry is `(name, source)`. Overrides loaded later under the
/// same name replace these.
const BUILTIN_TEMPLATES: &[(&str, &str)] =
    &[("grade/rubric", include_str!("../templates/grade/rubric.j2"))];

/// A named prompt template and its raw Jinja2 source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Template name used for lookup (e.g., `grade/rubric`).
    pub name: String,

    /// Raw Jinja2 template source.
    pub source: String,
}

/// Manages prompt templates and renders them with context variables.
pub struct PromptManager {
    env: Environment<'static>,
    names: Vec<String>,
}

impl PromptManager {
    /// Create a new manager with the built-in templates registered.
    ///
    /// # Errors
    ///
    /// Returns `PmError::InvalidTemplate` if a built-in template fails
    /// to parse (a build defect, not a runtime condition).
    pub fn new() -> Result<Self, PmError> {
        let mut manager = Self {
            env: Environment::new(),
            names: Vec::new(),
        };

        for (name, source) in BUILTIN_TEMPLATES {
            manager.add_template(PromptTemplate {
                name: (*name).to_owned(),
                source: (*source).to_owned(),
            })?;
        }

        Ok(manager)
    }

    /// Register a single template, replacing any existing one with the
    /// same name.
    ///
    /// # Errors
    ///
    /// Returns `PmError::InvalidTemplate` if the source does not parse.
    pub fn add_template(&mut self, template: PromptTemplate) -> Result<(), PmError> {
        let PromptTemplate { name, source } = template;

        self.env
            .add_template_owned(name.clone(), source)
            .map_err(|e| PmError::InvalidTemplate {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        if !self.names.contains(&name) {
            self.names.push(name);
        }
        Ok(())
    }

    /// Load all `.j2` / `.jinja` templates from a directory.
    ///
    /// Template names are derived from the path relative to `dir` with
    /// the extension stripped, so `<dir>/grade/rubric.j2` registers as
    /// `grade/rubric`. Subdirectories are walked recursively.
    ///
    /// # Errors
    ///
    /// Returns `PmError::Io` if the directory cannot be read, or
    /// `PmError::InvalidTemplate` if a file fails to parse.
    pub fn load_dir(&mut self, dir: &Path) -> Result<(), PmError> {
        self.load_dir_inner(dir, dir)
    }

    fn load_dir_inner(&mut self, root: &Path, dir: &Path) -> Result<(), PmError> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir() {
                self.load_dir_inner(root, &path)?;
                continue;
            }

            let is_template = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("j2") | Some("jinja")
            );
            if !is_template {
                continue;
            }

            let name = template_name(root, &path);
            let source = std::fs::read_to_string(&path)?;

            debug!(name = %name, path = %path.display(), "loaded template override");
            self.add_template(PromptTemplate { name, source })?;
        }
        Ok(())
    }

    /// Render a template by name with the given context.
    ///
    /// # Errors
    ///
    /// Returns `PmError::TemplateNotFound` if no template with that
    /// name is registered, or `PmError::Render` if rendering fails
    /// (e.g., an undefined variable in strict mode).
    pub fn render(&self, name: &str, ctx: &serde_json::Value) -> Result<String, PmError> {
        let template = self
            .env
            .get_template(name)
            .map_err(|_| PmError::TemplateNotFound(name.to_owned()))?;

        template.render(ctx).map_err(|e| PmError::Render {
            name: name.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Returns the names of all registered templates.
    pub fn list_templates(&self) -> &[String] {
        &self.names
    }
}

/// Derive a template name from a file path relative to the load root.
///
/// Names always use forward slashes so lookups are stable across
/// platforms.
fn template_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .with_extension("")
        .to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "/")
}

//! Template registry: id to definition mapping plus the process-wide instance.
//!
//! Registration happens at startup, before any binding. Entries are never
//! removed. Binding clones the definition, so bound templates never observe
//! later registrations.

use std::collections::HashMap;
use std::sync::{LazyLock, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::builtin::builtin_templates;
use crate::config::BindOptions;
use crate::encoder::BoundTemplate;
use crate::error::{Result, TemplateError};
use crate::template::TemplateDefinition;
use crate::Tokenizer;

/// Hints attached to a registered template for the training loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateMeta {
    /// Only meaningful without a response (pretraining-style prompts).
    pub generation_only: bool,
    /// Encode lazily in the data loader (media-heavy families).
    pub lazy_tokenize: bool,
    pub dataloader_num_workers: Option<usize>,
    pub dataloader_pin_memory: Option<bool>,
}

impl TemplateMeta {
    pub fn generation_only() -> Self {
        Self {
            generation_only: true,
            ..Default::default()
        }
    }

    pub fn lazy() -> Self {
        Self {
            lazy_tokenize: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    definition: TemplateDefinition,
    meta: TemplateMeta,
}

/// Templates keyed by id.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Entry>,
}

impl TemplateRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in catalog.
    pub fn with_builtins() -> Self {
        let templates = builtin_templates()
            .into_iter()
            .map(|(id, definition, meta)| (id.to_string(), Entry { definition, meta }))
            .collect();
        Self { templates }
    }

    /// Add `definition` under `id`. Re-registering an id needs `exist_ok`.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        definition: TemplateDefinition,
        meta: TemplateMeta,
        exist_ok: bool,
    ) -> Result<()> {
        let id = id.into();
        if !exist_ok && self.templates.contains_key(&id) {
            return Err(TemplateError::DuplicateTemplate(id));
        }
        if definition.default_system.is_some() && !definition.supports_system() {
            return Err(TemplateError::UnsupportedSystem(id));
        }
        info!(template = %id, strategy = definition.strategy.name(), "registered template");
        self.templates.insert(id, Entry { definition, meta });
        Ok(())
    }

    pub fn resolve(&self, id: &str) -> Result<&TemplateDefinition> {
        self.entry(id).map(|e| &e.definition)
    }

    pub fn meta(&self, id: &str) -> Result<&TemplateMeta> {
        self.entry(id).map(|e| &e.meta)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Bind the template `id` to `tokenizer`.
    pub fn bind<T: Tokenizer>(&self, id: &str, tokenizer: T, options: BindOptions) -> Result<BoundTemplate<T>> {
        let entry = self.entry(id)?;
        BoundTemplate::new(id, entry.definition.clone(), entry.meta.clone(), tokenizer, options)
    }

    fn entry(&self, id: &str) -> Result<&Entry> {
        self.templates
            .get(id)
            .ok_or_else(|| TemplateError::UnknownTemplate(id.to_string()))
    }
}

static REGISTRY: LazyLock<RwLock<TemplateRegistry>> =
    LazyLock::new(|| RwLock::new(TemplateRegistry::with_builtins()));

/// Register a template in the process-wide registry.
pub fn register_template(
    id: impl Into<String>,
    definition: TemplateDefinition,
    meta: TemplateMeta,
    exist_ok: bool,
) -> Result<()> {
    REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(id, definition, meta, exist_ok)
}

/// Bind a template from the process-wide registry.
pub fn get_template<T: Tokenizer>(id: &str, tokenizer: T, options: BindOptions) -> Result<BoundTemplate<T>> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .bind(id, tokenizer, options)
}

/// Ids in the process-wide registry, sorted.
pub fn template_ids() -> Vec<String> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .ids()
        .into_iter()
        .map(str::to_string)
        .collect()
}

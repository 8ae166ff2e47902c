//! Source of custom property definitions, keyed by target kind.

use crate::models::{Metadata, property::PropertyDefinition};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::{collections::BTreeMap, path::Path};

/// Field errors keyed by the full form key (`upload-3-title`).
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[async_trait]
pub trait PropertySchema: Send + Sync {
    async fn properties_for(&self, target_kind: &str) -> Result<Vec<PropertyDefinition>>;
}

/// Fixed list of definitions, usually loaded once from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct StaticPropertySchema {
    definitions: Vec<PropertyDefinition>,
}

impl StaticPropertySchema {
    pub fn new(definitions: Vec<PropertyDefinition>) -> Self {
        Self { definitions }
    }

    /// Read a JSON array of definitions.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading property schema {}", path.display()))?;
        let definitions: Vec<PropertyDefinition> = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing property schema {}", path.display()))?;
        tracing::info!("Loaded {} property definitions from {}", definitions.len(), path.display());
        Ok(Self::new(definitions))
    }
}

#[async_trait]
impl PropertySchema for StaticPropertySchema {
    async fn properties_for(&self, target_kind: &str) -> Result<Vec<PropertyDefinition>> {
        Ok(self
            .definitions
            .iter()
            .filter(|def| def.applies_to(target_kind))
            .cloned()
            .collect())
    }
}

/// Values under `prefix`, with the prefix stripped from each key.
pub fn extract_prefixed(values: &Metadata, prefix: &str) -> Metadata {
    values
        .iter()
        .filter_map(|(key, list)| {
            key.strip_prefix(prefix)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_string(), list.clone()))
        })
        .collect()
}

/// Validate the `<prefix><slug>` entries of `values` against every definition.
/// Errors are keyed by the full prefixed key.
pub fn validate_prefixed(
    definitions: &[PropertyDefinition],
    prefix: &str,
    values: &Metadata,
) -> FieldErrors {
    let mut errors = FieldErrors::new();
    for def in definitions {
        let key = format!("{}{}", prefix, def.slug);
        let submitted = values.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        if let Err(messages) = def.validate(submitted) {
            errors.insert(key, messages);
        }
    }
    errors
}

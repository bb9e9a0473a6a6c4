//! Resolution of template versions into deployable manifests.

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;

pub type Manifest = String;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("template version {0} not found")]
    NotFound(String),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CatalogResolver: Send + Sync {
    async fn resolve(&self, template_version_id: &str) -> Result<Manifest, CatalogError>;
}

/// Catalog backed by a fixed map, loaded from configuration.
#[derive(Default)]
pub struct StaticCatalog {
    entries: RwLock<IndexMap<String, Manifest>>,
}

impl StaticCatalog {
    pub fn new(entries: impl IntoIterator<Item = (String, Manifest)>) -> Self {
        StaticCatalog {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub fn insert(&self, template_version_id: &str, manifest: &str) {
        self.entries
            .write()
            .insert(template_version_id.to_string(), manifest.to_string());
    }
}

#[async_trait]
impl CatalogResolver for StaticCatalog {
    async fn resolve(&self, template_version_id: &str) -> Result<Manifest, CatalogError> {
        self.entries
            .read()
            .get(template_version_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(template_version_id.to_string()))
    }
}

use std::collections::HashMap;
use std::path::Path;
use serde::Deserialize;

/// Maps raw service type tokens to human-readable names. Lookups never fail:
/// unknown types resolve to themselves.
pub trait Catalog: Send + Sync {
    fn resolve_display_name(&self, service_type: &str) -> String;
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "service")]
    services: Vec<Mapping>,
}

#[derive(Debug, Deserialize)]
struct Mapping {
    service: String,
    name: String,
}

/// Catalog loaded once from a TOML mapping file:
///
/// ```toml
/// [[service]]
/// service = "_afpovertcp"
/// name = "AppleShare"
/// ```
#[derive(Debug, Default)]
pub struct FileCatalog {
    names: HashMap<String, String>,
}

impl FileCatalog {
    /// Load the mapping. A missing or malformed file yields an empty catalog
    /// so display names fall back to raw service types.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("Service catalog {} unavailable: {}", path.display(), e);
                return Self::default();
            }
        };

        match Self::parse(&contents) {
            Ok(catalog) => {
                tracing::info!("Loaded {} service names from {}", catalog.names.len(), path.display());
                catalog
            }
            Err(e) => {
                tracing::warn!("Failed to parse service catalog {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Later entries for the same service type win
    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        let file: CatalogFile = toml::from_str(contents)?;
        let names = file
            .services
            .into_iter()
            .map(|m| (m.service, m.name))
            .collect();
        Ok(Self { names })
    }
}

impl Catalog for FileCatalog {
    fn resolve_display_name(&self, service_type: &str) -> String {
        self.names
            .get(service_type)
            .cloned()
            .unwrap_or_else(|| service_type.to_string())
    }
}

//! Article retrieval sources.
//!
//! A source takes a query expression and a publication date window and
//! returns candidate articles. The pipeline only talks to sources through
//! [`ArticleSource`]; built-in sources are registered in a [`SourceRegistry`].

mod pubmed;
mod pubmed_xml;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use horizon_shared::{AppConfig, DateRange, HorizonError, Result, RetrievedArticle};

pub use pubmed::{PUBMED_SOURCE_ID, PubMedSource};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Articles returned by one search, plus how many the source says exist.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub articles: Vec<RetrievedArticle>,
    /// Total hits reported by the source; may exceed `articles.len()`.
    pub total_available: usize,
}

/// A searchable bibliographic source.
///
/// An empty result is a valid outcome, never an error.
#[async_trait]
pub trait ArticleSource: Send + Sync {
    /// Stable identifier stored on staging rows (e.g. `pubmed`).
    fn id(&self) -> &str;

    /// Search for articles published within `range`, returning at most `max_results`.
    async fn search(
        &self,
        query: &str,
        range: &DateRange,
        max_results: usize,
    ) -> Result<SearchOutcome>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Sources keyed by their id.
#[derive(Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn ArticleSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with all built-in sources configured from `config`.
    pub fn with_defaults(config: &AppConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(PubMedSource::from_config(&config.pubmed)?));
        Ok(registry)
    }

    /// Add a source, replacing any source with the same id.
    pub fn register(&mut self, source: Arc<dyn ArticleSource>) {
        self.sources.insert(source.id().to_string(), source);
    }

    /// Look up a source; unknown ids are a configuration error.
    pub fn get(&self, id: &str) -> Result<Arc<dyn ArticleSource>> {
        self.sources.get(id).cloned().ok_or_else(|| {
            HorizonError::config(format!(
                "unknown retrieval source '{id}' (available: {})",
                self.ids().join(", ")
            ))
        })
    }

    pub fn ids(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;

    #[async_trait]
    impl ArticleSource for Empty {
        fn id(&self) -> &str {
            "empty"
        }

        async fn search(&self, _: &str, _: &DateRange, _: usize) -> Result<SearchOutcome> {
            Ok(SearchOutcome::default())
        }
    }

    #[test]
    fn registry_lookup() {
        let mut registry = SourceRegistry::with_defaults(&AppConfig::default()).unwrap();
        registry.register(Arc::new(Empty));

        assert_eq!(registry.ids(), vec!["empty", "pubmed"]);
        assert_eq!(registry.get("empty").unwrap().id(), "empty");

        let err = registry.get("scholar").err().unwrap();
        assert_eq!(err.kind(), "ConfigError");
        assert!(err.to_string().contains("unknown retrieval source 'scholar'"));
    }
}

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::cache::{ManifestCache, QueryCache};
use crate::catalog::{Catalog, PatchCatalogEntry};
use crate::filter::{self, FilterKey, FilterSet};
use crate::source::PatchSource;

/// Fetch the catalog manifest, going through the disk cache when one is given.
/// With `offline` set, only the cache is consulted.
pub async fn load_catalog(
    source: &dyn PatchSource,
    manifest: &str,
    cache: Option<&ManifestCache>,
    offline: bool,
) -> Result<Catalog> {
    let key = source.describe(manifest);

    if let Some(bytes) = cache.and_then(|c| c.load(&key)) {
        info!("Using cached catalog for {}", key);
        return Catalog::from_json(&bytes).context("Cached catalog is invalid");
    }
    if offline {
        bail!("No cached catalog for {} (offline)", key);
    }

    info!("Fetching catalog {}", key);
    let bytes = source
        .fetch(manifest)
        .await
        .with_context(|| format!("Failed to load catalog from {}", key))?;
    let catalog = Catalog::from_json(&bytes).with_context(|| format!("Invalid catalog at {}", key))?;

    if let Some(cache) = cache {
        if let Err(e) = cache.store(&key, &bytes) {
            warn!("Failed to cache catalog: {:#}", e);
        }
    }
    if catalog.is_empty() {
        warn!("Catalog {} has no entries", key);
    }
    debug!("Catalog has {} entries", catalog.len());
    Ok(catalog)
}

/// A loaded catalog with memoized search and filter results.
pub struct Library {
    catalog: Catalog,
    search_cache: QueryCache<String, Vec<usize>>,
    filter_cache: QueryCache<FilterKey, Vec<usize>>,
}

impl Library {
    pub fn new(
        catalog: Catalog,
        search_cache: QueryCache<String, Vec<usize>>,
        filter_cache: QueryCache<FilterKey, Vec<usize>>,
    ) -> Self {
        Self {
            catalog,
            search_cache,
            filter_cache,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn search_indices(&mut self, query: &str) -> Vec<usize> {
        let key = query.trim().to_lowercase();
        if let Some(hit) = self.search_cache.get(&key) {
            debug!("Search cache hit for '{}'", key);
            return hit;
        }
        let indices: Vec<usize> = self
            .catalog
            .iter()
            .enumerate()
            .filter(|(_, e)| filter::matches_query(&key, e))
            .map(|(i, _)| i)
            .collect();
        self.search_cache.insert(key, indices.clone());
        indices
    }

    fn filter_indices(&mut self, filters: &FilterSet) -> Vec<usize> {
        if filters.is_empty() {
            return (0..self.catalog.len()).collect();
        }
        let key = filters.cache_key();
        if let Some(hit) = self.filter_cache.get(&key) {
            debug!("Filter cache hit");
            return hit;
        }
        let indices: Vec<usize> = self
            .catalog
            .iter()
            .enumerate()
            .filter(|(_, e)| filters.matches(e))
            .map(|(i, _)| i)
            .collect();
        self.filter_cache.insert(key, indices.clone());
        indices
    }

    /// Entries matching both the search text and the filters, in catalog order.
    pub fn query(&mut self, text: &str, filters: &FilterSet) -> Vec<&PatchCatalogEntry> {
        let searched = self.search_indices(text);
        let filtered = self.filter_indices(filters);
        let entries = self.catalog.entries();
        searched
            .into_iter()
            .filter(|i| filtered.binary_search(i).is_ok())
            .map(|i| &entries[i])
            .collect()
    }

    #[cfg(test)]
    pub fn cached_queries(&self) -> (usize, usize) {
        (self.search_cache.len(), self.filter_cache.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterField;
    use crate::source::LocalSource;
    use std::time::Duration;

    const MANIFEST: &str = r#"[
        {"id": "crystal-clear", "title": "Crystal Clear", "file": "a.bps", "type": "bps",
         "meta": {"system": "GBC", "author": "ShockSlayer", "tags": ["Open World"]}},
        {"id": "radical-red", "title": "Radical Red", "file": "b.ips", "type": "ips",
         "meta": {"system": "GBA", "baseRom": "FireRed", "tags": ["Difficulty"]}},
        {"id": "unbound", "title": "Unbound", "file": "c.bps", "type": "bps",
         "meta": {"system": "GBA", "baseRom": "FireRed", "tags": ["New Region"]}}
    ]"#;

    fn library() -> Library {
        Library::new(
            Catalog::from_json(MANIFEST.as_bytes()).unwrap(),
            QueryCache::default(),
            QueryCache::default(),
        )
    }

    #[test]
    fn test_query_combines_search_and_filters() {
        let mut lib = library();
        let mut filters = FilterSet::new();
        assert_eq!(lib.query("", &filters).len(), 3);

        filters.set(FilterField::System, "GBA", true);
        let ids: Vec<_> = lib.query("", &filters).iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["radical-red", "unbound"]);

        let ids: Vec<_> = lib.query("RED", &filters).iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["radical-red", "unbound"]);

        let ids: Vec<_> = lib.query("radical", &filters).iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["radical-red"]);
    }

    #[test]
    fn test_queries_are_memoized() {
        let mut lib = library();
        lib.query("Crystal", &FilterSet::new());
        assert_eq!(lib.cached_queries(), (1, 0));

        let mut filters = FilterSet::new();
        filters.set(FilterField::System, "GBC", true);
        assert_eq!(lib.query("Crystal", &filters).len(), 1);
        assert_eq!(lib.query("  crystal ", &filters).len(), 1);
        assert_eq!(lib.cached_queries(), (1, 1));
    }

    #[tokio::test]
    async fn test_load_catalog_uses_cache() {
        let site = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        std::fs::write(site.path().join("manifest.json"), MANIFEST).unwrap();

        let source = LocalSource::new(site.path());
        let cache = ManifestCache::new(cache_dir.path(), Duration::from_secs(3600));

        assert!(load_catalog(&source, "manifest.json", Some(&cache), true)
            .await
            .is_err());

        let catalog = load_catalog(&source, "manifest.json", Some(&cache), false)
            .await
            .unwrap();
        assert_eq!(catalog.len(), 3);

        // Served from the cache once the site copy is gone.
        std::fs::remove_file(site.path().join("manifest.json")).unwrap();
        let catalog = load_catalog(&source, "manifest.json", Some(&cache), true)
            .await
            .unwrap();
        assert_eq!(catalog.len(), 3);
        assert!(load_catalog(&source, "manifest.json", None, false)
            .await
            .is_err());
    }
}

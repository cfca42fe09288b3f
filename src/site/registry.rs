//! Registry of site adapters keyed by site id.

use std::collections::HashMap;
use std::sync::Arc;

use super::base::SiteAdapter;

/// Registry for site adapters.
///
/// Agents look up their adapter here when they are created.
pub struct SiteRegistry {
    sites: HashMap<String, Arc<dyn SiteAdapter>>,
}

impl SiteRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self {
            sites: HashMap::new(),
        }
    }

    /// Register an adapter. Replaces any existing adapter with the same id.
    pub fn register(&mut self, site: Arc<dyn SiteAdapter>) {
        let id = site.site_id().to_string();
        self.sites.insert(id, site);
    }

    /// Get an adapter by site id.
    pub fn get(&self, site_id: &str) -> Option<Arc<dyn SiteAdapter>> {
        self.sites.get(site_id).cloned()
    }

    /// Registered site ids, sorted.
    pub fn site_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sites.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

impl Default for SiteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

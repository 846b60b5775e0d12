//! Cache configuration.
//!
//! Resolved once at startup from [`crate::config::CacheSettings`]; nothing
//! here is re-read per request.

use std::sync::Arc;
use std::time::Duration;

use super::keys::{KeyBuilder, KeyVersion};
use super::routes::RouteTable;

/// Lifetime of every cache entry written by the proxy.
pub const ENTRY_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Version tag prefixed to every key.
    pub key_version: KeyVersion,
    /// Whitelist of cacheable resources.
    pub routes: Arc<RouteTable>,
    /// Expiry handed to the store on every write.
    pub entry_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_version: KeyVersion::default(),
            routes: Arc::new(RouteTable::default()),
            entry_ttl: ENTRY_TTL,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            key_version: settings.key_version.clone(),
            routes: Arc::new(settings.routes.clone()),
            entry_ttl: ENTRY_TTL,
        }
    }
}

impl CacheConfig {
    pub fn key_builder(&self) -> KeyBuilder {
        KeyBuilder::new(self.key_version.clone(), Arc::clone(&self.routes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.key_version.as_str(), "1");
        assert_eq!(config.entry_ttl, Duration::from_secs(1800));
        assert_eq!(config.routes.rules().len(), 2);
    }
}

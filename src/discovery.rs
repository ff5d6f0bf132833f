//! Provider discovery cache.
//!
//! Providers register themselves as percent-encoded URLs under a service
//! path in the coordination service, e.g.
//! `dubbo://10.0.0.5:20880/com.acme.FooService?methods=get,put&version=1.0.0`.
//! The registry client (an external collaborator owning watch and session
//! concerns) feeds raw child lists into [`DiscoveryCache::update_children`];
//! the orchestrator reads snapshots back through [`ProviderDiscovery`].
//!
//! Each cache entry carries an `updated_at` stamp that strictly increases
//! whenever the child list actually changes, giving callers a cheap
//! versioned-invalidation signal instead of a deep diff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::{DubboError, Result};

/// A remote provider endpoint, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
    /// Method names the provider advertises.
    pub methods: Vec<String>,
    pub version: String,
}

impl ServiceEndpoint {
    /// Connection-registry key for this endpoint.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Exact membership test against the advertised method set.
    pub fn supports_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// Parse one percent-encoded provider registration URL.
pub fn parse_provider_url(raw: &str) -> Result<ServiceEndpoint> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| DubboError::Protocol(format!("provider url is not utf-8: {e}")))?;
    let url = Url::parse(&decoded)
        .map_err(|e| DubboError::Protocol(format!("bad provider url {decoded:?}: {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| DubboError::Protocol(format!("provider url {decoded:?} has no host")))?
        .to_string();
    let port = url
        .port()
        .ok_or_else(|| DubboError::Protocol(format!("provider url {decoded:?} has no port")))?;

    let mut methods = Vec::new();
    let mut version = String::new();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "methods" => {
                methods = value
                    .split(',')
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "version" => version = value.into_owned(),
            _ => {}
        }
    }

    Ok(ServiceEndpoint {
        host,
        port,
        methods,
        version,
    })
}

/// One provider-list observation.
#[derive(Debug, Clone)]
pub struct ProviderSnapshot {
    pub providers: Vec<ServiceEndpoint>,
    /// Strictly increases whenever the underlying child list changes.
    pub updated_at: u64,
}

/// Read side of the discovery collaborator.
pub trait ProviderDiscovery: Send + Sync {
    /// Current providers registered under a service path.
    fn get_providers(&self, path: &str) -> Result<ProviderSnapshot>;
}

struct CacheEntry {
    providers: Vec<ServiceEndpoint>,
    /// Raw children as last observed, for change detection.
    children: Vec<String>,
    updated_at: u64,
}

/// Caches provider lists per service path.
#[derive(Default)]
pub struct DiscoveryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: AtomicU64,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the child list for a path, typically from a registry watch
    /// callback. Unparseable children are skipped with a warning. The
    /// `updated_at` stamp moves only when the list actually changed.
    pub fn update_children(&self, path: &str, children: &[String]) {
        let mut sorted: Vec<String> = children.to_vec();
        sorted.sort();

        let mut entries = self.entries.lock().expect("discovery cache poisoned");
        if let Some(entry) = entries.get(path) {
            if entry.children == sorted {
                return;
            }
        }

        let providers: Vec<ServiceEndpoint> = sorted
            .iter()
            .filter_map(|child| match parse_provider_url(child) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    tracing::warn!(path, child = child.as_str(), error = %e, "skipping unparseable provider");
                    None
                }
            })
            .collect();

        let updated_at = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(path, providers = providers.len(), updated_at, "provider list updated");
        entries.insert(
            path.to_string(),
            CacheEntry {
                providers,
                children: sorted,
                updated_at,
            },
        );
    }

    /// Number of cached paths.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("discovery cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProviderDiscovery for DiscoveryCache {
    fn get_providers(&self, path: &str) -> Result<ProviderSnapshot> {
        let entries = self.entries.lock().expect("discovery cache poisoned");
        let entry = entries
            .get(path)
            .ok_or_else(|| DubboError::NotFound(format!("no providers registered for {path}")))?;
        Ok(ProviderSnapshot {
            providers: entry.providers.clone(),
            updated_at: entry.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/dubbo/com.acme.FooService/providers";

    fn provider_url(host: &str, port: u16, methods: &str, version: &str) -> String {
        // Registrations arrive percent-encoded, as written by providers.
        format!(
            "dubbo%3A%2F%2F{host}%3A{port}%2Fcom.acme.FooService%3Fmethods%3D{methods}%26version%3D{version}"
        )
    }

    #[test]
    fn test_parse_provider_url() {
        let endpoint =
            parse_provider_url(&provider_url("10.0.0.5", 20880, "get%2Cput", "1.0.0")).unwrap();
        assert_eq!(endpoint.host, "10.0.0.5");
        assert_eq!(endpoint.port, 20880);
        assert_eq!(endpoint.methods, vec!["get", "put"]);
        assert_eq!(endpoint.version, "1.0.0");
        assert_eq!(endpoint.key(), "10.0.0.5:20880");
    }

    #[test]
    fn test_parse_provider_url_without_port_fails() {
        let err = parse_provider_url("dubbo://10.0.0.5/com.acme.FooService").unwrap_err();
        assert!(err.to_string().contains("no port"));
    }

    #[test]
    fn test_supports_method_is_exact() {
        let endpoint =
            parse_provider_url(&provider_url("h", 1, "getDict%2CcheckUnique", "1.0")).unwrap();
        assert!(endpoint.supports_method("getDict"));
        assert!(endpoint.supports_method("checkUnique"));
        // Substrings of advertised names must not match.
        assert!(!endpoint.supports_method("get"));
        assert!(!endpoint.supports_method("check"));
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        let cache = DiscoveryCache::new();
        assert!(matches!(
            cache.get_providers(PATH).unwrap_err(),
            DubboError::NotFound(_)
        ));
    }

    #[test]
    fn test_updated_at_bumps_only_on_change() {
        let cache = DiscoveryCache::new();
        let children = vec![provider_url("a", 1, "m", "1.0")];
        cache.update_children(PATH, &children);
        let first = cache.get_providers(PATH).unwrap().updated_at;

        // Same list again: stamp must not move.
        cache.update_children(PATH, &children);
        assert_eq!(cache.get_providers(PATH).unwrap().updated_at, first);

        // Changed list: stamp strictly increases.
        let changed = vec![
            provider_url("a", 1, "m", "1.0"),
            provider_url("b", 2, "m", "1.0"),
        ];
        cache.update_children(PATH, &changed);
        let second = cache.get_providers(PATH).unwrap();
        assert!(second.updated_at > first);
        assert_eq!(second.providers.len(), 2);
    }

    #[test]
    fn test_child_order_does_not_count_as_change() {
        let cache = DiscoveryCache::new();
        let a = provider_url("a", 1, "m", "1.0");
        let b = provider_url("b", 2, "m", "1.0");
        cache.update_children(PATH, &[a.clone(), b.clone()]);
        let first = cache.get_providers(PATH).unwrap().updated_at;
        cache.update_children(PATH, &[b, a]);
        assert_eq!(cache.get_providers(PATH).unwrap().updated_at, first);
    }

    #[test]
    fn test_unparseable_children_are_skipped() {
        let cache = DiscoveryCache::new();
        cache.update_children(
            PATH,
            &["not a url".to_string(), provider_url("a", 1, "m", "1.0")],
        );
        let snapshot = cache.get_providers(PATH).unwrap();
        assert_eq!(snapshot.providers.len(), 1);
        assert_eq!(snapshot.providers[0].host, "a");
    }
}

//! Plugin metadata cache
//!
//! [`MetadataCache`] keeps two views of the registry keyed by internal name:
//!
//! - **direct**: registry entries merged with their live manifest and install count
//! - **proxied**: the same records with readme URLs rewritten to this service
//!
//! Refresh sweeps walk the registry in order, one plugin at a time. Each entry is replaced
//! wholesale with a single map insert, so readers see either the old or the new record
//! and never block on a sweep. Concurrent stale checks are coalesced: a caller that had
//! to wait for an in-flight sweep returns once that sweep finishes instead of starting
//! another one.

use crate::counter::CounterStore;
use crate::error::{FetchError, ProxyError, Result};
use crate::registry::{PluginRecord, ProxiedPluginRecord, Registry, RegistryEntry};
use crate::state::Metrics;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod rewrite;
pub mod source;
pub mod warmer;

pub use rewrite::derive_proxied;
pub use source::{parse_manifest, HttpManifestSource, ManifestSource};
pub use warmer::CacheWarmer;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Public address of this service, used as the root of rewritten URLs.
    pub base_address: String,
    pub refresh_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Cache was fresh, nothing to do.
    Fresh,
    /// Another sweep finished while this caller waited.
    Coalesced,
    Refreshed,
}

struct RefreshStamp {
    instant: Instant,
    at: DateTime<Utc>,
}

pub struct MetadataCache {
    registry: Arc<Registry>,
    source: Arc<dyn ManifestSource>,
    counters: Arc<dyn CounterStore>,
    settings: CacheSettings,
    metrics: Arc<Metrics>,
    direct: DashMap<String, PluginRecord>,
    proxied: DashMap<String, ProxiedPluginRecord>,
    last_refresh: ArcSwapOption<RefreshStamp>,
    sweep_lock: Mutex<()>,
    sweeps_completed: AtomicU64,
}

impl MetadataCache {
    pub fn new(
        registry: Arc<Registry>,
        source: Arc<dyn ManifestSource>,
        counters: Arc<dyn CounterStore>,
        settings: CacheSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            source,
            counters,
            settings,
            metrics,
            direct: DashMap::new(),
            proxied: DashMap::new(),
            last_refresh: ArcSwapOption::empty(),
            sweep_lock: Mutex::new(()),
            sweeps_completed: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn counters(&self) -> &Arc<dyn CounterStore> {
        &self.counters
    }

    pub fn base_address(&self) -> &str {
        &self.settings.base_address
    }

    /// True before the first sweep and once the refresh interval has elapsed.
    pub fn is_stale(&self) -> bool {
        match self.last_refresh.load().as_ref() {
            Some(stamp) => stamp.instant.elapsed() >= self.settings.refresh_interval,
            None => true,
        }
    }

    pub fn last_refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.last_refresh.load().as_ref().map(|stamp| stamp.at)
    }

    pub async fn refresh_if_stale(&self, force: bool) -> RefreshOutcome {
        if !force && !self.is_stale() {
            return RefreshOutcome::Fresh;
        }

        let observed = self.sweeps_completed.load(Ordering::Acquire);
        let _guard = self.sweep_lock.lock().await;
        if self.sweeps_completed.load(Ordering::Acquire) != observed {
            debug!("Refresh satisfied by a concurrent sweep");
            self.metrics.record_coalesced_refresh();
            return RefreshOutcome::Coalesced;
        }

        self.sweep().await;
        RefreshOutcome::Refreshed
    }

    /// Refresh every registry entry unconditionally.
    pub async fn full_refresh(&self) {
        let _guard = self.sweep_lock.lock().await;
        self.sweep().await;
    }

    async fn sweep(&self) {
        info!("Refreshing {} plugins", self.registry.len());
        for entry in self.registry.iter() {
            self.refresh_entry(entry).await;
        }

        self.last_refresh.store(Some(Arc::new(RefreshStamp {
            instant: Instant::now(),
            at: Utc::now(),
        })));
        self.sweeps_completed.fetch_add(1, Ordering::AcqRel);
        self.metrics.record_refresh_sweep(self.direct.len());
        info!("Plugin registry updated ({} records)", self.direct.len());
    }

    /// Re-fetch a single plugin. Only names present in the registry are accepted.
    pub async fn refresh_one(&self, internal_name: &str) -> Result<()> {
        let entry = self
            .registry
            .get(internal_name)
            .ok_or_else(|| ProxyError::PluginNotFound(internal_name.to_string()))?;
        self.refresh_entry(entry).await;
        Ok(())
    }

    async fn refresh_entry(&self, entry: &RegistryEntry) {
        let name = &entry.internal_name;
        let record = match self.source.fetch(&entry.module_url).await {
            Ok(manifest) => {
                debug!(plugin = %name, "Fetched manifest");
                PluginRecord::from_manifest(entry, manifest, self.downloads(name).await)
            }
            Err(e) => {
                warn!(plugin = %name, error = %e, "Update plugin failed, using registry defaults");
                if let FetchError::Malformed { body, .. } = &e {
                    debug!(plugin = %name, body = %body, "Rejected manifest body");
                }
                self.metrics.record_fetch_failure();
                PluginRecord::degraded(entry, self.downloads(name).await)
            }
        };

        self.direct.insert(name.clone(), record);
        self.update_proxied(name);
    }

    fn update_proxied(&self, internal_name: &str) {
        let Some(record) = self.direct.get(internal_name).map(|r| r.value().clone()) else {
            return;
        };
        let proxied = derive_proxied(&record, &self.settings.base_address);
        self.proxied.insert(internal_name.to_string(), proxied);
    }

    async fn downloads(&self, internal_name: &str) -> u64 {
        match self.counters.get(internal_name).await {
            Ok(count) => count,
            Err(e) => {
                warn!(plugin = %internal_name, error = %e, "Failed to read install count");
                0
            }
        }
    }

    /// Count an install and bring the cached download count in line with the store.
    pub async fn record_install(&self, internal_name: &str) -> Result<u64> {
        if !self.registry.contains(internal_name) {
            return Err(ProxyError::PluginNotFound(internal_name.to_string()));
        }

        let count = self.counters.increment(internal_name).await?;
        self.metrics.record_install();
        info!(plugin = %internal_name, installs = count, "Recorded install");

        self.refresh_one(internal_name).await?;
        Ok(count)
    }

    /// Direct records in registry order.
    pub fn get_direct(&self) -> Vec<PluginRecord> {
        self.registry
            .iter()
            .filter_map(|entry| self.direct.get(&entry.internal_name))
            .map(|record| record.value().clone())
            .collect()
    }

    /// Proxied records in registry order.
    pub fn get_proxied(&self) -> Vec<ProxiedPluginRecord> {
        self.registry
            .iter()
            .filter_map(|entry| self.proxied.get(&entry.internal_name))
            .map(|record| record.value().clone())
            .collect()
    }

    pub fn get(&self, internal_name: &str) -> Option<PluginRecord> {
        self.direct.get(internal_name).map(|r| r.value().clone())
    }

    pub fn get_proxied_record(&self, internal_name: &str) -> Option<ProxiedPluginRecord> {
        self.proxied.get(internal_name).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.direct.len()
    }

    pub fn is_empty(&self) -> bool {
        self.direct.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{MemoryCounterStore, MockCounterStore};
    use crate::error::CounterError;
    use crate::registry::Manifest;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Serves canned manifests; URLs without one fail like an unreachable host.
    #[derive(Default)]
    struct FakeSource {
        manifests: DashMap<String, Manifest>,
        fetches: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FakeSource {
        fn with(self, url: &str, name: &str, version: &str) -> Self {
            self.manifests.insert(
                url.to_string(),
                Manifest {
                    name: Some(name.to_string()),
                    version: Some(version.to_string()),
                    ..Default::default()
                },
            );
            self
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ManifestSource for FakeSource {
        async fn fetch(&self, url: &str) -> std::result::Result<Manifest, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.manifests
                .get(url)
                .map(|m| m.value().clone())
                .ok_or_else(|| FetchError::Request(format!("connection refused: {}", url)))
        }
    }

    fn registry() -> Arc<Registry> {
        Arc::new(
            Registry::from_json(
                r#"[
                    {"InternalName": "alpha", "Module": "https://h/alpha/module.json", "Readme": "https://h/alpha/README.md"},
                    {"InternalName": "beta", "Module": "https://h/beta/module.json", "ImageUrl": "https://h/beta.png"}
                ]"#,
            )
            .unwrap(),
        )
    }

    fn settings(refresh_interval: Duration) -> CacheSettings {
        CacheSettings {
            base_address: "https://svc".to_string(),
            refresh_interval,
        }
    }

    fn cache_with(
        source: Arc<FakeSource>,
        counters: Arc<dyn CounterStore>,
        refresh_interval: Duration,
    ) -> MetadataCache {
        MetadataCache::new(
            registry(),
            source,
            counters,
            settings(refresh_interval),
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn test_sweep_populates_every_entry() {
        let source = Arc::new(FakeSource::default().with(
            "https://h/alpha/module.json",
            "Alpha",
            "2.1",
        ));
        let cache = cache_with(source, Arc::new(MemoryCounterStore::new()), Duration::from_secs(100));
        assert!(cache.is_empty());

        assert_eq!(cache.refresh_if_stale(false).await, RefreshOutcome::Refreshed);

        let direct = cache.get_direct();
        let names: Vec<_> = direct.iter().map(|r| r.internal_name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(direct[0].display_name, "Alpha");
        assert_eq!(direct[0].version, "2.1");

        let proxied = cache.get_proxied();
        assert_eq!(proxied.len(), direct.len());
        for (d, p) in direct.iter().zip(proxied.iter()) {
            assert_eq!(d.internal_name(), p.record().internal_name());
        }
        assert!(cache.last_refreshed_at().is_some());
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_downloads() {
        let counters = Arc::new(MemoryCounterStore::new());
        counters.set("beta", 9).await.unwrap();
        let cache = cache_with(
            Arc::new(FakeSource::default()),
            counters,
            Duration::from_secs(100),
        );

        cache.full_refresh().await;

        let beta = cache.get("beta").unwrap();
        assert_eq!(beta.display_name, "beta");
        assert_eq!(beta.version, "0.0");
        assert_eq!(beta.min_version, "0.0");
        assert_eq!(beta.downloads, 9);
        assert_eq!(beta.entry.image_url.as_deref(), Some("https://h/beta.png"));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_counter_failure_reads_as_zero() {
        let mut counters = MockCounterStore::new();
        counters
            .expect_get()
            .returning(|_| Err(CounterError::Unavailable("down".to_string())));
        let cache = cache_with(
            Arc::new(FakeSource::default()),
            Arc::new(counters),
            Duration::from_secs(100),
        );

        cache.full_refresh().await;
        assert_eq!(cache.get("alpha").unwrap().downloads, 0);
    }

    #[tokio::test]
    async fn test_fresh_cache_is_not_refetched() {
        let source = Arc::new(FakeSource::default());
        let cache = cache_with(
            source.clone(),
            Arc::new(MemoryCounterStore::new()),
            Duration::from_secs(100),
        );

        cache.refresh_if_stale(false).await;
        assert_eq!(cache.refresh_if_stale(false).await, RefreshOutcome::Fresh);
        assert_eq!(source.fetches(), 2);

        assert_eq!(cache.refresh_if_stale(true).await, RefreshOutcome::Refreshed);
        assert_eq!(source.fetches(), 4);
    }

    #[tokio::test]
    async fn test_zero_interval_is_always_stale() {
        let source = Arc::new(FakeSource::default());
        let cache = cache_with(
            source.clone(),
            Arc::new(MemoryCounterStore::new()),
            Duration::ZERO,
        );

        cache.refresh_if_stale(false).await;
        assert!(cache.is_stale());
        assert_eq!(cache.refresh_if_stale(false).await, RefreshOutcome::Refreshed);
    }

    #[tokio::test]
    async fn test_concurrent_stale_checks_share_one_sweep() {
        let source = Arc::new(FakeSource {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let cache = Arc::new(cache_with(
            source.clone(),
            Arc::new(MemoryCounterStore::new()),
            Duration::from_secs(100),
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.refresh_if_stale(false).await })
            })
            .collect();

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        let refreshed = outcomes
            .iter()
            .filter(|o| **o == RefreshOutcome::Refreshed)
            .count();
        assert_eq!(refreshed, 1);
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_record_install_increments_once() {
        let mut counters = MockCounterStore::new();
        counters
            .expect_increment()
            .withf(|name| name.to_string() == "alpha")
            .times(1)
            .returning(|_| Ok(42));
        counters.expect_get().returning(|_| Ok(42));
        let cache = cache_with(
            Arc::new(FakeSource::default()),
            Arc::new(counters),
            Duration::from_secs(100),
        );
        cache.full_refresh().await;

        assert_eq!(cache.record_install("alpha").await.unwrap(), 42);
        assert_eq!(cache.get("alpha").unwrap().downloads, 42);
        assert_eq!(cache.get_proxied_record("alpha").unwrap().record().downloads, 42);
    }

    #[tokio::test]
    async fn test_record_install_unknown_plugin() {
        let mut counters = MockCounterStore::new();
        counters.expect_increment().times(0);
        counters.expect_get().returning(|_| Ok(1));
        let cache = cache_with(
            Arc::new(FakeSource::default()),
            Arc::new(counters),
            Duration::from_secs(100),
        );
        cache.full_refresh().await;
        let before = cache.get_direct();

        let err = cache.record_install("unknown-plugin").await.unwrap_err();
        assert!(matches!(err, ProxyError::PluginNotFound(_)));
        assert_eq!(cache.get_direct(), before);
        assert!(cache.get("unknown-plugin").is_none());
    }

    #[tokio::test]
    async fn test_refresh_one_rejects_unknown_name() {
        let cache = cache_with(
            Arc::new(FakeSource::default()),
            Arc::new(MemoryCounterStore::new()),
            Duration::from_secs(100),
        );
        assert!(cache.refresh_one("nope").await.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_one_updates_both_views() {
        let source = Arc::new(FakeSource::default().with(
            "https://h/alpha/module.json",
            "Alpha",
            "1.0",
        ));
        let cache = cache_with(
            source,
            Arc::new(MemoryCounterStore::new()),
            Duration::from_secs(100),
        );

        cache.refresh_one("alpha").await.unwrap();

        assert_eq!(cache.len(), 1);
        let proxied = cache.get_proxied_record("alpha").unwrap();
        assert_eq!(
            proxied.record().entry.readme_url.as_deref(),
            Some("https://svc/plugin/alpha/readme/README.md")
        );
        assert_eq!(
            cache.get("alpha").unwrap().entry.readme_url.as_deref(),
            Some("https://h/alpha/README.md")
        );
    }
}

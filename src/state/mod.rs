use crate::cache::{CacheSettings, CacheWarmer, HttpManifestSource, ManifestSource, MetadataCache};
use crate::config::{Config, CounterBackend, CounterConfig};
use crate::counter::{CounterStore, MemoryCounterStore, SqliteCounterStore};
use crate::error::{ProxyError, Result};
use crate::proxy::{ManifestIngest, OriginStreamer};
use crate::registry::Registry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

pub mod metrics;

pub use metrics::{Metrics, RequestTimer};

/// Everything a request handler needs, built once at startup.
pub struct AppState {
    pub config: Config,
    pub cache: Arc<MetadataCache>,
    pub streamer: Arc<OriginStreamer>,
    pub ingest: Arc<ManifestIngest>,
    pub counters: Arc<dyn CounterStore>,
    pub metrics: Arc<Metrics>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Load the registry, open the counter backend and wire the HTTP client.
    pub async fn from_config(config: Config) -> Result<(Arc<Self>, broadcast::Receiver<()>)> {
        let registry = Registry::load(&config.registry.path).await?;

        let counters = open_counter_store(&config.counters)?;
        let client = build_client(&config)?;
        let source = Arc::new(HttpManifestSource::new(
            client.clone(),
            config.registry.fetch_timeout(),
        ));

        Ok(Self::assemble(config, registry, source, counters, client))
    }

    /// Build state around caller-supplied collaborators.
    pub fn with_parts(
        config: Config,
        registry: Registry,
        source: Arc<dyn ManifestSource>,
        counters: Arc<dyn CounterStore>,
    ) -> Result<(Arc<Self>, broadcast::Receiver<()>)> {
        let client = build_client(&config)?;
        Ok(Self::assemble(config, registry, source, counters, client))
    }

    fn assemble(
        config: Config,
        registry: Registry,
        source: Arc<dyn ManifestSource>,
        counters: Arc<dyn CounterStore>,
        client: reqwest::Client,
    ) -> (Arc<Self>, broadcast::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let metrics = Arc::new(Metrics::new());

        let cache = Arc::new(MetadataCache::new(
            Arc::new(registry),
            source,
            counters.clone(),
            CacheSettings {
                base_address: config.server.base_address(),
                refresh_interval: config.registry.refresh_interval(),
            },
            metrics.clone(),
        ));
        let streamer = Arc::new(OriginStreamer::new(client, config.proxy.max_tap_bytes));
        let ingest = Arc::new(ManifestIngest::new(cache.clone(), metrics.clone()));

        let state = Arc::new(Self {
            config,
            cache,
            streamer,
            ingest,
            counters,
            metrics,
            shutdown_tx,
        });

        (state, shutdown_rx)
    }

    /// Start the background warmer when enabled in config.
    pub fn spawn_warmer(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.registry.background_refresh {
            return None;
        }

        let warmer = CacheWarmer::new(
            self.cache.clone(),
            self.config.registry.refresh_interval(),
            self.shutdown_tx.subscribe(),
        );
        Some(tokio::spawn(warmer.run()))
    }
}

pub fn open_counter_store(config: &CounterConfig) -> Result<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match config.backend {
        CounterBackend::Memory => Arc::new(MemoryCounterStore::new()),
        CounterBackend::Sqlite => Arc::new(SqliteCounterStore::open(&config.sqlite_path)?),
    };
    info!("Using {} counter store", store.backend_name());
    Ok(store)
}

fn build_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.proxy.connect_timeout())
        .build()
        .map_err(|e| ProxyError::Origin(format!("failed to build HTTP client: {}", e)))
}

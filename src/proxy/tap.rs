use super::streamer::ResponseTap;
use crate::cache::{parse_manifest, MetadataCache};
use crate::state::Metrics;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Feeds manifests seen on the proxy path back into the cache.
pub struct ManifestIngest {
    cache: Arc<MetadataCache>,
    metrics: Arc<Metrics>,
}

impl ManifestIngest {
    pub fn new(cache: Arc<MetadataCache>, metrics: Arc<Metrics>) -> Self {
        Self { cache, metrics }
    }
}

#[async_trait]
impl ResponseTap for ManifestIngest {
    async fn on_body(&self, body: Bytes) {
        debug!(bytes = body.len(), "Ingesting tapped manifest");

        let manifest = match parse_manifest(&body) {
            Ok(manifest) => manifest,
            Err(e) => {
                error!(error = %e, "Failed to parse proxied manifest");
                debug!(body = %String::from_utf8_lossy(&body), "Rejected tapped body");
                self.metrics.record_tap(false);
                return;
            }
        };

        let Some(name) = manifest.name.filter(|name| !name.is_empty()) else {
            error!("Proxied manifest has no Name");
            self.metrics.record_tap(false);
            return;
        };

        match self.cache.refresh_one(&name).await {
            Ok(()) => {
                info!(plugin = %name, "Refreshed plugin from proxied manifest");
                self.metrics.record_tap(true);
            }
            Err(e) => {
                warn!(plugin = %name, error = %e, "Ignoring proxied manifest");
                self.metrics.record_tap(false);
            }
        }
    }
}

use crate::error::FetchError;
use crate::registry::Manifest;
use async_trait::async_trait;
use std::time::Duration;

/// Where the cache engine obtains plugin manifests from.
#[async_trait]
pub trait ManifestSource: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<Manifest, FetchError>;
}

/// Fetches manifests over HTTP(S), following redirects.
pub struct HttpManifestSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpManifestSource {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch(&self, url: &str) -> Result<Manifest, FetchError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(timeout_ms)
                } else {
                    FetchError::from(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(timeout_ms)
            } else {
                FetchError::from(e)
            }
        })?;
        parse_manifest(&body)
    }
}

/// Decode a manifest body. Anything other than a JSON object of the expected shape is
/// reported as [`FetchError::Malformed`] together with the raw text.
pub fn parse_manifest(body: &[u8]) -> Result<Manifest, FetchError> {
    let malformed = |reason: String| FetchError::Malformed {
        reason,
        body: String::from_utf8_lossy(body).into_owned(),
    };

    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(malformed("manifest is not a JSON object".to_string()));
    }
    serde_json::from_value(value).map_err(|e| malformed(e.to_string()))
}

//! Maps `/plugin/{name}/{part}/{sub_path}` onto origin URLs.

use crate::error::{ProxyError, Result};
use crate::registry::Registry;
use crate::url_path::sibling;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetPart {
    Readme,
    Module,
}

impl AssetPart {
    pub fn parse(part: &str) -> Option<Self> {
        if part.eq_ignore_ascii_case("readme") {
            Some(AssetPart::Readme)
        } else if part.eq_ignore_ascii_case("module") {
            Some(AssetPart::Module)
        } else {
            None
        }
    }
}

/// Where an asset request goes, and whether its body feeds the manifest ingest tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRoute {
    pub target: String,
    pub tap_manifest: bool,
}

impl AssetRoute {
    fn plain(target: String) -> Self {
        Self {
            target,
            tap_manifest: false,
        }
    }
}

pub fn resolve_asset_request(
    registry: &Registry,
    plugin_name: &str,
    part: &str,
    sub_path: &str,
) -> Result<AssetRoute> {
    let entry = registry
        .get(plugin_name)
        .ok_or_else(|| ProxyError::PluginNotFound(plugin_name.to_string()))?;

    match AssetPart::parse(part) {
        Some(AssetPart::Readme) => {
            let readme_url =
                entry
                    .readme_url
                    .as_deref()
                    .ok_or_else(|| ProxyError::MissingAsset {
                        plugin: plugin_name.to_string(),
                        asset: "readme",
                    })?;
            if sub_path.to_ascii_lowercase().ends_with("readme.md") {
                Ok(AssetRoute::plain(readme_url.to_string()))
            } else {
                Ok(AssetRoute::plain(sibling(readme_url, sub_path)))
            }
        }
        Some(AssetPart::Module) => {
            let candidate = sibling(&entry.module_url, sub_path);
            if candidate.eq_ignore_ascii_case(&entry.module_url) {
                Ok(AssetRoute {
                    target: entry.module_url.clone(),
                    tap_manifest: true,
                })
            } else {
                Ok(AssetRoute::plain(candidate))
            }
        }
        None => Err(ProxyError::UnknownAssetPart {
            plugin: plugin_name.to_string(),
            part: part.to_string(),
        }),
    }
}

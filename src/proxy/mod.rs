//! Asset pass-through to plugin origins.

pub mod assets;
pub mod streamer;
pub mod tap;

pub use assets::{resolve_asset_request, AssetPart, AssetRoute};
pub use streamer::{ForwardRequest, ForwardedResponse, OriginStreamer, ResponseTap};
pub use tap::ManifestIngest;

use super::{error_reply, import_key_auth, status_for};
use crate::counter::{ImportOutcome, InstallEntry};
use crate::error::{CounterError, ProxyError, Result};
use crate::proxy::{resolve_asset_request, ForwardRequest, ResponseTap};
use crate::state::{AppState, RequestTimer};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::hyper::Body;
use warp::path::Tail;
use warp::{Filter, Rejection, Reply};

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let plugins = plugins_route(state.clone());
    let install = install_route(state.clone());
    let asset = asset_route(state.clone());
    let installs = installs_route(state.clone());
    let import = import_route(state.clone());
    let ping = warp::path!("ping").and(warp::get()).map(|| "pong");
    let health = health_route(state.clone());
    let metrics = metrics_route(state);

    // install must be tried before the catch-all asset route
    plugins
        .or(install)
        .or(asset)
        .or(installs)
        .or(import)
        .or(ping)
        .or(health)
        .or(metrics)
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PluginsQuery {
    proxy: Option<String>,
    refresh_cache: Option<String>,
}

impl PluginsQuery {
    fn proxied(&self) -> bool {
        self.proxy.as_deref() == Some("true")
    }

    fn force_refresh(&self) -> bool {
        self.refresh_cache
            .as_deref()
            .map_or(false, |value| !value.is_empty())
    }
}

fn plugins_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("plugins")
        .and(warp::get())
        .and(warp::query::<PluginsQuery>())
        .and(with_state(state))
        .and_then(list_plugins)
}

fn install_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("plugin" / String / "install")
        .and(warp::post())
        .and(with_state(state))
        .and_then(record_install)
}

fn asset_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("plugin")
        .and(warp::path::param::<String>())
        .and(warp::path::param::<String>())
        .and(warp::path::tail())
        .and(warp::method())
        .and(warp::header::headers_cloned())
        .and(limited_body(state.config.proxy.max_request_bytes))
        .and(with_state(state))
        .and_then(proxy_asset)
}

/// Buffers the request body, rejecting it once it grows past `limit` bytes.
///
/// Unlike `warp::body::content_length_limit`, requests without a `Content-Length`
/// (plain GETs, chunked uploads) are accepted and counted as they arrive.
fn limited_body(limit: u64) -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    warp::header::optional::<u64>("content-length")
        .and(warp::body::stream())
        .and_then(move |declared: Option<u64>, body| read_body(declared, body, limit))
}

async fn read_body<S, B>(
    declared: Option<u64>,
    body: S,
    limit: u64,
) -> std::result::Result<Bytes, Rejection>
where
    S: Stream<Item = std::result::Result<B, warp::Error>>,
    B: Buf,
{
    if declared.is_some_and(|len| len > limit) {
        return Err(warp::reject::custom(ProxyError::PayloadTooLarge(limit)));
    }

    let mut body = Box::pin(body);
    let mut collected = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk
            .map_err(|e| warp::reject::custom(ProxyError::InvalidRequest(e.to_string())))?;
        if (collected.len() + chunk.remaining()) as u64 > limit {
            return Err(warp::reject::custom(ProxyError::PayloadTooLarge(limit)));
        }
        collected.put(chunk);
    }
    Ok(collected.freeze())
}

fn installs_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("installs")
        .and(warp::get())
        .and(with_state(state))
        .and_then(list_installs)
}

fn import_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("import" / String)
        .and(warp::post())
        .and(import_key_auth(state.config.import.key.clone()))
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(import_installs)
}

fn health_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("health")
        .and(warp::get())
        .and(with_state(state))
        .and_then(health)
}

fn metrics_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_metrics)
}

async fn list_plugins(
    query: PluginsQuery,
    state: Arc<AppState>,
) -> std::result::Result<impl Reply, Rejection> {
    state.cache.refresh_if_stale(query.force_refresh()).await;

    if query.proxied() {
        Ok(warp::reply::json(&state.cache.get_proxied()))
    } else {
        Ok(warp::reply::json(&state.cache.get_direct()))
    }
}

async fn record_install(
    name: String,
    state: Arc<AppState>,
) -> std::result::Result<warp::reply::Response, Rejection> {
    match state.cache.record_install(&name).await {
        Ok(count) => Ok(warp::reply::json(&count).into_response()),
        Err(e) => {
            warn!(plugin = %name, error = %e, "Install report rejected");
            Ok(error_reply(e.to_string(), status_for(&e)))
        }
    }
}

async fn proxy_asset(
    name: String,
    part: String,
    tail: Tail,
    method: warp::http::Method,
    headers: warp::http::HeaderMap,
    body: Bytes,
    state: Arc<AppState>,
) -> std::result::Result<warp::reply::Response, Rejection> {
    let request_id = Uuid::new_v4();
    let span = info_span!("asset", %request_id, plugin = %name, part = %part);

    let result = async {
        tokio::time::sleep(state.config.proxy.asset_delay()).await;
        forward_asset(&state, &name, &part, tail.as_str(), method, headers, body).await
    }
    .instrument(span)
    .await;

    match result {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!(%request_id, plugin = %name, error = %e, "Asset request failed");
            Ok(error_reply(e.to_string(), status_for(&e)))
        }
    }
}

async fn forward_asset(
    state: &AppState,
    name: &str,
    part: &str,
    sub_path: &str,
    method: warp::http::Method,
    headers: warp::http::HeaderMap,
    body: Bytes,
) -> Result<warp::reply::Response> {
    let route = resolve_asset_request(state.cache.registry(), name, part, sub_path)?;
    let tap: Option<Arc<dyn ResponseTap>> = if route.tap_manifest {
        Some(state.ingest.clone() as Arc<dyn ResponseTap>)
    } else {
        None
    };

    let request = ForwardRequest {
        method: reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?,
        headers: to_client_headers(&headers),
        body,
    };

    let timer = RequestTimer::new(state.metrics.clone());
    let forwarded = match state.streamer.forward(&route.target, request, tap).await {
        Ok(forwarded) => {
            timer.finish();
            forwarded
        }
        Err(e) => {
            timer.fail();
            return Err(e);
        }
    };

    let mut response = warp::http::Response::builder().status(forwarded.status.as_u16());
    for (name, value) in forwarded.headers.iter() {
        response = response.header(name.as_str(), value.as_bytes());
    }
    response
        .body(Body::wrap_stream(forwarded.body))
        .map_err(|e| ProxyError::Origin(format!("invalid origin response: {}", e)))
}

/// Re-encodes server-side headers for the outbound client.
fn to_client_headers(headers: &warp::http::HeaderMap) -> reqwest::header::HeaderMap {
    let mut converted = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes());
        let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes());
        if let (Ok(name), Ok(value)) = (name, value) {
            converted.append(name, value);
        }
    }
    converted
}

async fn list_installs(
    state: Arc<AppState>,
) -> std::result::Result<warp::reply::Response, Rejection> {
    match state.counters.list_installs().await {
        Ok(installs) => Ok(warp::reply::json(&installs).into_response()),
        Err(e) => {
            warn!(error = %e, "Failed to list installs");
            Ok(error_reply(
                e.to_string(),
                StatusCode::SERVICE_UNAVAILABLE,
            ))
        }
    }
}

async fn import_installs(
    import_id: String,
    entries: Vec<InstallEntry>,
    state: Arc<AppState>,
) -> std::result::Result<warp::reply::Response, Rejection> {
    match state.counters.bulk_import(&import_id, entries).await {
        Ok(outcome @ ImportOutcome::Applied { .. }) => {
            tracing::info!(import = %import_id, "Applied install import");
            Ok(warp::reply::json(&outcome).into_response())
        }
        Ok(outcome @ ImportOutcome::Duplicate { .. }) => {
            warn!(import = %import_id, "Import cancelled because import with same name exists");
            Ok(warp::reply::with_status(warp::reply::json(&outcome), StatusCode::CONFLICT)
                .into_response())
        }
        Err(e @ CounterError::Overflow(_)) => {
            warn!(import = %import_id, error = %e, "Rejected import");
            Ok(error_reply(e.to_string(), StatusCode::BAD_REQUEST))
        }
        Err(e) => {
            warn!(import = %import_id, error = %e, "Import failed");
            Ok(error_reply(
                e.to_string(),
                StatusCode::SERVICE_UNAVAILABLE,
            ))
        }
    }
}

async fn health(state: Arc<AppState>) -> std::result::Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&serde_json::json!({
        "status": "healthy",
        "service": "plugin-registry-proxy",
        "registryEntries": state.cache.registry().len(),
        "cachedPlugins": state.cache.len(),
        "lastRefresh": state.cache.last_refreshed_at(),
        "stale": state.cache.is_stale(),
        "counterBackend": state.counters.backend_name(),
    })))
}

async fn get_metrics(state: Arc<AppState>) -> std::result::Result<impl Reply, Rejection> {
    Ok(warp::reply::with_header(
        state.metrics.render(),
        "content-type",
        "text/plain; version=0.0.4",
    ))
}

use crate::error::{ConfigError, ProxyError, Result};
use crate::state::AppState;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

pub mod api;

pub async fn start_server(state: Arc<AppState>) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let addr: std::net::SocketAddr = addr.parse().map_err(|e| {
        ProxyError::Config(ConfigError::Parse(format!(
            "Invalid listen address {}: {}",
            addr, e
        )))
    })?;

    tracing::info!("Starting plugin registry proxy on {}", addr);

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let (_, server) = warp::serve(routes(state.clone()))
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown_rx.recv().await;
        })
        .map_err(|e| ProxyError::Io(std::io::Error::new(std::io::ErrorKind::AddrInUse, e)))?;

    server.await;

    tracing::info!("Plugin registry proxy stopped");
    Ok(())
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    api::routes(state).recover(handle_rejection)
}

/// Requires `x-import-key` to match the configured key. Imports are hidden when no key is set.
pub(crate) fn import_key_auth(
    import_key: Option<String>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("x-import-key")
        .and_then(move |provided: Option<String>| {
            let import_key = import_key.clone();
            async move {
                match (import_key, provided) {
                    (None, _) => Err(warp::reject::custom(ImportAuthError::Disabled)),
                    (Some(expected), Some(provided)) if expected == provided => Ok(()),
                    (Some(_), Some(_)) => Err(warp::reject::custom(ImportAuthError::InvalidKey)),
                    (Some(_), None) => Err(warp::reject::custom(ImportAuthError::MissingKey)),
                }
            }
        })
        .untuple_one()
}

#[derive(Debug)]
pub(crate) enum ImportAuthError {
    Disabled,
    MissingKey,
    InvalidKey,
}

impl warp::reject::Reject for ImportAuthError {}

pub(crate) fn status_for(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::PluginNotFound(_)
        | ProxyError::UnknownAssetPart { .. }
        | ProxyError::MissingAsset { .. } => StatusCode::NOT_FOUND,
        ProxyError::Origin(_) => StatusCode::BAD_GATEWAY,
        ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_reply(message: String, status: StatusCode) -> warp::reply::Response {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message })),
        status,
    )
    .into_response()
}

async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let (message, status) = if err.is_not_found() {
        ("Not found".to_string(), StatusCode::NOT_FOUND)
    } else if let Some(e) = err.find::<ProxyError>() {
        (e.to_string(), status_for(e))
    } else if let Some(e) = err.find::<ImportAuthError>() {
        match e {
            ImportAuthError::Disabled => ("Not found".to_string(), StatusCode::NOT_FOUND),
            ImportAuthError::MissingKey => {
                ("Missing import key".to_string(), StatusCode::UNAUTHORIZED)
            }
            ImportAuthError::InvalidKey => {
                ("Invalid import key".to_string(), StatusCode::UNAUTHORIZED)
            }
        }
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (e.to_string(), StatusCode::BAD_REQUEST)
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (e.to_string(), StatusCode::BAD_REQUEST)
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            "Method not allowed".to_string(),
            StatusCode::METHOD_NOT_ALLOWED,
        )
    } else {
        tracing::error!("Unhandled rejection: {:?}", err);
        (
            "Internal server error".to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    };

    Ok(error_reply(message, status))
}

//! Streams sub-resource requests to their origin
//!
//! Response headers are handed back as soon as the origin answers and the body is
//! streamed through untouched. When a [`ResponseTap`] is attached the body is teed: every
//! chunk also goes down an unbounded channel to a background task that buffers it and,
//! once the origin stream ends cleanly, passes the complete body to the tap. The client
//! side never waits on the tap and never sees its failures.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderName};
use reqwest::{Method, StatusCode};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type BodyStream = BoxStream<'static, std::result::Result<Bytes, reqwest::Error>>;

/// Receives a full copy of a proxied response body after it has been delivered.
#[async_trait]
pub trait ResponseTap: Send + Sync + 'static {
    async fn on_body(&self, body: Bytes);
}

/// Incoming request as seen by the streamer.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

/// Headers that describe a single connection rather than the resource.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn outbound_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len());
    for (name, value) in incoming {
        // Origin must answer with an identity body so tapped manifests stay parseable.
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::ACCEPT_ENCODING
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn inbound_headers(origin: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(origin.len());
    for (name, value) in origin {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

pub struct OriginStreamer {
    client: reqwest::Client,
    max_tap_bytes: usize,
}

impl OriginStreamer {
    pub fn new(client: reqwest::Client, max_tap_bytes: usize) -> Self {
        Self {
            client,
            max_tap_bytes,
        }
    }

    pub async fn forward(
        &self,
        target_url: &str,
        request: ForwardRequest,
        tap: Option<Arc<dyn ResponseTap>>,
    ) -> Result<ForwardedResponse> {
        info!("Proxying request to {}", target_url);

        let mut outbound = self
            .client
            .request(request.method, target_url)
            .headers(outbound_headers(&request.headers));
        if !request.body.is_empty() {
            outbound = outbound.body(request.body);
        }

        let response = outbound.send().await.map_err(|e| {
            warn!(url = %target_url, error = %e, "Origin request failed");
            ProxyError::Origin(e.to_string())
        })?;

        let status = response.status();
        let headers = inbound_headers(response.headers());
        debug!(url = %target_url, status = status.as_u16(), "Origin responded");

        let origin = Box::pin(response.bytes_stream());
        let body = match tap {
            Some(tap) => {
                let (tx, rx) = mpsc::unbounded_channel();
                spawn_collector(target_url.to_string(), tap, rx, self.max_tap_bytes);
                TeeStream {
                    inner: origin,
                    tx: Some(tx),
                }
                .boxed()
            }
            None => origin.boxed(),
        };

        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }
}

enum TapEvent {
    Chunk(Bytes),
    Finished,
    Aborted(String),
}

/// Yields the origin stream unchanged while copying each item to the collector.
struct TeeStream<S> {
    inner: S,
    tx: Option<mpsc::UnboundedSender<TapEvent>>,
}

impl<S> Stream for TeeStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_next(cx);

        match &poll {
            Poll::Ready(Some(Ok(chunk))) => {
                let closed = this
                    .tx
                    .as_ref()
                    .map_or(false, |tx| tx.send(TapEvent::Chunk(chunk.clone())).is_err());
                if closed {
                    this.tx = None;
                }
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(tx) = this.tx.take() {
                    let _ = tx.send(TapEvent::Aborted(e.to_string()));
                }
            }
            Poll::Ready(None) => {
                if let Some(tx) = this.tx.take() {
                    let _ = tx.send(TapEvent::Finished);
                }
            }
            Poll::Pending => {}
        }

        poll
    }
}

fn spawn_collector(
    url: String,
    tap: Arc<dyn ResponseTap>,
    mut rx: mpsc::UnboundedReceiver<TapEvent>,
    max_bytes: usize,
) {
    tokio::spawn(async move {
        let mut buffer = BytesMut::new();
        let mut overflowed = false;

        while let Some(event) = rx.recv().await {
            match event {
                TapEvent::Chunk(chunk) => {
                    if overflowed {
                        continue;
                    }
                    if buffer.len() + chunk.len() > max_bytes {
                        warn!(url = %url, limit = max_bytes, "Tapped body exceeds limit, skipping ingest");
                        overflowed = true;
                        buffer = BytesMut::new();
                    } else {
                        buffer.extend_from_slice(&chunk);
                    }
                }
                TapEvent::Finished => {
                    if !overflowed {
                        tap.on_body(buffer.freeze()).await;
                    }
                    return;
                }
                TapEvent::Aborted(reason) => {
                    warn!(url = %url, error = %reason, "Origin stream failed, skipping ingest");
                    return;
                }
            }
        }

        debug!(url = %url, "Response dropped before completion, skipping ingest");
    });
}

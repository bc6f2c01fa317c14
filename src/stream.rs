//! Streaming relay: forwards an upstream event stream to the downstream
//! caller.
//!
//! Ownership of the upstream body is taken only after the dispatch engine
//! saw HTTP 200 and ran its accounting. Chunks are copied verbatim. A
//! mid-stream failure closes the downstream connection; no retry across
//! keys is attempted and the key is not deactivated. Dropping the stream
//! (downstream disconnect) cancels the upstream request.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{info, warn};

/// Wrap an upstream streaming response into a `text/event-stream` reply.
pub fn event_stream_response(upstream: reqwest::Response, request_id: String) -> Response {
    let relayed = RelayedBody::new(upstream.bytes_stream().boxed(), request_id);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(relayed),
    )
        .into_response()
}

/// Byte stream that forwards upstream chunks and logs the stream outcome.
pub(crate) struct RelayedBody<E> {
    inner: BoxStream<'static, Result<Bytes, E>>,
    request_id: String,
    failed: bool,
}

impl<E> RelayedBody<E> {
    pub(crate) fn new(inner: BoxStream<'static, Result<Bytes, E>>, request_id: String) -> Self {
        Self {
            inner,
            request_id,
            failed: false,
        }
    }
}

impl<E: std::fmt::Display> Stream for RelayedBody<E> {
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                this.failed = true;
                warn!(
                    req_id = %this.request_id,
                    error = %e,
                    "Upstream stream failed mid-flight, closing downstream"
                );
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if !this.failed {
                    info!(req_id = %this.request_id, "Upstream stream completed");
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

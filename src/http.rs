//! Shared response body type and small helpers, used by every handler in
//! [`crate::server`] and [`crate::client`] so a single HTTP/1 connection can
//! freely mix proxied tunnel responses with locally-built JSON/plain bodies.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::Response;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type RespBody = BoxBody<Bytes, BoxError>;

pub fn empty_body() -> RespBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> RespBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn incoming_body(body: Incoming) -> RespBody {
    body.map_err(|e| Box::new(e) as BoxError).boxed()
}

pub fn json_response(status: u16, body: &impl serde::Serialize) -> Response<RespBody> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(payload))
        .unwrap()
}

pub fn text_response(status: u16, text: impl Into<Bytes>) -> Response<RespBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(text))
        .unwrap()
}

/// Hop-by-hop headers that must not be forwarded across a proxy boundary
/// (RFC 7230 §6.1), grounded in the stripping the teacher performs when
/// relaying CONNECT/delegate responses.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

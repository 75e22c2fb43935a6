//! Diagnostic and tunnel-creation endpoints (spec.md §4.4), kept separate
//! from the Host-header routing in [`super`] the way the teacher splits
//! `proxy/connect.rs` from `proxy/delegate.rs` by concern.

use serde::Serialize;

use crate::http::{self, RespBody};
use crate::state::AppState;

#[derive(Serialize)]
struct NewClientResponse {
    id: String,
    port: u16,
    max_conn_count: usize,
    url: String,
}

#[derive(Serialize)]
struct StatusResponse {
    tunnels: usize,
}

#[derive(Serialize)]
struct TunnelStatusResponse {
    connected_sockets: usize,
}

/// `GET /` (with or without `?new`) or `GET /<requestedId>` on the bare
/// domain: allocate a new tunnel client.
pub async fn new_client(state: &AppState, requested_id: Option<&str>) -> hyper::Response<RespBody> {
    match state.manager.new_client(requested_id).await {
        Ok(info) => {
            state.metrics.record_request();
            http::json_response(
                200,
                &NewClientResponse {
                    id: info.id,
                    port: info.port,
                    max_conn_count: info.max_conn_count,
                    url: info.url,
                },
            )
        }
        Err(e) => {
            state.metrics.record_rejected();
            let (status, msg) = match e {
                crate::error::ManagerError::InvalidId => (
                    403,
                    "requested id must match ^[a-z0-9][a-z0-9-]{3,62}$".to_string(),
                ),
                crate::error::ManagerError::Full => (503, "too many concurrent clients".to_string()),
                crate::error::ManagerError::Listen(err) => (500, format!("failed to start tunnel: {err}")),
            };
            http::text_response(status, msg)
        }
    }
}

/// `GET /api/status`: process-wide tunnel count.
pub async fn status(state: &AppState) -> hyper::Response<RespBody> {
    let stats = state.manager.stats().await;
    http::json_response(200, &StatusResponse { tunnels: stats.tunnels })
}

/// `GET /api/tunnels/:id/status`: per-client connected socket count.
pub async fn tunnel_status(state: &AppState, id: &str) -> hyper::Response<RespBody> {
    match state.manager.get_client(id).await {
        Some(client) => {
            let stats = client.tunnel_stats().await;
            http::json_response(
                200,
                &TunnelStatusResponse {
                    connected_sockets: stats.connected_sockets,
                },
            )
        }
        None => http::text_response(404, "404"),
    }
}

//! Public-facing HTTP server: Host-header routing onto live tunnel clients,
//! plus the thin plumbing endpoints spec.md §3 calls out as external
//! collaborators (tunnel creation, `/api/status`, landing redirect).
//!
//! Accept-loop and connection-serving shape grounded in the teacher's
//! `proxy/server.rs`.

mod api;

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::http::RespBody;
use crate::state::AppState;

pub async fn run(state: Arc<AppState>, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&state.config.bind_addr).await?;
    info!(addr = %state.config.bind_addr, "tunnel hub listening");
    serve(listener, state, shutdown_rx).await;
    Ok(())
}

/// Accept loop over an already-bound listener. Split out from [`run`] so
/// tests can bind to an OS-chosen port (`127.0.0.1:0`) and learn the real
/// address before handing the listener off here.
pub async fn serve(listener: TcpListener, state: Arc<AppState>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept public connection");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
                }
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    serve_connection(stream, peer_addr, state).await;
                });
            }
            _ = shutdown_rx.changed() => {
                info!("tunnel hub shutting down");
                break;
            }
        }
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, peer_addr: SocketAddr, state: Arc<AppState>) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(route(&state, req).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        if !e.to_string().contains("connection closed") {
            debug!(peer = %peer_addr, error = %e, "connection error");
        }
    }
}

async fn route(state: &Arc<AppState>, req: Request<Incoming>) -> Response<RespBody> {
    state.metrics.record_request();

    let host = host_no_port(&req).unwrap_or_default();

    if host.eq_ignore_ascii_case(&state.config.domain) {
        return route_bare_domain(state, req).await;
    }

    let label = leftmost_label(&host);
    match state.manager.get_client(label).await {
        Some(client) => {
            if is_upgrade(&req) {
                state.metrics.record_upgrade();
                client.handle_upgrade(req).await
            } else {
                client.handle_request(req).await
            }
        }
        None => crate::http::text_response(404, "404"),
    }
}

async fn route_bare_domain(state: &Arc<AppState>, req: Request<Incoming>) -> Response<RespBody> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("");

    if path == "/api/status" {
        return api::status(state).await;
    }
    if let Some(id) = path
        .strip_prefix("/api/tunnels/")
        .and_then(|rest| rest.strip_suffix("/status"))
    {
        return api::tunnel_status(state, id).await;
    }

    if path == "/" {
        if query.split('&').any(|kv| kv == "new") {
            return api::new_client(state, None).await;
        }
        if let Some(landing) = &state.config.landing {
            return redirect(landing);
        }
        return crate::http::text_response(200, "tunnel hub");
    }

    // `GET /<requestedId>`: a single path segment not served by the API
    // above is a tunnel-creation request with a caller-chosen identifier.
    if let Some(id) = path.strip_prefix('/').filter(|s| !s.is_empty() && !s.contains('/')) {
        return api::new_client(state, Some(id)).await;
    }

    crate::http::text_response(404, "404")
}

fn redirect(to: &str) -> Response<RespBody> {
    Response::builder()
        .status(302)
        .header("location", HeaderValue::from_str(to).unwrap_or_else(|_| HeaderValue::from_static("/")))
        .body(crate::http::empty_body())
        .unwrap()
}

fn host_no_port(req: &Request<Incoming>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;
    Some(raw.split(':').next().unwrap_or(raw).to_ascii_lowercase())
}

fn leftmost_label(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

fn is_upgrade(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
        && req.headers().contains_key(hyper::header::UPGRADE)
}

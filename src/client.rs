//! Bridges a public HTTP request (or WebSocket upgrade) onto one of a
//! client's tunnel sockets (spec.md §3/§4.2).
//!
//! Grounded in the teacher's CONNECT-tunnel splice (`proxy/connect.rs`) for
//! the upgrade path, generalized from a raw TCP splice to an HTTP/1.1
//! request/response relay driven by `hyper::client::conn::http1` (see
//! SPEC_FULL.md §4.1 for why the pooled `hyper_util` legacy client was
//! rejected in favor of this lower-level API).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::http::{self, RespBody};
use crate::tunnel::TunnelAgent;

pub struct Client {
    pub id: String,
    agent: Arc<TunnelAgent>,
    disposed: AtomicBool,
}

impl Client {
    pub fn new(id: String, agent: Arc<TunnelAgent>) -> Arc<Self> {
        Arc::new(Self {
            id,
            agent,
            disposed: AtomicBool::new(false),
        })
    }

    pub async fn tunnel_stats(&self) -> crate::tunnel::AgentStats {
        self.agent.stats().await
    }

    /// Proxy a plain (non-upgrade) HTTP request onto one tunnel socket.
    pub async fn handle_request(&self, mut req: Request<Incoming>) -> Response<RespBody> {
        http::strip_hop_by_hop(req.headers_mut());

        let socket = match self.agent.checkout().await {
            Ok(s) => s,
            Err(e) => return self.checkout_failed_response(e),
        };

        let io = TokioIo::new(socket);
        let (mut sender, conn): (client_http1::SendRequest<Incoming>, _) =
            match client_http1::handshake(io).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(id = %self.id, error = %e, "tunnel handshake failed");
                    return http::text_response(502, format!("client {} failed", self.id));
                }
            };
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "tunnel connection task ended");
            }
        });

        match sender.send_request(req).await {
            Ok(resp) => {
                let (mut parts, body) = resp.into_parts();
                http::strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, http::incoming_body(body))
            }
            Err(e) => {
                warn!(id = %self.id, error = %e, "tunnel request failed");
                http::text_response(502, format!("client {} failed", self.id))
            }
        }
    }

    /// Proxy a WebSocket (or other `Upgrade:`) request: relay the handshake
    /// over one tunnel socket, then splice the two raw byte streams once
    /// both sides have switched protocols.
    pub async fn handle_upgrade(&self, mut req: Request<Incoming>) -> Response<RespBody> {
        let client_upgrade = hyper::upgrade::on(&mut req);

        let socket = match self.agent.checkout().await {
            Ok(s) => s,
            Err(e) => return self.checkout_failed_response(e),
        };

        let io = TokioIo::new(socket);
        let (mut sender, conn): (client_http1::SendRequest<Incoming>, _) =
            match client_http1::handshake(io).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(id = %self.id, error = %e, "tunnel handshake failed");
                    return http::text_response(502, format!("client {} failed", self.id));
                }
            };
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "tunnel connection task ended");
            }
        });

        let mut resp = match sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(id = %self.id, error = %e, "tunnel upgrade request failed");
                return http::text_response(502, format!("client {} failed", self.id));
            }
        };

        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            let (mut parts, body) = resp.into_parts();
            http::strip_hop_by_hop(&mut parts.headers);
            return Response::from_parts(parts, http::incoming_body(body));
        }

        let backend_upgrade = hyper::upgrade::on(&mut resp);
        let id = self.id.clone();
        tokio::spawn(async move {
            let (client_side, backend_side) = match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(id = %id, error = %e, "upgrade handshake did not complete");
                    return;
                }
            };
            let mut client_io = TokioIo::new(client_side);
            let mut backend_io = TokioIo::new(backend_side);
            match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
                Ok((up, down)) => debug!(id = %id, up, down, "upgrade stream closed"),
                Err(e) => debug!(id = %id, error = %e, "upgrade stream error"),
            }
        });

        let (parts, _) = resp.into_parts();
        Response::from_parts(parts, http::empty_body())
    }

    fn checkout_failed_response(&self, err: AgentError) -> Response<RespBody> {
        match err {
            AgentError::Closed => {
                http::text_response(502, format!("client {} is closed", self.id))
            }
            AgentError::Abandoned => {
                http::text_response(502, format!("client {} failed to respond", self.id))
            }
        }
    }

    /// Tear down the underlying agent. Idempotent.
    pub async fn close(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.agent.destroy().await;
    }
}

//! Per-client pool of reusable TCP tunnel sockets (spec.md §3/§4.1).
//!
//! Shape is grounded in `bb8`'s connection pool (`Mutex<Internals>` holding
//! parallel `waiters`/`conns` `VecDeque`s, checked out via a oneshot) and in
//! the teacher's accept-loop style in `proxy/server.rs`.

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::tunnel::events::{AgentEvent, EventSender};
use crate::tunnel::socket::{normalize_addr, TunnelSocket};

/// A pending checkout: satisfied either by an available socket or by the
/// next admitted one.
type Waiter = oneshot::Sender<Result<TunnelSocket, AgentError>>;

struct Inner {
    available: VecDeque<IdleSocket>,
    waiters: VecDeque<Waiter>,
    connected: usize,
    closed: bool,
    distinct_ips: HashSet<IpAddr>,
}

struct IdleSocket {
    socket: TunnelSocket,
    enqueued_at: Instant,
}

/// Snapshot returned by [`TunnelAgent::stats`].
#[derive(Debug, Clone, Copy)]
pub struct AgentStats {
    pub connected_sockets: usize,
    pub distinct_ips: usize,
}

/// Result of a successful `listen()` call.
#[derive(Debug, Clone)]
pub struct ListenInfo {
    pub port: u16,
}

/// Per-client pool of tunnel sockets, acting as an HTTP connection source
/// for the reverse proxy in [`crate::client::Client`].
pub struct TunnelAgent {
    pub id: String,
    max_sockets: usize,
    idle_timeout: Duration,
    inner: Mutex<Inner>,
    events: EventSender,
    /// Fired by a [`TunnelSocket`]'s drop guard when the underlying
    /// connection is gone (consumed, errored, or reaped for idleness).
    closed_tx: tokio::sync::mpsc::UnboundedSender<()>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl TunnelAgent {
    pub fn new(id: String, max_sockets: usize, idle_timeout: Duration, events: EventSender) -> Arc<Self> {
        let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let (shutdown_tx, _) = watch::channel(false);

        let agent = Arc::new(Self {
            id,
            max_sockets,
            idle_timeout,
            inner: Mutex::new(Inner {
                available: VecDeque::new(),
                waiters: VecDeque::new(),
                connected: 0,
                closed: false,
                distinct_ips: HashSet::new(),
            }),
            events,
            closed_tx,
            started: AtomicBool::new(false),
            shutdown_tx,
        });

        // Drains close notifications from dropped TunnelSockets (checked-out
        // sockets whose consumer finished with them, or reaped idle ones).
        // This is the single point that decrements `connected` (spec.md §8
        // invariant 7: exactly one decrement per accepted socket).
        //
        // Held as a `Weak`: the only strong `Sender` lives on the agent
        // struct itself, so a strong `Arc` here would keep both alive
        // forever (`recv()` never sees `None` because its own sender never
        // drops). Upgrading per message lets this task exit once the last
        // real owner drops the agent.
        let decrement_agent = Arc::downgrade(&agent);
        tokio::spawn(async move {
            while closed_rx.recv().await.is_some() {
                match decrement_agent.upgrade() {
                    Some(agent) => agent.note_closed().await,
                    None => break,
                }
            }
        });

        let reaper_agent = Arc::downgrade(&agent);
        tokio::spawn(async move {
            reap_idle_loop(reaper_agent).await;
        });

        agent
    }

    /// Bind a listener on an OS-chosen port and start accepting tunnel
    /// dials. Idempotent: a second call fails with `AlreadyExists`.
    pub async fn listen(self: &Arc<Self>) -> std::io::Result<ListenInfo> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "tunnel agent already started",
            ));
        }

        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();

        let agent = Arc::clone(self);
        let mut shutdown_rx = agent.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let agent = Arc::clone(&agent);
                                tokio::spawn(async move {
                                    agent.admit(stream, peer).await;
                                });
                            }
                            Err(e) => {
                                debug!(id = %agent.id, error = %e, "accept error, continuing");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!(id = %agent.id, "tunnel listener shutting down");
                            break;
                        }
                    }
                }
            }
        });

        info!(id = %self.id, port, "tunnel listener started");
        Ok(ListenInfo { port })
    }

    /// Check out one tunnel socket, per spec.md §4.1's `create_connection`:
    /// completes immediately if a socket is available or the agent is
    /// closed, otherwise parks until the next admission satisfies it.
    pub async fn checkout(self: &Arc<Self>) -> Result<TunnelSocket, AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(AgentError::Closed);
        }
        if let Some(idle) = inner.available.pop_front() {
            return Ok(idle.socket);
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.push_back(tx);
        drop(inner);

        rx.await.unwrap_or(Err(AgentError::Abandoned))
    }

    /// Snapshot of the connected-socket count.
    pub async fn stats(&self) -> AgentStats {
        let inner = self.inner.lock().await;
        AgentStats {
            connected_sockets: inner.connected,
            distinct_ips: inner.distinct_ips.len(),
        }
    }

    /// Close the listener and invalidate the agent: all waiters are
    /// completed with `Closed`, no further socket is admitted.
    pub async fn destroy(self: &Arc<Self>) {
        let (waiters, was_online) = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.available.clear();
            let was_online = inner.connected > 0;
            inner.connected = 0;
            (std::mem::take(&mut inner.waiters), was_online)
        };

        for w in waiters {
            let _ = w.send(Err(AgentError::Closed));
        }
        if was_online {
            let _ = self.events.send(AgentEvent::Offline);
        }
        let _ = self.shutdown_tx.send(true);
        let _ = self.events.send(AgentEvent::End);
        info!(id = %self.id, "tunnel agent destroyed");
    }

    /// Admission of a newly-accepted tunnel socket (spec.md §4.1 steps 1-6).
    async fn admit(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let addr = normalize_addr(peer.ip());

        let mut inner = self.inner.lock().await;
        if inner.closed {
            drop(inner);
            debug!(id = %self.id, "dropping accepted socket: agent closed");
            return;
        }
        if inner.connected >= self.max_sockets {
            drop(inner);
            warn!(id = %self.id, max = self.max_sockets, "over budget, destroying accepted socket");
            return; // dropping `stream` closes it; no client-visible error per spec.md §7
        }

        inner.connected += 1;
        inner.distinct_ips.insert(addr);
        // Fires on every 0→1 transition, not just the agent's first one
        // (spec.md §4.1 step 5 / §5): a client that drains to zero sockets
        // and later dials in again goes online again.
        let went_online = inner.connected == 1;
        debug!(
            id = %self.id,
            peer = %addr,
            connected = inner.connected,
            distinct_ips = inner.distinct_ips.len(),
            "tunnel socket admitted"
        );

        let socket = TunnelSocket::new(stream, addr, self.closed_tx.clone());
        socket.set_nodelay(true);

        if let Some(waiter) = inner.waiters.pop_front() {
            drop(inner);
            if went_online {
                let _ = self.events.send(AgentEvent::Online);
            }
            // Yield once before invoking the waiter so admission itself
            // returns first (spec.md §4.1: avoids re-entrancy where the
            // consumer destroys the socket inside the accept path).
            tokio::task::yield_now().await;
            if waiter.send(Ok(socket)).is_err() {
                // Consumer gave up (e.g. the public request was aborted)
                // between parking and delivery; the socket is simply
                // dropped here, which runs its close-notification and
                // decrements `connected` through the normal path.
                debug!(id = %self.id, "waiter abandoned, dropping delivered socket");
            }
        } else {
            inner
                .available
                .push_back(IdleSocket {
                    socket,
                    enqueued_at: Instant::now(),
                });
            drop(inner);
            if went_online {
                let _ = self.events.send(AgentEvent::Online);
            }
        }
    }

    /// Called whenever a checked-out or reaped `TunnelSocket` is dropped.
    ///
    /// A transition to `connected == 0` with no parked waiter means the
    /// client has genuinely gone idle with nothing left expecting a fresh
    /// dial, so the agent is torn down immediately here (spec.md §4.3: "no
    /// grace period... loses its identifier immediately"). If a waiter is
    /// still parked, a fresh tunnel socket is still expected to serve it
    /// (spec.md §8 "Queueing"), so the agent is left alive for that dial.
    async fn note_closed(self: &Arc<Self>) {
        let went_offline = {
            let mut inner = self.inner.lock().await;
            if inner.connected == 0 {
                // Already zeroed by `destroy()`; nothing to do.
                return;
            }
            inner.connected -= 1;
            inner.connected == 0
        };
        if went_offline {
            let _ = self.events.send(AgentEvent::Offline);
        }

        let should_destroy = {
            let inner = self.inner.lock().await;
            !inner.closed && inner.connected == 0 && inner.waiters.is_empty()
        };
        if should_destroy {
            self.destroy().await;
        }
    }
}

/// Periodically evicts idle sockets that have exceeded the configured idle
/// timeout. Dropping them runs the normal close-notification path.
///
/// Takes a `Weak` handle (not `Arc<Self>`) for the same reason the
/// close-drain task does: holding a strong reference here would keep the
/// agent alive forever after its last real owner drops it.
async fn reap_idle_loop(agent: std::sync::Weak<TunnelAgent>) {
    let Some(first) = agent.upgrade() else { return };
    let sweep_every = (first.idle_timeout / 4).max(Duration::from_millis(100));
    drop(first);

    let mut ticker = tokio::time::interval(sweep_every);
    loop {
        ticker.tick().await;
        let Some(self_) = agent.upgrade() else { break };

        let expired = {
            let mut inner = self_.inner.lock().await;
            if inner.closed {
                break;
            }
            let now = Instant::now();
            let mut expired = Vec::new();
            let mut keep = VecDeque::with_capacity(inner.available.len());
            while let Some(idle) = inner.available.pop_front() {
                if now.duration_since(idle.enqueued_at) >= self_.idle_timeout {
                    expired.push(idle.socket);
                } else {
                    keep.push_back(idle);
                }
            }
            inner.available = keep;
            expired
        };
        if !expired.is_empty() {
            debug!(id = %self_.id, count = expired.len(), "reaped idle tunnel sockets");
        }
        // Dropping `expired` here closes each socket and runs its
        // close-notification, decrementing `connected` exactly once.
        drop(expired);
    }
}

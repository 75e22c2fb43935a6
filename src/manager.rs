//! Process-wide registry mapping a client identifier to its [`Client`]
//! (spec.md §3/§4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::ManagerError;
use crate::tunnel::{events, AgentEvent, TunnelAgent};

const RANDOM_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const RANDOM_ID_LEN_MIN: usize = 4;
const RANDOM_ID_LEN_MAX: usize = 6;
const RANDOM_ID_MAX_ATTEMPTS: usize = 20;

fn id_pattern() -> &'static Regex {
    // Lowercase, 4-63 chars total, starts with an alphanumeric.
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]{3,62}$").unwrap())
}

/// Result of a successful [`ClientManager::new_client`] call.
#[derive(Debug, Clone)]
pub struct NewClientInfo {
    pub id: String,
    pub port: u16,
    pub max_conn_count: usize,
    pub url: String,
}

/// Snapshot returned by [`ClientManager::stats`].
#[derive(Debug, Clone, Copy)]
pub struct ManagerStats {
    pub tunnels: usize,
}

pub struct ClientManager {
    clients: RwLock<HashMap<String, Arc<Client>>>,
    max_clients: Option<usize>,
    max_tcp_sockets: usize,
    socket_idle_timeout: Duration,
    domain: String,
    url_scheme: &'static str,
    creations: AtomicU64,
}

impl ClientManager {
    pub fn new(
        max_clients: Option<usize>,
        max_tcp_sockets: usize,
        socket_idle_timeout: Duration,
        domain: String,
        url_scheme: &'static str,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            max_clients,
            max_tcp_sockets,
            socket_idle_timeout,
            domain,
            url_scheme,
            creations: AtomicU64::new(0),
        })
    }

    /// Create a new tunnel client, optionally with a caller-requested
    /// identifier (spec.md §4.3).
    pub async fn new_client(
        self: &Arc<Self>,
        requested_id: Option<&str>,
    ) -> Result<NewClientInfo, ManagerError> {
        if let Some(max) = self.max_clients {
            if self.clients.read().await.len() >= max {
                return Err(ManagerError::Full);
            }
        }

        let id = self.allocate_id(requested_id).await?;

        let (events_tx, events_rx) = events::channel();
        let agent = TunnelAgent::new(
            id.clone(),
            self.max_tcp_sockets,
            self.socket_idle_timeout,
            events_tx,
        );

        let listen_info = agent.listen().await.map_err(ManagerError::Listen)?;

        let client = Client::new(id.clone(), Arc::clone(&agent));
        self.clients.write().await.insert(id.clone(), Arc::clone(&client));
        self.creations.fetch_add(1, Ordering::Relaxed);

        // Lifecycle hook: remove the registry entry the moment the agent
        // reports `End`, with no grace period (spec.md §4.3/§9).
        self.spawn_lifecycle_watcher(id.clone(), events_rx);

        info!(id = %id, port = listen_info.port, "client created");

        let url = format!("{}://{}.{}", self.url_scheme, id, self.domain);
        Ok(NewClientInfo {
            id,
            port: listen_info.port,
            max_conn_count: self.max_tcp_sockets,
            url,
        })
    }

    pub async fn get_client(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn has_client(&self, id: &str) -> bool {
        self.clients.read().await.contains_key(id)
    }

    /// Force-remove a client, destroying its agent. Idempotent.
    pub async fn remove_client(&self, id: &str) {
        let removed = self.clients.write().await.remove(id);
        if let Some(client) = removed {
            client.close().await;
            debug!(id = %id, "client removed");
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            tunnels: self.clients.read().await.len(),
        }
    }

    fn spawn_lifecycle_watcher(self: &Arc<Self>, id: String, mut events_rx: events::EventReceiver) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if matches!(event, AgentEvent::End) {
                    manager.remove_client(&id).await;
                    break;
                }
            }
        });
    }

    async fn allocate_id(&self, requested_id: Option<&str>) -> Result<String, ManagerError> {
        if let Some(requested) = requested_id {
            if !id_pattern().is_match(requested) {
                return Err(ManagerError::InvalidId);
            }
            let taken = self.clients.read().await.contains_key(requested);
            if !taken {
                return Ok(requested.to_string());
            }
            warn!(id = %requested, "requested id already live, generating a random one instead");
        }

        for _ in 0..RANDOM_ID_MAX_ATTEMPTS {
            let candidate = random_id();
            if !self.clients.read().await.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        // Astronomically unlikely with a 36^4 (~1.7M) keyspace and a small
        // live-client count, but fall back to a longer id rather than loop
        // forever.
        Ok(format!("{}{}", random_id(), random_id()))
    }
}

fn random_id() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(RANDOM_ID_LEN_MIN..=RANDOM_ID_LEN_MAX);
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..RANDOM_ID_ALPHABET.len());
            RANDOM_ID_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<ClientManager> {
        ClientManager::new(None, 10, Duration::from_secs(60), "example.com".into(), "http")
    }

    #[tokio::test]
    async fn requested_id_is_reserved_when_free() {
        let mgr = manager();
        let info = mgr.new_client(Some("foo")).await.unwrap();
        assert_eq!(info.id, "foo");
        assert_eq!(info.url, "http://foo.example.com");
    }

    #[tokio::test]
    async fn collision_falls_back_to_random_id() {
        let mgr = manager();
        let first = mgr.new_client(Some("foo")).await.unwrap();
        assert_eq!(first.id, "foo");

        let second = mgr.new_client(Some("foo")).await.unwrap();
        assert_ne!(second.id, "foo");
    }

    #[tokio::test]
    async fn invalid_requested_id_is_rejected() {
        let mgr = manager();
        let err = mgr.new_client(Some("AB")).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidId));
    }

    #[tokio::test]
    async fn random_id_has_expected_shape() {
        let id = random_id();
        assert!(id.len() >= RANDOM_ID_LEN_MIN && id.len() <= RANDOM_ID_LEN_MAX);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}

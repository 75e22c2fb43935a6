//! Shared application state passed to the server glue (spec.md §4.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::manager::ClientManager;

/// Central application state shared across the public HTTP server and the
/// tunnel-creation endpoint.
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<ClientManager>,
    pub reqwest_client: reqwest::Client,
    pub metrics: Arc<HubMetrics>,
}

/// Process-wide request counters, reported by `/api/status`.
#[derive(Default)]
pub struct HubMetrics {
    pub total_requests: AtomicU64,
    pub total_upgrades: AtomicU64,
    pub total_rejected: AtomicU64,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upgrade(&self) {
        self.total_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
    }
}

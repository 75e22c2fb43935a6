//! One-shot public IP lookup, cached for the life of the process.
//!
//! spec.md §4.1/§9: "Global PUBLIC_IP cache... failure leaves it unset and
//! is retried only on process restart." Modeled as a `OnceLock`-guarded
//! value, the same pattern the teacher uses for its log-level reloader in
//! `runtime.rs`.

use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

static PUBLIC_IP: OnceLock<Option<String>> = OnceLock::new();

const ECHO_SERVICES: &[&str] = &["https://api.ipify.org", "https://ifconfig.me/ip"];

/// Best-effort public IP lookup. Only ever performs the network round trip
/// once per process; subsequent calls return the cached result immediately,
/// matching source semantics (no retry until restart).
///
/// Never blocks the caller beyond `timeout`; a slow or failing lookup is
/// treated as "unset" rather than propagated, per spec.md §5 ("treat a slow
/// lookup as failure and continue").
pub async fn public_ip(client: &reqwest::Client, timeout: Duration) -> Option<String> {
    if let Some(cached) = PUBLIC_IP.get() {
        return cached.clone();
    }

    let result = tokio::time::timeout(timeout, fetch(client)).await.ok().flatten();
    // Another task may have raced us to populate the cell; whichever wins
    // is authoritative, matching a once-primitive's semantics.
    let _ = PUBLIC_IP.set(result.clone());
    result
}

async fn fetch(client: &reqwest::Client) -> Option<String> {
    for url in ECHO_SERVICES {
        match client.get(*url).send().await {
            Ok(resp) if resp.status().is_success() => {
                if let Ok(text) = resp.text().await {
                    let ip = text.trim().to_string();
                    if ip.parse::<std::net::IpAddr>().is_ok() {
                        return Some(ip);
                    }
                }
            }
            Ok(resp) => {
                debug!(url = %url, status = %resp.status(), "ip echo service returned non-success");
            }
            Err(e) => {
                debug!(url = %url, error = %e, "ip echo service unreachable");
            }
        }
    }
    None
}

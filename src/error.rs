//! Error taxonomy for the tunnel core (see spec.md §7).

use thiserror::Error;

/// Errors surfaced by [`crate::tunnel::agent::TunnelAgent`].
#[derive(Debug, Error, Clone)]
pub enum AgentError {
    /// The agent has been destroyed; no further sockets are admitted or handed out.
    #[error("tunnel agent closed")]
    Closed,
    /// The waiter's oneshot was dropped before being satisfied (consumer gave up).
    #[error("tunnel agent checkout abandoned")]
    Abandoned,
}

/// Errors surfaced by [`crate::manager::ClientManager::new_client`].
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A caller-requested identifier failed the `^[a-z0-9][a-z0-9-]{3,62}$` pattern.
    #[error("invalid client id")]
    InvalidId,
    /// The manager's global client cap (if configured) has been reached.
    #[error("too many concurrent clients")]
    Full,
    /// Binding the agent's listener failed.
    #[error("failed to start tunnel listener: {0}")]
    Listen(#[source] std::io::Error),
}

//! Lifecycle events emitted by a [`super::agent::TunnelAgent`].
//!
//! The source implementation is `EventEmitter`-shaped (`online` / `offline`
//! / `end`); per spec.md §9 this is replaced with an explicit channel that
//! the owning [`crate::client::Client`] forwards to whoever registered
//! interest (the [`crate::manager::ClientManager`]).

/// One lifecycle transition of a `TunnelAgent`'s connected-socket count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// `connectedSockets` went from 0 to 1.
    Online,
    /// `connectedSockets` returned to 0 after having been online at least once.
    Offline,
    /// The agent's listener closed; the agent is now permanently unusable.
    End,
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<AgentEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<AgentEvent>;

/// Create a fresh lifecycle event channel for one agent.
pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

pub mod agent;
pub mod events;
pub mod socket;

pub use agent::{AgentStats, ListenInfo, TunnelAgent};
pub use events::AgentEvent;
pub use socket::TunnelSocket;

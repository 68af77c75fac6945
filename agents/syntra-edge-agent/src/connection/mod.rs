//! Connection module
//!
//! Everything between the agent and the hub: the transport contract, the
//! reference WebSocket transport, and the [`AgentConnection`] the rest of
//! the agent talks to.

pub mod agent;
pub mod link;
pub mod protocol;
pub mod transport;
pub mod websocket;

pub use agent::{AgentConnection, RefreshAction};
pub use transport::{CloudTransport, ConnectionStatus, TransportError, Twin};
pub use websocket::{WebSocketTransport, WebSocketTransportBuilder};

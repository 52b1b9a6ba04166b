//! Pierce device agent.
//!
//! Connects to the signaling server as a `device`, answers data-channel
//! handshakes from callers, and executes proxied HTTP calls arriving either
//! over an open data channel or over signaling itself.

pub mod agent;
pub mod api;
pub mod executor;
pub mod handshake;
pub mod rtc;
pub mod service;
pub mod signaling;

pub use agent::{run, AgentConfig};
pub use executor::{ExecutorError, GatewayExecutor};
pub use handshake::{HandshakeEvent, HandshakeOrchestrator, SessionState};
pub use service::DeviceService;

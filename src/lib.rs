pub mod cli;
pub mod config;
pub mod handlers;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod ws;

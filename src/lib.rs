//! wshub - WebSocket broadcast hub
//!
//! Every message a connected peer sends is relayed to every connected peer.
//! Registry changes and fan-out run through one control loop; each peer gets
//! its own reader and writer task, heartbeats catch dead connections, and a
//! peer that cannot keep up is dropped instead of slowing down the rest.

pub mod config;
pub mod server;

pub use config::HubConfig;
pub use server::{ClientSession, Hub, HubError, HubHandle, SessionError, SessionId};

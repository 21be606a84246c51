//! wshub server implementation
//!
//! Accepts WebSocket connections, registers them with the hub, and fans
//! broadcast messages out to every connected peer.

mod hub;
pub mod redirect;
mod session;
pub mod websocket;

pub use hub::{Broadcast, Hub, HubError, HubHandle, SessionHandle};
pub use redirect::{run_redirect_server, serve_redirects};
pub use session::{normalize, ClientSession, SessionError, SessionId, SessionTasks};
pub use websocket::{create_router, run_tls_websocket_server, run_websocket_server, serve, TlsPaths, WsState};

//! CLI command definitions

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "wshub")]
#[command(about = "WebSocket broadcast hub", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the hub server
    Serve {
        /// Address to bind the WebSocket server to
        #[arg(short, long, default_value = "0.0.0.0:8080", env = "WSHUB_BIND")]
        bind: SocketAddr,

        /// Path to TLS certificate chain (PEM); serves HTTPS when set with --key
        #[arg(long, env = "WSHUB_CERT", requires = "key")]
        cert: Option<PathBuf>,

        /// Path to TLS private key (PEM)
        #[arg(long, env = "WSHUB_KEY", requires = "cert")]
        key: Option<PathBuf>,

        /// Address for a plaintext listener that redirects to HTTPS
        #[arg(long, env = "WSHUB_REDIRECT_BIND")]
        redirect_bind: Option<SocketAddr>,

        /// Largest message a peer may send, in bytes
        #[arg(long, default_value_t = wshub::config::DEFAULT_MAX_MESSAGE_SIZE, env = "WSHUB_MAX_MESSAGE_SIZE")]
        max_message_size: usize,

        /// Outbound queue capacity per peer; a full queue drops the peer
        #[arg(long, default_value_t = wshub::config::DEFAULT_SEND_BUFFER, env = "WSHUB_SEND_BUFFER")]
        send_buffer: usize,

        /// Capacity of the hub's broadcast intake
        #[arg(long, default_value_t = wshub::config::DEFAULT_BROADCAST_BUFFER, env = "WSHUB_BROADCAST_BUFFER")]
        broadcast_buffer: usize,

        /// Seconds a peer may stay silent before it is dropped
        #[arg(long, default_value_t = 60, env = "WSHUB_PONG_WAIT", value_parser = clap::value_parser!(u64).range(1..))]
        pong_wait_secs: u64,

        /// Seconds allowed for a single write
        #[arg(long, default_value_t = 20, env = "WSHUB_WRITE_WAIT", value_parser = clap::value_parser!(u64).range(1..))]
        write_wait_secs: u64,

        /// Maximum number of connected peers
        #[arg(long, env = "WSHUB_MAX_SESSIONS")]
        max_sessions: Option<usize>,

        /// Do not send a peer its own messages
        #[arg(long)]
        no_echo: bool,
    },

    /// Connect to a hub, print what it broadcasts and send stdin lines
    ///
    /// Examples:
    ///   wshub connect ws://localhost:8080/ws
    ///   echo hello | wshub connect ws://localhost:8080/ws
    Connect {
        /// WebSocket URL of the hub
        url: String,

        /// Also print the "." heartbeat messages
        #[arg(long)]
        show_heartbeats: bool,
    },
}

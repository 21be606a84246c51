mod commands;
mod connect;

pub use commands::{Cli, Commands};
pub use connect::connect;

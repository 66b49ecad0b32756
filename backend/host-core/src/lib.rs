pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod runtime;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
mod tests;

pub use config::HostConfig;
pub use error::HostError;
pub use server::{HostEvent, HostServerHandle, start_host_server, start_host_server_with_verifier};
pub use session::ClientToken;

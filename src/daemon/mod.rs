//! Configuration and the request loop of the signer daemon.

pub mod config;
pub mod server;

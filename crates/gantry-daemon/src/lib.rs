//! # Gantry Daemon
//!
//! Component wiring and the JSON-RPC control surface. The binary in
//! `main.rs` is a thin CLI over [`server::Server`] plus a client for the
//! query subcommands; everything testable lives here.

pub mod client;
pub mod lifecycle;
pub mod protocol;
pub mod server;

pub use server::Server;

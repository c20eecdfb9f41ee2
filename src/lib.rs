//! Editor to language runtime interaction protocol.
//!
//! A [`server::Server`] exposes a [`runtime::Runtime`] to editor clients over TCP, a
//! [`client::Client`] talks to it. Both sides share the framed s-expression [`wire`] format.
pub mod client;
pub mod config;
pub mod error;
pub mod log;
pub mod runtime;
pub mod server;
pub mod wire;

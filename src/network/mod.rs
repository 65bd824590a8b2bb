// Network layer: wire protocol codec, typed client, request dispatcher,
// TCP server.

pub mod client;
pub mod dispatcher;
pub mod protocol;
pub mod server;

pub use client::GtmClient;
pub use server::{Server, ServerOptions};

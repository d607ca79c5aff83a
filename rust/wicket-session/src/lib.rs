#![deny(unsafe_code)]

//! RPC transports for wicket over a single bidirectional data channel.
//!
//! The channel (a WebRTC data channel, or anything with the same shape) is
//! external: already open, already authenticated, ordered, and
//! message-oriented. This crate owns everything above it - correlating
//! concurrent calls by request id, per-call timeouts, method dispatch, and
//! the streaming sub-protocol - using the wire codec from `wicket-wire`.
//!
//! Both sides follow a handle/driver split: the handle is a cheap clone
//! used to issue calls or register handlers, while the driver owns the
//! channel and must be spawned.
//!
//! ```ignore
//! let (channel_a, channel_b) = MemoryChannel::pair();
//!
//! let (server, server_driver) = Server::new(channel_b);
//! server.register_handler("/svc/Echo", make_handler(de, ser, echo));
//! tokio::spawn(server_driver.run());
//!
//! let (client, client_driver) = Client::new(channel_a);
//! tokio::spawn(client_driver.run());
//! let reply = client.unary("/svc/Echo", &req, ser, de, CallOptions::default()).await?;
//! ```

mod client;
mod errors;
mod handler;
mod memory;
mod server;
mod transport;

#[cfg(test)]
mod tests;

pub use client::{CallOptions, Client, ClientConfig, ClientDriver, ServerStream};
pub use errors::{BoxError, CallError, CloseReason, ServerError};
pub use handler::{make_handler, make_streaming_handler, TypedSink};
pub use memory::MemoryChannel;
pub use server::{
    Context, Handler, Server, ServerConfig, ServerDriver, StreamSink, StreamingHandler,
};
pub use transport::DataChannel;

/// Boxed future type for dyn-compatible handler signatures.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Default per-call timeout on both sides of the channel.
pub const DEFAULT_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(30_000);

#![deny(unsafe_code)]

//! gRPC-style RPC over a single bidirectional data channel.
//!
//! Umbrella crate re-exporting the pieces:
//!
//! - [`wire`] - the byte-exact codec: frames, envelopes, stream messages,
//!   status codes.
//! - [`session`] - client and server transports over a [`DataChannel`],
//!   with typed handler adapters and an in-memory channel for tests.
//! - [`reflection`] - the ListServices mini-service.
//!
//! The channel itself (negotiation, authentication) is out of scope;
//! bring anything that implements [`DataChannel`].

pub use wicket_reflection as reflection;
pub use wicket_session as session;
pub use wicket_wire as wire;

pub use wicket_session::{
    CallError, CallOptions, Client, ClientConfig, Context, DataChannel, MemoryChannel, Server,
    ServerConfig, ServerStream, StreamSink, make_handler, make_streaming_handler,
};
pub use wicket_wire::{GrpcError, Metadata, Status, StatusCode};

//! Data channel abstraction.
//!
//! The core never establishes a channel itself; peer negotiation,
//! signaling, and authentication all happen elsewhere and hand over
//! something that can send, receive, and close. Implementations wrap e.g.
//! a WebRTC data channel; [`MemoryChannel`](crate::MemoryChannel) is the
//! in-process reference used by tests and demos.

use std::io;

/// An already-open, ordered, message-oriented bidirectional channel.
///
/// One channel per transport instance; the transports never pool or
/// multiplex across channels. Each `send` carries one discrete message
/// and each `recv` yields one, with ordering guaranteed by the channel.
pub trait DataChannel: Send + 'static {
    /// Send one message.
    fn send(&mut self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the channel has closed cleanly.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;

    /// Close the channel. Must be safe to call more than once.
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

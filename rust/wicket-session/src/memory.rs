//! In-process data channel, the semantic reference for transports.
//!
//! Messages pass through crossed unbounded channels without touching I/O.
//! Used by tests and demos; behavioral expectations for real channel
//! implementations are set here.

use std::io;

use tokio::sync::mpsc;

use crate::DataChannel;

/// One end of an in-memory channel pair.
pub struct MemoryChannel {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryChannel {
    /// Create a connected pair: messages sent on one end arrive on the other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx_b),
                rx: rx_a,
            },
            Self {
                tx: Some(tx_a),
                rx: rx_b,
            },
        )
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")
    }
}

impl DataChannel for MemoryChannel {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let tx = self.tx.as_ref().ok_or_else(Self::closed_error)?;
        tx.send(bytes.to_vec()).map_err(|_| Self::closed_error())
    }

    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> io::Result<()> {
        // Dropping the sender lets the peer's recv() return None.
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}

//! Transport abstraction the serve loop runs on.
//!
//! The engine does not care whether datagrams arrive from an OS UDP socket or
//! from the built-in SLIP decoder over a serial line; both present the same
//! wait/receive/reply surface and the dispatcher only ever sees
//! `(peer, payload)` pairs.

use std::io;
use std::net::SocketAddr;

/// Outcome of waiting for the next datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A datagram is ready to be received.
    Ready,
    /// The timeout elapsed with nothing to read.
    Timeout,
    /// The wait was interrupted by an asynchronous stop signal.
    Signal,
}

/// A single source of request datagrams and sink for reply datagrams.
pub trait Transport {
    /// Blocks until a datagram is available, the timeout expires, or a
    /// signal interrupts the wait.
    fn wait_for_data(&mut self, timeout_ms: u32) -> io::Result<WaitResult>;

    /// Receives one datagram into `buf`.
    ///
    /// Returns `None` when the transport consumed input that did not amount
    /// to a datagram for us (e.g. a non-UDP SLIP frame or an interrupted
    /// read); the caller just keeps looping.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Sends a reply to the peer of the most recently received datagram.
    fn send_reply(&mut self, data: &[u8]) -> io::Result<usize>;
}

//! The main serve loop: wait, receive, dispatch, reply.
//!
//! Single-threaded cooperative: the one blocking suspension point is
//! [`Transport::wait_for_data`]. Signal handlers only flip the stop flag and
//! interrupt the wait; in-flight operations always run to completion before
//! the loop observes the flag.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, trace};

use crate::dispatch::Dispatcher;
use crate::transport::{Transport, WaitResult};

/// How long one wait suspends before re-checking the stop flag.
pub const WAIT_TIMEOUT_MS: u32 = 10_000;

/// Receive buffer size; comfortably above the protocol MTU.
pub const RECV_BUFFER_LEN: usize = 2048;

/// Serves requests until `stop` is raised.
pub fn serve(
    dispatcher: &mut Dispatcher,
    transport: &mut dyn Transport,
    stop: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; RECV_BUFFER_LEN];

    while !stop.load(Ordering::Relaxed) {
        match transport.wait_for_data(WAIT_TIMEOUT_MS)? {
            WaitResult::Timeout => {
                trace!("wait_for_data: timeout");
                continue;
            }
            WaitResult::Signal => {
                debug!("wait_for_data: interrupted by a signal");
                continue;
            }
            WaitResult::Ready => {}
        }

        let Some((len, peer)) = transport.receive(&mut buf)? else {
            continue;
        };
        trace!("received {len} bytes from {peer}");

        if let Some(reply) = dispatcher.handle_packet(peer, &buf[..len]) {
            let sent = transport.send_reply(&reply)?;
            if sent != reply.len() {
                error!("reply: {sent} bytes sent but {} bytes requested", reply.len());
            }
        }
    }

    debug!("stop flag observed, leaving the serve loop");
    Ok(())
}

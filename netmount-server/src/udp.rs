//! OS UDP socket transport.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;

use netmount_core::{Transport, WaitResult};

/// Waits for readability with `poll(2)`; `EINTR` surfaces as a signal so the
/// serve loop can observe the stop flag.
pub fn poll_readable(fd: i32, timeout_ms: u32) -> io::Result<WaitResult> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms as libc::c_int) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(WaitResult::Signal);
        }
        return Err(err);
    }
    if rc == 0 {
        Ok(WaitResult::Timeout)
    } else {
        Ok(WaitResult::Ready)
    }
}

/// Datagram source backed by a bound kernel UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    last_peer: Option<SocketAddr>,
}

impl UdpTransport {
    pub fn bind(addr: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((addr, port))?;
        Ok(UdpTransport {
            socket,
            last_peer: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn wait_for_data(&mut self, timeout_ms: u32) -> io::Result<WaitResult> {
        poll_readable(self.socket.as_raw_fd(), timeout_ms)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, peer)) => {
                self.last_peer = Some(peer);
                Ok(Some((len, peer)))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send_reply(&mut self, data: &[u8]) -> io::Result<usize> {
        let peer = self.last_peer.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no request received yet")
        })?;
        self.socket.send_to(data, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_round_trip() {
        let mut server = UdpTransport::bind(Ipv4Addr::LOCALHOST, 0).unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        client.send_to(b"ping", server_addr).unwrap();

        assert_eq!(server.wait_for_data(1000).unwrap(), WaitResult::Ready);
        let mut buf = [0u8; 64];
        let (len, peer) = server.receive(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(peer, client.local_addr().unwrap());

        assert_eq!(server.send_reply(b"pong").unwrap(), 4);
        let mut buf = [0u8; 64];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"pong");
    }

    #[test]
    fn test_wait_times_out() {
        let mut server = UdpTransport::bind(Ipv4Addr::LOCALHOST, 0).unwrap();
        assert_eq!(server.wait_for_data(10).unwrap(), WaitResult::Timeout);
    }

    #[test]
    fn test_reply_without_peer_fails() {
        let mut server = UdpTransport::bind(Ipv4Addr::LOCALHOST, 0).unwrap();
        assert!(server.send_reply(b"x").is_err());
    }
}

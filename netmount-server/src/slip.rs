//! SLIP framing and the IPv4/UDP codec over a serial line.
//!
//! Inbound frames are decoded byte-wise (END=0xC0, ESC=0xDB), parsed as
//! IPv4+UDP with a mandatory IP header checksum, and handed to the engine as
//! plain datagrams. Replies are rebuilt as IPv4+UDP with a fresh monotonic
//! identification, the don't-fragment flag and TTL 64, then re-framed.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::Path;

use netmount_core::{Transport, WaitResult};
use tracing::{debug, trace, warn};

use crate::serial::SerialPort;
use crate::udp::poll_readable;

pub const SLIP_END: u8 = 0xC0;
pub const SLIP_ESC: u8 = 0xDB;
pub const SLIP_ESC_END: u8 = 0xDC;
pub const SLIP_ESC_ESC: u8 = 0xDD;

const MTU: usize = 1500;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const HEADERS_LEN: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;
const IPV4_PROTOCOL_UDP: u8 = 17;

/// RFC 1071 one's-complement checksum.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Wraps `payload` in a SLIP frame, escaping END and ESC bytes.
pub fn slip_encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(SLIP_END);
    for &byte in payload {
        match byte {
            SLIP_END => {
                out.push(SLIP_ESC);
                out.push(SLIP_ESC_END);
            }
            SLIP_ESC => {
                out.push(SLIP_ESC);
                out.push(SLIP_ESC_ESC);
            }
            _ => out.push(byte),
        }
    }
    out.push(SLIP_END);
    out
}

/// Addresses and payload of an inbound IPv4/UDP datagram.
#[derive(Debug, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub payload: &'a [u8],
}

/// Parses an IPv4+UDP packet. The IPv4 header checksum is mandatory; the
/// UDP checksum is ignored. Anything not UDP-over-IPv4 yields `None`.
pub fn parse_ipv4_udp(frame: &[u8]) -> Option<UdpDatagram<'_>> {
    if frame.len() < HEADERS_LEN {
        debug!("short datagram received ({} bytes)", frame.len());
        return None;
    }
    if frame[0] >> 4 != 4 {
        debug!("received datagram is not an IPv4 packet");
        return None;
    }
    if usize::from(frame[0] & 0x0F) * 4 != IPV4_HEADER_LEN {
        warn!("received datagram has an unsupported IPv4 header length");
        return None;
    }
    if internet_checksum(&frame[..IPV4_HEADER_LEN]) != 0 {
        warn!("received datagram has an invalid IPv4 header checksum");
        return None;
    }
    if frame[9] != IPV4_PROTOCOL_UDP {
        trace!("received datagram is not a UDP packet");
        return None;
    }

    let total_len = usize::from(u16::from_be_bytes([frame[2], frame[3]]));
    if frame.len() < total_len {
        warn!("corrupted datagram received, shorter than its total length");
        return None;
    }

    let udp_len = usize::from(u16::from_be_bytes([frame[24], frame[25]]));
    if udp_len < UDP_HEADER_LEN {
        warn!("corrupted datagram received, short UDP length");
        return None;
    }
    if frame.len() < IPV4_HEADER_LEN + udp_len {
        warn!("corrupted datagram received, shorter than its UDP length");
        return None;
    }

    let src_ip = std::net::Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let dst_ip = std::net::Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);
    let src_port = u16::from_be_bytes([frame[20], frame[21]]);
    let dst_port = u16::from_be_bytes([frame[22], frame[23]]);

    Some(UdpDatagram {
        src: SocketAddrV4::new(src_ip, src_port),
        dst: SocketAddrV4::new(dst_ip, dst_port),
        payload: &frame[HEADERS_LEN..IPV4_HEADER_LEN + udp_len],
    })
}

/// Builds an IPv4+UDP packet: don't-fragment, TTL 64, valid IP checksum,
/// UDP checksum unused.
pub fn build_ipv4_udp(src: SocketAddrV4, dst: SocketAddrV4, id: u16, payload: &[u8]) -> Vec<u8> {
    let total_len = HEADERS_LEN + payload.len();
    let mut out = vec![0u8; total_len];

    out[0] = 0x45; // version 4, header length 20
    out[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    out[4..6].copy_from_slice(&id.to_be_bytes());
    out[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    out[8] = 64; // TTL
    out[9] = IPV4_PROTOCOL_UDP;
    out[12..16].copy_from_slice(&src.ip().octets());
    out[16..20].copy_from_slice(&dst.ip().octets());
    let checksum = internet_checksum(&out[..IPV4_HEADER_LEN]);
    out[10..12].copy_from_slice(&checksum.to_be_bytes());

    out[20..22].copy_from_slice(&src.port().to_be_bytes());
    out[22..24].copy_from_slice(&dst.port().to_be_bytes());
    out[24..26].copy_from_slice(&((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
    // bytes 26..28 stay zero: UDP checksum unused

    out[HEADERS_LEN..].copy_from_slice(payload);
    out
}

/// Datagram source over a SLIP-framed serial line.
pub struct SlipTransport {
    serial: SerialPort,
    last_peer: Option<SocketAddrV4>,
    /// Destination of the last inbound packet, i.e. our own address.
    last_local: Option<SocketAddrV4>,
    next_packet_id: u16,
    rx_frame: Vec<u8>,
}

impl SlipTransport {
    pub fn open(device: &Path, baud_rate: u32, rts_cts: bool) -> io::Result<Self> {
        let mut serial = SerialPort::open(device)?;
        serial.setup(baud_rate, rts_cts)?;
        Ok(SlipTransport {
            serial,
            last_peer: None,
            last_local: None,
            next_packet_id: 0,
            rx_frame: Vec::with_capacity(MTU),
        })
    }

    /// Reads one SLIP frame into `rx_frame`. `false` when the read was
    /// interrupted or the frame was oversized and dropped.
    fn read_frame(&mut self) -> io::Result<bool> {
        self.rx_frame.clear();
        let mut started = false;

        loop {
            let Some(byte) = self.serial.read_byte()? else {
                return Ok(false);
            };

            if byte == SLIP_END {
                if started && !self.rx_frame.is_empty() {
                    return Ok(true);
                }
                started = true;
                continue;
            }
            if !started {
                trace!("byte outside a SLIP frame ignored");
                continue;
            }
            if self.rx_frame.len() == MTU {
                warn!("SLIP frame bigger than the MTU ({MTU}), dropped");
                return Ok(false);
            }

            if byte == SLIP_ESC {
                let Some(escaped) = self.serial.read_byte()? else {
                    return Ok(false);
                };
                match escaped {
                    SLIP_ESC_END => self.rx_frame.push(SLIP_END),
                    SLIP_ESC_ESC => self.rx_frame.push(SLIP_ESC),
                    other => trace!("invalid SLIP escape 0x{other:02X} ignored"),
                }
            } else {
                self.rx_frame.push(byte);
            }
        }
    }
}

impl Transport for SlipTransport {
    fn wait_for_data(&mut self, timeout_ms: u32) -> io::Result<WaitResult> {
        poll_readable(self.serial.raw_fd(), timeout_ms)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        if !self.read_frame()? {
            return Ok(None);
        }
        let Some(datagram) = parse_ipv4_udp(&self.rx_frame) else {
            return Ok(None);
        };

        let len = datagram.payload.len();
        if len > buf.len() {
            warn!("UDP payload bigger than the receive buffer, dropped");
            return Ok(None);
        }
        buf[..len].copy_from_slice(datagram.payload);
        let (src, dst) = (datagram.src, datagram.dst);

        self.last_peer = Some(src);
        self.last_local = Some(dst);
        Ok(Some((len, SocketAddr::V4(src))))
    }

    fn send_reply(&mut self, data: &[u8]) -> io::Result<usize> {
        let (Some(peer), Some(local)) = (self.last_peer, self.last_local) else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no request received yet",
            ));
        };
        if data.len() > MTU - HEADERS_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("reply is bigger than the MTU ({MTU})"),
            ));
        }

        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        // the reply goes out from the address the request was sent to
        let packet = build_ipv4_udp(local, peer, self.next_packet_id, data);
        let encoded = slip_encode(&packet);
        self.serial.write_all(&encoded)?;
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slip_decode(frame: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut iter = frame.iter().copied();
        while let Some(byte) = iter.next() {
            match byte {
                SLIP_END => {}
                SLIP_ESC => match iter.next() {
                    Some(SLIP_ESC_END) => out.push(SLIP_END),
                    Some(SLIP_ESC_ESC) => out.push(SLIP_ESC),
                    _ => {}
                },
                other => out.push(other),
            }
        }
        out
    }

    #[test]
    fn test_slip_escaping_round_trip() {
        let payload = [0x01, SLIP_END, 0x02, SLIP_ESC, 0x03];
        let encoded = slip_encode(&payload);
        assert_eq!(encoded[0], SLIP_END);
        assert_eq!(*encoded.last().unwrap(), SLIP_END);
        // neither special byte appears unescaped in the body
        assert!(!encoded[1..encoded.len() - 1].contains(&SLIP_END));
        assert_eq!(slip_decode(&encoded), payload);
    }

    #[test]
    fn test_ipv4_udp_round_trip() {
        let src = "10.0.0.2:12200".parse().unwrap();
        let dst = "10.0.0.1:1024".parse().unwrap();
        let packet = build_ipv4_udp(src, dst, 7, b"hello dos");

        // a freshly built header checksums to zero
        assert_eq!(internet_checksum(&packet[..20]), 0);

        let datagram = parse_ipv4_udp(&packet).unwrap();
        assert_eq!(datagram.src, src);
        assert_eq!(datagram.dst, dst);
        assert_eq!(datagram.payload, b"hello dos");
    }

    #[test]
    fn test_corrupted_header_is_rejected() {
        let src = "10.0.0.2:12200".parse().unwrap();
        let dst = "10.0.0.1:1024".parse().unwrap();
        let mut packet = build_ipv4_udp(src, dst, 7, b"x");

        packet[8] = packet[8].wrapping_add(1); // TTL changes, checksum breaks
        assert!(parse_ipv4_udp(&packet).is_none());
    }

    #[test]
    fn test_non_udp_is_rejected() {
        let src = "10.0.0.2:12200".parse().unwrap();
        let dst = "10.0.0.1:1024".parse().unwrap();
        let mut packet = build_ipv4_udp(src, dst, 7, b"x");

        packet[9] = 6; // TCP
        let checksum = {
            packet[10] = 0;
            packet[11] = 0;
            internet_checksum(&packet[..20])
        };
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert!(parse_ipv4_udp(&packet).is_none());
    }

    #[test]
    fn test_truncated_packet_is_rejected() {
        let src = "10.0.0.2:12200".parse().unwrap();
        let dst = "10.0.0.1:1024".parse().unwrap();
        let packet = build_ipv4_udp(src, dst, 7, b"some payload");
        assert!(parse_ipv4_udp(&packet[..packet.len() - 4]).is_none());
    }

    #[test]
    fn test_don_t_fragment_and_ttl() {
        let src = "10.0.0.2:12200".parse().unwrap();
        let dst = "10.0.0.1:1024".parse().unwrap();
        let packet = build_ipv4_udp(src, dst, 42, b"");
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 0x4000);
        assert_eq!(packet[8], 64);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 42);
    }
}

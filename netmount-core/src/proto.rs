//! Wire protocol: the request/reply header, the per-function payload records
//! and the packet checksum.
//!
//! Every datagram carries exactly one request or one reply. All NetMount
//! fields are little endian on the wire; the encoders and decoders below are
//! explicit per field so the host ABI never leaks into the packet layout.

use crate::dos::FcbName;

/// Protocol version spoken by this server.
pub const PROTO_VERSION: u8 = 1;

/// Constant carried in the checksum field when checksumming is disabled.
pub const PROTO_MAGIC: u16 = 0x4D6E;

/// Default UDP port of the server.
pub const PROTO_UDP_PORT: u16 = 12200;

/// Largest request or reply datagram.
pub const MAX_PACKET_LEN: usize = 1500;

/// Size of the packet header in bytes.
pub const HEADER_LEN: usize = 10;

/// Bits 0-10 of `length_flags`: total packet length including the header.
pub const LENGTH_MASK: u16 = 0x07FF;

/// Bit 15 of `length_flags`: the checksum field holds a real checksum.
pub const FLAG_CHECKSUM: u16 = 0x8000;

/// Bit 14 of `length_flags`: reply comes from a read-only share.
pub const FLAG_READ_ONLY: u16 = 0x4000;

/// INT 2F network redirector subfunctions understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Function {
    RemoveDir = 0x01,
    MakeDir = 0x03,
    ChangeDir = 0x05,
    CloseFile = 0x06,
    ReadFile = 0x08,
    WriteFile = 0x09,
    LockUnlockFile = 0x0A,
    UnlockFile = 0x0B,
    SetAttrs = 0x0E,
    GetAttrs = 0x0F,
    RenameFile = 0x11,
    DeleteFile = 0x13,
    DiskInfo = 0x15,
    OpenFile = 0x16,
    CreateFile = 0x17,
    FindFirst = 0x1B,
    FindNext = 0x1C,
    SeekFromEnd = 0x21,
    ExtendedOpenCreateFile = 0x2E,
}

impl TryFrom<u8> for Function {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::RemoveDir),
            0x03 => Ok(Self::MakeDir),
            0x05 => Ok(Self::ChangeDir),
            0x06 => Ok(Self::CloseFile),
            0x08 => Ok(Self::ReadFile),
            0x09 => Ok(Self::WriteFile),
            0x0A => Ok(Self::LockUnlockFile),
            0x0B => Ok(Self::UnlockFile),
            0x0E => Ok(Self::SetAttrs),
            0x0F => Ok(Self::GetAttrs),
            0x11 => Ok(Self::RenameFile),
            0x13 => Ok(Self::DeleteFile),
            0x15 => Ok(Self::DiskInfo),
            0x16 => Ok(Self::OpenFile),
            0x17 => Ok(Self::CreateFile),
            0x1B => Ok(Self::FindFirst),
            0x1C => Ok(Self::FindNext),
            0x21 => Ok(Self::SeekFromEnd),
            0x2E => Ok(Self::ExtendedOpenCreateFile),
            _ => Err(value),
        }
    }
}

/// Action code of EXTENDED OPEN/CREATE: low nibble picks the behavior when
/// the file exists, high nibble when it does not.
pub const ACTION_IF_EXIST_MASK: u16 = 0x0F;
pub const ACTION_FAIL_IF_EXIST: u16 = 0x00;
pub const ACTION_OPEN_IF_EXIST: u16 = 0x01;
pub const ACTION_REPLACE_IF_EXIST: u16 = 0x02;
pub const ACTION_IF_NOT_EXIST_MASK: u16 = 0xF0;
pub const ACTION_CREATE_IF_NOT_EXIST: u16 = 0x10;

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Packet header, common to requests and replies.
///
/// `ax` is zero in requests and carries the DOS return code in replies;
/// `drive`, `function` and `sequence` are echoed from request to reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length_flags: u16,
    pub checksum: u16,
    pub ax: u16,
    pub drive: u8,
    pub function: u8,
    pub sequence: u8,
    pub version: u8,
}

impl Header {
    /// Decodes a header from the start of `buf`; `None` if too short.
    pub fn decode(buf: &[u8]) -> Option<Header> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Header {
            length_flags: get_u16(buf, 0),
            checksum: get_u16(buf, 2),
            ax: get_u16(buf, 4),
            drive: buf[6],
            function: buf[7],
            sequence: buf[8],
            version: buf[9],
        })
    }

    /// Encodes the header into the first [`HEADER_LEN`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.length_flags.to_le_bytes());
        buf[2..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4..6].copy_from_slice(&self.ax.to_le_bytes());
        buf[6] = self.drive;
        buf[7] = self.function;
        buf[8] = self.sequence;
        buf[9] = self.version;
    }

    /// Total packet length declared in `length_flags`.
    pub fn length(&self) -> usize {
        (self.length_flags & LENGTH_MASK) as usize
    }

    pub fn has_checksum(&self) -> bool {
        self.length_flags & FLAG_CHECKSUM != 0
    }

    /// Drive number 0..=25 (A..Z); the high three bits are reserved.
    pub fn drive_num(&self) -> u8 {
        self.drive & 0x1F
    }
}

/// BSD rolling checksum over everything that follows the checksum field.
pub fn bsd_checksum(data: &[u8]) -> u16 {
    let mut acc: u16 = 0;
    for &b in data {
        acc = acc.rotate_right(1).wrapping_add(u16::from(b));
    }
    acc
}

/// Region of a packet covered by the checksum (or the magic check).
pub fn checksum_region(packet: &[u8]) -> &[u8] {
    &packet[4..]
}

/// READ_FILE request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFileRequest {
    pub offset: u32,
    pub start_cluster: u16,
    pub length: u16,
}

impl ReadFileRequest {
    pub const SIZE: usize = 8;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            offset: get_u32(buf, 0),
            start_cluster: get_u16(buf, 4),
            length: get_u16(buf, 6),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.start_cluster.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
    }
}

/// WRITE_FILE request record; the payload bytes follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFileRequest {
    pub offset: u32,
    pub start_cluster: u16,
}

impl WriteFileRequest {
    pub const SIZE: usize = 6;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            offset: get_u32(buf, 0),
            start_cluster: get_u16(buf, 4),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.start_cluster.to_le_bytes());
    }
}

/// WRITE_FILE reply record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFileReply {
    pub written: u16,
}

impl WriteFileReply {
    pub const SIZE: usize = 2;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            written: get_u16(buf, 0),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.written.to_le_bytes());
    }
}

/// CLOSE_FILE request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseFileRequest {
    pub start_cluster: u16,
}

impl CloseFileRequest {
    pub const SIZE: usize = 2;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            start_cluster: get_u16(buf, 0),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start_cluster.to_le_bytes());
    }
}

/// LOCK/UNLOCK request record; lock ranges follow it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockFileRequest {
    pub params_count: u16,
    pub start_cluster: u16,
}

impl LockFileRequest {
    pub const SIZE: usize = 4;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            params_count: get_u16(buf, 0),
            start_cluster: get_u16(buf, 2),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.params_count.to_le_bytes());
        out.extend_from_slice(&self.start_cluster.to_le_bytes());
    }
}

/// DISK_INFO reply record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfoReply {
    pub total_clusters: u16,
    pub bytes_per_sector: u16,
    pub available_clusters: u16,
}

impl DiskInfoReply {
    pub const SIZE: usize = 6;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            total_clusters: get_u16(buf, 0),
            bytes_per_sector: get_u16(buf, 2),
            available_clusters: get_u16(buf, 4),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.total_clusters.to_le_bytes());
        out.extend_from_slice(&self.bytes_per_sector.to_le_bytes());
        out.extend_from_slice(&self.available_clusters.to_le_bytes());
    }
}

/// GET_ATTRS reply record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetAttrsReply {
    pub time: u16,
    pub date: u16,
    pub size_lo: u16,
    pub size_hi: u16,
    pub attrs: u8,
}

impl GetAttrsReply {
    pub const SIZE: usize = 9;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            time: get_u16(buf, 0),
            date: get_u16(buf, 2),
            size_lo: get_u16(buf, 4),
            size_hi: get_u16(buf, 6),
            attrs: buf[8],
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.date.to_le_bytes());
        out.extend_from_slice(&self.size_lo.to_le_bytes());
        out.extend_from_slice(&self.size_hi.to_le_bytes());
        out.push(self.attrs);
    }
}

/// OPEN/CREATE/EXTENDED_OPEN_CREATE request record; the file name follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenCreateRequest {
    pub attrs: u16,
    pub action: u16,
    pub mode: u16,
}

impl OpenCreateRequest {
    pub const SIZE: usize = 6;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            attrs: get_u16(buf, 0),
            action: get_u16(buf, 2),
            mode: get_u16(buf, 4),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.attrs.to_le_bytes());
        out.extend_from_slice(&self.action.to_le_bytes());
        out.extend_from_slice(&self.mode.to_le_bytes());
    }
}

/// OPEN/CREATE/EXTENDED_OPEN_CREATE reply record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenCreateReply {
    pub attrs: u8,
    pub name: FcbName,
    pub date_time: u32,
    pub size: u32,
    pub start_cluster: u16,
    pub result_code: u16,
    pub mode: u8,
}

impl OpenCreateReply {
    pub const SIZE: usize = 25;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        let mut name = [0u8; 11];
        name.copy_from_slice(&buf[1..12]);
        Some(Self {
            attrs: buf[0],
            name: FcbName::from_bytes(name),
            date_time: get_u32(buf, 12),
            size: get_u32(buf, 16),
            start_cluster: get_u16(buf, 20),
            result_code: get_u16(buf, 22),
            mode: buf[24],
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.attrs);
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&self.date_time.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.start_cluster.to_le_bytes());
        out.extend_from_slice(&self.result_code.to_le_bytes());
        out.push(self.mode);
    }
}

/// FIND_NEXT request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindNextRequest {
    pub cluster: u16,
    pub dir_entry: u16,
    pub attrs: u8,
    pub search_template: FcbName,
}

impl FindNextRequest {
    pub const SIZE: usize = 16;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        let mut tmpl = [0u8; 11];
        tmpl.copy_from_slice(&buf[5..16]);
        Some(Self {
            cluster: get_u16(buf, 0),
            dir_entry: get_u16(buf, 2),
            attrs: buf[4],
            search_template: FcbName::from_bytes(tmpl),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.cluster.to_le_bytes());
        out.extend_from_slice(&self.dir_entry.to_le_bytes());
        out.push(self.attrs);
        out.extend_from_slice(self.search_template.as_bytes());
    }
}

/// FIND_FIRST / FIND_NEXT reply record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindReply {
    pub attrs: u8,
    pub name: FcbName,
    pub time: u16,
    pub date: u16,
    pub size: u32,
    pub start_cluster: u16,
    pub dir_entry: u16,
}

impl FindReply {
    pub const SIZE: usize = 24;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        let mut name = [0u8; 11];
        name.copy_from_slice(&buf[1..12]);
        Some(Self {
            attrs: buf[0],
            name: FcbName::from_bytes(name),
            time: get_u16(buf, 12),
            date: get_u16(buf, 14),
            size: get_u32(buf, 16),
            start_cluster: get_u16(buf, 20),
            dir_entry: get_u16(buf, 22),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.attrs);
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.date.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.start_cluster.to_le_bytes());
        out.extend_from_slice(&self.dir_entry.to_le_bytes());
    }
}

/// SEEK_FROM_END request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekFromEndRequest {
    pub offset_from_end_lo: u16,
    pub offset_from_end_hi: u16,
    pub start_cluster: u16,
}

impl SeekFromEndRequest {
    pub const SIZE: usize = 6;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            offset_from_end_lo: get_u16(buf, 0),
            offset_from_end_hi: get_u16(buf, 2),
            start_cluster: get_u16(buf, 4),
        })
    }

    /// The signed offset from the end of the file.
    pub fn offset(&self) -> i32 {
        ((u32::from(self.offset_from_end_hi) << 16) | u32::from(self.offset_from_end_lo)) as i32
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset_from_end_lo.to_le_bytes());
        out.extend_from_slice(&self.offset_from_end_hi.to_le_bytes());
        out.extend_from_slice(&self.start_cluster.to_le_bytes());
    }
}

/// SEEK_FROM_END reply record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekFromEndReply {
    pub position_lo: u16,
    pub position_hi: u16,
}

impl SeekFromEndReply {
    pub const SIZE: usize = 4;

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            position_lo: get_u16(buf, 0),
            position_hi: get_u16(buf, 2),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.position_lo.to_le_bytes());
        out.extend_from_slice(&self.position_hi.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = Header {
            length_flags: FLAG_CHECKSUM | 0x1F4,
            checksum: 0xBEEF,
            ax: 0,
            drive: 3,
            function: Function::FindFirst as u8,
            sequence: 42,
            version: PROTO_VERSION,
        };
        let mut buf = [0u8; HEADER_LEN];
        header.encode(&mut buf);
        assert_eq!(Header::decode(&buf), Some(header));
        assert_eq!(header.length(), 0x1F4);
        assert!(header.has_checksum());
    }

    #[test]
    fn test_header_too_short() {
        assert_eq!(Header::decode(&[0u8; HEADER_LEN - 1]), None);
    }

    #[test]
    fn test_header_flags() {
        let mut buf = [0u8; HEADER_LEN];
        Header {
            length_flags: FLAG_READ_ONLY | 10,
            checksum: PROTO_MAGIC,
            ax: 0,
            drive: 2,
            function: 0,
            sequence: 0,
            version: PROTO_VERSION,
        }
        .encode(&mut buf);
        let header = Header::decode(&buf).unwrap();
        assert!(!header.has_checksum());
        assert_eq!(header.length_flags & FLAG_READ_ONLY, FLAG_READ_ONLY);
        assert_eq!(header.length(), 10);
    }

    #[test]
    fn test_bsd_checksum() {
        // acc starts at 0; each step rotates right then adds the byte
        assert_eq!(bsd_checksum(&[]), 0);
        assert_eq!(bsd_checksum(&[1]), 1);
        // 1 rotated right is 0x8000, plus 2 gives 0x8002
        assert_eq!(bsd_checksum(&[1, 2]), 0x8002);
        // order matters
        assert_ne!(bsd_checksum(&[2, 1]), bsd_checksum(&[1, 2]));
    }

    #[test]
    fn test_read_request_round_trip() {
        let req = ReadFileRequest {
            offset: 0x11223344,
            start_cluster: 7,
            length: 512,
        };
        let mut buf = Vec::new();
        req.encode(&mut buf);
        assert_eq!(buf.len(), ReadFileRequest::SIZE);
        assert_eq!(ReadFileRequest::decode(&buf), Some(req));
    }

    #[test]
    fn test_find_reply_layout() {
        let reply = FindReply {
            attrs: 0x20,
            name: FcbName::from_short_name("HELLO.TXT"),
            time: 0x1234,
            date: 0x5678,
            size: 1000,
            start_cluster: 3,
            dir_entry: 9,
        };
        let mut buf = Vec::new();
        reply.encode(&mut buf);
        assert_eq!(buf.len(), FindReply::SIZE);
        assert_eq!(buf[0], 0x20);
        assert_eq!(&buf[1..12], b"HELLO   TXT");
        assert_eq!(FindReply::decode(&buf), Some(reply));
    }

    #[test]
    fn test_open_create_reply_layout() {
        let reply = OpenCreateReply {
            attrs: 0x20,
            name: FcbName::from_short_name("A.BIN"),
            date_time: 0xAABBCCDD,
            size: 42,
            start_cluster: 11,
            result_code: 2,
            mode: 2,
        };
        let mut buf = Vec::new();
        reply.encode(&mut buf);
        assert_eq!(buf.len(), OpenCreateReply::SIZE);
        assert_eq!(OpenCreateReply::decode(&buf), Some(reply));
    }

    #[test]
    fn test_find_next_request_round_trip() {
        let req = FindNextRequest {
            cluster: 4,
            dir_entry: 17,
            attrs: 0x16,
            search_template: FcbName::from_bytes(*b"????????TXT"),
        };
        let mut buf = Vec::new();
        req.encode(&mut buf);
        assert_eq!(buf.len(), FindNextRequest::SIZE);
        assert_eq!(FindNextRequest::decode(&buf), Some(req));
    }

    #[test]
    fn test_seek_offset_is_signed() {
        let req = SeekFromEndRequest {
            offset_from_end_lo: 0xFFF6,
            offset_from_end_hi: 0xFFFF,
            start_cluster: 0,
        };
        assert_eq!(req.offset(), -10);
    }

    #[test]
    fn test_function_from_u8() {
        assert_eq!(Function::try_from(0x15), Ok(Function::DiskInfo));
        assert_eq!(Function::try_from(0x1B), Ok(Function::FindFirst));
        assert_eq!(Function::try_from(0x2E), Ok(Function::ExtendedOpenCreateFile));
        assert_eq!(Function::try_from(0x7F), Err(0x7F));
    }
}

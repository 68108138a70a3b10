//! DOS-side data types: FCB file names, attribute bits, extended error codes
//! and packed time/date stamps.
//!
//! These are shared between the wire protocol and the filesystem adapter.

use std::fmt;
use std::time::SystemTime;

use time::macros::datetime;
use time::OffsetDateTime;

/// DOS file attribute bits (1=RO 2=HID 4=SYS 8=VOL 16=DIR 32=ARCH 64=DEVICE).
pub const ATTR_NONE: u8 = 0x00;
pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_DEVICE: u8 = 0x40;

/// Attribute bits that can be stored for a filesystem item.
pub const ATTR_STORABLE: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_ARCHIVE;

/// DOS extended error codes carried in the reply `AX` field.
pub const ERR_NO_ERROR: u16 = 0x00;
pub const ERR_FILE_NOT_FOUND: u16 = 0x02;
pub const ERR_PATH_NOT_FOUND: u16 = 0x03;
pub const ERR_ACCESS_DENIED: u16 = 0x05;
pub const ERR_NO_MORE_FILES: u16 = 0x12;
pub const ERR_WRITE_FAULT: u16 = 0x1D;

/// CX result codes of EXTENDED OPEN/CREATE (DOS 4.0+ network redirector).
pub const RESULT_CODE_OPENED: u16 = 1;
pub const RESULT_CODE_CREATED: u16 = 2;
pub const RESULT_CODE_TRUNCATED: u16 = 3;

fn ascii_to_upper(b: u8) -> u8 {
    if b.is_ascii_lowercase() {
        b - b'a' + b'A'
    } else {
        b
    }
}

/// FCB (file control block) style file name: 8 name bytes plus 3 extension
/// bytes, blank padded, uppercase.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FcbName([u8; 11]);

impl FcbName {
    pub const LEN: usize = 11;
    pub const NAME_LEN: usize = 8;
    pub const EXT_LEN: usize = 3;

    /// An all-blank name.
    pub fn blank() -> Self {
        FcbName([b' '; 11])
    }

    pub fn from_bytes(bytes: [u8; 11]) -> Self {
        FcbName(bytes)
    }

    /// Builds an FCB name from a short name such as `FILE.TXT`, `.` or `..`.
    ///
    /// Characters are uppercased and overlong fields silently truncated; use
    /// the name mapper for long host names that need `~N` disambiguation.
    pub fn from_short_name(short_name: &str) -> Self {
        let mut fcb = [b' '; 11];
        let bytes = short_name.as_bytes();
        let mut pos = 0;
        let mut i = 0;

        // leading dots name the '.' and '..' directory entries
        while pos < bytes.len() && bytes[pos] == b'.' && i < 2 {
            fcb[i] = b'.';
            i += 1;
            pos += 1;
        }
        while pos < bytes.len() && bytes[pos] != b'.' && i < Self::NAME_LEN {
            fcb[i] = ascii_to_upper(bytes[pos]);
            i += 1;
            pos += 1;
        }

        // move past the base up to the extension dot
        while pos < bytes.len() && bytes[pos] != b'.' {
            pos += 1;
        }
        if pos < bytes.len() {
            pos += 1;
        }

        let mut i = 0;
        while pos < bytes.len() && bytes[pos] != b'.' && i < Self::EXT_LEN {
            fcb[Self::NAME_LEN + i] = ascii_to_upper(bytes[pos]);
            i += 1;
            pos += 1;
        }

        FcbName(fcb)
    }

    /// Builds an 11-byte volume label (no name/extension split).
    pub fn from_label(label: &str) -> Self {
        let mut fcb = [b' '; 11];
        for (slot, b) in fcb.iter_mut().zip(label.bytes()) {
            *slot = ascii_to_upper(b);
        }
        FcbName(fcb)
    }

    pub fn as_bytes(&self) -> &[u8; 11] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; 11] {
        &mut self.0
    }

    pub fn name_bytes(&self) -> &[u8] {
        &self.0[..Self::NAME_LEN]
    }

    pub fn ext_bytes(&self) -> &[u8] {
        &self.0[Self::NAME_LEN..]
    }

    /// True for the `.` and `..` directory entries.
    pub fn is_dot_entry(&self) -> bool {
        self.0[0] == b'.'
    }

    /// Tests this name (used as a search mask) against `name`.
    ///
    /// Bytes match byte-for-byte after uppercasing; `?` matches any single
    /// byte. There is no `*` on the wire - clients expand it to `?` padding.
    pub fn matches(&self, name: &FcbName) -> bool {
        self.0
            .iter()
            .zip(name.0.iter())
            .all(|(&m, &n)| m == b'?' || ascii_to_upper(m) == ascii_to_upper(n))
    }
}

impl fmt::Display for FcbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = String::from_utf8_lossy(self.name_bytes());
        let ext = String::from_utf8_lossy(self.ext_bytes());
        let name = name.trim_end();
        let ext = ext.trim_end();
        if ext.is_empty() {
            write!(f, "{}", name)
        } else {
            write!(f, "{}.{}", name, ext)
        }
    }
}

impl fmt::Debug for FcbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FcbName({:?})", String::from_utf8_lossy(&self.0))
    }
}

const DOS_TIME_MIN: OffsetDateTime = datetime!(1980-01-01 00:00:00 UTC);
const DOS_TIME_MAX: OffsetDateTime = datetime!(2107-12-31 23:59:58 UTC);

/// The packed stamp of 1980-01-01T00:00:00, used for dangling symlinks.
pub const DOS_TIME_EPOCH: u32 = 0x0021_0000;

/// Converts a host timestamp into the packed DOS date/time format.
///
/// Date in the high word (7 bits year from 1980, 4 month, 5 day), time in the
/// low word (5 hours, 6 minutes, 5 half-seconds). The host time is clamped to
/// the representable 1980..=2107 range before packing.
pub fn dos_time_from_system(t: SystemTime) -> u32 {
    let mut dt = OffsetDateTime::from(t);
    if dt < DOS_TIME_MIN {
        dt = DOS_TIME_MIN;
    } else if dt > DOS_TIME_MAX {
        dt = DOS_TIME_MAX;
    }

    let date = (((dt.year() - 1980) as u32) << 9) | ((dt.month() as u32) << 5) | dt.day() as u32;
    let time =
        ((dt.hour() as u32) << 11) | ((dt.minute() as u32) << 5) | (dt.second() as u32 / 2);
    (date << 16) | time
}

/// Unpacks a DOS date/time stamp into (year, month, day, hour, minute, second).
pub fn dos_time_fields(packed: u32) -> (i32, u8, u8, u8, u8, u8) {
    let date = (packed >> 16) as u16;
    let time = packed as u16;
    (
        1980 + (date >> 9) as i32,
        ((date >> 5) & 0x0F) as u8,
        (date & 0x1F) as u8,
        (time >> 11) as u8,
        ((time >> 5) & 0x3F) as u8,
        ((time & 0x1F) as u8) * 2,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_short_name() {
        let fcb = FcbName::from_short_name("file.txt");
        assert_eq!(fcb.as_bytes(), b"FILE    TXT");
        assert_eq!(fcb.to_string(), "FILE.TXT");

        let fcb = FcbName::from_short_name("COMMAND");
        assert_eq!(fcb.as_bytes(), b"COMMAND    ");
        assert_eq!(fcb.to_string(), "COMMAND");
    }

    #[test]
    fn test_from_short_name_truncates() {
        let fcb = FcbName::from_short_name("verylongname.extension");
        assert_eq!(fcb.as_bytes(), b"VERYLONGEXT");
    }

    #[test]
    fn test_dot_entries() {
        let dot = FcbName::from_short_name(".");
        assert_eq!(dot.as_bytes(), b".          ");
        assert!(dot.is_dot_entry());

        let dotdot = FcbName::from_short_name("..");
        assert_eq!(dotdot.as_bytes(), b"..         ");
        assert!(dotdot.is_dot_entry());
    }

    #[test]
    fn test_mask_matching() {
        let name = FcbName::from_short_name("README.TXT");
        assert!(FcbName::from_bytes(*b"README  TXT").matches(&name));
        assert!(FcbName::from_bytes(*b"????????TXT").matches(&name));
        assert!(FcbName::from_bytes(*b"???????????").matches(&name));
        assert!(!FcbName::from_bytes(*b"????????COM").matches(&name));
        assert!(!FcbName::from_bytes(*b"OTHER   TXT").matches(&name));
    }

    #[test]
    fn test_mask_matching_is_case_insensitive() {
        let name = FcbName::from_bytes(*b"readme  txt");
        assert!(FcbName::from_bytes(*b"README  TXT").matches(&name));
    }

    #[test]
    fn test_volume_label() {
        let label = FcbName::from_label("GameDisk");
        assert_eq!(label.as_bytes(), b"GAMEDISK   ");
    }

    #[test]
    fn test_time_packing() {
        let t: SystemTime = datetime!(2026-08-02 13:45:31 UTC).into();
        let packed = dos_time_from_system(t);
        let (y, mo, d, h, mi, s) = dos_time_fields(packed);
        assert_eq!((y, mo, d, h, mi), (2026, 8, 2, 13, 45));
        // seconds are stored in two-second units
        assert_eq!(s, 30);
    }

    #[test]
    fn test_time_clamping() {
        let before: SystemTime = datetime!(1972-03-15 08:00:00 UTC).into();
        assert_eq!(dos_time_from_system(before), DOS_TIME_EPOCH);

        let after: SystemTime = datetime!(2130-01-01 00:00:00 UTC).into();
        let (y, mo, d, ..) = dos_time_fields(dos_time_from_system(after));
        assert_eq!((y, mo, d), (2107, 12, 31));
    }

    #[test]
    fn test_time_round_trip_within_two_seconds() {
        for &(y, mo, d, h, mi, s) in &[
            (1980, 1, 1, 0, 0, 0),
            (1999, 12, 31, 23, 59, 59),
            (2045, 6, 15, 12, 30, 7),
        ] {
            let dt = time::Date::from_calendar_date(y, time::Month::try_from(mo).unwrap(), d)
                .unwrap()
                .with_hms(h, mi, s)
                .unwrap()
                .assume_utc();
            let packed = dos_time_from_system(dt.into());
            let (ry, rmo, rd, rh, rmi, rs) = dos_time_fields(packed);
            assert_eq!((ry, rmo as i32, rd as u8), (y, mo as i32, d));
            assert_eq!((rh, rmi), (h, mi));
            assert!(s.abs_diff(rs) < 2);
        }
    }
}

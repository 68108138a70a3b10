//! DOS-attribute storage backends.
//!
//! A shared drive stores the DOS attribute byte (read-only, hidden, system,
//! archive) in one of three ways:
//! - `Native`: the host filesystem's own DOS attributes (FAT ioctl on Linux,
//!   file flags on FreeBSD),
//! - `Extended`: a single extended attribute on any filesystem that has them,
//! - `Ignore`: attributes are synthesized and writes dropped.
//!
//! `Auto` probes the share root in that order at drive initialization.

use std::path::Path;
use std::str::FromStr;

use tracing::debug;

use crate::dos;
use crate::error::{FsError, FsResult};

/// How a shared drive stores DOS attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttrStorage {
    #[default]
    Auto,
    Ignore,
    Native,
    Extended,
}

impl FromStr for AttrStorage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AUTO" => Ok(Self::Auto),
            "IGNORE" => Ok(Self::Ignore),
            "NATIVE" => Ok(Self::Native),
            "EXTENDED" => Ok(Self::Extended),
            other => Err(format!("unknown DOS attribute storage \"{other}\"")),
        }
    }
}

/// Storage backend for the DOS attribute byte of a filesystem item.
pub trait AttrBackend {
    /// Returns `true` when this backend works for `path`.
    fn probe(&self, path: &Path) -> bool;

    /// Reads the stored attribute bits of an existing item.
    fn get(&self, path: &Path) -> FsResult<u8>;

    /// Stores the attribute bits of an existing item.
    fn set(&self, path: &Path, attrs: u8) -> FsResult<()>;
}

/// Selects the backend for a drive rooted at `root`.
pub fn select_backend(mode: AttrStorage, root: &Path) -> Box<dyn AttrBackend> {
    match mode {
        AttrStorage::Ignore => Box::new(IgnoreAttrs),
        AttrStorage::Native => Box::new(NativeAttrs),
        AttrStorage::Extended => Box::new(ExtendedAttrs),
        AttrStorage::Auto => {
            if NativeAttrs.probe(root) {
                debug!("drive \"{}\": using native DOS attributes", root.display());
                Box::new(NativeAttrs)
            } else if ExtendedAttrs.probe(root) {
                debug!("drive \"{}\": storing DOS attributes in extended attributes", root.display());
                Box::new(ExtendedAttrs)
            } else {
                debug!("drive \"{}\": DOS attributes not stored", root.display());
                Box::new(IgnoreAttrs)
            }
        }
    }
}

/// The default attribute byte for an item of the given kind.
pub fn default_attrs(is_dir: bool) -> u8 {
    if is_dir {
        dos::ATTR_NONE
    } else {
        dos::ATTR_ARCHIVE
    }
}

/// No storage: reads synthesize the default for the item kind, writes vanish.
pub struct IgnoreAttrs;

impl AttrBackend for IgnoreAttrs {
    fn probe(&self, _path: &Path) -> bool {
        true
    }

    fn get(&self, path: &Path) -> FsResult<u8> {
        let meta = std::fs::metadata(path)
            .map_err(|e| FsError::from_io("stat", path.to_path_buf(), e))?;
        Ok(default_attrs(meta.is_dir()))
    }

    fn set(&self, _path: &Path, _attrs: u8) -> FsResult<()> {
        Ok(())
    }
}

/// Host-native DOS attributes.
pub struct NativeAttrs;

/// DOS attributes in a dedicated extended attribute.
pub struct ExtendedAttrs;

#[cfg(target_os = "linux")]
mod imp {
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use tracing::debug;

    use super::{default_attrs, AttrBackend, ExtendedAttrs, NativeAttrs};
    use crate::dos;
    use crate::error::{FsError, FsResult};

    // from <linux/msdos_fs.h>
    const FAT_IOCTL_GET_ATTRIBUTES: libc::c_ulong = 0x8004_7210;
    const FAT_IOCTL_SET_ATTRIBUTES: libc::c_ulong = 0x4004_7211;

    /// Extended attribute holding the DOS attribute byte.
    const EA_NAME: &[u8] = b"user.NetMountAttrs\0";

    fn path_cstr(path: &Path) -> FsResult<CString> {
        CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            FsError::Io {
                op: "encode path",
                path: path.to_path_buf(),
                source: io::Error::from(io::ErrorKind::InvalidInput),
            }
        })
    }

    fn fat_ioctl(path: &Path, request: libc::c_ulong, attrs: &mut u32) -> io::Result<()> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let res = unsafe { libc::ioctl(fd, request, attrs as *mut u32) };
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        if res == -1 {
            return Err(err);
        }
        Ok(())
    }

    impl AttrBackend for NativeAttrs {
        fn probe(&self, path: &Path) -> bool {
            let mut attrs = 0u32;
            match fat_ioctl(path, FAT_IOCTL_GET_ATTRIBUTES, &mut attrs) {
                Ok(()) => true,
                Err(e) => {
                    debug!("native DOS attributes unavailable on \"{}\": {e}", path.display());
                    false
                }
            }
        }

        fn get(&self, path: &Path) -> FsResult<u8> {
            let mut attrs = 0u32;
            fat_ioctl(path, FAT_IOCTL_GET_ATTRIBUTES, &mut attrs)
                .map_err(|e| FsError::from_io("get attributes", path.to_path_buf(), e))?;
            Ok(attrs as u8 & dos::ATTR_STORABLE)
        }

        fn set(&self, path: &Path, attrs: u8) -> FsResult<()> {
            let mut attrs = u32::from(attrs & dos::ATTR_STORABLE);
            fat_ioctl(path, FAT_IOCTL_SET_ATTRIBUTES, &mut attrs)
                .map_err(|e| FsError::from_io("set attributes", path.to_path_buf(), e))
        }
    }

    impl AttrBackend for ExtendedAttrs {
        fn probe(&self, path: &Path) -> bool {
            let Ok(cpath) = path_cstr(path) else {
                return false;
            };
            let ret = unsafe {
                libc::getxattr(
                    cpath.as_ptr(),
                    EA_NAME.as_ptr().cast(),
                    std::ptr::null_mut(),
                    0,
                )
            };
            if ret == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENOTSUP) {
                    debug!("extended attributes unsupported on \"{}\"", path.display());
                    return false;
                }
            }
            true
        }

        fn get(&self, path: &Path) -> FsResult<u8> {
            let cpath = path_cstr(path)?;
            let mut buf = [0u8; 8];
            let ret = unsafe {
                libc::getxattr(
                    cpath.as_ptr(),
                    EA_NAME.as_ptr().cast(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if ret == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENODATA) {
                    let meta = std::fs::metadata(path)
                        .map_err(|e| FsError::from_io("stat", path.to_path_buf(), e))?;
                    return Ok(default_attrs(meta.is_dir()));
                }
                return Err(FsError::from_io("get attributes", path.to_path_buf(), err));
            }
            Ok(buf[0] & dos::ATTR_STORABLE)
        }

        fn set(&self, path: &Path, attrs: u8) -> FsResult<()> {
            let attrs = attrs & dos::ATTR_STORABLE;
            let cpath = path_cstr(path)?;

            let meta = std::fs::metadata(path)
                .map_err(|e| FsError::from_io("stat", path.to_path_buf(), e))?;
            if attrs == default_attrs(meta.is_dir()) {
                // back to the default for this kind of item: drop the EA
                let ret = unsafe { libc::removexattr(cpath.as_ptr(), EA_NAME.as_ptr().cast()) };
                if ret == -1 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::ENODATA) {
                        return Ok(());
                    }
                    return Err(FsError::from_io("remove attributes", path.to_path_buf(), err));
                }
                return Ok(());
            }

            let ret = unsafe {
                libc::setxattr(
                    cpath.as_ptr(),
                    EA_NAME.as_ptr().cast(),
                    (&attrs as *const u8).cast(),
                    1,
                    0,
                )
            };
            if ret == -1 {
                return Err(FsError::from_io(
                    "set attributes",
                    path.to_path_buf(),
                    io::Error::last_os_error(),
                ));
            }
            Ok(())
        }
    }
}

#[cfg(target_os = "freebsd")]
mod imp {
    use std::ffi::CString;
    use std::io;
    use std::mem;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use super::{AttrBackend, ExtendedAttrs, NativeAttrs};
    use crate::dos;
    use crate::error::{FsError, FsResult};

    // file flags from <sys/stat.h>
    const UF_SYSTEM: libc::c_ulong = 0x0000_0080;
    const UF_ARCHIVE: libc::c_ulong = 0x0000_0800;
    const UF_READONLY: libc::c_ulong = 0x0000_1000;
    const UF_HIDDEN: libc::c_ulong = 0x0000_8000;

    fn path_cstr(path: &Path) -> FsResult<CString> {
        CString::new(path.as_os_str().as_bytes()).map_err(|_| FsError::Io {
            op: "encode path",
            path: path.to_path_buf(),
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })
    }

    impl AttrBackend for NativeAttrs {
        fn probe(&self, path: &Path) -> bool {
            self.get(path).is_ok()
        }

        fn get(&self, path: &Path) -> FsResult<u8> {
            let cpath = path_cstr(path)?;
            let mut st: libc::stat = unsafe { mem::zeroed() };
            if unsafe { libc::stat(cpath.as_ptr(), &mut st) } == -1 {
                return Err(FsError::from_io(
                    "stat",
                    path.to_path_buf(),
                    io::Error::last_os_error(),
                ));
            }
            let flags = libc::c_ulong::from(st.st_flags);
            let mut attrs = dos::ATTR_NONE;
            if flags & UF_READONLY != 0 {
                attrs |= dos::ATTR_READ_ONLY;
            }
            if flags & UF_HIDDEN != 0 {
                attrs |= dos::ATTR_HIDDEN;
            }
            if flags & UF_SYSTEM != 0 {
                attrs |= dos::ATTR_SYSTEM;
            }
            if flags & UF_ARCHIVE != 0 {
                attrs |= dos::ATTR_ARCHIVE;
            }
            Ok(attrs)
        }

        fn set(&self, path: &Path, attrs: u8) -> FsResult<()> {
            let cpath = path_cstr(path)?;
            let mut flags: libc::c_ulong = 0;
            if attrs & dos::ATTR_READ_ONLY != 0 {
                flags |= UF_READONLY;
            }
            if attrs & dos::ATTR_HIDDEN != 0 {
                flags |= UF_HIDDEN;
            }
            if attrs & dos::ATTR_SYSTEM != 0 {
                flags |= UF_SYSTEM;
            }
            if attrs & dos::ATTR_ARCHIVE != 0 {
                flags |= UF_ARCHIVE;
            }
            if unsafe { libc::chflags(cpath.as_ptr(), flags) } == -1 {
                return Err(FsError::from_io(
                    "set flags",
                    path.to_path_buf(),
                    io::Error::last_os_error(),
                ));
            }
            Ok(())
        }
    }

    impl AttrBackend for ExtendedAttrs {
        fn probe(&self, _path: &Path) -> bool {
            false
        }

        fn get(&self, path: &Path) -> FsResult<u8> {
            IgnoreFallback.get(path)
        }

        fn set(&self, _path: &Path, _attrs: u8) -> FsResult<()> {
            Ok(())
        }
    }

    use super::IgnoreAttrs as IgnoreFallback;
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
mod imp {
    use std::path::Path;

    use super::{AttrBackend, ExtendedAttrs, IgnoreAttrs, NativeAttrs};
    use crate::error::FsResult;

    impl AttrBackend for NativeAttrs {
        fn probe(&self, _path: &Path) -> bool {
            false
        }

        fn get(&self, path: &Path) -> FsResult<u8> {
            IgnoreAttrs.get(path)
        }

        fn set(&self, _path: &Path, _attrs: u8) -> FsResult<()> {
            Ok(())
        }
    }

    impl AttrBackend for ExtendedAttrs {
        fn probe(&self, _path: &Path) -> bool {
            false
        }

        fn get(&self, path: &Path) -> FsResult<u8> {
            IgnoreAttrs.get(path)
        }

        fn set(&self, _path: &Path, _attrs: u8) -> FsResult<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_storage_parsing() {
        assert_eq!("auto".parse::<AttrStorage>(), Ok(AttrStorage::Auto));
        assert_eq!("IGNORE".parse::<AttrStorage>(), Ok(AttrStorage::Ignore));
        assert_eq!("Native".parse::<AttrStorage>(), Ok(AttrStorage::Native));
        assert_eq!("EXTENDED".parse::<AttrStorage>(), Ok(AttrStorage::Extended));
        assert!("fancy".parse::<AttrStorage>().is_err());
    }

    #[test]
    fn test_ignore_backend_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();

        assert_eq!(IgnoreAttrs.get(&file).unwrap(), dos::ATTR_ARCHIVE);
        assert_eq!(IgnoreAttrs.get(dir.path()).unwrap(), dos::ATTR_NONE);

        // writes are dropped, not errors
        IgnoreAttrs.set(&file, dos::ATTR_READ_ONLY).unwrap();
        assert_eq!(IgnoreAttrs.get(&file).unwrap(), dos::ATTR_ARCHIVE);
    }

    #[test]
    fn test_auto_selects_some_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = select_backend(AttrStorage::Auto, dir.path());
        // whichever backend won the probe must be able to read defaults
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let attrs = backend.get(&file).unwrap();
        assert_eq!(attrs & dos::ATTR_DIRECTORY, 0);
    }
}

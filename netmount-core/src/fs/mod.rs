//! Shared drives: the 16-bit handle table, cached directory listings and the
//! DOS-semantic filesystem operations layered over the host filesystem.
//!
//! A handle is a stable index into one drive's slot table and doubles as the
//! DOS "start cluster" on the wire. Handles are created lazily, reused by
//! path match and evicted least-recently-used; they are never explicitly
//! closed.

mod attrs;

pub use attrs::{default_attrs, select_backend, AttrBackend, AttrStorage, ExtendedAttrs, IgnoreAttrs, NativeAttrs};

use std::collections::HashSet;
use std::ffi::{CString, OsString};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, error, trace, warn};

use crate::dos::{self, FcbName};
use crate::error::{FsError, FsResult};
use crate::names::name_to_83;
use crate::translit::TranslitMap;

/// Drive numbers are 0..=25 (A..Z); A and B stay local to the DOS machine.
pub const MAX_DRIVE_COUNT: usize = 26;
pub const MIN_SHARED_DRIVE_NUM: u8 = 2;

/// The wire value meaning "no handle".
pub const INVALID_HANDLE: u16 = 0xFFFF;

/// Handle values stay below [`INVALID_HANDLE`].
pub const MAX_HANDLE_COUNT: usize = 65_535;

/// DOS FIND addresses directory entries with a 16-bit offset.
pub const MAX_DIR_ENTRIES: usize = 65_535;

/// Cached directory listings older than this are dropped.
const LISTING_MAX_AGE: Duration = Duration::from_secs(3600);

/// How host file names are presented to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameConversion {
    /// Pass server names through untouched; lookups compare bytes uppercased.
    Off,
    /// Map long names to 8.3 in memory, with `~N` collision resolution.
    #[default]
    Ram,
}

impl FromStr for NameConversion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OFF" => Ok(Self::Off),
            "RAM" => Ok(Self::Ram),
            other => Err(format!("unknown file name conversion method \"{other}\"")),
        }
    }
}

/// DOS view of one filesystem item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DosFileProperties {
    pub fcb_name: FcbName,
    pub size: u32,
    pub time_date: u32,
    pub attrs: u8,
    /// Name of the item on the server, empty for synthetic entries.
    pub server_name: OsString,
}

/// Startup definition of one shared drive.
#[derive(Debug, Clone)]
pub struct ShareConfig {
    pub root: PathBuf,
    pub read_only: bool,
    pub name_conversion: NameConversion,
    pub attr_storage: AttrStorage,
    pub label: Option<String>,
}

impl ShareConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ShareConfig {
            root: root.into(),
            read_only: false,
            name_conversion: NameConversion::default(),
            attr_storage: AttrStorage::default(),
            label: None,
        }
    }
}

/// One entry of a drive's handle table. A slot with an empty path is free.
struct Slot {
    path: PathBuf,
    last_used: Instant,
    listing: Option<DirListing>,
}

impl Slot {
    fn free(now: Instant) -> Self {
        Slot {
            path: PathBuf::new(),
            last_used: now,
            listing: None,
        }
    }

    fn is_free(&self) -> bool {
        self.path.as_os_str().is_empty()
    }
}

/// Cached directory listing plus the FCB names handed out while building it.
struct DirListing {
    entries: Vec<DosFileProperties>,
    names: HashSet<FcbName>,
}

/// One shared drive (DOS letter C..Z) with its own handle table.
pub struct SharedDrive {
    root: PathBuf,
    read_only: bool,
    name_conversion: NameConversion,
    attr_backend: Box<dyn AttrBackend>,
    label: Option<FcbName>,
    translit: Rc<TranslitMap>,
    items: Vec<Slot>,
}

impl SharedDrive {
    /// Resolves the share root and picks the attribute backend.
    pub fn new(config: ShareConfig, translit: Rc<TranslitMap>) -> io::Result<Self> {
        let root = config.root.canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("share root is not a directory: {}", root.display()),
            ));
        }
        let attr_backend = select_backend(config.attr_storage, &root);
        Ok(SharedDrive {
            root,
            read_only: config.read_only,
            name_conversion: config.name_conversion,
            attr_backend,
            label: config.label.as_deref().map(FcbName::from_label),
            translit,
            items: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn name_conversion(&self) -> NameConversion {
        self.name_conversion
    }

    pub fn label(&self) -> Option<&FcbName> {
        self.label.as_ref()
    }

    fn ensure_writable(&self) -> FsResult<()> {
        if self.read_only {
            Err(FsError::ReadOnlyDrive)
        } else {
            Ok(())
        }
    }

    /// Returns the handle for `server_path`, assigning a slot if needed.
    ///
    /// A matching slot is refreshed and reused. Otherwise the first free slot
    /// wins; the table grows by one while below 65535 slots, then the least
    /// recently used slot is evicted. Expired directory listings encountered
    /// during the scan are dropped.
    pub fn get_handle(&mut self, server_path: &Path) -> u16 {
        let now = Instant::now();
        let mut first_free = None;
        let mut oldest_idx = 0usize;
        let mut oldest_time = now;

        for (i, slot) in self.items.iter_mut().enumerate() {
            if slot.path == server_path {
                slot.last_used = now;
                trace!("get_handle: reusing handle {i} for \"{}\"", server_path.display());
                return i as u16;
            }

            if slot.listing.is_some() && now.duration_since(slot.last_used) > LISTING_MAX_AGE {
                trace!("get_handle: dropping stale directory listing of handle {i}");
                slot.listing = None;
            }

            if first_free.is_none() {
                if slot.is_free() {
                    first_free = Some(i);
                } else if slot.last_used < oldest_time {
                    oldest_time = slot.last_used;
                    oldest_idx = i;
                }
            }
        }

        let idx = match first_free {
            Some(i) => i,
            None if self.items.len() < MAX_HANDLE_COUNT => {
                self.items.push(Slot::free(now));
                self.items.len() - 1
            }
            None => {
                debug!(
                    "get_handle: all handles in use, evicting handle {oldest_idx} (\"{}\")",
                    self.items[oldest_idx].path.display()
                );
                oldest_idx
            }
        };

        let slot = &mut self.items[idx];
        slot.path = server_path.to_path_buf();
        slot.last_used = now;
        slot.listing = None;
        idx as u16
    }

    fn slot(&mut self, handle: u16) -> FsResult<&mut Slot> {
        let idx = usize::from(handle);
        if idx >= self.items.len() || self.items[idx].is_free() {
            return Err(FsError::InvalidHandle(handle));
        }
        Ok(&mut self.items[idx])
    }

    /// The path behind a live handle; refreshes its timestamp.
    pub fn handle_path(&mut self, handle: u16) -> FsResult<PathBuf> {
        let slot = self.slot(handle)?;
        slot.last_used = Instant::now();
        Ok(slot.path.clone())
    }

    /// Resolves a client-relative path against the drive root.
    ///
    /// The boolean is `true` when the final component exists on the server.
    /// With RAM name conversion the path is walked one component at a time
    /// through the cached directory listings; a missing intermediate
    /// component is a path-not-found error, a missing final component is
    /// returned verbatim with `false`.
    pub fn create_server_path(&mut self, client_path: &Path) -> FsResult<(PathBuf, bool)> {
        self.resolve_client_path(client_path, false)
    }

    /// Like [`Self::create_server_path`] but rebuilds every directory listing
    /// along the way; mutating operations use it to refresh their parents.
    pub fn create_server_path_refresh(&mut self, client_path: &Path) -> FsResult<(PathBuf, bool)> {
        self.resolve_client_path(client_path, true)
    }

    fn resolve_client_path(&mut self, client_path: &Path, refresh: bool) -> FsResult<(PathBuf, bool)> {
        if client_path.as_os_str().is_empty() {
            return Ok((self.root.clone(), true));
        }

        if self.name_conversion == NameConversion::Off {
            let server_path = self.root.join(client_path);
            let exists = server_path.symlink_metadata().is_ok();
            return Ok((server_path, exists));
        }

        let mut server_path = self.root.clone();
        let mut components = client_path.iter().peekable();
        while let Some(component) = components.next() {
            let fcb = FcbName::from_short_name(&component.to_string_lossy());
            let handle = self.get_handle(&server_path);
            let is_last = components.peek().is_none();
            match self.lookup_server_name(handle, &fcb, refresh)? {
                Some(server_name) => {
                    server_path.push(server_name);
                    if is_last {
                        return Ok((server_path, true));
                    }
                }
                None => {
                    server_path.push(component);
                    if is_last {
                        return Ok((server_path, false));
                    }
                    return Err(FsError::PathNotFound(server_path));
                }
            }
        }

        Ok((server_path, true))
    }

    /// Finds the server name behind an FCB name in a directory's listing.
    fn lookup_server_name(
        &mut self,
        handle: u16,
        fcb: &FcbName,
        rebuild: bool,
    ) -> FsResult<Option<OsString>> {
        if rebuild || self.slot(handle)?.listing.is_none() {
            self.build_listing(handle)?;
        }
        let slot = self.slot(handle)?;
        let Some(listing) = slot.listing.as_ref() else {
            return Ok(None);
        };
        if !listing.names.contains(fcb) {
            return Ok(None);
        }
        Ok(listing
            .entries
            .iter()
            .find(|e| e.fcb_name == *fcb && !e.server_name.is_empty())
            .map(|e| e.server_name.clone()))
    }

    /// (Re)builds the directory listing of the directory behind `handle`.
    fn build_listing(&mut self, handle: u16) -> FsResult<usize> {
        let dir_path = self.slot(handle)?.path.clone();
        let is_root = dir_path == self.root;

        let mut entries: Vec<DosFileProperties> = Vec::new();
        let mut names: HashSet<FcbName> = HashSet::new();

        if is_root {
            if let Some(label) = self.label {
                names.insert(label);
                entries.push(DosFileProperties {
                    fcb_name: label,
                    size: 0,
                    time_date: dos::dos_time_from_system(SystemTime::now()),
                    attrs: dos::ATTR_VOLUME,
                    server_name: OsString::new(),
                });
            }
        }

        for name in [".", ".."] {
            let full = dir_path.join(name);
            if let Some(mut props) = self.server_properties(&full) {
                props.fcb_name = FcbName::from_short_name(name);
                props.server_name = OsString::from(name);
                names.insert(props.fcb_name);
                entries.push(props);
            }
        }

        let iter = fs::read_dir(&dir_path)
            .map_err(|e| FsError::from_io("read directory", dir_path.clone(), e))?;
        for dent in iter {
            let dent = match dent {
                Ok(d) => d,
                Err(e) => {
                    warn!("error listing \"{}\": {e}", dir_path.display());
                    continue;
                }
            };
            if entries.len() >= MAX_DIR_ENTRIES {
                error!(
                    "directory \"{}\" contains more than {MAX_DIR_ENTRIES} items, listing truncated",
                    dir_path.display()
                );
                break;
            }

            let file_name = dent.file_name();
            let path = dir_path.join(&file_name);
            let Some(mut props) = self.server_properties(&path) else {
                continue;
            };

            match self.name_conversion {
                NameConversion::Ram => {
                    let long_name = file_name.to_string_lossy();
                    match name_to_83(&long_name, &self.translit, &mut names) {
                        Some(fcb) => props.fcb_name = fcb,
                        None => {
                            error!(
                                "cannot map \"{long_name}\" to a unique 8.3 name in \"{}\", \
                                 entry skipped",
                                dir_path.display()
                            );
                            continue;
                        }
                    }
                }
                NameConversion::Off => {
                    props.fcb_name = FcbName::from_short_name(&file_name.to_string_lossy());
                }
            }
            props.server_name = file_name;
            entries.push(props);
        }

        let count = entries.len();
        let slot = self.slot(handle)?;
        slot.listing = Some(DirListing { entries, names });
        slot.last_used = Instant::now();
        Ok(count)
    }

    /// DOS view of one server path; `None` when the item does not exist.
    ///
    /// Symlinks are followed. A dangling link shows up as a zero-byte file
    /// stamped 1980-01-01 with no attribute bits.
    pub fn server_properties(&self, path: &Path) -> Option<DosFileProperties> {
        let fcb_name = path
            .file_name()
            .map(|n| FcbName::from_short_name(&n.to_string_lossy()))
            .unwrap_or_else(FcbName::blank);
        let server_name = path.file_name().map(OsString::from).unwrap_or_default();

        match fs::metadata(path) {
            Ok(meta) => {
                let is_dir = meta.is_dir();
                let stored = match self.attr_backend.get(path) {
                    Ok(a) => a,
                    Err(e) => {
                        debug!("cannot read attributes of \"{}\": {e}", path.display());
                        default_attrs(is_dir)
                    }
                };
                let attrs = if is_dir {
                    dos::ATTR_DIRECTORY | (stored & dos::ATTR_STORABLE)
                } else {
                    stored
                };
                let time_date = meta
                    .modified()
                    .map(dos::dos_time_from_system)
                    .unwrap_or(dos::DOS_TIME_EPOCH);
                let size = if is_dir {
                    0
                } else {
                    meta.len().min(u64::from(u32::MAX)) as u32
                };
                Some(DosFileProperties {
                    fcb_name,
                    size,
                    time_date,
                    attrs,
                    server_name,
                })
            }
            Err(_) => match path.symlink_metadata() {
                Ok(meta) if meta.file_type().is_symlink() => Some(DosFileProperties {
                    fcb_name,
                    size: 0,
                    time_date: dos::DOS_TIME_EPOCH,
                    attrs: dos::ATTR_NONE,
                    server_name,
                }),
                _ => None,
            },
        }
    }

    /// DOS properties of a client path, or `None` when it does not exist.
    pub fn dos_properties(&mut self, client_path: &Path) -> FsResult<Option<DosFileProperties>> {
        let (server_path, _) = self.create_server_path(client_path)?;
        Ok(self.server_properties(&server_path))
    }

    /// Finds the next listing entry at offset `*nth` or later that matches
    /// the FCB mask and attribute filter; `*nth` advances past the match.
    ///
    /// An attribute filter of exactly VOLUME matches only the volume label.
    /// Otherwise an entry matches when it carries no hidden/system/directory
    /// bit that the filter lacks. `.` and `..` are skipped in the drive root.
    pub fn find_file(
        &mut self,
        handle: u16,
        mask: &FcbName,
        search_attrs: u8,
        nth: &mut u16,
    ) -> FsResult<Option<DosFileProperties>> {
        let dir_path = self.handle_path(handle)?;
        let is_root = dir_path == self.root;

        // FIND_FIRST starts at offset zero and always rescans the directory
        if *nth == 0 || self.slot(handle)?.listing.is_none() {
            let count = self.build_listing(handle)?;
            debug!("scanned dir \"{}\", found {count} items", dir_path.display());
        }

        let slot = self.slot(handle)?;
        let Some(listing) = slot.listing.as_ref() else {
            return Ok(None);
        };

        for n in usize::from(*nth)..listing.entries.len() {
            let entry = &listing.entries[n];

            if is_root && entry.fcb_name.is_dot_entry() {
                continue;
            }
            if !mask.matches(&entry.fcb_name) {
                continue;
            }
            if search_attrs == dos::ATTR_VOLUME {
                if entry.attrs & dos::ATTR_VOLUME == 0 {
                    continue;
                }
            } else {
                if entry.attrs & dos::ATTR_VOLUME != 0 {
                    continue;
                }
                let masked = entry.attrs & (dos::ATTR_HIDDEN | dos::ATTR_SYSTEM | dos::ATTR_DIRECTORY);
                if (search_attrs | masked) != search_attrs {
                    continue;
                }
            }

            *nth = (n + 1) as u16;
            return Ok(Some(entry.clone()));
        }

        Ok(None)
    }

    pub fn make_dir(&mut self, client_path: &Path) -> FsResult<()> {
        self.ensure_writable()?;
        let (server_path, exists) = self.create_server_path(client_path)?;
        if exists {
            return Err(FsError::WriteFault {
                path: server_path,
                source: io::Error::from(io::ErrorKind::AlreadyExists),
            });
        }
        fs::create_dir(&server_path).map_err(|e| write_err(&server_path, e))?;
        let _ = self.create_server_path_refresh(client_path);
        Ok(())
    }

    pub fn remove_dir(&mut self, client_path: &Path) -> FsResult<()> {
        self.ensure_writable()?;
        let (server_path, exists) = self.create_server_path(client_path)?;
        if !exists {
            return Err(FsError::PathNotFound(server_path));
        }
        fs::remove_dir(&server_path).map_err(|e| write_err(&server_path, e))?;
        let _ = self.create_server_path_refresh(client_path);
        Ok(())
    }

    /// Validates that a client directory exists.
    pub fn change_dir(&mut self, client_path: &Path) -> FsResult<()> {
        let (server_path, exists) = self.create_server_path(client_path)?;
        if !exists || !server_path.is_dir() {
            return Err(FsError::PathNotFound(server_path));
        }
        Ok(())
    }

    /// Reads up to `len` bytes at `offset` from the file behind `handle`.
    pub fn read_file(&mut self, handle: u16, offset: u32, len: u16) -> FsResult<Vec<u8>> {
        let path = self.handle_path(handle)?;
        let mut file =
            File::open(&path).map_err(|e| FsError::from_io("open", path.clone(), e))?;
        file.seek(SeekFrom::Start(u64::from(offset)))
            .map_err(|e| FsError::from_io("seek", path.clone(), e))?;
        let mut data = Vec::with_capacity(usize::from(len));
        file.take(u64::from(len))
            .read_to_end(&mut data)
            .map_err(|e| FsError::from_io("read", path, e))?;
        Ok(data)
    }

    /// Writes `data` at `offset`; an empty write truncates (or extends) the
    /// file to exactly `offset` bytes.
    pub fn write_file(&mut self, handle: u16, offset: u32, data: &[u8]) -> FsResult<u16> {
        self.ensure_writable()?;
        let path = self.handle_path(handle)?;
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| FsError::from_io("open", path.clone(), e))?;

        if data.is_empty() {
            debug!("write_file: truncate \"{}\" to {offset} bytes", path.display());
            file.set_len(u64::from(offset))
                .map_err(|e| FsError::from_io("truncate", path, e))?;
            return Ok(0);
        }

        debug!(
            "write_file: write {} bytes into \"{}\" at offset {offset}",
            data.len(),
            path.display()
        );
        file.seek(SeekFrom::Start(u64::from(offset)))
            .map_err(|e| FsError::from_io("seek", path.clone(), e))?;
        file.write_all(data)
            .map_err(|e| FsError::from_io("write", path, e))?;
        Ok(data.len() as u16)
    }

    /// Size in bytes of the file behind `handle`.
    pub fn file_size(&mut self, handle: u16) -> FsResult<u32> {
        let path = self.handle_path(handle)?;
        match self.server_properties(&path) {
            Some(props) => Ok(props.size),
            None => Err(FsError::FileNotFound(path)),
        }
    }

    pub fn set_attrs(&mut self, client_path: &Path, attrs: u8) -> FsResult<()> {
        self.ensure_writable()?;
        let (server_path, exists) = self.create_server_path(client_path)?;
        if !exists {
            return Err(FsError::FileNotFound(server_path));
        }
        self.attr_backend.set(&server_path, attrs)?;
        let _ = self.create_server_path_refresh(client_path);
        Ok(())
    }

    pub fn rename(&mut self, old_client: &Path, new_client: &Path) -> FsResult<()> {
        self.ensure_writable()?;
        let (old_path, old_exists) = self.create_server_path(old_client)?;
        if !old_exists {
            return Err(FsError::FileNotFound(old_path));
        }
        let (new_path, _) = self.create_server_path(new_client)?;
        fs::rename(&old_path, &new_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FsError::FileNotFound(old_path.clone()),
            _ => FsError::AccessDenied(new_path.clone()),
        })?;
        let _ = self.create_server_path_refresh(old_client);
        let _ = self.create_server_path_refresh(new_client);
        Ok(())
    }

    /// Deletes the file at `client_pattern`, or every matching file when the
    /// name carries `?` wildcards. Directories are never deleted here.
    pub fn delete_files(&mut self, client_pattern: &Path) -> FsResult<()> {
        self.ensure_writable()?;
        let (server_path, exists) = self.create_server_path(client_pattern)?;

        if exists {
            if let Some(props) = self.server_properties(&server_path) {
                if props.attrs & dos::ATTR_READ_ONLY != 0 {
                    return Err(FsError::AccessDenied(server_path));
                }
                if props.attrs & dos::ATTR_DIRECTORY != 0 {
                    return Err(FsError::FileNotFound(server_path));
                }
            }
            fs::remove_file(&server_path)
                .map_err(|e| FsError::from_io("delete", server_path.clone(), e))?;
            let _ = self.create_server_path_refresh(client_pattern);
            return Ok(());
        }

        let mask_str = client_pattern
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !mask_str.contains('?') {
            return Err(FsError::FileNotFound(server_path));
        }
        let mask = FcbName::from_short_name(&mask_str);
        let directory = server_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        match self.name_conversion {
            NameConversion::Off => {
                let iter = fs::read_dir(&directory)
                    .map_err(|e| FsError::from_io("read directory", directory.clone(), e))?;
                for dent in iter.flatten() {
                    if dent.file_type().map(|t| t.is_dir()).unwrap_or(true) {
                        continue;
                    }
                    let name = dent.file_name();
                    if mask.matches(&FcbName::from_short_name(&name.to_string_lossy())) {
                        let path = directory.join(&name);
                        if let Err(e) = fs::remove_file(&path) {
                            error!("delete_files: failed to delete \"{}\": {e}", path.display());
                        }
                    }
                }
            }
            NameConversion::Ram => {
                let handle = self.get_handle(&directory);
                if self.slot(handle)?.listing.is_none() {
                    self.build_listing(handle)?;
                }
                let victims: Vec<OsString> = match self.slot(handle)?.listing.as_ref() {
                    Some(listing) => listing
                        .entries
                        .iter()
                        .filter(|e| {
                            e.attrs & (dos::ATTR_DIRECTORY | dos::ATTR_VOLUME) == 0
                                && !e.server_name.is_empty()
                                && mask.matches(&e.fcb_name)
                        })
                        .map(|e| e.server_name.clone())
                        .collect(),
                    None => Vec::new(),
                };
                for name in victims {
                    let path = directory.join(name);
                    if let Err(e) = fs::remove_file(&path) {
                        error!("delete_files: failed to delete \"{}\": {e}", path.display());
                    }
                }
                self.build_listing(handle)?;
            }
        }

        Ok(())
    }

    /// Creates `server_path` or truncates it to zero length, then applies
    /// the attribute byte. Replacing a dangling symlink is refused.
    pub fn create_or_truncate(&mut self, server_path: &Path, attrs: u8) -> FsResult<DosFileProperties> {
        self.ensure_writable()?;

        if server_path.symlink_metadata().is_ok() && fs::metadata(server_path).is_err() {
            return Err(FsError::AccessDenied(server_path.to_path_buf()));
        }

        File::create(server_path).map_err(|e| write_err(server_path, e))?;

        if let Err(e) = self.attr_backend.set(server_path, attrs) {
            error!(
                "failed to set attributes 0x{attrs:02X} on \"{}\": {e}",
                server_path.display()
            );
        }

        self.server_properties(server_path)
            .ok_or_else(|| FsError::FileNotFound(server_path.to_path_buf()))
    }

    /// Total and available filesystem bytes of the share.
    pub fn space_info(&self) -> FsResult<(u64, u64)> {
        let cpath = CString::new(self.root.as_os_str().as_bytes()).map_err(|_| FsError::Io {
            op: "encode path",
            path: self.root.clone(),
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(cpath.as_ptr(), &mut st) } != 0 {
            return Err(FsError::from_io(
                "statvfs",
                self.root.clone(),
                io::Error::last_os_error(),
            ));
        }
        let frag = st.f_frsize as u64;
        Ok((st.f_blocks as u64 * frag, st.f_bavail as u64 * frag))
    }
}

/// Classifies a host error from a mutating directory/file operation.
fn write_err(path: &Path, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => FsError::AccessDenied(path.to_path_buf()),
        io::ErrorKind::NotFound => FsError::PathNotFound(path.to_path_buf()),
        _ => FsError::WriteFault {
            path: path.to_path_buf(),
            source: e,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_drive(dir: &Path) -> SharedDrive {
        SharedDrive::new(ShareConfig::new(dir), Rc::new(TranslitMap::new())).unwrap()
    }

    fn read_only_drive(dir: &Path) -> SharedDrive {
        let mut config = ShareConfig::new(dir);
        config.read_only = true;
        SharedDrive::new(config, Rc::new(TranslitMap::new())).unwrap()
    }

    #[test]
    fn test_handle_reuse_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut drive = test_drive(dir.path());

        let root = drive.root().to_path_buf();
        let h1 = drive.get_handle(&root);
        let h2 = drive.get_handle(&root);
        assert_eq!(h1, h2);
        assert_eq!(drive.handle_path(h1).unwrap(), root);

        let other = root.join("sub");
        let h3 = drive.get_handle(&other);
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_invalid_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mut drive = test_drive(dir.path());
        assert!(matches!(
            drive.handle_path(7),
            Err(FsError::InvalidHandle(7))
        ));
    }

    #[test]
    fn test_create_server_path_maps_long_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("some directory")).unwrap();
        std::fs::write(dir.path().join("some directory/long file name.txt"), b"hi").unwrap();

        let mut drive = test_drive(dir.path());
        // the client spells both components in their mapped 8.3 form
        let (path, exists) = drive
            .create_server_path(Path::new("some d~1/long f~1.txt"))
            .unwrap();
        assert!(exists);
        assert!(path.ends_with("some directory/long file name.txt"));
    }

    #[test]
    fn test_create_server_path_missing_final_component() {
        let dir = tempfile::tempdir().unwrap();
        let mut drive = test_drive(dir.path());

        let (path, exists) = drive.create_server_path(Path::new("newfile.txt")).unwrap();
        assert!(!exists);
        assert!(path.ends_with("newfile.txt"));
    }

    #[test]
    fn test_create_server_path_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut drive = test_drive(dir.path());

        let err = drive
            .create_server_path(Path::new("nodir/file.txt"))
            .unwrap_err();
        assert!(matches!(err, FsError::PathNotFound(_)));
    }

    #[test]
    fn test_find_file_skips_dot_entries_in_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut drive = test_drive(dir.path());
        let root = drive.root().to_path_buf();
        let handle = drive.get_handle(&root);

        let mask = FcbName::from_bytes(*b"???????????");
        let mut nth = 0;
        let mut found = Vec::new();
        while let Some(props) = drive
            .find_file(handle, &mask, dos::ATTR_DIRECTORY, &mut nth)
            .unwrap()
        {
            found.push(props.fcb_name.to_string());
        }
        assert!(found.contains(&"A.TXT".to_string()));
        assert!(found.contains(&"SUB".to_string()));
        assert!(!found.iter().any(|n| n.starts_with('.')));
    }

    #[test]
    fn test_find_file_attribute_filter() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut drive = test_drive(dir.path());
        let root = drive.root().to_path_buf();
        let handle = drive.get_handle(&root);

        // without the DIRECTORY bit in the filter, directories are hidden
        let mask = FcbName::from_bytes(*b"???????????");
        let mut nth = 0;
        let mut found = Vec::new();
        while let Some(props) = drive.find_file(handle, &mask, 0, &mut nth).unwrap() {
            found.push(props.fcb_name.to_string());
        }
        assert_eq!(found, vec!["A.TXT".to_string()]);
    }

    #[test]
    fn test_find_file_volume_label() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let mut config = ShareConfig::new(dir.path());
        config.label = Some("testdisk".to_string());
        let mut drive = SharedDrive::new(config, Rc::new(TranslitMap::new())).unwrap();
        let root = drive.root().to_path_buf();
        let handle = drive.get_handle(&root);

        let mask = FcbName::from_bytes(*b"???????????");
        let mut nth = 0;
        let props = drive
            .find_file(handle, &mask, dos::ATTR_VOLUME, &mut nth)
            .unwrap()
            .unwrap();
        assert_eq!(props.attrs, dos::ATTR_VOLUME);
        assert_eq!(props.fcb_name, FcbName::from_label("TESTDISK"));

        // and nothing else qualifies as a volume
        assert!(drive
            .find_file(handle, &mask, dos::ATTR_VOLUME, &mut nth)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_find_resumes_after_offset() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["one.txt", "two.txt", "three.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let mut drive = test_drive(dir.path());
        let root = drive.root().to_path_buf();
        let handle = drive.get_handle(&root);

        let mask = FcbName::from_bytes(*b"????????TXT");
        let mut nth = 0;
        let first = drive.find_file(handle, &mask, 0, &mut nth).unwrap().unwrap();
        let mut rest = Vec::new();
        while let Some(props) = drive.find_file(handle, &mask, 0, &mut nth).unwrap() {
            rest.push(props.fcb_name);
        }
        assert_eq!(rest.len(), 2);
        assert!(!rest.contains(&first.fcb_name));
    }

    #[test]
    fn test_read_write_truncate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), b"0123456789").unwrap();

        let mut drive = test_drive(dir.path());
        let (path, exists) = drive.create_server_path(Path::new("data.bin")).unwrap();
        assert!(exists);
        let handle = drive.get_handle(&path);

        assert_eq!(drive.read_file(handle, 2, 4).unwrap(), b"2345");
        // reading past the end yields the remainder
        assert_eq!(drive.read_file(handle, 8, 100).unwrap(), b"89");

        assert_eq!(drive.write_file(handle, 10, b"ab").unwrap(), 2);
        assert_eq!(drive.file_size(handle).unwrap(), 12);

        // an empty write truncates to the offset; repeating it is a no-op
        assert_eq!(drive.write_file(handle, 5, b"").unwrap(), 0);
        assert_eq!(drive.file_size(handle).unwrap(), 5);
        assert_eq!(drive.write_file(handle, 5, b"").unwrap(), 0);
        assert_eq!(drive.file_size(handle).unwrap(), 5);
    }

    #[test]
    fn test_read_only_share_blocks_mutation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"safe").unwrap();

        let mut drive = read_only_drive(dir.path());
        let (path, _) = drive.create_server_path(Path::new("keep.txt")).unwrap();
        let handle = drive.get_handle(&path);

        assert!(matches!(
            drive.write_file(handle, 0, b"nope"),
            Err(FsError::ReadOnlyDrive)
        ));
        assert!(matches!(
            drive.delete_files(Path::new("keep.txt")),
            Err(FsError::ReadOnlyDrive)
        ));
        assert!(matches!(
            drive.make_dir(Path::new("newdir")),
            Err(FsError::ReadOnlyDrive)
        ));
        assert!(matches!(
            drive.rename(Path::new("keep.txt"), Path::new("gone.txt")),
            Err(FsError::ReadOnlyDrive)
        ));
        assert_eq!(std::fs::read(dir.path().join("keep.txt")).unwrap(), b"safe");
    }

    #[test]
    fn test_delete_with_pattern() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.tmp", "b.tmp", "keep.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.tmp")).unwrap();

        let mut drive = test_drive(dir.path());
        drive.delete_files(Path::new("????????.tmp")).unwrap();

        assert!(!dir.path().join("a.tmp").exists());
        assert!(!dir.path().join("b.tmp").exists());
        assert!(dir.path().join("keep.txt").exists());
        // directories are not touched by wildcard deletes
        assert!(dir.path().join("sub.tmp").exists());
    }

    #[test]
    fn test_delete_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut drive = test_drive(dir.path());
        assert!(matches!(
            drive.delete_files(Path::new("ghost.txt")),
            Err(FsError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_rename_refreshes_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old name here.txt"), b"content").unwrap();

        let mut drive = test_drive(dir.path());
        // resolve through the mapped name, then rename to a clean 8.3 name
        drive
            .rename(Path::new("old na~1.txt"), Path::new("new.txt"))
            .unwrap();

        assert!(dir.path().join("new.txt").exists());
        assert!(!dir.path().join("old name here.txt").exists());

        let root = drive.root().to_path_buf();
        let handle = drive.get_handle(&root);
        let mut nth = 0;
        let props = drive
            .find_file(handle, &FcbName::from_short_name("NEW.TXT"), 0, &mut nth)
            .unwrap()
            .unwrap();
        assert_eq!(props.size, 7);

        nth = 0;
        assert!(drive
            .find_file(handle, &FcbName::from_short_name("OLD NA~1.TXT"), 0, &mut nth)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_create_or_truncate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("existing.txt"), b"old content").unwrap();

        let mut drive = test_drive(dir.path());
        let props = drive
            .create_or_truncate(&dir.path().join("existing.txt"), dos::ATTR_ARCHIVE)
            .unwrap();
        assert_eq!(props.size, 0);

        let props = drive
            .create_or_truncate(&dir.path().join("brand new.txt"), dos::ATTR_ARCHIVE)
            .unwrap();
        assert_eq!(props.size, 0);
        assert!(dir.path().join("brand new.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("broken.lnk");
        std::os::unix::fs::symlink(dir.path().join("missing-target"), &link).unwrap();

        let mut drive = test_drive(dir.path());
        let props = drive.server_properties(&link).unwrap();
        assert_eq!(props.size, 0);
        assert_eq!(props.attrs, dos::ATTR_NONE);
        assert_eq!(props.time_date, dos::DOS_TIME_EPOCH);

        // replacing a dangling link is refused
        assert!(matches!(
            drive.create_or_truncate(&link, dos::ATTR_ARCHIVE),
            Err(FsError::AccessDenied(_))
        ));

        // deleting removes the link itself
        drive.delete_files(Path::new("broken.lnk")).unwrap();
        assert!(link.symlink_metadata().is_err());
    }

    #[test]
    fn test_space_info() {
        let dir = tempfile::tempdir().unwrap();
        let drive = test_drive(dir.path());
        let (total, avail) = drive.space_info().unwrap();
        assert!(total > 0);
        assert!(avail <= total);
    }

    #[test]
    fn test_name_conversion_off_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("PLAIN.TXT"), b"x").unwrap();

        let mut config = ShareConfig::new(dir.path());
        config.name_conversion = NameConversion::Off;
        let mut drive = SharedDrive::new(config, Rc::new(TranslitMap::new())).unwrap();

        let (path, exists) = drive.create_server_path(Path::new("PLAIN.TXT")).unwrap();
        assert!(exists);
        assert_eq!(path, drive.root().join("PLAIN.TXT"));

        // no mapping: a differently-cased client path misses on the host
        let (_, exists) = drive.create_server_path(Path::new("plain.txt")).unwrap();
        assert!(!exists);
    }
}

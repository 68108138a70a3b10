//! Request dispatcher: validates incoming datagrams, consults the reply
//! cache, routes to the operation handlers and composes reply packets.
//!
//! Validation order per datagram: size, protocol version, declared length,
//! checksum (or magic), reply-cache replay, drive checks, then the function
//! handler. Anything that fails before the cache consult is dropped without
//! side effects; a request that reaches dispatch but produces no reply is
//! cached as a zero-length entry so retransmissions stay silent.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, error, trace, warn};

use crate::dos::{self, FcbName};
use crate::fs::{SharedDrive, INVALID_HANDLE, MAX_DRIVE_COUNT, MIN_SHARED_DRIVE_NUM};
use crate::proto::{self, Function, Header};
use crate::reply_cache::ReplyCache;

/// DOS sizes are reported slightly under 2 GiB; larger confuses MS-DOS.
const MAX_REPORTED_BYTES: u64 = 0x7FFF_FFFF;

/// Fixed cluster geometry reported by DISK_INFO.
const BYTES_PER_CLUSTER: u64 = 32_768;

/// What an operation handler produced.
enum Outcome {
    /// A reply body (possibly empty) and the AX value to report.
    Reply { ax: u16, body: Vec<u8> },
    /// No reply at all; the request is remembered as answered-by-silence.
    Ignore,
}

impl Outcome {
    fn ok(body: Vec<u8>) -> Self {
        Outcome::Reply {
            ax: dos::ERR_NO_ERROR,
            body,
        }
    }

    fn err(ax: u16) -> Self {
        Outcome::Reply { ax, body: Vec::new() }
    }
}

/// The engine state: all shared drives plus the per-peer reply cache.
pub struct Dispatcher {
    drives: [Option<SharedDrive>; MAX_DRIVE_COUNT],
    cache: ReplyCache,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            drives: std::array::from_fn(|_| None),
            cache: ReplyCache::new(),
        }
    }

    /// Mounts `drive` as DOS drive number `num` (2..=25, C..Z).
    pub fn mount(&mut self, num: u8, drive: SharedDrive) -> Result<(), String> {
        if !(MIN_SHARED_DRIVE_NUM..MAX_DRIVE_COUNT as u8).contains(&num) {
            return Err(format!("invalid drive number {num}"));
        }
        let slot = &mut self.drives[usize::from(num)];
        if slot.is_some() {
            return Err(format!("drive {}: already in use", (b'A' + num) as char));
        }
        *slot = Some(drive);
        Ok(())
    }

    pub fn drive(&self, num: u8) -> Option<&SharedDrive> {
        self.drives.get(usize::from(num)).and_then(Option::as_ref)
    }

    /// Shared drives as (drive number, drive) pairs, for the startup banner.
    pub fn shares(&self) -> impl Iterator<Item = (u8, &SharedDrive)> {
        self.drives
            .iter()
            .enumerate()
            .filter_map(|(num, d)| d.as_ref().map(|d| (num as u8, d)))
    }

    pub fn has_shares(&self) -> bool {
        self.drives.iter().any(Option::is_some)
    }

    /// Processes one datagram; returns the reply to send back, if any.
    pub fn handle_packet(&mut self, peer: SocketAddr, packet: &[u8]) -> Option<Vec<u8>> {
        let Some(header) = Header::decode(packet) else {
            warn!("received a truncated packet ({} bytes) from {peer}", packet.len());
            return None;
        };

        if header.version != proto::PROTO_VERSION {
            warn!(
                "unsupported protocol version {} from {peer}",
                header.version
            );
            return None;
        }

        let declared_len = header.length();
        if declared_len < proto::HEADER_LEN {
            warn!("malformed packet from {peer}: declared length {declared_len}");
            return None;
        }
        if declared_len > packet.len() {
            warn!(
                "truncated packet from {peer}: declared {declared_len}, got {}",
                packet.len()
            );
            return None;
        }
        // trailing padding past the declared length is tolerated and trimmed
        let packet = &packet[..declared_len];

        if header.has_checksum() {
            let computed = proto::bsd_checksum(proto::checksum_region(packet));
            if computed != header.checksum {
                warn!(
                    "checksum mismatch from {peer}: computed 0x{computed:04X}, \
                     received 0x{:04X}",
                    header.checksum
                );
                return None;
            }
        } else if header.checksum != proto::PROTO_MAGIC {
            warn!(
                "bad magic from {peer}: expected 0x{:04X}, received 0x{:04X}",
                proto::PROTO_MAGIC,
                header.checksum
            );
            return None;
        }

        if let Some(stored) = self.cache.replay(peer, packet) {
            if stored.is_empty() {
                debug!("dropping retransmission from {peer} (no stored reply)");
                return None;
            }
            debug!("replaying cached reply to {peer} (seq {})", header.sequence);
            return Some(stored.to_vec());
        }

        let drive_num = header.drive_num();
        if drive_num < MIN_SHARED_DRIVE_NUM || usize::from(drive_num) >= MAX_DRIVE_COUNT {
            error!("requested invalid drive number {drive_num}");
            self.cache.store(peer, packet, &[]);
            return None;
        }
        let Some(drive) = self.drives[usize::from(drive_num)].as_mut() else {
            error!(
                "requested drive is not shared: {}: (number {drive_num})",
                (b'A' + drive_num) as char
            );
            self.cache.store(peer, packet, &[]);
            return None;
        };

        let data = &packet[proto::HEADER_LEN..];
        trace!(
            "query 0x{:02X} on drive {}: from {peer}, {} payload bytes",
            header.function,
            (b'A' + drive_num) as char,
            data.len()
        );

        let outcome = match Function::try_from(header.function) {
            Ok(function) => dispatch_function(drive, function, data),
            Err(unknown) => {
                warn!("unknown function 0x{unknown:02X}, request ignored");
                Outcome::Ignore
            }
        };

        match outcome {
            Outcome::Ignore => {
                self.cache.store(peer, packet, &[]);
                None
            }
            Outcome::Reply { ax, body } => {
                let reply = compose_reply(&header, drive.is_read_only(), ax, &body);
                self.cache.store(peer, packet, &reply);
                Some(reply)
            }
        }
    }
}

/// Builds the reply packet: echoed header fields, AX, flags and checksum.
fn compose_reply(request: &Header, read_only: bool, ax: u16, body: &[u8]) -> Vec<u8> {
    let total_len = proto::HEADER_LEN + body.len();
    let mut length_flags = total_len as u16 & proto::LENGTH_MASK;
    if request.has_checksum() {
        length_flags |= proto::FLAG_CHECKSUM;
    }
    if read_only {
        length_flags |= proto::FLAG_READ_ONLY;
    }

    let mut reply = vec![0u8; total_len];
    reply[proto::HEADER_LEN..].copy_from_slice(body);

    let mut header = Header {
        length_flags,
        checksum: proto::PROTO_MAGIC,
        ax,
        drive: request.drive,
        function: request.function,
        sequence: request.sequence,
        version: proto::PROTO_VERSION,
    };
    header.encode(&mut reply);

    if request.has_checksum() {
        header.checksum = proto::bsd_checksum(proto::checksum_region(&reply));
        header.encode(&mut reply);
    }

    reply
}

/// Interprets a client path: backslashes become slashes and ASCII uppercase
/// folds to lowercase before matching against the host.
fn client_relative_path(data: &[u8]) -> PathBuf {
    let text: String = String::from_utf8_lossy(data)
        .chars()
        .map(|c| {
            if c == '\\' {
                '/'
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect();
    let trimmed = text.trim_start_matches('/');
    PathBuf::from(trimmed)
}

fn dispatch_function(drive: &mut SharedDrive, function: Function, data: &[u8]) -> Outcome {
    match function {
        Function::MakeDir => op_make_dir(drive, data),
        Function::RemoveDir => op_remove_dir(drive, data),
        Function::ChangeDir => op_change_dir(drive, data),
        Function::CloseFile => op_close_file(drive, data),
        Function::ReadFile => op_read_file(drive, data),
        Function::WriteFile => op_write_file(drive, data),
        Function::LockUnlockFile | Function::UnlockFile => op_lock_unlock(drive, data),
        Function::DiskInfo => op_disk_info(drive, data),
        Function::SetAttrs => op_set_attrs(drive, data),
        Function::GetAttrs => op_get_attrs(drive, data),
        Function::RenameFile => op_rename(drive, data),
        Function::DeleteFile => op_delete(drive, data),
        Function::FindFirst => op_find_first(drive, data),
        Function::FindNext => op_find_next(drive, data),
        Function::SeekFromEnd => op_seek_from_end(drive, data),
        Function::OpenFile | Function::CreateFile | Function::ExtendedOpenCreateFile => {
            op_open_create(drive, function, data)
        }
    }
}

fn op_make_dir(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    if data.is_empty() {
        return Outcome::Ignore;
    }
    let path = client_relative_path(data);
    debug!("MAKE_DIR \"{}\"", path.display());
    match drive.make_dir(&path) {
        Ok(()) => Outcome::ok(Vec::new()),
        Err(e) => {
            error!("MAKE_DIR \"{}\": {e}", path.display());
            Outcome::err(e.dos_code())
        }
    }
}

fn op_remove_dir(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    if data.is_empty() {
        return Outcome::Ignore;
    }
    let path = client_relative_path(data);
    debug!("REMOVE_DIR \"{}\"", path.display());
    match drive.remove_dir(&path) {
        Ok(()) => Outcome::ok(Vec::new()),
        Err(e) => {
            error!("REMOVE_DIR \"{}\": {e}", path.display());
            Outcome::err(e.dos_code())
        }
    }
}

fn op_change_dir(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    if data.is_empty() {
        return Outcome::Ignore;
    }
    let path = client_relative_path(data);
    debug!("CHANGE_DIR \"{}\"", path.display());
    match drive.change_dir(&path) {
        Ok(()) => Outcome::ok(Vec::new()),
        Err(e) => {
            error!("CHANGE_DIR \"{}\": {e}", path.display());
            Outcome::err(dos::ERR_PATH_NOT_FOUND)
        }
    }
}

fn op_close_file(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    let Some(request) = proto::CloseFileRequest::decode(data) else {
        return Outcome::Ignore;
    };
    let handle = request.start_cluster;
    debug!("CLOSE_FILE handle {handle}");
    // files are not kept open; only the handle's existence is verified
    if let Err(e) = drive.handle_path(handle) {
        error!("CLOSE_FILE: {e}");
    }
    Outcome::ok(Vec::new())
}

fn op_read_file(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    let Some(request) = proto::ReadFileRequest::decode(data) else {
        return Outcome::Ignore;
    };
    // a reply datagram cannot carry more than the MTU minus the header
    let length = request
        .length
        .min((proto::MAX_PACKET_LEN - proto::HEADER_LEN) as u16);
    debug!(
        "READ_FILE handle {}, {} bytes, offset {}",
        request.start_cluster, length, request.offset
    );
    match drive.read_file(request.start_cluster, request.offset, length) {
        Ok(bytes) => Outcome::ok(bytes),
        Err(e) => {
            error!("READ_FILE: {e}");
            Outcome::err(dos::ERR_ACCESS_DENIED)
        }
    }
}

fn op_write_file(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    let Some(request) = proto::WriteFileRequest::decode(data) else {
        return Outcome::Ignore;
    };
    let payload = &data[proto::WriteFileRequest::SIZE..];
    debug!(
        "WRITE_FILE handle {}, {} bytes, offset {}",
        request.start_cluster,
        payload.len(),
        request.offset
    );
    match drive.write_file(request.start_cluster, request.offset, payload) {
        Ok(written) => {
            let mut body = Vec::with_capacity(proto::WriteFileReply::SIZE);
            proto::WriteFileReply { written }.encode(&mut body);
            Outcome::ok(body)
        }
        Err(e) => {
            error!("WRITE_FILE: {e}");
            Outcome::err(dos::ERR_ACCESS_DENIED)
        }
    }
}

fn op_lock_unlock(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    let Some(request) = proto::LockFileRequest::decode(data) else {
        return Outcome::Ignore;
    };
    let handle = request.start_cluster;
    debug!("LOCK_UNLOCK_FILE handle {handle}");
    // byte ranges are not enforced; only the handle's existence is verified
    if let Err(e) = drive.handle_path(handle) {
        error!("LOCK_UNLOCK_FILE: {e}");
    }
    Outcome::ok(Vec::new())
}

fn op_disk_info(drive: &mut SharedDrive, _data: &[u8]) -> Outcome {
    debug!("DISK_INFO for \"{}\"", drive.root().display());
    let (total, avail) = match drive.space_info() {
        Ok(info) => info,
        Err(e) => {
            error!("DISK_INFO: {e}");
            return Outcome::Ignore;
        }
    };
    let total = total.min(MAX_REPORTED_BYTES);
    let avail = avail.min(MAX_REPORTED_BYTES);

    let clusters = |bytes: u64| -> u16 { bytes.div_ceil(BYTES_PER_CLUSTER).min(0xFFFF) as u16 };
    let mut body = Vec::with_capacity(proto::DiskInfoReply::SIZE);
    proto::DiskInfoReply {
        total_clusters: clusters(total),
        bytes_per_sector: BYTES_PER_CLUSTER as u16,
        available_clusters: clusters(avail),
    }
    .encode(&mut body);

    // AX carries the media id in the high byte and sectors per cluster in
    // the low byte; MS-DOS only tolerates one sector per cluster here
    Outcome::Reply { ax: 1, body }
}

fn op_set_attrs(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    if data.len() <= 1 {
        return Outcome::Ignore;
    }
    let attrs = data[0];
    let path = client_relative_path(&data[1..]);
    debug!("SET_ATTRS 0x{attrs:02X} on \"{}\"", path.display());
    match drive.set_attrs(&path, attrs) {
        Ok(()) => Outcome::ok(Vec::new()),
        Err(e) => {
            error!("SET_ATTRS 0x{attrs:02X} on \"{}\": {e}", path.display());
            let code = e.dos_code();
            if code == dos::ERR_ACCESS_DENIED {
                Outcome::err(code)
            } else {
                Outcome::err(dos::ERR_FILE_NOT_FOUND)
            }
        }
    }
}

fn op_get_attrs(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    if data.is_empty() {
        return Outcome::Ignore;
    }
    let path = client_relative_path(data);
    debug!("GET_ATTRS on \"{}\"", path.display());
    let props = match drive.dos_properties(&path) {
        Ok(Some(props)) => props,
        Ok(None) | Err(_) => {
            debug!("GET_ATTRS: no file found");
            return Outcome::err(dos::ERR_FILE_NOT_FOUND);
        }
    };

    let mut body = Vec::with_capacity(proto::GetAttrsReply::SIZE);
    proto::GetAttrsReply {
        time: props.time_date as u16,
        date: (props.time_date >> 16) as u16,
        size_lo: props.size as u16,
        size_hi: (props.size >> 16) as u16,
        attrs: props.attrs,
    }
    .encode(&mut body);
    Outcome::ok(body)
}

fn op_rename(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    // a length byte, then the two paths back to back
    if data.len() < 3 {
        return Outcome::Ignore;
    }
    let path1_len = usize::from(data[0]);
    if data.len() <= 1 + path1_len {
        return Outcome::err(dos::ERR_FILE_NOT_FOUND);
    }
    let old_path = client_relative_path(&data[1..1 + path1_len]);
    let new_path = client_relative_path(&data[1 + path1_len..]);
    debug!(
        "RENAME_FILE \"{}\" -> \"{}\"",
        old_path.display(),
        new_path.display()
    );
    match drive.rename(&old_path, &new_path) {
        Ok(()) => Outcome::ok(Vec::new()),
        Err(e) => {
            error!(
                "RENAME_FILE \"{}\" -> \"{}\": {e}",
                old_path.display(),
                new_path.display()
            );
            Outcome::err(e.dos_code())
        }
    }
}

fn op_delete(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    if data.is_empty() {
        return Outcome::Ignore;
    }
    let path = client_relative_path(data);
    debug!("DELETE_FILE \"{}\"", path.display());
    match drive.delete_files(&path) {
        Ok(()) => Outcome::ok(Vec::new()),
        Err(e) => {
            error!("DELETE_FILE \"{}\": {e}", path.display());
            Outcome::err(e.dos_code())
        }
    }
}

fn op_find_first(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    if data.len() <= 1 {
        return Outcome::Ignore;
    }
    let search_attrs = data[0];
    let template = client_relative_path(&data[1..]);
    let parent = template.parent().unwrap_or(Path::new("")).to_path_buf();
    let mask_str = template
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mask = FcbName::from_short_name(&mask_str);
    debug!(
        "FIND_FIRST in \"{}\", mask \"{mask_str}\", attrs 0x{search_attrs:02X}",
        parent.display()
    );

    let handle = match drive.create_server_path(&parent) {
        Ok((server_dir, true)) => drive.get_handle(&server_dir),
        Ok((server_dir, false)) => {
            debug!("FIND_FIRST: directory does not exist: {}", server_dir.display());
            // a failing FIND_FIRST must report NO_MORE_FILES, not
            // FILE_NOT_FOUND; some clients (e.g. LapLink 5) key on it
            return Outcome::err(dos::ERR_NO_MORE_FILES);
        }
        Err(_) => INVALID_HANDLE,
    };
    if handle == INVALID_HANDLE {
        return Outcome::err(dos::ERR_NO_MORE_FILES);
    }

    let mut nth = 0;
    find_reply(drive, handle, &mask, search_attrs, &mut nth)
}

fn op_find_next(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    let Some(request) = proto::FindNextRequest::decode(data) else {
        return Outcome::Ignore;
    };
    let mut nth = request.dir_entry;
    debug!(
        "FIND_NEXT at {nth} in dir handle {}, attrs 0x{:02X}",
        request.cluster, request.attrs
    );
    find_reply(
        drive,
        request.cluster,
        &request.search_template,
        request.attrs,
        &mut nth,
    )
}

fn find_reply(
    drive: &mut SharedDrive,
    handle: u16,
    mask: &FcbName,
    search_attrs: u8,
    nth: &mut u16,
) -> Outcome {
    match drive.find_file(handle, mask, search_attrs, nth) {
        Ok(Some(props)) => {
            debug!("found \"{}\", attrs 0x{:02X}", props.fcb_name, props.attrs);
            let mut body = Vec::with_capacity(proto::FindReply::SIZE);
            proto::FindReply {
                attrs: props.attrs,
                name: props.fcb_name,
                time: props.time_date as u16,
                date: (props.time_date >> 16) as u16,
                size: props.size,
                start_cluster: handle,
                dir_entry: *nth,
            }
            .encode(&mut body);
            Outcome::ok(body)
        }
        Ok(None) => {
            debug!("no more matching files");
            Outcome::err(dos::ERR_NO_MORE_FILES)
        }
        Err(e) => {
            error!("FIND: {e}");
            Outcome::err(dos::ERR_NO_MORE_FILES)
        }
    }
}

fn op_seek_from_end(drive: &mut SharedDrive, data: &[u8]) -> Outcome {
    let Some(request) = proto::SeekFromEndRequest::decode(data) else {
        return Outcome::Ignore;
    };
    let handle = request.start_cluster;
    // a positive "offset from end" means the end of the file itself
    let offset = request.offset().min(0);
    debug!("SEEK_FROM_END on handle {handle}, offset {offset}");

    let size = match drive.file_size(handle) {
        Ok(size) => size,
        Err(e) => {
            error!("SEEK_FROM_END: {e}");
            return Outcome::err(dos::ERR_FILE_NOT_FOUND);
        }
    };

    let position = (size as i64 + i64::from(offset)).max(0) as u32;
    debug!("SEEK_FROM_END: size {size}, new position {position}");
    let mut body = Vec::with_capacity(proto::SeekFromEndReply::SIZE);
    proto::SeekFromEndReply {
        position_lo: position as u16,
        position_hi: (position >> 16) as u16,
    }
    .encode(&mut body);
    Outcome::ok(body)
}

fn op_open_create(drive: &mut SharedDrive, function: Function, data: &[u8]) -> Outcome {
    let Some(request) = proto::OpenCreateRequest::decode(data) else {
        return Outcome::Ignore;
    };
    if data.len() <= proto::OpenCreateRequest::SIZE {
        return Outcome::Ignore;
    }
    let client_path = client_relative_path(&data[proto::OpenCreateRequest::SIZE..]);
    let file_attrs = (request.attrs & 0xFF) as u8;

    let (server_path, _exists) = match drive.create_server_path(&client_path) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("OPEN/CREATE \"{}\": {e}", client_path.display());
            return Outcome::err(e.dos_code());
        }
    };
    let parent_exists = server_path
        .parent()
        .map(Path::is_dir)
        .unwrap_or(false);
    if !parent_exists {
        error!(
            "OPEN/CREATE \"{}\": parent directory does not exist",
            server_path.display()
        );
        return Outcome::err(dos::ERR_PATH_NOT_FOUND);
    }

    let (props, result_code, result_mode) = match function {
        Function::OpenFile => {
            debug!("OPEN_FILE \"{}\", attrs 0x{file_attrs:02X}", server_path.display());
            match drive.server_properties(&server_path) {
                Some(props)
                    if props.attrs & (dos::ATTR_VOLUME | dos::ATTR_DIRECTORY) == 0 =>
                {
                    (props, dos::RESULT_CODE_OPENED, file_attrs)
                }
                _ => return Outcome::err(dos::ERR_FILE_NOT_FOUND),
            }
        }
        Function::CreateFile => {
            debug!("CREATE_FILE \"{}\", attrs 0x{file_attrs:02X}", server_path.display());
            match drive.create_or_truncate(&server_path, file_attrs) {
                // mode 2 means read/write access
                Ok(props) => (props, dos::RESULT_CODE_CREATED, 2),
                Err(e) => {
                    error!("CREATE_FILE \"{}\": {e}", server_path.display());
                    return Outcome::err(e.dos_code());
                }
            }
        }
        _ => {
            debug!(
                "EXTENDED_OPEN_CREATE \"{}\", attrs 0x{:04X}, action 0x{:04X}, mode 0x{:04X}",
                server_path.display(),
                request.attrs,
                request.action,
                request.mode
            );
            let mode = (request.mode & 0x7F) as u8;
            match drive.server_properties(&server_path) {
                None => {
                    if request.action & proto::ACTION_IF_NOT_EXIST_MASK
                        == proto::ACTION_CREATE_IF_NOT_EXIST
                    {
                        match drive.create_or_truncate(&server_path, file_attrs) {
                            Ok(props) => (props, dos::RESULT_CODE_CREATED, mode),
                            Err(e) => {
                                error!("EXTENDED_OPEN_CREATE \"{}\": {e}", server_path.display());
                                return Outcome::err(e.dos_code());
                            }
                        }
                    } else {
                        debug!("file does not exist and creation not requested");
                        return Outcome::err(dos::ERR_FILE_NOT_FOUND);
                    }
                }
                Some(props) if props.attrs & (dos::ATTR_VOLUME | dos::ATTR_DIRECTORY) != 0 => {
                    error!(
                        "EXTENDED_OPEN_CREATE: \"{}\" is a directory or volume",
                        server_path.display()
                    );
                    return Outcome::err(dos::ERR_FILE_NOT_FOUND);
                }
                Some(props) => match request.action & proto::ACTION_IF_EXIST_MASK {
                    proto::ACTION_OPEN_IF_EXIST => (props, dos::RESULT_CODE_OPENED, mode),
                    proto::ACTION_REPLACE_IF_EXIST => {
                        if props.attrs & (dos::ATTR_SYSTEM | dos::ATTR_READ_ONLY) != 0 {
                            error!(
                                "EXTENDED_OPEN_CREATE: refusing to replace protected \"{}\"",
                                server_path.display()
                            );
                            return Outcome::err(dos::ERR_ACCESS_DENIED);
                        }
                        match drive.create_or_truncate(&server_path, file_attrs) {
                            Ok(props) => (props, dos::RESULT_CODE_TRUNCATED, mode),
                            Err(e) => {
                                error!("EXTENDED_OPEN_CREATE \"{}\": {e}", server_path.display());
                                return Outcome::err(e.dos_code());
                            }
                        }
                    }
                    _ => {
                        debug!("file exists and opening not requested");
                        return Outcome::err(dos::ERR_FILE_NOT_FOUND);
                    }
                },
            }
        }
    };

    if result_code == dos::RESULT_CODE_CREATED || result_code == dos::RESULT_CODE_TRUNCATED {
        // the parent listing must reflect the new entry for later lookups
        let _ = drive.create_server_path_refresh(&client_path);
    }

    let handle = drive.get_handle(&server_path);
    if handle == INVALID_HANDLE {
        error!("failed to get a handle for \"{}\"", server_path.display());
        return Outcome::Ignore;
    }
    let fcb_name = client_path
        .file_name()
        .map(|n| FcbName::from_short_name(&n.to_string_lossy()))
        .unwrap_or_else(FcbName::blank);

    debug!(
        "open/create \"{}\": handle {handle}, size {}, attrs 0x{:02X}",
        server_path.display(),
        props.size,
        props.attrs
    );
    let mut body = Vec::with_capacity(proto::OpenCreateReply::SIZE);
    proto::OpenCreateReply {
        attrs: props.attrs,
        name: fcb_name,
        date_time: props.time_date,
        size: props.size,
        start_cluster: handle,
        result_code,
        mode: result_mode,
    }
    .encode(&mut body);
    Outcome::ok(body)
}

//! NetMount server core.
//!
//! This crate implements the engine of a remote drive server for
//! MS-DOS/FreeDOS clients: host directories are exposed as DOS drives C..Z
//! over a compact UDP request/reply protocol.
//!
//! # Architecture
//!
//! The engine is layered, transport up:
//! - `proto`: the wire codec (header, payload records, checksum)
//! - `dos`: FCB names, attribute bits, error codes, packed timestamps
//! - `names` + `translit`: host file name to DOS 8.3 mapping
//! - `fs`: shared drives, the 16-bit handle table, DOS-semantic operations
//! - `reply_cache`: per-peer request/reply memory for idempotent retries
//! - `dispatch`: datagram validation and request routing
//! - `server` + `transport`: the single-threaded serve loop over a
//!   pluggable datagram source (OS UDP socket or SLIP over serial)

pub mod dispatch;
pub mod dos;
pub mod error;
pub mod fs;
pub mod names;
pub mod proto;
pub mod reply_cache;
pub mod server;
pub mod translit;
pub mod transport;

pub use dispatch::Dispatcher;
pub use error::{FsError, FsResult};
pub use fs::{AttrStorage, NameConversion, ShareConfig, SharedDrive};
pub use reply_cache::ReplyCache;
pub use server::serve;
pub use translit::TranslitMap;
pub use transport::{Transport, WaitResult};

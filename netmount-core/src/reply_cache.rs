//! Per-peer cache of the last request/reply pair.
//!
//! DOS clients re-send a request verbatim when a reply is lost. Replaying the
//! stored reply keeps write operations idempotent across retries, and caching
//! a zero-length reply for a request that produced none makes repeated
//! malformed requests cheap to ignore.

use std::net::SocketAddr;
use std::time::Instant;

/// Number of peers tracked; the least recently answered entry is recycled.
pub const REPLY_CACHE_SIZE: usize = 16;

#[derive(Debug)]
struct CacheEntry {
    peer: SocketAddr,
    request: Vec<u8>,
    /// Empty when the request was dispatched but produced no reply.
    reply: Vec<u8>,
    stamp: Instant,
}

/// Bounded (peer IP, peer port) keyed store of the last transaction.
#[derive(Debug, Default)]
pub struct ReplyCache {
    entries: Vec<CacheEntry>,
}

impl ReplyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a stored reply for a byte-identical retransmission.
    ///
    /// `Some(reply)` means the request was already processed; an empty slice
    /// signals "drop silently" because the original produced no reply.
    pub fn replay(&mut self, peer: SocketAddr, request: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.peer == peer && e.request == request)
            .map(|e| e.reply.as_slice())
    }

    /// Records the transaction for `peer`, evicting the oldest entry when a
    /// new peer arrives at capacity.
    pub fn store(&mut self, peer: SocketAddr, request: &[u8], reply: &[u8]) {
        let now = Instant::now();

        if let Some(entry) = self.entries.iter_mut().find(|e| e.peer == peer) {
            entry.request = request.to_vec();
            entry.reply = reply.to_vec();
            entry.stamp = now;
            return;
        }

        let entry = CacheEntry {
            peer,
            request: request.to_vec(),
            reply: reply.to_vec(),
            stamp: now,
        };

        if self.entries.len() < REPLY_CACHE_SIZE {
            self.entries.push(entry);
        } else {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.entries[oldest] = entry;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_replay_requires_identical_bytes() {
        let mut cache = ReplyCache::new();
        cache.store(peer(1000), b"request-a", b"reply-a");

        assert_eq!(cache.replay(peer(1000), b"request-a"), Some(&b"reply-a"[..]));
        assert_eq!(cache.replay(peer(1000), b"request-b"), None);
        // same bytes from a different peer are a different transaction
        assert_eq!(cache.replay(peer(2000), b"request-a"), None);
    }

    #[test]
    fn test_store_overwrites_per_peer() {
        let mut cache = ReplyCache::new();
        cache.store(peer(1000), b"first", b"reply-1");
        cache.store(peer(1000), b"second", b"reply-2");

        assert_eq!(cache.replay(peer(1000), b"first"), None);
        assert_eq!(cache.replay(peer(1000), b"second"), Some(&b"reply-2"[..]));
    }

    #[test]
    fn test_empty_reply_is_remembered() {
        let mut cache = ReplyCache::new();
        cache.store(peer(1000), b"bad-request", b"");
        assert_eq!(cache.replay(peer(1000), b"bad-request"), Some(&b""[..]));
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let mut cache = ReplyCache::new();
        for i in 0..REPLY_CACHE_SIZE as u16 {
            cache.store(peer(1000 + i), b"req", b"reply");
        }
        // refresh the first peer so the second becomes the oldest
        cache.store(peer(1000), b"req", b"reply");
        cache.store(peer(5000), b"req", b"reply");

        assert!(cache.replay(peer(1000), b"req").is_some());
        assert!(cache.replay(peer(1001), b"req").is_none());
        assert!(cache.replay(peer(5000), b"req").is_some());
    }
}

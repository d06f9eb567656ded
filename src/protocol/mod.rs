//! Wire codecs for the cache dialects the proxy fronts.
//!
//! The core needs very little from a protocol: how to cut complete
//! request/response frames out of a byte stream, where the routing key
//! sits inside a request, how to word an error in the client's own
//! dialect, and what a backend ping looks like. Everything else about
//! request handling stays in the per-connection handler.

pub mod memcache;
pub mod memcache_binary;
pub mod redis;

use std::ops::Range;

use bytes::BytesMut;

use crate::config::CacheType;
use crate::error::ProxyResult;

/// One complete request frame located at the start of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Total frame length in bytes
    pub len: usize,
    /// Routing key location inside the frame; `None` for keyless requests
    pub key: Option<Range<usize>>,
}

impl Frame {
    pub fn keyless(len: usize) -> Frame {
        Frame { len, key: None }
    }

    pub fn keyed(len: usize, key: Range<usize>) -> Frame {
        Frame { len, key: Some(key) }
    }
}

/// Protocol surface the proxy core relies on.
///
/// `frame_*` return `Ok(None)` when the buffer does not yet hold a
/// complete frame and an error only on malformed input.
pub trait Codec: Send + Sync {
    /// Locate the next complete request frame and its routing key
    fn frame_request(&self, buf: &[u8]) -> ProxyResult<Option<Frame>>;

    /// Locate the next complete response frame
    fn frame_response(&self, buf: &[u8]) -> ProxyResult<Option<usize>>;

    /// Write `message` as a protocol-framed error response
    fn encode_error(&self, message: &str, dst: &mut BytesMut);

    /// The request bytes of a backend liveness probe
    fn ping_request(&self) -> &'static [u8];

    /// Whether `response` is a healthy answer to [`Codec::ping_request`]
    fn is_pong(&self, response: &[u8]) -> bool;
}

static MEMCACHE: memcache::MemcacheCodec = memcache::MemcacheCodec;
static MEMCACHE_BINARY: memcache_binary::MemcacheBinaryCodec = memcache_binary::MemcacheBinaryCodec;
static REDIS: redis::RedisCodec = redis::RedisCodec;

/// The codec for a cluster's cache type. Redis and redis-cluster share
/// RESP; they differ only in how the forwarder routes, not on the wire.
pub fn codec_for(cache_type: CacheType) -> &'static dyn Codec {
    match cache_type {
        CacheType::Memcache => &MEMCACHE,
        CacheType::MemcacheBinary => &MEMCACHE_BINARY,
        CacheType::Redis | CacheType::RedisCluster => &REDIS,
    }
}

/// Position of the first CRLF-terminated line, if complete
pub(crate) fn find_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| pos + 2)
}

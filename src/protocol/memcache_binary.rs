//! Memcache binary protocol framing.
//!
//! Every packet starts with a fixed 24-byte header; the total body length
//! field makes framing a pure length check, the same header-first walk
//! the text protocol cannot have.

use bytes::{BufMut, BytesMut};

use super::{Codec, Frame};
use crate::error::{ProxyError, ProxyResult};

const HEADER_LEN: usize = 24;

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

const OPCODE_NOOP: u8 = 0x0a;

/// "Internal error" status, carried on admission rejects
const STATUS_INTERNAL_ERROR: u16 = 0x0084;

/// A binary NOOP request, used as the liveness probe
static NOOP_REQUEST: [u8; HEADER_LEN] = [
    MAGIC_REQUEST,
    OPCODE_NOOP,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    0,
];

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Locate one packet with the expected magic byte
fn frame_packet(buf: &[u8], magic: u8) -> ProxyResult<Option<(usize, usize, usize)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != magic {
        return Err(ProxyError::protocol(format!(
            "bad memcache binary magic: {:#04x}",
            buf[0]
        )));
    }
    let key_len = read_u16(buf, 2) as usize;
    let extras_len = buf[4] as usize;
    let total_body = read_u32(buf, 8) as usize;
    if key_len + extras_len > total_body {
        return Err(ProxyError::protocol(
            "memcache binary body shorter than key and extras",
        ));
    }
    let total = HEADER_LEN + total_body;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((total, extras_len, key_len)))
}

/// Memcache binary codec
pub struct MemcacheBinaryCodec;

impl Codec for MemcacheBinaryCodec {
    fn frame_request(&self, buf: &[u8]) -> ProxyResult<Option<Frame>> {
        let (total, extras_len, key_len) = match frame_packet(buf, MAGIC_REQUEST)? {
            Some(parts) => parts,
            None => return Ok(None),
        };
        if key_len == 0 {
            return Ok(Some(Frame::keyless(total)));
        }
        let key_start = HEADER_LEN + extras_len;
        Ok(Some(Frame::keyed(total, key_start..key_start + key_len)))
    }

    fn frame_response(&self, buf: &[u8]) -> ProxyResult<Option<usize>> {
        Ok(frame_packet(buf, MAGIC_RESPONSE)?.map(|(total, _, _)| total))
    }

    fn encode_error(&self, message: &str, dst: &mut BytesMut) {
        let body = message.as_bytes();
        dst.reserve(HEADER_LEN + body.len());
        dst.put_u8(MAGIC_RESPONSE);
        dst.put_u8(0); // opcode
        dst.put_u16(0); // key length
        dst.put_u8(0); // extras length
        dst.put_u8(0); // data type
        dst.put_u16(STATUS_INTERNAL_ERROR);
        dst.put_u32(body.len() as u32);
        dst.put_u32(0); // opaque
        dst.put_u64(0); // cas
        dst.put_slice(body);
    }

    fn ping_request(&self) -> &'static [u8] {
        &NOOP_REQUEST
    }

    fn is_pong(&self, response: &[u8]) -> bool {
        response.len() >= HEADER_LEN
            && response[0] == MAGIC_RESPONSE
            && read_u16(response, 6) == 0
    }
}

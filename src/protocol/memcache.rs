//! Memcache text protocol framing.

use bytes::{BufMut, BytesMut};

use super::{find_line, Codec, Frame};
use crate::error::{ProxyError, ProxyResult};

/// Commands followed by a `<bytes>` data block
const STORAGE_COMMANDS: &[&str] = &["set", "add", "replace", "append", "prepend", "cas"];

/// Single-key commands with the key as the second token
const KEYED_COMMANDS: &[&str] = &["get", "gets", "gat", "gats", "delete", "incr", "decr", "touch"];

/// Commands that carry no key at all
const KEYLESS_COMMANDS: &[&str] = &["version", "stats", "flush_all", "verbosity", "quit"];

/// Memcache text codec
pub struct MemcacheCodec;

impl MemcacheCodec {
    /// Byte range of the `n`-th whitespace-separated token on the line
    fn token(line: &[u8], n: usize) -> Option<std::ops::Range<usize>> {
        let mut idx = 0;
        let mut start = 0;
        let mut in_token = false;
        let mut found = None;
        for (pos, byte) in line.iter().enumerate() {
            let boundary = *byte == b' ' || *byte == b'\r';
            if !in_token && !boundary {
                in_token = true;
                start = pos;
            } else if in_token && boundary {
                if idx == n {
                    found = Some(start..pos);
                    break;
                }
                idx += 1;
                in_token = false;
            }
        }
        found
    }
}

impl Codec for MemcacheCodec {
    fn frame_request(&self, buf: &[u8]) -> ProxyResult<Option<Frame>> {
        let line_len = match find_line(buf) {
            Some(len) => len,
            None => return Ok(None),
        };
        let line = &buf[..line_len];

        let cmd_range = Self::token(line, 0)
            .ok_or_else(|| ProxyError::protocol("empty memcache request line"))?;
        let cmd = std::str::from_utf8(&line[cmd_range.clone()])
            .map_err(|_| ProxyError::protocol("memcache command is not utf-8"))?
            .to_ascii_lowercase();

        if STORAGE_COMMANDS.contains(&cmd.as_str()) {
            // <cmd> <key> <flags> <exptime> <bytes> [<cas>] [noreply]
            let key = Self::token(line, 1)
                .ok_or_else(|| ProxyError::protocol("memcache storage request without key"))?;
            let bytes_range = Self::token(line, 4)
                .ok_or_else(|| ProxyError::protocol("memcache storage request without length"))?;
            let data_len: usize = std::str::from_utf8(&line[bytes_range])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProxyError::protocol("memcache storage length is not a number"))?;

            let total = line_len + data_len + 2;
            if buf.len() < total {
                return Ok(None);
            }
            if &buf[total - 2..total] != b"\r\n" {
                return Err(ProxyError::protocol("memcache data block is not terminated"));
            }
            return Ok(Some(Frame::keyed(total, key)));
        }

        if KEYED_COMMANDS.contains(&cmd.as_str()) {
            // multi-key retrievals route by their first key
            let key = Self::token(line, 1)
                .ok_or_else(|| ProxyError::protocol("memcache request without key"))?;
            return Ok(Some(Frame::keyed(line_len, key)));
        }

        if KEYLESS_COMMANDS.contains(&cmd.as_str()) {
            return Ok(Some(Frame::keyless(line_len)));
        }

        Err(ProxyError::protocol(format!(
            "unsupported memcache command: {cmd}"
        )))
    }

    fn frame_response(&self, buf: &[u8]) -> ProxyResult<Option<usize>> {
        let mut offset = 0;
        loop {
            let line_len = match find_line(&buf[offset..]) {
                Some(len) => len,
                None => return Ok(None),
            };
            let line = &buf[offset..offset + line_len];

            if line.starts_with(b"VALUE ") {
                // VALUE <key> <flags> <bytes> [<cas>]; skip the data block
                // and keep scanning for the END line
                let bytes_range = Self::token(line, 3)
                    .ok_or_else(|| ProxyError::protocol("memcache VALUE without length"))?;
                let data_len: usize = std::str::from_utf8(&line[bytes_range])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| ProxyError::protocol("memcache VALUE length is not a number"))?;
                let block_end = offset + line_len + data_len + 2;
                if buf.len() < block_end {
                    return Ok(None);
                }
                offset = block_end;
                continue;
            }

            if line.starts_with(b"END") {
                return Ok(Some(offset + line_len));
            }

            if offset != 0 {
                return Err(ProxyError::protocol(
                    "memcache retrieval response without END",
                ));
            }
            // single-line response: STORED, DELETED, TOUCHED, NOT_FOUND,
            // numeric incr/decr result, VERSION, ERROR variants
            return Ok(Some(line_len));
        }
    }

    fn encode_error(&self, message: &str, dst: &mut BytesMut) {
        dst.reserve(message.len() + 15);
        dst.put_slice(b"SERVER_ERROR ");
        dst.put_slice(message.as_bytes());
        dst.put_slice(b"\r\n");
    }

    fn ping_request(&self) -> &'static [u8] {
        b"version\r\n"
    }

    fn is_pong(&self, response: &[u8]) -> bool {
        response.starts_with(b"VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(buf: &[u8]) -> Option<Frame> {
        MemcacheCodec.frame_request(buf).unwrap()
    }

    #[test]
    fn test_frame_get() {
        let got = frame(b"get foo\r\n").unwrap();
        assert_eq!(got.len, 9);
        assert_eq!(&b"get foo\r\n"[got.key.unwrap()], b"foo");
    }

    #[test]
    fn test_frame_multi_get_routes_by_first_key() {
        let buf = b"gets alpha beta gamma\r\n";
        let got = frame(buf).unwrap();
        assert_eq!(got.len, buf.len());
        assert_eq!(&buf[got.key.unwrap()], b"alpha");
    }

    #[test]
    fn test_frame_set_includes_data_block() {
        let buf = b"set foo 0 0 5\r\nhello\r\n";
        let got = frame(buf).unwrap();
        assert_eq!(got.len, buf.len());
        assert_eq!(&buf[got.key.unwrap()], b"foo");

        // incomplete data block
        assert!(frame(b"set foo 0 0 5\r\nhel").is_none());
    }

    #[test]
    fn test_frame_set_with_noreply() {
        let buf = b"set foo 1 60 2 noreply\r\nok\r\n";
        let got = frame(buf).unwrap();
        assert_eq!(got.len, buf.len());
    }

    #[test]
    fn test_frame_keyless() {
        let got = frame(b"version\r\n").unwrap();
        assert_eq!(got.key, None);
    }

    #[test]
    fn test_frame_incomplete_line() {
        assert!(frame(b"get fo").is_none());
    }

    #[test]
    fn test_frame_unknown_command() {
        assert!(MemcacheCodec.frame_request(b"frobnicate foo\r\n").is_err());
    }

    #[test]
    fn test_response_single_line() {
        assert_eq!(
            MemcacheCodec.frame_response(b"STORED\r\n").unwrap(),
            Some(8)
        );
    }

    #[test]
    fn test_response_value_blocks() {
        let buf = b"VALUE foo 0 5\r\nhello\r\nVALUE bar 0 2\r\nhi\r\nEND\r\n";
        assert_eq!(
            MemcacheCodec.frame_response(buf).unwrap(),
            Some(buf.len())
        );

        // missing END: not complete yet
        let partial = b"VALUE foo 0 5\r\nhello\r\n";
        assert_eq!(MemcacheCodec.frame_response(partial).unwrap(), None);
    }

    #[test]
    fn test_response_bare_end() {
        assert_eq!(MemcacheCodec.frame_response(b"END\r\n").unwrap(), Some(5));
    }

    #[test]
    fn test_encode_error() {
        let mut dst = BytesMut::new();
        MemcacheCodec.encode_error("proxy accepted more than max connections", &mut dst);
        assert_eq!(
            &dst[..],
            b"SERVER_ERROR proxy accepted more than max connections\r\n" as &[u8]
        );
    }

    #[test]
    fn test_ping() {
        assert_eq!(MemcacheCodec.ping_request(), b"version\r\n");
        assert!(MemcacheCodec.is_pong(b"VERSION 1.6.21\r\n"));
        assert!(!MemcacheCodec.is_pong(b"ERROR\r\n"));
    }
}

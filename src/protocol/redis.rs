//! RESP framing, shared by the redis and redis-cluster cache types.

use bytes::{BufMut, BytesMut};

use super::{find_line, Codec, Frame};
use crate::error::{ProxyError, ProxyResult};

/// RESP codec
pub struct RedisCodec;

/// Parse the signed decimal that follows the type byte of a `*` or `$`
/// header line. Returns `(value, line_len)`.
fn parse_header(buf: &[u8]) -> ProxyResult<Option<(i64, usize)>> {
    let line_len = match find_line(buf) {
        Some(len) => len,
        None => return Ok(None),
    };
    let digits = &buf[1..line_len - 2];
    let text = std::str::from_utf8(digits)
        .map_err(|_| ProxyError::protocol("RESP length is not utf-8"))?;
    let value: i64 = text
        .parse()
        .map_err(|_| ProxyError::protocol(format!("invalid RESP length: {text}")))?;
    Ok(Some((value, line_len)))
}

/// Total size of the RESP value at the start of `buf`, if complete
fn frame_value(buf: &[u8]) -> ProxyResult<Option<usize>> {
    if buf.is_empty() {
        return Ok(None);
    }
    match buf[0] {
        b'+' | b'-' | b':' => Ok(find_line(buf)),
        b'$' => {
            let (len, header) = match parse_header(buf)? {
                Some(parts) => parts,
                None => return Ok(None),
            };
            if len < 0 {
                // null bulk string
                return Ok(Some(header));
            }
            let total = header + len as usize + 2;
            if buf.len() < total {
                return Ok(None);
            }
            Ok(Some(total))
        }
        b'*' => {
            let (count, header) = match parse_header(buf)? {
                Some(parts) => parts,
                None => return Ok(None),
            };
            if count < 0 {
                // null array
                return Ok(Some(header));
            }
            let mut offset = header;
            for _ in 0..count {
                match frame_value(&buf[offset..])? {
                    Some(len) => offset += len,
                    None => return Ok(None),
                }
            }
            Ok(Some(offset))
        }
        other => Err(ProxyError::protocol(format!(
            "unknown RESP type byte: {}",
            other as char
        ))),
    }
}

impl Codec for RedisCodec {
    fn frame_request(&self, buf: &[u8]) -> ProxyResult<Option<Frame>> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != b'*' {
            return Err(ProxyError::protocol(
                "redis request is not a RESP array",
            ));
        }
        let (count, header) = match parse_header(buf)? {
            Some(parts) => parts,
            None => return Ok(None),
        };
        if count <= 0 {
            return Err(ProxyError::protocol("empty redis command array"));
        }

        // walk the bulk-string elements; the second one is the key for
        // every keyed command
        let mut offset = header;
        let mut key = None;
        for element in 0..count {
            if buf.len() <= offset {
                return Ok(None);
            }
            if buf[offset] != b'$' {
                return Err(ProxyError::protocol(
                    "redis command element is not a bulk string",
                ));
            }
            let (len, elem_header) = match parse_header(&buf[offset..])? {
                Some(parts) => parts,
                None => return Ok(None),
            };
            if len < 0 {
                return Err(ProxyError::protocol("null element in redis command"));
            }
            let data_start = offset + elem_header;
            let total = data_start + len as usize + 2;
            if buf.len() < total {
                return Ok(None);
            }
            if element == 1 {
                key = Some(data_start..data_start + len as usize);
            }
            offset = total;
        }

        Ok(Some(match key {
            Some(key) => Frame::keyed(offset, key),
            None => Frame::keyless(offset),
        }))
    }

    fn frame_response(&self, buf: &[u8]) -> ProxyResult<Option<usize>> {
        frame_value(buf)
    }

    fn encode_error(&self, message: &str, dst: &mut BytesMut) {
        dst.reserve(message.len() + 7);
        dst.put_slice(b"-ERR ");
        dst.put_slice(message.as_bytes());
        dst.put_slice(b"\r\n");
    }

    fn ping_request(&self) -> &'static [u8] {
        b"*1\r\n$4\r\nPING\r\n"
    }

    fn is_pong(&self, response: &[u8]) -> bool {
        response.starts_with(b"+PONG")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(buf: &[u8]) -> Option<Frame> {
        RedisCodec.frame_request(buf).unwrap()
    }

    #[test]
    fn test_frame_get() {
        let buf = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        let got = frame(buf).unwrap();
        assert_eq!(got.len, buf.len());
        assert_eq!(&buf[got.key.unwrap()], b"foo");
    }

    #[test]
    fn test_frame_set() {
        let buf = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
        let got = frame(buf).unwrap();
        assert_eq!(got.len, buf.len());
        assert_eq!(&buf[got.key.unwrap()], b"key");
    }

    #[test]
    fn test_frame_ping_is_keyless() {
        let got = frame(b"*1\r\n$4\r\nPING\r\n").unwrap();
        assert_eq!(got.key, None);
    }

    #[test]
    fn test_frame_incomplete() {
        assert!(frame(b"*2\r\n$3\r\nGET\r\n$3\r\nfo").is_none());
        assert!(frame(b"*2\r\n").is_none());
        assert!(frame(b"").is_none());
    }

    #[test]
    fn test_frame_rejects_inline_commands() {
        assert!(RedisCodec.frame_request(b"PING\r\n").is_err());
    }

    #[test]
    fn test_response_simple_types() {
        assert_eq!(RedisCodec.frame_response(b"+OK\r\n").unwrap(), Some(5));
        assert_eq!(
            RedisCodec.frame_response(b"-ERR unknown\r\n").unwrap(),
            Some(14)
        );
        assert_eq!(RedisCodec.frame_response(b":1000\r\n").unwrap(), Some(7));
    }

    #[test]
    fn test_response_bulk_string() {
        assert_eq!(
            RedisCodec.frame_response(b"$5\r\nhello\r\n").unwrap(),
            Some(11)
        );
        assert_eq!(RedisCodec.frame_response(b"$-1\r\n").unwrap(), Some(5));
        assert_eq!(RedisCodec.frame_response(b"$5\r\nhel").unwrap(), None);
    }

    #[test]
    fn test_response_nested_array() {
        let buf = b"*2\r\n$5\r\nhello\r\n*1\r\n:42\r\n";
        assert_eq!(RedisCodec.frame_response(buf).unwrap(), Some(buf.len()));
    }

    #[test]
    fn test_encode_error() {
        let mut dst = BytesMut::new();
        RedisCodec.encode_error("proxy accepted more than max connections", &mut dst);
        assert_eq!(
            &dst[..],
            b"-ERR proxy accepted more than max connections\r\n" as &[u8]
        );
    }

    #[test]
    fn test_ping() {
        let ping = RedisCodec.ping_request();
        let got = RedisCodec.frame_request(ping).unwrap().unwrap();
        assert_eq!(got.len, ping.len());
        assert!(RedisCodec.is_pong(b"+PONG\r\n"));
        assert!(!RedisCodec.is_pong(b"-ERR oops\r\n"));
    }
}

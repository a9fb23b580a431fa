//! SOCKS4 / SOCKS4a request parsing over an edge buffer.
//!
//! Only CONNECT is understood. The reply is the classic 8-byte form:
//! version 0, a result code, and six zero bytes.

use tracing::debug;
use veilnet_common::TargetAddr;

use crate::buffer::Buffer;

pub const SOCKS4_VERSION: u8 = 4;
pub const SOCKS4_CMD_CONNECT: u8 = 1;

pub const SOCKS4_REQUEST_GRANTED: u8 = 90;
pub const SOCKS4_REQUEST_REJECT: u8 = 91;
pub const SOCKS4_REQUEST_IDENT_FAILED: u8 = 92;
pub const SOCKS4_REQUEST_IDENT_CONFLICT: u8 = 93;

/// Length of the reply written back to the application
pub const SOCKS4_REPLY_LEN: usize = 8;

/// Fixed prefix of a request: VN, CD, DSTPORT, DSTIP
const SOCKS4_FIXED_LEN: usize = 8;

/// Refuse to scan for terminators past this point
const SOCKS4_MAX_REQUEST: usize = 600;

/// Outcome of one parse attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksParse {
    /// Bytes so far are a valid prefix; wait for more
    NeedMore,

    /// A complete CONNECT request; consumed from the buffer
    Request(TargetAddr),

    /// Malformed or unsupported request
    Invalid,
}

/// Try to parse one SOCKS4 CONNECT request from the front of `buf`.
///
/// On success the request bytes are consumed; on `NeedMore` the buffer is
/// left untouched; on `Invalid` consumption does not matter because the
/// connection is about to be refused.
pub fn parse_request(buf: &mut Buffer) -> SocksParse {
    let mut window = [0u8; SOCKS4_MAX_REQUEST];
    let have = buf.peek(&mut window);

    if have < SOCKS4_FIXED_LEN {
        return SocksParse::NeedMore;
    }

    if window[0] != SOCKS4_VERSION || window[1] != SOCKS4_CMD_CONNECT {
        debug!(version = window[0], command = window[1], "not a socks4 connect");
        return SocksParse::Invalid;
    }

    let port = u16::from_be_bytes([window[2], window[3]]);
    if port == 0 {
        return SocksParse::Invalid;
    }
    let ip = [window[4], window[5], window[6], window[7]];

    // userid, terminated by NUL
    let Some(userid_nul) = find_nul(&window[..have], SOCKS4_FIXED_LEN) else {
        return if have == SOCKS4_MAX_REQUEST {
            SocksParse::Invalid
        } else {
            SocksParse::NeedMore
        };
    };

    // An ip of 0.0.0.x (x != 0) means a hostname follows the userid.
    let is_4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;

    if is_4a {
        let Some(host_nul) = find_nul(&window[..have], userid_nul + 1) else {
            return if have == SOCKS4_MAX_REQUEST {
                SocksParse::Invalid
            } else {
                SocksParse::NeedMore
            };
        };
        let host = match std::str::from_utf8(&window[userid_nul + 1..host_nul]) {
            Ok(h) if !h.is_empty() => h.to_string(),
            _ => return SocksParse::Invalid,
        };
        buf.skip(host_nul + 1);
        SocksParse::Request(TargetAddr::new(host, port))
    } else {
        let host = format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]);
        buf.skip(userid_nul + 1);
        SocksParse::Request(TargetAddr::new(host, port))
    }
}

/// Build the 8-byte SOCKS4 reply for a result code.
pub fn reply(result: u8) -> [u8; SOCKS4_REPLY_LEN] {
    let mut out = [0u8; SOCKS4_REPLY_LEN];
    out[1] = result;
    out
}

fn find_nul(bytes: &[u8], from: usize) -> Option<usize> {
    bytes[from..].iter().position(|&b| b == 0).map(|i| from + i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf_with(bytes: &[u8]) -> Buffer {
        let mut buf = Buffer::new();
        buf.write(bytes).unwrap();
        buf
    }

    #[test]
    fn test_parse_connect_ipv4() {
        // CONNECT 127.0.0.1:80, empty userid
        let mut buf = buf_with(&[0x04, 0x01, 0x00, 0x50, 0x7f, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(
            parse_request(&mut buf),
            SocksParse::Request(TargetAddr::new("127.0.0.1", 80))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_consumes_only_request() {
        let mut bytes = vec![0x04, 0x01, 0x00, 0x50, 0x7f, 0x00, 0x00, 0x01, 0x00];
        bytes.extend_from_slice(b"GET /");
        let mut buf = buf_with(&bytes);

        assert!(matches!(parse_request(&mut buf), SocksParse::Request(_)));
        assert_eq!(buf.datalen(), 5);
    }

    #[test]
    fn test_need_more_on_partial() {
        let mut buf = buf_with(&[0x04, 0x01, 0x00]);
        assert_eq!(parse_request(&mut buf), SocksParse::NeedMore);
        assert_eq!(buf.datalen(), 3);

        // full prefix but no userid terminator yet
        let mut buf = buf_with(&[0x04, 0x01, 0x00, 0x50, 0x7f, 0x00, 0x00, 0x01]);
        assert_eq!(parse_request(&mut buf), SocksParse::NeedMore);
    }

    #[test]
    fn test_reject_bad_version_or_command() {
        let mut buf = buf_with(&[0x05, 0x01, 0x00, 0x50, 0x7f, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(parse_request(&mut buf), SocksParse::Invalid);

        let mut buf = buf_with(&[0x04, 0x02, 0x00, 0x50, 0x7f, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(parse_request(&mut buf), SocksParse::Invalid);
    }

    #[test]
    fn test_reject_zero_port() {
        let mut buf = buf_with(&[0x04, 0x01, 0x00, 0x00, 0x7f, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(parse_request(&mut buf), SocksParse::Invalid);
    }

    #[test]
    fn test_socks4a_hostname() {
        let mut bytes = vec![0x04, 0x01, 0x01, 0xbb, 0x00, 0x00, 0x00, 0x01];
        bytes.push(0x00); // empty userid
        bytes.extend_from_slice(b"example.com\0");
        let mut buf = buf_with(&bytes);

        assert_eq!(
            parse_request(&mut buf),
            SocksParse::Request(TargetAddr::new("example.com", 443))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_socks4a_waits_for_hostname() {
        let mut bytes = vec![0x04, 0x01, 0x01, 0xbb, 0x00, 0x00, 0x00, 0x01];
        bytes.push(0x00);
        bytes.extend_from_slice(b"example");
        let mut buf = buf_with(&bytes);

        assert_eq!(parse_request(&mut buf), SocksParse::NeedMore);
    }

    #[test]
    fn test_reply_layout() {
        let granted = reply(SOCKS4_REQUEST_GRANTED);
        assert_eq!(granted, [0, 90, 0, 0, 0, 0, 0, 0]);

        let rejected = reply(SOCKS4_REQUEST_REJECT);
        assert_eq!(rejected[1], 91);
    }
}

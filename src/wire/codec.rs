// Byte-level HTTP/1.1 framing shared by the edge server, the processor
// client and the peer client. Only the request and response shapes this
// service produces and consumes are understood.

use http::{Method, StatusCode};

pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
pub const KEEP_ALIVE_TIMEOUT_SECS: u32 = 5;

const CONTENT_LENGTH: &[u8] = b"content-length:";
const CONNECTION: &[u8] = b"connection:";

/// Parsed request line plus the two headers the server acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead<'a> {
    pub method: Method,
    pub target: &'a str,
    pub content_length: Option<usize>,
    pub close: bool,
}

impl<'a> RequestHead<'a> {
    /// Path component of the request target
    pub fn path(&self) -> &'a str {
        split_target(self.target).0
    }

    pub fn query(&self) -> Option<&'a str> {
        split_target(self.target).1
    }
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Offset of the `\r\n\r\n` that ends a header block
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    find(buf, HEADER_TERMINATOR)
}

fn header_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    head.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn header_value<'h>(line: &'h [u8], name: &[u8]) -> Option<&'h [u8]> {
    if line.len() >= name.len() && line[..name.len()].eq_ignore_ascii_case(name) {
        Some(&line[name.len()..])
    } else {
        None
    }
}

/// Value of the first `Content-Length` header.
///
/// `None` when the header is missing or its value is not a plain run of
/// decimal digits.
pub fn parse_content_length(head: &[u8]) -> Option<usize> {
    let value = header_lines(head).skip(1).find_map(|line| header_value(line, CONTENT_LENGTH))?;
    let value = value.trim_ascii();
    if value.is_empty() {
        return None;
    }

    value.iter().try_fold(0usize, |acc, &b| {
        if b.is_ascii_digit() {
            acc.checked_mul(10)?.checked_add((b - b'0') as usize)
        } else {
            None
        }
    })
}

/// True when a `Connection` header asks for `close`
pub fn wants_close(head: &[u8]) -> bool {
    header_lines(head)
        .skip(1)
        .filter_map(|line| header_value(line, CONNECTION))
        .any(|value| value.to_ascii_lowercase().windows(5).any(|w| w == b"close"))
}

/// Parse the request line and the headers of interest from a header block
/// (everything before the terminator).
pub fn parse_request_head(head: &[u8]) -> Option<RequestHead<'_>> {
    let line_end = find(head, b"\r\n").unwrap_or(head.len());
    let mut parts = head[..line_end].split(|&b| b == b' ');

    let method = Method::from_bytes(parts.next()?).ok()?;
    let target = std::str::from_utf8(parts.next()?).ok()?;
    let version = parts.next()?;
    if !version.starts_with(b"HTTP/1.") || parts.next().is_some() || !target.starts_with('/') {
        return None;
    }

    Some(RequestHead {
        method,
        target,
        content_length: parse_content_length(head),
        close: wants_close(head),
    })
}

/// Three-digit status code read positionally after the first space
pub fn parse_status_line(line: &[u8]) -> Option<u16> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if !line.starts_with(b"HTTP/") {
        return None;
    }
    let sp = line.iter().position(|&b| b == b' ')?;
    let digits = line.get(sp + 1..sp + 4)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if let Some(&next) = line.get(sp + 4) {
        if next != b' ' {
            return None;
        }
    }
    Some(digits.iter().fold(0u16, |acc, &d| acc * 10 + (d - b'0') as u16))
}

/// Split `path?query`
pub fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// ASCII decimal digits of `value`, written right-aligned into `dst`
pub fn encode_decimal(mut value: usize, dst: &mut [u8; 20]) -> &[u8] {
    let mut start = dst.len();
    loop {
        start -= 1;
        dst[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &dst[start..]
}

/// Status line and headers for a server response
pub fn encode_response_head(
    out: &mut Vec<u8>,
    status: StatusCode,
    keep_alive: bool,
    content_type: Option<&str>,
    content_length: usize,
) {
    let mut digits = [0u8; 20];

    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    out.extend_from_slice(b"\r\n");
    if let Some(content_type) = content_type {
        out.extend_from_slice(b"Content-Type: ");
        out.extend_from_slice(content_type.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"Content-Length: ");
    out.extend_from_slice(encode_decimal(content_length, &mut digits));
    out.extend_from_slice(b"\r\n");
    if keep_alive {
        out.extend_from_slice(b"Connection: keep-alive\r\nKeep-Alive: timeout=");
        out.extend_from_slice(encode_decimal(KEEP_ALIVE_TIMEOUT_SECS as usize, &mut digits));
        out.extend_from_slice(b"\r\n");
    } else {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Fixed part of a JSON POST, up to and including `Content-Length: `.
/// The digits, the terminator and the body follow in the same write.
pub fn post_request_prefix(path: &str, host: &str) -> Vec<u8> {
    format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: ",
        path, host
    )
    .into_bytes()
}

/// A bodiless GET that asks the server to close afterwards
pub fn get_request(target: &str, host: &str) -> Vec<u8> {
    format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        target, host
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\n"), Some(14));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
        assert_eq!(find_header_end(b""), None);
    }

    #[test]
    fn test_content_length_is_case_insensitive() {
        let head = b"POST /payments HTTP/1.1\r\ncontent-LENGTH:  42\r\nHost: x";
        assert_eq!(parse_content_length(head), Some(42));

        let tabbed = b"POST /payments HTTP/1.1\r\nContent-Length:\t7";
        assert_eq!(parse_content_length(tabbed), Some(7));
    }

    #[test]
    fn test_content_length_rejects_malformed_values() {
        assert_eq!(parse_content_length(b"POST / HTTP/1.1\r\nHost: x"), None);
        assert_eq!(parse_content_length(b"POST / HTTP/1.1\r\nContent-Length: "), None);
        assert_eq!(parse_content_length(b"POST / HTTP/1.1\r\nContent-Length: 12a"), None);
        assert_eq!(parse_content_length(b"POST / HTTP/1.1\r\nContent-Length: -1"), None);
        assert_eq!(
            parse_content_length(b"POST / HTTP/1.1\r\nContent-Length: 99999999999999999999999"),
            None
        );
    }

    #[test]
    fn test_wants_close() {
        assert!(wants_close(b"GET / HTTP/1.1\r\nConnection: Close"));
        assert!(wants_close(b"GET / HTTP/1.1\r\nHost: x\r\nconnection: keep-alive, close"));
        assert!(!wants_close(b"GET / HTTP/1.1\r\nConnection: keep-alive"));
        assert!(!wants_close(b"GET /close HTTP/1.1\r\nHost: x"));
    }

    #[test]
    fn test_parse_request_head() {
        let head = b"POST /payments HTTP/1.1\r\nHost: x\r\nContent-Length: 10";
        let parsed = parse_request_head(head).unwrap();
        assert_eq!(parsed.method, Method::POST);
        assert_eq!(parsed.path(), "/payments");
        assert_eq!(parsed.query(), None);
        assert_eq!(parsed.content_length, Some(10));
        assert!(!parsed.close);

        let get = parse_request_head(b"GET /payments-summary?from=a&to=b HTTP/1.1").unwrap();
        assert_eq!(get.path(), "/payments-summary");
        assert_eq!(get.query(), Some("from=a&to=b"));

        assert!(parse_request_head(b"GARBAGE").is_none());
        assert!(parse_request_head(b"GET / SPDY/3").is_none());
        assert!(parse_request_head(b"GET nope HTTP/1.1").is_none());
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK\r"), Some(200));
        assert_eq!(parse_status_line(b"HTTP/1.1 503 Service Unavailable"), Some(503));
        assert_eq!(parse_status_line(b"HTTP/1.1 422"), Some(422));
        assert_eq!(parse_status_line(b"HTTP/1.1 20"), None);
        assert_eq!(parse_status_line(b"HTTP/1.1 2000 OK"), None);
        assert_eq!(parse_status_line(b"hello"), None);
    }

    #[test]
    fn test_encode_decimal() {
        let mut digits = [0u8; 20];
        assert_eq!(encode_decimal(0, &mut digits), b"0");
        assert_eq!(encode_decimal(1234, &mut digits), b"1234");
        assert_eq!(encode_decimal(usize::MAX, &mut digits), usize::MAX.to_string().as_bytes());
    }

    #[test]
    fn test_request_framing_round_trip() {
        let body = br#"{"correlationId":"abc-1","amount":19.90}"#;
        let mut digits = [0u8; 20];

        let mut wire = post_request_prefix("/payments", "localhost");
        wire.extend_from_slice(encode_decimal(body.len(), &mut digits));
        wire.extend_from_slice(HEADER_TERMINATOR);
        wire.extend_from_slice(body);

        let end = find_header_end(&wire).unwrap();
        let head = parse_request_head(&wire[..end]).unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.path(), "/payments");
        assert_eq!(head.content_length, Some(body.len()));
        assert!(!head.close);
        assert_eq!(&wire[end + HEADER_TERMINATOR.len()..], body);

        let get = get_request("/payments-summary-lock?from=x&to=y", "localhost");
        let end = find_header_end(&get).unwrap();
        let head = parse_request_head(&get[..end]).unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/payments-summary-lock?from=x&to=y");
        assert!(head.close);
        assert_eq!(end + HEADER_TERMINATOR.len(), get.len());
    }

    #[test]
    fn test_response_framing_round_trip() {
        let body = br#"{"ok":true}"#;
        let mut wire = Vec::new();
        encode_response_head(&mut wire, StatusCode::OK, true, Some("application/json"), body.len());
        wire.extend_from_slice(body);

        let end = find_header_end(&wire).unwrap();
        let head = &wire[..end];
        let status_end = find(head, b"\r\n").unwrap();
        assert_eq!(parse_status_line(&head[..status_end]), Some(200));
        assert_eq!(parse_content_length(head), Some(body.len()));
        assert!(!wants_close(head));
        assert!(find(head, b"Keep-Alive: timeout=5").is_some());
        assert_eq!(&wire[end + HEADER_TERMINATOR.len()..], body);

        let mut closing = Vec::new();
        encode_response_head(&mut closing, StatusCode::BAD_REQUEST, false, None, 0);
        assert_eq!(
            closing,
            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }
}

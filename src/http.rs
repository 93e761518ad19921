//! HTTP/1.1 glue around the transport core.
//!
//! The transport reads and writes whole messages; parsing of message heads
//! is delegated to `httparse`. Only the pieces the transport needs are
//! here: building outbound request bytes for the three schemes, reading a
//! full response, reading one inbound request, and the fixed response
//! status table.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::location::Location;

const MAX_HEADERS: usize = 64;

/// Upper bound on a message head; a peer that sends more is broken.
const MAX_HEAD_BYTES: usize = 256 * 1024;

/// How a request is built from a message, one variant per scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `https`: GET, message data is the query string.
    Get,
    /// `posts`: POST, message data is the body.
    Post,
    /// `fulls`: message data is the complete request.
    Full,
}

impl RequestKind {
    pub(crate) fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "https" => Some(Self::Get),
            "posts" => Some(Self::Post),
            "fulls" => Some(Self::Full),
            _ => None,
        }
    }
}

fn host_header(location: &Location) -> String {
    if location.port() == 443 {
        location.host().to_owned()
    } else {
        format!("{}:{}", location.host(), location.port())
    }
}

/// Serialize one outbound request.
pub(crate) fn build_request(kind: RequestKind, location: &Location, data: &[u8]) -> Vec<u8> {
    let path = if location.path().is_empty() {
        "/"
    } else {
        location.path()
    };

    match kind {
        RequestKind::Get => {
            let mut head = format!("GET {path}");
            if !data.is_empty() {
                head.push('?');
                head.push_str(&String::from_utf8_lossy(data));
            } else if let Some(query) = location.query() {
                head.push('?');
                head.push_str(query);
            }
            head.push_str(" HTTP/1.1\r\nHost: ");
            head.push_str(&host_header(location));
            head.push_str("\r\n\r\n");
            head.into_bytes()
        }
        RequestKind::Post => {
            let mut head = format!("POST {path}");
            if let Some(query) = location.query() {
                head.push('?');
                head.push_str(query);
            }
            head.push_str(" HTTP/1.1\r\nHost: ");
            head.push_str(&host_header(location));
            head.push_str(&format!("\r\nContent-Length: {}\r\n\r\n", data.len()));
            let mut bytes = head.into_bytes();
            bytes.extend_from_slice(data);
            bytes
        }
        RequestKind::Full => data.to_vec(),
    }
}

/// A fully read response.
#[derive(Debug)]
pub(crate) struct ParsedResponse {
    pub code: i32,
    pub first_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

fn header_value<'h>(headers: &'h [(String, String)], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn content_length(headers: &[(String, String)]) -> io::Result<Option<usize>> {
    match header_value(headers, "content-length") {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad Content-Length")),
        None => Ok(None),
    }
}

async fn fill_head<R>(io: &mut R, buf: &mut BytesMut) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    if buf.len() > MAX_HEAD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message head too large",
        ));
    }
    if io.read_buf(buf).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before message head",
        ));
    }
    Ok(())
}

async fn read_body<R>(
    io: &mut R,
    mut body: Vec<u8>,
    content_length: Option<usize>,
) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    match content_length {
        Some(length) => {
            if body.len() > length {
                body.truncate(length);
            }
            body.reserve(length - body.len());
            while body.len() < length {
                if io.read_buf(&mut body).await? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("not full content: {} bytes from {length}", body.len()),
                    ));
                }
            }
            body.truncate(length);
            Ok(body)
        }
        None => {
            // No Content-Length: drain to EOF.
            loop {
                body.reserve(9500);
                if io.read_buf(&mut body).await? == 0 {
                    return Ok(body);
                }
            }
        }
    }
}

/// Read one full response: head, then body per `Content-Length`, else
/// drain to EOF.
pub(crate) async fn read_response<R>(io: &mut R) -> io::Result<ParsedResponse>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut header_slots);

        match response.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let code = i32::from(response.code.unwrap_or(0));
                let first_line = format!(
                    "HTTP/1.{} {} {}",
                    response.version.unwrap_or(1),
                    code,
                    response.reason.unwrap_or(""),
                );
                let headers: Vec<(String, String)> = response
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_owned(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();

                let length = content_length(&headers)?;
                let body = read_body(io, buf[head_len..].to_vec(), length).await?;

                return Ok(ParsedResponse {
                    code,
                    first_line,
                    headers,
                    body,
                });
            }
            Ok(httparse::Status::Partial) => fill_head(io, &mut buf).await?,
            Err(error) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, error.to_string()));
            }
        }
    }
}

/// One inbound request, fully read.
#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ParsedRequest {
    /// Best compression scheme the client accepts; only gzip is supported.
    pub(crate) fn accepts_gzip(&self) -> bool {
        header_value(&self.headers, "accept-encoding")
            .is_some_and(|v| v.split(',').any(|e| e.trim().eq_ignore_ascii_case("gzip")))
    }
}

/// Read one request head and, when `Content-Length` is present, its body.
pub(crate) async fn read_request<R>(io: &mut R) -> io::Result<ParsedRequest>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut header_slots);

        match request.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = request.method.unwrap_or("").to_owned();
                let target = request.path.unwrap_or("");
                let (path, query) = match target.split_once('?') {
                    Some((path, query)) => (path.to_owned(), query.to_owned()),
                    None => (target.to_owned(), String::new()),
                };
                let headers: Vec<(String, String)> = request
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_owned(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();

                let body = match content_length(&headers)? {
                    Some(length) => read_body(io, buf[head_len..].to_vec(), Some(length)).await?,
                    None => Vec::new(),
                };

                return Ok(ParsedRequest {
                    method,
                    path,
                    query,
                    headers,
                    body,
                });
            }
            Ok(httparse::Status::Partial) => fill_head(io, &mut buf).await?,
            Err(error) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, error.to_string()));
            }
        }
    }
}

/// Response kinds a server callback can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseError {
    BadRequest,
    Forbidden,
    NotFound,
    TooManyRequests,
    InternalError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    BandwidthLimitExceeded,
}

pub(crate) fn status_line(error: Option<ResponseError>) -> &'static str {
    match error {
        None => "200 OK",
        Some(ResponseError::BadRequest) => "400 Bad Request",
        Some(ResponseError::Forbidden) => "403 Forbidden",
        Some(ResponseError::NotFound) => "404 Not Found",
        Some(ResponseError::TooManyRequests) => "429 Too Many Requests",
        Some(ResponseError::InternalError) => "500 Internal Server Error",
        Some(ResponseError::NotImplemented) => "501 Not Implemented",
        Some(ResponseError::BadGateway) => "502 Bad Gateway",
        Some(ResponseError::ServiceUnavailable) => "503 Service Unavailable",
        Some(ResponseError::BandwidthLimitExceeded) => "509 Bandwidth Limit Exceeded",
    }
}

/// Serialize a response head in wire order: status line, optional
/// `Content-Encoding`, `Connection`, `Content-Length`, caller headers.
pub(crate) fn build_response_head(
    error: Option<ResponseError>,
    content_encoding: Option<&str>,
    content_length: usize,
    extra_headers: &str,
) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {}\r\n", status_line(error));
    if let Some(encoding) = content_encoding {
        head.push_str(&format!("Content-Encoding: {encoding}\r\n"));
    }
    head.push_str("Connection: Keep-Alive\r\n");
    head.push_str(&format!("Content-Length: {content_length}\r\n"));
    head.push_str(extra_headers);
    head.push_str("\r\n");
    head.into_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    fn location(addr: &str) -> Location {
        Location::parse(addr).unwrap()
    }

    #[test]
    fn build_get() {
        let bytes = build_request(
            RequestKind::Get,
            &location("https://example.com/ping"),
            b"x=1",
        );
        assert_eq!(
            bytes,
            b"GET /ping?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn build_get_nonstandard_port() {
        let bytes = build_request(
            RequestKind::Get,
            &location("https://example.com:8443/ping"),
            b"",
        );
        assert_eq!(bytes, b"GET /ping HTTP/1.1\r\nHost: example.com:8443\r\n\r\n");
    }

    #[test]
    fn build_post() {
        let bytes = build_request(
            RequestKind::Post,
            &location("posts://example.com/svc"),
            b"payload",
        );
        assert_eq!(
            bytes,
            b"POST /svc HTTP/1.1\r\nHost: example.com\r\nContent-Length: 7\r\n\r\npayload"
        );
    }

    #[test]
    fn build_full_is_verbatim() {
        let raw = b"PUT /x HTTP/1.1\r\nHost: h\r\n\r\n";
        let bytes = build_request(RequestKind::Full, &location("fulls://example.com"), raw);
        assert_eq!(bytes, raw);
    }

    #[tokio::test]
    async fn response_with_content_length() {
        let mut wire: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody";
        let response = read_response(&mut wire).await.unwrap();
        assert_eq!(response.code, 200);
        assert_eq!(response.first_line, "HTTP/1.1 200 OK");
        assert_eq!(response.body, b"body");
    }

    #[tokio::test]
    async fn response_without_length_drains_to_eof() {
        let mut wire: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\noops, it broke";
        let response = read_response(&mut wire).await.unwrap();
        assert_eq!(response.code, 500);
        assert_eq!(response.body, b"oops, it broke");
    }

    #[tokio::test]
    async fn response_truncated_body_is_an_error() {
        let mut wire: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        let err = read_response(&mut wire).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn request_get_with_query() {
        let mut wire: &[u8] =
            b"GET /svc?a=1&b=2 HTTP/1.1\r\nHost: h\r\nAccept-Encoding: gzip, deflate\r\n\r\n";
        let request = read_request(&mut wire).await.unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/svc");
        assert_eq!(request.query, "a=1&b=2");
        assert!(request.accepts_gzip());
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn request_post_reads_body() {
        let mut wire: &[u8] = b"POST /svc HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let request = read_request(&mut wire).await.unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.body, b"hello");
        assert!(!request.accepts_gzip());
    }

    #[test]
    fn status_table() {
        assert_eq!(status_line(None), "200 OK");
        assert_eq!(
            status_line(Some(ResponseError::TooManyRequests)),
            "429 Too Many Requests"
        );
        assert_eq!(
            status_line(Some(ResponseError::BandwidthLimitExceeded)),
            "509 Bandwidth Limit Exceeded"
        );
    }

    #[test]
    fn response_head_order() {
        let head = build_response_head(None, Some("gzip"), 12, "X-Extra: 1\r\n");
        assert_eq!(
            head,
            b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nConnection: Keep-Alive\r\nContent-Length: 12\r\nX-Extra: 1\r\n\r\n"
        );
    }
}

//! Module with the HTTP request type and its parser.

use std::fmt;
use std::str;

use crate::method::Method;
use crate::span::Span;
use crate::uri::{self, Scanner, Url};
use crate::MAX_REQUEST_HEADERS;

/// Error returned when parsing a request head fails.
///
/// None of these can be recovered from; the connection the head came from
/// must be closed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The request line doesn't start with a method.
    MissingMethod,
    /// The method is not one of [`Method`]'s.
    UnknownMethod,
    /// No space after the method.
    MissingSpaceAfterMethod,
    /// The request target is not a valid URL.
    InvalidUrl,
    /// The HTTP version token is missing or unknown.
    InvalidVersion,
    /// A header name is not followed by `:`.
    MissingHeaderColon,
    /// A header value is not followed by CRLF.
    MissingHeaderCrlf,
    /// Bytes after the empty line ending the head.
    TrailingBytes,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ParseError::*;
        f.write_str(match self {
            MissingMethod => "missing method",
            UnknownMethod => "method not supported",
            MissingSpaceAfterMethod => "missing space after method",
            InvalidUrl => "invalid URL",
            InvalidVersion => "invalid HTTP version token",
            MissingHeaderColon => "missing ':' after header name",
            MissingHeaderCrlf => "missing CRLF after header value",
            TrailingBytes => "bytes after the empty line",
        })
    }
}

/// A parsed HTTP request.
///
/// The request owns a copy of its head and body, so it stays valid for as
/// long as the application wants to keep it around; URL and header
/// accessors borrow from that storage. A single `Request` is meant to be
/// reused across [`Server::wait`] calls so the allocations amortize.
///
/// [`Server::wait`]: crate::Server::wait
#[derive(Debug, Default)]
pub struct Request {
    head: Vec<u8>,
    body: Vec<u8>,
    valid: bool,
    method: Method,
    url: Url,
    /// `(name, value)` spans into `head`, at most [`MAX_REQUEST_HEADERS`].
    headers: Vec<(Span, Span)>,
    ignored: usize,
}

impl Request {
    /// Create an empty, invalid request.
    pub fn new() -> Request {
        Request::default()
    }

    /// Parse `head` as a request head: request line, headers and the
    /// terminating empty line.
    ///
    /// On error the request is left invalid. The previous contents are
    /// discarded either way.
    pub fn parse(&mut self, head: &[u8]) -> Result<(), ParseError> {
        self.valid = false;
        self.method = Method::Get;
        self.url = Url::default();
        self.headers.clear();
        self.ignored = 0;
        self.body.clear();
        self.head.clear();
        self.head.extend_from_slice(head);

        let parsed = parse_head(&self.head, &mut self.headers, &mut self.ignored)?;
        self.method = parsed.method;
        self.url = parsed.url;
        self.valid = true;
        Ok(())
    }

    /// Returns `true` if the last [`parse`] succeeded.
    ///
    /// [`parse`]: Request::parse
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// The request method.
    pub const fn method(&self) -> Method {
        self.method
    }

    /// The parsed request target.
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// The request path.
    pub fn path(&self) -> &str {
        self.resolve_str(self.url.path)
    }

    /// The query string, without the leading `?`.
    pub fn query(&self) -> &str {
        self.resolve_str(self.url.query)
    }

    /// Resolve a [`Span`] of [`Request::url`] against the head this request
    /// was parsed from.
    pub fn resolve(&self, span: Span) -> &[u8] {
        span.of(&self.head)
    }

    fn resolve_str(&self, span: Span) -> &str {
        str::from_utf8(self.resolve(span)).unwrap_or("")
    }

    /// The captured headers, in order.
    pub fn headers(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.headers
            .iter()
            .map(move |(name, value)| (self.resolve(*name), self.resolve(*value)))
    }

    /// The value of the first header named `name`.
    ///
    /// The comparison is byte-for-byte, so case-sensitive.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers()
            .find(|(n, _)| *n == name.as_bytes())
            .map(|(_, value)| value)
    }

    /// The number of captured headers.
    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// The number of headers dropped because more than
    /// [`MAX_REQUEST_HEADERS`] were sent.
    pub const fn ignored_count(&self) -> usize {
        self.ignored
    }

    /// The request body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn set_body(&mut self, body: &[u8]) {
        self.body.clear();
        self.body.extend_from_slice(body);
    }

    /// The body length declared by the `Content-Length` header.
    ///
    /// Returns `Some(0)` when the header is missing or its value doesn't
    /// start with a digit (after optional whitespace), and `None` when the
    /// declared length overflows.
    pub fn content_length(&self) -> Option<usize> {
        if !self.valid {
            return Some(0);
        }
        let value = match self.header("Content-Length") {
            Some(value) => value,
            None => return Some(0),
        };

        let mut i = 0;
        while i < value.len() && uri::is_space(value[i]) {
            i += 1;
        }
        if i == value.len() || !value[i].is_ascii_digit() {
            return Some(0);
        }

        let mut length: usize = 0;
        while i < value.len() && value[i].is_ascii_digit() {
            let digit = (value[i] - b'0') as usize;
            length = length.checked_mul(10)?.checked_add(digit)?;
            i += 1;
        }
        Some(length)
    }
}

struct HeadParts {
    method: Method,
    url: Url,
}

/// Parse a full request head (including the terminating empty line) out of
/// `bytes`, pushing up to [`MAX_REQUEST_HEADERS`] header spans into
/// `headers` and counting the overflow in `ignored`.
fn parse_head(
    bytes: &[u8],
    headers: &mut Vec<(Span, Span)>,
    ignored: &mut usize,
) -> Result<HeadParts, ParseError> {
    let mut sc = Scanner::new(bytes);

    let method = parse_method(&mut sc)?;
    if !sc.consume_byte(b' ') {
        return Err(ParseError::MissingSpaceAfterMethod);
    }
    let url = uri::parse_url(&mut sc).ok_or(ParseError::InvalidUrl)?;

    if !sc.consume_bytes(b" HTTP/1\r\n")
        && !sc.consume_bytes(b" HTTP/1.0\r\n")
        && !sc.consume_bytes(b" HTTP/1.1\r\n")
    {
        return Err(ParseError::InvalidVersion);
    }

    // Headers, up to the empty line.
    if !sc.consume_bytes(b"\r\n") {
        loop {
            let name_start = sc.pos();
            let _ = sc.consume_while(|b| b != b':');
            let name = Span::until(name_start, sc.pos());
            if !sc.consume_byte(b':') {
                return Err(ParseError::MissingHeaderColon);
            }

            let value_start = sc.pos();
            let _ = sc.consume_while(|b| b != b'\r');
            let value = Span::until(value_start, sc.pos());

            if headers.len() < MAX_REQUEST_HEADERS {
                headers.push((name, value));
            } else {
                *ignored += 1;
            }

            if !sc.consume_bytes(b"\r\n") {
                return Err(ParseError::MissingHeaderCrlf);
            }
            if sc.consume_bytes(b"\r\n") {
                break;
            }
        }
    }

    if !sc.is_end() {
        return Err(ParseError::TrailingBytes);
    }
    Ok(HeadParts { method, url })
}

fn parse_method(sc: &mut Scanner<'_>) -> Result<Method, ParseError> {
    let start = sc.pos();
    if !sc.consume_while(uri::is_upper_alpha) {
        return Err(ParseError::MissingMethod);
    }
    match sc.taken(start) {
        b"GET" => Ok(Method::Get),
        b"POST" => Ok(Method::Post),
        _ => Err(ParseError::UnknownMethod),
    }
}

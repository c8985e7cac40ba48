//! URI parsing, following RFC 3986.
//!
//! The parser is a hand-written recursive-descent scanner producing
//! [`Span`]s into the scanned bytes, so parsing allocates nothing. The
//! standalone [`Ipv4`] and [`Ipv6`] parsers are exposed as well since they
//! are useful on their own.

use std::fmt;

use crate::span::Span;

/// Byte cursor over `bytes` with the small set of consuming primitives the
/// grammar needs. All `consume_*` functions return whether they consumed
/// anything; the ones that can partially match restore the cursor
/// themselves or leave that to the caller via [`Scanner::rewind`].
pub(crate) struct Scanner<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> Scanner<'a> {
    pub(crate) const fn new(bytes: &'a [u8]) -> Scanner<'a> {
        Scanner { bytes, off: 0 }
    }

    pub(crate) const fn is_end(&self) -> bool {
        self.off == self.bytes.len()
    }

    pub(crate) const fn pos(&self) -> usize {
        self.off
    }

    pub(crate) fn rewind(&mut self, pos: usize) {
        debug_assert!(pos <= self.off);
        self.off = pos;
    }

    /// Bytes consumed since `start`.
    pub(crate) fn taken(&self, start: usize) -> &'a [u8] {
        &self.bytes[start..self.off]
    }

    fn curr(&self) -> u8 {
        self.bytes[self.off]
    }

    fn advance(&mut self) {
        debug_assert!(self.off < self.bytes.len());
        self.off += 1;
    }

    pub(crate) fn consume_byte(&mut self, b: u8) -> bool {
        if self.is_end() || self.curr() != b {
            return false;
        }
        self.advance();
        true
    }

    pub(crate) fn consume_bytes(&mut self, s: &[u8]) -> bool {
        if !self.bytes[self.off..].starts_with(s) {
            return false;
        }
        self.off += s.len();
        true
    }

    /// Consume a run of bytes matching `test`. Returns `true` iff at least
    /// one byte was consumed.
    pub(crate) fn consume_while(&mut self, test: impl Fn(u8) -> bool) -> bool {
        self.consume_head_body(&test, &test)
    }

    /// Consume a run whose first byte matches `head` and whose following
    /// bytes match `body`. Returns `true` iff at least one byte was
    /// consumed.
    pub(crate) fn consume_head_body(
        &mut self,
        head: impl Fn(u8) -> bool,
        body: impl Fn(u8) -> bool,
    ) -> bool {
        if self.is_end() || !head(self.curr()) {
            return false;
        }
        self.advance();
        while !self.is_end() && body(self.curr()) {
            self.advance();
        }
        true
    }
}

impl<'a> fmt::Debug for Scanner<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("off", &self.off)
            .field("len", &self.bytes.len())
            .finish()
    }
}

pub(crate) const fn is_alpha(b: u8) -> bool {
    b.is_ascii_alphabetic()
}

pub(crate) const fn is_upper_alpha(b: u8) -> bool {
    b.is_ascii_uppercase()
}

pub(crate) const fn is_digit(b: u8) -> bool {
    b.is_ascii_digit()
}

const fn is_hex(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

const fn hex_value(b: u8) -> u16 {
    match b {
        b'0'..=b'9' => (b - b'0') as u16,
        b'a'..=b'f' => (b - b'a' + 10) as u16,
        _ => (b - b'A' + 10) as u16,
    }
}

/// RFC 3986, appendix A:
///
/// ```text
/// sub-delims = "!" / "$" / "&" / "'" / "(" / ")"
///            / "*" / "+" / "," / ";" / "="
/// ```
const fn is_subdelim(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'='
    )
}

/// RFC 3986, section 2.3:
///
/// ```text
/// unreserved = ALPHA / DIGIT / "-" / "." / "_" / "~"
/// ```
const fn is_unreserved(b: u8) -> bool {
    is_alpha(b) || is_digit(b) || matches!(b, b'-' | b'.' | b'_' | b'~')
}

/// RFC 3986, appendix A:
///
/// ```text
/// pchar = unreserved / pct-encoded / sub-delims / ":" / "@"
/// ```
const fn is_pchar(b: u8) -> bool {
    is_unreserved(b) || is_subdelim(b) || matches!(b, b':' | b'@')
}

/// Whitespace as found around header values.
pub(crate) const fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

/// An IPv4 address as a 32-bit word, most significant octet first.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Ipv4(pub u32);

impl Ipv4 {
    /// Parse a dotted-decimal IPv4 address.
    ///
    /// The whole string must be consumed; `"1.2.3.4x"` is rejected.
    pub fn parse(s: &str) -> Option<Ipv4> {
        let mut sc = Scanner::new(s.as_bytes());
        let word = parse_ipv4_word(&mut sc)?;
        sc.is_end().then_some(Ipv4(word))
    }

    /// Returns the four octets, in the order they were written.
    pub const fn octets(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

/// An IPv6 address as eight 16-bit groups, in the order they were written.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Ipv6(pub [u16; 8]);

impl Ipv6 {
    /// Parse an IPv6 address, with at most one `::` elision.
    ///
    /// The whole string must be consumed. The embedded-IPv4 form
    /// (`::ffff:1.2.3.4`) is not supported.
    pub fn parse(s: &str) -> Option<Ipv6> {
        let mut sc = Scanner::new(s.as_bytes());
        let groups = parse_ipv6_groups(&mut sc)?;
        sc.is_end().then_some(Ipv6(groups))
    }
}

/// Host of an [`Authority`], with its discriminant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Host {
    /// A registered name (`reg-name`, possibly empty).
    Name(Span),
    /// A dotted-decimal IPv4 address.
    Ipv4(Span, Ipv4),
    /// A bracketed IPv6 address. The span covers the groups, without the
    /// brackets.
    Ipv6(Span, Ipv6),
}

impl Host {
    /// The textual form of the host.
    pub const fn text(&self) -> Span {
        match self {
            Host::Name(text) | Host::Ipv4(text, _) | Host::Ipv6(text, _) => *text,
        }
    }
}

impl Default for Host {
    fn default() -> Host {
        Host::Name(Span::EMPTY)
    }
}

/// Authority component of a [`Url`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Authority {
    /// The `userinfo` part, empty when absent.
    pub userinfo: Span,
    /// The host.
    pub host: Host,
    /// The port, if one was given.
    pub port: Option<u16>,
}

/// A parsed URI reference.
///
/// All spans index the bytes the URL was parsed from; absent components are
/// empty spans.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Url {
    /// The entire URL.
    pub full: Span,
    /// The scheme, without the trailing `:`.
    pub scheme: Span,
    /// The authority component; all-empty for URLs without one.
    pub authority: Authority,
    /// The path.
    pub path: Span,
    /// The query, without the leading `?`.
    pub query: Span,
    /// The fragment, without the leading `#`.
    pub fragment: Span,
}

/// RFC 3986, section 3.1:
///
/// ```text
/// scheme = ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )
/// ```
///
/// Returns an empty span, with the cursor restored, when no scheme
/// followed by `:` is present.
fn parse_scheme(sc: &mut Scanner<'_>) -> Span {
    let start = sc.pos();
    let body = |b| is_alpha(b) || is_digit(b) || matches!(b, b'+' | b'-' | b'.');
    if !sc.consume_head_body(is_alpha, body) {
        return Span::EMPTY;
    }
    let end = sc.pos();
    if !sc.consume_byte(b':') {
        // Not a scheme after all.
        sc.rewind(start);
        return Span::EMPTY;
    }
    Span::until(start, end)
}

/// RFC 3986, section 3.2.1:
///
/// ```text
/// userinfo = *( unreserved / pct-encoded / sub-delims / ":" )
/// ```
///
/// Only treated as userinfo when followed by `@`; rewinds otherwise.
fn parse_userinfo(sc: &mut Scanner<'_>) -> Span {
    let start = sc.pos();
    if !sc.consume_while(|b| is_unreserved(b) || is_subdelim(b) || b == b':') {
        return Span::EMPTY;
    }
    let end = sc.pos();
    if !sc.consume_byte(b'@') {
        sc.rewind(start);
        return Span::EMPTY;
    }
    Span::until(start, end)
}

/// Parse a base-16 number of at most 16 bits.
///
/// Accumulation stops before a digit that would overflow, leaving that
/// digit unconsumed.
fn parse_u16_base16(sc: &mut Scanner<'_>) -> Option<u16> {
    if sc.is_end() || !is_hex(sc.curr()) {
        return None;
    }
    let mut value: u16 = 0;
    while !sc.is_end() && is_hex(sc.curr()) {
        let digit = hex_value(sc.curr());
        if value > (u16::MAX - digit) / 16 {
            break;
        }
        value = value * 16 + digit;
        sc.advance();
    }
    Some(value)
}

/// Parse a base-10 number of at most 8 bits, with the same
/// stop-before-overflow rule as [`parse_u16_base16`].
fn parse_u8_base10(sc: &mut Scanner<'_>) -> Option<u8> {
    if sc.is_end() || !is_digit(sc.curr()) {
        return None;
    }
    let mut value: u8 = 0;
    while !sc.is_end() && is_digit(sc.curr()) {
        let digit = sc.curr() - b'0';
        if value > (u8::MAX - digit) / 10 {
            break;
        }
        value = value * 10 + digit;
        sc.advance();
    }
    Some(value)
}

/// Parse a base-10 number of at most 16 bits.
fn parse_u16_base10(sc: &mut Scanner<'_>) -> Option<u16> {
    if sc.is_end() || !is_digit(sc.curr()) {
        return None;
    }
    let mut value: u16 = 0;
    while !sc.is_end() && is_digit(sc.curr()) {
        let digit = (sc.curr() - b'0') as u16;
        if value > (u16::MAX - digit) / 10 {
            break;
        }
        value = value * 10 + digit;
        sc.advance();
    }
    Some(value)
}

/// Parse four dotted-decimal octets into a 32-bit word.
fn parse_ipv4_word(sc: &mut Scanner<'_>) -> Option<u32> {
    let mut word: u32 = 0;
    for i in 0..4 {
        if i > 0 && !sc.consume_byte(b'.') {
            return None;
        }
        let octet = parse_u8_base10(sc)?;
        word = (word << 8) | octet as u32;
    }
    Some(word)
}

/// Parse up to eight base-16 groups separated by `:`, with a single
/// optional `::` standing in for as many zero groups as needed to reach
/// eight.
fn parse_ipv6_groups(sc: &mut Scanner<'_>) -> Option<[u16; 8]> {
    let mut groups = [0u16; 8];
    let mut count = 0;
    let mut elided = false;

    while count < 8 {
        if sc.consume_bytes(b"::") {
            elided = true;
            break;
        }
        if count > 0 && !sc.consume_byte(b':') {
            return None;
        }
        groups[count] = parse_u16_base16(sc)?;
        count += 1;
    }

    if elided {
        // Collect the groups after the elision, then zero-fill the gap.
        let mut tail = [0u16; 8];
        let mut tail_count = 0;
        while count + tail_count < 7 {
            let start = sc.pos();
            if tail_count > 0 && !sc.consume_byte(b':') {
                break;
            }
            match parse_u16_base16(sc) {
                Some(group) => {
                    tail[tail_count] = group;
                    tail_count += 1;
                }
                None => {
                    sc.rewind(start);
                    break;
                }
            }
        }

        let implicit = 8 - (count + tail_count);
        for _ in 0..implicit {
            groups[count] = 0;
            count += 1;
        }
        for group in tail.iter().take(tail_count) {
            groups[count] = *group;
            count += 1;
        }
    }

    debug_assert!(count == 8);
    Some(groups)
}

/// Parse a host: a bracketed IPv6 address, a dotted-decimal IPv4 address,
/// or a registered name (RFC 3986 `reg-name`, possibly empty). A leading
/// digit first tries IPv4 and falls back to a registered name.
fn parse_host(sc: &mut Scanner<'_>) -> Option<Host> {
    if sc.is_end() {
        return None;
    }

    if sc.consume_byte(b'[') {
        let start = sc.pos();
        let groups = parse_ipv6_groups(sc)?;
        let text = Span::until(start, sc.pos());
        if !sc.consume_byte(b']') {
            return None;
        }
        return Some(Host::Ipv6(text, Ipv6(groups)));
    }

    if is_digit(sc.curr()) {
        let start = sc.pos();
        if let Some(word) = parse_ipv4_word(sc) {
            return Some(Host::Ipv4(Span::until(start, sc.pos()), Ipv4(word)));
        }
        sc.rewind(start);
    }

    let start = sc.pos();
    let _ = sc.consume_while(|b| is_unreserved(b) || is_subdelim(b));
    Some(Host::Name(Span::until(start, sc.pos())))
}

/// Parse an authority: `[ userinfo "@" ] host [ ":" port ]`.
fn parse_authority(sc: &mut Scanner<'_>) -> Option<Authority> {
    let userinfo = parse_userinfo(sc);
    let host = parse_host(sc)?;
    let port = if sc.consume_byte(b':') {
        if sc.is_end() || !is_digit(sc.curr()) {
            // A lone `:` means no port.
            None
        } else {
            Some(parse_u16_base10(sc)?)
        }
    } else {
        None
    };
    Some(Authority {
        userinfo,
        host,
        port,
    })
}

/// RFC 3986, sections 3.4 and 3.5:
///
/// ```text
/// query    = *( pchar / "/" / "?" )
/// fragment = *( pchar / "/" / "?" )
/// ```
fn parse_query_or_fragment(sc: &mut Scanner<'_>) -> Span {
    let start = sc.pos();
    let _ = sc.consume_while(|b| is_pchar(b) || matches!(b, b'/' | b'?'));
    Span::until(start, sc.pos())
}

/// RFC 3986, section 3.3:
///
/// ```text
/// path-abempty = *( "/" segment )
/// ```
fn parse_path_abempty(sc: &mut Scanner<'_>) -> Span {
    let start = sc.pos();
    while sc.consume_byte(b'/') {
        let _ = sc.consume_while(is_pchar);
    }
    Span::until(start, sc.pos())
}

/// A single run of path characters, for URLs without an authority.
fn parse_path(sc: &mut Scanner<'_>) -> Span {
    let start = sc.pos();
    let _ = sc.consume_while(|b| is_pchar(b) || b == b'/');
    Span::until(start, sc.pos())
}

/// Parse a URI reference, per RFC 3986.
///
/// The spans of the returned [`Url`] index the scanned bytes.
pub(crate) fn parse_url(sc: &mut Scanner<'_>) -> Option<Url> {
    let start = sc.pos();
    let scheme = parse_scheme(sc);
    let mut url = Url {
        scheme,
        ..Url::default()
    };

    // RFC 3986, section 3.2: the authority component is preceded by a
    // double slash and terminated by the next slash, question mark, number
    // sign, or the end of the URI.
    if sc.consume_bytes(b"//") {
        url.authority = parse_authority(sc)?;
        url.path = parse_path_abempty(sc);
    } else {
        url.path = parse_path(sc);
    }

    if sc.consume_byte(b'?') {
        url.query = parse_query_or_fragment(sc);
    }
    if sc.consume_byte(b'#') {
        url.fragment = parse_query_or_fragment(sc);
    }

    url.full = Span::until(start, sc.pos());
    Some(url)
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::{parse_url, Host, Ipv4, Ipv6, Scanner, Url};

    fn url(input: &str) -> Url {
        let mut sc = Scanner::new(input.as_bytes());
        let url = parse_url(&mut sc).unwrap();
        assert!(sc.is_end(), "trailing input in {input:?}");
        url
    }

    fn text<'a>(input: &'a str, span: crate::Span) -> &'a str {
        std::str::from_utf8(span.of(input.as_bytes())).unwrap()
    }

    #[test]
    fn origin_form() {
        let input = "/where?q=now#frag";
        let parsed = url(input);
        assert!(parsed.scheme.is_empty());
        assert_eq!(text(input, parsed.path), "/where");
        assert_eq!(text(input, parsed.query), "q=now");
        assert_eq!(text(input, parsed.fragment), "frag");
        assert_eq!(text(input, parsed.full), input);
    }

    #[test]
    fn absolute_form() {
        let input = "http://user:pw@example.com:8080/a/b?x=1";
        let parsed = url(input);
        assert_eq!(text(input, parsed.scheme), "http");
        assert_eq!(text(input, parsed.authority.userinfo), "user:pw");
        assert_eq!(text(input, parsed.authority.host.text()), "example.com");
        assert!(matches!(parsed.authority.host, Host::Name(_)));
        assert_eq!(parsed.authority.port, Some(8080));
        assert_eq!(text(input, parsed.path), "/a/b");
        assert_eq!(text(input, parsed.query), "x=1");
    }

    #[test]
    fn scheme_requires_a_colon() {
        // Without the colon this is a path, not a scheme.
        let parsed = url("hello");
        assert!(parsed.scheme.is_empty());
        assert_eq!(text("hello", parsed.path), "hello");

        let input = "HTTP://x";
        let parsed = url(input);
        assert_eq!(text(input, parsed.scheme), "HTTP");
    }

    #[test]
    fn empty_path_after_authority() {
        let input = "http://example.com";
        let parsed = url(input);
        assert_eq!(text(input, parsed.authority.host.text()), "example.com");
        assert!(parsed.path.is_empty());
    }

    #[test]
    fn ipv4_host() {
        let input = "//127.0.0.1:80/x";
        let parsed = url(input);
        match parsed.authority.host {
            Host::Ipv4(span, addr) => {
                assert_eq!(text(input, span), "127.0.0.1");
                assert_eq!(addr.octets(), [127, 0, 0, 1]);
            }
            host => panic!("unexpected host: {host:?}"),
        }
        assert_eq!(parsed.authority.port, Some(80));
        assert_eq!(text(input, parsed.path), "/x");
    }

    #[test]
    fn leading_digit_falls_back_to_name() {
        let input = "//1example/";
        let parsed = url(input);
        match parsed.authority.host {
            Host::Name(span) => assert_eq!(text(input, span), "1example"),
            host => panic!("unexpected host: {host:?}"),
        }
    }

    #[test]
    fn ipv6_host() {
        let input = "//[2001:db8::1:2]:443/";
        let parsed = url(input);
        match parsed.authority.host {
            Host::Ipv6(span, addr) => {
                assert_eq!(text(input, span), "2001:db8::1:2");
                assert_eq!(addr.0, [0x2001, 0x0db8, 0, 0, 0, 0, 1, 2]);
            }
            host => panic!("unexpected host: {host:?}"),
        }
        assert_eq!(parsed.authority.port, Some(443));
    }

    #[test]
    fn port_without_digits_is_absent() {
        let parsed = url("//example.com:");
        assert_eq!(parsed.authority.port, None);
    }

    #[test]
    fn ipv4_literals() {
        let tests = &[
            ("0.0.0.0", Some([0, 0, 0, 0])),
            ("127.0.0.1", Some([127, 0, 0, 1])),
            ("255.255.255.255", Some([255, 255, 255, 255])),
            ("1.2.3.4", Some([1, 2, 3, 4])),
            ("256.1.1.1", None),
            ("1.2.3", None),
            ("1.2.3.4.5", None),
            ("1..2.3", None),
            ("a.b.c.d", None),
            ("", None),
        ];
        for (input, expected) in tests {
            let got = Ipv4::parse(input).map(Ipv4::octets);
            assert_eq!(got, *expected, "input: {input:?}");
            // The platform parser must agree.
            let std_parsed = input.parse::<Ipv4Addr>().ok().map(|ip| ip.octets());
            assert_eq!(got, std_parsed, "input: {input:?}");
        }
    }

    #[test]
    fn ipv6_literals() {
        let tests = &[
            ("::", Some([0, 0, 0, 0, 0, 0, 0, 0])),
            ("::1", Some([0, 0, 0, 0, 0, 0, 0, 1])),
            ("1:2:3:4:5:6:7:8", Some([1, 2, 3, 4, 5, 6, 7, 8])),
            ("2001:db8::1:2", Some([0x2001, 0x0db8, 0, 0, 0, 0, 1, 2])),
            ("fe80::1", Some([0xfe80, 0, 0, 0, 0, 0, 0, 1])),
            ("1::", Some([1, 0, 0, 0, 0, 0, 0, 0])),
            ("1:2:3", None),
            ("::1::2", None),
            ("1:2:3:4:5:6:7:8:9", None),
            (":::", None),
            (":1", None),
            ("abcg::", None),
            ("", None),
        ];
        for (input, expected) in tests {
            let got = Ipv6::parse(input).map(|ip| ip.0);
            assert_eq!(got, *expected, "input: {input:?}");
            let std_parsed = input.parse::<Ipv6Addr>().ok().map(|ip| ip.segments());
            assert_eq!(got, std_parsed, "input: {input:?}");
        }
    }

    #[test]
    fn userinfo_requires_at_sign() {
        // `example.com` must not be mistaken for userinfo.
        let input = "//example.com/x";
        let parsed = url(input);
        assert!(parsed.authority.userinfo.is_empty());
        assert_eq!(text(input, parsed.authority.host.text()), "example.com");
    }
}

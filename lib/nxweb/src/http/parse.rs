//! HTTP/1.x wire parsing: header block location, request and response
//! head parsing, lazy parameter/cookie parsing.

use super::{Request, Response};
use crate::arena::Span;
use crate::http::date::parse_http_time;
use crate::http::uri::{trunc_space, url_decode};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParseError {
    Bad,
    TrailerNotImplemented,
}

/// Locate the end-of-headers terminator (`\r\n\r\n` or `\n\n`).
/// Returns (end of headers, start of body).
pub fn find_end_of_http_headers(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.len() < 4 {
        return None;
    }
    for p in 3..buf.len() {
        if buf[p] != b'\n' {
            continue;
        }
        if buf[p - 1] == b'\n' {
            return Some((p - 1, p + 1));
        }
        if buf[p - 3] == b'\r' && buf[p - 2] == b'\n' && buf[p - 1] == b'\r' {
            return Some((p - 3, p + 1));
        }
    }
    None
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeaderId {
    Unknown,
    Date,
    Host,
    ETag,
    Range,
    Cookie,
    Expect,
    Server,
    Expires,
    Trailer,
    Connection,
    KeepAlive,
    UserAgent,
    ContentType,
    LastModified,
    CacheControl,
    AcceptRanges,
    ContentLength,
    AcceptEncoding,
    IfModifiedSince,
    TransferEncoding,
    XNxwebSsi,
    XNxwebTemplates,
}

/// Identify well-known headers. Dispatches on length first the way
/// the hot path always has.
pub fn identify_header(name: &str) -> HeaderId {
    match name.len() {
        4 => {
            if name.eq_ignore_ascii_case("Host") {
                HeaderId::Host
            } else if name.eq_ignore_ascii_case("Date") {
                HeaderId::Date
            } else if name.eq_ignore_ascii_case("ETag") {
                HeaderId::ETag
            } else {
                HeaderId::Unknown
            }
        }
        5 => {
            if name.eq_ignore_ascii_case("Range") {
                HeaderId::Range
            } else {
                HeaderId::Unknown
            }
        }
        6 => {
            if name.eq_ignore_ascii_case("Cookie") {
                HeaderId::Cookie
            } else if name.eq_ignore_ascii_case("Expect") {
                HeaderId::Expect
            } else if name.eq_ignore_ascii_case("Server") {
                HeaderId::Server
            } else {
                HeaderId::Unknown
            }
        }
        7 => {
            if name.eq_ignore_ascii_case("Trailer") {
                HeaderId::Trailer
            } else if name.eq_ignore_ascii_case("Expires") {
                HeaderId::Expires
            } else {
                HeaderId::Unknown
            }
        }
        10 => {
            if name.eq_ignore_ascii_case("Connection") {
                HeaderId::Connection
            } else if name.eq_ignore_ascii_case("Keep-Alive") {
                HeaderId::KeepAlive
            } else if name.eq_ignore_ascii_case("User-Agent") {
                HeaderId::UserAgent
            } else {
                HeaderId::Unknown
            }
        }
        11 => {
            if name.eq_ignore_ascii_case("X-NXWEB-SSI") {
                HeaderId::XNxwebSsi
            } else {
                HeaderId::Unknown
            }
        }
        12 => {
            if name.eq_ignore_ascii_case("Content-Type") {
                HeaderId::ContentType
            } else {
                HeaderId::Unknown
            }
        }
        13 => {
            if name.eq_ignore_ascii_case("Cache-Control") {
                HeaderId::CacheControl
            } else if name.eq_ignore_ascii_case("Last-Modified") {
                HeaderId::LastModified
            } else if name.eq_ignore_ascii_case("Accept-Ranges") {
                HeaderId::AcceptRanges
            } else {
                HeaderId::Unknown
            }
        }
        14 => {
            if name.eq_ignore_ascii_case("Content-Length") {
                HeaderId::ContentLength
            } else {
                HeaderId::Unknown
            }
        }
        15 => {
            if name.eq_ignore_ascii_case("Accept-Encoding") {
                HeaderId::AcceptEncoding
            } else {
                HeaderId::Unknown
            }
        }
        17 => {
            if name.eq_ignore_ascii_case("Transfer-Encoding") {
                HeaderId::TransferEncoding
            } else if name.eq_ignore_ascii_case("If-Modified-Since") {
                HeaderId::IfModifiedSince
            } else if name.eq_ignore_ascii_case("X-NXWEB-Templates") {
                HeaderId::XNxwebTemplates
            } else {
                HeaderId::Unknown
            }
        }
        _ => HeaderId::Unknown,
    }
}

/// Lines of a header block, with offsets. Trailing `\r` excluded.
struct Lines<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Lines<'a> {
    type Item = (usize, usize); // start, end (exclusive, no newline)

    fn next(&mut self) -> Option<(usize, usize)> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let start = self.pos;
        let mut end = self.buf.len();
        for i in start..self.buf.len() {
            if self.buf[i] == b'\n' {
                end = i;
                self.pos = i + 1;
                break;
            }
        }
        if end == self.buf.len() {
            self.pos = end;
        }
        if end > start && self.buf[end - 1] == b'\r' {
            end -= 1;
        }
        Some((start, end))
    }
}

#[inline]
fn token_end(buf: &[u8], mut pos: usize, end: usize) -> usize {
    while pos < end && buf[pos] > b' ' {
        pos += 1;
    }
    pos
}

#[inline]
fn skip_space(buf: &[u8], mut pos: usize, end: usize) -> usize {
    while pos < end && buf[pos] <= b' ' {
        pos += 1;
    }
    pos
}

/// Scan Accept-Encoding for a standalone `gzip` token.
fn accepts_gzip(value: &str) -> bool {
    let bytes = value.as_bytes();
    let mut i = 0;
    while let Some(off) = value[i..].find('g') {
        let g = i + off;
        if value[g..].starts_with("gzip")
            && (g == 0 || bytes[g - 1] == b',' || bytes[g - 1] == b' ')
            && (g + 4 == bytes.len() || bytes[g + 4] == b',' || bytes[g + 4] == b' ')
        {
            return true;
        }
        i = g + 1;
    }
    false
}

/// Parse a request head (request line + headers). `block` is the raw
/// header block without the terminator.
pub fn parse_http_request(req: &mut Request, block: &[u8]) -> Result<(), ParseError> {
    if std::str::from_utf8(block).is_err() {
        return Err(ParseError::Bad);
    }
    let base = req.arena.len();
    req.arena.alloc(block);
    let abs = |start: usize, end: usize| Span::new(base + start, base + end);

    req.content_length = 0;

    let mut lines = Lines { buf: block, pos: 0 };
    let (lstart, lend) = lines.next().ok_or(ParseError::Bad)?;

    // request line: METHOD SP URI SP VERSION
    let m_end = token_end(block, lstart, lend);
    let method = abs(lstart, m_end);
    let u_start = skip_space(block, m_end, lend);
    if u_start >= lend {
        return Err(ParseError::Bad);
    }
    let u_end = token_end(block, u_start, lend);
    let mut uri = (u_start, u_end);
    let v_start = skip_space(block, u_end, lend);
    if v_start >= lend {
        return Err(ParseError::Bad);
    }
    let v_end = token_end(block, v_start, lend);
    req.http_version = abs(v_start, v_end);
    req.method = method;

    let version = &block[v_start..v_end];
    req.http11 = !version.eq_ignore_ascii_case(b"HTTP/1.0");
    req.keep_alive = req.http11;

    // absolute-form request URI: split off and lowercase the host
    let mut host: Option<(usize, usize)> = None;
    if block[uri.0..uri.1].starts_with(b"http://") {
        let path_off = block[uri.0 + 7..uri.1]
            .iter()
            .position(|&c| c == b'/')
            .ok_or(ParseError::Bad)?;
        host = Some((uri.0 + 7, uri.0 + 7 + path_off));
        uri = (uri.0 + 7 + path_off, uri.1);
    }
    if block.get(uri.0) != Some(&b'/') {
        return Err(ParseError::Bad);
    }
    req.set_uri_span(abs(uri.0, uri.1));

    // headers
    let mut expect: Option<Span> = None;
    let mut last_residual = false;
    let mut promoted_slots: Vec<(HeaderId, Span)> = Vec::new();

    for (hstart, hend) in lines {
        if hstart == hend {
            continue;
        }
        if block[hstart] <= b' ' {
            // leading whitespace: header continuation, concatenate
            // with the previous value
            let cont = abs(hstart, hend);
            if last_residual {
                if let Some((_, value)) = req.headers.last().copied() {
                    let folded = req.arena.concat(value, cont);
                    if let Some(entry) = req.headers.last_mut() {
                        entry.1 = folded;
                    }
                }
            } else if let Some((_, value)) = promoted_slots.last().copied() {
                let folded = req.arena.concat(value, cont);
                if let Some(entry) = promoted_slots.last_mut() {
                    entry.1 = folded;
                }
            }
            continue;
        }
        let colon = match block[hstart..hend].iter().position(|&c| c == b':') {
            Some(pos) => hstart + pos,
            None => continue,
        };
        let name = abs(hstart, colon);
        let raw_value = trunc_space(&block[colon + 1..hend]);
        let voff = colon + 1 + (raw_value.as_ptr() as usize - block[colon + 1..hend].as_ptr() as usize);
        let value = abs(voff, voff + raw_value.len());

        let name_str = std::str::from_utf8(&block[hstart..colon]).map_err(|_| ParseError::Bad)?;
        let id = identify_header(name_str);
        match id {
            HeaderId::Trailer => return Err(ParseError::TrailerNotImplemented),
            HeaderId::Unknown => {
                req.headers.push((name, value));
                last_residual = true;
            }
            _ => {
                promoted_slots.push((id, value));
                last_residual = false;
            }
        }
    }

    // apply promoted headers after folding settled
    for (id, value_span) in promoted_slots {
        match id {
            HeaderId::Host => {
                req.arena.bytes_mut(value_span).make_ascii_lowercase();
                req.host = value_span;
            }
            HeaderId::Expect => expect = Some(value_span),
            HeaderId::Cookie => req.cookie_hdr = Some(value_span),
            HeaderId::UserAgent => req.user_agent = Some(value_span),
            HeaderId::ContentType => req.content_type = Some(value_span),
            HeaderId::ContentLength => {
                req.content_length = req
                    .arena
                    .str_at(value_span)
                    .trim()
                    .parse::<i64>()
                    .unwrap_or(0);
            }
            HeaderId::AcceptEncoding => req.accept_encoding = Some(value_span),
            HeaderId::TransferEncoding => req.transfer_encoding = Some(value_span),
            HeaderId::IfModifiedSince => {
                req.if_modified_since = parse_http_time(req.arena.str_at(value_span));
            }
            HeaderId::Connection => {
                req.keep_alive = req
                    .arena
                    .str_at(value_span)
                    .eq_ignore_ascii_case("keep-alive");
            }
            HeaderId::Range => req.range = Some(value_span),
            HeaderId::XNxwebSsi => {
                req.x_nxweb_ssi = req.arena.str_at(value_span).eq_ignore_ascii_case("ON");
            }
            HeaderId::XNxwebTemplates => {
                req.x_nxweb_templates = req.arena.str_at(value_span).eq_ignore_ascii_case("ON");
            }
            _ => {}
        }
    }

    if let Some((hstart, hend)) = host {
        let span = abs(hstart, hend);
        req.arena.bytes_mut(span).make_ascii_lowercase();
        req.host = span;
    }

    if req.host.len() == 0 {
        return Err(ParseError::Bad); // host is required
    }

    req.path_info_off = 0;
    req.accept_gzip_encoding = req
        .accept_encoding
        .map(|s| accepts_gzip(req.arena.str_at(s)))
        .unwrap_or(false);
    req.chunked_encoding = req
        .transfer_encoding
        .map(|s| req.arena.str_at(s).eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);
    if req.chunked_encoding {
        req.content_length = -1;
    }
    req.expect_100_continue = req.content_length != 0
        && expect
            .map(|s| req.arena.str_at(s).eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false);
    req.head_method = req.method().eq_ignore_ascii_case("HEAD");
    if req.head_method {
        req.method = req.arena.alloc_str("GET");
    }
    req.get_method = req.head_method || req.method().eq_ignore_ascii_case("GET");
    req.post_method = !req.head_method && req.method().eq_ignore_ascii_case("POST");
    req.other_method = !req.get_method && !req.post_method;

    Ok(())
}

/// Parse Cache-Control directives into the response's dedicated
/// fields; anything unrecognised keeps the raw string too.
fn parse_cache_control(resp: &mut Response, value: &str) -> bool {
    let mut dirty = false;
    for directive in value.split(',') {
        let directive = directive.trim();
        let (name, dvalue) = match directive.find('=') {
            Some(eq) => (&directive[..eq], Some(directive[eq + 1..].trim())),
            None => (directive, None),
        };
        if name.eq_ignore_ascii_case("no-cache") {
            resp.no_cache = true;
        } else if name.eq_ignore_ascii_case("private") {
            resp.cache_private = true;
        } else if name.eq_ignore_ascii_case("max-age") {
            if let Some(v) = dvalue {
                if v == "0" {
                    resp.max_age = -1;
                } else {
                    resp.max_age = v.parse().unwrap_or(0);
                }
            }
        } else if !name.is_empty() {
            dirty = true;
        }
    }
    dirty
}

/// Parse a response head received from a backend.
pub fn parse_http_response(resp: &mut Response, block: &[u8]) -> Result<(), ParseError> {
    let text = std::str::from_utf8(block).map_err(|_| ParseError::Bad)?;
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let status_line = lines.next().ok_or(ParseError::Bad)?;
    let mut parts = status_line.splitn(3, char::is_whitespace);
    let version = parts.next().ok_or(ParseError::Bad)?;
    let code = parts.next().ok_or(ParseError::Bad)?;
    let message = parts.next().unwrap_or("").trim();

    resp.http11 = !version.eq_ignore_ascii_case("HTTP/1.0");
    resp.keep_alive = resp.http11;
    resp.content_length = -1; // unspecified
    resp.status_code = code.parse().unwrap_or(0);
    resp.status = Some(message.to_owned());

    let mut transfer_encoding: Option<String> = None;
    let mut last_unknown = false;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.as_bytes()[0] <= b' ' {
            // header continuation
            if last_unknown {
                if let Some(last) = resp.extra_headers.last_mut() {
                    last.1.push_str(line);
                }
            }
            continue;
        }
        let colon = match line.find(':') {
            Some(pos) => pos,
            None => continue,
        };
        let name = &line[..colon];
        let value = line[colon + 1..].trim();
        last_unknown = false;
        match identify_header(name) {
            HeaderId::ContentType => resp.content_type = Some(value.to_owned()),
            HeaderId::ContentLength => resp.content_length = value.parse().unwrap_or(0),
            HeaderId::TransferEncoding => transfer_encoding = Some(value.to_owned()),
            HeaderId::Connection => resp.keep_alive = value.eq_ignore_ascii_case("keep-alive"),
            HeaderId::KeepAlive => {}
            HeaderId::XNxwebSsi => resp.ssi_on = value.eq_ignore_ascii_case("ON"),
            HeaderId::XNxwebTemplates => resp.templates_on = value.eq_ignore_ascii_case("ON"),
            HeaderId::Date => resp.date = parse_http_time(value),
            HeaderId::LastModified => resp.last_modified = parse_http_time(value),
            HeaderId::Expires => resp.expires = parse_http_time(value),
            HeaderId::CacheControl => {
                if !value.is_empty() {
                    parse_cache_control(resp, value);
                    resp.cache_control = Some(value.to_owned());
                }
            }
            HeaderId::ETag => resp.etag = Some(value.to_owned()),
            _ => {
                resp.extra_headers.push((name.to_owned(), value.to_owned()));
                last_unknown = true;
            }
        }
    }

    if transfer_encoding
        .map(|te| te.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
    {
        resp.chunked_encoding = true;
        resp.content_length = -1;
    } else if resp.keep_alive && resp.content_length == -1 {
        resp.content_length = 0; // until-close not allowed in keep-alive mode
    }

    Ok(())
}

fn parse_pairs(
    req: &mut Request,
    source: Vec<u8>,
    pair_sep: u8,
    out: &mut Vec<(Span, Span)>,
) {
    for piece in source.split(|&c| c == pair_sep) {
        let (name, value) = match piece.iter().position(|&c| c == b'=') {
            Some(eq) => (&piece[..eq], &piece[eq + 1..]),
            None => (piece, &piece[piece.len()..]),
        };
        let name = trunc_space(name);
        if name.is_empty() {
            continue;
        }
        let decoded_name = url_decode(&String::from_utf8_lossy(name));
        let decoded_value = url_decode(&String::from_utf8_lossy(value));
        let name_str = String::from_utf8_lossy(&decoded_name).into_owned();
        let value_str = String::from_utf8_lossy(&decoded_value).into_owned();
        let name_span = req.arena.alloc_str(name_str.trim());
        let value_span = req.arena.alloc_str(&value_str);
        out.push((name_span, value_span));
    }
}

/// Lazily parse query-string and url-encoded body parameters.
pub fn parse_request_parameters(req: &mut Request) {
    if req.parameters.is_some() {
        return; // already parsed
    }
    let mut params = Vec::new();

    let query = req.uri().find('?').map(|q| req.uri()[q + 1..].to_owned());
    if let Some(query) = query {
        parse_pairs(req, query.into_bytes(), b'&', &mut params);
    }

    let form_body = !req.content.is_empty()
        && req
            .content_type()
            .map(|ct| ct.eq_ignore_ascii_case("application/x-www-form-urlencoded"))
            .unwrap_or(false);
    if form_body {
        let body = req.content.clone();
        parse_pairs(req, body, b'&', &mut params);
    }

    req.parameters = Some(params);
}

/// Lazily parse the Cookie header.
pub fn parse_request_cookies(req: &mut Request) {
    if req.cookies.is_some() {
        return; // already parsed
    }
    let mut cookies = Vec::new();
    let header = req.cookie_header().map(|c| c.to_owned());
    if let Some(header) = header {
        parse_pairs(req, header.into_bytes(), b';', &mut cookies);
    }
    req.cookies = Some(cookies);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(head: &str) -> Result<Request, ParseError> {
        let mut req = Request::new();
        parse_http_request(&mut req, head.as_bytes()).map(|_| req)
    }

    #[test]
    fn test_find_end_of_headers() {
        assert_eq!(
            find_end_of_http_headers(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nBODY"),
            Some((23, 27))
        );
        assert_eq!(find_end_of_http_headers(b"GET / HTTP/1.0\nHost: x\n\nB"), Some((22, 24)));
        assert_eq!(find_end_of_http_headers(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
    }

    #[test]
    fn test_parse_simple_request() {
        let req = parse("GET /index.html HTTP/1.1\r\nHost: Example.Com\r\n").unwrap();
        assert_eq!(req.method(), "GET");
        assert_eq!(req.uri(), "/index.html");
        assert_eq!(req.http_version(), "HTTP/1.1");
        assert_eq!(req.host(), "example.com");
        assert!(req.http11);
        assert!(req.keep_alive);
        assert!(req.get_method);
        assert!(!req.post_method);
        assert_eq!(req.content_length, 0);
    }

    #[test]
    fn test_http10_defaults_to_close() {
        let req = parse("GET / HTTP/1.0\r\nHost: x\r\n").unwrap();
        assert!(!req.http11);
        assert!(!req.keep_alive);
    }

    #[test]
    fn test_connection_header_overrides() {
        let req = parse("GET / HTTP/1.0\r\nHost: x\r\nConnection: Keep-Alive\r\n").unwrap();
        assert!(req.keep_alive);
        let req = parse("GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n").unwrap();
        assert!(!req.keep_alive);
    }

    #[test]
    fn test_absolute_uri_splits_host() {
        let req = parse("GET http://Other.Host:8080/path?q HTTP/1.1\r\nHost: ignored\r\n").unwrap();
        assert_eq!(req.uri(), "/path?q");
        assert_eq!(req.host(), "other.host:8080");
    }

    #[test]
    fn test_missing_host_rejected() {
        assert_eq!(parse("GET / HTTP/1.1\r\n").unwrap_err(), ParseError::Bad);
        assert_eq!(
            parse("GET / HTTP/1.1\r\nHost:\r\n").unwrap_err(),
            ParseError::Bad
        );
    }

    #[test]
    fn test_uri_must_be_rooted() {
        assert_eq!(parse("GET foo HTTP/1.1\r\nHost: x\r\n").unwrap_err(), ParseError::Bad);
    }

    #[test]
    fn test_trailer_not_implemented() {
        assert_eq!(
            parse("GET / HTTP/1.1\r\nHost: x\r\nTrailer: Expires\r\n").unwrap_err(),
            ParseError::TrailerNotImplemented
        );
    }

    #[test]
    fn test_head_rewritten_to_get() {
        let req = parse("HEAD /a HTTP/1.1\r\nHost: x\r\n").unwrap();
        assert!(req.head_method);
        assert!(req.get_method);
        assert_eq!(req.method(), "GET");
    }

    #[test]
    fn test_promoted_headers() {
        let req = parse(
            "POST /u HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nUser-Agent: curl\r\nCookie: a=1\r\nRange: bytes=0-4\r\nX-Custom: v\r\n",
        )
        .unwrap();
        assert_eq!(req.content_type(), Some("text/plain"));
        assert_eq!(req.content_length, 5);
        assert_eq!(req.user_agent(), Some("curl"));
        assert_eq!(req.cookie_header(), Some("a=1"));
        assert_eq!(req.range(), Some("bytes=0-4"));
        assert_eq!(req.header("x-custom"), Some("v"));
        assert_eq!(req.header("X-CUSTOM"), Some("v"));
        assert_eq!(req.header("absent"), None);
        assert!(req.post_method);
    }

    #[test]
    fn test_header_folding() {
        let req = parse("GET / HTTP/1.1\r\nHost: x\r\nX-Long: part1\r\n part2\r\n").unwrap();
        assert_eq!(req.header("x-long"), Some("part1 part2"));
    }

    #[test]
    fn test_chunked_transfer_encoding() {
        let req = parse("POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n").unwrap();
        assert!(req.chunked_encoding);
        assert_eq!(req.content_length, -1);
    }

    #[test]
    fn test_expect_100_continue() {
        let req = parse(
            "POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nExpect: 100-continue\r\n",
        )
        .unwrap();
        assert!(req.expect_100_continue);
        let req = parse("GET / HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\n").unwrap();
        assert!(!req.expect_100_continue); // no body expected
    }

    #[test]
    fn test_accept_gzip_token_scan() {
        let yes = [
            "gzip",
            "gzip, deflate",
            "deflate, gzip",
            "identity gzip",
        ];
        for v in &yes {
            let head = format!("GET / HTTP/1.1\r\nHost: x\r\nAccept-Encoding: {}\r\n", v);
            assert!(parse(&head).unwrap().accept_gzip_encoding, "{}", v);
        }
        let no = ["gzipx", "xgzip", "gzi"];
        for v in &no {
            let head = format!("GET / HTTP/1.1\r\nHost: x\r\nAccept-Encoding: {}\r\n", v);
            assert!(!parse(&head).unwrap().accept_gzip_encoding, "{}", v);
        }
    }

    #[test]
    fn test_if_modified_since() {
        let req = parse(
            "GET / HTTP/1.1\r\nHost: x\r\nIf-Modified-Since: Tue, 24 Jan 2012 13:05:54 GMT\r\n",
        )
        .unwrap();
        assert_eq!(req.if_modified_since, Some(1_327_410_354));
    }

    #[test]
    fn test_parse_parameters() {
        let mut req = parse("GET /q?a=1&b=two%20words&c HTTP/1.1\r\nHost: x\r\n").unwrap();
        parse_request_parameters(&mut req);
        assert_eq!(req.parameter("a"), Some("1"));
        assert_eq!(req.parameter("b"), Some("two words"));
        assert_eq!(req.parameter("c"), Some(""));
        assert_eq!(req.parameter("d"), None);
    }

    #[test]
    fn test_parse_form_body_parameters() {
        let mut req = parse(
            "POST /f HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 7\r\n",
        )
        .unwrap();
        req.content = b"k=v+v&z".to_vec();
        parse_request_parameters(&mut req);
        assert_eq!(req.parameter("k"), Some("v v"));
        assert_eq!(req.parameter("z"), Some(""));
    }

    #[test]
    fn test_parse_cookies() {
        let mut req = parse("GET / HTTP/1.1\r\nHost: x\r\nCookie: sid=abc; theme=dark\r\n").unwrap();
        parse_request_cookies(&mut req);
        assert_eq!(req.cookie("sid"), Some("abc"));
        assert_eq!(req.cookie("theme"), Some("dark"));
        assert_eq!(req.cookie("absent"), None);
    }

    #[test]
    fn test_parse_response_head() {
        let mut resp = Response::new();
        parse_http_response(
            &mut resp,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 10\r\nETag: \"x\"\r\nDate: Tue, 24 Jan 2012 13:05:54 GMT\r\n",
        )
        .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.status.as_deref(), Some("OK"));
        assert_eq!(resp.content_type.as_deref(), Some("text/html"));
        assert_eq!(resp.content_length, 10);
        assert_eq!(resp.etag.as_deref(), Some("\"x\""));
        assert_eq!(resp.date, Some(1_327_410_354));
        assert!(resp.keep_alive);
    }

    #[test]
    fn test_parse_response_chunked() {
        let mut resp = Response::new();
        parse_http_response(
            &mut resp,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n",
        )
        .unwrap();
        assert!(resp.chunked_encoding);
        assert_eq!(resp.content_length, -1);
    }

    #[test]
    fn test_parse_response_keep_alive_without_length() {
        let mut resp = Response::new();
        parse_http_response(&mut resp, b"HTTP/1.1 204 No Content\r\n").unwrap();
        // until-close not allowed in keep-alive mode
        assert_eq!(resp.content_length, 0);
    }

    #[test]
    fn test_parse_response_cache_control() {
        let mut resp = Response::new();
        parse_http_response(
            &mut resp,
            b"HTTP/1.1 200 OK\r\nCache-Control: private, max-age=60\r\nContent-Length: 0\r\n",
        )
        .unwrap();
        assert!(resp.cache_private);
        assert_eq!(resp.max_age, 60);

        let mut resp = Response::new();
        parse_http_response(
            &mut resp,
            b"HTTP/1.1 200 OK\r\nCache-Control: max-age=0\r\nContent-Length: 0\r\n",
        )
        .unwrap();
        assert_eq!(resp.max_age, -1);
    }
}

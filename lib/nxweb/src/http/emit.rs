//! Raw header block assembly for server responses and outbound client
//! requests.

use super::parse::{identify_header, HeaderId};
use super::{format_uid, Request, Response};
use crate::arena::Span;
use crate::http::date::format_http_time;

pub const HTTP_100_CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Copy caller-supplied extra headers, filtering out the ones the
/// server composes from dedicated response fields.
fn add_extra_response_headers(resp_arena: &mut crate::arena::Arena, headers: &[(String, String)]) {
    for (name, value) in headers {
        match identify_header(name) {
            HeaderId::Connection
            | HeaderId::Server
            | HeaderId::ContentType
            | HeaderId::ContentLength
            | HeaderId::TransferEncoding
            | HeaderId::Date
            | HeaderId::CacheControl
            | HeaderId::Expires
            | HeaderId::LastModified
            | HeaderId::ETag
            | HeaderId::AcceptRanges => continue,
            _ => {}
        }
        resp_arena.append_str(name);
        resp_arena.append(b": ");
        resp_arena.append_str(value);
        resp_arena.append(b"\r\n");
    }
}

/// Finalise the response head into a single raw block in the response
/// arena. `http_date` is the loop's cached IMF-fixdate string.
pub fn prepare_response_headers(resp: &mut Response, http_date: &str) -> Span {
    let must_not_have_body =
        resp.status_code == 304 || resp.status_code == 204 || resp.status_code == 205;

    let mut arena = std::mem::replace(&mut resp.arena, crate::arena::Arena::new());
    arena.start_stream();
    arena.append(b"HTTP/1.");
    arena.append_char(if resp.http11 { b'1' } else { b'0' });
    arena.append_char(b' ');
    arena.append_uint(if resp.status_code != 0 {
        resp.status_code as u64
    } else {
        200
    });
    arena.append_char(b' ');
    arena.append_str(resp.status.as_deref().unwrap_or("OK"));
    arena.append(b"\r\nServer: nxweb/");
    arena.append_str(crate::REVISION);
    arena.append(b"\r\nDate: ");
    arena.append_str(http_date);
    arena.append(b"\r\nConnection: ");
    arena.append_str(if resp.keep_alive { "keep-alive" } else { "close" });
    arena.append(b"\r\n");

    if !resp.extra_headers.is_empty() {
        add_extra_response_headers(&mut arena, &resp.extra_headers);
    }
    if resp.content_length != 0 {
        arena.append(b"Content-Type: ");
        arena.append_str(resp.content_type.as_deref().unwrap_or("text/html"));
        if let Some(charset) = resp.content_charset.as_deref() {
            arena.append(b"; charset=");
            arena.append_str(charset);
        }
        arena.append(b"\r\n");
        if resp.gzip_encoded {
            arena.append(b"Content-Encoding: gzip\r\n");
        }
    }
    if let Some(last_modified) = resp.last_modified {
        arena.append(b"Last-Modified: ");
        arena.append_str(&format_http_time(last_modified));
        arena.append(b"\r\n");
    }
    if let Some(etag) = resp.etag.as_deref() {
        arena.append(b"ETag: ");
        arena.append_str(etag);
        arena.append(b"\r\n");
    }
    if let Some(expires) = resp.expires {
        arena.append(b"Expires: ");
        arena.append_str(&format_http_time(expires));
        arena.append(b"\r\n");
    }
    if let Some(cache_control) = resp.cache_control.as_deref() {
        arena.append(b"Cache-Control: ");
        arena.append_str(cache_control);
        arena.append(b"\r\n");
    } else if resp.no_cache || resp.cache_private || resp.max_age != 0 {
        let mut comma = false;
        arena.append(b"Cache-Control: ");
        if resp.cache_private {
            arena.append_str("private");
            comma = true;
        }
        if resp.no_cache {
            if comma {
                arena.append(b", ");
            }
            arena.append_str("no-cache");
            comma = true;
        }
        if resp.max_age != 0 {
            if comma {
                arena.append(b", ");
            }
            arena.append(b"max-age=");
            if resp.max_age == -1 {
                // cacheable but must be revalidated every time
                arena.append_char(b'0');
            } else {
                arena.append_uint(resp.max_age as u64);
            }
        }
        arena.append(b"\r\n");
    }
    if resp.content_length != 0 || !must_not_have_body {
        if resp.content_length >= 0 {
            arena.append(b"Content-Length: ");
            arena.append_uint(resp.content_length as u64);
        } else {
            arena.append(b"Transfer-Encoding: chunked");
        }
        arena.append(b"\r\n");
    }
    arena.append(b"\r\n");

    let span = arena.finish_stream();
    resp.arena = arena;
    resp.raw_headers = Some(span);
    span
}

/// Assemble the head of an outbound request (proxy/backend) into the
/// request arena, including the relay annotation headers.
pub fn prepare_client_request_headers(req: &mut Request) -> Span {
    let method = if req.head_method { "HEAD" } else { req.method() }.to_owned();
    let uri = req.uri().to_owned();
    let host = req.host().to_owned();
    let user_agent = req.user_agent().map(|ua| ua.to_owned());
    let cookie = req.cookie_header().map(|c| c.to_owned());
    let accept_encoding = req.accept_encoding().map(|ae| ae.to_owned());
    let content_type = req.content_type().map(|ct| ct.to_owned());
    let extra: Vec<(String, String)> = req
        .headers
        .iter()
        .map(|(n, v)| {
            (
                req.arena.str_at(*n).to_owned(),
                req.arena.str_at(*v).to_owned(),
            )
        })
        .collect();

    let arena = &mut req.arena;
    arena.start_stream();
    arena.append_str(&method);
    arena.append_char(b' ');
    arena.append_str(&uri);
    arena.append(b" HTTP/1.");
    arena.append_char(if req.http11 { b'1' } else { b'0' });
    arena.append(b"\r\nHost: ");
    arena.append_str(&host);
    arena.append(b"\r\nConnection: ");
    arena.append_str(if req.keep_alive { "keep-alive" } else { "close" });
    arena.append(b"\r\n");

    if let Some(ims) = req.if_modified_since {
        arena.append(b"If-Modified-Since: ");
        arena.append_str(&format_http_time(ims));
        arena.append(b"\r\n");
    }
    if req.expect_100_continue {
        arena.append(b"Expect: 100-continue\r\n");
    }
    if req.x_forwarded_ssl {
        arena.append(b"X-NXWEB-Forwarded-SSL: ON\r\n");
    }
    if let Some(fwd_host) = req.x_forwarded_host.as_deref() {
        arena.append(b"X-NXWEB-Forwarded-Host: ");
        arena.append_str(fwd_host);
        arena.append(b"\r\n");
    }
    if let Some(fwd_for) = req.x_forwarded_for.as_deref() {
        arena.append(b"X-NXWEB-Forwarded-IP: ");
        arena.append_str(fwd_for);
        arena.append(b"\r\n");
    }
    if req.uid != 0 {
        arena.append(b"X-NXWEB-Request-ID: ");
        arena.append_str(&format_uid(req.uid));
        arena.append(b"\r\n");
    }
    if req.root_uid != 0 {
        arena.append(b"X-NXWEB-Root-Request-ID: ");
        arena.append_str(&format_uid(req.root_uid));
        arena.append(b"\r\n");
    }
    match user_agent {
        Some(ua) => {
            arena.append(b"User-Agent: ");
            arena.append_str(&ua);
            arena.append(b"\r\n");
        }
        None => {
            arena.append(b"User-Agent: nxweb/");
            arena.append_str(crate::REVISION);
            arena.append(b"\r\n");
        }
    }
    if let Some(cookie) = cookie {
        arena.append(b"Cookie: ");
        arena.append_str(&cookie);
        arena.append(b"\r\n");
    }
    for (name, value) in &extra {
        arena.append_str(name);
        arena.append(b": ");
        arena.append_str(value);
        arena.append(b"\r\n");
    }
    if let Some(ae) = accept_encoding {
        arena.append(b"Accept-Encoding: ");
        arena.append_str(&ae);
        arena.append(b"\r\n");
    }
    if req.content_length != 0 {
        arena.append(b"Content-Type: ");
        arena.append_str(
            content_type
                .as_deref()
                .unwrap_or("application/x-www-form-urlencoded"),
        );
        arena.append(b"\r\n");
        if req.content_length >= 0 {
            arena.append(b"Content-Length: ");
            arena.append_uint(req.content_length as u64);
        } else {
            arena.append(b"Transfer-Encoding: chunked");
        }
        arena.append(b"\r\n");
    }
    arena.append(b"\r\n");
    arena.finish_stream()
}

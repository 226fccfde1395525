//! HTTP data model: parsed requests, assembled responses and their
//! content sources.

pub mod chunked;
pub mod date;
pub mod emit;
pub mod parse;
pub mod uri;

use crate::arena::{Arena, Span};
use crate::cache::CacheRec;
use crate::mime::MimeType;
use crate::stream::{FileWindow, PipeId, Streamer};
use std::sync::Arc;

pub use self::chunked::{ChunkedDecoder, ChunkedEncoder};

/// One parsed HTTP request. Every string field is a span into the
/// request's own arena, so the struct stays movable (worker offload)
/// while accessors borrow from it.
#[derive(Debug)]
pub struct Request {
    pub arena: Arena,

    method: Span,
    uri: Span,
    http_version: Span,
    host: Span,
    cookie_hdr: Option<Span>,
    user_agent: Option<Span>,
    content_type: Option<Span>,
    transfer_encoding: Option<Span>,
    accept_encoding: Option<Span>,
    range: Option<Span>,

    pub headers: Vec<(Span, Span)>,
    parameters: Option<Vec<(Span, Span)>>,
    cookies: Option<Vec<(Span, Span)>>,

    pub if_modified_since: Option<u64>,
    /// -1 = unspecified: chunked or until close.
    pub content_length: i64,
    pub content_received: u64,
    /// Buffered request body (memory buffering mode).
    pub content: Vec<u8>,

    pub http11: bool,
    pub head_method: bool,
    pub get_method: bool,
    pub post_method: bool,
    pub other_method: bool,
    pub accept_gzip_encoding: bool,
    pub expect_100_continue: bool,
    pub chunked_encoding: bool,
    pub chunked_content_complete: bool,
    pub keep_alive: bool,
    pub sending_100_continue: bool,
    pub x_forwarded_ssl: bool,
    pub x_nxweb_ssi: bool,
    pub x_nxweb_templates: bool,
    pub buffering_to_memory: bool,

    /// Unique 64-bit request id.
    pub uid: u64,
    /// Root request id when this is a subrequest, else 0.
    pub root_uid: u64,
    pub is_subrequest: bool,

    /// Offset into the uri where the selected handler's prefix ends.
    pub path_info_off: u32,
    pub received_time: u64,

    pub cdstate: ChunkedDecoder,

    /// Outbound relay annotation fields.
    pub x_forwarded_for: Option<String>,
    pub x_forwarded_host: Option<String>,

    /// Small per-request attachments keyed by caller-chosen ids.
    pub data_chain: Vec<(u64, i64)>,

    pub log_fragments: Vec<crate::access_log::Fragment>,
}

impl Request {
    pub fn new() -> Request {
        Request {
            arena: Arena::with_capacity(crate::MAX_REQUEST_HEADERS_SIZE + 1024),
            method: Span::default(),
            uri: Span::default(),
            http_version: Span::default(),
            host: Span::default(),
            cookie_hdr: None,
            user_agent: None,
            content_type: None,
            transfer_encoding: None,
            accept_encoding: None,
            range: None,
            headers: Vec::new(),
            parameters: None,
            cookies: None,
            if_modified_since: None,
            content_length: 0,
            content_received: 0,
            content: Vec::new(),
            http11: false,
            head_method: false,
            get_method: false,
            post_method: false,
            other_method: false,
            accept_gzip_encoding: false,
            expect_100_continue: false,
            chunked_encoding: false,
            chunked_content_complete: false,
            keep_alive: false,
            sending_100_continue: false,
            x_forwarded_ssl: false,
            x_nxweb_ssi: false,
            x_nxweb_templates: false,
            buffering_to_memory: false,
            uid: 0,
            root_uid: 0,
            is_subrequest: false,
            path_info_off: 0,
            received_time: 0,
            cdstate: ChunkedDecoder::new(),
            x_forwarded_for: None,
            x_forwarded_host: None,
            data_chain: Vec::new(),
            log_fragments: Vec::new(),
        }
    }

    /// Reset for connection reuse. Arena capacity is retained.
    pub fn reset(&mut self) {
        let arena_cap = std::mem::replace(&mut self.arena, Arena::new());
        *self = Request::new();
        self.arena = arena_cap;
        self.arena.reset();
    }

    #[inline]
    pub fn method(&self) -> &str {
        self.arena.str_at(self.method)
    }

    #[inline]
    pub fn uri(&self) -> &str {
        self.arena.str_at(self.uri)
    }

    #[inline]
    pub fn http_version(&self) -> &str {
        self.arena.str_at(self.http_version)
    }

    /// Host, folded to lowercase at parse time.
    #[inline]
    pub fn host(&self) -> &str {
        self.arena.str_at(self.host)
    }

    #[inline]
    pub fn path_info(&self) -> &str {
        &self.uri()[self.path_info_off as usize..]
    }

    #[inline]
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.map(|s| self.arena.str_at(s))
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.map(|s| self.arena.str_at(s))
    }

    #[inline]
    pub fn accept_encoding(&self) -> Option<&str> {
        self.accept_encoding.map(|s| self.arena.str_at(s))
    }

    #[inline]
    pub fn transfer_encoding(&self) -> Option<&str> {
        self.transfer_encoding.map(|s| self.arena.str_at(s))
    }

    #[inline]
    pub fn range(&self) -> Option<&str> {
        self.range.map(|s| self.arena.str_at(s))
    }

    #[inline]
    pub fn cookie_header(&self) -> Option<&str> {
        self.cookie_hdr.map(|s| self.arena.str_at(s))
    }

    /// Residual (non-promoted) header lookup, case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| self.arena.str_at(*n).eq_ignore_ascii_case(name))
            .map(|(_, v)| self.arena.str_at(*v))
    }

    /// Query/body parameter, available after `parse_parameters`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.as_ref().and_then(|params| {
            params
                .iter()
                .find(|(n, _)| self.arena.str_at(*n) == name)
                .map(|(_, v)| self.arena.str_at(*v))
        })
    }

    /// Cookie value, available after `parse_cookies`.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.as_ref().and_then(|cookies| {
            cookies
                .iter()
                .find(|(n, _)| self.arena.str_at(*n) == name)
                .map(|(_, v)| self.arena.str_at(*v))
        })
    }

    #[inline]
    pub fn parameters_parsed(&self) -> bool {
        self.parameters.is_some()
    }

    pub fn set_data(&mut self, key: u64, value: i64) {
        match self.data_chain.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.data_chain.push((key, value)),
        }
    }

    pub fn get_data(&self, key: u64) -> Option<i64> {
        self.data_chain
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    // Outbound (client) request construction.

    pub fn set_method(&mut self, method: &str) {
        self.method = self.arena.alloc_str(method);
        self.get_method = method.eq_ignore_ascii_case("GET");
        self.post_method = method.eq_ignore_ascii_case("POST");
        self.other_method = !self.get_method && !self.post_method;
    }

    pub fn set_uri(&mut self, uri: &str) {
        self.uri = self.arena.alloc_str(uri);
    }

    pub fn set_host(&mut self, host: &str) {
        let span = self.arena.alloc_str(host);
        self.arena.bytes_mut(span).make_ascii_lowercase();
        self.host = span;
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(self.arena.alloc_str(content_type));
    }

    pub fn set_user_agent(&mut self, user_agent: &str) {
        self.user_agent = Some(self.arena.alloc_str(user_agent));
    }

    pub(crate) fn set_uri_span(&mut self, span: Span) {
        self.uri = span;
    }

    pub(crate) fn uri_span(&self) -> Span {
        self.uri
    }
}

/// File metadata captured at stat time. Replaces the zero-inode
/// "uninitialised" convention with an explicit option at call sites.
#[derive(Debug, Copy, Clone)]
pub struct FileMeta {
    pub size: u64,
    pub mtime: u64,
    pub is_dir: bool,
    pub is_file: bool,
}

impl FileMeta {
    pub fn from_std(meta: &std::fs::Metadata) -> FileMeta {
        use std::time::UNIX_EPOCH;
        FileMeta {
            size: meta.len(),
            mtime: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
        }
    }
}

/// Response entity source. Variants are mutually exclusive.
pub enum Content {
    None,
    /// Bytes assembled in the response arena.
    Bytes(Span),
    /// Shared bytes from the memory cache.
    Cached(Arc<CacheRec>),
    /// A window over a regular file.
    File(FileWindow),
    /// A pipe filled by another connection on the same net thread
    /// (proxy backend, subrequest).
    Pipe(PipeId),
    /// Ordered composite of buffers, file windows and subrequest
    /// pipes.
    Streamer(Streamer),
}

impl Content {
    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Content::None)
    }
}

/// Errors from `send_file`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendFileError {
    NotFound,
    IsDirectory,
    NotRegular,
}

pub struct Response {
    pub arena: Arena,

    pub status_code: u16,
    pub status: Option<String>,

    pub keep_alive: bool,
    pub http11: bool,
    pub chunked_encoding: bool,
    pub gzip_encoded: bool,
    pub ssi_on: bool,
    pub templates_on: bool,
    pub no_cache: bool,
    pub cache_private: bool,

    pub run_filter_idx: usize,

    pub host: Option<String>,
    pub content_type: Option<String>,
    pub content_charset: Option<String>,
    pub cache_control: Option<String>,
    pub etag: Option<String>,
    pub extra_headers: Vec<(String, String)>,

    pub date: Option<u64>,
    pub last_modified: Option<u64>,
    pub expires: Option<u64>,
    /// Delta seconds; 0 = unset, -1 = cacheable but revalidate every
    /// time (serialises as `max-age=0`).
    pub max_age: i64,

    /// -1 = unknown length, chunked framing.
    pub content_length: i64,
    pub content_received: u64,
    pub bytes_sent: u64,

    pub content: Content,
    pub cache_key: Option<String>,
    pub mime: Option<&'static MimeType>,
    pub sendfile_path: Option<std::path::PathBuf>,

    pub raw_headers: Option<Span>,
    pub cestate: ChunkedEncoder,
}

impl Response {
    pub fn new() -> Response {
        Response {
            arena: Arena::new(),
            status_code: 0,
            status: None,
            keep_alive: false,
            http11: false,
            chunked_encoding: false,
            gzip_encoded: false,
            ssi_on: false,
            templates_on: false,
            no_cache: false,
            cache_private: false,
            run_filter_idx: 0,
            host: None,
            content_type: None,
            content_charset: None,
            cache_control: None,
            etag: None,
            extra_headers: Vec::new(),
            date: None,
            last_modified: None,
            expires: None,
            max_age: 0,
            content_length: 0,
            content_received: 0,
            bytes_sent: 0,
            content: Content::None,
            cache_key: None,
            mime: None,
            sendfile_path: None,
            raw_headers: None,
            cestate: ChunkedEncoder::new(),
        }
    }

    /// Seed from the request the response answers.
    pub fn init_from(&mut self, req: &Request) {
        self.host = Some(req.host().to_owned());
        self.http11 = req.http11;
        self.keep_alive = req.keep_alive;
    }

    pub fn reset(&mut self) {
        let arena_cap = std::mem::replace(&mut self.arena, Arena::new());
        *self = Response::new();
        self.arena = arena_cap;
        self.arena.reset();
    }

    #[inline]
    pub fn set_status(&mut self, code: u16, message: &str) {
        self.status_code = code;
        self.status = Some(message.to_owned());
    }

    #[inline]
    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(content_type.to_owned());
    }

    #[inline]
    pub fn set_charset(&mut self, charset: &str) {
        self.content_charset = Some(charset.to_owned());
    }

    /// Add a verbatim extra header. Reserved headers are set through
    /// their dedicated fields and filtered on emission.
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.extra_headers.push((name.to_owned(), value.to_owned()));
    }

    /// Body text accessor for assembled/buffered responses.
    pub fn content_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            Content::Bytes(span) => Some(self.arena.bytes(*span)),
            Content::Cached(rec) => Some(&rec.content),
            _ => None,
        }
    }

    /// Set an in-memory entity.
    pub fn send_data(&mut self, data: &[u8], content_type: &str) {
        let span = self.arena.alloc(data);
        self.content = Content::Bytes(span);
        self.content_length = data.len() as i64;
        self.content_type = Some(content_type.to_owned());
    }

    /// Assemble a body incrementally in the arena; finish with
    /// `finish_body`.
    pub fn start_body(&mut self) {
        self.arena.start_stream();
    }

    pub fn append_body(&mut self, text: &str) {
        self.arena.append_str(text);
    }

    pub fn append_body_html_escaped(&mut self, text: &str) {
        let mut escaped = String::new();
        uri::append_html_escaped(&mut escaped, text);
        self.arena.append_str(&escaped);
    }

    pub fn finish_body(&mut self, content_type: &str) {
        let span = self.arena.finish_stream();
        self.content_length = span.len() as i64;
        self.content = Content::Bytes(span);
        self.content_type = Some(content_type.to_owned());
    }

    /// Standard error page. Clears any previously set content.
    pub fn send_http_error(&mut self, code: u16, message: &str) {
        self.set_status(code, message);
        self.arena.start_stream();
        self.arena.append_str("<html>\n<head><title>");
        self.arena.append_str(message);
        self.arena.append_str("</title></head>\n<body>\n<h1>");
        self.arena.append_str(message);
        self.arena.append_str("</h1>\n<p>nxweb/");
        self.arena.append_str(crate::REVISION);
        self.arena.append_str("</p>\n</body>\n</html>");
        let span = self.arena.finish_stream();
        self.content = Content::Bytes(span);
        self.content_length = span.len() as i64;
        self.content_type = Some("text/html".to_owned());
        self.content_charset = None;
        self.sendfile_path = None;
    }

    /// Redirect with empty body. Relative locations are made absolute
    /// against the request host.
    pub fn send_redirect(&mut self, code: u16, location: &str, secure: bool) {
        self.status_code = code;
        self.status = Some(
            match code {
                302 => "Found",
                301 => "Moved Permanently",
                _ => "Redirect",
            }
            .to_owned(),
        );
        self.content = Content::None;
        self.content_type = None;
        self.content_length = 0;
        self.sendfile_path = None;
        let location = if location.starts_with("http://") || location.starts_with("https://") {
            location.to_owned()
        } else {
            let mut absolute = String::from(if secure { "https://" } else { "http://" });
            absolute.push_str(self.host.as_deref().unwrap_or(""));
            absolute.push_str(location);
            absolute
        };
        self.extra_headers.push(("Location".to_owned(), location));
    }

    /// Serve a window of a regular file. `meta` may be supplied from a
    /// prior stat; otherwise the file is stat'ed here.
    pub fn send_file(
        &mut self,
        path: &std::path::Path,
        meta: Option<FileMeta>,
        gzip_encoded: bool,
        offset: u64,
        size: u64,
        mtype: Option<&'static MimeType>,
        charset: Option<&str>,
    ) -> Result<(), SendFileError> {
        let meta = match meta {
            Some(meta) => meta,
            None => match std::fs::metadata(path) {
                Ok(m) => FileMeta::from_std(&m),
                Err(_) => return Err(SendFileError::NotFound),
            },
        };
        if meta.is_dir {
            return Err(SendFileError::IsDirectory);
        }
        if !meta.is_file {
            return Err(SendFileError::NotRegular);
        }

        let length = if size > 0 { size } else { meta.size - offset };
        let mtype = match mtype {
            Some(m) => m,
            None => {
                let name = path.to_string_lossy();
                let name = match (gzip_encoded, name.ends_with(".gz")) {
                    (true, true) => name[..name.len() - 3].to_owned(),
                    _ => name.into_owned(),
                };
                crate::mime::by_ext(&name)
            }
        };

        self.content = Content::File(FileWindow::new(path.to_owned(), offset, offset + length, meta));
        self.sendfile_path = Some(path.to_owned());
        self.content_length = length as i64;
        self.last_modified = Some(meta.mtime);
        self.gzip_encoded = gzip_encoded;
        self.mime = Some(mtype);
        self.content_type = Some(mtype.mime.to_owned());
        if mtype.charset_required {
            self.content_charset = charset.map(|c| c.to_owned());
        }
        Ok(())
    }
}

/// Serialise a unique request id the way it appears in logs and
/// forwarded headers.
#[inline]
pub fn format_uid(uid: u64) -> String {
    format!("{:016x}", uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_outbound_construction() {
        let mut req = Request::new();
        req.set_method("GET");
        req.set_uri("/path?q=1");
        req.set_host("Example.COM");
        assert_eq!(req.method(), "GET");
        assert!(req.get_method);
        assert_eq!(req.uri(), "/path?q=1");
        assert_eq!(req.host(), "example.com");
    }

    #[test]
    fn test_request_data_chain() {
        let mut req = Request::new();
        assert_eq!(req.get_data(7), None);
        req.set_data(7, 42);
        req.set_data(7, 43);
        req.set_data(9, 1);
        assert_eq!(req.get_data(7), Some(43));
        assert_eq!(req.get_data(9), Some(1));
    }

    #[test]
    fn test_error_page_contains_revision() {
        let mut resp = Response::new();
        resp.send_http_error(404, "Not Found");
        assert_eq!(resp.status_code, 404);
        let body = std::str::from_utf8(resp.content_bytes().unwrap()).unwrap();
        assert!(body.contains("Not Found"));
        assert!(body.contains(&format!("nxweb/{}", crate::REVISION)));
        assert_eq!(resp.content_length as usize, body.len());
    }

    #[test]
    fn test_redirect_absolutises_location() {
        let mut resp = Response::new();
        resp.host = Some("x".to_owned());
        resp.send_redirect(302, "/dir/", false);
        assert_eq!(resp.status_code, 302);
        let loc = resp
            .extra_headers
            .iter()
            .find(|(n, _)| n == "Location")
            .map(|(_, v)| v.as_str());
        assert_eq!(loc, Some("http://x/dir/"));
        assert_eq!(resp.content_length, 0);
    }

    #[test]
    fn test_body_assembly() {
        let mut resp = Response::new();
        resp.start_body();
        resp.append_body("<p>");
        resp.append_body_html_escaped("a<b");
        resp.append_body("</p>");
        resp.finish_body("text/html");
        assert_eq!(
            resp.content_bytes().unwrap(),
            b"<p>a&lt;b</p>" as &[u8]
        );
        assert_eq!(resp.content_length, 13);
    }

    #[test]
    fn test_format_uid() {
        assert_eq!(format_uid(0x1a2b), "0000000000001a2b");
        assert_eq!(format_uid(u64::max_value()), "ffffffffffffffff");
    }
}

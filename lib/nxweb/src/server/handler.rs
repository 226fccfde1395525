//! Handler and filter interfaces plus the ordered registry the
//! dispatcher scans.

use crate::error::HandlerResult;
use crate::http::{FileMeta, Request, Response};
use crate::stream::BodySink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Handler behavior flags.
pub mod flags {
    /// Execute `on_request` in a worker thread (for lengthy or
    /// blocking operations).
    pub const INWORKER: u32 = 0x1;
    /// Parse query string and url-encoded post data before invoking.
    pub const PARSE_PARAMETERS: u32 = 0x2;
    /// Parse the cookie header before invoking.
    pub const PARSE_COOKIES: u32 = 0x8;
    pub const HANDLE_GET: u32 = 0x10;
    /// Implies ACCEPT_CONTENT.
    pub const HANDLE_POST: u32 = 0x20;
    pub const HANDLE_OTHER: u32 = 0x40;
    pub const HANDLE_ANY: u32 = 0x70;
    /// Handler accepts a request body.
    pub const ACCEPT_CONTENT: u32 = 0x80;
    pub const SECURE_ONLY: u32 = 0x100;
    pub const INSECURE_ONLY: u32 = 0x200;

    pub(crate) const HANDLE_MASK: u32 = 0x70;
}

/// Services a handler may use while running on the net thread.
/// Worker-offloaded `on_request` callbacks only see the request and
/// response pair.
pub trait HandlerCtx {
    fn secure(&self) -> bool;
    fn remote_addr(&self) -> &str;
    /// Cached wall clock, unix seconds.
    fn http_time(&self) -> u64;
    /// Monotonic loop clock, microseconds.
    fn loop_time(&self) -> u64;
    /// Route the request body to this sink instead of memory
    /// buffering. Call before returning from `on_headers`.
    fn connect_request_body_out(&mut self, sink: Box<dyn BodySink>);
    /// Begin a composite (streamer) response body.
    fn composite_start(&mut self);
    fn composite_append_bytes(&mut self, data: &[u8]);
    fn composite_append_file(&mut self, path: &Path, offset: u64, end: u64) -> std::io::Result<()>;
    /// Splice an in-process subrequest's response body in at this
    /// position.
    fn composite_append_subrequest(&mut self, host: Option<&str>, uri: &str);
    /// Call right after appending the last composite node.
    fn composite_close(&mut self);
}

/// Dispatch target. Default methods make every callback optional, the
/// way a base handler donates defaults to its registrations.
#[allow(unused_variables)]
pub trait Handler: Send + Sync {
    /// Seed the canonical cache key in `resp.cache_key`. Leaving it
    /// empty skips the cache phase; returning `Next` passes the whole
    /// request on to the next handler.
    fn on_generate_cache_key(
        &self,
        reg: &HandlerReg,
        ctx: &mut dyn HandlerCtx,
        req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        HandlerResult::Ok
    }

    /// Claim or decline the request after prefix/vhost matching.
    fn on_select(
        &self,
        reg: &HandlerReg,
        ctx: &mut dyn HandlerCtx,
        req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        HandlerResult::Ok
    }

    /// Headers parsed; decide on body handling or answer directly.
    fn on_headers(
        &self,
        reg: &HandlerReg,
        ctx: &mut dyn HandlerCtx,
        req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        HandlerResult::Ok
    }

    fn on_post_data(
        &self,
        reg: &HandlerReg,
        ctx: &mut dyn HandlerCtx,
        req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        HandlerResult::Ok
    }

    fn on_post_data_complete(
        &self,
        reg: &HandlerReg,
        ctx: &mut dyn HandlerCtx,
        req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        HandlerResult::Ok
    }

    /// Produce the response. Runs on a worker thread when the
    /// registration carries INWORKER; must not touch net-thread
    /// state.
    fn on_request(&self, reg: &HandlerReg, req: &mut Request, resp: &mut Response) -> HandlerResult {
        HandlerResult::Ok
    }

    fn on_complete(
        &self,
        reg: &HandlerReg,
        ctx: &mut dyn HandlerCtx,
        req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        HandlerResult::Ok
    }

    fn on_error(
        &self,
        reg: &HandlerReg,
        ctx: &mut dyn HandlerCtx,
        req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        HandlerResult::Ok
    }
}

/// Marker handler for proxied prefixes. The connection layer drives
/// the actual backend exchange when a registration carries a proxy
/// pool index; the callbacks stay defaults.
pub struct ProxyHandler;

impl Handler for ProxyHandler {}

/// Per-request filter state slot.
#[derive(Default)]
pub struct FilterData {
    pub bypass: bool,
    pub cache_key: Option<String>,
    pub cache_key_finfo: Option<FileMeta>,
    /// The filter holds an expired copy and has put its mtime into
    /// the request's If-Modified-Since; it expects to see a 304 (or
    /// fresh content) come back through `do_filter`.
    pub revalidating: bool,
}

/// Middleware around a handler: URI decoding, cache-key composition,
/// cache lookup and response post-processing.
#[allow(unused_variables)]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Per-request initialisation; `None` bypasses the filter for
    /// this request.
    fn init(&self, req: &Request, resp: &Response) -> Option<FilterData> {
        Some(FilterData::default())
    }

    /// Rewrite the request URI (run last filter to first). Return the
    /// rewritten URI or None if unchanged.
    fn decode_uri(&self, fdata: &mut FilterData, uri: &str) -> Option<String> {
        None
    }

    /// Extend the composed cache key; store the translated key in
    /// `fdata.cache_key` and return Ok, or Next to leave it as is.
    fn translate_cache_key(
        &self,
        req: &Request,
        fdata: &mut FilterData,
        key: &str,
    ) -> HandlerResult {
        HandlerResult::Next
    }

    /// Answer from this filter's cache if it has fresh content.
    /// Return `Revalidate` (after priming the request's
    /// If-Modified-Since from the stored copy) when the copy is
    /// stale; a 304 coming back through `do_filter` then refreshes
    /// and replays it.
    fn serve_from_cache(
        &self,
        req: &mut Request,
        resp: &mut Response,
        fdata: &mut FilterData,
        check_time: u64,
    ) -> HandlerResult {
        HandlerResult::Next
    }

    /// Post-process the assembled response on its way out.
    fn do_filter(&self, req: &Request, resp: &mut Response, fdata: &mut FilterData) -> HandlerResult {
        HandlerResult::Next
    }

    fn finalize(&self, fdata: &mut FilterData) {}
}

/// One registered handler with its routing constraints, parameters
/// and filter chain.
pub struct HandlerReg {
    pub name: &'static str,
    pub prefix: Option<String>,
    pub vhost: Option<String>,
    pub priority: i32,
    pub flags: u32,
    pub dir: Option<PathBuf>,
    pub uri: Option<String>,
    pub index_file: Option<String>,
    pub charset: Option<String>,
    pub memcache: bool,
    pub proxy_pool: Option<usize>,
    pub proxy_copy_host: bool,
    pub filters: Vec<Arc<dyn Filter>>,
    pub handler: Arc<dyn Handler>,
}

impl HandlerReg {
    #[inline]
    pub fn prefix_len(&self) -> usize {
        self.prefix.as_deref().map(str::len).unwrap_or(0)
    }

    #[inline]
    pub fn in_worker(&self) -> bool {
        self.flags & flags::INWORKER != 0
    }

    #[inline]
    pub fn accepts_content(&self) -> bool {
        self.flags & (flags::HANDLE_POST | flags::ACCEPT_CONTENT) != 0
    }
}

/// Builder for handler registrations, populated at config time.
pub struct HandlerBuilder {
    reg: HandlerReg,
}

impl HandlerBuilder {
    pub fn new(name: &'static str, handler: Arc<dyn Handler>) -> HandlerBuilder {
        HandlerBuilder {
            reg: HandlerReg {
                name,
                prefix: None,
                vhost: None,
                priority: 0,
                flags: 0,
                dir: None,
                uri: None,
                index_file: None,
                charset: None,
                memcache: false,
                proxy_pool: None,
                proxy_copy_host: false,
                filters: Vec::new(),
                handler,
            },
        }
    }

    pub fn prefix(mut self, prefix: &str) -> HandlerBuilder {
        self.reg.prefix = Some(prefix.to_owned());
        self
    }

    pub fn vhost(mut self, vhost: &str) -> HandlerBuilder {
        self.reg.vhost = Some(vhost.to_ascii_lowercase());
        self
    }

    pub fn priority(mut self, priority: i32) -> HandlerBuilder {
        self.reg.priority = priority;
        self
    }

    pub fn flags(mut self, flags: u32) -> HandlerBuilder {
        self.reg.flags = flags;
        self
    }

    pub fn dir<P: Into<PathBuf>>(mut self, dir: P) -> HandlerBuilder {
        self.reg.dir = Some(dir.into());
        self
    }

    pub fn uri(mut self, uri: &str) -> HandlerBuilder {
        self.reg.uri = Some(uri.to_owned());
        self
    }

    pub fn index_file(mut self, index_file: &str) -> HandlerBuilder {
        self.reg.index_file = Some(index_file.to_owned());
        self
    }

    pub fn charset(mut self, charset: &str) -> HandlerBuilder {
        self.reg.charset = Some(charset.to_owned());
        self
    }

    pub fn memcache(mut self, on: bool) -> HandlerBuilder {
        self.reg.memcache = on;
        self
    }

    pub fn proxy_pool(mut self, idx: usize) -> HandlerBuilder {
        self.reg.proxy_pool = Some(idx);
        self
    }

    pub fn proxy_copy_host(mut self, on: bool) -> HandlerBuilder {
        self.reg.proxy_copy_host = on;
        self
    }

    pub fn filter(mut self, filter: Arc<dyn Filter>) -> HandlerBuilder {
        assert!(
            self.reg.filters.len() < crate::MAX_FILTERS,
            "too many filters on handler {}",
            self.reg.name
        );
        self.reg.filters.push(filter);
        self
    }

    pub fn build(self) -> HandlerReg {
        self.reg
    }
}

/// URI prefix match: the char following the prefix must be end of
/// string, '/', '?' or ';'.
#[inline]
pub fn url_prefix_match(url: &str, prefix: &str) -> bool {
    if url.len() < prefix.len() {
        return false;
    }
    match url.as_bytes().get(prefix.len()) {
        Some(&c) if c != b'/' && c != b'?' && c != b';' => return false,
        _ => {}
    }
    url.as_bytes().starts_with(prefix.as_bytes())
}

/// Vhost suffix match. A leading '.' makes the suffix a wildcard:
/// `.example.com` matches `foo.example.com` and `example.com` itself.
#[inline]
pub fn vhost_match(host: &str, vhost_suffix: &str) -> bool {
    if let Some(stripped) = vhost_suffix.strip_prefix('.') {
        if vhost_suffix.len() == host.len() + 1 {
            return host == stripped;
        }
        if vhost_suffix.len() <= host.len() {
            return host.ends_with(vhost_suffix);
        }
        false
    } else {
        host == vhost_suffix
    }
}

/// Strip an optional `:port` before vhost matching.
#[inline]
pub fn host_without_port(host: &str) -> &str {
    match host.find(':') {
        Some(pos) => &host[..pos],
        None => host,
    }
}

/// Global handler list, ordered by ascending priority. Static for the
/// process once the server starts.
pub struct HandlerRegistry {
    list: Vec<Arc<HandlerReg>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry { list: Vec::new() }
    }

    /// Insert keeping priority order; equal priorities keep their
    /// registration order.
    pub fn register(&mut self, reg: HandlerReg) {
        if let Some(prefix) = reg.prefix.as_deref() {
            if !prefix.is_empty() && !prefix.starts_with('/') {
                panic!(
                    "handler's prefix must start with '/'; handler={} with prefix={} not allowed",
                    reg.name, prefix
                );
            }
        }
        let pos = self
            .list
            .iter()
            .position(|h| h.priority > reg.priority)
            .unwrap_or(self.list.len());
        self.list.insert(pos, Arc::new(reg));
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Arc<HandlerReg>> {
        self.list.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl Handler for Nop {}

    fn reg(name: &'static str, priority: i32) -> HandlerReg {
        HandlerBuilder::new(name, Arc::new(Nop)).priority(priority).build()
    }

    #[test]
    fn test_prefix_match() {
        assert!(url_prefix_match("/api", "/api"));
        assert!(url_prefix_match("/api/x", "/api"));
        assert!(url_prefix_match("/api?q", "/api"));
        assert!(url_prefix_match("/api;v", "/api"));
        assert!(!url_prefix_match("/apix", "/api"));
        assert!(!url_prefix_match("/ap", "/api"));
        assert!(url_prefix_match("/", "/"));
        assert!(url_prefix_match("/anything", "/"));
    }

    #[test]
    fn test_vhost_match() {
        assert!(vhost_match("foo.example.com", ".example.com"));
        assert!(vhost_match("example.com", ".example.com"));
        assert!(!vhost_match("badexample.com", ".example.com"));
        assert!(vhost_match("example.com", "example.com"));
        assert!(!vhost_match("www.example.com", "example.com"));
        assert!(!vhost_match("com", ".example.com"));
    }

    #[test]
    fn test_host_without_port() {
        assert_eq!(host_without_port("example.com:8080"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
    }

    #[test]
    fn test_registry_priority_order() {
        let mut registry = HandlerRegistry::new();
        registry.register(reg("c", 300));
        registry.register(reg("a", 100));
        registry.register(reg("b", 200));
        registry.register(reg("a2", 100));
        let names: Vec<&str> = registry.iter().map(|h| h.name).collect();
        assert_eq!(names, vec!["a", "a2", "b", "c"]);
    }

    #[test]
    #[should_panic(expected = "must start with '/'")]
    fn test_registry_rejects_bad_prefix() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            HandlerBuilder::new("bad", Arc::new(Nop)).prefix("api").build(),
        );
    }

    #[test]
    fn test_builder_flags() {
        let reg = HandlerBuilder::new("h", Arc::new(Nop))
            .prefix("/h")
            .flags(flags::HANDLE_GET | flags::INWORKER)
            .memcache(true)
            .build();
        assert!(reg.in_worker());
        assert!(!reg.accepts_content());
        assert!(reg.memcache);
        let reg = HandlerBuilder::new("p", Arc::new(Nop))
            .flags(flags::HANDLE_POST)
            .build();
        assert!(reg.accepts_content());
    }
}

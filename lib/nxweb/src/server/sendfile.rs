//! Built-in static file handler: maps the path-info under a document
//! root, serves regular files with mime/charset/Last-Modified, and
//! feeds the memory cache for small files.

use super::handler::{host_without_port, Handler, HandlerCtx, HandlerReg};
use crate::error::HandlerResult;
use crate::http::uri::{append_encode_file_path, remove_dots_from_uri_path, url_decode};
use crate::http::{FileMeta, Request, Response, SendFileError};
use std::path::PathBuf;

pub struct SendfileHandler;

impl SendfileHandler {
    /// Decode the request path and resolve it under the configured
    /// root. Rejects anything that escapes the root.
    fn resolve(&self, reg: &HandlerReg, req: &Request) -> Option<(PathBuf, bool)> {
        let root = reg.dir.as_ref()?;
        let root = match root.to_str() {
            Some(s) if s.contains("{host}") => {
                PathBuf::from(s.replace("{host}", host_without_port(req.host())))
            }
            _ => root.clone(),
        };

        let path_info = req.path_info();
        let path_end = path_info
            .find(|c| c == '?' || c == ';')
            .unwrap_or(path_info.len());
        let mut decoded = url_decode(&path_info[..path_end]);
        if decoded.is_empty() {
            decoded.push(b'/');
        }
        if decoded[0] != b'/' {
            decoded.insert(0, b'/');
        }
        // the decode may have reintroduced dot segments
        let len = remove_dots_from_uri_path(&mut decoded)?;
        decoded.truncate(len);
        let mut rel = String::from_utf8(decoded).ok()?;
        let wants_dir = rel.ends_with('/');
        if wants_dir {
            rel.push_str(
                reg.index_file
                    .as_deref()
                    .unwrap_or("index.htm"),
            );
        }
        let mut fpath = root;
        fpath.push(&rel[1..]);
        Some((fpath, wants_dir))
    }
}

impl Handler for SendfileHandler {
    fn on_generate_cache_key(
        &self,
        _reg: &HandlerReg,
        ctx: &mut dyn HandlerCtx,
        req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        // canonical key: host[_s]/uri, encoded as a file path
        let mut raw = String::with_capacity(req.host().len() + req.uri().len() + 3);
        raw.push_str(host_without_port(req.host()));
        if ctx.secure() {
            raw.push_str("_s");
        }
        raw.push_str(req.uri());
        let mut key = String::new();
        append_encode_file_path(&mut key, &raw);
        resp.cache_key = Some(key);
        HandlerResult::Ok
    }

    fn on_select(
        &self,
        reg: &HandlerReg,
        ctx: &mut dyn HandlerCtx,
        req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        let (fpath, _wants_dir) = match self.resolve(reg, req) {
            Some(resolved) => resolved,
            None => {
                resp.send_http_error(403, "Forbidden");
                return HandlerResult::Error;
            }
        };

        let meta = match std::fs::metadata(&fpath) {
            Ok(meta) => FileMeta::from_std(&meta),
            Err(_) => return HandlerResult::Next, // let another handler try
        };

        if meta.is_dir {
            // directory without trailing slash redirects to path/
            let path_info = req.path_info();
            let path_end = path_info
                .find(|c| c == '?' || c == ';')
                .unwrap_or(path_info.len());
            let mut location = req.uri()[..req.path_info_off as usize + path_end].to_owned();
            location.push('/');
            resp.send_redirect(302, &location, ctx.secure());
            return HandlerResult::Error;
        }

        if let (Some(ims), mtime) = (req.if_modified_since, meta.mtime) {
            if mtime != 0 && mtime <= ims {
                resp.status_code = 304;
                resp.status = Some("Not Modified".to_owned());
                return HandlerResult::Ok;
            }
        }

        match resp.send_file(
            &fpath,
            Some(meta),
            false,
            0,
            0,
            None,
            reg.charset.as_deref(),
        ) {
            Ok(()) => HandlerResult::Ok,
            Err(SendFileError::NotFound) => HandlerResult::Next,
            Err(SendFileError::IsDirectory) | Err(SendFileError::NotRegular) => {
                resp.send_http_error(403, "Forbidden");
                HandlerResult::Error
            }
        }
    }
}

/// Redirect every request to a canonical host, preserving the path.
/// The target host comes from the registration's `uri` parameter.
pub struct HostRedirectHandler;

impl Handler for HostRedirectHandler {
    fn on_headers(
        &self,
        reg: &HandlerReg,
        ctx: &mut dyn HandlerCtx,
        req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        let target = match reg.uri.as_deref() {
            Some(target) => target,
            None => return HandlerResult::Next,
        };
        resp.host = Some(target.to_owned());
        let uri = req.uri().to_owned();
        resp.send_redirect(301, &uri, ctx.secure());
        HandlerResult::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::HandlerBuilder;
    use crate::stream::BodySink;
    use std::io::Write;
    use std::sync::Arc;

    struct TestCtx {
        secure: bool,
    }

    impl HandlerCtx for TestCtx {
        fn secure(&self) -> bool {
            self.secure
        }
        fn remote_addr(&self) -> &str {
            "127.0.0.1"
        }
        fn http_time(&self) -> u64 {
            1_327_410_354
        }
        fn loop_time(&self) -> u64 {
            0
        }
        fn connect_request_body_out(&mut self, _sink: Box<dyn BodySink>) {}
        fn composite_start(&mut self) {}
        fn composite_append_bytes(&mut self, _data: &[u8]) {}
        fn composite_append_file(
            &mut self,
            _path: &std::path::Path,
            _offset: u64,
            _end: u64,
        ) -> std::io::Result<()> {
            Ok(())
        }
        fn composite_append_subrequest(&mut self, _host: Option<&str>, _uri: &str) {}
        fn composite_close(&mut self) {}
    }

    fn request(uri: &str) -> Request {
        let mut req = Request::new();
        let head = format!("GET {} HTTP/1.1\r\nHost: files.test\r\n", uri);
        crate::http::parse::parse_http_request(&mut req, head.as_bytes()).unwrap();
        req
    }

    fn docroot() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("nxweb-sendfile-test");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        let mut f = std::fs::File::create(dir.join("page.txt")).unwrap();
        f.write_all(b"static body").unwrap();
        let mut f = std::fs::File::create(dir.join("sub").join("index.htm")).unwrap();
        f.write_all(b"<html>index</html>").unwrap();
        dir
    }

    fn reg(dir: &std::path::Path) -> HandlerReg {
        HandlerBuilder::new("sendfile", Arc::new(SendfileHandler))
            .prefix("/files")
            .dir(dir)
            .index_file("index.htm")
            .charset("utf-8")
            .build()
    }

    #[test]
    fn test_serves_regular_file() {
        let dir = docroot();
        let reg = reg(&dir);
        let mut req = request("/files/page.txt");
        req.path_info_off = 6;
        let mut resp = Response::new();
        let mut ctx = TestCtx { secure: false };
        let result = SendfileHandler.on_select(&reg, &mut ctx, &mut req, &mut resp);
        assert_eq!(result, HandlerResult::Ok);
        assert_eq!(resp.content_length, 11);
        assert_eq!(resp.content_type.as_deref(), Some("text/plain"));
        assert_eq!(resp.content_charset.as_deref(), Some("utf-8"));
        assert!(resp.last_modified.is_some());
        assert!(resp.sendfile_path.is_some());
    }

    #[test]
    fn test_directory_redirects_to_slash() {
        let dir = docroot();
        let reg = reg(&dir);
        let mut req = request("/files/sub");
        req.path_info_off = 6;
        let mut resp = Response::new();
        let mut ctx = TestCtx { secure: false };
        let result = SendfileHandler.on_select(&reg, &mut ctx, &mut req, &mut resp);
        assert_eq!(result, HandlerResult::Error);
        assert_eq!(resp.status_code, 302);
        let loc = resp
            .extra_headers
            .iter()
            .find(|(n, _)| n == "Location")
            .map(|(_, v)| v.as_str())
            .unwrap();
        assert!(loc.ends_with("/files/sub/"));
    }

    #[test]
    fn test_directory_with_slash_serves_index() {
        let dir = docroot();
        let reg = reg(&dir);
        let mut req = request("/files/sub/");
        req.path_info_off = 6;
        let mut resp = Response::new();
        let mut ctx = TestCtx { secure: false };
        let result = SendfileHandler.on_select(&reg, &mut ctx, &mut req, &mut resp);
        assert_eq!(result, HandlerResult::Ok);
        assert_eq!(resp.content_type.as_deref(), Some("text/html"));
    }

    #[test]
    fn test_missing_file_passes_to_next_handler() {
        let dir = docroot();
        let reg = reg(&dir);
        let mut req = request("/files/absent.txt");
        req.path_info_off = 6;
        let mut resp = Response::new();
        let mut ctx = TestCtx { secure: false };
        assert_eq!(
            SendfileHandler.on_select(&reg, &mut ctx, &mut req, &mut resp),
            HandlerResult::Next
        );
    }

    #[test]
    fn test_escape_above_root_forbidden() {
        let dir = docroot();
        let reg = reg(&dir);
        let mut req = request("/files/%2e%2e/%2e%2e/etc/passwd");
        req.path_info_off = 6;
        let mut resp = Response::new();
        let mut ctx = TestCtx { secure: false };
        let result = SendfileHandler.on_select(&reg, &mut ctx, &mut req, &mut resp);
        assert_eq!(result, HandlerResult::Error);
        assert_eq!(resp.status_code, 403);
    }

    #[test]
    fn test_if_modified_since_yields_304() {
        let dir = docroot();
        let reg = reg(&dir);
        let mut req = request("/files/page.txt");
        req.path_info_off = 6;
        req.if_modified_since = Some(u64::max_value() / 2);
        let mut resp = Response::new();
        let mut ctx = TestCtx { secure: false };
        let result = SendfileHandler.on_select(&reg, &mut ctx, &mut req, &mut resp);
        assert_eq!(result, HandlerResult::Ok);
        assert_eq!(resp.status_code, 304);
    }

    #[test]
    fn test_cache_key_shape() {
        let reg = reg(std::path::Path::new("/tmp"));
        let mut req = request("/files/a%20b.txt");
        let mut resp = Response::new();
        let mut ctx = TestCtx { secure: true };
        assert_eq!(
            SendfileHandler.on_generate_cache_key(&reg, &mut ctx, &mut req, &mut resp),
            HandlerResult::Ok
        );
        // raw uri, host with the secure marker, file-path encoded
        assert_eq!(
            resp.cache_key.as_deref(),
            Some("files.test_s/files/a$2520b.txt")
        );
    }

    #[test]
    fn test_host_redirect() {
        let reg = HandlerBuilder::new("canonical", Arc::new(HostRedirectHandler))
            .uri("www.main.test")
            .build();
        let mut req = request("/some/page?x=1");
        let mut resp = Response::new();
        resp.init_from(&req);
        let mut ctx = TestCtx { secure: false };
        let result = HostRedirectHandler.on_headers(&reg, &mut ctx, &mut req, &mut resp);
        assert_eq!(result, HandlerResult::Error);
        assert_eq!(resp.status_code, 301);
        let loc = resp
            .extra_headers
            .iter()
            .find(|(n, _)| n == "Location")
            .map(|(_, v)| v.as_str())
            .unwrap();
        assert_eq!(loc, "http://www.main.test/some/page?x=1");
    }
}

//! Access log. Each request collects ordered fragments; on completion
//! they compose one line appended to the net thread's buffer. Buffers
//! flush to the global log file on gc, under a mutex held only for
//! the append.

use crate::http::{format_uid, Request, Response};
use lazy_static::lazy_static;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One ordered piece of a request's log record.
#[derive(Debug)]
pub struct Fragment {
    pub text: String,
}

/// Per-net-thread append-only line buffer. Unsynchronised; only its
/// owning thread touches it between flushes.
pub struct LogBuffer {
    lines: Vec<String>,
}

impl LogBuffer {
    pub fn new() -> LogBuffer {
        LogBuffer { lines: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    /// Flush buffered lines to the global log file.
    pub fn flush(&mut self) {
        if self.lines.is_empty() {
            return;
        }
        let mut log = ACCESS_LOG.lock().expect("access log mutex poisoned");
        if let Some(file) = log.file.as_mut() {
            for line in &self.lines {
                if writeln!(file, "{}", line).is_err() {
                    break;
                }
            }
        }
        self.lines.clear();
    }
}

struct AccessLog {
    path: Option<PathBuf>,
    file: Option<std::fs::File>,
}

lazy_static! {
    static ref ACCESS_LOG: Mutex<AccessLog> = Mutex::new(AccessLog {
        path: None,
        file: None,
    });
}

/// (Re)open the access log file. Also the SIGHUP/SIGUSR1 reopen path.
pub fn restart(path: Option<&Path>) {
    let mut log = ACCESS_LOG.lock().expect("access log mutex poisoned");
    if let Some(path) = path {
        log.path = Some(path.to_owned());
    }
    log.file = match log.path.as_ref() {
        Some(path) => OpenOptions::new().create(true).append(true).open(path).ok(),
        None => None,
    };
}

pub fn stop() {
    let mut log = ACCESS_LOG.lock().expect("access log mutex poisoned");
    log.file = None;
}

/// Record the arrival of a request.
pub fn on_request_received(req: &mut Request, iso_time: &str, remote_addr: &str) {
    let mut text = String::with_capacity(64);
    text.push_str(iso_time);
    text.push(' ');
    text.push_str(remote_addr);
    text.push(' ');
    text.push_str(&format_uid(req.uid));
    text.push(' ');
    text.push_str(req.method());
    text.push(' ');
    text.push_str(req.host());
    text.push_str(req.uri());
    req.log_fragments.push(Fragment { text });
}

/// Annotate the record with the backend's clock delta when a proxied
/// response came back.
pub fn on_proxy_response(req: &mut Request, backend_time_delta: i64) {
    req.log_fragments.push(Fragment {
        text: format!("be_delta={}s", backend_time_delta),
    });
}

/// Compose the request's fragments into its final line and hand it to
/// the thread buffer.
pub fn on_request_complete(
    buf: &mut LogBuffer,
    req: &mut Request,
    resp: &Response,
    loop_time: u64,
) {
    let duration = loop_time.saturating_sub(req.received_time);
    let mut line = String::with_capacity(96);
    for (i, frag) in req.log_fragments.drain(..).enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&frag.text);
    }
    line.push_str(&format!(
        " {} {} {}us",
        if resp.status_code != 0 { resp.status_code } else { 200 },
        resp.bytes_sent,
        duration
    ));
    buf.push(line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parse::parse_http_request;

    fn request() -> Request {
        let mut req = Request::new();
        parse_http_request(&mut req, b"GET /page?x=1 HTTP/1.1\r\nHost: site\r\n").unwrap();
        req.uid = 0x0100_0000_0000_0001;
        req.received_time = 1_000;
        req
    }

    #[test]
    fn test_line_composition() {
        let mut req = request();
        let mut resp = Response::new();
        resp.status_code = 200;
        resp.bytes_sent = 512;

        on_request_received(&mut req, "2012-01-24T13:05:54", "10.1.2.3");
        on_proxy_response(&mut req, -2);
        let mut buf = LogBuffer::new();
        on_request_complete(&mut buf, &mut req, &resp, 3_500);

        assert_eq!(buf.len(), 1);
        let line = &buf.lines[0];
        assert!(line.starts_with("2012-01-24T13:05:54 10.1.2.3 0100000000000001 GET site/page?x=1"));
        assert!(line.contains("be_delta=-2s"));
        assert!(line.ends_with("200 512 2500us"));
    }

    #[test]
    fn test_flush_lifecycle() {
        // single test owns the global writer to avoid cross-test races
        let dir = std::env::temp_dir().join("nxweb-access-log-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("access.log");
        std::fs::remove_file(&path).ok();

        restart(Some(&path));
        let mut buf = LogBuffer::new();
        buf.push("line one".to_owned());
        buf.push("line two".to_owned());
        buf.flush();
        assert_eq!(buf.len(), 0);

        // flush order is append-only
        buf.push("line three".to_owned());
        buf.flush();
        stop();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "line one\nline two\nline three\n");

        // with the writer stopped, buffered lines are dropped
        buf.push("orphan".to_owned());
        buf.flush();
        assert_eq!(buf.len(), 0);
        std::fs::remove_file(&path).ok();
    }
}

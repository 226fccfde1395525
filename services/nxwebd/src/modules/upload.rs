use nxweb::error::HandlerResult;
use nxweb::http::{Request, Response};
use nxweb::server::handler::{Handler, HandlerReg};

/// Accepts a request body buffered to memory and reports what
/// arrived. Runs in a worker: a real upload handler would hit disk.
pub struct UploadHandler;

impl Handler for UploadHandler {
    fn on_request(&self, _reg: &HandlerReg, req: &mut Request, resp: &mut Response) -> HandlerResult {
        resp.start_body();
        resp.append_body("<html><body><h1>Upload complete</h1>\n<p>received ");
        resp.append_body(&req.content_received.to_string());
        resp.append_body(" bytes</p>\n</body></html>");
        resp.finish_body("text/html");
        HandlerResult::Ok
    }
}

/// Echoes the buffered request body back verbatim.
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn on_request(&self, _reg: &HandlerReg, req: &mut Request, resp: &mut Response) -> HandlerResult {
        let content_type = req
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_owned();
        let body = req.content.clone();
        resp.send_data(&body, &content_type);
        HandlerResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxweb::http::parse::parse_http_request;
    use nxweb::server::handler::HandlerBuilder;
    use std::sync::Arc;

    #[test]
    fn test_upload_reports_size() {
        let reg = HandlerBuilder::new("upload", Arc::new(UploadHandler)).build();
        let mut req = Request::new();
        req.content = vec![0u8; 123];
        req.content_received = 123;
        let mut resp = Response::new();
        UploadHandler.on_request(&reg, &mut req, &mut resp);
        let body = std::str::from_utf8(resp.content_bytes().unwrap()).unwrap();
        assert!(body.contains("received 123 bytes"));
    }

    #[test]
    fn test_echo_returns_body() {
        let reg = HandlerBuilder::new("echo", Arc::new(EchoHandler)).build();
        let mut req = Request::new();
        parse_http_request(
            &mut req,
            b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n",
        )
        .unwrap();
        req.content = b"HELLO".to_vec();
        req.content_received = 5;
        let mut resp = Response::new();
        EchoHandler.on_request(&reg, &mut req, &mut resp);
        assert_eq!(resp.content_bytes().unwrap(), b"HELLO");
        assert_eq!(resp.content_type.as_deref(), Some("text/plain"));
        assert_eq!(resp.content_length, 5);
    }
}

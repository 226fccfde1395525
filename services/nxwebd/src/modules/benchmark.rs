use nxweb::error::HandlerResult;
use nxweb::http::{Request, Response};
use nxweb::server::handler::{Handler, HandlerReg};

const BODY: &[u8] = b"<p>Hello, world!</p>";

/// Minimal fixed-body handler for load testing the engine itself.
/// Registered twice: in-process and in-worker.
pub struct BenchmarkHandler;

impl Handler for BenchmarkHandler {
    fn on_request(&self, _reg: &HandlerReg, _req: &mut Request, resp: &mut Response) -> HandlerResult {
        resp.send_data(BODY, "text/html");
        HandlerResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxweb::server::handler::HandlerBuilder;
    use std::sync::Arc;

    #[test]
    fn test_fixed_body() {
        let reg = HandlerBuilder::new("benchmark", Arc::new(BenchmarkHandler)).build();
        let mut req = Request::new();
        let mut resp = Response::new();
        BenchmarkHandler.on_request(&reg, &mut req, &mut resp);
        assert_eq!(resp.content_bytes().unwrap(), BODY);
        assert_eq!(resp.content_length as usize, BODY.len());
    }
}

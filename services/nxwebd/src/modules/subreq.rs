use nxweb::error::HandlerResult;
use nxweb::http::{Request, Response};
use nxweb::server::handler::{Handler, HandlerCtx, HandlerReg};

/// Composite page: static top, a spliced-in subrequest to /hello, a
/// static bottom. The body streams in strict node order; the response
/// itself is deferred (`Async`) until the subrequest reports in.
pub struct SubreqHandler;

impl Handler for SubreqHandler {
    fn on_headers(
        &self,
        _reg: &HandlerReg,
        ctx: &mut dyn HandlerCtx,
        _req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        ctx.composite_start();
        ctx.composite_append_bytes(
            b"<html><head><title>composite</title></head><body>\n<!-- begin -->\n",
        );
        ctx.composite_append_subrequest(None, "/hello");
        ctx.composite_append_bytes(b"\n<!-- end -->\n</body></html>");
        ctx.composite_close();
        resp.set_content_type("text/html");
        HandlerResult::Ok
    }

    fn on_request(&self, _reg: &HandlerReg, _req: &mut Request, _resp: &mut Response) -> HandlerResult {
        // headers go out once the spliced subrequest has a response
        HandlerResult::Async
    }
}

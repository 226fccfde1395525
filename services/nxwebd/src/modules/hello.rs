use nxweb::error::HandlerResult;
use nxweb::http::{Request, Response};
use nxweb::server::handler::{Handler, HandlerReg};

/// Sample page handler: greets by the `name` query parameter and
/// echoes some request details.
pub struct HelloHandler;

impl Handler for HelloHandler {
    fn on_request(&self, _reg: &HandlerReg, req: &mut Request, resp: &mut Response) -> HandlerResult {
        let name = req.parameter("name").unwrap_or("world").to_owned();
        let user_agent = req.user_agent().unwrap_or("-").to_owned();
        let uri = req.uri().to_owned();

        resp.start_body();
        resp.append_body("<html><head><title>Hello</title></head><body>\n<h1>Hello, ");
        resp.append_body_html_escaped(&name);
        resp.append_body("!</h1>\n<p>uri: ");
        resp.append_body_html_escaped(&uri);
        resp.append_body("</p>\n<p>user-agent: ");
        resp.append_body_html_escaped(&user_agent);
        resp.append_body("</p>\n</body></html>");
        resp.finish_body("text/html");
        resp.set_charset("utf-8");
        HandlerResult::Ok
    }
}

//! Connection layer: binds a socket to a server protocol instance,
//! dispatches parsed requests through the handler/filter chain, and
//! orchestrates body handling, worker offload, subrequests and proxy
//! bridging.

use super::handler::{
    flags, host_without_port, url_prefix_match, vhost_match, FilterData, HandlerCtx, HandlerReg,
};
use super::proto::{HttpServerProto, ProtoError, ProtoState};
use super::{close_is_good, ConnAction, Ctx, Stimulus};
use crate::access_log;
use crate::buffer::Buffer;
use crate::cache::{cache_store_response, cache_try};
use crate::error::{HandlerResult, NetError, StreamError};
use crate::event::{Message, TimerHandle, TimerKind};
use crate::http::parse::{parse_request_cookies, parse_request_parameters};
use crate::http::{Content, Request, Response};
use crate::logging;
use crate::stream::{BodySink, PipeId, Streamer};
use mio::net::TcpStream;
use mio::Token;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};

/// Outstanding proxied request bookkeeping on the parent connection.
struct ProxyClient {
    pool_idx: usize,
    pipe: PipeId,
    retries: u32,
}

pub struct HttpServerConnection {
    sock: Option<TcpStream>,
    pub remote_addr: String,
    pub secure: bool,
    pub proto: HttpServerProto,
    in_buf: Buffer,
    out_buf: Buffer,

    pub handler: Option<Arc<HandlerReg>>,
    filter_data: Vec<Option<FilterData>>,

    pub uid: u64,
    pub connected_time: u64,
    req_host: String,

    pub in_worker: bool,
    closing: bool,
    close_after_send: bool,
    response_started: bool,
    read_closed: bool,
    worker_return: Option<Arc<Mutex<Option<(Request, Response)>>>>,

    pub idle_timer: Option<TimerHandle>,
    read_timer: Option<TimerHandle>,
    write_timer: Option<TimerHandle>,
    cont100_timer: Option<TimerHandle>,

    // subrequest plumbing
    pub parent: Option<Token>,
    subrequests: Vec<Token>,
    response_pipe: Option<PipeId>,
    pub subrequest_failed: bool,

    // handler-callback capture slots
    pending_sink: Option<Box<dyn BodySink>>,
    pending_streamer: Option<Streamer>,

    proxy: Option<ProxyClient>,
}

fn set_cork(sock: &TcpStream, on: bool) {
    let flag: libc::c_int = if on { 1 } else { 0 };
    unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &flag as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

struct DispatchCtx<'a, 'c> {
    ctx: &'a mut Ctx<'c>,
    token: Token,
    secure: bool,
    remote_addr: &'a str,
    req_host: &'a str,
    uid: u64,
    root_uid: u64,
    pending_sink: &'a mut Option<Box<dyn BodySink>>,
    streamer: &'a mut Option<Streamer>,
    subrequests: &'a mut Vec<Token>,
}

impl<'a, 'c> HandlerCtx for DispatchCtx<'a, 'c> {
    fn secure(&self) -> bool {
        self.secure
    }

    fn remote_addr(&self) -> &str {
        self.remote_addr
    }

    fn http_time(&self) -> u64 {
        self.ctx.lp.http_time()
    }

    fn loop_time(&self) -> u64 {
        self.ctx.lp.current_time
    }

    fn connect_request_body_out(&mut self, sink: Box<dyn BodySink>) {
        *self.pending_sink = Some(sink);
    }

    fn composite_start(&mut self) {
        *self.streamer = Some(Streamer::new());
    }

    fn composite_append_bytes(&mut self, data: &[u8]) {
        if let Some(streamer) = self.streamer.as_mut() {
            streamer.append_bytes(data.to_vec());
        }
    }

    fn composite_append_file(
        &mut self,
        path: &std::path::Path,
        offset: u64,
        end: u64,
    ) -> std::io::Result<()> {
        let meta = crate::http::FileMeta::from_std(&std::fs::metadata(path)?);
        if let Some(streamer) = self.streamer.as_mut() {
            streamer.append_file(crate::stream::FileWindow::new(
                path.to_owned(),
                offset,
                end,
                meta,
            ));
        }
        Ok(())
    }

    fn composite_append_subrequest(&mut self, host: Option<&str>, uri: &str) {
        let pipe = self.ctx.pipes.create(crate::RBUF_SIZE);
        let child = self.ctx.spawn_subrequest(
            self.token,
            host,
            uri,
            self.uid,
            self.root_uid,
            self.req_host,
            self.remote_addr,
            self.secure,
            pipe,
        );
        if let Some(streamer) = self.streamer.as_mut() {
            streamer.append_pipe(pipe);
        }
        self.subrequests.push(child);
    }

    fn composite_close(&mut self) {
        if let Some(streamer) = self.streamer.as_mut() {
            streamer.close();
        }
    }
}

/// Builds the per-callback context; keeps the seven call sites in
/// sync.
macro_rules! dispatch_ctx {
    ($conn:expr, $ctx:expr, $token:expr, $req:expr) => {
        DispatchCtx {
            ctx: &mut *$ctx,
            token: $token,
            secure: $conn.secure,
            remote_addr: &$conn.remote_addr,
            req_host: &$conn.req_host,
            uid: $req.uid,
            root_uid: $req.root_uid,
            pending_sink: &mut $conn.pending_sink,
            streamer: &mut $conn.pending_streamer,
            subrequests: &mut $conn.subrequests,
        }
    };
}

impl HttpServerConnection {
    pub fn new(
        sock: TcpStream,
        remote_addr: String,
        secure: bool,
        in_buf: Buffer,
        out_buf: Buffer,
    ) -> HttpServerConnection {
        HttpServerConnection::build(Some(sock), remote_addr, secure, in_buf, out_buf)
    }

    fn build(
        sock: Option<TcpStream>,
        remote_addr: String,
        secure: bool,
        in_buf: Buffer,
        out_buf: Buffer,
    ) -> HttpServerConnection {
        HttpServerConnection {
            sock,
            remote_addr,
            secure,
            proto: HttpServerProto::new(),
            in_buf,
            out_buf,
            handler: None,
            filter_data: Vec::new(),
            uid: 0,
            connected_time: 0,
            req_host: String::new(),
            in_worker: false,
            closing: false,
            close_after_send: false,
            response_started: false,
            read_closed: false,
            worker_return: None,
            idle_timer: None,
            read_timer: None,
            write_timer: None,
            cont100_timer: None,
            parent: None,
            subrequests: Vec::new(),
            response_pipe: None,
            subrequest_failed: false,
            pending_sink: None,
            pending_streamer: None,
            proxy: None,
        }
    }

    /// In-process child connection: no socket, request fields filled
    /// directly, response body routed into `pipe`.
    pub fn subrequest(
        parent: Token,
        host: &str,
        uri: &str,
        remote_addr: &str,
        secure: bool,
        pipe: PipeId,
    ) -> HttpServerConnection {
        let mut conn = HttpServerConnection::build(
            None,
            remote_addr.to_owned(),
            secure,
            Buffer::new(crate::RBUF_SIZE),
            Buffer::new(crate::RBUF_SIZE),
        );
        conn.parent = Some(parent);
        conn.response_pipe = Some(pipe);
        conn.proto = HttpServerProto::subrequest();
        let req = &mut conn.proto.req;
        req.set_method("GET");
        req.set_uri(uri);
        req.set_host(host);
        req.http11 = true;
        req.keep_alive = false;
        req.get_method = true;
        req.is_subrequest = true;
        conn.proto.resp.init_from(&conn.proto.req);
        conn
    }

    pub fn register(&self, lp: &crate::event::EventLoop, token: Token) -> std::io::Result<()> {
        let sock = self.sock.as_ref().expect("registering a subrequest conn");
        lp.register(sock, token, crate::event::EventLoop::interest_rw())
    }

    pub fn subrequest_tokens(&self) -> Vec<Token> {
        self.subrequests.clone()
    }

    fn cancel_timers(&mut self, ctx: &mut Ctx) {
        for handle in [
            self.idle_timer.take(),
            self.read_timer.take(),
            self.write_timer.take(),
            self.cont100_timer.take(),
        ]
        .iter_mut()
        {
            if let Some(handle) = handle.take() {
                ctx.lp.unset_timer(handle);
            }
        }
    }

    /// Single delivery entry point.
    pub fn handle(&mut self, ctx: &mut Ctx, token: Token, stimulus: &Stimulus) -> ConnAction {
        match stimulus {
            Stimulus::Io(readiness) => {
                if readiness.readable {
                    if let Some(action) = self.read_pump(ctx, token) {
                        return action;
                    }
                }
                if readiness.writable {
                    if let Some(action) = self.write_pump(ctx, token) {
                        return action;
                    }
                }
                if readiness.error {
                    return self.on_error(ctx, token, StreamError::Error);
                }
                if readiness.hup && !readiness.readable {
                    return self.on_error(ctx, token, StreamError::Hup);
                }
                ConnAction::Keep
            }
            Stimulus::Msg(msg) => self.on_message(ctx, token, *msg),
        }
    }

    fn on_message(&mut self, ctx: &mut Ctx, token: Token, msg: Message) -> ConnAction {
        match msg {
            Message::RequestReceived => {
                self.on_request_received(ctx, token);
                ConnAction::Keep
            }
            Message::RequestBodyReceived => {
                self.on_request_body_received(ctx, token);
                ConnAction::Keep
            }
            Message::Dispatch => {
                // scheduled subrequest dispatch
                self.on_request_received(ctx, token);
                ConnAction::Keep
            }
            Message::ResponseReady => {
                // subrequest response head is ready; tell the parent
                // and start pumping the body into the pipe
                if let Some(parent) = self.parent {
                    ctx.lp
                        .post(parent, Message::SubrequestDone { sub: token, ok: true });
                }
                self.pump_subrequest_body(ctx, token)
            }
            Message::RequestComplete => ConnAction::Keep,
            Message::SubrequestDone { sub: _, ok } => {
                if !ok {
                    self.subrequest_failed = true;
                }
                if !self.response_started {
                    // the handler answered Async and left the response
                    // to its children; the first one to report in
                    // starts it
                    self.start_sending_response(ctx, token);
                }
                // whatever the child produced (or its error
                // placeholder) may now be streamable
                self.write_or_pipe_pump(ctx, token)
                    .unwrap_or(ConnAction::Keep)
            }
            Message::ContentAvailable | Message::ContentConsumed => self
                .write_or_pipe_pump(ctx, token)
                .unwrap_or(ConnAction::Keep),
            Message::WorkerComplete => self.on_worker_complete(ctx, token),
            Message::BackendResponse { proxy } => {
                self.on_backend_response(ctx, token, proxy);
                ConnAction::Keep
            }
            Message::BackendFailed { proxy: _, timeout } => {
                self.on_backend_failed(ctx, token, timeout)
            }
            Message::Timeout(kind) => self.on_timeout(ctx, token, kind),
            Message::Error(err) => self.on_error(ctx, token, err),
            Message::Gc => ConnAction::Keep,
        }
    }

    fn on_timeout(&mut self, ctx: &mut Ctx, token: Token, kind: TimerKind) -> ConnAction {
        let err = match kind {
            TimerKind::KeepAlive => {
                self.idle_timer = None;
                StreamError::KeepAliveTimeout
            }
            TimerKind::Read => {
                self.read_timer = None;
                StreamError::ReadTimeout
            }
            TimerKind::Write => {
                self.write_timer = None;
                StreamError::WriteTimeout
            }
            TimerKind::Continue100 => {
                self.cont100_timer = None;
                StreamError::ContinueTimeout
            }
            _ => return ConnAction::Keep,
        };
        self.on_error(ctx, token, err)
    }

    fn on_error(&mut self, ctx: &mut Ctx, token: Token, err: StreamError) -> ConnAction {
        if self.parent.is_some() {
            return self.fail_subrequest(ctx, token);
        }
        if let Some(reg) = self.handler.clone() {
            let handler = reg.handler.clone();
            let req = &mut self.proto.req;
            let resp = &mut self.proto.resp;
            let mut dctx = dispatch_ctx!(self, ctx, token, req);
            handler.on_error(&reg, &mut dctx, req, resp);
        }
        let good = close_is_good(err, self.proto.headers_bytes_received)
            || err == StreamError::KeepAliveTimeout;
        if !good {
            logging::warn!(ctx.log, "connection error";
                           "err" => ?err,
                           "request_count" => self.proto.request_count);
        }
        self.cancel_timers(ctx);
        if self.in_worker {
            // teardown deferred until the worker reports back
            self.closing = true;
            return ConnAction::Keep;
        }
        ConnAction::Close { good }
    }

    // ---- input path ----

    fn read_pump(&mut self, ctx: &mut Ctx, token: Token) -> Option<ConnAction> {
        if self.sock.is_none() || self.read_closed {
            return None;
        }
        loop {
            let (received, eof) = {
                let sock = self.sock.as_mut().expect("checked above");
                match self.in_buf.ingress(sock) {
                    Ok(result) => result,
                    Err(_) => return Some(self.on_error(ctx, token, StreamError::Error)),
                }
            };

            if received > 0 {
                self.process_input(ctx, token);
            }
            if eof {
                self.read_closed = true;
                let pre_headers = self.proto.state == ProtoState::Waiting
                    && self.proto.headers_bytes_received == 0;
                if pre_headers {
                    return Some(ConnAction::Close { good: true });
                }
                if self.proto.receiving() {
                    return Some(self.on_error(ctx, token, StreamError::RdClosed));
                }
                // read side closed while a response is in flight;
                // finish writing then close
                self.close_after_send = true;
                return None;
            }
            if received == 0 {
                return None;
            }
            if self.in_buf.free_capacity() == 0 {
                // backpressure: keep bytes queued until the protocol
                // is ready to consume them again
                return None;
            }
        }
    }

    /// Feed buffered input to the protocol, posting its events.
    fn process_input(&mut self, ctx: &mut Ctx, token: Token) {
        let mut events = Vec::new();
        loop {
            if self.in_buf.is_empty() {
                break;
            }
            let consumed = match self.proto.feed(self.in_buf.read_slice(), &mut events) {
                Ok(consumed) => consumed,
                Err(perr) => {
                    for msg in events.drain(..) {
                        ctx.lp.post(token, msg);
                    }
                    self.protocol_error(ctx, token, perr);
                    return;
                }
            };
            if consumed == 0 {
                break;
            }
            self.in_buf.consume(consumed);
            // first body bytes end the 100-continue wait
            if self.proto.req.content_received > 0 {
                if let Some(handle) = self.cont100_timer.take() {
                    ctx.lp.unset_timer(handle);
                }
            }
        }
        for msg in events {
            ctx.lp.post(token, msg);
        }
    }

    fn protocol_error(&mut self, ctx: &mut Ctx, token: Token, perr: ProtoError) {
        let (code, message) = perr.status();
        logging::warn!(ctx.log, "protocol error";
                       "status" => code,
                       "err" => ?perr);
        self.proto.resp.send_http_error(code, message);
        self.proto.resp.keep_alive = false;
        self.close_after_send = true;
        self.start_sending_response(ctx, token);
    }

    // ---- request lifecycle ----

    fn on_request_received(&mut self, ctx: &mut Ctx, token: Token) {
        if self.closing {
            return;
        }
        if let Some(handle) = self.idle_timer.take() {
            ctx.lp.unset_timer(handle);
        }

        if self.proto.req.uid == 0 {
            self.proto.req.uid = ctx.generate_uid();
        }
        if self.proto.req.received_time == 0 {
            self.proto.req.received_time = ctx.lp.current_time;
        }
        self.req_host = self.proto.req.host().to_owned();

        // normalise dot segments before dispatch; the query string is
        // left untouched
        if !self.normalize_uri() {
            self.protocol_error(ctx, token, ProtoError::BadRequest);
            return;
        }

        {
            let iso = ctx.lp.iso8601_time_str().to_owned();
            access_log::on_request_received(&mut self.proto.req, &iso, &self.remote_addr);
        }

        self.dispatch_request(ctx, token);
        if self.response_started {
            return;
        }

        let reg = match self.handler.clone() {
            Some(reg) => reg,
            None => return,
        };

        // method allowed by the selected handler's flags?
        if reg.flags & flags::HANDLE_MASK != 0 {
            let req = &self.proto.req;
            let method_ok = (req.get_method && reg.flags & flags::HANDLE_GET != 0)
                || (req.post_method && reg.flags & flags::HANDLE_POST != 0)
                || (req.other_method && reg.flags & flags::HANDLE_OTHER != 0);
            let body_ok = req.content_length == 0 || reg.accepts_content();
            if !method_ok || !body_ok {
                self.proto.resp.send_http_error(405, "Method Not Allowed");
                if self.proto.req.content_length != 0 {
                    self.proto.resp.keep_alive = false; // body pending
                }
                self.start_sending_response(ctx, token);
                return;
            }
        }

        let handler = reg.handler.clone();
        let result = {
            let req = &mut self.proto.req;
            let resp = &mut self.proto.resp;
            let mut dctx = dispatch_ctx!(self, ctx, token, req);
            handler.on_headers(&reg, &mut dctx, req, resp)
        };
        self.apply_pending();
        if result != HandlerResult::Ok {
            if self.proto.req.content_length != 0 {
                self.proto.resp.keep_alive = false;
            }
            self.start_sending_response(ctx, token);
            return;
        }
        if self.response_started {
            return;
        }

        if self.proto.req.content_length != 0 {
            let handler = reg.handler.clone();
            {
                let req = &mut self.proto.req;
                let resp = &mut self.proto.resp;
                let mut dctx = dispatch_ctx!(self, ctx, token, req);
                handler.on_post_data(&reg, &mut dctx, req, resp);
            }
            self.apply_pending();
            if self.response_started {
                return;
            }
            if !self.proto.body_out_connected()
                && self.proto.req.content_length > crate::MAX_REQUEST_BODY_SIZE as i64
            {
                self.proto
                    .resp
                    .send_http_error(413, "Request Entity Too Large");
                self.proto.resp.keep_alive = false;
                self.start_sending_response(ctx, token);
                return;
            }
            self.proto.start_receiving_request_body();
            if self.proto.req.sending_100_continue {
                self.cont100_timer = Some(ctx.lp.set_timer(TimerKind::Continue100, token));
                self.kick_write(ctx, token);
            } else {
                self.read_timer = Some(ctx.lp.set_timer(TimerKind::Read, token));
            }
            // body bytes may already be buffered
            self.process_input(ctx, token);
        } else {
            self.invoke_request_handler(ctx, token, &reg);
        }
    }

    fn normalize_uri(&mut self) -> bool {
        let uri = self.proto.req.uri();
        if !uri.contains("/.") {
            return true;
        }
        let path_end = uri.find(|c| c == '?' || c == ';').unwrap_or(uri.len());
        let (path, tail) = uri.split_at(path_end);
        let tail = tail.to_owned();
        let mut path_bytes = path.as_bytes().to_vec();
        let new_len = match crate::http::uri::remove_dots_from_uri_path(&mut path_bytes) {
            Some(len) => len,
            None => return false,
        };
        path_bytes.truncate(new_len);
        let mut rebuilt = String::from_utf8(path_bytes).unwrap_or_default();
        rebuilt.push_str(&tail);
        self.proto.req.set_uri(&rebuilt);
        true
    }

    fn on_request_body_received(&mut self, ctx: &mut Ctx, token: Token) {
        if let Some(handle) = self.read_timer.take() {
            ctx.lp.unset_timer(handle);
        }
        if let Some(handle) = self.cont100_timer.take() {
            ctx.lp.unset_timer(handle);
        }
        let reg = match self.handler.clone() {
            Some(reg) => reg,
            None => return,
        };
        let handler = reg.handler.clone();
        {
            let req = &mut self.proto.req;
            let resp = &mut self.proto.resp;
            let mut dctx = dispatch_ctx!(self, ctx, token, req);
            handler.on_post_data_complete(&reg, &mut dctx, req, resp);
        }
        self.apply_pending();
        if !self.response_started {
            self.invoke_request_handler(ctx, token, &reg);
        }
    }

    /// Move captured callback results into the protocol/response.
    fn apply_pending(&mut self) {
        if let Some(sink) = self.pending_sink.take() {
            self.proto.connect_request_body_out(sink);
        }
        if let Some(streamer) = self.pending_streamer.take() {
            if self.proto.resp.content.is_none() {
                self.proto.resp.content = Content::Streamer(streamer);
                self.proto.resp.content_length = -1;
            }
        }
    }

    fn invoke_request_handler(&mut self, ctx: &mut Ctx, token: Token, reg: &Arc<HandlerReg>) {
        if self.closing {
            return;
        }
        if reg.flags & flags::PARSE_PARAMETERS != 0 {
            parse_request_parameters(&mut self.proto.req);
        }
        if reg.flags & flags::PARSE_COOKIES != 0 {
            parse_request_cookies(&mut self.proto.req);
        }

        if reg.proxy_pool.is_some() {
            self.start_proxy_request(ctx, token, reg);
            return;
        }

        if reg.in_worker() {
            self.offload_to_worker(ctx, token, reg);
            return;
        }

        let handler = reg.handler.clone();
        let result = handler.on_request(reg, &mut self.proto.req, &mut self.proto.resp);
        self.apply_pending();
        HttpServerProto::finish_response(&mut self.proto.resp);
        if result != HandlerResult::Async {
            self.start_sending_response(ctx, token);
        }
    }

    // ---- worker offload ----

    fn offload_to_worker(&mut self, ctx: &mut Ctx, token: Token, reg: &Arc<HandlerReg>) {
        let (widx, fresh) = match ctx.factory.acquire() {
            Some(acquired) => acquired,
            None => {
                self.proto.resp.send_http_error(503, "Service Unavailable");
                self.start_sending_response(ctx, token);
                return;
            }
        };
        if fresh {
            let wake_token = ctx.objects.insert(super::LoopEntry::WorkerWake(widx));
            if ctx
                .lp
                .register(
                    ctx.factory.registration(widx),
                    wake_token,
                    mio::Ready::readable(),
                )
                .is_err()
            {
                self.proto.resp.send_http_error(503, "Service Unavailable");
                self.start_sending_response(ctx, token);
                return;
            }
        }

        let req = std::mem::replace(&mut self.proto.req, Request::new());
        let resp = std::mem::replace(&mut self.proto.resp, Response::new());
        let slot: Arc<Mutex<Option<(Request, Response)>>> = Arc::new(Mutex::new(None));
        self.worker_return = Some(slot.clone());
        let job_reg = reg.clone();
        let job = Box::new(move || {
            let mut req = req;
            let mut resp = resp;
            let handler = job_reg.handler.clone();
            handler.on_request(&job_reg, &mut req, &mut resp);
            HttpServerProto::finish_response(&mut resp);
            *slot.lock().expect("worker slot mutex") = Some((req, resp));
        });
        self.in_worker = true;
        ctx.factory.start_job(widx, token, job);
    }

    fn on_worker_complete(&mut self, ctx: &mut Ctx, token: Token) -> ConnAction {
        self.in_worker = false;
        if let Some(slot) = self.worker_return.take() {
            if let Some((req, resp)) = slot.lock().expect("worker slot mutex").take() {
                self.proto.req = req;
                self.proto.resp = resp;
            }
        }
        if self.closing {
            return ConnAction::Close { good: false };
        }
        self.start_sending_response(ctx, token);
        ConnAction::Keep
    }

    // ---- dispatch & selection ----

    fn dispatch_request(&mut self, ctx: &mut Ctx, token: Token) {
        let secure = self.secure;
        let registry: Vec<Arc<HandlerReg>> = ctx.runtime.registry.iter().cloned().collect();
        for reg in registry {
            if secure && reg.flags & flags::INSECURE_ONLY != 0 {
                continue;
            }
            if !secure && reg.flags & flags::SECURE_ONLY != 0 {
                continue;
            }
            if reg.flags & flags::HANDLE_MASK != 0 {
                let req = &self.proto.req;
                let allowed = (req.get_method && reg.flags & flags::HANDLE_GET != 0)
                    || (req.post_method && reg.flags & flags::HANDLE_POST != 0)
                    || (req.other_method && reg.flags & flags::HANDLE_OTHER != 0);
                if !allowed {
                    continue;
                }
            }
            if let Some(vhost) = reg.vhost.as_deref() {
                let host = host_without_port(self.proto.req.host());
                if host.is_empty() || !vhost_match(host, vhost) {
                    continue;
                }
            }
            if let Some(prefix) = reg.prefix.as_deref() {
                if !prefix.is_empty() && !url_prefix_match(self.proto.req.uri(), prefix) {
                    continue;
                }
            }
            match self.select_handler(ctx, token, &reg) {
                HandlerResult::Next => continue,
                HandlerResult::Error => {
                    // request processing terminated by an error page
                    if self.proto.req.content_length != 0 {
                        self.proto.resp.keep_alive = false;
                    }
                    self.start_sending_response(ctx, token);
                    return;
                }
                HandlerResult::Ok => return,
                other => {
                    logging::error!(ctx.log, "handler on_select() returned unexpected result";
                                    "handler" => reg.name, "result" => ?other);
                    break;
                }
            }
        }

        // no handler claimed the request: built-in 404
        self.proto.req.path_info_off = 0;
        let default = ctx.runtime.default_handler.clone();
        self.handler = Some(default.clone());
        self.filter_data.clear();
        let handler = default.handler.clone();
        let result = {
            let req = &mut self.proto.req;
            let resp = &mut self.proto.resp;
            let mut dctx = dispatch_ctx!(self, ctx, token, req);
            handler.on_headers(&default, &mut dctx, req, resp)
        };
        if result != HandlerResult::Ok {
            if self.proto.req.content_length != 0 {
                self.proto.resp.keep_alive = false;
            }
            self.start_sending_response(ctx, token);
        }
    }

    fn select_handler(
        &mut self,
        ctx: &mut Ctx,
        token: Token,
        reg: &Arc<HandlerReg>,
    ) -> HandlerResult {
        self.handler = Some(reg.clone());
        // selection can run several times; keep the fields it touches
        // restorable
        let saved_uri = self.proto.req.uri().to_owned();
        let saved_ims = self.proto.req.if_modified_since;

        // init filters
        self.filter_data.clear();
        for filter in &reg.filters {
            self.filter_data
                .push(filter.init(&self.proto.req, &self.proto.resp));
        }

        // let filters decode the uri, last to first
        let mut decoded: Option<String> = None;
        for i in (0..reg.filters.len()).rev() {
            let current = decoded
                .clone()
                .unwrap_or_else(|| self.proto.req.uri().to_owned());
            if let Some(fdata) = self.filter_data[i].as_mut() {
                if fdata.bypass {
                    continue;
                }
                if let Some(rewritten) = reg.filters[i].decode_uri(fdata, &current) {
                    decoded = Some(rewritten);
                }
            }
        }
        if let Some(uri) = decoded {
            if reg.prefix_len() > 0 && !url_prefix_match(&uri, reg.prefix.as_deref().unwrap_or(""))
            {
                logging::error!(ctx.log, "uri doesn't match prefix after decode";
                                "uri" => %uri, "handler" => reg.name);
            }
            self.proto.req.set_uri(&uri);
        }
        self.proto.req.path_info_off = reg.prefix_len() as u32;

        // cache phase; POST requests are not cacheable
        if self.proto.req.get_method && self.proto.req.content_length == 0 {
            let keygen = {
                let handler = reg.handler.clone();
                let req = &mut self.proto.req;
                let resp = &mut self.proto.resp;
                let mut dctx = dispatch_ctx!(self, ctx, token, req);
                handler.on_generate_cache_key(reg, &mut dctx, req, resp)
            };
            if keygen == HandlerResult::Next {
                self.unselect_handler(reg, &saved_uri, saved_ims);
                return HandlerResult::Next;
            }
            let has_key = self
                .proto
                .resp
                .cache_key
                .as_deref()
                .map(|k| !k.is_empty())
                .unwrap_or(false);
            if has_key {
                // each filter extends the key with its own
                // differentiators
                let mut key = self.proto.resp.cache_key.clone().expect("checked above");
                for i in 0..reg.filters.len() {
                    if let Some(fdata) = self.filter_data[i].as_mut() {
                        if fdata.bypass {
                            continue;
                        }
                        if reg.filters[i].translate_cache_key(&self.proto.req, fdata, &key)
                            == HandlerResult::Ok
                        {
                            key = fdata
                                .cache_key
                                .clone()
                                .expect("filter set a translated key");
                        }
                    }
                }
                self.proto.resp.cache_key = Some(key.clone());

                if reg.memcache {
                    let res = cache_try(
                        &mut self.proto.resp,
                        &key,
                        self.proto.req.if_modified_since,
                        None,
                        ctx.lp.current_time,
                    );
                    if res == HandlerResult::Ok {
                        self.start_sending_response(ctx, token);
                        return HandlerResult::Ok;
                    }
                    if res == HandlerResult::Revalidate {
                        // fall through; the filter caches revalidate
                    } else if res != HandlerResult::Miss {
                        return res;
                    }
                }

                // a filter may have already determined last_modified
                if let (Some(lm), Some(ims)) = (
                    self.proto.resp.last_modified,
                    self.proto.req.if_modified_since,
                ) {
                    if lm <= ims {
                        self.proto.resp.status_code = 304;
                        self.proto.resp.status = Some("Not Modified".to_owned());
                        self.start_sending_response(ctx, token);
                        return HandlerResult::Ok;
                    }
                }

                // serve from filter caches, last to first
                let check_time = self
                    .proto
                    .resp
                    .last_modified
                    .unwrap_or_else(|| ctx.lp.http_time());
                for i in (0..reg.filters.len()).rev() {
                    let served = match self.filter_data[i].as_mut() {
                        Some(fdata) if !fdata.bypass => reg.filters[i].serve_from_cache(
                            &mut self.proto.req,
                            &mut self.proto.resp,
                            fdata,
                            check_time,
                        ),
                        _ => HandlerResult::Next,
                    };
                    if served == HandlerResult::Ok {
                        // filters after the serving one still run on
                        // the way back to the client
                        for j in i + 1..reg.filters.len() {
                            if let Some(fdata) = self.filter_data[j].as_mut() {
                                if fdata.bypass {
                                    continue;
                                }
                                if reg.filters[j].do_filter(
                                    &self.proto.req,
                                    &mut self.proto.resp,
                                    fdata,
                                ) == HandlerResult::Delay
                                {
                                    self.proto.resp.run_filter_idx = j + 1;
                                    return HandlerResult::Ok;
                                }
                            }
                        }
                        if reg.memcache {
                            cache_store_response(&mut self.proto.resp, ctx.lp.current_time);
                        }
                        self.start_sending_response(ctx, token);
                        return HandlerResult::Ok;
                    }
                }
            }
        }

        let result = {
            let handler = reg.handler.clone();
            let req = &mut self.proto.req;
            let resp = &mut self.proto.resp;
            let mut dctx = dispatch_ctx!(self, ctx, token, req);
            handler.on_select(reg, &mut dctx, req, resp)
        };
        self.apply_pending();
        if result != HandlerResult::Ok {
            self.unselect_handler(reg, &saved_uri, saved_ims);
        }
        result
    }

    /// Roll back the state `select_handler` touched when the handler
    /// declines.
    fn unselect_handler(&mut self, reg: &Arc<HandlerReg>, saved_uri: &str, saved_ims: Option<u64>) {
        for i in 0..reg.filters.len() {
            if let Some(fdata) = self.filter_data.get_mut(i).and_then(Option::as_mut) {
                reg.filters[i].finalize(fdata);
            }
        }
        self.filter_data.clear();
        if self.proto.req.uri() != saved_uri {
            let saved = saved_uri.to_owned();
            self.proto.req.set_uri(&saved);
        }
        self.proto.req.if_modified_since = saved_ims;
        self.handler = None;
        let resp = &mut self.proto.resp;
        resp.cache_key = None;
        resp.last_modified = None;
        resp.mime = None;
        resp.content_type = None;
        resp.content_charset = None;
        resp.sendfile_path = None;
    }

    // ---- response path ----

    /// Run outbound filters, store to the memory cache, hand the
    /// response to the protocol and start writing.
    pub fn start_sending_response(&mut self, ctx: &mut Ctx, token: Token) {
        if self.response_started {
            return;
        }

        if let Some(reg) = self.handler.clone() {
            let start = self.proto.resp.run_filter_idx;
            for i in start..reg.filters.len() {
                let delayed = match self.filter_data.get_mut(i).and_then(Option::as_mut) {
                    Some(fdata) if !fdata.bypass => {
                        reg.filters[i].do_filter(&self.proto.req, &mut self.proto.resp, fdata)
                            == HandlerResult::Delay
                    }
                    _ => false,
                };
                if delayed {
                    self.proto.resp.run_filter_idx = i + 1; // resume later
                    return;
                }
            }
            if reg.memcache {
                cache_store_response(&mut self.proto.resp, ctx.lp.current_time);
            }
        }

        self.response_started = true;
        let mut events = Vec::new();
        let date = ctx.lp.http_time_str().to_owned();
        self.proto.start_sending_response(&date, &mut events);
        for msg in events {
            ctx.lp.post(token, msg);
        }
        if self.sock.is_some() {
            self.write_timer = Some(ctx.lp.set_timer(TimerKind::Write, token));
            self.kick_write(ctx, token);
        }
    }

    fn kick_write(&mut self, ctx: &mut Ctx, token: Token) {
        ctx.lp.post(token, Message::ContentAvailable);
    }

    fn write_or_pipe_pump(&mut self, ctx: &mut Ctx, token: Token) -> Option<ConnAction> {
        if self.sock.is_some() {
            self.write_pump(ctx, token)
        } else {
            Some(self.pump_subrequest_body(ctx, token))
        }
    }

    fn write_pump(&mut self, ctx: &mut Ctx, token: Token) -> Option<ConnAction> {
        let sending = self.proto.state == ProtoState::SendHeaders
            || self.proto.state == ProtoState::SendBody
            || self.proto.req.sending_100_continue
            || !self.out_buf.is_empty();
        if self.sock.is_none() || !sending {
            return None;
        }

        if let Some(sock) = self.sock.as_ref() {
            set_cork(sock, true);
        }
        let mut result = None;
        loop {
            let produced = match self.proto.produce(&mut self.out_buf, ctx.pipes) {
                Ok(produced) => produced,
                Err(NetError::Wait) => break,
                Err(NetError::Fatal(_)) => {
                    result = Some(self.on_error(ctx, token, StreamError::Error));
                    break;
                }
            };

            let wrote = if self.out_buf.is_empty() {
                0
            } else {
                let sock = self.sock.as_mut().expect("checked above");
                match self.out_buf.egress(sock) {
                    Ok(wrote) => wrote,
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => 0,
                    Err(_) => {
                        result = Some(self.on_error(ctx, token, StreamError::Error));
                        break;
                    }
                }
            };

            if produced.progress {
                self.notify_content_producers(ctx);
            }

            if produced.complete && self.out_buf.is_empty() {
                result = self.response_complete(ctx, token);
                break;
            }
            if produced.waiting_on_content && self.out_buf.is_empty() {
                break; // producer will wake us with ContentAvailable
            }
            if !produced.progress && wrote == 0 {
                break; // socket or source stalled
            }
        }
        if let Some(sock) = self.sock.as_ref() {
            set_cork(sock, false);
        }
        result
    }

    /// Wake producers feeding pipes this response consumes.
    fn notify_content_producers(&mut self, ctx: &mut Ctx) {
        let producer = match &self.proto.resp.content {
            Content::Pipe(id) => ctx.pipes.producer(*id),
            Content::Streamer(streamer) => streamer
                .pipe_ids()
                .first()
                .and_then(|id| ctx.pipes.producer(*id)),
            _ => None,
        };
        if let Some(producer) = producer {
            ctx.lp.post(producer, Message::ContentConsumed);
        }
    }

    fn response_complete(&mut self, ctx: &mut Ctx, token: Token) -> Option<ConnAction> {
        if let Some(handle) = self.write_timer.take() {
            ctx.lp.unset_timer(handle);
        }

        {
            let loop_time = ctx.lp.current_time;
            access_log::on_request_complete(
                ctx.log_buf,
                &mut self.proto.req,
                &self.proto.resp,
                loop_time,
            );
        }

        if let Some(reg) = self.handler.clone() {
            let handler = reg.handler.clone();
            {
                let req = &mut self.proto.req;
                let resp = &mut self.proto.resp;
                let mut dctx = dispatch_ctx!(self, ctx, token, req);
                handler.on_complete(&reg, &mut dctx, req, resp);
            }
            for i in 0..reg.filters.len() {
                if let Some(fdata) = self.filter_data.get_mut(i).and_then(Option::as_mut) {
                    reg.filters[i].finalize(fdata);
                }
            }
        }
        self.release_content_pipes(ctx);
        self.handler = None;
        self.filter_data.clear();

        let keep_alive = self.proto.resp.keep_alive
            && !ctx.shutting_down
            && !self.close_after_send
            && !self.read_closed;
        if !keep_alive {
            return Some(ConnAction::Close { good: true });
        }

        self.proto.request_reset();
        self.response_started = false;
        self.proxy = None;
        self.subrequest_failed = false;
        self.subrequests.clear();
        self.idle_timer = Some(ctx.lp.set_timer(TimerKind::KeepAlive, token));
        // pipelined bytes may already be waiting
        if !self.in_buf.is_empty() {
            self.process_input(ctx, token);
        }
        None
    }

    fn release_content_pipes(&mut self, ctx: &mut Ctx) {
        match std::mem::replace(&mut self.proto.resp.content, Content::None) {
            Content::Pipe(id) => ctx.pipes.release(id),
            Content::Streamer(streamer) => {
                for id in streamer.pipe_ids() {
                    ctx.pipes.release(id);
                }
            }
            other => {
                self.proto.resp.content = other;
            }
        }
    }

    // ---- subrequest child side ----

    fn pump_subrequest_body(&mut self, ctx: &mut Ctx, _token: Token) -> ConnAction {
        let pipe_id = match self.response_pipe {
            Some(id) => id,
            None => return ConnAction::Keep,
        };
        let mut pipe = match ctx.pipes.take(pipe_id) {
            Some(pipe) => pipe,
            None => return ConnAction::Close { good: true },
        };

        let mut finished = false;
        let consumer = pipe.consumer;
        match self.proto.produce(&mut pipe.buf, ctx.pipes) {
            Ok(produced) => {
                if produced.complete {
                    pipe.set_eof();
                    finished = true;
                }
                if produced.progress || produced.complete {
                    if let Some(consumer) = consumer {
                        ctx.lp.post(consumer, Message::ContentAvailable);
                    }
                }
            }
            Err(_) => {
                pipe.broken = true;
                finished = true;
                if let Some(consumer) = consumer {
                    ctx.lp.post(consumer, Message::ContentAvailable);
                }
            }
        }
        ctx.pipes.put(pipe_id, pipe);

        if finished {
            // the parent owns the pipe from here on
            self.response_pipe = None;
            let loop_time = ctx.lp.current_time;
            access_log::on_request_complete(
                ctx.log_buf,
                &mut self.proto.req,
                &self.proto.resp,
                loop_time,
            );
            ConnAction::Close { good: true }
        } else {
            ConnAction::Keep
        }
    }

    /// Subrequest failed before a response was produced: leave the
    /// placeholder body so the parent page still renders.
    fn fail_subrequest(&mut self, ctx: &mut Ctx, token: Token) -> ConnAction {
        if let Some(pipe_id) = self.response_pipe {
            if let Some(mut pipe) = ctx.pipes.take(pipe_id) {
                if pipe.buf.is_empty() && !pipe.eof {
                    pipe.write(b"<!--[ssi error]-->");
                    pipe.set_eof();
                } else {
                    pipe.broken = true;
                }
                if let Some(consumer) = pipe.consumer {
                    ctx.lp.post(consumer, Message::ContentAvailable);
                }
                ctx.pipes.put(pipe_id, pipe);
            }
        }
        if let Some(parent) = self.parent {
            ctx.lp
                .post(parent, Message::SubrequestDone { sub: token, ok: false });
        }
        ConnAction::Close { good: true }
    }

    // ---- proxy bridging (parent side) ----

    fn build_proxy_request(&self, reg: &HandlerReg, backend_host: &str) -> Request {
        let src = &self.proto.req;
        let mut req = Request::new();
        req.set_method(src.method());
        let uri = match reg.uri.as_deref() {
            Some(rewrite) => {
                let mut uri = rewrite.to_owned();
                uri.push_str(src.path_info());
                uri
            }
            None => src.uri().to_owned(),
        };
        req.set_uri(&uri);
        if reg.proxy_copy_host {
            req.set_host(src.host());
        } else {
            req.set_host(backend_host);
        }
        req.http11 = true;
        req.keep_alive = true;
        req.head_method = src.head_method;
        req.get_method = src.get_method;
        req.post_method = src.post_method;
        req.other_method = src.other_method;
        req.uid = src.uid;
        req.root_uid = src.root_uid;
        req.if_modified_since = src.if_modified_since;
        req.x_forwarded_ssl = self.secure;
        req.x_forwarded_host = Some(src.host().to_owned());
        req.x_forwarded_for = Some(self.remote_addr.clone());
        if let Some(ua) = src.user_agent() {
            req.set_user_agent(ua);
        }
        if let Some(ct) = src.content_type() {
            req.set_content_type(ct);
        }
        req.content = src.content.clone();
        req.content_length = src.content.len() as i64;
        req
    }

    fn start_proxy_request(&mut self, ctx: &mut Ctx, token: Token, reg: &Arc<HandlerReg>) {
        let pool_idx = reg.proxy_pool.expect("caller checked");
        if pool_idx >= ctx.proxies.len() {
            self.proto.resp.send_http_error(502, "Bad Gateway");
            self.start_sending_response(ctx, token);
            return;
        }
        let backend_host = ctx.proxies[pool_idx].host.clone();
        let outbound = self.build_proxy_request(reg, &backend_host);
        let pipe = ctx.pipes.create(crate::RBUF_SIZE);
        if let Some(mut p) = ctx.pipes.take(pipe) {
            p.consumer = Some(token);
            ctx.pipes.put(pipe, p);
        }

        match crate::client::proxy::acquire(ctx, pool_idx, token, pipe, outbound) {
            Ok(_proxy_token) => {
                let retries = self.proxy.as_ref().map(|p| p.retries).unwrap_or(0);
                self.proxy = Some(ProxyClient {
                    pool_idx,
                    pipe,
                    retries,
                });
            }
            Err(_) => {
                ctx.pipes.release(pipe);
                self.proto.resp.send_http_error(502, "Bad Gateway");
                self.start_sending_response(ctx, token);
            }
        }
    }

    fn on_backend_response(&mut self, ctx: &mut Ctx, token: Token, proxy_token: Token) {
        let backend = match ctx.objects.proxy_mut(proxy_token) {
            Some(proxy) => proxy.take_response(),
            None => None,
        };
        let backend = match backend {
            Some(resp) => resp,
            None => return,
        };
        let pipe = match self.proxy.as_ref() {
            Some(proxy) => proxy.pipe,
            None => return,
        };

        // backend clock skew annotation
        if let Some(date) = backend.date {
            let delta = date as i64 - ctx.lp.http_time() as i64;
            if let Some(proxy) = self.proxy.as_ref() {
                if let Some(pool) = ctx.proxies.get_mut(proxy.pool_idx) {
                    pool.report_delta(delta);
                    access_log::on_proxy_response(&mut self.proto.req, pool.delta());
                }
            }
        }

        let resp = &mut self.proto.resp;
        resp.status_code = backend.status_code;
        resp.status = backend.status.clone();
        resp.content_type = backend.content_type.clone();
        resp.content_charset = backend.content_charset.clone();
        resp.content_length = backend.content_length;
        resp.last_modified = backend.last_modified;
        resp.expires = backend.expires;
        resp.etag = backend.etag.clone();
        resp.cache_control = backend.cache_control.clone();
        resp.max_age = backend.max_age;
        resp.no_cache = backend.no_cache;
        resp.cache_private = backend.cache_private;
        resp.ssi_on = backend.ssi_on;
        resp.templates_on = backend.templates_on;
        resp.gzip_encoded = backend.gzip_encoded;
        for (name, value) in &backend.extra_headers {
            resp.extra_headers.push((name.clone(), value.clone()));
        }
        resp.content = Content::Pipe(pipe);
        self.start_sending_response(ctx, token);
    }

    fn on_backend_failed(&mut self, ctx: &mut Ctx, token: Token, timeout: bool) -> ConnAction {
        if self.response_started {
            // mid-stream backend loss; the broken pipe surfaces in
            // the write pump
            return self.write_pump(ctx, token).unwrap_or(ConnAction::Keep);
        }
        let can_retry = {
            let retries = self.proxy.as_ref().map(|p| p.retries).unwrap_or(0);
            self.proto.req.get_method && retries < crate::PROXY_RETRY_COUNT
        };
        if can_retry {
            if let Some(proxy) = self.proxy.as_mut() {
                proxy.retries += 1;
            }
            if let Some(old) = self.proxy.as_ref() {
                ctx.pipes.release(old.pipe);
            }
            if let Some(reg) = self.handler.clone() {
                logging::warn!(ctx.log, "retrying idempotent proxy request";
                               "uid" => %crate::http::format_uid(self.proto.req.uid));
                self.start_proxy_request(ctx, token, &reg);
                return ConnAction::Keep;
            }
        }
        let (code, message) = if timeout {
            (504, "Gateway Timeout")
        } else {
            (502, "Bad Gateway")
        };
        self.proto.resp.send_http_error(code, message);
        self.proto.resp.keep_alive = false;
        self.start_sending_response(ctx, token);
        ConnAction::Keep
    }

    // ---- teardown ----

    /// Final cleanup. The dispatcher already detached this connection
    /// from the slab and finalized its subrequests.
    pub fn finalize(
        &mut self,
        lp: &mut crate::event::EventLoop,
        pipes: &mut crate::stream::PipeTable,
        buf_pool: &mut crate::pool::Pool<Buffer>,
        log_buf: &mut access_log::LogBuffer,
        good: bool,
    ) {
        let _ = log_buf;
        for handle in [
            self.idle_timer.take(),
            self.read_timer.take(),
            self.write_timer.take(),
            self.cont100_timer.take(),
        ]
        .iter_mut()
        {
            if let Some(handle) = handle.take() {
                lp.unset_timer(handle);
            }
        }
        match std::mem::replace(&mut self.proto.resp.content, Content::None) {
            Content::Pipe(id) => pipes.release(id),
            Content::Streamer(streamer) => {
                for id in streamer.pipe_ids() {
                    pipes.release(id);
                }
            }
            _ => {}
        }
        if let Some(proxy) = self.proxy.take() {
            pipes.release(proxy.pipe);
        }
        if let Some(pipe) = self.response_pipe.take() {
            // producer going away; an unfinished parent sees a broken
            // pipe
            pipes.break_pipe(pipe);
        }
        if let Some(sock) = self.sock.take() {
            lp.deregister(&sock).ok();
            if !good {
                // abnormal close gets an RST
                sock.set_linger(Some(std::time::Duration::from_secs(0))).ok();
            }
            drop(sock);
        }
        let mut in_buf = std::mem::replace(&mut self.in_buf, Buffer::new(crate::RBUF_SIZE));
        let mut out_buf = std::mem::replace(&mut self.out_buf, Buffer::new(crate::RBUF_SIZE));
        in_buf.clear();
        out_buf.clear();
        buf_pool.put(in_buf);
        buf_pool.put(out_buf);
    }
}

//! Backend connection pooling and the proxy connection loop object.
//! A proxy connection wraps a client protocol instance plus its
//! socket; idle connections are pooled LIFO per backend and evicted on
//! keep-alive timeout.

use super::proto::{ClientEvent, ClientState, HttpClientProto};
use crate::buffer::Buffer;
use crate::error::StreamError;
use crate::event::{Message, TimerHandle, TimerKind};
use crate::http::{Request, Response};
use crate::logging;
use crate::server::{ConnAction, Ctx, LoopEntry, Stimulus};
use crate::stream::PipeId;
use indexmap::IndexSet;
use mio::net::TcpStream;
use mio::Token;
use std::io;
use std::net::SocketAddr;

const TIME_DELTA_SAMPLES: usize = 8;
const TIME_DELTA_NO_VALUE: i64 = 1_000_000;

/// Per-thread pool of idle connections to one backend.
pub struct ProxyPool {
    pub idx: usize,
    pub host: String,
    pub addr: SocketAddr,
    idle: IndexSet<Token>,
    pub conn_count: usize,
    pub conn_count_max: usize,
    deltas: [i64; TIME_DELTA_SAMPLES],
    delta_idx: usize,
}

impl ProxyPool {
    pub fn new(idx: usize, host: String, addr: SocketAddr) -> ProxyPool {
        ProxyPool {
            idx,
            host,
            addr,
            idle: IndexSet::new(),
            conn_count: 0,
            conn_count_max: 0,
            deltas: [TIME_DELTA_NO_VALUE; TIME_DELTA_SAMPLES],
            delta_idx: 0,
        }
    }

    /// LIFO: the most recently used connection is the least likely to
    /// have gone stale.
    #[inline]
    pub fn acquire_idle(&mut self) -> Option<Token> {
        self.idle.pop()
    }

    #[inline]
    pub fn put_idle(&mut self, token: Token) {
        self.idle.insert(token);
    }

    #[inline]
    pub fn remove_idle(&mut self, token: Token) {
        self.idle.shift_remove(&token);
    }

    pub fn drain_idle(&mut self) -> Vec<Token> {
        self.idle.drain(..).collect()
    }

    /// Record one backend-vs-local clock delta sample (seconds).
    pub fn report_delta(&mut self, delta: i64) {
        self.deltas[self.delta_idx] = delta;
        self.delta_idx = (self.delta_idx + 1) % TIME_DELTA_SAMPLES;
    }

    /// Average of the recorded samples, 0 until any exist.
    pub fn delta(&self) -> i64 {
        let mut sum = 0i64;
        let mut count = 0i64;
        for &sample in &self.deltas {
            if sample != TIME_DELTA_NO_VALUE {
                sum += sample;
                count += 1;
            }
        }
        if count == 0 {
            0
        } else {
            sum / count
        }
    }
}

/// One pooled backend connection.
pub struct ProxyConn {
    sock: TcpStream,
    pub proto: HttpClientProto,
    in_buf: Buffer,
    out_buf: Buffer,
    pub pool_idx: usize,
    parent: Option<Token>,
    pipe: Option<PipeId>,
    pending_request: Option<Request>,
    pending_response: Option<Response>,
    idle_timer: Option<TimerHandle>,
    backend_timer: Option<TimerHandle>,
    response_delivered: bool,
    connected: bool,
    pub uid: u64,
}

/// Copy the response head for handing to the parent; the protocol
/// keeps its own copy for body framing.
fn head_copy(resp: &Response) -> Response {
    let mut copy = Response::new();
    copy.status_code = resp.status_code;
    copy.status = resp.status.clone();
    copy.keep_alive = resp.keep_alive;
    copy.http11 = resp.http11;
    copy.chunked_encoding = resp.chunked_encoding;
    copy.gzip_encoded = resp.gzip_encoded;
    copy.ssi_on = resp.ssi_on;
    copy.templates_on = resp.templates_on;
    copy.no_cache = resp.no_cache;
    copy.cache_private = resp.cache_private;
    copy.content_type = resp.content_type.clone();
    copy.content_charset = resp.content_charset.clone();
    copy.cache_control = resp.cache_control.clone();
    copy.etag = resp.etag.clone();
    copy.extra_headers = resp.extra_headers.clone();
    copy.date = resp.date;
    copy.last_modified = resp.last_modified;
    copy.expires = resp.expires;
    copy.max_age = resp.max_age;
    copy.content_length = resp.content_length;
    copy
}

/// Borrow an idle pooled connection or open a new one, and start the
/// outbound request on it.
pub fn acquire(
    ctx: &mut Ctx,
    pool_idx: usize,
    parent: Token,
    pipe: PipeId,
    outbound: Request,
) -> io::Result<Token> {
    // reuse an idle connection when one is around
    loop {
        let idle = ctx.proxies[pool_idx].acquire_idle();
        let token = match idle {
            Some(token) => token,
            None => break,
        };
        if let Some(proxy) = ctx.objects.proxy_mut(token) {
            if let Some(handle) = proxy.idle_timer.take() {
                ctx.lp.unset_timer(handle);
            }
            proxy.parent = Some(parent);
            proxy.pipe = Some(pipe);
            proxy.response_delivered = false;
            proxy.proto.start_request(outbound);
            if let Some(mut p) = ctx.pipes.take(pipe) {
                p.producer = Some(token);
                ctx.pipes.put(pipe, p);
            }
            // kick the output pump
            ctx.lp.post(token, Message::ContentConsumed);
            return Ok(token);
        }
        // stale idle entry; try the next one
    }

    let addr = ctx.proxies[pool_idx].addr;
    let sock = TcpStream::connect(&addr)?;
    sock.set_nodelay(true).ok();
    let uid = ctx.generate_uid();
    let mut proxy = Box::new(ProxyConn {
        sock,
        proto: HttpClientProto::new(),
        in_buf: ctx.buf_pool.take(),
        out_buf: ctx.buf_pool.take(),
        pool_idx,
        parent: Some(parent),
        pipe: Some(pipe),
        pending_request: Some(outbound),
        pending_response: None,
        idle_timer: None,
        backend_timer: None,
        response_delivered: false,
        connected: false,
        uid,
    });
    proxy.in_buf.clear();
    proxy.out_buf.clear();
    let token = ctx.objects.insert(LoopEntry::Proxy(proxy));
    {
        let lp = &mut *ctx.lp;
        let objects = &mut *ctx.objects;
        let proxy = objects.proxy_mut(token).expect("inserted above");
        if lp
            .register(&proxy.sock, token, crate::event::EventLoop::interest_rw())
            .is_err()
        {
            objects.release(token);
            return Err(io::Error::new(io::ErrorKind::Other, "register failed"));
        }
    }

    if let Some(mut p) = ctx.pipes.take(pipe) {
        p.producer = Some(token);
        ctx.pipes.put(pipe, p);
    }
    // connect timeout rides the backend timer
    let handle = ctx.lp.set_timer(TimerKind::Backend, token);
    if let Some(proxy) = ctx.objects.proxy_mut(token) {
        proxy.backend_timer = Some(handle);
    }
    ctx.proxies[pool_idx].conn_count += 1;
    let count = ctx.proxies[pool_idx].conn_count;
    if count > ctx.proxies[pool_idx].conn_count_max {
        ctx.proxies[pool_idx].conn_count_max = count;
    }
    Ok(token)
}

impl ProxyConn {
    /// Parsed backend response head, parked for the parent.
    pub fn take_response(&mut self) -> Option<Response> {
        self.pending_response.take()
    }

    pub fn handle(&mut self, ctx: &mut Ctx, token: Token, stimulus: &Stimulus) -> ConnAction {
        match stimulus {
            Stimulus::Io(readiness) => {
                if !self.connected && (readiness.writable || readiness.error || readiness.hup) {
                    if let Some(err) = self.sock.take_error().ok().flatten() {
                        logging::warn!(ctx.log, "backend connect failed"; "err" => %err);
                        return self.fail(ctx, token, false);
                    }
                    if readiness.error || readiness.hup {
                        return self.fail(ctx, token, false);
                    }
                    self.connected = true;
                    let mut events = Vec::new();
                    self.proto.connected(&mut events);
                    if let Some(req) = self.pending_request.take() {
                        self.proto.start_request(req);
                    }
                }
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
                    return self.on_stream_error(ctx, token, StreamError::Error);
                }
                if readiness.hup && !readiness.readable {
                    return self.on_stream_error(ctx, token, StreamError::Hup);
                }
                ConnAction::Keep
            }
            Stimulus::Msg(msg) => self.on_message(ctx, token, *msg),
        }
    }

    fn on_message(&mut self, ctx: &mut Ctx, token: Token, msg: Message) -> ConnAction {
        match msg {
            Message::ContentConsumed => {
                // parent drained the pipe, or we were just rearmed;
                // push both directions
                if let Some(action) = self.write_pump(ctx, token) {
                    return action;
                }
                if !self.in_buf.is_empty() {
                    if let Some(action) = self.feed_input(ctx, token) {
                        return action;
                    }
                }
                ConnAction::Keep
            }
            Message::Timeout(TimerKind::Backend) => {
                self.backend_timer = None;
                logging::warn!(ctx.log, "backend timeout"; "pool" => self.pool_idx);
                self.fail(ctx, token, true)
            }
            Message::Timeout(TimerKind::KeepAlive) => {
                // idle in pool past keep-alive; evict
                self.idle_timer = None;
                ctx.proxies[self.pool_idx].remove_idle(token);
                ConnAction::Close { good: true }
            }
            Message::Error(err) => self.on_stream_error(ctx, token, err),
            _ => ConnAction::Keep,
        }
    }

    fn write_pump(&mut self, ctx: &mut Ctx, token: Token) -> Option<ConnAction> {
        if !self.connected {
            return None;
        }
        loop {
            let progressed = self.proto.produce(&mut self.out_buf);
            if self.out_buf.is_empty() {
                break;
            }
            match self.out_buf.egress(&mut self.sock) {
                Ok(0) => break,
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    return Some(self.on_stream_error(ctx, token, StreamError::Error));
                }
            }
            if !progressed {
                break;
            }
        }
        if self.proto.state == ClientState::WaitResponse && self.backend_timer.is_none() {
            self.backend_timer = Some(ctx.lp.set_timer(TimerKind::Backend, token));
        }
        None
    }

    fn read_pump(&mut self, ctx: &mut Ctx, token: Token) -> Option<ConnAction> {
        loop {
            let (received, eof) = match self.in_buf.ingress(&mut self.sock) {
                Ok(result) => result,
                Err(_) => return Some(self.on_stream_error(ctx, token, StreamError::Error)),
            };
            if received > 0 {
                if let Some(action) = self.feed_input(ctx, token) {
                    return Some(action);
                }
            }
            if eof {
                return Some(self.on_eof(ctx, token));
            }
            if received == 0 {
                return None;
            }
            if self.in_buf.free_capacity() == 0 {
                return None; // pipe backpressure
            }
        }
    }

    fn feed_input(&mut self, ctx: &mut Ctx, token: Token) -> Option<ConnAction> {
        let pipe_id = match self.pipe {
            Some(id) => id,
            None => {
                self.in_buf.clear();
                return None;
            }
        };
        let mut pipe = match ctx.pipes.take(pipe_id) {
            Some(pipe) => pipe,
            None => {
                // consumer vanished; drop the connection
                self.pipe = None;
                return Some(ConnAction::Close { good: true });
            }
        };

        let mut events = Vec::new();
        let mut wrote_body = false;
        let mut failed = false;
        loop {
            if self.in_buf.is_empty() {
                break;
            }
            let before = pipe.buf.len();
            let consumed = match self.proto.feed(self.in_buf.read_slice(), &mut pipe, &mut events) {
                Ok(consumed) => consumed,
                Err(err) => {
                    logging::warn!(ctx.log, "bad backend response"; "err" => ?err);
                    failed = true;
                    break;
                }
            };
            wrote_body = wrote_body || pipe.buf.len() > before || pipe.eof;
            if consumed == 0 {
                break;
            }
            self.in_buf.consume(consumed);
        }
        let consumer = pipe.consumer;
        ctx.pipes.put(pipe_id, pipe);

        if failed {
            return Some(self.fail(ctx, token, false));
        }
        if wrote_body {
            if let Some(consumer) = consumer {
                ctx.lp.post(consumer, Message::ContentAvailable);
            }
        }
        self.handle_events(ctx, token, events)
    }

    fn handle_events(
        &mut self,
        ctx: &mut Ctx,
        token: Token,
        events: Vec<ClientEvent>,
    ) -> Option<ConnAction> {
        for event in events {
            match event {
                ClientEvent::ResponseReceived => {
                    if let Some(handle) = self.backend_timer.take() {
                        ctx.lp.unset_timer(handle);
                    }
                    self.response_delivered = true;
                    self.pending_response = Some(head_copy(&self.proto.resp));
                    if let Some(parent) = self.parent {
                        ctx.lp.post(parent, Message::BackendResponse { proxy: token });
                    }
                }
                ClientEvent::RequestComplete => {
                    return Some(self.request_finished(ctx, token));
                }
                ClientEvent::ContinueReceived | ClientEvent::Connected => {}
            }
        }
        None
    }

    fn request_finished(&mut self, ctx: &mut Ctx, token: Token) -> ConnAction {
        let keep_alive = self.proto.resp.keep_alive;
        self.parent = None;
        self.pipe = None;
        if keep_alive && !ctx.shutting_down {
            self.proto.rearm();
            ctx.proxies[self.pool_idx].put_idle(token);
            self.idle_timer = Some(ctx.lp.set_timer(TimerKind::KeepAlive, token));
            ConnAction::Keep
        } else {
            ConnAction::Close { good: true }
        }
    }

    fn on_eof(&mut self, ctx: &mut Ctx, token: Token) -> ConnAction {
        // a close-delimited body ends legally at EOF
        if let Some(pipe_id) = self.pipe {
            if let Some(mut pipe) = ctx.pipes.take(pipe_id) {
                let mut events = Vec::new();
                let legal = self.proto.eof_received(&mut pipe, &mut events);
                let consumer = pipe.consumer;
                ctx.pipes.put(pipe_id, pipe);
                if legal {
                    if let Some(consumer) = consumer {
                        ctx.lp.post(consumer, Message::ContentAvailable);
                    }
                    // the pool never reuses a closed connection
                    self.proto.resp.keep_alive = false;
                    return self.request_finished(ctx, token);
                }
            }
        }
        self.on_stream_error(ctx, token, StreamError::RdClosed)
    }

    fn on_stream_error(&mut self, ctx: &mut Ctx, token: Token, err: StreamError) -> ConnAction {
        if self.parent.is_none() {
            // idle pooled connection dropped by the backend
            ctx.proxies[self.pool_idx].remove_idle(token);
            let _ = err;
            return ConnAction::Close { good: true };
        }
        if !self.response_delivered {
            return self.fail(ctx, token, false);
        }
        // mid-body loss: poison the pipe so the parent aborts
        if let Some(pipe_id) = self.pipe {
            ctx.pipes.break_pipe(pipe_id);
            if let Some(consumer) = ctx.pipes.consumer(pipe_id) {
                ctx.lp.post(consumer, Message::ContentAvailable);
            }
        }
        ConnAction::Close { good: false }
    }

    /// Report failure to the parent before any response was
    /// delivered.
    fn fail(&mut self, ctx: &mut Ctx, token: Token, timeout: bool) -> ConnAction {
        if let Some(parent) = self.parent.take() {
            ctx.lp.post(
                parent,
                Message::BackendFailed {
                    proxy: token,
                    timeout,
                },
            );
        }
        ConnAction::Close { good: false }
    }

    /// Final cleanup; the dispatcher detached this entry already.
    pub fn finalize(
        &mut self,
        lp: &mut crate::event::EventLoop,
        pipes: &mut crate::stream::PipeTable,
        proxies: &mut Vec<ProxyPool>,
    ) {
        for handle in [self.idle_timer.take(), self.backend_timer.take()].iter_mut() {
            if let Some(handle) = handle.take() {
                lp.unset_timer(handle);
            }
        }
        if let Some(pipe_id) = self.pipe.take() {
            pipes.break_pipe(pipe_id);
        }
        if let Some(pool) = proxies.get_mut(self.pool_idx) {
            pool.conn_count = pool.conn_count.saturating_sub(1);
        }
        lp.deregister(&self.sock).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ProxyPool {
        ProxyPool::new(0, "backend:8000".to_owned(), "127.0.0.1:8000".parse().unwrap())
    }

    #[test]
    fn test_idle_list_is_lifo() {
        let mut pool = pool();
        pool.put_idle(Token(1));
        pool.put_idle(Token(2));
        pool.put_idle(Token(3));
        assert_eq!(pool.acquire_idle(), Some(Token(3)));
        assert_eq!(pool.acquire_idle(), Some(Token(2)));
        pool.put_idle(Token(4));
        assert_eq!(pool.acquire_idle(), Some(Token(4)));
        assert_eq!(pool.acquire_idle(), Some(Token(1)));
        assert_eq!(pool.acquire_idle(), None);
    }

    #[test]
    fn test_remove_idle() {
        let mut pool = pool();
        pool.put_idle(Token(1));
        pool.put_idle(Token(2));
        pool.remove_idle(Token(1));
        assert_eq!(pool.acquire_idle(), Some(Token(2)));
        assert_eq!(pool.acquire_idle(), None);
    }

    #[test]
    fn test_delta_ring() {
        let mut pool = pool();
        assert_eq!(pool.delta(), 0);
        pool.report_delta(4);
        pool.report_delta(-2);
        assert_eq!(pool.delta(), 1);
        // ring wraps after 8 samples
        for _ in 0..8 {
            pool.report_delta(10);
        }
        assert_eq!(pool.delta(), 10);
    }

    #[test]
    fn test_head_copy_carries_metadata() {
        let mut resp = Response::new();
        crate::http::parse::parse_http_response(
            &mut resp,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/css\r\nContent-Length: 7\r\nETag: \"z\"\r\nX-Extra: 1\r\n",
        )
        .unwrap();
        let copy = head_copy(&resp);
        assert_eq!(copy.status_code, 200);
        assert_eq!(copy.content_type.as_deref(), Some("text/css"));
        assert_eq!(copy.content_length, 7);
        assert_eq!(copy.etag.as_deref(), Some("\"z\""));
        assert_eq!(copy.extra_headers.len(), 1);
    }
}

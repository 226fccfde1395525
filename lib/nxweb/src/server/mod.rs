//! Server assembly: listening sockets, net threads, the per-thread
//! object registry the event loop dispatches into, and shutdown.

pub mod conn;
pub mod handler;
pub mod proto;
pub mod sendfile;

use crate::access_log::LogBuffer;
use crate::buffer::Buffer;
use crate::config::Config;
use crate::error::StreamError;
use crate::event::{EventLoop, IoReadiness, Message, Publisher, TimerHandle, TimerKind};
use crate::logging::{self, Logger};
use crate::pool::Pool;
use crate::stream::PipeTable;
use crate::workers::Factory;
use conn::HttpServerConnection;
use handler::{Handler, HandlerBuilder, HandlerReg, HandlerRegistry};
use mio::net::TcpListener;
use mio::{Registration, SetReadiness, Token};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::proxy::{ProxyConn, ProxyPool};
use crate::error::HandlerResult;
use crate::http::{Request, Response};

/// Process-lifetime, read-only server state shared by all net
/// threads.
pub struct ServerRuntime {
    pub config: Config,
    pub registry: HandlerRegistry,
    pub default_handler: Arc<HandlerReg>,
    /// Resolved backends for the proxy pools, by index.
    pub backends: Vec<(String, SocketAddr)>,
}

struct Default404;

impl Handler for Default404 {
    fn on_headers(
        &self,
        _reg: &HandlerReg,
        _ctx: &mut dyn handler::HandlerCtx,
        req: &mut Request,
        resp: &mut Response,
    ) -> HandlerResult {
        let _ = req;
        resp.send_http_error(404, "Not Found");
        HandlerResult::Error
    }
}

impl ServerRuntime {
    pub fn new(config: Config, registry: HandlerRegistry) -> io::Result<ServerRuntime> {
        let mut backends = Vec::new();
        for backend in &config.backends {
            let addr = backend
                .address
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "backend unresolvable"))?;
            backends.push((backend.address.clone(), addr));
        }
        let default_handler = Arc::new(
            HandlerBuilder::new("default", Arc::new(Default404))
                .priority(999_999_999)
                .build(),
        );
        Ok(ServerRuntime {
            config,
            registry,
            default_handler,
            backends,
        })
    }
}

/// What a loop object asks the dispatcher to do with it afterwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnAction {
    Keep,
    /// Tear down; `good` selects graceful close versus RST.
    Close { good: bool },
}

/// A single delivery into a loop object.
pub enum Stimulus {
    Io(IoReadiness),
    Msg(Message),
}

pub struct ListenerEntry {
    pub lconf_idx: usize,
    pub sock: TcpListener,
    pub secure: bool,
    pub retry_timer: Option<TimerHandle>,
    pub accepting: bool,
}

/// Everything the event loop can deliver to.
pub enum LoopEntry {
    Conn(Box<HttpServerConnection>),
    Proxy(Box<ProxyConn>),
    Listener(ListenerEntry),
    WorkerWake(usize),
    Shutdown,
}

/// Slab of loop objects with a free list; slot index == poll token.
pub struct Objects {
    slots: Vec<Option<LoopEntry>>,
    free: Vec<usize>,
}

impl Objects {
    pub fn new() -> Objects {
        Objects {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: LoopEntry) -> Token {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                Token(idx)
            }
            None => {
                self.slots.push(Some(entry));
                Token(self.slots.len() - 1)
            }
        }
    }

    pub fn take(&mut self, token: Token) -> Option<LoopEntry> {
        self.slots.get_mut(token.0).and_then(Option::take)
    }

    pub fn put(&mut self, token: Token, entry: LoopEntry) {
        self.slots[token.0] = Some(entry);
    }

    pub fn release(&mut self, token: Token) {
        if self.slots.get_mut(token.0).map(Option::take).is_some() {
            self.free.push(token.0);
        }
    }

    pub fn conn_mut(&mut self, token: Token) -> Option<&mut HttpServerConnection> {
        match self.slots.get_mut(token.0).and_then(Option::as_mut) {
            Some(LoopEntry::Conn(conn)) => Some(conn),
            _ => None,
        }
    }

    pub fn proxy_mut(&mut self, token: Token) -> Option<&mut ProxyConn> {
        match self.slots.get_mut(token.0).and_then(Option::as_mut) {
            Some(LoopEntry::Proxy(proxy)) => Some(proxy),
            _ => None,
        }
    }

    /// Live request-serving connections (shutdown drain check).
    pub fn conn_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Some(LoopEntry::Conn(_))))
            .count()
    }
}

/// Mutable net-thread state handed to loop objects while they run.
/// The object being delivered to is taken out of `objects` for the
/// duration of the call.
pub struct Ctx<'a> {
    pub lp: &'a mut EventLoop,
    pub objects: &'a mut Objects,
    pub pipes: &'a mut PipeTable,
    pub factory: &'a mut Factory,
    pub proxies: &'a mut Vec<ProxyPool>,
    pub runtime: &'a ServerRuntime,
    pub log_buf: &'a mut LogBuffer,
    pub buf_pool: &'a mut Pool<Buffer>,
    pub log: &'a Logger,
    pub thread_num: u8,
    pub unique_counter: &'a mut u64,
    pub shutting_down: bool,
}

impl<'a> Ctx<'a> {
    /// 64-bit unique request id: thread number in the top byte, a
    /// ~1 Hz time slice, and a 36-bit per-thread counter.
    pub fn generate_uid(&mut self) -> u64 {
        *self.unique_counter += 1;
        (u64::from(self.thread_num) << 56)
            | ((self.lp.current_time & (0xf_ffff << 20)) << 16)
            | (*self.unique_counter & 0xf_ffff_ffff)
    }

    /// Spawn an in-process subrequest connection owned by `parent`.
    /// Its dispatch is scheduled as a loop callback; the response body
    /// will flow into `pipe`.
    pub fn spawn_subrequest(
        &mut self,
        parent: Token,
        host: Option<&str>,
        uri: &str,
        parent_uid: u64,
        parent_root_uid: u64,
        parent_host: &str,
        remote_addr: &str,
        secure: bool,
        pipe: crate::stream::PipeId,
    ) -> Token {
        let uid = self.generate_uid();
        let mut child = Box::new(HttpServerConnection::subrequest(
            parent,
            host.unwrap_or(parent_host),
            uri,
            remote_addr,
            secure,
            pipe,
        ));
        child.uid = uid;
        child.proto.req.uid = uid;
        child.proto.req.root_uid = if parent_root_uid != 0 {
            parent_root_uid
        } else {
            parent_uid
        };
        child.proto.req.received_time = self.lp.current_time;
        let token = self.objects.insert(LoopEntry::Conn(child));
        if let Some(pipe_ref) = self.pipes.take(pipe) {
            let mut pipe_ref = pipe_ref;
            pipe_ref.producer = Some(token);
            pipe_ref.consumer = Some(parent);
            self.pipes.put(pipe, pipe_ref);
        }
        self.lp.post(token, Message::Dispatch);
        token
    }
}

/// Cross-thread shutdown control. The signal handler only flips the
/// flag; a monitor thread fans the wake-up out to every net thread.
pub struct ShutdownControl {
    pub flag: AtomicBool,
    wakes: Mutex<Vec<SetReadiness>>,
}

impl ShutdownControl {
    pub fn new() -> ShutdownControl {
        ShutdownControl {
            flag: AtomicBool::new(false),
            wakes: Mutex::new(Vec::new()),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn add_wake(&self, wake: SetReadiness) {
        self.wakes.lock().expect("shutdown wake list").push(wake);
    }

    fn fire_all(&self) {
        for wake in self.wakes.lock().expect("shutdown wake list").iter() {
            wake.set_readiness(mio::Ready::readable()).ok();
        }
    }
}

struct NetThread {
    lp: EventLoop,
    objects: Objects,
    pipes: PipeTable,
    factory: Factory,
    proxies: Vec<ProxyPool>,
    runtime: Arc<ServerRuntime>,
    log_buf: LogBuffer,
    buf_pool: Pool<Buffer>,
    gc_pub: Publisher,
    log: Logger,
    thread_num: u8,
    unique_counter: u64,
    shutting_down: bool,
    shutdown_token: Token,
    _shutdown_wake: SetReadiness,
    // keeps the shutdown wake registered for the thread's lifetime
    _shutdown_registration: Registration,
}

fn new_rbuf() -> Buffer {
    Buffer::new(crate::RBUF_SIZE)
}

impl NetThread {
    fn new(
        thread_num: u8,
        runtime: Arc<ServerRuntime>,
        listeners: Vec<(usize, TcpListener, bool)>,
        shutdown: (Registration, SetReadiness),
        log: Logger,
    ) -> io::Result<NetThread> {
        let mut lp = EventLoop::new(128)?;
        let timeouts = &runtime.config.timeouts;
        lp.set_timer_queue_timeout(TimerKind::KeepAlive, timeouts.keep_alive);
        lp.set_timer_queue_timeout(TimerKind::Read, timeouts.read);
        lp.set_timer_queue_timeout(TimerKind::Write, timeouts.write);
        lp.set_timer_queue_timeout(TimerKind::Backend, timeouts.backend);
        lp.set_timer_queue_timeout(TimerKind::Continue100, timeouts.continue100);
        lp.set_timer_queue_timeout(TimerKind::AcceptRetry, timeouts.accept_retry);

        let mut objects = Objects::new();
        for (lconf_idx, sock, secure) in listeners {
            let token = objects.insert(LoopEntry::Listener(ListenerEntry {
                lconf_idx,
                sock,
                secure,
                retry_timer: None,
                accepting: true,
            }));
            if let Some(LoopEntry::Listener(entry)) =
                objects.slots[token.0].as_ref()
            {
                lp.register(&entry.sock, token, mio::Ready::readable())?;
            }
        }

        let (registration, wake) = shutdown;
        let shutdown_token = objects.insert(LoopEntry::Shutdown);
        lp.register(&registration, shutdown_token, mio::Ready::readable())?;

        let mut proxies = Vec::new();
        for (idx, (host, addr)) in runtime.backends.iter().enumerate() {
            proxies.push(ProxyPool::new(idx, host.clone(), *addr));
        }

        Ok(NetThread {
            lp,
            objects,
            pipes: PipeTable::new(),
            factory: Factory::new(),
            proxies,
            runtime,
            log_buf: LogBuffer::new(),
            buf_pool: Pool::new(new_rbuf, 8),
            gc_pub: Publisher::new(),
            log,
            thread_num,
            unique_counter: 0,
            shutting_down: false,
            shutdown_token,
            _shutdown_wake: wake,
            _shutdown_registration: registration,
        })
    }

    fn run(&mut self) {
        let mut io = Vec::new();
        loop {
            if self
                .lp
                .poll_io(&mut io, Duration::from_millis(1000))
                .is_err()
            {
                logging::error!(self.log, "poll failed; stopping net thread");
                break;
            }
            let idle = io.is_empty();

            let events: Vec<IoReadiness> = io.drain(..).collect();
            for readiness in events {
                self.dispatch(readiness.token, Stimulus::Io(readiness));
            }
            self.drain_messages();
            self.lp.fire_due_timers();
            self.drain_messages();

            if idle {
                self.gc();
            }
            if self.shutting_down && self.objects.conn_count() == 0 {
                break;
            }
        }
        self.finalize();
    }

    fn drain_messages(&mut self) {
        while let Some((token, msg)) = self.lp.take_event() {
            self.dispatch(token, Stimulus::Msg(msg));
        }
    }

    fn gc(&mut self) {
        self.buf_pool.gc();
        self.factory.gc();
        self.log_buf.flush();
        let gc_pub = std::mem::replace(&mut self.gc_pub, Publisher::new());
        gc_pub.publish(&mut self.lp, Message::Gc);
        self.gc_pub = gc_pub;
        self.drain_messages();
    }

    fn dispatch(&mut self, token: Token, stimulus: Stimulus) {
        if token == self.shutdown_token {
            if let Stimulus::Io(_) = stimulus {
                self.begin_shutdown();
            }
            return;
        }

        let mut entry = match self.objects.take(token) {
            Some(entry) => entry,
            None => return, // stale delivery for a finalized object
        };

        let action = {
            let mut ctx = Ctx {
                lp: &mut self.lp,
                objects: &mut self.objects,
                pipes: &mut self.pipes,
                factory: &mut self.factory,
                proxies: &mut self.proxies,
                runtime: &self.runtime,
                log_buf: &mut self.log_buf,
                buf_pool: &mut self.buf_pool,
                log: &self.log,
                thread_num: self.thread_num,
                unique_counter: &mut self.unique_counter,
                shutting_down: self.shutting_down,
            };
            match &mut entry {
                LoopEntry::Conn(conn) => conn.handle(&mut ctx, token, &stimulus),
                LoopEntry::Proxy(proxy) => proxy.handle(&mut ctx, token, &stimulus),
                LoopEntry::Listener(listener) => {
                    Self::listener_event(&mut ctx, token, listener, &stimulus);
                    ConnAction::Keep
                }
                LoopEntry::WorkerWake(widx) => {
                    if let Some(target) = ctx.factory.complete(*widx) {
                        ctx.lp.post(target, Message::WorkerComplete);
                    }
                    ConnAction::Keep
                }
                LoopEntry::Shutdown => ConnAction::Keep,
            }
        };

        match action {
            ConnAction::Keep => self.objects.put(token, entry),
            ConnAction::Close { good } => self.finalize_entry(token, entry, good),
        }
    }

    fn listener_event(
        ctx: &mut Ctx,
        token: Token,
        listener: &mut ListenerEntry,
        stimulus: &Stimulus,
    ) {
        match stimulus {
            Stimulus::Io(readiness) if readiness.readable => {
                Self::accept_connections(ctx, token, listener)
            }
            Stimulus::Msg(Message::Timeout(TimerKind::AcceptRetry)) => {
                logging::info!(ctx.log, "retrying accept after an error");
                listener.retry_timer = None;
                Self::accept_connections(ctx, token, listener)
            }
            _ => {}
        }
    }

    fn accept_connections(ctx: &mut Ctx, token: Token, listener: &mut ListenerEntry) {
        if let Some(handle) = listener.retry_timer.take() {
            ctx.lp.unset_timer(handle);
        }
        while !ctx.shutting_down && listener.accepting {
            match listener.sock.accept() {
                Ok((sock, peer)) => {
                    if sock.set_nodelay(true).is_err() {
                        logging::error!(ctx.log, "failed to setup client socket");
                        continue;
                    }
                    let uid = ctx.generate_uid();
                    let mut conn = Box::new(HttpServerConnection::new(
                        sock,
                        peer.ip().to_string(),
                        listener.secure,
                        ctx.buf_pool.take(),
                        ctx.buf_pool.take(),
                    ));
                    conn.uid = uid;
                    conn.connected_time = ctx.lp.current_time;
                    let conn_token = ctx.objects.insert(LoopEntry::Conn(conn));
                    let registered = {
                        let conn = ctx
                            .objects
                            .conn_mut(conn_token)
                            .expect("conn inserted above");
                        conn.register(ctx.lp, conn_token)
                    };
                    if registered.is_err() {
                        ctx.objects.release(conn_token);
                        continue;
                    }
                    let handle = ctx.lp.set_timer(TimerKind::KeepAlive, conn_token);
                    if let Some(conn) = ctx.objects.conn_mut(conn_token) {
                        conn.idle_timer = Some(handle);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::error!(ctx.log, "accept() failed"; "err" => %err);
                    // retry accept after timeout
                    listener.retry_timer = Some(ctx.lp.set_timer(TimerKind::AcceptRetry, token));
                    break;
                }
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        logging::error!(self.log, "shutting down net thread");
        self.shutting_down = true;
        // stop accepting
        for slot in self.objects.slots.iter_mut() {
            if let Some(LoopEntry::Listener(listener)) = slot.as_mut() {
                listener.accepting = false;
                self.lp.deregister(&listener.sock).ok();
            }
        }
        // close idle backend connections
        let idle_tokens: Vec<Token> = self
            .proxies
            .iter_mut()
            .flat_map(|pool| pool.drain_idle())
            .collect();
        for token in idle_tokens {
            if let Some(entry) = self.objects.take(token) {
                self.finalize_entry(token, entry, true);
            }
        }
        self.log_buf.flush();
    }

    /// Drop a loop object, cascading into its dependents.
    fn finalize_entry(&mut self, token: Token, entry: LoopEntry, good: bool) {
        match entry {
            LoopEntry::Conn(conn) => {
                let subrequests = conn.subrequest_tokens();
                for sub in subrequests {
                    if let Some(sub_entry) = self.objects.take(sub) {
                        self.finalize_entry(sub, sub_entry, good);
                    }
                }
                let mut conn = conn;
                conn.finalize(
                    &mut self.lp,
                    &mut self.pipes,
                    &mut self.buf_pool,
                    &mut self.log_buf,
                    good,
                );
                self.objects.free.push(token.0);
            }
            LoopEntry::Proxy(mut proxy) => {
                proxy.finalize(&mut self.lp, &mut self.pipes, &mut self.proxies);
                self.objects.free.push(token.0);
            }
            _ => {
                self.objects.put(token, entry);
            }
        }
    }

    fn finalize(&mut self) {
        self.factory.finalize();
        self.log_buf.flush();
        logging::error!(self.log, "network thread clean exit");
    }
}

/// The server: binds listen sockets, runs net threads, coordinates
/// shutdown.
pub struct Server {
    runtime: Arc<ServerRuntime>,
    listeners: Vec<(usize, std::net::TcpListener, bool)>,
    pub shutdown: Arc<ShutdownControl>,
    log: Logger,
}

impl Server {
    /// Bind every configured listen address. A bind failure is fatal
    /// for startup.
    pub fn new(runtime: ServerRuntime, log: Logger) -> io::Result<Server> {
        let mut listeners = Vec::new();
        for (idx, lconf) in runtime.config.listen.iter().enumerate() {
            if idx >= crate::MAX_LISTEN_SOCKETS {
                break;
            }
            let address = if lconf.address.starts_with(':') {
                format!("0.0.0.0{}", lconf.address)
            } else {
                lconf.address.clone()
            };
            logging::error!(log, "binding"; "address" => %address, "secure" => lconf.secure);
            let sock = std::net::TcpListener::bind(&address)?;
            sock.set_nonblocking(true)?;
            listeners.push((idx, sock, lconf.secure));
        }
        Ok(Server {
            runtime: Arc::new(runtime),
            listeners,
            shutdown: Arc::new(ShutdownControl::new()),
            log,
        })
    }

    /// Number of net threads: one per core, capped.
    pub fn net_thread_count(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.runtime
            .config
            .net_threads
            .unwrap_or(cores)
            .min(crate::MAX_NET_THREADS)
            .max(1)
    }

    /// Run until shutdown is triggered. Blocks the calling thread.
    pub fn run(&self) -> io::Result<()> {
        let thread_count = self.net_thread_count();
        logging::error!(self.log, "server startup";
                        "net_threads" => thread_count,
                        "handlers" => self.runtime.registry.len());
        for reg in self.runtime.registry.iter() {
            logging::error!(self.log, "handler registered";
                            "name" => reg.name,
                            "priority" => reg.priority,
                            "prefix" => %reg.prefix.as_deref().unwrap_or(""));
        }

        let mut handles = Vec::new();
        for thread_num in 0..thread_count {
            let (registration, wake) = Registration::new2();
            self.shutdown.add_wake(wake.clone());
            let runtime = self.runtime.clone();
            let log = self
                .log
                .new(logging::o!("net_thread" => thread_num));
            let mut thread_listeners = Vec::new();
            for (idx, sock, secure) in &self.listeners {
                let dup = sock.try_clone()?;
                dup.set_nonblocking(true)?;
                thread_listeners.push((*idx, TcpListener::from_std(dup)?, *secure));
            }
            let handle = std::thread::Builder::new()
                .name(format!("nxweb-net-{}", thread_num))
                .spawn(move || {
                    let mut thread = NetThread::new(
                        thread_num as u8,
                        runtime,
                        thread_listeners,
                        (registration, wake),
                        log.clone(),
                    )
                    .expect("can't initialize network thread");
                    thread.run();
                })
                .expect("can't start network thread");
            handles.push(handle);
        }

        // monitor the shutdown flag; the signal handler only sets it
        let shutdown = self.shutdown.clone();
        let monitor = std::thread::spawn(move || loop {
            if shutdown.is_triggered() {
                shutdown.fire_all();
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        });

        for handle in handles {
            handle.join().ok();
        }
        self.shutdown.trigger();
        monitor.join().ok();
        crate::access_log::stop();
        logging::error!(self.log, "end of server run");
        Ok(())
    }
}

/// Map a pre-headers peer disconnect to a quiet close, everything
/// else to an abnormal one.
pub(crate) fn close_is_good(err: StreamError, headers_bytes_received: usize) -> bool {
    headers_bytes_received == 0 && err.is_peer_close()
}

pub use mio::Token as LoopToken;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objects_slab_reuse() {
        let mut objects = Objects::new();
        let a = objects.insert(LoopEntry::Shutdown);
        let b = objects.insert(LoopEntry::WorkerWake(0));
        assert_ne!(a, b);
        objects.release(a);
        let c = objects.insert(LoopEntry::WorkerWake(1));
        assert_eq!(a, c);
        assert!(objects.take(b).is_some());
        assert!(objects.take(b).is_none());
    }

    #[test]
    fn test_unique_id_shape() {
        let mut lp = EventLoop::new(8).unwrap();
        lp.current_time = 123_456_789;
        let mut objects = Objects::new();
        let mut pipes = PipeTable::new();
        let mut factory = Factory::new();
        let mut proxies = Vec::new();
        let runtime = ServerRuntime::new(Config::default(), HandlerRegistry::new()).unwrap();
        let mut log_buf = LogBuffer::new();
        let mut buf_pool = Pool::new(new_rbuf, 2);
        let log = crate::logging::discard();
        let mut counter = 0u64;
        let mut ctx = Ctx {
            lp: &mut lp,
            objects: &mut objects,
            pipes: &mut pipes,
            factory: &mut factory,
            proxies: &mut proxies,
            runtime: &runtime,
            log_buf: &mut log_buf,
            buf_pool: &mut buf_pool,
            log: &log,
            thread_num: 3,
            unique_counter: &mut counter,
            shutting_down: false,
        };
        let a = ctx.generate_uid();
        let b = ctx.generate_uid();
        assert_ne!(a, b);
        assert_eq!(a >> 56, 3);
        assert_eq!(a & 0xf_ffff_ffff, 1);
        assert_eq!(b & 0xf_ffff_ffff, 2);
        let formatted = crate::http::format_uid(a);
        assert_eq!(formatted.len(), 16);
        assert!(formatted.starts_with("03"));
    }

    #[test]
    fn test_close_is_good() {
        assert!(close_is_good(StreamError::RdClosed, 0));
        assert!(close_is_good(StreamError::Hup, 0));
        assert!(!close_is_good(StreamError::RdClosed, 10));
        assert!(!close_is_good(StreamError::Error, 0));
    }

    #[test]
    fn test_subrequest_dispatch_end_to_end() {
        struct Hi;
        impl Handler for Hi {
            fn on_request(
                &self,
                _reg: &HandlerReg,
                _req: &mut Request,
                resp: &mut Response,
            ) -> HandlerResult {
                resp.send_data(b"hello body", "text/plain");
                HandlerResult::Ok
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register(
            HandlerBuilder::new("hi", Arc::new(Hi))
                .prefix("/hello")
                .priority(100)
                .build(),
        );
        let runtime = Arc::new(ServerRuntime::new(Config::default(), registry).unwrap());
        let mut thread = NetThread::new(
            0,
            runtime,
            Vec::new(),
            Registration::new2(),
            crate::logging::discard(),
        )
        .unwrap();

        // spawn a subrequest owned by a dummy parent token; deliveries
        // to the missing parent are dropped harmlessly
        let pipe = {
            let mut ctx = Ctx {
                lp: &mut thread.lp,
                objects: &mut thread.objects,
                pipes: &mut thread.pipes,
                factory: &mut thread.factory,
                proxies: &mut thread.proxies,
                runtime: &thread.runtime,
                log_buf: &mut thread.log_buf,
                buf_pool: &mut thread.buf_pool,
                log: &thread.log,
                thread_num: 0,
                unique_counter: &mut thread.unique_counter,
                shutting_down: false,
            };
            let pipe = ctx.pipes.create(crate::RBUF_SIZE);
            // dot segments are normalised before dispatch
            ctx.spawn_subrequest(
                Token(999_999),
                None,
                "/a/../hello",
                1,
                0,
                "test.host",
                "127.0.0.1",
                false,
                pipe,
            );
            pipe
        };
        assert_eq!(thread.objects.conn_count(), 1);

        thread.drain_messages();

        // the child dispatched, produced its body into the pipe and
        // went away
        assert_eq!(thread.objects.conn_count(), 0);
        let pipe_ref = thread.pipes.get(pipe);
        assert!(pipe_ref.eof);
        assert_eq!(pipe_ref.buf.read_slice(), b"hello body");
    }

    #[test]
    fn test_async_composite_starts_on_subrequest_done() {
        struct Inner;
        impl Handler for Inner {
            fn on_request(
                &self,
                _reg: &HandlerReg,
                _req: &mut Request,
                resp: &mut Response,
            ) -> HandlerResult {
                resp.send_data(b"-inner-", "text/plain");
                HandlerResult::Ok
            }
        }

        struct Page;
        impl Handler for Page {
            fn on_headers(
                &self,
                _reg: &HandlerReg,
                ctx: &mut dyn handler::HandlerCtx,
                _req: &mut Request,
                resp: &mut Response,
            ) -> HandlerResult {
                ctx.composite_start();
                ctx.composite_append_bytes(b"[");
                ctx.composite_append_subrequest(None, "/hello");
                ctx.composite_append_bytes(b"]");
                ctx.composite_close();
                resp.set_content_type("text/html");
                HandlerResult::Ok
            }

            fn on_request(
                &self,
                _reg: &HandlerReg,
                _req: &mut Request,
                _resp: &mut Response,
            ) -> HandlerResult {
                // deferred: the first SubrequestDone starts the send
                HandlerResult::Async
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register(
            HandlerBuilder::new("page", Arc::new(Page))
                .prefix("/page")
                .priority(100)
                .build(),
        );
        registry.register(
            HandlerBuilder::new("inner", Arc::new(Inner))
                .prefix("/hello")
                .priority(200)
                .build(),
        );
        let runtime = Arc::new(ServerRuntime::new(Config::default(), registry).unwrap());
        let mut thread = NetThread::new(
            0,
            runtime,
            Vec::new(),
            Registration::new2(),
            crate::logging::discard(),
        )
        .unwrap();

        let pipe = {
            let mut ctx = Ctx {
                lp: &mut thread.lp,
                objects: &mut thread.objects,
                pipes: &mut thread.pipes,
                factory: &mut thread.factory,
                proxies: &mut thread.proxies,
                runtime: &thread.runtime,
                log_buf: &mut thread.log_buf,
                buf_pool: &mut thread.buf_pool,
                log: &thread.log,
                thread_num: 0,
                unique_counter: &mut thread.unique_counter,
                shutting_down: false,
            };
            let pipe = ctx.pipes.create(crate::RBUF_SIZE);
            ctx.spawn_subrequest(
                Token(999_999),
                None,
                "/page",
                1,
                0,
                "test.host",
                "127.0.0.1",
                false,
                pipe,
            );
            pipe
        };

        thread.drain_messages();

        // both the page and its spliced child have completed
        assert_eq!(thread.objects.conn_count(), 0);
        let pipe_ref = thread.pipes.get(pipe);
        assert!(pipe_ref.eof);
        assert_eq!(pipe_ref.buf.read_slice(), b"[-inner-]");
    }

    #[test]
    fn test_subrequest_falls_back_to_404() {
        let runtime =
            Arc::new(ServerRuntime::new(Config::default(), HandlerRegistry::new()).unwrap());
        let mut thread = NetThread::new(
            0,
            runtime,
            Vec::new(),
            Registration::new2(),
            crate::logging::discard(),
        )
        .unwrap();
        let pipe = {
            let mut ctx = Ctx {
                lp: &mut thread.lp,
                objects: &mut thread.objects,
                pipes: &mut thread.pipes,
                factory: &mut thread.factory,
                proxies: &mut thread.proxies,
                runtime: &thread.runtime,
                log_buf: &mut thread.log_buf,
                buf_pool: &mut thread.buf_pool,
                log: &thread.log,
                thread_num: 0,
                unique_counter: &mut thread.unique_counter,
                shutting_down: false,
            };
            let pipe = ctx.pipes.create(crate::RBUF_SIZE);
            ctx.spawn_subrequest(
                Token(999_999),
                None,
                "/missing",
                1,
                0,
                "test.host",
                "127.0.0.1",
                false,
                pipe,
            );
            pipe
        };
        thread.drain_messages();
        let pipe_ref = thread.pipes.get(pipe);
        assert!(pipe_ref.eof);
        let body = String::from_utf8(pipe_ref.buf.read_slice().to_vec()).unwrap();
        assert!(body.contains("Not Found"));
        assert!(body.contains(&format!("nxweb/{}", crate::REVISION)));
    }
}

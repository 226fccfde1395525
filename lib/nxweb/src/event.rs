//! The per-thread event loop: poll driver, FIFO event delivery,
//! multi-cast publishers, and the fixed-timeout timer queues.
//!
//! Components implement interfaces (content sources, sinks,
//! publishers, subscribers, timers); events are generated either
//! physically (from the poller) or virtually (posted by components)
//! and delivered in FIFO order.

use crate::error::StreamError;
use hashbrown::HashSet;
use lazy_static::lazy_static;
use mio::unix::UnixReady;
use mio::Token;
use mio::{Evented, Events, Poll, PollOpt, Ready};
use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

lazy_static! {
    // one timebase for every loop; the process-global cache compares
    // expiry deadlines across net threads
    static ref MONOTONIC_EPOCH: Instant = Instant::now();
}

pub const NUMBER_OF_TIMER_QUEUES: usize = 8;

/// Timer queue assignment. Each queue has a single configured
/// timeout, so deadlines within a queue are naturally ordered.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimerKind {
    KeepAlive = 0,
    Read = 1,
    Write = 2,
    Backend = 3,
    Continue100 = 4,
    AcceptRetry = 5,
}

/// A delivery from a sender to a receiver, keyed by the receiver's
/// token. Data is small and copyable.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Message {
    /// Server protocol parsed a complete request head.
    RequestReceived,
    /// Buffered/streamed request body completed.
    RequestBodyReceived,
    /// Request fully answered; protocol is cleaning up.
    RequestComplete,
    /// Subrequest response head is ready.
    ResponseReady,
    /// A subrequest of this connection finished (ok or failed).
    SubrequestDone { sub: Token, ok: bool },
    /// Run the dispatcher (scheduled callback for subrequests).
    Dispatch,
    /// A producer put bytes into a pipe this connection consumes.
    ContentAvailable,
    /// A consumer freed space in a pipe this connection fills.
    ContentConsumed,
    /// Worker thread finished this connection's job.
    WorkerComplete,
    /// The backend answered a proxied request; the proxy connection
    /// holds the parsed response head.
    BackendResponse { proxy: Token },
    /// The backend connection failed before delivering a response.
    BackendFailed { proxy: Token, timeout: bool },
    /// Loop idle; compact pools and flush logs.
    Gc,
    /// Stream or protocol failure.
    Error(StreamError),
    /// A timer fired.
    Timeout(TimerKind),
}

struct TimerEntry {
    deadline: u64,
    token: Token,
    kind: TimerKind,
    seq: u64,
}

struct TimerQueue {
    timeout: u64,
    entries: VecDeque<TimerEntry>,
}

/// Cancellable handle for a scheduled timer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TimerHandle {
    queue: usize,
    seq: u64,
}

/// Multi-cast message bus. Publishing enqueues one FIFO delivery per
/// current subscriber.
pub struct Publisher {
    subs: Vec<Token>,
}

impl Publisher {
    pub fn new() -> Publisher {
        Publisher { subs: Vec::new() }
    }

    pub fn subscribe(&mut self, sub: Token) {
        if !self.subs.contains(&sub) {
            self.subs.push(sub);
        }
    }

    pub fn unsubscribe(&mut self, sub: Token) {
        self.subs.retain(|s| *s != sub);
    }

    pub fn publish(&self, lp: &mut EventLoop, msg: Message) {
        for sub in &self.subs {
            lp.post(*sub, msg);
        }
    }
}

/// Readiness reported for one registered fd.
#[derive(Debug, Copy, Clone)]
pub struct IoReadiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub hup: bool,
    pub error: bool,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    started: Instant,

    /// Monotonic microseconds, refreshed once per poll wake-up.
    pub current_time: u64,
    http_time: u64,
    http_time_str: String,
    iso8601_time_str: String,

    queue: VecDeque<(Token, Message)>,
    timers: Vec<TimerQueue>,
    timer_seq: u64,
    cancelled: HashSet<u64>,
}

impl EventLoop {
    pub fn new(max_events: usize) -> io::Result<EventLoop> {
        let mut lp = EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events),
            started: *MONOTONIC_EPOCH,
            current_time: 0,
            http_time: 0,
            http_time_str: String::new(),
            iso8601_time_str: String::new(),
            queue: VecDeque::new(),
            timers: (0..NUMBER_OF_TIMER_QUEUES)
                .map(|_| TimerQueue {
                    timeout: 0,
                    entries: VecDeque::new(),
                })
                .collect(),
            timer_seq: 0,
            cancelled: HashSet::new(),
        };
        lp.refresh_time();
        Ok(lp)
    }

    /// Edge-triggered read/write/hup interest used for every data fd.
    #[inline]
    pub fn interest_rw() -> Ready {
        Ready::readable() | Ready::writable() | Ready::from(UnixReady::hup() | UnixReady::error())
    }

    pub fn register<E: Evented>(&self, handle: &E, token: Token, interest: Ready) -> io::Result<()> {
        self.poll.register(handle, token, interest, PollOpt::edge())
    }

    pub fn deregister<E: Evented>(&self, handle: &E) -> io::Result<()> {
        self.poll.deregister(handle)
    }

    /// Refresh the cached clocks. The formatted date strings are
    /// rebuilt at 1 s resolution.
    pub fn refresh_time(&mut self) {
        let elapsed = self.started.elapsed();
        self.current_time = elapsed.as_secs() * 1_000_000 + u64::from(elapsed.subsec_micros());
        let unix_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if unix_now != self.http_time {
            self.http_time = unix_now;
            self.http_time_str = crate::http::date::format_http_time(unix_now);
            self.iso8601_time_str = crate::http::date::format_iso8601_time(unix_now);
        }
    }

    #[inline]
    pub fn http_time(&self) -> u64 {
        self.http_time
    }

    #[inline]
    pub fn http_time_str(&self) -> &str {
        &self.http_time_str
    }

    #[inline]
    pub fn iso8601_time_str(&self) -> &str {
        &self.iso8601_time_str
    }

    /// Enqueue a delivery. FIFO with every other pending event.
    #[inline]
    pub fn post(&mut self, token: Token, msg: Message) {
        self.queue.push_back((token, msg));
    }

    /// Next pending delivery.
    #[inline]
    pub fn take_event(&mut self) -> Option<(Token, Message)> {
        self.queue.pop_front()
    }

    #[inline]
    pub fn has_events(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn set_timer_queue_timeout(&mut self, kind: TimerKind, usec: u64) {
        self.timers[kind as usize].timeout = usec;
    }

    /// Schedule on the fixed-timeout queue; deadline = now + queue
    /// timeout. Inserts are monotonic so the queue stays ordered.
    pub fn set_timer(&mut self, kind: TimerKind, token: Token) -> TimerHandle {
        let queue = kind as usize;
        self.timer_seq += 1;
        let seq = self.timer_seq;
        let deadline = self.current_time + self.timers[queue].timeout;
        self.timers[queue].entries.push_back(TimerEntry {
            deadline,
            token,
            kind,
            seq,
        });
        TimerHandle { queue, seq }
    }

    pub fn unset_timer(&mut self, handle: TimerHandle) {
        self.cancelled.insert(handle.seq);
    }

    /// Earliest pending deadline across all queues.
    fn next_deadline(&mut self) -> Option<u64> {
        let mut next: Option<u64> = None;
        for tq in &mut self.timers {
            while let Some(front) = tq.entries.front() {
                if self.cancelled.remove(&front.seq) {
                    tq.entries.pop_front();
                    continue;
                }
                break;
            }
            if let Some(front) = tq.entries.front() {
                next = Some(match next {
                    Some(cur) => cur.min(front.deadline),
                    None => front.deadline,
                });
            }
        }
        next
    }

    /// Post timeout messages for every due timer.
    pub fn fire_due_timers(&mut self) {
        let now = self.current_time;
        for qi in 0..self.timers.len() {
            loop {
                let fire = match self.timers[qi].entries.front() {
                    Some(front) => {
                        if self.cancelled.remove(&front.seq) {
                            self.timers[qi].entries.pop_front();
                            continue;
                        }
                        front.deadline <= now
                    }
                    None => false,
                };
                if !fire {
                    break;
                }
                let entry = self.timers[qi]
                    .entries
                    .pop_front()
                    .expect("due timer present");
                self.queue.push_back((entry.token, Message::Timeout(entry.kind)));
            }
        }
    }

    /// Block for I/O readiness. Returns readiness records; an empty
    /// result means the wake-up was timer-driven or idle (gc point).
    pub fn poll_io(&mut self, out: &mut Vec<IoReadiness>, max_wait: Duration) -> io::Result<()> {
        let timeout = match self.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_sub(self.current_time);
                Duration::from_micros(wait).min(max_wait)
            }
            None => max_wait,
        };
        self.poll.poll(&mut self.events, Some(timeout))?;
        self.refresh_time();
        out.clear();
        for event in &self.events {
            let ready = event.readiness();
            let unix = UnixReady::from(ready);
            out.push(IoReadiness {
                token: event.token(),
                readable: ready.is_readable(),
                writable: ready.is_writable(),
                hup: unix.is_hup(),
                error: unix.is_error(),
            });
        }
        Ok(())
    }
}

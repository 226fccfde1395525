//! Worker thread factory. Handlers flagged to run in a worker get
//! their blocking callback executed on one of these threads; the
//! completion is signalled back to the owning net thread through a
//! readiness wake registered with its poll.

use mio::{Ready, Registration, SetReadiness, Token};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

pub const MAX_WORKERS: usize = 512;
pub const MAX_IDLE_WORKERS: usize = 16;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    sender: mpsc::Sender<Job>,
    handle: Option<JoinHandle<()>>,
    registration: Registration,
    completion: SetReadiness,
    job_done: Arc<AtomicBool>,
    target: Option<Token>,
}

/// Per-net-thread pool of worker threads.
pub struct Factory {
    workers: Vec<Option<Worker>>,
    free_slots: Vec<usize>,
    idle: Vec<usize>,
    count: usize,
}

impl Factory {
    pub fn new() -> Factory {
        Factory {
            workers: Vec::new(),
            free_slots: Vec::new(),
            idle: Vec::new(),
            count: 0,
        }
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.count
    }

    /// Take an idle worker, or spawn one if under the limit. Returns
    /// the worker slot plus true when the worker is freshly spawned
    /// and its registration still needs to go onto the poll.
    pub fn acquire(&mut self) -> Option<(usize, bool)> {
        if let Some(idx) = self.idle.pop() {
            return Some((idx, false));
        }
        if self.count >= MAX_WORKERS {
            return None;
        }

        let (sender, receiver) = mpsc::channel::<Job>();
        let (registration, completion) = Registration::new2();
        let job_done = Arc::new(AtomicBool::new(false));

        let thread_done = job_done.clone();
        let thread_completion = completion.clone();
        let handle = std::thread::Builder::new()
            .name("nxweb-worker".to_owned())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                    thread_done.store(true, Ordering::SeqCst);
                    thread_completion
                        .set_readiness(Ready::readable())
                        .expect("worker completion wake failed");
                }
            })
            .expect("can't spawn worker thread");

        let worker = Worker {
            sender,
            handle: Some(handle),
            registration,
            completion,
            job_done,
            target: None,
        };
        let idx = match self.free_slots.pop() {
            Some(idx) => {
                self.workers[idx] = Some(worker);
                idx
            }
            None => {
                self.workers.push(Some(worker));
                self.workers.len() - 1
            }
        };
        self.count += 1;
        Some((idx, true))
    }

    /// The poll registration of a worker (register once per worker).
    pub fn registration(&self, idx: usize) -> &Registration {
        &self.workers[idx].as_ref().expect("live worker").registration
    }

    /// Dispatch a job on an acquired worker, recording which
    /// connection to notify on completion.
    pub fn start_job(&mut self, idx: usize, target: Token, job: Job) {
        let worker = self.workers[idx].as_mut().expect("live worker");
        worker.job_done.store(false, Ordering::SeqCst);
        worker.target = Some(target);
        worker
            .sender
            .send(job)
            .expect("worker thread died with queued job");
    }

    /// Handle a completion wake: clear the readiness, spin briefly on
    /// the done flag if the wake raced ahead of it, return the worker
    /// to the idle list and report the waiting connection. A wake for
    /// an already-stopped worker is ignored.
    pub fn complete(&mut self, idx: usize) -> Option<Token> {
        let target = {
            let worker = self.workers.get_mut(idx)?.as_mut()?;
            worker
                .completion
                .set_readiness(Ready::empty())
                .expect("worker completion reset failed");
            while !worker.job_done.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            worker.target.take()
        };
        self.idle.push(idx);
        target
    }

    /// True if the worker currently holds this connection's job.
    pub fn is_running_for(&self, idx: usize, token: Token) -> bool {
        self.workers[idx]
            .as_ref()
            .map(|w| w.target == Some(token))
            .unwrap_or(false)
    }

    fn stop_worker(&mut self, idx: usize) {
        if let Some(mut worker) = self.workers[idx].take() {
            drop(worker.sender);
            if let Some(handle) = worker.handle.take() {
                handle.join().ok();
            }
            self.free_slots.push(idx);
            self.count -= 1;
        }
    }

    /// Trim idle workers beyond the keep level.
    pub fn gc(&mut self) {
        while self.idle.len() > MAX_IDLE_WORKERS {
            let idx = self.idle.pop().expect("idle list non-empty");
            self.stop_worker(idx);
        }
    }

    /// Stop everything. Called on net thread shutdown.
    pub fn finalize(&mut self) {
        for idx in 0..self.workers.len() {
            self.stop_worker(idx);
        }
        self.idle.clear();
    }
}

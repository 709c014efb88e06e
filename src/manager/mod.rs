//! The network manager.
//!
//! # Data Flow
//! ```text
//! Manager::new(n)
//!     → n worker threads (worker.rs), one current-thread runtime each
//!     → Core: settings, socket arena, statistics, memory context
//!
//! listen_* / *_connect (net/)
//!     → socket registered in the arena
//!     → driver task spawned on the owning worker
//!     → callbacks run on that worker only
//!
//! task_enqueue / work_offload
//!     → job queue of a worker / blocking pool, then back to the worker
//! ```
//!
//! # Design Decisions
//! - A socket never migrates between workers
//! - Settings are an atomically swapped snapshot; readers never block
//! - Sockets refer to the core, not to the manager; dropping the last
//!   `Manager` starts shutdown even while listeners exist

pub mod settings;
pub(crate) mod worker;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use rand::Rng;

use crate::error::{NetError, Result};
use crate::mem::MemContext;
use crate::net::socket::{SocketId, SocketInner};
use crate::net::SocketKind;
use crate::observability::{StatCounter, StatsSink};

pub use settings::{NetBuffers, Settings, Timeouts};
use worker::{Control, Job, PauseGate, Worker, WorkerEvent, WorkerHandle};

static MANAGER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// State shared by the manager, its sockets and its handles.
pub(crate) struct Core {
    id: u64,
    workers: Vec<WorkerHandle>,
    settings: ArcSwap<Settings>,
    sockets: DashMap<SocketId, Arc<SocketInner>>,
    pause: Arc<PauseGate>,
    stats: OnceLock<Arc<dyn StatsSink>>,
    mem: MemContext,
    shutting_down: AtomicBool,
    manager: Weak<ManagerInner>,
}

impl Core {
    pub(crate) fn nworkers(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub(crate) fn mem(&self) -> &MemContext {
        &self.mem
    }

    pub(crate) fn manager(&self) -> Option<Manager> {
        self.manager.upgrade().map(|inner| Manager { inner })
    }

    /// Worker index of the calling thread within this manager.
    pub(crate) fn local_tid(&self) -> Option<usize> {
        worker::local_tid(self.id)
    }

    /// The caller's own worker, or a random one from outside the pool.
    pub(crate) fn pick_tid(&self) -> usize {
        self.local_tid()
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..self.nworkers()))
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn submit(&self, tid: usize, job: Job) -> std::result::Result<(), Job> {
        match self.workers[tid].jobs.send(WorkerEvent::Job(job)) {
            Ok(()) => Ok(()),
            Err(err) => match err.0 {
                WorkerEvent::Job(job) => Err(job),
                WorkerEvent::Stop => Ok(()),
            },
        }
    }

    /// Queue `job` on worker `tid`. Once the worker is gone the job runs inline.
    pub(crate) fn enqueue<F>(&self, tid: usize, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(job) = self.submit(tid, Box::new(job)) {
            job();
        }
    }

    /// Spawn a task on worker `tid`'s runtime.
    ///
    /// If the worker has stopped the future is dropped without being polled.
    pub(crate) fn spawn_on<F>(&self, tid: usize, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.local_tid() == Some(tid) {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(fut);
            }
            return;
        }
        let _ = self.submit(
            tid,
            Box::new(move || {
                tokio::spawn(fut);
            }),
        );
    }

    /// Run `job` once per worker, on the calling thread, inside that
    /// worker's runtime context.
    ///
    /// Sockets registered and tasks spawned by `job` belong to the worker,
    /// but nothing waits for it: paused or busy workers pick the tasks up
    /// when they next poll.
    pub(crate) fn register_on_all<F>(&self, mut job: F)
    where
        F: FnMut(usize),
    {
        for (tid, worker) in self.workers.iter().enumerate() {
            let _runtime = worker.runtime.enter();
            job(tid);
        }
    }

    pub(crate) fn register(&self, sock: Arc<SocketInner>) {
        self.stat(sock.kind, StatCounter::Open);
        self.stat(sock.kind, StatCounter::Active);
        self.sockets.insert(sock.id, sock);
    }

    pub(crate) fn unregister(&self, id: SocketId, kind: SocketKind) {
        if self.sockets.remove(&id).is_some() {
            self.stat(kind, StatCounter::Close);
            self.stat_decrement(kind, StatCounter::Active);
        }
    }

    pub(crate) fn socket(&self, id: SocketId) -> Option<Arc<SocketInner>> {
        self.sockets.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub(crate) fn stat(&self, kind: SocketKind, counter: StatCounter) {
        if let Some(stats) = self.stats.get() {
            stats.increment(kind, counter);
        }
    }

    pub(crate) fn stat_decrement(&self, kind: SocketKind, counter: StatCounter) {
        if let Some(stats) = self.stats.get() {
            stats.decrement(kind, counter);
        }
    }

    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(
            workers = self.nworkers(),
            sockets = self.socket_count(),
            "Network manager shutting down"
        );

        self.pause.release();

        // Collect first: closing a socket removes it from the arena.
        let sockets: Vec<_> = self.sockets.iter().map(|e| e.value().clone()).collect();
        for sock in sockets {
            sock.close(Some(NetError::ShuttingDown));
        }

        for worker in &self.workers {
            let _ = worker.jobs.send(WorkerEvent::Stop);
        }
    }
}

pub(crate) struct ManagerInner {
    core: Arc<Core>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

/// Owner of the worker pool. Cloning attaches, dropping detaches.
///
/// When the last `Manager` goes away every socket is closed, active read
/// callbacks receive [`NetError::ShuttingDown`], and the workers stop.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("workers", &self.workers())
            .field("sockets", &self.inner.core.socket_count())
            .finish()
    }
}

impl Manager {
    /// Start a manager with `workers` I/O threads.
    ///
    /// # Panics
    /// Panics if `workers` is zero.
    pub fn new(workers: usize) -> Result<Manager> {
        assert!(workers > 0, "a network manager needs at least one worker");

        let id = MANAGER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let pause = Arc::new(PauseGate::default());
        let mut handles = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);
        for tid in 0..workers {
            let (handle, thread) = Worker::spawn(id, tid, pause.clone())?;
            handles.push(handle);
            threads.push(thread);
        }

        let inner = Arc::new_cyclic(|weak| ManagerInner {
            core: Arc::new(Core {
                id,
                workers: handles,
                settings: ArcSwap::from_pointee(Settings::default()),
                sockets: DashMap::new(),
                pause,
                stats: OnceLock::new(),
                mem: MemContext::new("netmgr"),
                shutting_down: AtomicBool::new(false),
                manager: weak.clone(),
            }),
            threads: Mutex::new(threads),
        });

        tracing::info!(workers, "Network manager started");
        Ok(Manager { inner })
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.inner.core.nworkers()
    }

    /// Worker index of the calling thread, or `None` off the pool.
    pub fn tid() -> Option<usize> {
        worker::current_tid()
    }

    /// Pretend the calling thread is worker `tid`. Test support only.
    #[doc(hidden)]
    pub fn force_tid(tid: Option<usize>) {
        worker::set_current(tid.map(|tid| (0, tid)));
    }

    pub fn memctx(&self) -> &MemContext {
        self.inner.core.mem()
    }

    /// Number of sockets that have not finished closing.
    pub fn socket_count(&self) -> usize {
        self.inner.core.socket_count()
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.inner.core.settings()
    }

    pub fn set_timeouts(&self, timeouts: Timeouts) {
        self.inner.core.settings.rcu(|current| Settings {
            timeouts,
            ..(**current).clone()
        });
    }

    pub fn timeouts(&self) -> Timeouts {
        self.settings().timeouts
    }

    pub fn set_net_buffers(&self, buffers: NetBuffers) {
        self.inner.core.settings.rcu(|current| Settings {
            buffers,
            ..(**current).clone()
        });
    }

    pub fn net_buffers(&self) -> NetBuffers {
        self.settings().buffers
    }

    /// Cap the size of UDP datagrams; larger ones are silently dropped.
    pub fn set_max_udp(&self, max_udp: usize) {
        self.inner.core.settings.rcu(|current| Settings {
            max_udp,
            ..(**current).clone()
        });
    }

    pub fn max_udp(&self) -> usize {
        self.settings().max_udp
    }

    /// Install the statistics sink. Only the first call has an effect.
    pub fn set_stats(&self, stats: Arc<dyn StatsSink>) {
        if self.inner.core.stats.set(stats).is_err() {
            tracing::warn!("Statistics sink already set; ignoring");
        }
    }

    /// Suspend every worker and return once all of them are parked.
    ///
    /// From a worker thread, every other worker is parked; the caller is
    /// quiescent by construction.
    ///
    /// # Panics
    /// Panics if the manager is already paused.
    pub fn pause(&self) {
        let core = &self.inner.core;
        let generation = core.pause.begin();
        let me = core.local_tid();

        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        let mut expected = 0;
        for (tid, worker) in core.workers.iter().enumerate() {
            if Some(tid) == me {
                continue;
            }
            let request = Control::Pause {
                ack: ack_tx.clone(),
                generation,
            };
            if worker.control.send(request).is_ok() {
                expected += 1;
            }
        }
        drop(ack_tx);

        for _ in 0..expected {
            if ack_rx.recv().is_err() {
                break;
            }
        }
        tracing::debug!(workers = expected, "Network manager paused");
    }

    /// Let paused workers continue.
    ///
    /// # Panics
    /// Panics if the manager is not paused.
    pub fn resume(&self) {
        self.inner.core.pause.end();
        tracing::debug!("Network manager resumed");
    }

    /// Run `task` on a worker: `Some(tid)` is taken modulo the worker count,
    /// `None` picks one at random. Tasks for one worker run in FIFO order.
    pub fn task_enqueue<F>(&self, task: F, tid: Option<usize>)
    where
        F: FnOnce() + Send + 'static,
    {
        let core = &self.inner.core;
        let tid = match tid {
            Some(tid) => tid % core.nworkers(),
            None => rand::thread_rng().gen_range(0..core.nworkers()),
        };
        core.enqueue(tid, task);
    }

    /// Run blocking `work` off the event loop, then `after` with its result
    /// back on the calling worker.
    ///
    /// # Panics
    /// Panics when not called from one of this manager's workers.
    pub fn work_offload<T, W, A>(&self, work: W, after: A)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        A: FnOnce(Result<T>) + Send + 'static,
    {
        let core = &self.inner.core;
        assert!(
            core.local_tid().is_some(),
            "work_offload() must be called from a worker thread"
        );
        if core.is_shutting_down() {
            after(Err(NetError::ShuttingDown));
            return;
        }

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(work).await.map_err(|e| {
                tracing::error!(error = %e, "Offloaded work did not complete");
                NetError::Canceled
            });
            after(result);
        });
    }

    /// Wait for every other reference to go, shut down, and join the workers.
    ///
    /// # Panics
    /// Panics when called from a worker thread.
    pub fn destroy(self) {
        assert!(
            self.inner.core.local_tid().is_none(),
            "destroy() cannot be called from a worker thread"
        );

        while Arc::strong_count(&self.inner) > 1 {
            std::thread::sleep(Duration::from_millis(10));
        }

        self.inner.core.shutdown();
        let threads = std::mem::take(
            &mut *self
                .inner
                .threads
                .lock()
                .unwrap_or_else(|p| p.into_inner()),
        );
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
        tracing::info!("Network manager destroyed");
    }
}

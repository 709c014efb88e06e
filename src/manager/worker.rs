//! Worker threads.
//!
//! Every worker is an OS thread running its own single-threaded tokio
//! runtime. The loop serves two queues: a control queue for pause requests,
//! which always wins, and a FIFO job queue for tasks enqueued from other
//! threads. Socket drivers run as tasks on the same runtime.
//!
//! The runtime is built before the thread starts, so other threads can
//! register sockets with it and spawn onto it without waiting for the loop.
//! Tasks spawned that way first run when the worker next polls.

use std::cell::Cell;
use std::sync::mpsc as std_mpsc;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum WorkerEvent {
    Job(Job),
    Stop,
}

pub(crate) enum Control {
    Pause {
        ack: std_mpsc::Sender<usize>,
        generation: u64,
    },
}

thread_local! {
    static CURRENT: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// Worker index of the calling thread, whichever manager owns it.
pub(crate) fn current_tid() -> Option<usize> {
    CURRENT.with(|c| c.get()).map(|(_, tid)| tid)
}

/// Worker index of the calling thread if it belongs to manager `manager_id`.
pub(crate) fn local_tid(manager_id: u64) -> Option<usize> {
    CURRENT
        .with(|c| c.get())
        .and_then(|(id, tid)| (id == manager_id).then_some(tid))
}

pub(crate) fn set_current(value: Option<(u64, usize)>) {
    CURRENT.with(|c| c.set(value));
}

#[derive(Default)]
struct PauseState {
    paused: bool,
    generation: u64,
}

/// Barrier the workers park on while the manager is paused.
#[derive(Default)]
pub(crate) struct PauseGate {
    state: Mutex<PauseState>,
    resumed: Condvar,
}

impl PauseGate {
    fn lock(&self) -> MutexGuard<'_, PauseState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn begin(&self) -> u64 {
        let mut state = self.lock();
        assert!(!state.paused, "network manager is already paused");
        state.paused = true;
        state.generation += 1;
        state.generation
    }

    pub(crate) fn end(&self) {
        let mut state = self.lock();
        assert!(state.paused, "network manager is not paused");
        state.paused = false;
        self.resumed.notify_all();
    }

    /// Release any parked worker without asserting; used on shutdown.
    pub(crate) fn release(&self) {
        let mut state = self.lock();
        state.paused = false;
        self.resumed.notify_all();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.lock().paused
    }

    fn wait(&self, generation: u64) {
        let mut state = self.lock();
        while state.paused && state.generation == generation {
            state = self
                .resumed
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
    }
}

/// Sending side of a worker's queues.
pub(crate) struct WorkerHandle {
    pub(crate) jobs: mpsc::UnboundedSender<WorkerEvent>,
    pub(crate) control: mpsc::UnboundedSender<Control>,
    pub(crate) runtime: tokio::runtime::Handle,
}

pub(crate) struct Worker {
    manager_id: u64,
    tid: usize,
    jobs: mpsc::UnboundedReceiver<WorkerEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    pause: std::sync::Arc<PauseGate>,
}

impl Worker {
    pub(crate) fn spawn(
        manager_id: u64,
        tid: usize,
        pause: std::sync::Arc<PauseGate>,
    ) -> std::io::Result<(WorkerHandle, JoinHandle<()>)> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let runtime_handle = runtime.handle().clone();
        let (jobs_tx, jobs) = mpsc::unbounded_channel();
        let (control_tx, control) = mpsc::unbounded_channel();
        let worker = Worker {
            manager_id,
            tid,
            jobs,
            control,
            pause,
        };

        let thread = thread::Builder::new()
            .name(format!("netmgr-worker-{tid}"))
            .spawn(move || worker.run(runtime))?;

        Ok((
            WorkerHandle {
                jobs: jobs_tx,
                control: control_tx,
                runtime: runtime_handle,
            },
            thread,
        ))
    }

    fn run(self, runtime: tokio::runtime::Runtime) {
        let tid = self.tid;
        set_current(Some((self.manager_id, tid)));
        tracing::debug!(tid, "Worker started");

        runtime.block_on(self.event_loop());
        // Remaining socket tasks are dropped here, still on this thread.
        drop(runtime);

        set_current(None);
        tracing::debug!(tid, "Worker stopped");
    }

    async fn event_loop(self) {
        let Worker {
            tid,
            mut jobs,
            mut control,
            pause,
            ..
        } = self;

        loop {
            tokio::select! {
                biased;

                Some(ctl) = control.recv() => match ctl {
                    Control::Pause { ack, generation } => {
                        let _ = ack.send(tid);
                        // Blocks the whole runtime: no socket task runs until resume.
                        pause.wait(generation);
                    }
                },

                event = jobs.recv() => match event {
                    Some(WorkerEvent::Job(job)) => job(),
                    Some(WorkerEvent::Stop) | None => break,
                },
            }
        }
    }
}

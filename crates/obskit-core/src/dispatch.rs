#![forbid(unsafe_code)]

//! Hand-off of work to a single designated delivery context.
//!
//! Observables apply posted writes, and notify their observers, on whichever
//! context consumes the dispatch queue. There is exactly one consumer per
//! queue:
//!
//! - [`MainLoop`]: the caller pumps the queue from its own loop (a UI frame
//!   loop, a test) via [`MainLoop::run_pending`] or [`MainLoop::run`].
//! - [`DispatchThread`]: a dedicated thread owns the loop.
//!
//! Producers hold a cloneable [`Dispatcher`] and may live on any thread.
//!
//! # Invariants
//!
//! 1. Tasks run in the order they were dispatched (FIFO).
//! 2. Tasks never run on the dispatching thread unless that thread is the
//!    consumer.
//! 3. After [`Dispatcher::shutdown`] is consumed, the loop drains what is
//!    already queued and then stops.
//!
//! # Example
//!
//! ```
//! use obskit_core::dispatch::MainLoop;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let main = MainLoop::new();
//! let dispatcher = main.dispatcher();
//! let hits = Arc::new(AtomicUsize::new(0));
//!
//! let h = Arc::clone(&hits);
//! dispatcher
//!     .dispatch(Box::new(move || {
//!         h.fetch_add(1, Ordering::SeqCst);
//!     }))
//!     .unwrap();
//!
//! assert_eq!(hits.load(Ordering::SeqCst), 0);
//! main.run_pending();
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::DispatchConfig;
use crate::error::{Error, Result};

/// A unit of work executed on the delivery context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Shutdown,
}

#[derive(Clone)]
enum TaskSender {
    Unbounded(mpsc::Sender<Message>),
    Bounded {
        sender: mpsc::SyncSender<Message>,
        capacity: usize,
    },
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    executed: AtomicU64,
}

/// Producer handle for a dispatch queue.
///
/// Cloning is cheap; all clones feed the same consumer.
#[derive(Clone)]
pub struct Dispatcher {
    sender: TaskSender,
    counters: Arc<Counters>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("capacity", &self.capacity())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Dispatcher {
    /// Queue `task` for the delivery context.
    ///
    /// Blocks while a bounded queue is full. Returns
    /// [`Error::DispatcherClosed`] once the consumer is gone.
    pub fn dispatch(&self, task: Task) -> Result<()> {
        self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
        let sent = match &self.sender {
            TaskSender::Unbounded(sender) => sender.send(Message::Run(task)).is_ok(),
            TaskSender::Bounded { sender, .. } => sender.send(Message::Run(task)).is_ok(),
        };
        if sent {
            Ok(())
        } else {
            self.counters.enqueued.fetch_sub(1, Ordering::SeqCst);
            Err(Error::DispatcherClosed)
        }
    }

    /// Queue `task` without blocking.
    ///
    /// Returns [`Error::QueueFull`] when a bounded queue has no room.
    pub fn try_dispatch(&self, task: Task) -> Result<()> {
        let TaskSender::Bounded { sender, capacity } = &self.sender else {
            return self.dispatch(task);
        };
        self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(Message::Run(task)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.counters.enqueued.fetch_sub(1, Ordering::SeqCst);
                match err {
                    mpsc::TrySendError::Full(_) => Err(Error::QueueFull {
                        capacity: *capacity,
                    }),
                    mpsc::TrySendError::Disconnected(_) => Err(Error::DispatcherClosed),
                }
            }
        }
    }

    /// Ask the consumer to stop after draining already-queued tasks.
    pub fn shutdown(&self) -> Result<()> {
        let sent = match &self.sender {
            TaskSender::Unbounded(sender) => sender.send(Message::Shutdown).is_ok(),
            TaskSender::Bounded { sender, .. } => sender.send(Message::Shutdown).is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(Error::DispatcherClosed)
        }
    }

    /// Tasks queued but not yet executed.
    #[must_use]
    pub fn pending(&self) -> u64 {
        let enqueued = self.counters.enqueued.load(Ordering::SeqCst);
        let executed = self.counters.executed.load(Ordering::SeqCst);
        enqueued.saturating_sub(executed)
    }

    /// Total tasks executed by the consumer so far.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.counters.executed.load(Ordering::SeqCst)
    }

    /// Queue bound, or `None` when unbounded.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        match &self.sender {
            TaskSender::Unbounded(_) => None,
            TaskSender::Bounded { capacity, .. } => Some(*capacity),
        }
    }
}

/// Consumer side of a dispatch queue, pumped by the owning context.
pub struct MainLoop {
    receiver: mpsc::Receiver<Message>,
    dispatcher: Dispatcher,
    batch_limit: usize,
}

impl fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainLoop")
            .field("dispatcher", &self.dispatcher)
            .field("batch_limit", &self.batch_limit)
            .finish()
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl MainLoop {
    /// Create a loop with an unbounded queue and default batch limit.
    #[must_use]
    pub fn new() -> Self {
        Self::build(&DispatchConfig::default())
    }

    /// Create a loop from `config`, validating it first.
    pub fn with_config(config: &DispatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: &DispatchConfig) -> Self {
        let (sender, receiver) = match config.queue_capacity {
            None => {
                let (tx, rx) = mpsc::channel();
                (TaskSender::Unbounded(tx), rx)
            }
            Some(capacity) => {
                let (tx, rx) = mpsc::sync_channel(capacity);
                (
                    TaskSender::Bounded {
                        sender: tx,
                        capacity,
                    },
                    rx,
                )
            }
        };
        Self {
            receiver,
            dispatcher: Dispatcher {
                sender,
                counters: Arc::new(Counters::default()),
            },
            batch_limit: config.batch_limit,
        }
    }

    /// A producer handle feeding this loop.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Run up to `batch_limit` queued tasks without blocking.
    ///
    /// Returns the number of tasks executed. A queued shutdown request is
    /// ignored here; only [`run`](Self::run) honors it.
    pub fn run_pending(&self) -> usize {
        let mut executed = 0;
        while executed < self.batch_limit {
            match self.receiver.try_recv() {
                Ok(Message::Run(task)) => {
                    self.execute(task);
                    executed += 1;
                }
                Ok(Message::Shutdown) => {}
                Err(_) => break,
            }
        }
        executed
    }

    /// Pump until the queue is empty, including tasks queued by tasks.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let executed = self.run_pending();
            total += executed;
            if executed == 0 {
                return total;
            }
        }
    }

    /// Wait up to `timeout` for work, then pump one batch.
    pub fn run_timeout(&self, timeout: Duration) -> usize {
        match self.receiver.recv_timeout(timeout) {
            Ok(Message::Run(task)) => {
                self.execute(task);
                1 + self.run_pending()
            }
            Ok(Message::Shutdown) | Err(_) => 0,
        }
    }

    /// Block, executing tasks as they arrive, until a shutdown request is
    /// received. Tasks queued before the request still run.
    pub fn run(&self) -> usize {
        let mut executed = 0;
        loop {
            match self.receiver.recv() {
                Ok(Message::Run(task)) => {
                    self.execute(task);
                    executed += 1;
                }
                Ok(Message::Shutdown) => {
                    executed += self.run_until_idle();
                    tracing::debug!(message = "dispatch.shutdown", executed);
                    return executed;
                }
                Err(_) => return executed,
            }
        }
    }

    fn execute(&self, task: Task) {
        task();
        self.dispatcher
            .counters
            .executed
            .fetch_add(1, Ordering::SeqCst);
    }
}

/// A dedicated thread that owns a [`MainLoop`].
///
/// The thread is the single delivery context for every observable built on
/// its [`Dispatcher`].
pub struct DispatchThread {
    dispatcher: Dispatcher,
    handle: Option<JoinHandle<()>>,
}

impl DispatchThread {
    /// Spawn a dispatch thread with the default configuration.
    pub fn start() -> Result<Self> {
        Self::with_config(&DispatchConfig::default())
    }

    /// Spawn a dispatch thread configured by `config`.
    pub fn with_config(config: &DispatchConfig) -> Result<Self> {
        let main = MainLoop::with_config(config)?;
        let dispatcher = main.dispatcher();

        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                main.run();
            })?;

        tracing::debug!(message = "dispatch.thread_started", name = %config.thread_name);

        Ok(Self {
            dispatcher,
            handle: Some(handle),
        })
    }

    /// A producer handle feeding this thread.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Drain queued tasks and join the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.dispatcher.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DispatchThread {
    fn drop(&mut self) {
        self.stop();
    }
}

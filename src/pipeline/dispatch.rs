//! Execution contexts for the decode pipeline.
//!
//! Four contexts back the stage layout:
//!
//! ```text
//! origin:   serialized queue; requests enter and results leave here
//! worker:   blocking pool; parallel decode, gated upstream by admission
//! upload:   serialized queue; owns GPU resource creation
//! provider: the provider's own executor; its futures are spawned as tasks
//! ```
//!
//! The serialized contexts are unbounded MPSC queues each drained by a single
//! consumer task, so submission order is execution order and nothing posted
//! to one context races anything else on the same context. Posting never
//! blocks the caller; posting after shutdown is a no-op.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Boxed unit of work posted to a serialized context.
pub type StageTask = Box<dyn FnOnce() + Send>;

// =============================================================================
// Worker spawner
// =============================================================================

/// Where admitted decode work runs.
///
/// The decode limiter admits work through this seam so tests can substitute
/// an inline spawner and observe admissions deterministically.
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Runs `work` off the async runtime threads.
    fn spawn(&self, work: StageTask);
}

/// Spawns decode work onto tokio's blocking pool.
///
/// Carries a runtime handle so work can be spawned from any thread, in
/// particular from a worker thread returning an admission slot.
#[derive(Debug, Clone)]
pub struct TokioWorkerSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioWorkerSpawner {
    /// Captures the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl WorkerSpawner for TokioWorkerSpawner {
    fn spawn(&self, work: StageTask) {
        self.handle.spawn_blocking(work);
    }
}

// =============================================================================
// Serialized contexts
// =============================================================================

/// A serialized execution context: one consumer task draining one queue.
#[derive(Clone)]
pub struct StageQueue {
    name: &'static str,
    sender: mpsc::UnboundedSender<StageTask>,
}

impl StageQueue {
    /// Starts the consumer task on the current runtime.
    fn start(name: &'static str, shutdown: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(name, receiver, shutdown));
        Self { name, sender }
    }

    async fn run(
        name: &'static str,
        mut receiver: mpsc::UnboundedReceiver<StageTask>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!(context = name, "stage context stopped");
                    break;
                }

                task = receiver.recv() => {
                    match task {
                        Some(task) => task(),
                        None => break,
                    }
                }
            }
        }
    }

    /// Posts `task` to run on this context, after everything already posted.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(task)).is_err() {
            debug!(context = self.name, "post after shutdown dropped");
        }
    }
}

impl std::fmt::Debug for StageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Owns the pipeline's execution contexts.
///
/// Must be started from within a tokio runtime; the origin and upload
/// consumers are spawned immediately.
pub struct StageDispatcher {
    origin: StageQueue,
    upload: StageQueue,
    worker: Arc<dyn WorkerSpawner>,
    shutdown: CancellationToken,
}

impl StageDispatcher {
    /// Starts the contexts with decode work on tokio's blocking pool.
    pub fn start() -> Self {
        Self::with_worker(Arc::new(TokioWorkerSpawner::current()))
    }

    /// Starts the contexts with a custom worker spawner.
    pub fn with_worker(worker: Arc<dyn WorkerSpawner>) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            origin: StageQueue::start("origin", shutdown.child_token()),
            upload: StageQueue::start("upload", shutdown.child_token()),
            worker,
            shutdown,
        }
    }

    /// The origin context, where requests enter and results are delivered.
    #[inline]
    pub fn origin(&self) -> &StageQueue {
        &self.origin
    }

    /// The upload context, the single place GPU resources are created.
    #[inline]
    pub fn upload(&self) -> &StageQueue {
        &self.upload
    }

    /// Runs `work` on the worker context.
    pub fn spawn_worker(&self, work: StageTask) {
        self.worker.spawn(work);
    }

    /// The worker spawner, shared with the admission controller.
    pub fn worker_spawner(&self) -> Arc<dyn WorkerSpawner> {
        Arc::clone(&self.worker)
    }

    /// Spawns a provider future as an ordinary runtime task.
    pub fn spawn_provider<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    /// Stops the origin and upload consumers. Work not yet drained is
    /// dropped; later posts are no-ops.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for StageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDispatcher")
            .field("origin", &self.origin)
            .field("upload", &self.upload)
            .finish_non_exhaustive()
    }
}

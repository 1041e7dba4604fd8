//! Worker pool registry.
//!
//! Pipeline stages never spawn ad-hoc threads. They request a pool from
//! the [`ExecutorRegistry`] by a [`PoolSize`] rule; equal rules share one
//! memoized pool, so the total thread count stays bounded no matter how
//! many stages run concurrently. The provider behind the registry can be
//! swapped, which tests use to observe or serialize execution.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sizing rule for a worker pool. Doubles as the memoization key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolSize {
    /// Pool shared by `tasks` concurrent outer tasks:
    /// `width = max(1, cores / tasks)`.
    PerTask { tasks: usize },
    /// Share of the machine in tenths: `width = max(1, cores * tenths / 10)`.
    CoreShare { tenths: usize },
    /// Exactly `threads` workers.
    Fixed { threads: usize },
}

impl PoolSize {
    /// Resolve the rule against the machine's available parallelism.
    pub fn width(&self) -> usize {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self {
            PoolSize::PerTask { tasks } => (cores / (*tasks).max(1)).max(1),
            PoolSize::CoreShare { tenths } => (cores * tenths / 10).max(1),
            PoolSize::Fixed { threads } => (*threads).max(1),
        }
    }

    fn label(&self) -> String {
        match self {
            PoolSize::PerTask { tasks } => format!("per{}", tasks),
            PoolSize::CoreShare { tenths } => format!("share{}", tenths),
            PoolSize::Fixed { threads } => format!("fixed{}", threads),
        }
    }
}

/// Fixed-width worker pool over an MPMC job queue.
///
/// Workers pull jobs from a shared channel until the queue side is
/// dropped. [`WorkerPool::run_all`] provides scatter/gather with results
/// returned in submission order.
pub struct WorkerPool {
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    width: usize,
}

impl WorkerPool {
    pub fn new(name: &str, width: usize) -> Self {
        let width = width.max(1);
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(width);
        for i in 0..width {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || loop {
                    let job = rx.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .expect("Failed to spawn worker thread");
            workers.push(handle);
        }
        Self {
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            width,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Submit one job. Fails after [`WorkerPool::shutdown`].
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = self.queue.lock();
        match queue.as_ref() {
            Some(tx) => tx
                .send(Box::new(job))
                .map_err(|_| Error::Pool("worker queue closed".into())),
            None => Err(Error::Pool("pool is shut down".into())),
        }
    }

    /// Run all jobs on the pool and collect their results in submission
    /// order. A worker that dies mid-batch (job panic) surfaces as a
    /// pool error rather than a hang.
    pub fn run_all<T, F>(&self, jobs: Vec<F>) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let n = jobs.len();
        let (tx, rx) = mpsc::channel::<(usize, T)>();
        for (idx, job) in jobs.into_iter().enumerate() {
            let tx = tx.clone();
            self.execute(move || {
                let value = job();
                let _ = tx.send((idx, value));
            })?;
        }
        drop(tx);

        let mut slots: Vec<Option<T>> = Vec::with_capacity(n);
        slots.resize_with(n, || None);
        for _ in 0..n {
            let (idx, value) = rx
                .recv()
                .map_err(|_| Error::Pool("worker exited before finishing its jobs".into()))?;
            slots[idx] = Some(value);
        }
        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| Error::Pool("missing job result".into())))
            .collect()
    }

    /// Stop accepting jobs and join the workers after the queue drains.
    pub fn shutdown(&self) {
        let tx = self.queue.lock().take();
        drop(tx);
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.join() {
                log::error!("Worker thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("width", &self.width)
            .finish()
    }
}

/// Fold the per-task results of one pipeline phase into a single
/// outcome. The first real failure wins; cancellations only surface
/// when nothing failed harder, so the error that triggered a phase
/// abort is the one reported.
pub(crate) fn collect_phase<T>(outcomes: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut collected = Vec::with_capacity(outcomes.len());
    let mut cancelled = false;
    let mut first_error: Option<Error> = None;
    for outcome in outcomes {
        match outcome {
            Ok(value) => collected.push(value),
            Err(Error::Cancelled) => cancelled = true,
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if cancelled {
        return Err(Error::Cancelled);
    }
    Ok(collected)
}

/// Source of worker pools, keyed by pipeline stage and sizing rule.
pub trait ExecutorProvider: Send + Sync {
    fn pool(&self, stage: &str, size: PoolSize) -> Arc<WorkerPool>;

    /// Drop all memoized pools, joining their workers.
    fn shutdown(&self);
}

/// Provider memoizing one pool per (stage, sizing rule).
#[derive(Default)]
pub struct DefaultExecutorProvider {
    pools: Mutex<HashMap<(String, PoolSize), Arc<WorkerPool>>>,
}

impl DefaultExecutorProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutorProvider for DefaultExecutorProvider {
    fn pool(&self, stage: &str, size: PoolSize) -> Arc<WorkerPool> {
        let mut pools = self.pools.lock();
        Arc::clone(
            pools
                .entry((stage.to_owned(), size))
                .or_insert_with(|| {
                    let width = size.width();
                    log::debug!(
                        "Creating worker pool {}-{} ({} threads)",
                        stage,
                        size.label(),
                        width
                    );
                    Arc::new(WorkerPool::new(&format!("{}-{}", stage, size.label()), width))
                }),
        )
    }

    fn shutdown(&self) {
        self.pools.lock().clear();
    }
}

/// Registry handing out pools for the whole pipeline.
///
/// The built-in local provider answers requests until a replacement is
/// installed, and stays reachable through
/// [`ExecutorRegistry::local_pool`] afterwards.
pub struct ExecutorRegistry {
    local: Arc<DefaultExecutorProvider>,
    provider: RwLock<Arc<dyn ExecutorProvider>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        let local = Arc::new(DefaultExecutorProvider::new());
        Self {
            provider: RwLock::new(Arc::clone(&local) as Arc<dyn ExecutorProvider>),
            local,
        }
    }

    pub fn pool(&self, stage: &str, size: PoolSize) -> Arc<WorkerPool> {
        self.provider.read().pool(stage, size)
    }

    /// Pool from the built-in local provider, bypassing any replacement.
    pub fn local_pool(&self, stage: &str, size: PoolSize) -> Arc<WorkerPool> {
        self.local.pool(stage, size)
    }

    /// Replace the provider. Existing pool handles stay valid; new
    /// requests go to the replacement.
    pub fn set_provider(&self, provider: Arc<dyn ExecutorProvider>) {
        *self.provider.write() = provider;
    }

    pub fn shutdown(&self) {
        self.provider.read().shutdown();
        self.local.shutdown();
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry").finish()
    }
}

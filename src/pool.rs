// src/pool.rs
//
// Bounded worker pool for attack tasks.
//
// The pool owns its own tokio runtime so the synchronous control thread can
// hand work off without being async itself. Concurrency is bounded by a
// semaphore; a watch channel carries the shutdown signal that every task
// observes at each pause. Tasks are wrapped in `catch_unwind` so a panicking
// task is logged and the rest of the pool keeps running.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::FutureExt;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Upper bound on runtime threads; tasks are I/O-bound pauses.
const MAX_RUNTIME_THREADS: usize = 4;

/// Cooperative cancellation handle given to every task.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been signalled (or the pool is gone).
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `dur` unless shutdown is signalled first.
    ///
    /// Returns true when the full pause elapsed.
    pub async fn pause(&mut self, dur: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.cancelled() => false,
        }
    }
}

/// Decrements the in-flight counter however the task ends (done, panicked,
/// or dropped by runtime shutdown).
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    runtime: Option<Runtime>,
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
    max_workers: usize,
}

impl WorkerPool {
    /// Build a pool running at most `max_workers` tasks at once.
    pub fn new(max_workers: usize) -> Result<Self> {
        let max_workers = max_workers.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(max_workers.min(MAX_RUNTIME_THREADS))
            .thread_name("duckyprobe-worker")
            .enable_time()
            .build()
            .context("Failed to build worker runtime")?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            runtime: Some(runtime),
            permits: Arc::new(Semaphore::new(max_workers)),
            shutdown_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_workers,
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Tasks submitted and not yet finished (running or waiting for a slot).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime.is_none() || *self.shutdown_tx.borrow()
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            rx: self.shutdown_tx.subscribe(),
        }
    }

    /// Queue a task. Returns false (and drops the task) after shutdown.
    ///
    /// The task waits for a free slot; if shutdown is signalled while it
    /// waits it never starts.
    pub fn submit<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = self.runtime.as_ref().filter(|_| !*self.shutdown_tx.borrow()) else {
            debug!(task = name, "pool shut down; task dropped");
            return false;
        };

        let permits = Arc::clone(&self.permits);
        let mut cancel = self.cancel_token();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        runtime.spawn(async move {
            let _guard = guard;
            let permit = tokio::select! {
                p = permits.acquire_owned() => p,
                _ = cancel.cancelled() => return,
            };
            let Ok(_permit) = permit else {
                return;
            };

            if let Err(panic_info) = AssertUnwindSafe(task).catch_unwind().await {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                error!(task = name, "worker task panicked: {panic_msg}");
            }
        });
        true
    }

    /// Drive a future to completion on the pool's runtime from the control
    /// thread. Returns None after shutdown, or when called from inside an
    /// async context (where blocking would panic).
    pub fn block_on<F: Future>(&self, fut: F) -> Option<F::Output> {
        if Handle::try_current().is_ok() {
            error!("block_on called from inside an async context; skipped");
            return None;
        }
        self.runtime.as_ref().map(|rt| rt.block_on(fut))
    }

    /// Wait up to `timeout` for every submitted task to finish without
    /// signalling shutdown. Returns true when the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let in_flight = Arc::clone(&self.in_flight);
        self.block_on(async move {
            while in_flight.load(Ordering::SeqCst) > 0 {
                if Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            true
        })
        .unwrap_or(true)
    }

    /// Signal cancellation, wait up to `grace` for in-flight tasks, then
    /// tear the runtime down. Returns the number of tasks abandoned.
    pub fn shutdown(&mut self, grace: Duration) -> usize {
        let Some(runtime) = self.runtime.take() else {
            return 0;
        };
        self.shutdown_tx.send_replace(true);

        let deadline = Instant::now() + grace;
        let in_flight = Arc::clone(&self.in_flight);
        runtime.block_on(async {
            while in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let abandoned = self.in_flight();
        if abandoned > 0 {
            warn!(abandoned, "shutdown grace elapsed with tasks still running");
        } else {
            info!("worker pool drained");
        }
        runtime.shutdown_timeout(Duration::from_millis(100));
        abandoned
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.shutdown_tx.send_replace(true);
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn bounded_concurrency() {
        let mut pool = WorkerPool::new(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            assert!(pool.submit("probe", async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(pool.shutdown(Duration::from_secs(1)), 0);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn panicking_task_does_not_poison_pool() {
        let mut pool = WorkerPool::new(1).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        pool.submit("boom", async { panic!("boom") });
        let flag = Arc::clone(&ran);
        pool.submit("after", async move { flag.store(true, Ordering::SeqCst) });
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(pool.shutdown(Duration::from_secs(1)), 0);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn block_on_inside_async_context_returns_none() {
        let pool = WorkerPool::new(1).unwrap();
        let outer = Builder::new_current_thread().build().unwrap();
        let inner = outer.block_on(async { pool.block_on(async { 7 }) });
        assert!(inner.is_none());
        assert_eq!(pool.block_on(async { 7 }), Some(7));
    }

    #[test]
    fn shutdown_cancels_long_pauses_within_grace() {
        let mut pool = WorkerPool::new(4).unwrap();
        let finished_early = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let mut cancel = pool.cancel_token();
            let counter = Arc::clone(&finished_early);
            pool.submit("sleeper", async move {
                if !cancel.pause(Duration::from_secs(60)).await {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        // Let every task reach its pause before signalling.
        pool.block_on(async { tokio::time::sleep(Duration::from_millis(50)).await });
        let started = Instant::now();
        assert_eq!(pool.shutdown(Duration::from_secs(2)), 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(finished_early.load(Ordering::SeqCst), 4);
        assert!(!pool.submit("late", async {}));
        assert!(pool.block_on(async { 1 }).is_none());
    }
}

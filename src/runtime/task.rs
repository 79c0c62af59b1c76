//! Self-healing periodic/triggered task execution.
//!
//! A `TaskRunner` dispatches one job across a small round-robin worker pool,
//! driven by a fixed frequency, an external trigger, or both. A watchdog
//! restarts any manager or worker task that died; a restart is logged and
//! never surfaces to the caller.

use futures::future::BoxFuture;
use log::warn;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// How long the manager waits for a worker to acknowledge completion.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the watchdog checks for dead tasks.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into a [`Job`].
pub fn job<F, Fut>(f: F) -> Job
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as BoxFuture<'static, ()>)
}

#[derive(Clone)]
pub struct TaskSpec {
    /// Execution frequency in Hz. `None` means trigger-only.
    pub frequency: Option<f64>,
    /// External trigger shared with other parties; fired via `notify_one`.
    pub trigger: Option<Arc<Notify>>,
    /// Dispatch once immediately instead of waiting a full period.
    pub immediate: bool,
    /// Startup delay before the manager begins dispatching.
    pub delay: Duration,
    /// Worker pool size. Defaults to `1 + frequency / 5`.
    pub workers: Option<usize>,
    /// Block the manager (bounded by a 5s timeout) until the dispatched
    /// worker finishes before accepting the next trigger.
    pub wait_for_completion: bool,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            frequency: None,
            trigger: None,
            immediate: true,
            delay: Duration::ZERO,
            workers: None,
            wait_for_completion: true,
        }
    }
}

impl TaskSpec {
    pub fn periodic(frequency: f64) -> Self {
        Self {
            frequency: Some(frequency),
            ..Self::default()
        }
    }

    pub fn triggered(trigger: Arc<Notify>) -> Self {
        Self {
            trigger: Some(trigger),
            immediate: false,
            ..Self::default()
        }
    }

    fn worker_count(&self) -> usize {
        if let Some(n) = self.workers {
            return n.max(1);
        }
        match self.frequency {
            Some(f) if f > 0.0 => 1 + (f / 5.0) as usize,
            _ => 1,
        }
    }

    fn period(&self) -> Option<Duration> {
        self.frequency
            .filter(|f| *f > 0.0)
            .map(|f| Duration::from_secs_f64(1.0 / f))
    }
}

struct WorkerSlot {
    run_tx: mpsc::Sender<()>,
    // The receiver outlives the worker task so the watchdog can hand it to a
    // replacement after a panic.
    run_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    job: Job,
    spec: TaskSpec,
    trigger: Arc<Notify>,
    paused: AtomicBool,
    stopped: AtomicBool,
    workers: Vec<WorkerSlot>,
    done_tx: mpsc::Sender<()>,
    done_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<()>>>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

pub struct TaskRunner {
    inner: Arc<Inner>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    /// Spawns the manager, worker pool, and watchdog. Must be called inside a
    /// tokio runtime.
    pub fn new(job: Job, spec: TaskSpec) -> Self {
        let n = spec.worker_count();
        let trigger = spec.trigger.clone().unwrap_or_default();
        let (done_tx, done_rx) = mpsc::channel(n);
        let workers = (0..n)
            .map(|_| {
                let (run_tx, run_rx) = mpsc::channel(1);
                WorkerSlot {
                    run_tx,
                    run_rx: Arc::new(tokio::sync::Mutex::new(run_rx)),
                    handle: Mutex::new(None),
                }
            })
            .collect();

        let inner = Arc::new(Inner {
            job,
            spec,
            trigger,
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            workers,
            done_tx,
            done_rx: Arc::new(tokio::sync::Mutex::new(done_rx)),
            manager: Mutex::new(None),
        });

        for i in 0..n {
            let handle = tokio::spawn(worker_loop(inner.clone(), i));
            *inner.workers[i].handle.lock().unwrap() = Some(handle);
        }
        let delay = inner.spec.delay;
        let handle = tokio::spawn(manager_loop(inner.clone(), delay));
        *inner.manager.lock().unwrap() = Some(handle);
        let watchdog = tokio::spawn(watchdog_loop(inner.clone()));

        Self {
            inner,
            watchdog: Mutex::new(Some(watchdog)),
        }
    }

    /// Fires the trigger, dispatching one invocation.
    pub fn trigger(&self) {
        self.inner.trigger.notify_one();
    }

    /// Stops dispatching without tearing down any task.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Terminal stop: aborts the manager, workers, and watchdog.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(h) = self.watchdog.lock().unwrap().take() {
            h.abort();
        }
        if let Some(h) = self.inner.manager.lock().unwrap().take() {
            h.abort();
        }
        for slot in &self.inner.workers {
            if let Some(h) = slot.handle.lock().unwrap().take() {
                h.abort();
            }
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn manager_loop(inner: Arc<Inner>, delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if inner.spec.immediate {
        inner.trigger.notify_one();
    }
    let mut slot = 0usize;
    loop {
        match inner.spec.period() {
            Some(period) => {
                let _ = tokio::time::timeout(period, inner.trigger.notified()).await;
            }
            None => inner.trigger.notified().await,
        }
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
        if inner.paused.load(Ordering::SeqCst) {
            continue;
        }
        slot = (slot + 1) % inner.workers.len();
        let _ = inner.workers[slot].run_tx.try_send(());
        if inner.spec.wait_for_completion {
            let mut done = inner.done_rx.lock().await;
            let _ = tokio::time::timeout(ACK_TIMEOUT, done.recv()).await;
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, index: usize) {
    let run_rx = inner.workers[index].run_rx.clone();
    let mut run_rx = run_rx.lock().await;
    while run_rx.recv().await.is_some() {
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
        if !inner.paused.load(Ordering::SeqCst) {
            (inner.job)().await;
            let _ = inner.done_tx.try_send(());
        }
    }
}

async fn watchdog_loop(inner: Arc<Inner>) {
    loop {
        tokio::time::sleep(WATCHDOG_INTERVAL).await;
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
        if inner.paused.load(Ordering::SeqCst) {
            continue;
        }
        let manager_dead = inner
            .manager
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true);
        if manager_dead {
            warn!("[task] manager died, restarting");
            let handle = tokio::spawn(manager_loop(inner.clone(), Duration::ZERO));
            *inner.manager.lock().unwrap() = Some(handle);
        }
        for (i, slot) in inner.workers.iter().enumerate() {
            let dead = slot
                .handle
                .lock()
                .unwrap()
                .as_ref()
                .map(|h| h.is_finished())
                .unwrap_or(true);
            if dead {
                warn!("[task] worker {} died, restarting", i);
                let handle = tokio::spawn(worker_loop(inner.clone(), i));
                *slot.handle.lock().unwrap() = Some(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(count: Arc<AtomicUsize>) -> Job {
        job(move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_dispatch_runs_the_job() {
        let count = Arc::new(AtomicUsize::new(0));
        let runner = TaskRunner::new(counting_job(count.clone()), TaskSpec::periodic(10.0));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 5, "expected several runs, got {}", seen);
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_dispatches_without_frequency() {
        let count = Arc::new(AtomicUsize::new(0));
        let trigger = Arc::new(Notify::new());
        let runner = TaskRunner::new(
            counting_job(count.clone()),
            TaskSpec::triggered(trigger.clone()),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        trigger.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        runner.trigger();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn pause_stops_dispatch_and_resume_restarts_it() {
        let count = Arc::new(AtomicUsize::new(0));
        let runner = TaskRunner::new(counting_job(count.clone()), TaskSpec::periodic(10.0));
        tokio::time::sleep(Duration::from_millis(500)).await;
        runner.pause();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let at_pause = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_pause);

        runner.resume();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(count.load(Ordering::SeqCst) > at_pause);
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_respawns_a_panicked_worker() {
        let count = Arc::new(AtomicUsize::new(0));
        let explode = Arc::new(AtomicBool::new(true));
        let j = {
            let count = count.clone();
            let explode = explode.clone();
            job(move || {
                let count = count.clone();
                let explode = explode.clone();
                async move {
                    if explode.swap(false, Ordering::SeqCst) {
                        panic!("boom");
                    }
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let trigger = Arc::new(Notify::new());
        let spec = TaskSpec {
            workers: Some(1),
            wait_for_completion: false,
            ..TaskSpec::triggered(trigger.clone())
        };
        let runner = TaskRunner::new(j, spec);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // First dispatch kills the worker.
        trigger.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Within one watchdog interval the worker is back and dispatch works.
        tokio::time::sleep(WATCHDOG_INTERVAL + Duration::from_secs(1)).await;
        trigger.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        runner.shutdown();
    }

    #[test]
    fn worker_count_scales_with_frequency() {
        assert_eq!(TaskSpec::periodic(1.0).worker_count(), 1);
        assert_eq!(TaskSpec::periodic(10.0).worker_count(), 3);
        assert_eq!(TaskSpec::default().worker_count(), 1);
    }
}

//! Timer collaborators: delayed, cancellable callbacks plus a small executor.
//!
//! [`TokioTimer`] is the production implementation. [`ManualTimer`] never
//! fires on its own; time moves only when [`ManualTimer::advance`] is called,
//! which makes timeout behavior deterministic in tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

/// A unit of work handed to a timer.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cancels a scheduled task. Cancelling a task that already ran is a no-op.
pub trait TimerHandle: Send {
    fn cancel(&self);
}

/// Delayed callback scheduling.
pub trait Timer: Send + Sync {
    /// Runs `task` once `delay` has elapsed, unless cancelled first.
    fn schedule(&self, delay: Duration, task: Task) -> Box<dyn TimerHandle>;

    /// Runs `task` as soon as possible, off the calling thread.
    fn execute(&self, task: Task) {
        drop(self.schedule(Duration::ZERO, task));
    }
}

/// Tokio-backed timer.
///
/// Tasks are synchronous, so each one runs on the blocking pool once its
/// sleep has elapsed.
#[derive(Debug, Clone)]
pub struct TokioTimer {
    handle: Handle,
}

impl TokioTimer {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// A timer bound to the runtime the caller is running on, if any.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

struct TokioHandle(JoinHandle<()>);

impl TimerHandle for TokioHandle {
    fn cancel(&self) {
        self.0.abort();
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, task: Task) -> Box<dyn TimerHandle> {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                warn!(error = %e, "timer task failed");
            }
        });
        Box::new(TokioHandle(join))
    }

    fn execute(&self, task: Task) {
        drop(self.handle.spawn_blocking(task));
    }
}

struct Scheduled {
    id: u64,
    due: Duration,
    task: Task,
}

#[derive(Default)]
struct Queue {
    now: Duration,
    next_id: u64,
    entries: Vec<Scheduled>,
}

/// A virtual clock driven by hand.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::time::Duration;
/// use servlet_core::async_context::{ManualTimer, Timer};
///
/// let timer = ManualTimer::new();
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = fired.clone();
/// timer.schedule(Duration::from_millis(100), Box::new(move || flag.store(true, Ordering::SeqCst)));
///
/// assert_eq!(timer.advance(Duration::from_millis(99)), 0);
/// assert_eq!(timer.advance(Duration::from_millis(1)), 1);
/// assert!(fired.load(Ordering::SeqCst));
/// ```
#[derive(Clone, Default)]
pub struct ManualTimer {
    queue: Arc<Mutex<Queue>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward by `by` and runs every task that became due,
    /// in due order. Returns the number of tasks run.
    ///
    /// Tasks scheduled by running tasks are picked up if they fall due within
    /// the same advance.
    pub fn advance(&self, by: Duration) -> usize {
        let deadline = lock(&self.queue).now + by;

        let mut ran = 0;
        while let Some(task) = self.pop_due(deadline) {
            task();
            ran += 1;
        }
        let mut queue = lock(&self.queue);
        queue.now = queue.now.max(deadline);
        ran
    }

    /// Runs everything already due without moving the clock.
    pub fn run_pending(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    /// Number of scheduled, uncancelled tasks.
    pub fn pending(&self) -> usize {
        lock(&self.queue).entries.len()
    }

    /// Virtual time elapsed since the timer was created.
    pub fn elapsed(&self) -> Duration {
        lock(&self.queue).now
    }

    // Moves the clock to the popped task's due time. The lock is released
    // before the task runs so tasks may reschedule.
    fn pop_due(&self, deadline: Duration) -> Option<Task> {
        let mut queue = lock(&self.queue);
        let index = queue
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.due <= deadline)
            .min_by_key(|(_, entry)| (entry.due, entry.id))
            .map(|(index, _)| index)?;
        let entry = queue.entries.remove(index);
        queue.now = queue.now.max(entry.due);
        Some(entry.task)
    }
}

impl std::fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = lock(&self.queue);
        f.debug_struct("ManualTimer")
            .field("now", &queue.now)
            .field("pending", &queue.entries.len())
            .finish()
    }
}

struct ManualHandle {
    queue: Weak<Mutex<Queue>>,
    id: u64,
}

impl TimerHandle for ManualHandle {
    fn cancel(&self) {
        if let Some(queue) = self.queue.upgrade() {
            lock(&queue).entries.retain(|entry| entry.id != self.id);
        }
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, task: Task) -> Box<dyn TimerHandle> {
        let mut queue = lock(&self.queue);
        let id = queue.next_id;
        queue.next_id += 1;
        let due = queue.now + delay;
        queue.entries.push(Scheduled { id, due, task });
        Box::new(ManualHandle {
            queue: Arc::downgrade(&self.queue),
            id,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Task) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = count.clone();
        let make = move || -> Task {
            let c = shared.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, make)
    }

    #[test]
    fn manual_timer_runs_in_due_order() {
        let timer = ManualTimer::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, label) in [(30, "c"), (10, "a"), (20, "b")] {
            let order = order.clone();
            timer.schedule(
                Duration::from_millis(delay),
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }
        assert_eq!(timer.advance(Duration::from_millis(30)), 3);
        assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let timer = ManualTimer::new();
        let (count, task) = counter();
        let handle = timer.schedule(Duration::from_millis(5), task());
        assert_eq!(timer.pending(), 1);
        handle.cancel();
        assert_eq!(timer.pending(), 0);
        assert_eq!(timer.advance(Duration::from_secs(1)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn execute_runs_on_next_turn() {
        let timer = ManualTimer::new();
        let (count, task) = counter();
        timer.execute(task());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.run_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_may_reschedule_themselves() {
        let timer = ManualTimer::new();
        let (count, task) = counter();
        let inner = timer.clone();
        let follow_up = task();
        timer.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                inner.schedule(Duration::from_millis(5), follow_up);
            }),
        );
        assert_eq!(timer.advance(Duration::from_millis(20)), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timer.elapsed(), Duration::from_millis(20));
    }

    #[test]
    fn rescheduled_task_is_timed_from_its_parent() {
        let timer = ManualTimer::new();
        let fired_at = Arc::new(Mutex::new(Vec::new()));
        let inner = timer.clone();
        let log = fired_at.clone();
        timer.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                log.lock().unwrap().push(inner.elapsed());
                let clock = inner.clone();
                let log = log.clone();
                inner.schedule(
                    Duration::from_millis(5),
                    Box::new(move || log.lock().unwrap().push(clock.elapsed())),
                );
            }),
        );

        assert_eq!(timer.advance(Duration::from_millis(16)), 2);
        assert_eq!(
            *fired_at.lock().unwrap(),
            [Duration::from_millis(10), Duration::from_millis(15)]
        );
        assert_eq!(timer.elapsed(), Duration::from_millis(16));
        assert_eq!(timer.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tokio_timer_fires_and_cancels() {
        let timer = TokioTimer::try_current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        timer.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = tx.send("fired");
            }),
        );
        let fired = tokio::time::timeout(Duration::from_secs(5), rx).await;
        assert_eq!(fired.unwrap().unwrap(), "fired");

        let (count, task) = counter();
        let handle = timer.schedule(Duration::from_millis(20), task());
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_tokio_timer_outside_a_runtime() {
        assert!(TokioTimer::try_current().is_none());
    }
}

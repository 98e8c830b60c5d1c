//! Worker-to-UI marshaling.
//!
//! The only sanctioned path from the scan worker to the UI thread. A
//! [`UiScheduler`] (cloneable, `Send`) enqueues closures; the UI thread owns
//! the matching [`UiQueue`] and runs them against its view with
//! [`UiQueue::pump`].
//!
//! Every scheduled task is registered under a [`TaskHandle`] until it runs,
//! so it can be canceled individually or all at once. Teardown clears the
//! liveness flag and cancels everything outstanding; later
//! [`safe_update`](UiScheduler::safe_update) calls become no-ops.
//!
//! ```
//! use antenna_range::ui_bridge::create_bridge;
//!
//! let (scheduler, mut queue) = create_bridge::<Vec<String>>();
//! let worker = std::thread::spawn(move || {
//!     scheduler.safe_update(|log: &mut Vec<String>| log.push("from worker".into()));
//! });
//! worker.join().unwrap();
//!
//! let mut log = Vec::new();
//! assert_eq!(queue.pump(&mut log), 1);
//! assert_eq!(log, ["from worker"]);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A deferred mutation of the UI-side state `V`.
pub type UiTask<V> = Box<dyn FnOnce(&mut V) + Send + 'static>;

/// Identifier of a scheduled task, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

struct Envelope<V: ?Sized> {
    handle: TaskHandle,
    due: Option<Instant>,
    task: UiTask<V>,
}

#[derive(Debug)]
struct Registry {
    next_id: AtomicU64,
    pending: Mutex<HashSet<TaskHandle>>,
    alive: AtomicBool,
}

impl Registry {
    fn pending(&self) -> MutexGuard<'_, HashSet<TaskHandle>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> TaskHandle {
        let handle = TaskHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.pending().insert(handle);
        handle
    }

    /// Remove `handle`; true if it was still outstanding.
    fn release(&self, handle: TaskHandle) -> bool {
        self.pending().remove(&handle)
    }

    fn is_pending(&self, handle: TaskHandle) -> bool {
        self.pending().contains(&handle)
    }

    fn clear(&self) -> usize {
        let mut pending = self.pending();
        let count = pending.len();
        pending.clear();
        count
    }
}

/// Sending half, held by the controller and the worker thread.
pub struct UiScheduler<V: ?Sized> {
    tx: mpsc::UnboundedSender<Envelope<V>>,
    registry: Arc<Registry>,
}

impl<V: ?Sized> Clone for UiScheduler<V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

/// Receiving half, owned and pumped by the UI thread.
pub struct UiQueue<V: ?Sized> {
    rx: mpsc::UnboundedReceiver<Envelope<V>>,
    delayed: Vec<Envelope<V>>,
    registry: Arc<Registry>,
}

/// Create a connected scheduler/queue pair for UI state `V`.
pub fn create_bridge<V: ?Sized>() -> (UiScheduler<V>, UiQueue<V>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = Arc::new(Registry {
        next_id: AtomicU64::new(1),
        pending: Mutex::new(HashSet::new()),
        alive: AtomicBool::new(true),
    });
    (
        UiScheduler {
            tx,
            registry: Arc::clone(&registry),
        },
        UiQueue {
            rx,
            delayed: Vec::new(),
            registry,
        },
    )
}

impl<V: ?Sized> UiScheduler<V> {
    /// Enqueue `task` to run on the next pump.
    pub fn schedule<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce(&mut V) + Send + 'static,
    {
        self.enqueue(None, Box::new(task))
    }

    /// Enqueue `task` to run on the first pump after `delay`.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce(&mut V) + Send + 'static,
    {
        self.enqueue(Some(Instant::now() + delay), Box::new(task))
    }

    /// [`schedule`](Self::schedule), unless the UI has been torn down.
    pub fn safe_update<F>(&self, task: F) -> Option<TaskHandle>
    where
        F: FnOnce(&mut V) + Send + 'static,
    {
        if !self.is_alive() {
            trace!("UI torn down; dropping update");
            return None;
        }
        Some(self.schedule(task))
    }

    /// Cancel one task. Returns false if it already ran or was canceled.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        self.registry.release(handle)
    }

    /// Cancel every outstanding task.
    pub fn cancel_all(&self) -> usize {
        self.registry.clear()
    }

    /// Tasks scheduled but not yet run or canceled.
    pub fn pending(&self) -> usize {
        self.registry.pending().len()
    }

    pub fn is_alive(&self) -> bool {
        self.registry.alive.load(Ordering::Acquire)
    }

    /// Flip the liveness flag without draining the queue.
    pub fn mark_dead(&self) {
        self.registry.alive.store(false, Ordering::Release);
    }

    fn enqueue(&self, due: Option<Instant>, task: UiTask<V>) -> TaskHandle {
        let handle = self.registry.register();
        let envelope = Envelope { handle, due, task };
        if self.tx.send(envelope).is_err() {
            self.registry.release(handle);
            debug!(?handle, "UI queue closed; task dropped");
        }
        handle
    }
}

impl<V: ?Sized> UiQueue<V> {
    /// Run every due, non-canceled task in submission order.
    ///
    /// Call from the UI thread only. Returns the number of tasks run.
    pub fn pump(&mut self, view: &mut V) -> usize {
        let now = Instant::now();
        let mut ready = Vec::new();
        let mut waiting = Vec::new();

        let incoming = std::iter::from_fn(|| self.rx.try_recv().ok());
        for envelope in self.delayed.drain(..).chain(incoming) {
            if !self.registry.is_pending(envelope.handle) {
                continue;
            }
            match envelope.due {
                Some(due) if due > now => waiting.push(envelope),
                _ => ready.push(envelope),
            }
        }
        self.delayed = waiting;

        let mut ran = 0;
        for envelope in ready {
            if !self.is_alive() {
                break;
            }
            // Canceled after being collected: skip.
            if self.registry.release(envelope.handle) {
                (envelope.task)(view);
                ran += 1;
            }
        }
        ran
    }

    /// Outstanding tasks, including delayed ones.
    pub fn pending(&self) -> usize {
        self.registry.pending().len()
    }

    pub fn is_alive(&self) -> bool {
        self.registry.alive.load(Ordering::Acquire)
    }

    /// Mark the UI dead and cancel everything outstanding.
    ///
    /// Returns the number of tasks canceled.
    pub fn teardown(&mut self) -> usize {
        self.registry.alive.store(false, Ordering::Release);
        let canceled = self.registry.clear();
        self.delayed.clear();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        debug!(canceled, "UI bridge torn down");
        canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let (scheduler, mut queue) = create_bridge::<Vec<u32>>();
        for i in 0..5 {
            scheduler.schedule(move |v: &mut Vec<u32>| v.push(i));
        }
        let mut seen = Vec::new();
        assert_eq!(queue.pump(&mut seen), 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_cancel_single_task() {
        let (scheduler, mut queue) = create_bridge::<Vec<u32>>();
        scheduler.schedule(|v: &mut Vec<u32>| v.push(1));
        let handle = scheduler.schedule(|v: &mut Vec<u32>| v.push(2));
        assert!(scheduler.cancel(handle));
        assert!(!scheduler.cancel(handle));

        let mut seen = Vec::new();
        queue.pump(&mut seen);
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn test_delayed_task_waits_for_due_time() {
        let (scheduler, mut queue) = create_bridge::<Vec<u32>>();
        scheduler.schedule_after(Duration::from_millis(50), |v: &mut Vec<u32>| v.push(7));
        let mut seen = Vec::new();
        assert_eq!(queue.pump(&mut seen), 0);
        assert_eq!(queue.pending(), 1);

        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(queue.pump(&mut seen), 1);
        assert_eq!(seen, vec![7]);
    }

    #[test]
    fn test_teardown_cancels_and_blocks_safe_updates() {
        let (scheduler, mut queue) = create_bridge::<Vec<u32>>();
        scheduler.schedule(|v: &mut Vec<u32>| v.push(1));
        scheduler.schedule_after(Duration::from_secs(60), |v: &mut Vec<u32>| v.push(2));

        assert_eq!(queue.teardown(), 2);
        assert!(!scheduler.is_alive());
        assert!(scheduler.safe_update(|v: &mut Vec<u32>| v.push(3)).is_none());

        let mut seen = Vec::new();
        assert_eq!(queue.pump(&mut seen), 0);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_mark_dead_skips_queued_tasks() {
        let (scheduler, mut queue) = create_bridge::<Vec<u32>>();
        scheduler.schedule(|v: &mut Vec<u32>| v.push(1));
        scheduler.mark_dead();
        let mut seen = Vec::new();
        assert_eq!(queue.pump(&mut seen), 0);
    }

    #[test]
    fn test_schedule_after_queue_dropped() {
        let (scheduler, queue) = create_bridge::<Vec<u32>>();
        drop(queue);
        scheduler.schedule(|v: &mut Vec<u32>| v.push(1));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_cross_thread_scheduling() {
        let (scheduler, mut queue) = create_bridge::<Vec<u32>>();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || {
                    scheduler.safe_update(move |v: &mut Vec<u32>| v.push(i));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let mut seen = Vec::new();
        assert_eq!(queue.pump(&mut seen), 4);
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}

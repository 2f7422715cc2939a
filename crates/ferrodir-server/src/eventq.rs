//! The event queue: a single-threaded cooperative timer for scheduled
//! maintenance work.
//!
//! One worker thread fires events in due-time order; events due at the same
//! second fire in insertion order. Callbacks run on the worker thread and
//! must not block it.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

/// Opaque handle to a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

/// Argument delivered to an event callback.
pub type EventArg = Arc<dyn Any + Send + Sync>;

/// Event callback: receives the scheduled fire time and the argument.
pub type EventFn = Arc<dyn Fn(i64, &EventArg) + Send + Sync>;

fn current_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct EventCtx {
    id: EventId,
    func: EventFn,
    arg: EventArg,
    when: i64,
    /// Zero for one-shot events; otherwise the repeat interval in seconds
    /// (sub-second intervals round up).
    interval: i64,
}

struct EqInner {
    queue: Mutex<Vec<EventCtx>>,
    cv: Condvar,
    running: AtomicBool,
    stopped: AtomicBool,
    next_id: AtomicU64,
}

impl EqInner {
    /// Inserts in due-time order, after everything with the same time.
    fn enqueue(&self, ec: EventCtx) {
        let mut queue = self.queue.lock();
        let at = queue
            .iter()
            .position(|e| e.when > ec.when)
            .unwrap_or(queue.len());
        queue.insert(at, ec);
        self.cv.notify_one();
    }

    fn dequeue_due(&self, now: i64) -> Option<EventCtx> {
        let mut queue = self.queue.lock();
        if queue.first().is_some_and(|e| e.when <= now) {
            Some(queue.remove(0))
        } else {
            None
        }
    }
}

/// The queue itself. Schedule with [`EventQueue::once`] and
/// [`EventQueue::repeat`]; nothing fires until [`EventQueue::start`].
pub struct EventQueue {
    inner: Arc<EqInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EqInner {
                queue: Mutex::new(Vec::new()),
                cv: Condvar::new(),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
            worker: Mutex::new(None),
        }
    }

    fn schedule(&self, func: EventFn, arg: EventArg, when: i64, interval_ms: u64) -> Option<EventId> {
        if self.inner.stopped.load(AtomicOrdering::SeqCst) {
            // Enqueues after stop are silently dropped.
            return None;
        }
        let id = EventId(self.inner.next_id.fetch_add(1, AtomicOrdering::SeqCst));
        let now = current_time();
        let ec = EventCtx {
            id,
            func,
            arg,
            when: when.max(now),
            interval: if interval_ms == 0 {
                0
            } else {
                ((interval_ms + 999) / 1000) as i64
            },
        };
        debug!(id = id.0, when = ec.when, interval = ec.interval, "event scheduled");
        self.inner.enqueue(ec);
        Some(id)
    }

    /// Schedules a function to run exactly once at `when` (unix seconds).
    pub fn once(&self, func: EventFn, arg: EventArg, when: i64) -> Option<EventId> {
        self.schedule(func, arg, when, 0)
    }

    /// Schedules a function to run at `when` and then every `interval_ms`.
    pub fn repeat(
        &self,
        func: EventFn,
        arg: EventArg,
        when: i64,
        interval_ms: u64,
    ) -> Option<EventId> {
        self.schedule(func, arg, when, interval_ms.max(1))
    }

    /// Cancels a pending event. Best-effort: `true` when the event was
    /// still queued, `false` when it already fired or never existed.
    pub fn cancel(&self, id: EventId) -> bool {
        if self.inner.stopped.load(AtomicOrdering::SeqCst) {
            return false;
        }
        let mut queue = self.inner.queue.lock();
        let before = queue.len();
        queue.retain(|e| e.id != id);
        let found = queue.len() != before;
        debug!(id = id.0, found, "event cancellation requested");
        found
    }

    /// Returns the event's argument if the event is still queued. Racy by
    /// nature; callers must tolerate `None`.
    #[must_use]
    pub fn get_arg(&self, id: EventId) -> Option<EventArg> {
        if self.inner.stopped.load(AtomicOrdering::SeqCst) {
            return None;
        }
        self.inner
            .queue
            .lock()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.arg.clone())
    }

    /// Starts the worker thread.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.inner.running.store(true, AtomicOrdering::SeqCst);
        let inner = self.inner.clone();
        *worker = Some(std::thread::spawn(move || eq_loop(&inner)));
        info!("event queue services have started");
    }

    /// Stops the queue: wakes the worker, joins it, and drains whatever is
    /// still queued. Idempotent.
    pub fn stop(&self) {
        self.inner.stopped.store(true, AtomicOrdering::SeqCst);
        self.inner.running.store(false, AtomicOrdering::SeqCst);
        {
            let _queue = self.inner.queue.lock();
            self.inner.cv.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.inner.queue.lock().clear();
        info!("event queue services have shut down");
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        if self.inner.running.load(AtomicOrdering::SeqCst) {
            self.stop();
        }
    }
}

fn eq_loop(inner: &Arc<EqInner>) {
    while inner.running.load(AtomicOrdering::SeqCst) {
        {
            let mut queue = inner.queue.lock();
            loop {
                if !inner.running.load(AtomicOrdering::SeqCst) {
                    return;
                }
                let now = current_time();
                match queue.first() {
                    Some(e) if e.when <= now => break,
                    Some(e) => {
                        let wait = Duration::from_secs((e.when - now).max(1) as u64);
                        inner.cv.wait_for(&mut queue, wait);
                    }
                    None => {
                        inner.cv.wait(&mut queue);
                    }
                }
            }
        }
        call_all_due(inner);
    }
}

/// Fires everything due. A repeating event re-queues itself at the first
/// multiple of its interval that is not in the past; missed slots are not
/// replayed.
fn call_all_due(inner: &Arc<EqInner>) {
    while let Some(e) = inner.dequeue_due(current_time()) {
        (e.func)(e.when, &e.arg);
        if e.interval > 0 {
            let now = current_time();
            let mut next = e.when + e.interval;
            if next < now {
                next = now;
            }
            inner.enqueue(EventCtx {
                id: e.id,
                func: e.func,
                arg: e.arg,
                when: next,
                interval: e.interval,
            });
        }
    }
}

//! Deferred work ("bottom halves")
//!
//! Mailbox pushes must not call into the consumer synchronously: the push
//! may happen from inside a register access that the consumer itself
//! issued. Instead the mailbox schedules a [`BottomHalf`], and whoever
//! owns the [`EventLoop`] runs pending callbacks at the next opportunity.
//!
//! Scheduling is coalescing: a bottom half that is already pending is not
//! queued a second time, so one run observes every push since the last.

use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Callback = Box<dyn Fn() + Send + Sync>;

struct BhInner {
    name: String,
    scheduled: AtomicBool,
    callback: Callback,
    queue: Sender<Arc<BhInner>>,
}

/// Handle to a deferred callback registered on an [`EventLoop`]
#[derive(Clone)]
pub struct BottomHalf {
    inner: Arc<BhInner>,
}

impl BottomHalf {
    /// Request that the callback runs on the next [`EventLoop::run_pending`]
    pub fn schedule(&self) {
        if self.inner.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.inner.queue.send(self.inner.clone()).is_err() {
            // Event loop is gone; nothing will ever run us.
            self.inner.scheduled.store(false, Ordering::Release);
            log::debug!("bh {}: event loop dropped, schedule ignored", self.inner.name);
        }
    }

    /// Whether the callback is queued and has not run yet
    pub fn is_scheduled(&self) -> bool {
        self.inner.scheduled.load(Ordering::Acquire)
    }

    /// Name given at creation, for log output
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl core::fmt::Debug for BottomHalf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BottomHalf")
            .field("name", &self.inner.name)
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

/// Single-threaded queue of scheduled bottom halves
pub struct EventLoop {
    tx: Sender<Arc<BhInner>>,
    rx: Receiver<Arc<BhInner>>,
}

impl EventLoop {
    /// Create an empty event loop
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    /// Register a callback; it runs only after being scheduled
    pub fn bottom_half<F>(&self, name: &str, callback: F) -> BottomHalf
    where
        F: Fn() + Send + Sync + 'static,
    {
        BottomHalf {
            inner: Arc::new(BhInner {
                name: name.to_string(),
                scheduled: AtomicBool::new(false),
                callback: Box::new(callback),
                queue: self.tx.clone(),
            }),
        }
    }

    /// Run scheduled callbacks until none are pending
    ///
    /// Callbacks may schedule further work, including themselves; that work
    /// runs in the same call. Must not be called from inside a callback.
    ///
    /// # Returns
    /// Number of callbacks that ran
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(bh) = self.rx.try_recv() {
            bh.scheduled.store(false, Ordering::Release);
            log::trace!("bh {}: run", bh.name);
            (bh.callback)();
            ran += 1;
        }
        ran
    }

    /// Whether any callback is waiting to run
    pub fn has_pending(&self) -> bool {
        !self.rx.is_empty()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_schedule_and_run() {
        let event_loop = EventLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let bh = event_loop.bottom_half("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(event_loop.run_pending(), 0);
        bh.schedule();
        assert!(bh.is_scheduled());
        assert!(event_loop.has_pending());
        assert_eq!(event_loop.run_pending(), 1);
        assert!(!bh.is_scheduled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_schedule_coalesces() {
        let event_loop = EventLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let bh = event_loop.bottom_half("coalesce", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bh.schedule();
        bh.schedule();
        bh.schedule();
        assert_eq!(event_loop.run_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_can_reschedule_other_work() {
        let event_loop = EventLoop::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let second = event_loop.bottom_half("second", move || {
            counter.fetch_add(10, Ordering::SeqCst);
        });
        let counter = hits.clone();
        let first = event_loop.bottom_half("first", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            second.schedule();
        });

        first.schedule();
        assert_eq!(event_loop.run_pending(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_schedule_after_loop_dropped() {
        let event_loop = EventLoop::new();
        let bh = event_loop.bottom_half("orphan", || {});
        drop(event_loop);

        bh.schedule();
        assert!(!bh.is_scheduled());
    }
}

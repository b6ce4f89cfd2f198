//! Cancellation checks and stall observation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Reports whether the surrounding operation has been cancelled.
pub trait InterruptCheck: Send + Sync {
    fn is_interrupted(&self) -> bool;
}

/// Never interrupted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverInterrupt;

impl InterruptCheck for NeverInterrupt {
    fn is_interrupted(&self) -> bool {
        false
    }
}

/// A flag that can be raised from any thread.
#[derive(Debug, Default)]
pub struct InterruptFlag {
    raised: AtomicBool,
}

impl InterruptFlag {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
        }
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }
}

impl InterruptCheck for InterruptFlag {
    fn is_interrupted(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

/// What a caller is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// An extent cache is empty.
    Allocation,
    /// A flush queue is full.
    Flush,
}

/// Hooks called around every blocking wait.
///
/// `wait_begin` and `wait_end` are always called in pairs from the waiting
/// thread.
pub trait WaitObserver: Send + Sync {
    fn wait_begin(&self, kind: WaitKind);
    fn wait_end(&self, kind: WaitKind);
}

/// Ignores waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl WaitObserver for NoopObserver {
    fn wait_begin(&self, _kind: WaitKind) {}
    fn wait_end(&self, _kind: WaitKind) {}
}

/// Counts stalls and the time spent in them.
#[derive(Debug, Default)]
pub struct StallCounter {
    allocation_waits: AtomicU64,
    flush_waits: AtomicU64,
    stalled_micros: AtomicU64,
    started: Mutex<Vec<(std::thread::ThreadId, Instant)>>,
}

/// Snapshot of a [`StallCounter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallStats {
    pub allocation_waits: u64,
    pub flush_waits: u64,
    pub stalled_micros: u64,
}

impl StallCounter {
    #[must_use]
    pub fn stats(&self) -> StallStats {
        StallStats {
            allocation_waits: self.allocation_waits.load(Ordering::Relaxed),
            flush_waits: self.flush_waits.load(Ordering::Relaxed),
            stalled_micros: self.stalled_micros.load(Ordering::Relaxed),
        }
    }
}

impl WaitObserver for StallCounter {
    fn wait_begin(&self, kind: WaitKind) {
        match kind {
            WaitKind::Allocation => self.allocation_waits.fetch_add(1, Ordering::Relaxed),
            WaitKind::Flush => self.flush_waits.fetch_add(1, Ordering::Relaxed),
        };
        self.started
            .lock()
            .push((std::thread::current().id(), Instant::now()));
    }

    fn wait_end(&self, _kind: WaitKind) {
        let me = std::thread::current().id();
        let mut started = self.started.lock();
        if let Some(pos) = started.iter().rposition(|(id, _)| *id == me) {
            let (_, at) = started.swap_remove(pos);
            let micros = u64::try_from(at.elapsed().as_micros()).unwrap_or(u64::MAX);
            self.stalled_micros.fetch_add(micros, Ordering::Relaxed);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_interrupted());
        flag.raise();
        assert!(flag.is_interrupted());
        assert!(!NeverInterrupt.is_interrupted());
    }

    #[test]
    fn test_stall_counter_pairs() {
        let counter = StallCounter::default();
        counter.wait_begin(WaitKind::Allocation);
        counter.wait_end(WaitKind::Allocation);
        counter.wait_begin(WaitKind::Flush);
        counter.wait_end(WaitKind::Flush);
        counter.wait_begin(WaitKind::Flush);
        counter.wait_end(WaitKind::Flush);

        let stats = counter.stats();
        assert_eq!(stats.allocation_waits, 1);
        assert_eq!(stats.flush_waits, 2);
        assert!(counter.started.lock().is_empty());
    }

    #[test]
    fn test_stall_counter_across_threads() {
        let counter = std::sync::Arc::new(StallCounter::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = std::sync::Arc::clone(&counter);
                std::thread::spawn(move || {
                    counter.wait_begin(WaitKind::Allocation);
                    counter.wait_end(WaitKind::Allocation);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(counter.stats().allocation_waits, 4);
        assert!(counter.started.lock().is_empty());
    }
}

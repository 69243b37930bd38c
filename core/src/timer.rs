//! Ambient timer service.
//!
//! One background thread services every timer in the process. Callbacks must
//! be cheap: actor-facing timers only bounce a work item onto the actor's
//! mailbox via its link. Cancellation is advisory: a tick already in flight
//! can still be delivered, so actor-side scope flags remain the source of
//! truth for lifecycle-scoped timers.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::error;

enum TimerJob {
    Once(Option<Box<dyn FnOnce() + Send>>),
    Every {
        period: Duration,
        tick: Box<dyn FnMut() + Send>,
    },
}

struct TimerEntry {
    due: Instant,
    seq: u64,
    canceled: Arc<AtomicBool>,
    job: TimerJob,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SchedulerInner {
    entries: Mutex<BinaryHeap<TimerEntry>>,
    tick: Condvar,
    next_seq: AtomicU64,
}

/// Process-wide timer scheduler.
pub(crate) struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Cancels a scheduled timer. Cancellation prevents future deliveries; a
/// tick that already left the scheduler may still arrive.
#[derive(Clone)]
pub(crate) struct TimerHandle {
    canceled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl Scheduler {
    pub(crate) fn global() -> &'static Scheduler {
        static GLOBAL: Lazy<Scheduler> = Lazy::new(Scheduler::start);
        &GLOBAL
    }

    fn start() -> Scheduler {
        let inner = Arc::new(SchedulerInner {
            entries: Mutex::new(BinaryHeap::new()),
            tick: Condvar::new(),
            next_seq: AtomicU64::new(1),
        });
        let for_thread = Arc::clone(&inner);
        let spawned = thread::Builder::new()
            .name("machina-timer".to_string())
            .spawn(move || run_timer_loop(for_thread));
        if let Err(err) = spawned {
            error!(%err, "failed to spawn timer thread");
        }
        Scheduler { inner }
    }

    /// Fires `callback` once after `delay`.
    pub(crate) fn once(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.insert(delay, TimerJob::Once(Some(Box::new(callback))))
    }

    /// Fires `tick` every `period`, first after one full period.
    pub(crate) fn every(&self, period: Duration, tick: impl FnMut() + Send + 'static) -> TimerHandle {
        self.insert(
            period,
            TimerJob::Every {
                period,
                tick: Box::new(tick),
            },
        )
    }

    fn insert(&self, delay: Duration, job: TimerJob) -> TimerHandle {
        let canceled = Arc::new(AtomicBool::new(false));
        let entry = TimerEntry {
            due: Instant::now() + delay,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            canceled: Arc::clone(&canceled),
            job,
        };
        self.inner.entries.lock().push(entry);
        self.inner.tick.notify_one();
        TimerHandle { canceled }
    }
}

fn run_timer_loop(inner: Arc<SchedulerInner>) {
    loop {
        let due_entry = {
            let mut entries = inner.entries.lock();
            loop {
                match entries.peek() {
                    None => {
                        inner.tick.wait(&mut entries);
                    }
                    Some(next) if next.due > Instant::now() => {
                        let due = next.due;
                        inner.tick.wait_until(&mut entries, due);
                    }
                    Some(_) => break entries.pop(),
                }
            }
        };
        let Some(mut entry) = due_entry else {
            continue;
        };
        if entry.canceled.load(Ordering::SeqCst) {
            continue;
        }
        let repeat = match &mut entry.job {
            TimerJob::Once(callback) => {
                if let Some(callback) = callback.take() {
                    callback();
                }
                None
            }
            TimerJob::Every { period, tick } => {
                let period = *period;
                tick();
                Some(period)
            }
        };
        if let Some(period) = repeat {
            entry.due = Instant::now() + period;
            inner.entries.lock().push(entry);
            inner.tick.notify_one();
        }
    }
}

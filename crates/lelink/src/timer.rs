//! Timer seam
//!
//! The stack arms per-connection timers through a [`TimerService`] and expects
//! expiries back via [`BleStack::handle_timer_expired`]. A timer that fires
//! after being cancelled, or after its connection is gone, is a no-op on the
//! stack side, so implementations do not need to be race-free.
//!
//! [`BleStack::handle_timer_expired`]: crate::BleStack::handle_timer_expired

use crate::connection::ConnectionId;
use log::trace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Identifies one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Bounds the running discovery job of a connection
    DiscoveryWatchdog(ConnectionId),
    /// Delayed Service Changed indication to a connection
    ServiceChangedIndication(ConnectionId),
}

/// Arms and cancels one-shot timers
pub trait TimerService: Send + Sync {
    /// Arms `timer`, replacing any previous arming of the same id
    fn schedule(&self, timer: TimerId, after: Duration);

    /// Disarms `timer`; unknown ids are ignored
    fn cancel(&self, timer: TimerId);
}

/// Timer service driven by the host's own clock
///
/// Records what is armed; the host decides when something expires and then
/// calls [`expire`](Self::expire) followed by `BleStack::handle_timer_expired`.
#[derive(Debug, Default)]
pub struct ManualTimerService {
    armed: Mutex<HashMap<TimerId, Duration>>,
}

impl ManualTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self, timer: TimerId) -> bool {
        self.lock().contains_key(&timer)
    }

    /// Duration `timer` was last armed with
    pub fn armed_for(&self, timer: TimerId) -> Option<Duration> {
        self.lock().get(&timer).copied()
    }

    pub fn armed(&self) -> Vec<TimerId> {
        self.lock().keys().copied().collect()
    }

    /// Disarms `timer`, returning whether it was armed
    pub fn expire(&self, timer: TimerId) -> bool {
        self.lock().remove(&timer).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TimerId, Duration>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TimerService for ManualTimerService {
    fn schedule(&self, timer: TimerId, after: Duration) {
        self.lock().insert(timer, after);
    }

    fn cancel(&self, timer: TimerId) {
        self.lock().remove(&timer);
    }
}

type ExpiryHandler = Box<dyn Fn(TimerId) + Send + Sync>;

struct ThreadTimerInner {
    generations: Mutex<HashMap<TimerId, u64>>,
    next_generation: AtomicU64,
    handler: ExpiryHandler,
}

/// Timer service backed by one sleeping thread per arming
///
/// Re-arming or cancelling bumps the timer's generation so stale sleepers
/// wake up and do nothing.
pub struct ThreadTimerService {
    inner: Arc<ThreadTimerInner>,
}

impl ThreadTimerService {
    /// `handler` runs on the sleeper thread when a timer expires
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(TimerId) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ThreadTimerInner {
                generations: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                handler: Box::new(handler),
            }),
        }
    }
}

impl TimerService for ThreadTimerService {
    fn schedule(&self, timer: TimerId, after: Duration) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(timer, generation);

        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            thread::sleep(after);
            let current = {
                let mut generations = inner
                    .generations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if generations.get(&timer) == Some(&generation) {
                    generations.remove(&timer);
                    true
                } else {
                    false
                }
            };
            if current {
                (inner.handler)(timer);
            } else {
                trace!("Timer {:?} superseded before expiry", timer);
            }
        });
    }

    fn cancel(&self, timer: TimerId) {
        self.inner
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&timer);
    }
}

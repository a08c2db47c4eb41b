//! Session timeout management.
//!
//! Both ends of the protocol rely on timers: the sender re-sends its single
//! outstanding packet whenever no matching reply arrives in time, and the
//! receiver declares a peer dead when it stays silent for too long.  This
//! module provides:
//! - [`TimerConfig`]: the timeout durations.
//! - [`TimerHandle`]: one spawned, cancellable expiry task.
//! - [`SessionTimer`]: the single timer slot owned by each receiver session.
//!
//! Every arming is stamped with a fresh generation number.  An expiry task that
//! lost a race against a re-arm or a cancel presents a stale generation to
//! [`SessionTimer::claim`] and must then do nothing, so a superseded timer can
//! never inject a timeout into a session that has since moved on.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Adjustable timeout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// How long a receiver session may stay silent before it is torn down.
    pub session_timeout: Duration,
    /// How long the sender waits for a reply before re-sending.
    pub ack_timeout: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

/// A spawned expiry task.
///
/// Dropping the handle aborts the task unless it was [`detach`](Self::detach)ed.
#[derive(Debug)]
pub struct TimerHandle {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Run `on_expiry` once `duration` has elapsed.
    pub fn spawn<F>(duration: Duration, generation: u64, on_expiry: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_expiry.await;
        });
        Self {
            generation,
            task: Some(task),
        }
    }

    /// Generation stamp given at spawn time.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Abort the expiry task if it has not run yet.
    pub fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Release the handle without aborting the task.
    ///
    /// Used by the expiry task itself once it has claimed its slot; aborting
    /// there would cancel the timeout transition halfway through.
    pub fn detach(mut self) {
        self.task.take();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The single pending-timer slot of one session.
#[derive(Debug, Default)]
pub struct SessionTimer {
    slot: Option<TimerHandle>,
    next_generation: u64,
}

impl SessionTimer {
    /// Arm the timer, replacing (and cancelling) any pending one.
    ///
    /// `on_expiry` receives the generation of this arming and builds the
    /// future to run on expiry; that future should call [`claim`](Self::claim)
    /// under the session lock before acting.
    pub fn arm<F, Fut>(&mut self, duration: Duration, on_expiry: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let generation = self.next_generation;
        self.next_generation += 1;
        self.slot = Some(TimerHandle::spawn(duration, generation, on_expiry(generation)));
    }

    /// Disarm the pending timer, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.slot.take() {
            handle.cancel();
        }
    }

    /// Called by an expiry task: returns `true` and empties the slot if
    /// `generation` is still the armed one, `false` for a superseded timer.
    pub fn claim(&mut self, generation: u64) -> bool {
        if !self.slot.as_ref().is_some_and(|h| h.generation() == generation) {
            return false;
        }
        if let Some(handle) = self.slot.take() {
            handle.detach();
        }
        true
    }

    /// `true` while a timer is pending.
    pub fn is_armed(&self) -> bool {
        self.slot.is_some()
    }
}

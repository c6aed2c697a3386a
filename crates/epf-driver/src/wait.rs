// SPDX-License-Identifier: AGPL-3.0-only

//! Wait/wake scheduling
//!
//! Every side owns a [`WaitSet`]: one queue per subdevice slot plus an event
//! queue. The doorbell handler wakes all of them; a waiter then re-reads its
//! MCB counter and goes back to sleep unless the counter moved away from its
//! snapshot. Spurious wakeups are therefore harmless.
//!
//! Wake detection is `now.wrapping_sub(snapshot) != 0`, which stays correct
//! across the 2³² wrap of the counters.

use crate::error::{EpfError, Result};
use crate::mmio::rmb;
use epf_proto::limits::MAX_SUB;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A wait queue
///
/// Wakes are counted in a generation number so a wake that lands between
/// the waiter's counter check and its sleep is never lost.
#[derive(Debug, Default)]
pub struct WaitQueue {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl WaitQueue {
    /// Empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every sleeper
    pub fn wake_all(&self) {
        let mut g = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *g = g.wrapping_add(1);
        drop(g);
        self.cv.notify_all();
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep until the generation differs from `seen` or `timeout` elapses
    pub fn sleep(&self, seen: u64, timeout: Duration) {
        let g = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .cv
            .wait_timeout_while(g, timeout, |g| *g == seen)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Per-side set of wait queues
#[derive(Debug)]
pub struct WaitSet {
    slots: Vec<Arc<WaitQueue>>,
    event: Arc<WaitQueue>,
}

impl Default for WaitSet {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitSet {
    /// `MAX_SUB` slot queues plus the event queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_SUB).map(|_| Arc::new(WaitQueue::new())).collect(),
            event: Arc::new(WaitQueue::new()),
        }
    }

    /// Queue of slot `idx`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `idx >= MAX_SUB`.
    pub fn slot(&self, idx: usize) -> Result<&Arc<WaitQueue>> {
        self.slots.get(idx).ok_or_else(|| {
            EpfError::invalid_argument(format!("subdevice {idx} >= {MAX_SUB}"))
        })
    }

    /// Queue for events not tied to a slot (PCI test interrupts)
    #[must_use]
    pub fn event(&self) -> &Arc<WaitQueue> {
        &self.event
    }

    /// Wake every queue
    pub fn wake_all(&self) {
        for q in &self.slots {
            q.wake_all();
        }
        self.event.wake_all();
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    queue: Mutex<Option<Arc<WaitQueue>>>,
}

/// Cancellation handle for one blocking call, the analogue of a pending
/// signal
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Fresh, not cancelled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and wake the queue the holder sleeps on
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let q = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(q) = q {
            q.wake_all();
        }
    }

    /// Whether [`CancelToken::cancel`] was called since the last reset
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Clear the cancellation so the token can be reused for a retry
    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::Release);
    }

    fn attach(&self, queue: &Arc<WaitQueue>) {
        *self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner) = Some(queue.clone());
    }

    fn detach(&self) {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// One wait on an MCB counter
#[derive(Debug)]
pub struct Wait<'a> {
    /// Queue the doorbell wakes
    pub queue: &'a Arc<WaitQueue>,
    /// Last consumed counter value
    pub snapshot: u32,
    /// Give up after this long
    pub deadline: Duration,
    /// Optional cancellation
    pub cancel: Option<&'a CancelToken>,
    /// What is awaited, for errors and logs
    pub what: &'a str,
}

/// Sleep until `read()` returns a value different from `snapshot`
///
/// Returns the new counter value. A read barrier is issued before returning
/// so descriptor reads that follow observe the peer's earlier writes.
///
/// # Errors
///
/// `Timeout` past the deadline, `Cancelled` once the token fires, and any
/// error of `read` (an unmapped BAR surfaces as `DeviceGone`).
pub fn wait_for_advance(wait: &Wait<'_>, mut read: impl FnMut() -> Result<u32>) -> Result<u32> {
    let start = Instant::now();
    if let Some(token) = wait.cancel {
        token.attach(wait.queue);
    }

    let result = loop {
        let generation = wait.queue.generation();
        let now = match read() {
            Ok(v) => v,
            Err(e) => break Err(e),
        };
        if now.wrapping_sub(wait.snapshot) != 0 {
            rmb();
            break Ok(now);
        }
        if wait.cancel.is_some_and(CancelToken::is_cancelled) {
            tracing::warn!("Wait for {} cancelled", wait.what);
            break Err(EpfError::cancelled(wait.what));
        }
        let elapsed = start.elapsed();
        if elapsed >= wait.deadline {
            tracing::warn!("Wait for {} timed out after {:?}", wait.what, wait.deadline);
            break Err(EpfError::timeout(wait.what, wait.deadline));
        }
        wait.queue.sleep(generation, wait.deadline - elapsed);
    };

    if let Some(token) = wait.cancel {
        token.detach();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn returns_immediately_when_already_advanced() {
        let q = Arc::new(WaitQueue::new());
        let w = Wait {
            queue: &q,
            snapshot: 3,
            deadline: Duration::from_millis(10),
            cancel: None,
            what: "test",
        };
        assert_eq!(wait_for_advance(&w, || Ok(4)).unwrap(), 4);
    }

    #[test]
    fn wakes_on_bump_after_doorbell() {
        let set = Arc::new(WaitSet::new());
        let counter = Arc::new(AtomicU32::new(0));
        let (s, c) = (set.clone(), counter.clone());
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            c.store(1, Ordering::SeqCst);
            s.wake_all();
        });
        let w = Wait {
            queue: set.slot(2).unwrap(),
            snapshot: 0,
            deadline: Duration::from_secs(5),
            cancel: None,
            what: "wakeup[2]",
        };
        assert_eq!(
            wait_for_advance(&w, || Ok(counter.load(Ordering::SeqCst))).unwrap(),
            1
        );
        waker.join().unwrap();
    }

    #[test]
    fn spurious_wake_goes_back_to_sleep() {
        let q = Arc::new(WaitQueue::new());
        let q2 = q.clone();
        let waker = std::thread::spawn(move || {
            for _ in 0..5 {
                std::thread::sleep(Duration::from_millis(2));
                q2.wake_all();
            }
        });
        let w = Wait {
            queue: &q,
            snapshot: 7,
            deadline: Duration::from_millis(50),
            cancel: None,
            what: "never",
        };
        assert!(matches!(
            wait_for_advance(&w, || Ok(7)),
            Err(EpfError::Timeout { .. })
        ));
        waker.join().unwrap();
    }

    #[test]
    fn wrap_counts_as_advance() {
        let q = Arc::new(WaitQueue::new());
        let w = Wait {
            queue: &q,
            snapshot: u32::MAX,
            deadline: Duration::from_millis(10),
            cancel: None,
            what: "wrap",
        };
        assert_eq!(wait_for_advance(&w, || Ok(0)).unwrap(), 0);
    }

    #[test]
    fn cancel_interrupts_sleep() {
        let q = Arc::new(WaitQueue::new());
        let token = CancelToken::new();
        let t2 = token.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            t2.cancel();
        });
        let w = Wait {
            queue: &q,
            snapshot: 0,
            deadline: Duration::from_secs(10),
            cancel: Some(&token),
            what: "cancel",
        };
        let started = Instant::now();
        assert!(matches!(
            wait_for_advance(&w, || Ok(0)),
            Err(EpfError::Cancelled { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();

        token.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn read_errors_propagate() {
        let q = Arc::new(WaitQueue::new());
        let w = Wait {
            queue: &q,
            snapshot: 0,
            deadline: Duration::from_secs(1),
            cancel: None,
            what: "gone",
        };
        assert!(matches!(
            wait_for_advance(&w, || Err(EpfError::device_gone("unplugged"))),
            Err(EpfError::DeviceGone { .. })
        ));
    }

    #[test]
    fn slot_index_is_checked() {
        assert!(WaitSet::new().slot(MAX_SUB).is_err());
    }
}

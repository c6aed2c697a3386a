// SPDX-License-Identifier: AGPL-3.0-only

//! DMA engine abstraction
//!
//! ```text
//! caller                         engine
//! ──────                         ──────
//! channels.acquire()
//! completion() ─ signal ───────▶ submit(channel, desc, signal)
//! completion.wait(watchdog)        … copy …
//!        ◀───────────────────────  signal.complete(status)
//! update MCB, ring peer
//! ```
//!
//! The engine's completion path only resolves the [`CompletionSignal`]; every
//! MCB update happens on the submitting thread after [`Completion::wait`].

pub mod soft;

use crate::error::{EpfError, Result};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub use soft::SoftDma;

/// Transfer direction, from the engine's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Local memory to the device / remote side
    MemToDev,
    /// Device / remote side to local memory
    DevToMem,
}

/// One DMA descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    /// Source bus address
    pub src: u64,
    /// Destination bus address
    pub dst: u64,
    /// Length in bytes
    pub len: usize,
    /// Direction
    pub direction: DmaDirection,
}

/// Completion status reported by an engine
pub type DmaStatus = std::result::Result<(), String>;

/// A DMA engine
pub trait DmaEngine: Send + Sync + std::fmt::Debug {
    /// Engine name, for logs
    fn name(&self) -> &str;

    /// Number of channels
    fn channels(&self) -> usize;

    /// Required alignment of `src` and `dst`
    fn alignment(&self) -> u64;

    /// Lengths must be a multiple of this
    fn min_burst(&self) -> usize;

    /// Queue `desc` on `channel`; `done` is resolved when it finishes
    ///
    /// # Errors
    ///
    /// `DmaFailed` if the descriptor is rejected. The signal is dropped in
    /// that case, which resolves the completion with an error as well.
    fn submit(&self, channel: usize, desc: DmaDescriptor, done: CompletionSignal) -> Result<()>;
}

#[derive(Debug, Default)]
struct CompletionState {
    status: Mutex<Option<DmaStatus>>,
    cv: Condvar,
}

/// Waiting half of a completion
#[derive(Debug)]
pub struct Completion {
    state: Arc<CompletionState>,
}

/// Signalling half of a completion, handed to the engine
///
/// Dropping it unresolved completes with an error.
#[derive(Debug)]
pub struct CompletionSignal {
    state: Option<Arc<CompletionState>>,
}

/// New completion pair
#[must_use]
pub fn completion() -> (Completion, CompletionSignal) {
    let state = Arc::new(CompletionState::default());
    (
        Completion {
            state: state.clone(),
        },
        CompletionSignal { state: Some(state) },
    )
}

impl CompletionSignal {
    /// Resolve the completion
    pub fn complete(mut self, status: DmaStatus) {
        self.resolve(status);
    }

    fn resolve(&mut self, status: DmaStatus) {
        if let Some(state) = self.state.take() {
            *state.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
            state.cv.notify_all();
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.resolve(Err("descriptor dropped by the engine".into()));
    }
}

impl Completion {
    /// Block until the engine resolves the completion
    ///
    /// # Errors
    ///
    /// `DmaFailed` with the engine's reason; `DeviceGone` if the watchdog
    /// expires first (the engine is assumed wedged).
    pub fn wait(self, watchdog: Duration) -> Result<()> {
        let guard = self.state.status.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut guard, timeout) = self
            .state
            .cv
            .wait_timeout_while(guard, watchdog, |s| s.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        if timeout.timed_out() && guard.is_none() {
            return Err(EpfError::device_gone(format!(
                "DMA completion missing after {watchdog:?}"
            )));
        }
        match guard.take() {
            Some(Ok(())) => Ok(()),
            Some(Err(reason)) => Err(EpfError::dma_failed(reason)),
            None => Err(EpfError::device_gone("DMA completion missing")),
        }
    }
}

#[derive(Debug)]
struct ChannelState {
    free: Vec<usize>,
    closed: bool,
}

/// Channel arbitration for one side
#[derive(Debug)]
pub struct DmaChannels {
    state: Mutex<ChannelState>,
    cv: Condvar,
}

/// A held channel, released on drop
#[derive(Debug)]
pub struct ChannelGuard<'a> {
    owner: &'a DmaChannels,
    id: usize,
}

impl ChannelGuard<'_> {
    /// Channel number
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        let mut s = self.owner.state.lock().unwrap_or_else(PoisonError::into_inner);
        s.free.push(self.id);
        drop(s);
        self.owner.cv.notify_one();
    }
}

impl DmaChannels {
    /// Channels `0..count`
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                free: (0..count).rev().collect(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Take a channel, waiting up to `deadline`
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` on timeout or once closed.
    pub fn acquire(&self, deadline: Duration) -> Result<ChannelGuard<'_>> {
        let end = Instant::now() + deadline;
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if s.closed {
                return Err(EpfError::exhausted("DMA channels closed"));
            }
            if let Some(id) = s.free.pop() {
                return Ok(ChannelGuard { owner: self, id });
            }
            let now = Instant::now();
            if now >= end {
                return Err(EpfError::exhausted(format!(
                    "no DMA channel within {deadline:?}"
                )));
            }
            s = self
                .cv
                .wait_timeout(s, end - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Refuse every later acquire
    pub fn close(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_carries_status() {
        let (c, s) = completion();
        std::thread::spawn(move || s.complete(Ok(())));
        c.wait(Duration::from_secs(5)).unwrap();

        let (c, s) = completion();
        s.complete(Err("bus error".into()));
        assert!(matches!(
            c.wait(Duration::from_secs(1)),
            Err(EpfError::DmaFailed { .. })
        ));
    }

    #[test]
    fn dropped_signal_fails_the_wait() {
        let (c, s) = completion();
        drop(s);
        assert!(matches!(
            c.wait(Duration::from_secs(1)),
            Err(EpfError::DmaFailed { .. })
        ));
    }

    #[test]
    fn watchdog_declares_device_gone() {
        let (c, _s) = completion();
        assert!(matches!(
            c.wait(Duration::from_millis(10)),
            Err(EpfError::DeviceGone { .. })
        ));
    }

    #[test]
    fn channels_are_exclusive() {
        let ch = DmaChannels::new(1);
        let held = ch.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(held.id(), 0);
        assert!(matches!(
            ch.acquire(Duration::from_millis(10)),
            Err(EpfError::ResourceExhausted { .. })
        ));
        drop(held);
        assert!(ch.acquire(Duration::from_millis(10)).is_ok());
        ch.close();
        assert!(ch.acquire(Duration::from_millis(10)).is_err());
    }
}

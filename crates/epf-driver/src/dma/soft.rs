// SPDX-License-Identifier: AGPL-3.0-only

//! Software DMA engine
//!
//! One worker thread per channel copies between bus addresses resolved
//! through a [`BusMap`]. Used by the loopback platform and the tests; faults
//! can be injected to exercise the error paths of the DMA plane.

use super::{CompletionSignal, DmaDescriptor, DmaEngine};
use crate::error::{EpfError, Result};
use crate::memory::BusMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

struct Job {
    desc: DmaDescriptor,
    done: CompletionSignal,
}

#[derive(Debug, Default)]
struct Faults {
    reject: AtomicUsize,
    fail: AtomicUsize,
    stall: AtomicUsize,
    stalled: Mutex<Vec<CompletionSignal>>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// In-process DMA engine
pub struct SoftDma {
    name: String,
    alignment: u64,
    burst: usize,
    queues: Mutex<Vec<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    faults: Arc<Faults>,
    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
    channels: usize,
}

impl std::fmt::Debug for SoftDma {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftDma")
            .field("name", &self.name)
            .field("channels", &self.channels)
            .field("burst", &self.burst)
            .field("submitted", &self.submitted())
            .finish_non_exhaustive()
    }
}

impl SoftDma {
    /// Start `channels` workers over `bus`
    ///
    /// # Errors
    ///
    /// Returns `Io` if a worker thread cannot be spawned.
    pub fn new(
        name: impl Into<String>,
        bus: BusMap,
        channels: usize,
        alignment: u64,
        burst: usize,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let faults = Arc::new(Faults::default());
        let completed = Arc::new(AtomicU64::new(0));
        let mut queues = Vec::with_capacity(channels);
        let mut workers = Vec::with_capacity(channels);

        for ch in 0..channels {
            let (tx, rx) = mpsc::channel::<Job>();
            let bus = bus.clone();
            let faults = faults.clone();
            let completed = completed.clone();
            let thread_name = format!("{name}-ch{ch}");
            let handle = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    for job in rx {
                        if take_one(&faults.stall) {
                            // Never completes; the submitter's watchdog fires
                            faults
                                .stalled
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(job.done);
                            continue;
                        }
                        let status = if take_one(&faults.fail) {
                            Err("injected completion error".to_string())
                        } else {
                            bus.copy(job.desc.src, job.desc.dst, job.desc.len)
                                .map_err(|e| e.to_string())
                        };
                        completed.fetch_add(1, Ordering::AcqRel);
                        job.done.complete(status);
                    }
                })?;
            queues.push(tx);
            workers.push(handle);
        }

        tracing::info!("{name}: {channels} channel(s), burst {burst}, align {alignment}");
        Ok(Arc::new(Self {
            name,
            alignment,
            burst,
            queues: Mutex::new(queues),
            workers: Mutex::new(workers),
            faults,
            submitted: AtomicU64::new(0),
            completed,
            channels,
        }))
    }

    /// Reject the next `n` submissions
    pub fn reject_next(&self, n: usize) {
        self.faults.reject.store(n, Ordering::Release);
    }

    /// Complete the next `n` descriptors with an error, copying nothing
    pub fn fail_next(&self, n: usize) {
        self.faults.fail.store(n, Ordering::Release);
    }

    /// Never complete the next `n` descriptors
    pub fn stall_next(&self, n: usize) {
        self.faults.stall.store(n, Ordering::Release);
    }

    /// Descriptors accepted so far
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Descriptors completed so far (successfully or not)
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Stop the workers; later submissions are rejected
    pub fn shutdown(&self) {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner).clear();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for w in workers {
            let _ = w.join();
        }
        self.faults
            .stalled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl DmaEngine for SoftDma {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn alignment(&self) -> u64 {
        self.alignment
    }

    fn min_burst(&self) -> usize {
        self.burst
    }

    fn submit(&self, channel: usize, desc: DmaDescriptor, done: CompletionSignal) -> Result<()> {
        if take_one(&self.faults.reject) {
            return Err(EpfError::dma_failed(format!(
                "{}: descriptor rejected (injected)",
                self.name
            )));
        }
        if desc.len == 0 || desc.len % self.burst != 0 {
            return Err(EpfError::dma_failed(format!(
                "{}: length {:#x} not a multiple of burst {}",
                self.name, desc.len, self.burst
            )));
        }
        if desc.src % self.alignment != 0 || desc.dst % self.alignment != 0 {
            return Err(EpfError::dma_failed(format!(
                "{}: misaligned {:#x} -> {:#x}",
                self.name, desc.src, desc.dst
            )));
        }

        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.get(channel).ok_or_else(|| {
            EpfError::dma_failed(format!("{}: no channel {channel}", self.name))
        })?;
        tracing::debug!(
            "{} ch{channel}: {:?} {:#x} -> {:#x} ({:#x} bytes)",
            self.name,
            desc.direction,
            desc.src,
            desc.dst,
            desc.len
        );
        queue
            .send(Job { desc, done })
            .map_err(|_| EpfError::dma_failed(format!("{}: channel {channel} stopped", self.name)))?;
        self.submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for SoftDma {
    fn drop(&mut self) {
        self.shutdown();
    }
}

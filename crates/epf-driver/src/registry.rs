// SPDX-License-Identifier: AGPL-3.0-only

//! Endpoint registry
//!
//! `MAX_EP` fixed entries behind one mutex. Entries never move: an
//! [`EndpointId`] names a slot plus the generation it was probed in, so an id
//! kept past `remove` is detected as stale instead of reaching whichever
//! endpoint reused the slot.

use crate::endpoint::Endpoint;
use crate::error::{EpfError, Result};
use crate::ioctl;
use crate::pci_test::TestHost;
use crate::wait::CancelToken;
use epf_proto::limits::MAX_EP;
use epf_proto::Side;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Handle to a registered endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    index: usize,
    generation: u64,
}

impl EndpointId {
    /// Registry slot
    #[must_use]
    pub const fn index(self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone)]
struct Entry {
    endpoint: Arc<Endpoint>,
    test: Option<Arc<TestHost>>,
    generation: u64,
}

#[derive(Debug)]
struct Table {
    entries: [Option<Entry>; MAX_EP],
    next_generation: u64,
}

/// Process-wide endpoint table
#[derive(Debug)]
pub struct Registry {
    table: Mutex<Table>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                entries: std::array::from_fn(|_| None),
                next_generation: 1,
            }),
        }
    }

    /// The lazily created process-wide registry
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Register a probed endpoint
    ///
    /// RC endpoints get a [`TestHost`] for the `'P'` ioctls.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when all `MAX_EP` entries are taken.
    pub fn probe(&self, endpoint: Arc<Endpoint>) -> Result<EndpointId> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let index = table
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| EpfError::exhausted(format!("endpoint registry ({MAX_EP} entries)")))?;
        let generation = table.next_generation;
        table.next_generation += 1;

        tracing::info!(
            "Registered {} endpoint {} as #{index}",
            endpoint.side(),
            endpoint.bdf()
        );
        let test = (endpoint.side() == Side::Rc).then(|| Arc::new(TestHost::new()));
        table.entries[index] = Some(Entry {
            endpoint,
            test,
            generation,
        });
        Ok(EndpointId { index, generation })
    }

    fn entry(&self, id: EndpointId) -> Result<Entry> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        match table.entries.get(id.index) {
            Some(Some(e)) if e.generation == id.generation => Ok(e.clone()),
            _ => Err(EpfError::device_gone(format!("endpoint #{} removed", id.index))),
        }
    }

    /// Look up an endpoint
    ///
    /// # Errors
    ///
    /// `DeviceGone` for a removed or stale id.
    pub fn get(&self, id: EndpointId) -> Result<Arc<Endpoint>> {
        self.entry(id).map(|e| e.endpoint)
    }

    /// PCI test host of an RC endpoint
    ///
    /// # Errors
    ///
    /// `DeviceGone` for a stale id; `NotSupported` for an EP.
    pub fn test_host(&self, id: EndpointId) -> Result<Arc<TestHost>> {
        self.entry(id)?
            .test
            .ok_or_else(|| EpfError::not_supported("PCI test host on the EP side"))
    }

    /// Tear an endpoint down
    ///
    /// The endpoint is marked dead first, so blocked callers return
    /// `DeviceGone` and later ioctls on the id do too.
    ///
    /// # Errors
    ///
    /// `DeviceGone` for a stale id.
    pub fn remove(&self, id: EndpointId) -> Result<Arc<Endpoint>> {
        let entry = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            match table.entries.get_mut(id.index) {
                Some(slot) if slot.as_ref().is_some_and(|e| e.generation == id.generation) => {
                    slot.take()
                }
                _ => None,
            }
        }
        .ok_or_else(|| EpfError::device_gone(format!("endpoint #{} removed", id.index)))?;

        entry.endpoint.mark_dead("removed");
        tracing::info!("Removed {} endpoint {}", entry.endpoint.side(), entry.endpoint.bdf());
        Ok(entry.endpoint)
    }

    /// Ids of every registered endpoint
    pub fn ids(&self) -> Vec<EndpointId> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, e)| {
                e.as_ref().map(|e| EndpointId {
                    index,
                    generation: e.generation,
                })
            })
            .collect()
    }

    /// Registered endpoints
    pub fn len(&self) -> usize {
        self.ids().len()
    }

    /// Whether no endpoint is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw ioctl on a registered endpoint: `0` or a negative errno
    ///
    /// The registry lock is released before the command runs, so a blocking
    /// ioctl never holds up probe or remove.
    pub fn ioctl(
        &self,
        id: EndpointId,
        cmd: u32,
        arg: &mut [u8],
        cancel: Option<&CancelToken>,
    ) -> i32 {
        match self.entry(id) {
            Ok(entry) => ioctl::dispatch(&entry.endpoint, entry.test.as_deref(), cmd, arg, cancel),
            Err(e) => e.errno(),
        }
    }
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol-wide limits.

/// Endpoints one RC can have probed at the same time.
pub const MAX_EP: usize = 6;

/// Subdevice slots in every MCB layout.
///
/// The layout always carries `MAX_SUB` slots; a transport may activate fewer
/// (see [`crate::transport::McbLayout::max_subdevices`]).
pub const MAX_SUB: usize = 16;

/// Required alignment of local and remote bus addresses handed to the DMA plane.
pub const DMA_ALIGN: u64 = 8;

/// Default minimum burst of the DMA engine in bytes.
///
/// Transfers whose length is not a multiple of the burst are split into a
/// burst-aligned head (DMA) and a byte-copied tail.
pub const DEFAULT_DMA_BURST: usize = 64;

/// Allocation granule of the per-side DMA pools.
pub const POOL_GRANULE: usize = 64;

/// Page size used when carving reserved memory regions.
pub const PAGE_SIZE: usize = 4096;

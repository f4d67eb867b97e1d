// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scratch buffers whose size follows the picture dimensions.
//!
//! VP9 frames can change size at any time. Buffers only ever grow: a buffer is reallocated when
//! the platform reports it too small for the largest picture seen so far, and kept otherwise.

use std::collections::HashMap;

use log::debug;

use crate::backend::AllocInit;
use crate::backend::GpuResource;
use crate::backend::HwInterface;
use crate::codec::vp9::params::BitDepth;
use crate::codec::vp9::params::SUPER_BLOCK_HEIGHT;
use crate::codec::vp9::params::SUPER_BLOCK_WIDTH;
use crate::decoder::vp9::platform::ResourceSizing;
use crate::decoder::vp9::platform::RowStoreCaches;
use crate::decoder::vp9::writer::SegmentIdBuffers;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::utils::div_round_up;
use crate::ChromaFormat;

/// Number of motion vector buffers: the current frame's and the collocated one.
pub const NUM_MV_BUFFERS: usize = 2;

const SEGMENT_ID_RESET_NAME: &str = "SegmentIdBuffreset";

/// Scratch buffers of the decode engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    DeblockingLine,
    DeblockingTileLine,
    DeblockingTileColumn,
    MetadataLine,
    MetadataTileLine,
    MetadataTileColumn,
    HvdLine,
    HvdTile,
    SegmentId,
    MvTemporal,
}

impl BufferKind {
    pub const ALL: [BufferKind; 10] = [
        BufferKind::DeblockingLine,
        BufferKind::DeblockingTileLine,
        BufferKind::DeblockingTileColumn,
        BufferKind::MetadataLine,
        BufferKind::MetadataTileLine,
        BufferKind::MetadataTileColumn,
        BufferKind::HvdLine,
        BufferKind::HvdTile,
        BufferKind::SegmentId,
        BufferKind::MvTemporal,
    ];

    /// Name the buffer is allocated under.
    pub fn name(&self) -> &'static str {
        match self {
            BufferKind::DeblockingLine => "DeblockingLineScratchBuffer",
            BufferKind::DeblockingTileLine => "DeblockingTileScratchBuffer",
            BufferKind::DeblockingTileColumn => "DeblockingColumnScratchBuffer",
            BufferKind::MetadataLine => "MetadataLineBuffer",
            BufferKind::MetadataTileLine => "MetadataTileLineBuffer",
            BufferKind::MetadataTileColumn => "MetadataTileColumnBuffer",
            BufferKind::HvdLine => "HvcLineRowStoreBuffer",
            BufferKind::HvdTile => "HvcTileRowStoreBuffer",
            BufferKind::SegmentId => "Vp9SegmentIdBuffer",
            BufferKind::MvTemporal => "MvTemporalBuffer",
        }
    }

    /// Whether an enabled row-store cache makes the external buffer unnecessary.
    fn replaced_by_cache(&self, caches: &RowStoreCaches) -> bool {
        match self {
            BufferKind::DeblockingLine => caches.df.enabled,
            BufferKind::MetadataLine => caches.dat.enabled,
            BufferKind::HvdLine => caches.hvd.enabled,
            _ => false,
        }
    }
}

/// Picture properties scratch buffer sizes depend on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferSizeParams {
    pub width_in_sb: u32,
    pub height_in_sb: u32,
    pub max_bit_depth: u8,
    pub chroma_format: ChromaFormat,
}

impl BufferSizeParams {
    pub fn new(width: u32, height: u32, bit_depth: BitDepth, chroma_format: ChromaFormat) -> Self {
        Self {
            width_in_sb: div_round_up(width, SUPER_BLOCK_WIDTH),
            height_in_sb: div_round_up(height, SUPER_BLOCK_HEIGHT),
            max_bit_depth: 8 + bit_depth.indicator() * 2,
            chroma_format,
        }
    }
}

/// Frees `slot` and allocates a new buffer for `kind` in it if it is empty or too small.
///
/// A buffer skipped while a row-store cache replaced it can be smaller than the allocated
/// dimensions suggest, so its actual size is checked too.
#[allow(clippy::too_many_arguments)]
fn ensure<B: HwInterface, S: ResourceSizing + ?Sized>(
    hw: &mut B,
    sizing: &S,
    slot: &mut Option<GpuResource>,
    kind: BufferKind,
    name: &'static str,
    init: AllocInit,
    params: &BufferSizeParams,
    allocated: (u32, u32),
) -> DecodeResult<()> {
    let size = sizing.buffer_size(kind, params)?;
    let too_small = sizing.realloc_needed(kind, params, allocated.0, allocated.1);
    if matches!(slot, Some(r) if !too_small && r.size >= size) {
        return Ok(());
    }

    let old_size = slot.map(|r| r.size).unwrap_or(0);
    if let Some(old) = slot.take() {
        hw.free(&old);
    }

    debug!("Allocating {}: {} -> {} bytes", name, old_size, size);
    *slot = Some(hw.allocate(size, name, init)?);

    Ok(())
}

/// Scratch buffers of a decoder instance.
#[derive(Default)]
pub struct ScratchBuffers {
    buffers: HashMap<BufferKind, GpuResource>,
    segment_id_reset: Option<GpuResource>,
    mv_temporal: [Option<GpuResource>; NUM_MV_BUFFERS],
    allocated_width_in_sb: u32,
    allocated_height_in_sb: u32,
}

impl ScratchBuffers {
    pub fn new() -> Self {
        Default::default()
    }

    /// Width and height, in superblocks, the buffers are currently allocated for.
    pub fn allocated_size_in_sb(&self) -> (u32, u32) {
        (self.allocated_width_in_sb, self.allocated_height_in_sb)
    }

    /// Makes every buffer large enough for `params`. Line buffers replaced by an enabled
    /// row-store cache are left alone.
    pub fn ensure_sizes<B: HwInterface, S: ResourceSizing + ?Sized>(
        &mut self,
        hw: &mut B,
        sizing: &S,
        params: &BufferSizeParams,
        caches: &RowStoreCaches,
    ) -> DecodeResult<()> {
        let allocated = self.allocated_size_in_sb();

        for kind in BufferKind::ALL {
            if kind == BufferKind::MvTemporal || kind.replaced_by_cache(caches) {
                continue;
            }

            let mut slot = self.buffers.remove(&kind);
            let res = ensure(
                hw,
                sizing,
                &mut slot,
                kind,
                kind.name(),
                AllocInit::Uninitialized,
                params,
                allocated,
            );
            if let Some(resource) = slot {
                self.buffers.insert(kind, resource);
            }
            res?;
        }

        ensure(
            hw,
            sizing,
            &mut self.segment_id_reset,
            BufferKind::SegmentId,
            SEGMENT_ID_RESET_NAME,
            AllocInit::Zeroed,
            params,
            allocated,
        )?;

        // The ring is reallocated as a whole.
        let ring_too_small =
            sizing.realloc_needed(BufferKind::MvTemporal, params, allocated.0, allocated.1);
        if ring_too_small || self.mv_temporal.iter().any(Option::is_none) {
            for slot in self.mv_temporal.iter_mut() {
                if let Some(old) = slot.take() {
                    hw.free(&old);
                }
            }

            let size = sizing.buffer_size(BufferKind::MvTemporal, params)?;
            debug!(
                "Allocating {} x{}: {} bytes",
                BufferKind::MvTemporal.name(),
                NUM_MV_BUFFERS,
                size
            );
            for slot in self.mv_temporal.iter_mut() {
                *slot = Some(hw.allocate(
                    size,
                    BufferKind::MvTemporal.name(),
                    AllocInit::Uninitialized,
                )?);
            }
        }

        self.allocated_width_in_sb = self.allocated_width_in_sb.max(params.width_in_sb);
        self.allocated_height_in_sb = self.allocated_height_in_sb.max(params.height_in_sb);

        Ok(())
    }

    /// Returns the buffer of `kind`, if it has been allocated.
    pub fn get(&self, kind: BufferKind) -> Option<GpuResource> {
        self.buffers.get(&kind).copied()
    }

    /// Returns the buffer of `kind`, failing if it has not been allocated.
    pub fn buffer(&self, kind: BufferKind) -> DecodeResult<GpuResource> {
        self.get(kind)
            .ok_or_else(|| DecodeError::ResourceUnavailable(kind.name().to_string()))
    }

    /// Returns motion vector buffer `index` of the ring.
    pub fn mv_temporal(&self, index: usize) -> DecodeResult<GpuResource> {
        self.mv_temporal
            .get(index)
            .copied()
            .flatten()
            .ok_or_else(|| DecodeError::ResourceUnavailable(BufferKind::MvTemporal.name().into()))
    }

    pub fn segment_ids(&self) -> DecodeResult<SegmentIdBuffers> {
        let buffer = self.buffer(BufferKind::SegmentId)?;
        let reset = self
            .segment_id_reset
            .ok_or_else(|| DecodeError::ResourceUnavailable(SEGMENT_ID_RESET_NAME.into()))?;

        Ok(SegmentIdBuffers {
            buffer,
            reset,
            size: buffer.size.min(reset.size),
        })
    }

    /// Frees every buffer.
    pub fn free_all<B: HwInterface>(&mut self, hw: &mut B) {
        for (_, resource) in self.buffers.drain() {
            hw.free(&resource);
        }
        for resource in self
            .mv_temporal
            .iter_mut()
            .chain(std::iter::once(&mut self.segment_id_reset))
            .filter_map(Option::take)
        {
            hw.free(&resource);
        }
    }
}

// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Capabilities that differ between GPU generations.
//!
//! The frame context logic is the same on every generation. What changes is how large the
//! engine's scratch buffers must be, which row-store caches exist, and how much command buffer
//! space a frame takes. [`ResourceSizing`] and [`ContextCreation`] capture those differences,
//! and [`for_generation`] returns the implementation matching a [`Generation`].

use crate::codec::vp9::params::BitDepth;
use crate::decoder::vp9::resources::BufferKind;
use crate::decoder::vp9::resources::BufferSizeParams;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::Generation;
use crate::ChromaFormat;

/// Scratch buffers are sized in cachelines.
pub const CACHELINE_SIZE: usize = 64;

/// Space reserved at the end of every command buffer.
pub const COMMAND_BUFFER_RESERVED_SPACE: usize = 0x80;

/// Number of segment state commands a frame may need.
const SEGMENT_STATE_COUNT: usize = 8;

/// Computes the size of the engine's scratch buffers.
pub trait ResourceSizing {
    /// Returns the size in bytes `kind` needs for a picture described by `params`.
    fn buffer_size(&self, kind: BufferKind, params: &BufferSizeParams) -> DecodeResult<usize>;

    /// Returns whether a `kind` buffer allocated for `allocated_width_in_sb` x
    /// `allocated_height_in_sb` superblocks is too small for `params`.
    fn realloc_needed(
        &self,
        kind: BufferKind,
        params: &BufferSizeParams,
        allocated_width_in_sb: u32,
        allocated_height_in_sb: u32,
    ) -> bool {
        let wider = params.width_in_sb > allocated_width_in_sb;
        let taller = params.height_in_sb > allocated_height_in_sb;

        match kind {
            BufferKind::DeblockingLine
            | BufferKind::DeblockingTileLine
            | BufferKind::MetadataLine
            | BufferKind::MetadataTileLine
            | BufferKind::HvdLine
            | BufferKind::HvdTile => wider,
            BufferKind::DeblockingTileColumn | BufferKind::MetadataTileColumn => taller,
            BufferKind::MvTemporal | BufferKind::SegmentId => wider || taller,
        }
    }
}

/// Row-store caches an engine provides in place of external line buffers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RowStoreSupport {
    pub hvd: bool,
    pub dat: bool,
    pub df: bool,
}

impl RowStoreSupport {
    pub fn any(&self) -> bool {
        self.hvd || self.dat || self.df
    }
}

/// What the decoder needs to know to set up its GPU contexts and command buffers.
pub trait ContextCreation {
    /// Maximum size of the picture level commands of one frame.
    fn state_command_size(&self, secure: bool) -> usize;

    /// Maximum size of the primitive level commands of one frame.
    fn primitive_command_size(&self, secure: bool) -> usize;

    fn rowstore_support(&self) -> RowStoreSupport;
}

/// Everything that depends on the GPU generation.
pub trait Platform: ResourceSizing + ContextCreation {}

impl<T: ResourceSizing + ContextCreation> Platform for T {}

/// Returns the capabilities of `generation`.
pub fn for_generation(generation: Generation) -> Box<dyn Platform> {
    match generation {
        Generation::Gen10 => Box::new(Gen10),
        Generation::Gen11 => Box::new(Gen11),
    }
}

/// Size in bytes of the commands a frame can record.
struct CommandSizes {
    vd_pipeline_flush: usize,
    mi_flush_dw: usize,
    pipe_mode_select: usize,
    surface_state: usize,
    pipe_buf_addr: usize,
    ind_obj_base_addr: usize,
    segment_state: usize,
    pic_state: usize,
    bsd_object: usize,
    load_register_reg: usize,
    batch_buffer_end: usize,
}

impl CommandSizes {
    fn state(&self) -> usize {
        self.vd_pipeline_flush
            + self.mi_flush_dw
            + self.pipe_mode_select
            + self.surface_state * 4
            + self.pipe_buf_addr
            + self.ind_obj_base_addr
            + self.segment_state * SEGMENT_STATE_COUNT
            + self.bsd_object
            + self.load_register_reg * 8
            + self.pic_state
    }

    /// Clear decode records everything at the picture level. Protected decode moves the
    /// segment and picture states into a second level batch.
    fn primitive(&self, secure: bool) -> usize {
        if secure {
            self.segment_state * SEGMENT_STATE_COUNT
                + self.pic_state
                + self.bsd_object
                + self.batch_buffer_end
        } else {
            0
        }
    }
}

/// Cachelines `kind` needs, given the deblocking row and column multipliers.
fn cachelines(
    kind: BufferKind,
    params: &BufferSizeParams,
    dblk_row: usize,
    dblk_col: usize,
) -> usize {
    let width = params.width_in_sb as usize;
    let height = params.height_in_sb as usize;

    match kind {
        BufferKind::DeblockingLine | BufferKind::DeblockingTileLine => width * dblk_row,
        BufferKind::DeblockingTileColumn => height * dblk_col,
        BufferKind::MetadataLine | BufferKind::MetadataTileLine => width * 5,
        BufferKind::MetadataTileColumn => height * 5,
        BufferKind::MvTemporal => width * height * 9,
        BufferKind::SegmentId => width * height,
        BufferKind::HvdLine | BufferKind::HvdTile => width,
    }
}

fn unsupported_format(chroma_format: ChromaFormat) -> DecodeError {
    DecodeError::InvalidParameter(format!("unsupported chroma format {:?}", chroma_format))
}

pub struct Gen10;

impl Gen10 {
    const COMMAND_SIZES: CommandSizes = CommandSizes {
        vd_pipeline_flush: 8,
        mi_flush_dw: 20,
        pipe_mode_select: 24,
        surface_state: 12,
        pipe_buf_addr: 380,
        ind_obj_base_addr: 116,
        segment_state: 32,
        pic_state: 148,
        bsd_object: 12,
        load_register_reg: 12,
        batch_buffer_end: 4,
    };
}

impl ResourceSizing for Gen10 {
    fn buffer_size(&self, kind: BufferKind, params: &BufferSizeParams) -> DecodeResult<usize> {
        if params.chroma_format != ChromaFormat::Yuv420 {
            return Err(unsupported_format(params.chroma_format));
        }

        let scale = if params.max_bit_depth > 8 { 2 } else { 1 };
        Ok(cachelines(kind, params, 18 * scale, 17 * scale) * CACHELINE_SIZE)
    }
}

impl ContextCreation for Gen10 {
    fn state_command_size(&self, _secure: bool) -> usize {
        Self::COMMAND_SIZES.state()
    }

    fn primitive_command_size(&self, secure: bool) -> usize {
        Self::COMMAND_SIZES.primitive(secure)
    }

    fn rowstore_support(&self) -> RowStoreSupport {
        RowStoreSupport {
            hvd: true,
            dat: false,
            df: true,
        }
    }
}

pub struct Gen11;

impl Gen11 {
    const COMMAND_SIZES: CommandSizes = CommandSizes {
        vd_pipeline_flush: 8,
        mi_flush_dw: 20,
        pipe_mode_select: 24,
        surface_state: 20,
        pipe_buf_addr: 436,
        ind_obj_base_addr: 116,
        segment_state: 32,
        pic_state: 168,
        bsd_object: 12,
        load_register_reg: 12,
        batch_buffer_end: 4,
    };
}

impl ResourceSizing for Gen11 {
    fn buffer_size(&self, kind: BufferKind, params: &BufferSizeParams) -> DecodeResult<usize> {
        let high_depth = params.max_bit_depth > 8;
        let (dblk_row, dblk_col) = match params.chroma_format {
            ChromaFormat::Yuv420 if high_depth => (36, 34),
            ChromaFormat::Yuv420 => (18, 17),
            ChromaFormat::Yuv444 if high_depth => (54, 50),
            ChromaFormat::Yuv444 => (27, 25),
            other => return Err(unsupported_format(other)),
        };

        Ok(cachelines(kind, params, dblk_row, dblk_col) * CACHELINE_SIZE)
    }
}

impl ContextCreation for Gen11 {
    fn state_command_size(&self, _secure: bool) -> usize {
        Self::COMMAND_SIZES.state()
    }

    fn primitive_command_size(&self, secure: bool) -> usize {
        Self::COMMAND_SIZES.primitive(secure)
    }

    fn rowstore_support(&self) -> RowStoreSupport {
        RowStoreSupport {
            hvd: true,
            dat: true,
            df: true,
        }
    }
}

/// State of one row-store cache.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RowStoreCache {
    pub enabled: bool,
    /// Offset of the cache in the engine's internal memory.
    pub address: u32,
}

/// Row-store caches of the VP9 pipeline. An enabled cache replaces the matching external line
/// buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RowStoreCaches {
    /// HVD line buffer.
    pub hvd: RowStoreCache,
    /// Metadata line buffer.
    pub dat: RowStoreCache,
    /// Deblocking filter line buffer.
    pub df: RowStoreCache,
}

/// Per configuration enable bits for the HVD, DAT and DF caches. The fourth column belongs to the
/// encoder.
const ROWSTORE_CACHE_ENABLE: [[bool; 4]; 13] = [
    [true, true, true, true],
    [false, false, true, true],
    [true, false, true, true],
    [true, true, false, true],
    [true, true, true, true],
    [false, false, true, true],
    [false, false, true, false],
    [true, true, false, true],
    [true, true, true, true],
    [true, true, false, true],
    [true, true, true, true],
    [true, true, false, true],
    [true, true, false, true],
];

const ROWSTORE_CACHE_ADDRESS: [[u32; 4]; 13] = [
    [0, 64, 384, 1536],
    [0, 0, 0, 2304],
    [0, 0, 64, 2368],
    [0, 128, 0, 768],
    [0, 64, 384, 1536],
    [0, 0, 0, 2304],
    [0, 0, 0, 0],
    [0, 128, 0, 768],
    [0, 64, 384, 2112],
    [0, 128, 0, 768],
    [0, 32, 192, 1920],
    [0, 128, 0, 768],
    [0, 128, 0, 768],
];

/// Computes which row-store caches can be used for pictures `width` pixels wide.
///
/// `width` is the frame width aligned to the minimum block size. Pictures wider than 8K never use
/// the caches.
pub fn rowstore_caching_offsets(
    support: RowStoreSupport,
    width: u32,
    bit_depth: BitDepth,
    chroma_format: ChromaFormat,
) -> DecodeResult<RowStoreCaches> {
    let format_index = match chroma_format {
        ChromaFormat::Yuv420 => 0,
        ChromaFormat::Yuv444 => 2,
        other => return Err(unsupported_format(other)),
    };

    let mut caches = RowStoreCaches::default();
    if width > 8192 {
        return Ok(caches);
    }

    let is_8bit = bit_depth == BitDepth::Depth8;
    let mut index = 4 * format_index + 2 * usize::from(!is_8bit) + usize::from(width > 4096);
    if chroma_format == ChromaFormat::Yuv444 && !is_8bit {
        index += usize::from(width > 2048);
    }

    let cache = |column: usize| RowStoreCache {
        enabled: ROWSTORE_CACHE_ENABLE[index][column],
        address: ROWSTORE_CACHE_ADDRESS[index][column],
    };

    if support.hvd {
        caches.hvd = cache(0);
    }
    if support.dat {
        caches.dat = cache(1);
    }
    if support.df {
        caches.df = cache(2);
    }

    Ok(caches)
}

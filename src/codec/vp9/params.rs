// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-frame parameter records.
//!
//! Bitstream parsing happens above this crate; these records carry what the parser found in the
//! uncompressed header, plus the few driver-level values (reference list slots, declared
//! bitstream size) the decode engine needs on top of it.

use enumn::N;

use crate::ChromaFormat;

pub const REFS_PER_FRAME: usize = 3;

pub const MAX_REF_LF_DELTAS: usize = 4;
pub const MAX_MODE_LF_DELTAS: usize = 2;

pub const INTRA_FRAME: usize = 0;
pub const LAST_FRAME: usize = 1;
pub const GOLDEN_FRAME: usize = 2;
pub const ALTREF_FRAME: usize = 3;
pub const MAX_REF_FRAMES: usize = 4;

pub const MAX_SEGMENTS: usize = 8;
pub const SEG_TREE_PROBS: usize = MAX_SEGMENTS - 1;
pub const PREDICTION_PROBS: usize = 3;

/// The number of pictures in the DPB
pub const NUM_REF_FRAMES: usize = 8;

/// The number of frame contexts a VP9 stream can select from.
pub const NUM_FRAME_CONTEXTS: usize = 4;

/// Size of the driver-side reference list that `curr_pic` and `ref_frame_list` index into.
pub const NUM_UNCOMPRESSED_SURFACES: usize = 128;

pub const SUPER_BLOCK_WIDTH: u32 = 64;
pub const SUPER_BLOCK_HEIGHT: u32 = 64;
pub const MIN_BLOCK_WIDTH: u32 = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
pub enum FrameType {
    KeyFrame = 0,
    InterFrame = 1,
}

impl Default for FrameType {
    fn default() -> Self {
        FrameType::KeyFrame
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
pub enum Profile {
    Profile0 = 0,
    Profile1 = 1,
    Profile2 = 2,
    Profile3 = 3,
}

impl Default for Profile {
    fn default() -> Self {
        Profile::Profile0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
pub enum BitDepth {
    Depth8 = 8,
    Depth10 = 10,
    Depth12 = 12,
}

impl Default for BitDepth {
    fn default() -> Self {
        BitDepth::Depth8
    }
}

impl BitDepth {
    /// The 0/1/2 depth indicator used to size the engine's scratch buffers.
    pub fn indicator(&self) -> u8 {
        match self {
            BitDepth::Depth8 => 0,
            BitDepth::Depth10 => 1,
            BitDepth::Depth12 => 2,
        }
    }

    pub fn bits(&self) -> u8 {
        *self as u8
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
pub enum InterpolationFilter {
    EightTap = 0,
    EightTapSmooth = 1,
    EightTapSharp = 2,
    Bilinear = 3,
    Switchable = 4,
}

impl Default for InterpolationFilter {
    fn default() -> Self {
        InterpolationFilter::EightTap
    }
}

/// Indicator carried by the slice record when a frame's bitstream is split across several
/// execute calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
pub enum BadSliceChopping {
    /// The whole frame is in this call.
    None = 0,
    /// More chunks of this frame will follow.
    Continued = 1,
    /// This is the last chunk of the frame.
    Last = 2,
}

impl Default for BadSliceChopping {
    fn default() -> Self {
        BadSliceChopping::None
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopFilterParams {
    /// Indicates the loop filter strength.
    pub level: u8,
    /// Indicates the sharpness level.
    pub sharpness: u8,
    /// If set, means that the filter level depends on the mode and reference
    /// frame used to predict a block.
    pub delta_enabled: bool,
    /// Contains the adjustment needed for the filter level based on the chosen
    /// reference frame.
    pub ref_deltas: [i8; MAX_REF_LF_DELTAS],
    /// Contains the adjustment needed for the filter level based on the chosen
    /// mode.
    pub mode_deltas: [i8; MAX_MODE_LF_DELTAS],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuantizationParams {
    /// Indicates the base frame qindex. This is used for Y AC coefficients and
    /// as the base value for the other quantizers.
    pub base_q_idx: u8,
    /// Indicates the Y DC quantizer relative to base_q_idx.
    pub delta_q_y_dc: i8,
    /// Indicates the UV DC quantizer relative to base_q_idx.
    pub delta_q_uv_dc: i8,
    /// Indicates the UV AC quantizer relative to base_q_idx.
    pub delta_q_uv_ac: i8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentationParams {
    ///  If set, indicates that this frame makes use of the segmentation tool.
    pub enabled: bool,
    /// If set, indicates that the segmentation map should be updated during
    /// the decoding of this frame. If unset, means that the segmentation map
    /// from the previous frame is used.
    pub update_map: bool,
    /// If set, indicates that the updates to the segmentation map are coded
    /// relative to the existing segmentation map.
    pub temporal_update: bool,
    /// Specify the probability values to be used when decoding segment_id.
    pub tree_probs: [u8; SEG_TREE_PROBS],
    /// Specify the probability values to be used when decoding seg_id_predicted.
    pub pred_probs: [u8; PREDICTION_PROBS],
}

/// Picture-level parameters for one VP9 frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureParams {
    pub profile: Profile,
    /// Reference list slot the decoded picture is recorded in.
    pub curr_pic: u8,
    /// The width of the frame in pixels.
    pub width: u32,
    /// The height of the frame in pixels.
    pub height: u32,
    pub bit_depth: BitDepth,
    pub subsampling_x: bool,
    pub subsampling_y: bool,
    /// Indicates whether a frame is a key frame.
    pub frame_type: FrameType,
    /// Whether this frame should be displayed.
    pub show_frame: bool,
    pub error_resilient_mode: bool,
    /// If set, indicates that this frame is an intra-only frame.
    pub intra_only: bool,
    /// Specifies whether the frame context should be reset to default values.
    pub reset_frame_context: u8,
    pub refresh_frame_context: bool,
    pub frame_parallel_decoding_mode: bool,
    /// Indicates the frame context to use.
    pub frame_context_idx: u8,
    /// Reference list slots of the eight reference frame buffers.
    pub ref_frame_list: [u8; NUM_REF_FRAMES],
    /// Which of the eight reference frame buffers are used as LAST, GOLDEN and ALTREF.
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    pub ref_frame_sign_bias: [u8; MAX_REF_FRAMES],
    pub allow_high_precision_mv: bool,
    pub interpolation_filter: InterpolationFilter,
    pub lf: LoopFilterParams,
    pub quant: QuantizationParams,
    pub seg: SegmentationParams,
    pub tile_cols_log2: u8,
    pub tile_rows_log2: u8,
    pub lossless: bool,
    /// Indicates the size of the uncompressed header in bytes.
    pub uncompressed_header_size_in_bytes: u32,
    /// Indicates the size of the compressed header in bytes.
    pub compressed_header_size_in_bytes: u32,
    /// Total size of the frame's bitstream, possibly spread over several execute calls.
    pub bs_bytes_in_buffer: u32,
    pub status_report_feedback_number: u32,
}

impl PictureParams {
    pub fn is_key_frame(&self) -> bool {
        self.frame_type == FrameType::KeyFrame
    }

    /// Key frames and intra-only frames are decoded without references.
    pub fn is_intra(&self) -> bool {
        self.is_key_frame() || self.intra_only
    }

    pub fn chroma_format(&self) -> Option<ChromaFormat> {
        ChromaFormat::from_subsampling(self.subsampling_x, self.subsampling_y)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentFlags {
    pub reference_enabled: bool,
    /// Reference frame forced for the segment, one of `INTRA_FRAME`..`ALTREF_FRAME`.
    pub reference: u8,
    pub skipped: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentData {
    pub flags: SegmentFlags,
    /// Filter level per reference frame and mode.
    pub filter_level: [[u8; MAX_MODE_LF_DELTAS]; MAX_REF_LF_DELTAS],
    pub luma_ac_quant_scale: i16,
    pub luma_dc_quant_scale: i16,
    pub chroma_ac_quant_scale: i16,
    pub chroma_dc_quant_scale: i16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentParams {
    pub seg_data: [SegmentData; MAX_SEGMENTS],
}

impl SegmentParams {
    /// Zeroes the filter levels of every segment.
    pub fn clear_filter_levels(&mut self) {
        for seg in self.seg_data.iter_mut() {
            seg.filter_level = Default::default();
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceParams {
    pub bad_slice_chopping: BadSliceChopping,
    pub slice_data_size: u32,
    pub slice_data_offset: u32,
}

/// What the decode engine needs to remember about the previous frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PrevFrameParams {
    pub key_frame: bool,
    pub intra_only: bool,
    pub display: bool,
}

impl PrevFrameParams {
    const KEY_FRAME: u32 = 1 << 0;
    const INTRA_ONLY: u32 = 1 << 1;
    const DISPLAY: u32 = 1 << 2;

    pub fn from_picture(pic: &PictureParams) -> Self {
        Self {
            key_frame: pic.is_key_frame(),
            intra_only: pic.intra_only,
            display: pic.show_frame,
        }
    }

    /// Whether the previous frame left motion vectors usable for temporal prediction.
    pub fn has_motion_vectors(&self) -> bool {
        !self.key_frame && !self.intra_only
    }

    pub fn pack(&self) -> u32 {
        let mut value = 0;
        if self.key_frame {
            value |= Self::KEY_FRAME;
        }
        if self.intra_only {
            value |= Self::INTRA_ONLY;
        }
        if self.display {
            value |= Self::DISPLAY;
        }
        value
    }

    /// Reserved bits are ignored.
    pub fn unpack(value: u32) -> Self {
        Self {
            key_frame: value & Self::KEY_FRAME != 0,
            intra_only: value & Self::INTRA_ONLY != 0,
            display: value & Self::DISPLAY != 0,
        }
    }
}

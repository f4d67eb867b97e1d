// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod vp9;

use thiserror::Error;

use crate::backend::HwError;
use crate::codec::vp9::context_buffer::ContextBufferError;
use crate::codec::vp9::params::BitDepth;
use crate::ChromaFormat;

/// Error returned by the decoder.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("missing required input: {0}")]
    MissingInput(&'static str),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("failed to allocate {name}")]
    AllocationFailed { name: String },
    #[error("not enough space in the command buffer")]
    NoSpace,
    #[error(transparent)]
    ContextBuffer(#[from] ContextBufferError),
    #[error(transparent)]
    Hw(HwError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<HwError> for DecodeError {
    fn from(err: HwError) -> Self {
        match err {
            HwError::AllocationFailed { name } => DecodeError::AllocationFailed { name },
            HwError::LockFailed { name } => DecodeError::ResourceUnavailable(name),
            HwError::NoSpace => DecodeError::NoSpace,
            err => DecodeError::Hw(err),
        }
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// GPU generations with distinct scratch buffer requirements.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Generation {
    Gen10,
    Gen11,
}

impl Default for Generation {
    fn default() -> Self {
        Generation::Gen11
    }
}

/// Stream-level settings given to the decoder when it is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Initial maximum width of the stream.
    pub width: u32,
    /// Initial maximum height of the stream.
    pub height: u32,
    /// Maximum bit depth of the stream.
    pub bit_depth: BitDepth,
    pub chroma_format: ChromaFormat,
    pub generation: Generation,
    /// Protected content: decoder-owned buffers are not CPU-visible and are only updated through
    /// firmware copies.
    pub secure: bool,
    /// Whether the hardware row-store cache may replace external line buffers.
    pub rowstore_caching: bool,
    /// Emit status report commands and queue a report for every frame.
    pub status_reporting: bool,
    /// Include a CRC of the decoded picture in status reports.
    pub report_crc: bool,
    /// Allocate a dedicated surface to stand in for missing references, instead of using the
    /// output surface.
    pub dummy_reference: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            bit_depth: BitDepth::Depth8,
            chroma_format: ChromaFormat::Yuv420,
            generation: Default::default(),
            secure: false,
            rowstore_caching: true,
            status_reporting: true,
            report_crc: false,
            dummy_reference: false,
        }
    }
}

/// Phase of the command emission for the current frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodePhase {
    /// Frame states are set, no command has been emitted yet.
    Initialized,
    /// Single pipe decode with long format commands.
    LegacyLong,
    /// Short format commands, converted to long format by firmware.
    LegacyS2L,
}

/// Outcome of a submitted frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecStatus {
    Complete,
    Incomplete,
    Error,
    /// The status has not been queried yet.
    Unavailable,
}

/// Status of one submitted frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeStatusReport {
    pub feedback_number: u32,
    /// Reference list slot of the decoded picture.
    pub curr_pic: u8,
    pub status: CodecStatus,
    /// Number of 8x8 blocks covered by the picture.
    pub num_mbs_affected: u32,
    pub crc: Option<u32>,
}

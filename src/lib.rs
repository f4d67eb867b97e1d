// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VP9 decode state management for fixed-function HCP video engines.
//!
//! This crate sits between a client that has already parsed a VP9 stream into picture, segment
//! and slice parameter records and a GPU command-submission layer. For every frame it decides
//! which probability contexts and segmentation buffers must be reset, copied, saved or restored,
//! applies those decisions either directly or through queued firmware copies, keeps the
//! scratch buffers large enough for the stream, and records the picture and primitive level
//! commands for the decode engine.
//!
//! The command-submission layer is abstracted by the [`backend::HwInterface`] trait. A
//! [`backend::dummy::Backend`] keeps everything in host memory so the whole pipeline can be
//! exercised without hardware.

pub mod backend;
pub mod codec;
pub mod decoder;
pub mod utils;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Chroma sampling layout of the decoded surfaces.
///
/// The discriminants match the chroma format codes the decode engine expects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, enumn::N)]
pub enum ChromaFormat {
    Yuv400 = 0,
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

impl Default for ChromaFormat {
    fn default() -> Self {
        ChromaFormat::Yuv420
    }
}

impl ChromaFormat {
    /// Returns the chroma format described by a pair of VP9 subsampling flags, if the engine can
    /// decode it.
    pub fn from_subsampling(subsampling_x: bool, subsampling_y: bool) -> Option<Self> {
        match (subsampling_x, subsampling_y) {
            (true, true) => Some(ChromaFormat::Yuv420),
            (false, false) => Some(ChromaFormat::Yuv444),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chroma_format_from_subsampling() {
        assert_eq!(
            ChromaFormat::from_subsampling(true, true),
            Some(ChromaFormat::Yuv420)
        );
        assert_eq!(
            ChromaFormat::from_subsampling(false, false),
            Some(ChromaFormat::Yuv444)
        );
        assert_eq!(ChromaFormat::from_subsampling(true, false), None);
        assert_eq!(ChromaFormat::from_subsampling(false, true), None);
    }
}

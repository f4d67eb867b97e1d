// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Application of a [`BufferUpdate`] to the probability and segment id buffers.
//!
//! [`DirectWriter`] maps the buffers and writes them from the CPU. [`QueuedFirmwareWriter`] is
//! used when the buffers cannot be mapped: it builds the default tables in the staging
//! probability buffer and queues firmware copies into the frame's command buffer, which run
//! before the decode commands that read the result.
//!
//! Both writers leave the probability buffers with identical content.

use std::io::Write;

use anyhow::Context;
use byteorder::LittleEndian;
use byteorder::WriteBytesExt;
use log::debug;
use log::log_enabled;
use log::Level;

use crate::backend::CommandBuffer;
use crate::backend::GpuResource;
use crate::backend::HwCommand;
use crate::backend::HwInterface;
use crate::backend::LockMode;
use crate::codec::vp9::context_buffer;
use crate::codec::vp9::context_buffer::INTER_PROB_OFFSET;
use crate::codec::vp9::context_buffer::INTER_PROB_SIZE;
use crate::codec::vp9::context_buffer::PROB_MAX_NUM_ELEM;
use crate::codec::vp9::context_buffer::SEG_PROB_OFFSET;
use crate::codec::vp9::context_buffer::SEG_PROB_SIZE;
use crate::codec::vp9::params::NUM_FRAME_CONTEXTS;
use crate::decoder::vp9::update::BufferUpdate;
use crate::decoder::vp9::update::ProbUpdateFlags;
use crate::decoder::DecodeResult;

/// Index of the probability buffer used to stage firmware copies.
pub const STAGING_PROB_BUFFER: usize = NUM_FRAME_CONTEXTS;
/// Number of probability buffers: one per frame context plus the staging one.
pub const NUM_PROB_BUFFERS: usize = NUM_FRAME_CONTEXTS + 1;

/// Size of the parameter block handed to the firmware.
pub const DMEM_BUFFER_SIZE: usize = 64;

/// The segment id buffer and its all-zero twin.
#[derive(Clone, Copy, Debug)]
pub struct SegmentIdBuffers {
    pub buffer: GpuResource,
    pub reset: GpuResource,
    /// Bytes in use for the currently allocated dimensions.
    pub size: usize,
}

/// Applies buffer updates decided for a frame.
pub trait BufferWriter<B: HwInterface> {
    /// Brings the probability buffer selected by `update` up to date.
    fn update_probabilities(
        &mut self,
        hw: &mut B,
        cmd_buffer: &mut CommandBuffer,
        prob_buffers: &[GpuResource; NUM_PROB_BUFFERS],
        update: &BufferUpdate,
    ) -> DecodeResult<()>;

    /// Clears the segment id map.
    fn reset_segment_ids(
        &mut self,
        hw: &mut B,
        cmd_buffer: &mut CommandBuffer,
        seg_ids: &SegmentIdBuffers,
    ) -> DecodeResult<()>;
}

/// Parameter block layout: flags word, frame context index, segmentation tree and prediction
/// probabilities.
fn serialize_dmem(mut out: &mut [u8], update: &BufferUpdate) -> std::io::Result<()> {
    let mut flags = update.flags.pack();
    if update.full_prob_buffer_update {
        flags |= 1 << 31;
    }

    out.write_u32::<LittleEndian>(flags)?;
    out.write_u32::<LittleEndian>(u32::from(update.frame_ctx_idx))?;
    out.write_all(&update.flags.seg_tree_probs)?;
    out.write_all(&update.flags.seg_pred_probs)?;

    Ok(())
}

/// Writes the buffers through CPU mappings.
pub struct DirectWriter {
    inter_probs_saved: [u8; INTER_PROB_SIZE],
}

impl Default for DirectWriter {
    fn default() -> Self {
        Self {
            inter_probs_saved: [0; INTER_PROB_SIZE],
        }
    }
}

impl DirectWriter {
    pub fn new() -> Self {
        Default::default()
    }

    fn partial_update(&mut self, data: &mut [u8], flags: &ProbUpdateFlags) -> DecodeResult<()> {
        if flags.seg_prob_copy {
            context_buffer::write_segmentation_probs(
                data,
                &flags.seg_tree_probs,
                &flags.seg_pred_probs,
            )?;
        }

        let inter_probs = INTER_PROB_OFFSET..INTER_PROB_OFFSET + INTER_PROB_SIZE;

        if flags.save {
            self.inter_probs_saved
                .copy_from_slice(&data[inter_probs.clone()]);
        }

        if flags.reset {
            if flags.reset_full {
                context_buffer::context_buffer_init(data, flags.reset_key_default)?;
            } else {
                context_buffer::ctx_buf_diff_init(data, flags.reset_key_default)?;
            }
        }

        if flags.restore {
            data[inter_probs].copy_from_slice(&self.inter_probs_saved);
        }

        Ok(())
    }
}

/// Resets `data` to defaults and then overwrites the segmentation probabilities.
fn full_update(data: &mut [u8], flags: &ProbUpdateFlags) -> DecodeResult<()> {
    context_buffer::context_buffer_init(data, flags.reset_key_default)?;
    context_buffer::write_segmentation_probs(data, &flags.seg_tree_probs, &flags.seg_pred_probs)?;
    Ok(())
}

impl<B: HwInterface> BufferWriter<B> for DirectWriter {
    fn update_probabilities(
        &mut self,
        hw: &mut B,
        _cmd_buffer: &mut CommandBuffer,
        prob_buffers: &[GpuResource; NUM_PROB_BUFFERS],
        update: &BufferUpdate,
    ) -> DecodeResult<()> {
        let target = &prob_buffers[usize::from(update.frame_ctx_idx)];
        let mut mapping = hw.lock(target, LockMode::WriteOnly)?;
        let data = mapping.as_mut_slice();

        if update.full_prob_buffer_update {
            full_update(data, &update.flags)?;
        } else {
            self.partial_update(data, &update.flags)?;
        }

        if log_enabled!(Level::Debug) {
            let len = data.len().min(PROB_MAX_NUM_ELEM);
            debug!(
                "Probability buffer {} crc {:08x}",
                update.frame_ctx_idx,
                crc32fast::hash(&data[..len])
            );
        }

        Ok(())
    }

    fn reset_segment_ids(
        &mut self,
        hw: &mut B,
        _cmd_buffer: &mut CommandBuffer,
        seg_ids: &SegmentIdBuffers,
    ) -> DecodeResult<()> {
        let mut mapping = hw.lock(&seg_ids.buffer, LockMode::WriteOnly)?;
        let data = mapping.as_mut_slice();
        let len = seg_ids.size.min(data.len());
        data[..len].fill(0);

        Ok(())
    }
}

/// Updates the buffers with firmware copies queued into the frame's command buffer.
///
/// Only the staging probability buffer and the parameter block are written from the CPU.
pub struct QueuedFirmwareWriter {
    dmem: GpuResource,
    inter_probs_save: GpuResource,
}

impl QueuedFirmwareWriter {
    pub fn new(dmem: GpuResource, inter_probs_save: GpuResource) -> Self {
        Self {
            dmem,
            inter_probs_save,
        }
    }

    /// Serializes the update parameters into the firmware parameter block.
    fn write_dmem<B: HwInterface>(&self, hw: &mut B, update: &BufferUpdate) -> DecodeResult<()> {
        let mut mapping = hw.lock(&self.dmem, LockMode::WriteOnly)?;
        serialize_dmem(mapping.as_mut_slice(), update)
            .context("firmware parameter block too small")?;

        Ok(())
    }

    /// Fills the staging buffer with the defaults selected by `flags` and the segmentation
    /// probabilities. Every copy queued for the frame reads from this single image.
    fn stage<B: HwInterface>(
        &self,
        hw: &mut B,
        staging: &GpuResource,
        flags: &ProbUpdateFlags,
    ) -> DecodeResult<()> {
        let mut mapping = hw.lock(staging, LockMode::WriteOnly)?;
        full_update(mapping.as_mut_slice(), flags)?;

        Ok(())
    }
}

impl<B: HwInterface> BufferWriter<B> for QueuedFirmwareWriter {
    fn update_probabilities(
        &mut self,
        hw: &mut B,
        cmd_buffer: &mut CommandBuffer,
        prob_buffers: &[GpuResource; NUM_PROB_BUFFERS],
        update: &BufferUpdate,
    ) -> DecodeResult<()> {
        let staging = &prob_buffers[STAGING_PROB_BUFFER];
        let target = &prob_buffers[usize::from(update.frame_ctx_idx)];
        let flags = &update.flags;

        self.write_dmem(hw, update)?;
        self.stage(hw, staging, flags)?;

        if update.full_prob_buffer_update {
            hw.firmware_copy(cmd_buffer, staging, target, PROB_MAX_NUM_ELEM, 0, 0)?;
        } else {
            if flags.seg_prob_copy {
                hw.firmware_copy(
                    cmd_buffer,
                    staging,
                    target,
                    SEG_PROB_SIZE,
                    SEG_PROB_OFFSET,
                    SEG_PROB_OFFSET,
                )?;
            }

            if flags.save {
                hw.firmware_copy(
                    cmd_buffer,
                    target,
                    &self.inter_probs_save,
                    INTER_PROB_SIZE,
                    INTER_PROB_OFFSET,
                    0,
                )?;
            }

            if flags.reset {
                if flags.reset_full {
                    // The segmentation probabilities of the target are kept.
                    let seg_end = SEG_PROB_OFFSET + SEG_PROB_SIZE;
                    hw.firmware_copy(cmd_buffer, staging, target, SEG_PROB_OFFSET, 0, 0)?;
                    hw.firmware_copy(
                        cmd_buffer,
                        staging,
                        target,
                        PROB_MAX_NUM_ELEM - seg_end,
                        seg_end,
                        seg_end,
                    )?;
                } else {
                    hw.firmware_copy(
                        cmd_buffer,
                        staging,
                        target,
                        INTER_PROB_SIZE,
                        INTER_PROB_OFFSET,
                        INTER_PROB_OFFSET,
                    )?;
                }
            }

            if flags.restore {
                hw.firmware_copy(
                    cmd_buffer,
                    &self.inter_probs_save,
                    target,
                    INTER_PROB_SIZE,
                    0,
                    INTER_PROB_OFFSET,
                )?;
            }
        }

        cmd_buffer.push(HwCommand::MiFlushDw);

        Ok(())
    }

    fn reset_segment_ids(
        &mut self,
        hw: &mut B,
        cmd_buffer: &mut CommandBuffer,
        seg_ids: &SegmentIdBuffers,
    ) -> DecodeResult<()> {
        hw.firmware_copy(
            cmd_buffer,
            &seg_ids.reset,
            &seg_ids.buffer,
            seg_ids.size,
            0,
            0,
        )?;
        cmd_buffer.push(HwCommand::MiFlushDw);

        Ok(())
    }
}

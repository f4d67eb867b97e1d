// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame context management.
//!
//! VP9 lets a frame reset one or all of the four frame contexts, but resetting a context the
//! current frame does not decode with is wasted work if it gets reset again before use. The
//! decoder therefore records such resets, and segmentation probability updates, as pending on
//! the context they target, and pays for them when a later frame first selects that context.
//!
//! [`determine_internal_buffer_update`] is a pure function of the frame header and the pending
//! state. The resulting [`ProbUpdateFlags`] are then applied to the probability buffer by a
//! [`super::writer::BufferWriter`].

use log::debug;

use crate::codec::vp9::params::PictureParams;
use crate::codec::vp9::params::NUM_FRAME_CONTEXTS;
use crate::codec::vp9::params::PREDICTION_PROBS;
use crate::codec::vp9::params::SEG_TREE_PROBS;
use crate::codec::vp9::probs::MAX_PROB;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;

/// Header fields the update decision depends on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameUpdateInputs {
    pub key_frame: bool,
    pub intra_only: bool,
    pub error_resilient_mode: bool,
    pub reset_frame_context: u8,
    pub frame_context_idx: u8,
    pub segmentation_enabled: bool,
    pub segmentation_update_map: bool,
    pub seg_tree_probs: [u8; SEG_TREE_PROBS],
    pub seg_pred_probs: [u8; PREDICTION_PROBS],
    /// Whether the frame size differs from the previous frame's.
    pub scaling: bool,
}

impl FrameUpdateInputs {
    /// Collects the inputs for `pic`, decoded into a `width`x`height` surface after a
    /// `prev_width`x`prev_height` frame.
    pub fn new(
        pic: &PictureParams,
        (width, height): (u32, u32),
        (prev_width, prev_height): (u32, u32),
    ) -> Self {
        Self {
            key_frame: pic.is_key_frame(),
            intra_only: pic.intra_only,
            error_resilient_mode: pic.error_resilient_mode,
            reset_frame_context: pic.reset_frame_context,
            frame_context_idx: pic.frame_context_idx,
            segmentation_enabled: pic.seg.enabled,
            segmentation_update_map: pic.seg.update_map,
            seg_tree_probs: pic.seg.tree_probs,
            seg_pred_probs: pic.seg.pred_probs,
            scaling: width != prev_width || height != prev_height,
        }
    }
}

/// Work deferred to the next frame that selects a given frame context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingUpdateState {
    /// The context must be fully reset before it is used again.
    pub reset_full_tables: [bool; NUM_FRAME_CONTEXTS],
    /// The context must pick up the saved segmentation probabilities before it is used again
    /// with segmentation enabled.
    pub copy_seg_probs: [bool; NUM_FRAME_CONTEXTS],
    /// Context 0 must get its inter probabilities reset before being used by an inter frame.
    pub reset_partial: bool,
    /// The inter probabilities of context 0 are held in the save buffer.
    pub save_inter_probs: bool,
    /// Segmentation probabilities of the last frame that updated the segmentation map.
    pub seg_tree_probs: [u8; SEG_TREE_PROBS],
    pub seg_pred_probs: [u8; PREDICTION_PROBS],
}

impl Default for PendingUpdateState {
    fn default() -> Self {
        Self {
            reset_full_tables: [false; NUM_FRAME_CONTEXTS],
            copy_seg_probs: [false; NUM_FRAME_CONTEXTS],
            reset_partial: false,
            save_inter_probs: false,
            seg_tree_probs: [MAX_PROB; SEG_TREE_PROBS],
            seg_pred_probs: [MAX_PROB; PREDICTION_PROBS],
        }
    }
}

/// Changes to apply to the selected probability buffer before decoding the frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbUpdateFlags {
    /// Overwrite the segmentation probabilities with `seg_tree_probs` and `seg_pred_probs`.
    pub seg_prob_copy: bool,
    pub seg_tree_probs: [u8; SEG_TREE_PROBS],
    pub seg_pred_probs: [u8; PREDICTION_PROBS],
    /// Reset probabilities to their defaults, fully if `reset_full` is set and only the inter
    /// probability region otherwise.
    pub reset: bool,
    pub reset_full: bool,
    /// Reset to key frame defaults rather than inter frame defaults.
    pub reset_key_default: bool,
    /// Save the inter probabilities before resetting them.
    pub save: bool,
    /// Restore previously saved inter probabilities.
    pub restore: bool,
}

impl ProbUpdateFlags {
    const SEG_PROB_COPY: u32 = 1 << 0;
    const RESET: u32 = 1 << 1;
    const RESET_FULL: u32 = 1 << 2;
    const RESET_KEY_DEFAULT: u32 = 1 << 3;
    const SAVE: u32 = 1 << 4;
    const RESTORE: u32 = 1 << 5;

    /// Packs the boolean flags into the word handed to the firmware.
    pub fn pack(&self) -> u32 {
        [
            (self.seg_prob_copy, Self::SEG_PROB_COPY),
            (self.reset, Self::RESET),
            (self.reset_full, Self::RESET_FULL),
            (self.reset_key_default, Self::RESET_KEY_DEFAULT),
            (self.save, Self::SAVE),
            (self.restore, Self::RESTORE),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit)
    }
}

/// Decision taken for one frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferUpdate {
    /// Probability buffer the frame is decoded with.
    pub frame_ctx_idx: u8,
    pub flags: ProbUpdateFlags,
    /// Rewrite the whole probability buffer in one pass instead of applying the flags one by
    /// one.
    pub full_prob_buffer_update: bool,
    /// The segment id map of the previous frame cannot be used.
    pub reset_seg_id_buffer: bool,
}

/// Decides how the probability and segment id buffers must be updated for the frame described
/// by `inputs`, and records the work it defers in `state`.
///
/// A frame context index outside `0..NUM_FRAME_CONTEXTS` is rejected and leaves `state`
/// untouched.
pub fn determine_internal_buffer_update(
    inputs: &FrameUpdateInputs,
    state: &mut PendingUpdateState,
) -> DecodeResult<BufferUpdate> {
    let cur_frame_ctx_idx = usize::from(inputs.frame_context_idx);
    if cur_frame_ctx_idx >= NUM_FRAME_CONTEXTS {
        return Err(DecodeError::InvalidParameter(format!(
            "frame context index {} out of range",
            cur_frame_ctx_idx
        )));
    }

    let key_frame = inputs.key_frame;
    let intra_only = inputs.intra_only;
    let reset_all = key_frame
        || inputs.error_resilient_mode
        || (inputs.reset_frame_context == 3 && intra_only);
    let reset_specified = inputs.reset_frame_context == 2 && intra_only;

    let mut copy_seg_probs = false;
    let mut reset_full_tbl = false;
    let mut reset_partial_tbl = false;
    let mut restore_inter_probs = false;
    let mut save_inter_probs_tmp = false;

    let reset_seg_id_buffer =
        key_frame || inputs.scaling || inputs.error_resilient_mode || intra_only;

    let frame_ctx_idx = if key_frame || intra_only || inputs.error_resilient_mode {
        0
    } else {
        cur_frame_ctx_idx
    };

    if inputs.segmentation_enabled && inputs.segmentation_update_map {
        copy_seg_probs = true;
        state.copy_seg_probs = [true; NUM_FRAME_CONTEXTS];
        state.copy_seg_probs[frame_ctx_idx] = false;
        state.seg_tree_probs = inputs.seg_tree_probs;
        state.seg_pred_probs = inputs.seg_pred_probs;
    } else if inputs.segmentation_enabled && state.copy_seg_probs[frame_ctx_idx] {
        copy_seg_probs = true;
        state.copy_seg_probs[frame_ctx_idx] = false;
    }

    // Only the first matching branch applies.
    if reset_all {
        // Context 0 is decoded with, the others are reset when first used.
        reset_full_tbl = true;
        state.reset_partial = key_frame || intra_only;
        for pending in state.reset_full_tables.iter_mut().skip(1) {
            *pending = true;
        }
        state.save_inter_probs = false;
    } else if reset_specified {
        if cur_frame_ctx_idx == 0 {
            reset_full_tbl = true;
            state.reset_partial = true;
            state.save_inter_probs = false;
        } else {
            state.reset_full_tables[cur_frame_ctx_idx] = true;
            if !state.reset_partial {
                if !state.save_inter_probs {
                    save_inter_probs_tmp = true;
                    state.save_inter_probs = true;
                }
                reset_partial_tbl = true;
            }
        }
    } else if intra_only {
        if !state.reset_partial {
            if !state.save_inter_probs {
                save_inter_probs_tmp = true;
                state.save_inter_probs = true;
            }
            reset_partial_tbl = true;
        }
    } else if state.reset_full_tables[cur_frame_ctx_idx] {
        reset_full_tbl = true;
        state.reset_full_tables[cur_frame_ctx_idx] = false;
    } else if cur_frame_ctx_idx == 0 && state.reset_partial {
        reset_partial_tbl = true;
        state.reset_partial = false;
    } else if cur_frame_ctx_idx == 0 && state.save_inter_probs {
        restore_inter_probs = true;
        state.save_inter_probs = false;
    }

    let mut flags = ProbUpdateFlags {
        seg_prob_copy: copy_seg_probs,
        reset: reset_full_tbl || reset_partial_tbl,
        reset_full: reset_full_tbl,
        reset_key_default: key_frame || intra_only,
        save: save_inter_probs_tmp,
        restore: restore_inter_probs,
        ..Default::default()
    };
    if copy_seg_probs {
        flags.seg_tree_probs = state.seg_tree_probs;
        flags.seg_pred_probs = state.seg_pred_probs;
    }

    let update = BufferUpdate {
        frame_ctx_idx: frame_ctx_idx as u8,
        full_prob_buffer_update: reset_full_tbl && copy_seg_probs,
        reset_seg_id_buffer,
        flags,
    };

    debug!(
        "Frame context {}: {:?}, full update: {}, reset segment ids: {}",
        update.frame_ctx_idx,
        update.flags,
        update.full_prob_buffer_update,
        update.reset_seg_id_buffer
    );

    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG_TREE: [u8; SEG_TREE_PROBS] = [10, 20, 30, 40, 50, 60, 70];
    const SEG_PRED: [u8; PREDICTION_PROBS] = [80, 90, 100];

    fn key_frame() -> FrameUpdateInputs {
        FrameUpdateInputs {
            key_frame: true,
            ..Default::default()
        }
    }

    fn inter_frame(frame_context_idx: u8) -> FrameUpdateInputs {
        FrameUpdateInputs {
            frame_context_idx,
            ..Default::default()
        }
    }

    fn intra_only(reset_frame_context: u8, frame_context_idx: u8) -> FrameUpdateInputs {
        FrameUpdateInputs {
            intra_only: true,
            reset_frame_context,
            frame_context_idx,
            ..Default::default()
        }
    }

    /// Reset-related flags only, for compact assertions: (reset, reset_full, save, restore).
    fn reset_flags(update: &BufferUpdate) -> (bool, bool, bool, bool) {
        let flags = &update.flags;
        (flags.reset, flags.reset_full, flags.save, flags.restore)
    }

    #[test]
    fn key_frame_resets_everything() {
        let mut state = PendingUpdateState::default();

        let update = determine_internal_buffer_update(&key_frame(), &mut state).unwrap();

        assert_eq!(update.frame_ctx_idx, 0);
        assert!(update.flags.reset_full);
        assert!(update.flags.reset_key_default);
        assert!(!update.flags.seg_prob_copy);
        assert!(!update.flags.save);
        assert!(!update.flags.restore);
        assert!(!update.full_prob_buffer_update);
        assert!(update.reset_seg_id_buffer);
        assert_eq!(state.reset_full_tables, [false, true, true, true]);
        assert!(state.reset_partial);
    }

    #[test]
    fn segment_id_reset_truth_table() {
        for bits in 0..16u8 {
            let key_frame = bits & 1 != 0;
            let scaling = bits & 2 != 0;
            let error_resilient_mode = bits & 4 != 0;
            let intra_only = bits & 8 != 0;
            let inputs = FrameUpdateInputs {
                key_frame,
                scaling,
                error_resilient_mode,
                intra_only,
                ..Default::default()
            };

            let update =
                determine_internal_buffer_update(&inputs, &mut Default::default()).unwrap();
            assert_eq!(update.reset_seg_id_buffer, bits != 0, "case {:04b}", bits);
        }
    }

    #[test]
    fn frame_context_forced_to_zero() {
        let mut state = PendingUpdateState::default();

        let mut inputs = inter_frame(2);
        assert_eq!(
            determine_internal_buffer_update(&inputs, &mut state).unwrap().frame_ctx_idx,
            2
        );

        inputs.error_resilient_mode = true;
        assert_eq!(
            determine_internal_buffer_update(&inputs, &mut state).unwrap().frame_ctx_idx,
            0
        );

        let inputs = intra_only(0, 3);
        assert_eq!(
            determine_internal_buffer_update(&inputs, &mut state).unwrap().frame_ctx_idx,
            0
        );
    }

    #[test]
    fn frame_context_out_of_range() {
        let mut state = PendingUpdateState::default();
        determine_internal_buffer_update(&key_frame(), &mut state).unwrap();
        let before = state.clone();

        // The index is rejected even when the frame would be forced onto context 0.
        for inputs in [inter_frame(4), intra_only(0, 4), inter_frame(255)] {
            assert!(matches!(
                determine_internal_buffer_update(&inputs, &mut state),
                Err(DecodeError::InvalidParameter(_))
            ));
        }
        assert_eq!(state, before);
    }

    #[test]
    fn pending_seg_prob_copies() {
        let mut state = PendingUpdateState::default();
        determine_internal_buffer_update(&key_frame(), &mut state).unwrap();

        let mut inputs = inter_frame(1);
        inputs.segmentation_enabled = true;
        inputs.segmentation_update_map = true;
        inputs.seg_tree_probs = SEG_TREE;
        inputs.seg_pred_probs = SEG_PRED;
        let update = determine_internal_buffer_update(&inputs, &mut state).unwrap();
        assert!(update.flags.seg_prob_copy);
        assert_eq!(update.flags.seg_tree_probs, SEG_TREE);
        assert_eq!(state.copy_seg_probs, [true, false, true, true]);

        // A context selected without segmentation keeps its pending copy.
        let update = determine_internal_buffer_update(&inter_frame(3), &mut state).unwrap();
        assert!(!update.flags.seg_prob_copy);
        assert!(state.copy_seg_probs[3]);

        for ctx in [0u8, 2, 3] {
            let mut inputs = inter_frame(ctx);
            inputs.segmentation_enabled = true;
            // Probabilities of a frame that does not update the map are ignored.
            inputs.seg_tree_probs = [1; SEG_TREE_PROBS];

            let update = determine_internal_buffer_update(&inputs, &mut state).unwrap();
            assert!(update.flags.seg_prob_copy, "context {}", ctx);
            assert_eq!(update.flags.seg_tree_probs, SEG_TREE);
            assert_eq!(update.flags.seg_pred_probs, SEG_PRED);
            assert!(!state.copy_seg_probs[usize::from(ctx)]);

            // Consumed: the next use does not copy again.
            let update = determine_internal_buffer_update(&inputs, &mut state).unwrap();
            assert!(!update.flags.seg_prob_copy);
        }

        assert_eq!(state.copy_seg_probs, [false; NUM_FRAME_CONTEXTS]);
    }

    #[test]
    fn full_update_when_full_reset_and_seg_copy() {
        let mut state = PendingUpdateState::default();

        let mut inputs = key_frame();
        inputs.segmentation_enabled = true;
        inputs.segmentation_update_map = true;
        let update = determine_internal_buffer_update(&inputs, &mut state).unwrap();
        assert!(update.full_prob_buffer_update);

        // Full reset without segmentation copy is a partial update.
        let update = determine_internal_buffer_update(&key_frame(), &mut state).unwrap();
        assert!(update.flags.reset_full);
        assert!(!update.full_prob_buffer_update);
    }

    #[test]
    fn reset_priority_chain() {
        let mut state = PendingUpdateState::default();

        // resetAll wins over the intra-only branch.
        let update = determine_internal_buffer_update(&intra_only(3, 2), &mut state).unwrap();
        assert_eq!(reset_flags(&update), (true, true, false, false));
        assert!(update.flags.reset_key_default);
        assert!(state.reset_partial);
        assert_eq!(state.reset_full_tables, [false, true, true, true]);

        // resetSpecified on context 0: immediate full reset.
        state.save_inter_probs = true;
        let update = determine_internal_buffer_update(&intra_only(2, 0), &mut state).unwrap();
        assert_eq!(reset_flags(&update), (true, true, false, false));
        assert!(state.reset_partial);
        assert!(!state.save_inter_probs);

        // resetSpecified on another context with a partial reset pending: only deferred.
        state.reset_full_tables = [false; NUM_FRAME_CONTEXTS];
        let update = determine_internal_buffer_update(&intra_only(2, 1), &mut state).unwrap();
        assert_eq!(reset_flags(&update), (false, false, false, false));
        assert_eq!(state.reset_full_tables, [false, true, false, false]);

        // Deferred full reset fires on first use, even with context 0 work pending.
        state.save_inter_probs = true;
        let update = determine_internal_buffer_update(&inter_frame(1), &mut state).unwrap();
        assert_eq!(reset_flags(&update), (true, true, false, false));
        assert!(!update.flags.reset_key_default);
        assert_eq!(state.reset_full_tables, [false; NUM_FRAME_CONTEXTS]);
        assert!(state.reset_partial);

        // Pending partial reset fires before the restore.
        let update = determine_internal_buffer_update(&inter_frame(0), &mut state).unwrap();
        assert_eq!(reset_flags(&update), (true, false, false, false));
        assert!(!state.reset_partial);
        assert!(state.save_inter_probs);

        // Then the restore.
        let update = determine_internal_buffer_update(&inter_frame(0), &mut state).unwrap();
        assert_eq!(reset_flags(&update), (false, false, false, true));
        assert!(!state.save_inter_probs);

        // Nothing left to do.
        let update = determine_internal_buffer_update(&inter_frame(0), &mut state).unwrap();
        assert_eq!(reset_flags(&update), (false, false, false, false));
    }

    #[test]
    fn intra_only_saves_once() {
        let mut state = PendingUpdateState::default();

        let update = determine_internal_buffer_update(&intra_only(0, 0), &mut state).unwrap();
        assert_eq!(reset_flags(&update), (true, false, true, false));
        assert!(update.flags.reset_key_default);
        assert!(state.save_inter_probs);

        // Already saved: partial reset without saving again.
        let update = determine_internal_buffer_update(&intra_only(1, 0), &mut state).unwrap();
        assert_eq!(reset_flags(&update), (true, false, false, false));

        let update = determine_internal_buffer_update(&inter_frame(0), &mut state).unwrap();
        assert_eq!(reset_flags(&update), (false, false, false, true));
    }

    #[test]
    fn reset_frame_context_uses_bitstream_index() {
        let mut state = PendingUpdateState::default();

        // The frame decodes with context 0 but the deferred reset targets context 3.
        let update = determine_internal_buffer_update(&intra_only(2, 3), &mut state).unwrap();
        assert_eq!(update.frame_ctx_idx, 0);
        assert_eq!(reset_flags(&update), (true, false, true, false));
        assert_eq!(state.reset_full_tables, [false, false, false, true]);
    }

    #[test]
    fn scenario_sequence() {
        let mut state = PendingUpdateState::default();

        // Key frame.
        let mut inputs = key_frame();
        inputs.scaling = true;
        let update = determine_internal_buffer_update(&inputs, &mut state).unwrap();
        assert!(update.flags.reset_full && update.flags.reset_key_default);
        assert!(!update.flags.seg_prob_copy && !update.flags.save && !update.flags.restore);

        // Inter frame on context 0 updating the segmentation map.
        let mut inputs = inter_frame(0);
        inputs.segmentation_enabled = true;
        inputs.segmentation_update_map = true;
        inputs.seg_tree_probs = SEG_TREE;
        inputs.seg_pred_probs = SEG_PRED;
        let update = determine_internal_buffer_update(&inputs, &mut state).unwrap();
        assert!(update.flags.seg_prob_copy);
        assert!(!update.flags.reset_full);
        assert_eq!(&state.copy_seg_probs[1..], &[true, true, true]);
        assert!(!update.reset_seg_id_buffer);

        // Context 2 picks up the pending copy.
        let mut inputs = inter_frame(2);
        inputs.segmentation_enabled = true;
        let update = determine_internal_buffer_update(&inputs, &mut state).unwrap();
        assert!(update.flags.seg_prob_copy);
        assert_eq!(update.flags.seg_tree_probs, SEG_TREE);
        assert_eq!(state.copy_seg_probs, [false, true, false, true]);

        // Intra-only frame resetting context 3.
        let update = determine_internal_buffer_update(&intra_only(2, 3), &mut state).unwrap();
        assert!(state.reset_full_tables[3]);
        assert!(update.flags.reset && !update.flags.reset_full);
        assert!(update.flags.save);
    }

    #[test]
    fn pack_flags() {
        let flags = ProbUpdateFlags {
            seg_prob_copy: true,
            reset: true,
            restore: true,
            ..Default::default()
        };
        assert_eq!(flags.pack(), 0b100011);
        assert_eq!(ProbUpdateFlags::default().pack(), 0);
    }
}

// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Byte layout of a VP9 frame context buffer as read by the decode engine.
//!
//! The layout is described once, as an ordered list of [`Field`]s. Full and partial (diff)
//! initialization are both driven by that list, so every offset used elsewhere in the crate is
//! derived from it rather than computed by hand.

use std::ops::Range;

use thiserror::Error;

use crate::codec::vp9::params::PREDICTION_PROBS;
use crate::codec::vp9::params::SEG_TREE_PROBS;
use crate::codec::vp9::probs::*;

/// Capacity of one frame context, in bytes.
pub const PROB_MAX_NUM_ELEM: usize = 2048;

pub const TX_PROB_OFFSET: usize = 0;
pub const COEF_PROB_OFFSET: usize = 64;
pub const SKIP_PROB_OFFSET: usize = 1664;
/// Start of the region whose defaults differ between key and inter frames.
pub const INTER_PROB_OFFSET: usize = 1667;
pub const SEG_PROB_OFFSET: usize = 2010;
/// Seven tree probabilities followed by three prediction probabilities.
pub const SEG_PROB_SIZE: usize = SEG_TREE_PROBS + PREDICTION_PROBS;
/// Size of the inter probability region that is saved and restored across context switches.
pub const INTER_PROB_SIZE: usize = SEG_PROB_OFFSET - INTER_PROB_OFFSET;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextBufferError {
    #[error("context buffer table ends at offset {offset} but the buffer only holds {capacity} bytes")]
    OutOfBounds { offset: usize, capacity: usize },
}

/// How the bytes of a field are produced when the buffer is initialized.
#[derive(Clone, Copy)]
pub enum Fill {
    /// Reserved hardware bytes, always zero.
    Reserved,
    /// Defaults shared by key and inter frames.
    Common(fn(&mut Vec<u8>)),
    /// Defaults only meaningful for inter frames. Zeroed when seeding key frame defaults.
    InterOnly(fn(&mut Vec<u8>)),
    /// Defaults with a distinct table for key frames.
    PerFrameType {
        key: fn(&mut Vec<u8>),
        inter: fn(&mut Vec<u8>),
    },
    /// Bytes owned by the segmentation logic. Initialization never touches them.
    Preserved,
}

/// One entry of the context buffer layout.
#[derive(Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub len: usize,
    pub fill: Fill,
}

impl Field {
    const fn new(name: &'static str, len: usize, fill: Fill) -> Self {
        Self { name, len, fill }
    }

    /// Appends the field's default bytes to `out`.
    fn write_defaults(&self, use_key_defaults: bool, out: &mut Vec<u8>) {
        let start = out.len();

        match self.fill {
            Fill::Reserved | Fill::Preserved => out.resize(start + self.len, 0),
            Fill::Common(write) => write(out),
            Fill::InterOnly(write) => {
                if use_key_defaults {
                    out.resize(start + self.len, 0);
                } else {
                    write(out);
                }
            }
            Fill::PerFrameType { key, inter } => {
                if use_key_defaults {
                    key(out)
                } else {
                    inter(out)
                }
            }
        }

        debug_assert_eq!(out.len() - start, self.len, "field {}", self.name);
    }
}

fn rows<const N: usize>(rows: &[[u8; N]], out: &mut Vec<u8>) {
    for row in rows {
        out.extend_from_slice(row);
    }
}

fn coef(table: &CoefProbs, out: &mut Vec<u8>) {
    for plane in table {
        for reftype in plane {
            for (band, contexts) in reftype.iter().enumerate() {
                let num_contexts = if band == 0 {
                    BAND_0_COEF_CONTEXTS
                } else {
                    PREV_COEF_CONTEXTS
                };
                rows(&contexts[..num_contexts], out);
            }
        }
    }
}

fn tx(out: &mut Vec<u8>) {
    rows(&DEFAULT_TX_PROBS.p8x8, out);
    rows(&DEFAULT_TX_PROBS.p16x16, out);
    rows(&DEFAULT_TX_PROBS.p32x32, out);
}

fn coef_4x4(out: &mut Vec<u8>) {
    coef(&DEFAULT_COEF_PROBS_4X4, out)
}

fn coef_8x8(out: &mut Vec<u8>) {
    coef(&DEFAULT_COEF_PROBS_8X8, out)
}

fn coef_16x16(out: &mut Vec<u8>) {
    coef(&DEFAULT_COEF_PROBS_16X16, out)
}

fn coef_32x32(out: &mut Vec<u8>) {
    coef(&DEFAULT_COEF_PROBS_32X32, out)
}

fn skip(out: &mut Vec<u8>) {
    out.extend_from_slice(&DEFAULT_SKIP_PROBS)
}

fn inter_mode(out: &mut Vec<u8>) {
    rows(&DEFAULT_INTER_MODE_PROBS, out)
}

fn switchable_interp(out: &mut Vec<u8>) {
    rows(&DEFAULT_SWITCHABLE_INTERP_PROBS, out)
}

fn intra_inter(out: &mut Vec<u8>) {
    out.extend_from_slice(&DEFAULT_INTRA_INTER_PROBS)
}

fn comp_inter(out: &mut Vec<u8>) {
    out.extend_from_slice(&DEFAULT_COMP_INTER_PROBS)
}

fn single_ref(out: &mut Vec<u8>) {
    rows(&DEFAULT_SINGLE_REF_PROBS, out)
}

fn comp_ref(out: &mut Vec<u8>) {
    out.extend_from_slice(&DEFAULT_COMP_REF_PROBS)
}

fn y_mode(out: &mut Vec<u8>) {
    rows(&DEFAULT_IF_Y_PROBS, out)
}

fn kf_partition(out: &mut Vec<u8>) {
    rows(&DEFAULT_KF_PARTITION_PROBS, out)
}

fn partition(out: &mut Vec<u8>) {
    rows(&DEFAULT_PARTITION_PROBS, out)
}

fn mv_joints(out: &mut Vec<u8>) {
    out.extend_from_slice(&DEFAULT_NMV_CONTEXT.joints)
}

fn mv_classes(out: &mut Vec<u8>) {
    for comp in &DEFAULT_NMV_CONTEXT.comps {
        out.push(comp.sign);
        out.extend_from_slice(&comp.classes);
        out.extend_from_slice(&comp.class0);
        out.extend_from_slice(&comp.bits);
    }
}

fn mv_fp(out: &mut Vec<u8>) {
    for comp in &DEFAULT_NMV_CONTEXT.comps {
        rows(&comp.class0_fp, out);
        out.extend_from_slice(&comp.fp);
    }
}

fn mv_hp(out: &mut Vec<u8>) {
    for comp in &DEFAULT_NMV_CONTEXT.comps {
        out.push(comp.class0_hp);
        out.push(comp.hp);
    }
}

fn kf_uv_mode(out: &mut Vec<u8>) {
    rows(&DEFAULT_KF_UV_MODE_PROBS, out)
}

fn uv_mode(out: &mut Vec<u8>) {
    rows(&DEFAULT_IF_UV_PROBS, out)
}

const COEF_TABLE_SIZE: usize =
    BLOCK_TYPES * REF_TYPES * (BAND_0_COEF_CONTEXTS + (COEF_BANDS - 1) * PREV_COEF_CONTEXTS)
        * UNCONSTRAINED_NODES;
const MV_CLASSES_SIZE: usize = 2 * (1 + (MV_CLASSES - 1) + (CLASS0_SIZE - 1) + MV_OFFSET_BITS);
const MV_FP_SIZE_TOTAL: usize = 2 * (CLASS0_SIZE * (MV_FP_SIZE - 1) + (MV_FP_SIZE - 1));

/// The frame context layout, in buffer order.
pub const LAYOUT: &[Field] = &[
    Field::new("tx", 12, Fill::Common(tx)),
    Field::new("reserved_tx", 52, Fill::Reserved),
    Field::new("coef_4x4", COEF_TABLE_SIZE, Fill::Common(coef_4x4)),
    Field::new("coef_8x8", COEF_TABLE_SIZE, Fill::Common(coef_8x8)),
    Field::new("coef_16x16", COEF_TABLE_SIZE, Fill::Common(coef_16x16)),
    Field::new("coef_32x32", COEF_TABLE_SIZE, Fill::Common(coef_32x32)),
    Field::new("reserved_coef", 16, Fill::Reserved),
    Field::new("skip", MBSKIP_CONTEXTS, Fill::Common(skip)),
    Field::new(
        "inter_mode",
        INTER_MODE_CONTEXTS * (INTER_MODES - 1),
        Fill::InterOnly(inter_mode),
    ),
    Field::new(
        "switchable_interp",
        (SWITCHABLE_FILTERS + 1) * (SWITCHABLE_FILTERS - 1),
        Fill::InterOnly(switchable_interp),
    ),
    Field::new(
        "intra_inter",
        INTRA_INTER_CONTEXTS,
        Fill::InterOnly(intra_inter),
    ),
    Field::new("comp_inter", COMP_INTER_CONTEXTS, Fill::InterOnly(comp_inter)),
    Field::new("single_ref", REF_CONTEXTS * 2, Fill::InterOnly(single_ref)),
    Field::new("comp_ref", REF_CONTEXTS, Fill::InterOnly(comp_ref)),
    Field::new(
        "y_mode",
        BLOCK_SIZE_GROUPS * (INTRA_MODES - 1),
        Fill::InterOnly(y_mode),
    ),
    Field::new(
        "partition",
        PARTITION_CONTEXTS * (PARTITION_TYPES - 1),
        Fill::PerFrameType {
            key: kf_partition,
            inter: partition,
        },
    ),
    Field::new("mv_joints", MV_JOINTS - 1, Fill::InterOnly(mv_joints)),
    Field::new("mv_classes", MV_CLASSES_SIZE, Fill::InterOnly(mv_classes)),
    Field::new("mv_fp", MV_FP_SIZE_TOTAL, Fill::InterOnly(mv_fp)),
    Field::new("mv_hp", 4, Fill::InterOnly(mv_hp)),
    Field::new("reserved_mv", 47, Fill::Reserved),
    Field::new(
        "uv_mode",
        INTRA_MODES * (INTRA_MODES - 1),
        Fill::PerFrameType {
            key: kf_uv_mode,
            inter: uv_mode,
        },
    ),
    Field::new("seg_tree", SEG_TREE_PROBS, Fill::Preserved),
    Field::new("seg_pred", PREDICTION_PROBS, Fill::Preserved),
    Field::new("reserved_seg", 28, Fill::Reserved),
];

/// Iterates over the layout, yielding each field together with its byte range.
pub fn fields() -> impl Iterator<Item = (Range<usize>, &'static Field)> {
    LAYOUT.iter().scan(0, |offset, field| {
        let range = *offset..*offset + field.len;
        *offset = range.end;
        Some((range, field))
    })
}

/// Byte range of the field called `name`.
pub fn field_range(name: &str) -> Option<Range<usize>> {
    fields()
        .find(|(_, field)| field.name == name)
        .map(|(range, _)| range)
}

/// Serializes the fields overlapping `region` into `buf`.
///
/// Bounds are checked before anything is written.
fn serialize(
    buf: &mut [u8],
    region: Range<usize>,
    use_key_defaults: bool,
) -> Result<(), ContextBufferError> {
    let end = fields()
        .filter(|(range, _)| range.start >= region.start && range.end <= region.end)
        .map(|(range, _)| range.end)
        .max()
        .unwrap_or(region.start);
    let capacity = buf.len().min(PROB_MAX_NUM_ELEM);
    if end > capacity {
        return Err(ContextBufferError::OutOfBounds {
            offset: end,
            capacity,
        });
    }

    let mut bytes = Vec::with_capacity(PROB_MAX_NUM_ELEM);
    for (range, field) in fields() {
        if range.start < region.start || range.end > region.end {
            continue;
        }

        bytes.clear();
        field.write_defaults(use_key_defaults, &mut bytes);
        if !matches!(field.fill, Fill::Preserved) {
            buf[range].copy_from_slice(&bytes);
        }
    }

    Ok(())
}

/// Resets every probability of the frame context in `buf` to its default value.
///
/// The segmentation probabilities are left untouched; they are managed separately.
pub fn context_buffer_init(buf: &mut [u8], use_key_defaults: bool) -> Result<(), ContextBufferError> {
    serialize(buf, 0..PROB_MAX_NUM_ELEM, use_key_defaults)
}

/// Resets only the region whose defaults differ between key and inter frames.
///
/// `buf` is the whole frame context; writing starts at [`INTER_PROB_OFFSET`]. With
/// `use_key_defaults`, the inter-only fields are zeroed while the partition and UV mode
/// probabilities get their key frame tables.
pub fn ctx_buf_diff_init(buf: &mut [u8], use_key_defaults: bool) -> Result<(), ContextBufferError> {
    serialize(buf, INTER_PROB_OFFSET..SEG_PROB_OFFSET, use_key_defaults)
}

/// Overwrites the segmentation tree and prediction probabilities of the frame context in `buf`.
pub fn write_segmentation_probs(
    buf: &mut [u8],
    tree_probs: &[u8; SEG_TREE_PROBS],
    pred_probs: &[u8; PREDICTION_PROBS],
) -> Result<(), ContextBufferError> {
    let end = SEG_PROB_OFFSET + SEG_PROB_SIZE;
    if end > buf.len() {
        return Err(ContextBufferError::OutOfBounds {
            offset: end,
            capacity: buf.len(),
        });
    }

    buf[SEG_PROB_OFFSET..SEG_PROB_OFFSET + SEG_TREE_PROBS].copy_from_slice(tree_probs);
    buf[SEG_PROB_OFFSET + SEG_TREE_PROBS..end].copy_from_slice(pred_probs);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_defaults() -> Vec<u8> {
        let mut buf = vec![0; PROB_MAX_NUM_ELEM];
        context_buffer_init(&mut buf, true).unwrap();
        buf
    }

    #[test]
    fn layout_offsets() {
        assert_eq!(fields().last().unwrap().0.end, PROB_MAX_NUM_ELEM);
        assert_eq!(field_range("tx"), Some(TX_PROB_OFFSET..12));
        assert_eq!(field_range("coef_4x4").unwrap().start, COEF_PROB_OFFSET);
        assert_eq!(field_range("coef_32x32").unwrap().end, 1648);
        assert_eq!(field_range("skip"), Some(SKIP_PROB_OFFSET..INTER_PROB_OFFSET));
        assert_eq!(field_range("partition"), Some(1756..1804));
        assert_eq!(field_range("mv_hp").unwrap().end, 1873);
        assert_eq!(field_range("uv_mode"), Some(1920..SEG_PROB_OFFSET));
        assert_eq!(
            field_range("seg_tree"),
            Some(SEG_PROB_OFFSET..SEG_PROB_OFFSET + SEG_TREE_PROBS)
        );
        assert_eq!(INTER_PROB_SIZE, 343);
        assert_eq!(field_range("nonexistent"), None);
    }

    #[test]
    fn init_is_idempotent() {
        let mut buf = key_defaults();
        let first = buf.clone();

        context_buffer_init(&mut buf, true).unwrap();
        assert_eq!(buf, first);
    }

    #[test]
    fn init_writes_tx_defaults() {
        let buf = key_defaults();

        assert_eq!(&buf[..12], &[100, 66, 20, 152, 15, 101, 3, 136, 37, 5, 52, 13]);
        assert!(buf[12..COEF_PROB_OFFSET].iter().all(|b| *b == 0));
        assert_eq!(&buf[COEF_PROB_OFFSET..COEF_PROB_OFFSET + 3], &[195, 29, 183]);
        // Band 1 follows the three band 0 contexts directly.
        assert_eq!(&buf[COEF_PROB_OFFSET + 9..COEF_PROB_OFFSET + 12], &[31, 107, 169]);
        assert_eq!(&buf[SKIP_PROB_OFFSET..INTER_PROB_OFFSET], &[192, 128, 64]);
    }

    #[test]
    fn key_defaults_zero_inter_only_fields() {
        let buf = key_defaults();

        let partition = field_range("partition").unwrap();
        assert!(buf[INTER_PROB_OFFSET..partition.start].iter().all(|b| *b == 0));
        assert_eq!(&buf[partition.start..partition.start + 3], &[158, 97, 94]);

        let uv_mode = field_range("uv_mode").unwrap();
        assert!(buf[partition.end..uv_mode.start].iter().all(|b| *b == 0));
        assert_eq!(&buf[uv_mode.start..uv_mode.start + 3], &[144, 11, 54]);
    }

    #[test]
    fn inter_defaults() {
        let mut buf = vec![0; PROB_MAX_NUM_ELEM];
        context_buffer_init(&mut buf, false).unwrap();

        assert_eq!(&buf[INTER_PROB_OFFSET..INTER_PROB_OFFSET + 3], &[2, 173, 34]);
        let partition = field_range("partition").unwrap();
        assert_eq!(&buf[partition.start..partition.start + 3], &[199, 122, 141]);
        let joints = field_range("mv_joints").unwrap();
        assert_eq!(&buf[joints], &[32, 64, 96]);
        let hp = field_range("mv_hp").unwrap();
        assert_eq!(&buf[hp], &[160, 128, 160, 128]);
        let uv_mode = field_range("uv_mode").unwrap();
        assert_eq!(&buf[uv_mode.start..uv_mode.start + 3], &[120, 7, 76]);
    }

    #[test]
    fn init_preserves_segmentation_probs() {
        let mut buf = vec![0xaa; PROB_MAX_NUM_ELEM];
        write_segmentation_probs(&mut buf, &[1, 2, 3, 4, 5, 6, 7], &[8, 9, 10]).unwrap();

        context_buffer_init(&mut buf, true).unwrap();

        assert_eq!(
            &buf[SEG_PROB_OFFSET..SEG_PROB_OFFSET + SEG_PROB_SIZE],
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
        );
        assert!(buf[SEG_PROB_OFFSET + SEG_PROB_SIZE..].iter().all(|b| *b == 0));
    }

    #[test]
    fn diff_init_only_touches_inter_region() {
        let mut buf = vec![0x55; PROB_MAX_NUM_ELEM];

        ctx_buf_diff_init(&mut buf, false).unwrap();

        assert!(buf[..INTER_PROB_OFFSET].iter().all(|b| *b == 0x55));
        assert!(buf[SEG_PROB_OFFSET..].iter().all(|b| *b == 0x55));

        let mut full = vec![0; PROB_MAX_NUM_ELEM];
        context_buffer_init(&mut full, false).unwrap();
        assert_eq!(
            &buf[INTER_PROB_OFFSET..SEG_PROB_OFFSET],
            &full[INTER_PROB_OFFSET..SEG_PROB_OFFSET]
        );
    }

    #[test]
    fn out_of_bounds() {
        let mut buf = vec![0; SEG_PROB_OFFSET];
        assert_eq!(
            context_buffer_init(&mut buf, true),
            Err(ContextBufferError::OutOfBounds {
                offset: PROB_MAX_NUM_ELEM,
                capacity: SEG_PROB_OFFSET,
            })
        );
        // Nothing was written.
        assert!(buf.iter().all(|b| *b == 0));

        // The diff region still fits.
        assert!(ctx_buf_diff_init(&mut buf, true).is_ok());

        let mut short = vec![0; SEG_PROB_OFFSET + 4];
        assert!(write_segmentation_probs(&mut short, &[0; 7], &[0; 3]).is_err());
    }
}

// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-frame VP9 decode orchestration.
//!
//! A frame goes through `execute` once, or several times when its bitstream is delivered in
//! chunks. Each complete frame sets its states (dimensions, scratch buffers, buffer update
//! decision), then records the picture level commands and the primitive level commands, and is
//! submitted to the video context.

pub mod platform;
pub mod resources;
pub mod update;
pub mod writer;

use std::collections::VecDeque;

use anyhow::anyhow;
use log::debug;
use log::warn;

use crate::backend::AllocInit;
use crate::backend::CommandBuffer;
use crate::backend::GpuContext;
use crate::backend::GpuResource;
use crate::backend::HwCommand;
use crate::backend::HwError;
use crate::backend::HwInterface;
use crate::backend::IndObjBaseAddrParams;
use crate::backend::LockMode;
use crate::backend::PicStateParams;
use crate::backend::PipeBufAddrParams;
use crate::backend::PipeModeSelectParams;
use crate::backend::SegmentStateParams;
use crate::backend::Surface;
use crate::backend::SurfaceId;
use crate::backend::SurfaceParams;
use crate::backend::SyncObject;
use crate::codec::vp9::context_buffer::write_segmentation_probs;
use crate::codec::vp9::context_buffer::INTER_PROB_SIZE;
use crate::codec::vp9::context_buffer::PROB_MAX_NUM_ELEM;
use crate::codec::vp9::params::BadSliceChopping;
use crate::codec::vp9::params::PictureParams;
use crate::codec::vp9::params::PrevFrameParams;
use crate::codec::vp9::params::SegmentParams;
use crate::codec::vp9::params::SliceParams;
use crate::codec::vp9::params::INTRA_FRAME;
use crate::codec::vp9::params::MIN_BLOCK_WIDTH;
use crate::codec::vp9::params::NUM_FRAME_CONTEXTS;
use crate::codec::vp9::params::NUM_REF_FRAMES;
use crate::codec::vp9::params::NUM_UNCOMPRESSED_SURFACES;
use crate::codec::vp9::params::PREDICTION_PROBS;
use crate::codec::vp9::params::REFS_PER_FRAME;
use crate::codec::vp9::params::SEG_TREE_PROBS;
use crate::codec::vp9::probs::MAX_PROB;
use crate::decoder::vp9::platform::rowstore_caching_offsets;
use crate::decoder::vp9::platform::Platform;
use crate::decoder::vp9::platform::RowStoreCaches;
use crate::decoder::vp9::platform::CACHELINE_SIZE;
use crate::decoder::vp9::platform::COMMAND_BUFFER_RESERVED_SPACE;
use crate::decoder::vp9::resources::BufferKind;
use crate::decoder::vp9::resources::BufferSizeParams;
use crate::decoder::vp9::resources::ScratchBuffers;
use crate::decoder::vp9::resources::NUM_MV_BUFFERS;
use crate::decoder::vp9::update::determine_internal_buffer_update;
use crate::decoder::vp9::update::BufferUpdate;
use crate::decoder::vp9::update::FrameUpdateInputs;
use crate::decoder::vp9::update::PendingUpdateState;
use crate::decoder::vp9::writer::BufferWriter;
use crate::decoder::vp9::writer::DirectWriter;
use crate::decoder::vp9::writer::QueuedFirmwareWriter;
use crate::decoder::vp9::writer::DMEM_BUFFER_SIZE;
use crate::decoder::vp9::writer::NUM_PROB_BUFFERS;
use crate::decoder::CodecStatus;
use crate::decoder::DecodeError;
use crate::decoder::DecodePhase;
use crate::decoder::DecodeResult;
use crate::decoder::DecodeStatusReport;
use crate::decoder::DecoderConfig;
use crate::utils::align_up;
use crate::Resolution;

const PAGE_SIZE: usize = 4096;

/// Alignment of the chunks accumulated in the copy buffer.
const COPY_DATA_ALIGNMENT: u32 = 64;

/// Attempts at obtaining enough command buffer space for a frame.
const COMMAND_BUFFER_VERIFY_ATTEMPTS: usize = 3;

/// VP9 frames are decoded as a single slice.
const NUM_SLICES: usize = 1;

/// Estimated compressed size per pixel of a frame whose size is unknown.
const CHOPPED_BYTES_PER_PIXEL: u32 = 6;

/// Largest frame width or height a VP9 header can signal.
const MAX_FRAME_DIMENSION: u32 = 1 << 16;

const COPY_DATA_BUFFER_NAME: &str = "Vp9CopyDataBuffer";
const DUMMY_REFERENCE_NAME: &str = "DummyReference";

/// Inputs of one `execute` call.
#[derive(Clone, Debug, Default)]
pub struct DecodeParams {
    pub pic_params: Option<PictureParams>,
    pub segment_params: Option<SegmentParams>,
    pub slice_params: Option<SliceParams>,
    /// Surface the frame is decoded into.
    pub dest_surface: Option<Surface>,
    /// Buffer holding the bitstream, or the current chunk of it.
    pub data_buffer: Option<GpuResource>,
    pub data_size: u32,
    pub data_offset: u32,
}

/// Entry of the reference list, indexed by `curr_pic`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct RefListEntry {
    surface: Option<Surface>,
    frame_width: u32,
    frame_height: u32,
}

struct SyncObjects {
    sync: SyncObject,
    /// Signaled by the workaround context once the bitstream copy is done.
    wa_context_in_use: SyncObject,
    /// Signaled by the video context before the workaround context reuses the copy buffer.
    video_context_in_use: SyncObject,
}

/// Buffers allocated once, when the decoder is created.
struct FixedResources {
    sync_objects: SyncObjects,
    prob_buffers: [GpuResource; NUM_PROB_BUFFERS],
    dmem_buffer: GpuResource,
    inter_probs_save: GpuResource,
}

impl FixedResources {
    /// Allocates every fixed buffer, releasing the ones already allocated if one fails.
    fn allocate<B: HwInterface>(hw: &mut B) -> DecodeResult<Self> {
        let mut sync_objects = Vec::new();
        let mut buffers = Vec::new();

        let res = Self::try_allocate(hw, &mut sync_objects, &mut buffers);
        if res.is_err() {
            for buffer in buffers {
                hw.free(&buffer);
            }
            for sync in sync_objects {
                hw.destroy_sync_object(sync);
            }
        }

        res
    }

    fn try_allocate<B: HwInterface>(
        hw: &mut B,
        sync_objects: &mut Vec<SyncObject>,
        buffers: &mut Vec<GpuResource>,
    ) -> DecodeResult<Self> {
        let mut create_sync = |hw: &mut B| -> DecodeResult<SyncObject> {
            let sync = hw.create_sync_object()?;
            sync_objects.push(sync);
            Ok(sync)
        };
        let sync_objects = SyncObjects {
            sync: create_sync(hw)?,
            wa_context_in_use: create_sync(hw)?,
            video_context_in_use: create_sync(hw)?,
        };

        let mut alloc = |hw: &mut B,
                         size: usize,
                         name: &'static str,
                         init: AllocInit|
         -> DecodeResult<GpuResource> {
            let resource = hw.allocate(size, name, init)?;
            buffers.push(resource);
            Ok(resource)
        };

        let prob_buffer_size = align_up(PROB_MAX_NUM_ELEM, PAGE_SIZE);
        let mut prob_buffers = Vec::with_capacity(NUM_PROB_BUFFERS);
        for _ in 0..NUM_PROB_BUFFERS {
            let resource = alloc(hw, prob_buffer_size, "Vp9ProbabilityBuffer", AllocInit::Zeroed)?;
            let mut mapping = hw.lock(&resource, LockMode::WriteOnly)?;
            write_segmentation_probs(
                mapping.as_mut_slice(),
                &[MAX_PROB; SEG_TREE_PROBS],
                &[MAX_PROB; PREDICTION_PROBS],
            )?;
            drop(mapping);
            prob_buffers.push(resource);
        }
        let prob_buffers: [GpuResource; NUM_PROB_BUFFERS] = prob_buffers
            .try_into()
            .map_err(|_| anyhow!("unexpected number of probability buffers"))?;

        let dmem_buffer = alloc(
            hw,
            align_up(DMEM_BUFFER_SIZE, CACHELINE_SIZE),
            "DmemBuffer",
            AllocInit::Zeroed,
        )?;
        let inter_probs_save = alloc(
            hw,
            align_up(INTER_PROB_SIZE, PAGE_SIZE),
            "VP9InterProbsSaveBuffer",
            AllocInit::Uninitialized,
        )?;

        Ok(Self {
            sync_objects,
            prob_buffers,
            dmem_buffer,
            inter_probs_save,
        })
    }
}

/// Inputs of the frame being decoded, valid from the moment its states are set until the next
/// `execute` call.
struct FrameState {
    pic: PictureParams,
    segment: SegmentParams,
    slice: Option<SliceParams>,
    dest: Surface,
    data_buffer: GpuResource,
    data_size: u32,
    data_offset: u32,
    update: BufferUpdate,
}

/// Parameters of the picture level commands of a frame.
struct PicStateCommands {
    pipe_mode_select: PipeModeSelectParams,
    surfaces: Vec<SurfaceParams>,
    pipe_buf_addr: PipeBufAddrParams,
    ind_obj_base_addr: IndObjBaseAddrParams,
    pic_state: PicStateParams,
}

/// A submitted frame whose status has not been queried yet.
struct PendingStatusReport {
    report: DecodeStatusReport,
    surface: Surface,
}

/// VP9 decoder for HCP video engines.
///
/// Owns every buffer the engine reads or writes across frames: the frame context probability
/// buffers, the segment id map, the motion vector ring and the scratch buffers. They are
/// released when the decoder is dropped.
pub struct Vp9Decoder<B: HwInterface> {
    hw: B,
    config: DecoderConfig,
    platform: Box<dyn Platform>,
    writer: Box<dyn BufferWriter<B>>,

    sync_objects: SyncObjects,
    prob_buffers: [GpuResource; NUM_PROB_BUFFERS],
    dmem_buffer: GpuResource,
    inter_probs_save: GpuResource,
    dummy_reference: Option<Surface>,
    scratch: ScratchBuffers,
    rowstore: RowStoreCaches,

    ref_list: Vec<RefListEntry>,
    pending: PendingUpdateState,
    frame: Option<FrameState>,
    phase: Option<DecodePhase>,

    first_execute_call: bool,
    incomplete_picture: bool,
    copy_data_buffer: Option<GpuResource>,
    copy_data_in_use: bool,
    copy_data_offset: u32,

    /// Largest frame dimensions seen so far.
    width: u32,
    height: u32,
    aligned_frame_width: u32,
    aligned_frame_height: u32,
    /// Packed [`PrevFrameParams`] of the last decoded frame.
    prev_frame_params: u32,
    prev_frame_width: u32,
    prev_frame_height: u32,
    cur_mv_idx: usize,
    col_mv_idx: usize,

    status_reports: VecDeque<PendingStatusReport>,
    concealment_count: u32,
}

impl<B: HwInterface> Vp9Decoder<B> {
    /// Creates a decoder submitting its work to `hw`, and allocates the buffers whose size does
    /// not depend on the stream.
    pub fn new(mut hw: B, config: DecoderConfig) -> DecodeResult<Self> {
        let fixed = FixedResources::allocate(&mut hw)?;

        let writer: Box<dyn BufferWriter<B>> = if config.secure {
            Box::new(QueuedFirmwareWriter::new(
                fixed.dmem_buffer,
                fixed.inter_probs_save,
            ))
        } else {
            Box::new(DirectWriter::new())
        };

        debug!(
            "Creating VP9 decoder: {:?}, {} writer",
            config,
            if config.secure { "firmware" } else { "direct" }
        );

        Ok(Self {
            hw,
            platform: platform::for_generation(config.generation),
            writer,
            sync_objects: fixed.sync_objects,
            prob_buffers: fixed.prob_buffers,
            dmem_buffer: fixed.dmem_buffer,
            inter_probs_save: fixed.inter_probs_save,
            dummy_reference: None,
            scratch: ScratchBuffers::new(),
            rowstore: Default::default(),
            ref_list: vec![Default::default(); NUM_UNCOMPRESSED_SURFACES],
            pending: Default::default(),
            frame: None,
            phase: None,
            first_execute_call: true,
            incomplete_picture: false,
            copy_data_buffer: None,
            copy_data_in_use: false,
            copy_data_offset: 0,
            width: config.width,
            height: config.height,
            aligned_frame_width: 0,
            aligned_frame_height: 0,
            prev_frame_params: 0,
            prev_frame_width: 0,
            prev_frame_height: 0,
            cur_mv_idx: 0,
            col_mv_idx: 0,
            status_reports: VecDeque::new(),
            concealment_count: 0,
            config,
        })
    }

    /// Decodes a frame, or accumulates a chunk of its bitstream.
    ///
    /// If the supplied bitstream is smaller than the size announced by the picture parameters,
    /// it is copied aside and nothing is decoded until the remaining chunks have been supplied
    /// by subsequent calls. On error the current frame is abandoned and the next call starts a
    /// new one.
    pub fn execute(&mut self, params: DecodeParams) -> DecodeResult<()> {
        let res = self.execute_frame(params);

        match res {
            Ok(()) => self.first_execute_call = !self.incomplete_picture,
            Err(_) => {
                self.first_execute_call = true;
                self.incomplete_picture = false;
                self.phase = None;
            }
        }

        res
    }

    fn execute_frame(&mut self, params: DecodeParams) -> DecodeResult<()> {
        self.set_frame_states(params)?;
        self.verify_space()?;

        if !self.incomplete_picture {
            self.set_dummy_reference()?;
            self.decode_state_level()?;
        }

        self.decode_primitive_level()
    }

    fn current(&self) -> DecodeResult<&FrameState> {
        self.frame
            .as_ref()
            .ok_or(DecodeError::MissingInput("picture parameters"))
    }

    fn current_mut(&mut self) -> DecodeResult<&mut FrameState> {
        self.frame
            .as_mut()
            .ok_or(DecodeError::MissingInput("picture parameters"))
    }

    fn initialize_begin_frame(&mut self) {
        self.incomplete_picture = false;
        self.copy_data_in_use = false;
        self.copy_data_offset = 0;
    }

    fn set_frame_states(&mut self, params: DecodeParams) -> DecodeResult<()> {
        let dest = params
            .dest_surface
            .ok_or(DecodeError::MissingInput("destination surface"))?;
        let data_buffer = params
            .data_buffer
            .ok_or(DecodeError::MissingInput("bitstream buffer"))?;
        let pic = params
            .pic_params
            .ok_or(DecodeError::MissingInput("picture parameters"))?;
        let segment = params
            .segment_params
            .ok_or(DecodeError::MissingInput("segment parameters"))?;

        if !(1..=MAX_FRAME_DIMENSION).contains(&pic.width)
            || !(1..=MAX_FRAME_DIMENSION).contains(&pic.height)
        {
            return Err(DecodeError::InvalidParameter(format!(
                "frame size {}x{} out of range",
                pic.width, pic.height
            )));
        }
        if usize::from(pic.frame_context_idx) >= NUM_FRAME_CONTEXTS {
            return Err(DecodeError::InvalidParameter(format!(
                "frame context index {} out of range [0, {}]",
                pic.frame_context_idx,
                NUM_FRAME_CONTEXTS - 1
            )));
        }

        self.frame = Some(FrameState {
            pic,
            segment,
            slice: params.slice_params,
            dest,
            data_buffer,
            data_size: params.data_size,
            data_offset: params.data_offset,
            update: Default::default(),
        });

        if self.first_execute_call {
            self.initialize_begin_frame();
        }

        self.check_and_copy_bitstream()?;
        if self.incomplete_picture {
            debug!(
                "Picture incomplete, {} bytes accumulated",
                self.copy_data_offset
            );
            return Ok(());
        }

        let frame = self.current_mut()?;
        let frame_width = frame.pic.width;
        let frame_height = frame.pic.height;
        let curr_pic = usize::from(frame.pic.curr_pic);
        frame.dest.width = frame_width;
        frame.dest.height = frame_height;
        let dest = frame.dest;
        if frame.pic.lf.level == 0 {
            frame.segment.clear_filter_levels();
        }

        self.width = self.width.max(frame_width);
        self.height = self.height.max(frame_height);
        self.aligned_frame_width = align_up(frame_width, MIN_BLOCK_WIDTH);
        self.aligned_frame_height = align_up(frame_height, MIN_BLOCK_WIDTH);

        let entry = self.ref_list.get_mut(curr_pic).ok_or_else(|| {
            DecodeError::InvalidParameter(format!(
                "current picture index {} out of range [0, {}]",
                curr_pic,
                NUM_UNCOMPRESSED_SURFACES - 1
            ))
        })?;
        *entry = RefListEntry {
            surface: Some(dest),
            frame_width,
            frame_height,
        };

        let rowstore_supported =
            self.config.rowstore_caching && self.platform.rowstore_support().any();
        if rowstore_supported
            && self.aligned_frame_width != align_up(self.prev_frame_width, MIN_BLOCK_WIDTH)
        {
            let frame = self.current()?;
            let bit_depth = frame.pic.bit_depth;
            let chroma_format = frame.pic.chroma_format().ok_or_else(|| {
                DecodeError::InvalidParameter(format!(
                    "unsupported chroma subsampling ({}, {})",
                    frame.pic.subsampling_x, frame.pic.subsampling_y
                ))
            })?;
            self.rowstore = rowstore_caching_offsets(
                self.platform.rowstore_support(),
                self.aligned_frame_width,
                bit_depth,
                chroma_format,
            )?;
            debug!("Row-store caches: {:?}", self.rowstore);
        }

        let size_params = BufferSizeParams::new(
            self.width,
            self.height,
            self.config.bit_depth,
            self.config.chroma_format,
        );
        self.scratch.ensure_sizes(
            &mut self.hw,
            self.platform.as_ref(),
            &size_params,
            &self.rowstore,
        )?;

        let frame = self.current()?;
        let inputs = FrameUpdateInputs::new(
            &frame.pic,
            (frame_width, frame_height),
            (self.prev_frame_width, self.prev_frame_height),
        );
        let advance_mv = !frame.pic.is_key_frame() && !frame.pic.intra_only;
        let update = determine_internal_buffer_update(&inputs, &mut self.pending)?;
        self.current_mut()?.update = update;

        self.phase = Some(DecodePhase::Initialized);
        debug!("Decode phase: {:?}", DecodePhase::Initialized);

        if advance_mv {
            self.cur_mv_idx = (self.cur_mv_idx + 1) % NUM_MV_BUFFERS;
            self.col_mv_idx = if self.cur_mv_idx < 1 {
                NUM_MV_BUFFERS - 1
            } else {
                self.cur_mv_idx - 1
            };
        }

        Ok(())
    }

    /// Accumulates the bitstream into the copy buffer when it is delivered in several chunks.
    fn check_and_copy_bitstream(&mut self) -> DecodeResult<()> {
        let frame = self.current_mut()?;
        let chopping = frame
            .slice
            .as_ref()
            .map(|slice| slice.bad_slice_chopping)
            .unwrap_or_default();
        if chopping != BadSliceChopping::None {
            frame.pic.bs_bytes_in_buffer = frame
                .pic
                .width
                .checked_mul(frame.pic.height)
                .and_then(|pixels| pixels.checked_mul(CHOPPED_BYTES_PER_PIXEL))
                .ok_or_else(|| {
                    DecodeError::InvalidParameter(format!(
                        "estimated bitstream size of a {}x{} frame overflows",
                        frame.pic.width, frame.pic.height
                    ))
                })?;
        }
        let expected = frame.pic.bs_bytes_in_buffer;
        let data_size = frame.data_size;

        if self.first_execute_call {
            if data_size < expected {
                let needed = align_up(u64::from(expected), u64::from(COPY_DATA_ALIGNMENT));
                let needed = usize::try_from(needed).map_err(|_| {
                    DecodeError::InvalidParameter(format!(
                        "bitstream of {} bytes does not fit in memory",
                        expected
                    ))
                })?;
                let current = self.copy_data_buffer.map(|b| b.size).unwrap_or(0);
                if current < needed {
                    if let Some(old) = self.copy_data_buffer.take() {
                        self.hw.free(&old);
                    }
                    debug!(
                        "Allocating {}: {} -> {} bytes",
                        COPY_DATA_BUFFER_NAME, current, needed
                    );
                    self.copy_data_buffer = Some(self.hw.allocate(
                        needed,
                        COPY_DATA_BUFFER_NAME,
                        AllocInit::Uninitialized,
                    )?);
                }

                if data_size > 0 {
                    self.copy_data_surface()?;
                    self.copy_data_in_use = true;
                }

                self.incomplete_picture = true;
            }
        } else {
            let capacity = self.copy_data_buffer.map(|b| b.size).unwrap_or(0);
            if self.copy_data_offset as usize + data_size as usize > capacity {
                return Err(DecodeError::InvalidParameter(format!(
                    "bitstream chunk of {} bytes at offset {} overflows the {} bytes copy buffer",
                    data_size, self.copy_data_offset, capacity
                )));
            }

            if data_size > 0 {
                self.copy_data_surface()?;
            }

            if self.copy_data_offset >= expected || chopping == BadSliceChopping::Last {
                self.incomplete_picture = false;
            }
        }

        Ok(())
    }

    /// Copies the current bitstream chunk at the end of the copy buffer, on the workaround
    /// context.
    fn copy_data_surface(&mut self) -> DecodeResult<()> {
        let frame = self.current()?;
        let data_buffer = frame.data_buffer;
        let data_size = frame.data_size;
        let data_offset = frame.data_offset;
        let copy_buffer = self
            .copy_data_buffer
            .ok_or_else(|| DecodeError::ResourceUnavailable(COPY_DATA_BUFFER_NAME.into()))?;
        let end = align_up(
            u64::from(self.copy_data_offset) + u64::from(data_size),
            u64::from(COPY_DATA_ALIGNMENT),
        );
        let end = u32::try_from(end).map_err(|_| {
            DecodeError::InvalidParameter(format!(
                "bitstream chunk of {} bytes at offset {} overflows",
                data_size, self.copy_data_offset
            ))
        })?;

        let mut cmd_buffer = self.hw.get_command_buffer(GpuContext::VideoForWa)?;
        cmd_buffer.push(HwCommand::Prolog);
        self.hw.firmware_copy(
            &mut cmd_buffer,
            &data_buffer,
            &copy_buffer,
            data_size as usize,
            data_offset as usize,
            self.copy_data_offset as usize,
        )?;
        cmd_buffer.push(HwCommand::MiFlushDw);
        cmd_buffer.push(HwCommand::BatchBufferEnd);
        self.hw.return_command_buffer(cmd_buffer);

        self.copy_data_offset = end;

        // The previous frame may still be reading the copy buffer.
        if !self.incomplete_picture {
            let sync = self.sync_objects.video_context_in_use;
            self.hw.engine_signal(GpuContext::Video, sync)?;
            self.hw.engine_wait(GpuContext::VideoForWa, sync)?;
        }

        self.hw.submit_command_buffer(GpuContext::VideoForWa)?;

        Ok(())
    }

    /// Makes sure the video context command buffer can hold the commands of a frame.
    fn verify_space(&mut self) -> DecodeResult<()> {
        let secure = self.config.secure;
        let requested = self.platform.state_command_size(secure)
            + self.platform.primitive_command_size(secure) * (NUM_SLICES + 1);

        for attempt in 0..COMMAND_BUFFER_VERIFY_ATTEMPTS {
            match self
                .hw
                .verify_command_buffer_size(GpuContext::Video, requested)
            {
                Ok(()) => return Ok(()),
                Err(HwError::NoSpace) => {
                    debug!(
                        "Command buffer too small for {} bytes, resizing (attempt {})",
                        requested,
                        attempt + 1
                    );
                    self.hw.resize_command_buffer(
                        GpuContext::Video,
                        requested + COMMAND_BUFFER_RESERVED_SPACE,
                    )?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DecodeError::NoSpace)
    }

    fn set_dummy_reference(&mut self) -> DecodeResult<()> {
        if !self.config.dummy_reference || self.dummy_reference.is_some() {
            return Ok(());
        }

        let dest = self.current()?.dest;
        let resource =
            self.hw
                .allocate(dest.resource.size, DUMMY_REFERENCE_NAME, AllocInit::Zeroed)?;
        self.dummy_reference = Some(Surface {
            resource,
            width: dest.width,
            height: dest.height,
        });

        Ok(())
    }

    fn determine_decode_phase(&mut self) -> DecodeResult<()> {
        match self.phase {
            Some(DecodePhase::Initialized) => {
                self.phase = Some(DecodePhase::LegacyLong);
                debug!("Decode phase: {:?}", DecodePhase::LegacyLong);
                Ok(())
            }
            phase => Err(DecodeError::InvalidParameter(format!(
                "invalid decode phase {:?}",
                phase
            ))),
        }
    }

    /// Returns the surfaces of the last, golden and altref references of `pic`, concealing the
    /// ones that are missing.
    fn reference_surfaces(
        &mut self,
        pic: &mut PictureParams,
        dest: &Surface,
    ) -> DecodeResult<[Option<Surface>; REFS_PER_FRAME]> {
        let mut references = [None; REFS_PER_FRAME];
        if pic.is_intra() {
            return Ok(references);
        }

        if let Some(idx) = pic
            .ref_frame_idx
            .iter()
            .find(|&&idx| usize::from(idx) >= NUM_REF_FRAMES)
        {
            return Err(DecodeError::InvalidParameter(format!(
                "reference frame index {} out of range [0, {}]",
                idx,
                NUM_REF_FRAMES - 1
            )));
        }

        for (reference, &idx) in references.iter_mut().zip(pic.ref_frame_idx.iter()) {
            let slot = &mut pic.ref_frame_list[usize::from(idx)];
            if usize::from(*slot) >= NUM_UNCOMPRESSED_SURFACES {
                warn!(
                    "Reference frame {} out of range, clamping to {}",
                    slot,
                    NUM_UNCOMPRESSED_SURFACES - 1
                );
                *slot = (NUM_UNCOMPRESSED_SURFACES - 1) as u8;
                self.concealment_count += 1;
            }

            let surface = match self.ref_list[usize::from(*slot)].surface {
                Some(surface) => surface,
                None => {
                    warn!("Reference frame {} is missing, substituting it", slot);
                    self.concealment_count += 1;
                    self.dummy_reference.unwrap_or(*dest)
                }
            };
            *reference = Some(surface);
        }

        Ok(references)
    }

    fn init_pic_state_params(&mut self) -> DecodeResult<PicStateCommands> {
        let frame = self.current()?;
        let mut pic = frame.pic.clone();
        let dest = frame.dest;
        let frame_ctx_idx = usize::from(frame.update.frame_ctx_idx);
        let data = IndObjBaseAddrParams {
            data: frame.data_buffer,
            offset: frame.data_offset,
            size: frame.data_size,
        };

        let references = self.reference_surfaces(&mut pic, &dest)?;

        let chroma_format = pic.chroma_format().ok_or_else(|| {
            DecodeError::InvalidParameter(format!(
                "unsupported chroma subsampling ({}, {})",
                pic.subsampling_x, pic.subsampling_y
            ))
        })?;
        let bit_depth = pic.bit_depth.bits();
        let inter = !pic.is_intra();

        let mut surfaces = vec![SurfaceParams {
            id: SurfaceId::Decoded,
            surface: dest,
            bit_depth,
            chroma_format,
        }];
        if inter {
            let ids = [SurfaceId::Last, SurfaceId::Golden, SurfaceId::AltRef];
            for (id, surface) in ids.into_iter().zip(references.iter().flatten()) {
                surfaces.push(SurfaceParams {
                    id,
                    surface: *surface,
                    bit_depth,
                    chroma_format,
                });
            }
        }

        let line_buffer = |enabled: bool, kind: BufferKind| -> DecodeResult<Option<GpuResource>> {
            if enabled {
                Ok(None)
            } else {
                self.scratch.buffer(kind).map(Some)
            }
        };

        let cur_mv_temporal = if inter {
            Some(self.scratch.mv_temporal(self.cur_mv_idx)?)
        } else {
            None
        };
        let prev_frame_params = PrevFrameParams::unpack(self.prev_frame_params);
        let col_mv_temporal = if inter && prev_frame_params.has_motion_vectors() {
            Some(self.scratch.mv_temporal(self.col_mv_idx)?)
        } else {
            None
        };

        let pipe_buf_addr = PipeBufAddrParams {
            pre_deblocking: dest,
            deblocking_line: line_buffer(self.rowstore.df.enabled, BufferKind::DeblockingLine)?,
            deblocking_tile_line: self.scratch.buffer(BufferKind::DeblockingTileLine)?,
            deblocking_tile_column: self.scratch.buffer(BufferKind::DeblockingTileColumn)?,
            metadata_line: line_buffer(self.rowstore.dat.enabled, BufferKind::MetadataLine)?,
            metadata_tile_line: self.scratch.buffer(BufferKind::MetadataTileLine)?,
            metadata_tile_column: self.scratch.buffer(BufferKind::MetadataTileColumn)?,
            hvd_line: line_buffer(self.rowstore.hvd.enabled, BufferKind::HvdLine)?,
            hvd_tile: self.scratch.buffer(BufferKind::HvdTile)?,
            cur_mv_temporal,
            col_mv_temporal,
            segment_id: self.scratch.buffer(BufferKind::SegmentId)?,
            probability: self.prob_buffers[frame_ctx_idx],
            references: references.map(|r| r.unwrap_or(dest).resource),
        };

        let ind_obj_base_addr = match self.copy_data_buffer {
            Some(copy_buffer) if self.copy_data_in_use => IndObjBaseAddrParams {
                data: copy_buffer,
                offset: 0,
                size: copy_buffer.size as u32,
            },
            _ => data,
        };

        let pic_state = PicStateParams {
            pic: pic.clone(),
            references,
            prev_frame_params: self.prev_frame_params,
            prev_width: self.prev_frame_width,
            prev_height: self.prev_frame_height,
        };

        self.current_mut()?.pic = pic;

        Ok(PicStateCommands {
            pipe_mode_select: PipeModeSelectParams {
                secure: self.config.secure,
                stream_out: false,
            },
            surfaces,
            pipe_buf_addr,
            ind_obj_base_addr,
            pic_state,
        })
    }

    /// Applies the buffer update decided for the current frame.
    fn update_pic_state_buffers(&mut self, cmd_buffer: &mut CommandBuffer) -> DecodeResult<()> {
        let update = self.current()?.update.clone();

        if update.reset_seg_id_buffer {
            let seg_ids = self.scratch.segment_ids()?;
            self.writer
                .reset_segment_ids(&mut self.hw, cmd_buffer, &seg_ids)?;
        }

        self.writer
            .update_probabilities(&mut self.hw, cmd_buffer, &self.prob_buffers, &update)
    }

    fn add_pic_state_cmds(
        &mut self,
        cmd_buffer: &mut CommandBuffer,
        commands: PicStateCommands,
    ) -> DecodeResult<()> {
        cmd_buffer.push(HwCommand::PipeModeSelect(commands.pipe_mode_select));
        for surface in commands.surfaces {
            cmd_buffer.push(HwCommand::Surface(surface));
        }
        cmd_buffer.push(HwCommand::PipeBufAddr(Box::new(commands.pipe_buf_addr)));
        cmd_buffer.push(HwCommand::IndObjBaseAddr(commands.ind_obj_base_addr));

        let frame = self.current_mut()?;
        let intra = frame.pic.is_intra();
        let segmentation_enabled = frame.pic.seg.enabled;
        for (index, data) in frame.segment.seg_data.iter_mut().enumerate() {
            if data.flags.reference_enabled && intra {
                data.flags.reference = INTRA_FRAME as u8;
            }

            cmd_buffer.push(HwCommand::SegmentState(Box::new(SegmentStateParams {
                index: index as u8,
                data: data.clone(),
            })));

            if !segmentation_enabled {
                break;
            }
        }

        cmd_buffer.push(HwCommand::PicState(Box::new(commands.pic_state)));

        Ok(())
    }

    fn decode_state_level(&mut self) -> DecodeResult<()> {
        self.determine_decode_phase()?;

        let mut cmd_buffer = self.hw.get_command_buffer(GpuContext::Video)?;
        cmd_buffer.push(HwCommand::Prolog);

        let commands = self.init_pic_state_params()?;
        self.update_pic_state_buffers(&mut cmd_buffer)?;

        if self.config.status_reporting {
            cmd_buffer.push(HwCommand::StatusReportStart {
                feedback_number: self.current()?.pic.status_report_feedback_number,
            });
        }

        self.add_pic_state_cmds(&mut cmd_buffer, commands)?;
        self.hw.return_command_buffer(cmd_buffer);

        Ok(())
    }

    fn decode_primitive_level(&mut self) -> DecodeResult<()> {
        if self.incomplete_picture {
            return Ok(());
        }

        let frame = self.current()?;
        let header_size = frame.pic.uncompressed_header_size_in_bytes;
        let bitstream_size = frame.pic.bs_bytes_in_buffer;
        let feedback_number = frame.pic.status_report_feedback_number;
        let curr_pic = frame.pic.curr_pic;
        let dest = frame.dest;
        let prev_frame_params = PrevFrameParams::from_picture(&frame.pic).pack();
        let (frame_width, frame_height) = (frame.pic.width, frame.pic.height);

        let bsd_size = bitstream_size.checked_sub(header_size).ok_or_else(|| {
            DecodeError::InvalidParameter(format!(
                "uncompressed header of {} bytes larger than the {} bytes bitstream",
                header_size, bitstream_size
            ))
        })?;
        let num_mbs_affected = self
            .aligned_frame_width
            .checked_mul(self.aligned_frame_height)
            .ok_or_else(|| {
                DecodeError::InvalidParameter(format!(
                    "frame area {}x{} overflows",
                    self.aligned_frame_width, self.aligned_frame_height
                ))
            })?;

        let mut cmd_buffer = self.hw.get_command_buffer(GpuContext::Video)?;
        cmd_buffer.push(HwCommand::BsdObject {
            size: bsd_size,
            offset: header_size,
        });
        cmd_buffer.push(HwCommand::VdPipelineFlush);
        cmd_buffer.push(HwCommand::MiFlushDw);

        self.hw
            .resource_wait(GpuContext::Video, &dest.resource)?;

        if self.config.status_reporting {
            cmd_buffer.push(HwCommand::StatusReportEnd {
                feedback_number,
                num_mbs_affected,
            });
        }

        cmd_buffer.push(HwCommand::MiFlushDw);
        cmd_buffer.push(HwCommand::BatchBufferEnd);
        self.hw.return_command_buffer(cmd_buffer);

        if self.copy_data_in_use {
            let sync = self.sync_objects.wa_context_in_use;
            self.hw.engine_signal(GpuContext::VideoForWa, sync)?;
            self.hw.engine_wait(GpuContext::Video, sync)?;
        }

        self.hw.submit_command_buffer(GpuContext::Video)?;
        self.hw
            .resource_signal(GpuContext::Video, &dest.resource)?;

        // Only a submitted frame becomes the previous frame of the next one.
        self.prev_frame_params = prev_frame_params;
        self.prev_frame_width = frame_width;
        self.prev_frame_height = frame_height;

        if self.config.status_reporting {
            self.status_reports.push_back(PendingStatusReport {
                report: DecodeStatusReport {
                    feedback_number,
                    curr_pic,
                    status: CodecStatus::Unavailable,
                    num_mbs_affected,
                    crc: None,
                },
                surface: dest,
            });
        }

        debug!("Frame {} submitted", feedback_number);

        Ok(())
    }

    /// Returns the reports of the submitted frames that the hardware is done with, in
    /// submission order.
    pub fn query_status_reports(&mut self) -> DecodeResult<Vec<DecodeStatusReport>> {
        let mut reports = Vec::new();

        while let Some(pending) = self.status_reports.front() {
            let status = self.hw.query_status(pending.report.feedback_number)?;
            if status == CodecStatus::Incomplete {
                break;
            }

            let crc = if self.config.report_crc && status == CodecStatus::Complete {
                Some(self.hw.frame_crc(&pending.surface)?)
            } else {
                None
            };

            if let Some(pending) = self.status_reports.pop_front() {
                reports.push(DecodeStatusReport {
                    status,
                    crc,
                    ..pending.report
                });
            }
        }

        Ok(reports)
    }

    /// Largest frame size seen so far. The scratch buffers are sized for it.
    pub fn max_resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }

    /// Number of times a missing or out of range reference was concealed.
    pub fn concealment_count(&self) -> u32 {
        self.concealment_count
    }

    pub fn phase(&self) -> Option<DecodePhase> {
        self.phase
    }

    /// Buffer update decided for the last frame whose states were set.
    pub fn last_update(&self) -> Option<&BufferUpdate> {
        self.frame.as_ref().map(|frame| &frame.update)
    }

    pub fn pending_update_state(&self) -> &PendingUpdateState {
        &self.pending
    }

    /// Probability buffer of frame context `idx`.
    pub fn probability_buffer(&self, idx: usize) -> Option<GpuResource> {
        self.prob_buffers.get(idx).copied()
    }

    pub fn scratch_buffers(&self) -> &ScratchBuffers {
        &self.scratch
    }

    pub fn backend(&self) -> &B {
        &self.hw
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.hw
    }
}

impl<B: HwInterface> Drop for Vp9Decoder<B> {
    fn drop(&mut self) {
        self.scratch.free_all(&mut self.hw);

        let buffers = self
            .prob_buffers
            .iter()
            .copied()
            .chain([self.dmem_buffer, self.inter_probs_save])
            .chain(self.copy_data_buffer.take())
            .chain(self.dummy_reference.take().map(|s| s.resource));
        for buffer in buffers.collect::<Vec<_>>() {
            self.hw.free(&buffer);
        }

        for sync in [
            self.sync_objects.sync,
            self.sync_objects.wa_context_in_use,
            self.sync_objects.video_context_in_use,
        ] {
            self.hw.destroy_sync_object(sync);
        }
    }
}

// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contracts of the GPU command-submission layer.
//!
//! The decoder never talks to hardware directly. It allocates and maps buffers, records
//! [`HwCommand`]s into [`CommandBuffer`]s and submits them through a [`HwInterface`]. A backend
//! gives those operations meaning: a real one encodes the commands for the video engine, while
//! [`dummy::Backend`] executes the few commands with a memory effect on host buffers.

pub mod dummy;

use thiserror::Error;

use crate::codec::vp9::params::PictureParams;
use crate::codec::vp9::params::SegmentData;
use crate::codec::vp9::params::REFS_PER_FRAME;
use crate::decoder::CodecStatus;
use crate::ChromaFormat;

/// Error returned by backend methods.
#[derive(Error, Debug)]
pub enum HwError {
    #[error("failed to allocate buffer {name}")]
    AllocationFailed { name: String },
    #[error("failed to lock resource {name}")]
    LockFailed { name: String },
    #[error("not enough space in the command buffer")]
    NoSpace,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by backend methods.
pub type HwResult<T> = Result<T, HwError>;

/// Handle to a buffer allocated through [`HwInterface::allocate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuResource {
    pub id: u64,
    pub size: usize,
    pub name: &'static str,
}

/// A picture buffer together with its dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Surface {
    pub resource: GpuResource,
    pub width: u32,
    pub height: u32,
}

/// Initial content of a freshly allocated buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocInit {
    /// Whatever the allocator returns.
    Uninitialized,
    Zeroed,
    Fill(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// GPU contexts the decoder submits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GpuContext {
    /// The video decode engine.
    Video,
    /// A second video context, used to copy bitstream chunks ahead of decode.
    VideoForWa,
}

/// Handle to a cross-engine synchronization object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncObject(pub u64);

/// A buffer mapped into the CPU address space. Dropping it unmaps the buffer.
pub trait MappedResource {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// Which of the decode engine's surface slots a surface state describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceId {
    Decoded,
    Last,
    Golden,
    AltRef,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipeModeSelectParams {
    pub secure: bool,
    pub stream_out: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SurfaceParams {
    pub id: SurfaceId,
    pub surface: Surface,
    pub bit_depth: u8,
    pub chroma_format: ChromaFormat,
}

/// Addresses of every buffer the decode engine reads or writes for a picture.
///
/// Line buffers are `None` when the row-store cache replaces them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipeBufAddrParams {
    pub pre_deblocking: Surface,
    pub deblocking_line: Option<GpuResource>,
    pub deblocking_tile_line: GpuResource,
    pub deblocking_tile_column: GpuResource,
    pub metadata_line: Option<GpuResource>,
    pub metadata_tile_line: GpuResource,
    pub metadata_tile_column: GpuResource,
    pub hvd_line: Option<GpuResource>,
    pub hvd_tile: GpuResource,
    pub cur_mv_temporal: Option<GpuResource>,
    pub col_mv_temporal: Option<GpuResource>,
    pub segment_id: GpuResource,
    pub probability: GpuResource,
    pub references: [GpuResource; REFS_PER_FRAME],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndObjBaseAddrParams {
    pub data: GpuResource,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentStateParams {
    pub index: u8,
    pub data: SegmentData,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PicStateParams {
    pub pic: PictureParams,
    pub references: [Option<Surface>; REFS_PER_FRAME],
    /// Packed `PrevFrameParams` of the previous frame.
    pub prev_frame_params: u32,
    pub prev_width: u32,
    pub prev_height: u32,
}

/// A command recorded into a command buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HwCommand {
    /// Frame tracking and other preamble the backend needs at the start of a frame.
    Prolog,
    PipeModeSelect(PipeModeSelectParams),
    Surface(SurfaceParams),
    PipeBufAddr(Box<PipeBufAddrParams>),
    IndObjBaseAddr(IndObjBaseAddrParams),
    SegmentState(Box<SegmentStateParams>),
    PicState(Box<PicStateParams>),
    BsdObject {
        size: u32,
        offset: u32,
    },
    /// Firmware copy of `len` bytes between two buffers.
    HucCopy {
        src: GpuResource,
        dst: GpuResource,
        len: usize,
        src_offset: usize,
        dst_offset: usize,
    },
    MiFlushDw,
    VdPipelineFlush,
    StatusReportStart {
        feedback_number: u32,
    },
    StatusReportEnd {
        feedback_number: u32,
        num_mbs_affected: u32,
    },
    BatchBufferEnd,
}

/// Commands recorded for one GPU context, waiting to be submitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBuffer {
    pub context: GpuContext,
    pub commands: Vec<HwCommand>,
}

impl CommandBuffer {
    pub fn new(context: GpuContext) -> Self {
        Self {
            context,
            commands: Vec::new(),
        }
    }

    pub fn push(&mut self, command: HwCommand) {
        self.commands.push(command)
    }
}

/// Services the decoder consumes from the GPU command-submission layer.
pub trait HwInterface {
    /// Allocates a linear buffer of `size` bytes.
    fn allocate(&mut self, size: usize, name: &'static str, init: AllocInit)
        -> HwResult<GpuResource>;

    /// Releases a buffer. Freeing an unknown resource is a no-op.
    fn free(&mut self, resource: &GpuResource);

    /// Maps `resource` into the CPU address space, waiting for pending GPU writes to it.
    fn lock<'a>(
        &'a mut self,
        resource: &GpuResource,
        mode: LockMode,
    ) -> HwResult<Box<dyn MappedResource + 'a>>;

    /// Takes the pending command buffer of `context`, or a new one if there is none.
    fn get_command_buffer(&mut self, context: GpuContext) -> HwResult<CommandBuffer>;

    /// Puts back a command buffer obtained with `get_command_buffer`, without submitting it.
    fn return_command_buffer(&mut self, cmd_buffer: CommandBuffer);

    /// Submits the pending command buffer of `context` for execution.
    fn submit_command_buffer(&mut self, context: GpuContext) -> HwResult<()>;

    /// Checks that the command buffer of `context` can hold `requested` more bytes.
    fn verify_command_buffer_size(&mut self, context: GpuContext, requested: usize)
        -> HwResult<()>;

    /// Grows the command buffer of `context` to `size` bytes.
    fn resize_command_buffer(&mut self, context: GpuContext, size: usize) -> HwResult<()>;

    /// Queues a firmware copy of `len` bytes from `src` to `dst` into `cmd_buffer`.
    ///
    /// Nothing is copied until the command buffer is submitted.
    fn firmware_copy(
        &mut self,
        cmd_buffer: &mut CommandBuffer,
        src: &GpuResource,
        dst: &GpuResource,
        len: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> HwResult<()> {
        cmd_buffer.push(HwCommand::HucCopy {
            src: *src,
            dst: *dst,
            len,
            src_offset,
            dst_offset,
        });
        Ok(())
    }

    fn create_sync_object(&mut self) -> HwResult<SyncObject>;
    fn destroy_sync_object(&mut self, sync: SyncObject);

    /// Makes the next submission on `context` signal `sync` once it completes.
    fn engine_signal(&mut self, context: GpuContext, sync: SyncObject) -> HwResult<()>;

    /// Makes the next submission on `context` wait for `sync` to be signaled.
    fn engine_wait(&mut self, context: GpuContext, sync: SyncObject) -> HwResult<()>;

    /// Makes the next submission on `context` wait for pending GPU accesses to `resource`.
    fn resource_wait(&mut self, context: GpuContext, resource: &GpuResource) -> HwResult<()>;

    /// Marks `resource` as written by the last submission on `context`.
    fn resource_signal(&mut self, context: GpuContext, resource: &GpuResource) -> HwResult<()>;

    /// Returns the decode status of the frame submitted with `feedback_number`.
    fn query_status(&mut self, feedback_number: u32) -> HwResult<CodecStatus>;

    /// Returns a CRC of the decoded content of `surface`.
    fn frame_crc(&mut self, surface: &Surface) -> HwResult<u32>;
}

impl<T: HwInterface + ?Sized> HwInterface for &mut T {
    fn allocate(
        &mut self,
        size: usize,
        name: &'static str,
        init: AllocInit,
    ) -> HwResult<GpuResource> {
        (**self).allocate(size, name, init)
    }

    fn free(&mut self, resource: &GpuResource) {
        (**self).free(resource)
    }

    fn lock<'a>(
        &'a mut self,
        resource: &GpuResource,
        mode: LockMode,
    ) -> HwResult<Box<dyn MappedResource + 'a>> {
        (**self).lock(resource, mode)
    }

    fn get_command_buffer(&mut self, context: GpuContext) -> HwResult<CommandBuffer> {
        (**self).get_command_buffer(context)
    }

    fn return_command_buffer(&mut self, cmd_buffer: CommandBuffer) {
        (**self).return_command_buffer(cmd_buffer)
    }

    fn submit_command_buffer(&mut self, context: GpuContext) -> HwResult<()> {
        (**self).submit_command_buffer(context)
    }

    fn verify_command_buffer_size(
        &mut self,
        context: GpuContext,
        requested: usize,
    ) -> HwResult<()> {
        (**self).verify_command_buffer_size(context, requested)
    }

    fn resize_command_buffer(&mut self, context: GpuContext, size: usize) -> HwResult<()> {
        (**self).resize_command_buffer(context, size)
    }

    fn firmware_copy(
        &mut self,
        cmd_buffer: &mut CommandBuffer,
        src: &GpuResource,
        dst: &GpuResource,
        len: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> HwResult<()> {
        (**self).firmware_copy(cmd_buffer, src, dst, len, src_offset, dst_offset)
    }

    fn create_sync_object(&mut self) -> HwResult<SyncObject> {
        (**self).create_sync_object()
    }

    fn destroy_sync_object(&mut self, sync: SyncObject) {
        (**self).destroy_sync_object(sync)
    }

    fn engine_signal(&mut self, context: GpuContext, sync: SyncObject) -> HwResult<()> {
        (**self).engine_signal(context, sync)
    }

    fn engine_wait(&mut self, context: GpuContext, sync: SyncObject) -> HwResult<()> {
        (**self).engine_wait(context, sync)
    }

    fn resource_wait(&mut self, context: GpuContext, resource: &GpuResource) -> HwResult<()> {
        (**self).resource_wait(context, resource)
    }

    fn resource_signal(&mut self, context: GpuContext, resource: &GpuResource) -> HwResult<()> {
        (**self).resource_signal(context, resource)
    }

    fn query_status(&mut self, feedback_number: u32) -> HwResult<CodecStatus> {
        (**self).query_status(feedback_number)
    }

    fn frame_crc(&mut self, surface: &Surface) -> HwResult<u32> {
        (**self).frame_crc(surface)
    }
}

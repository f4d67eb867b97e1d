// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.
//!
//! Every buffer lives in host memory. Firmware copies queued into a command buffer are executed
//! when it is submitted, so probability and segmentation buffers end up with the content real
//! hardware would give them. Everything else is only recorded.

use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::anyhow;

use crate::backend::AllocInit;
use crate::backend::CommandBuffer;
use crate::backend::GpuContext;
use crate::backend::GpuResource;
use crate::backend::HwCommand;
use crate::backend::HwError;
use crate::backend::HwInterface;
use crate::backend::HwResult;
use crate::backend::LockMode;
use crate::backend::MappedResource;
use crate::backend::Surface;
use crate::backend::SyncObject;
use crate::decoder::CodecStatus;

/// Byte pattern of buffers allocated with [`AllocInit::Uninitialized`].
pub const UNINITIALIZED_PATTERN: u8 = 0xcd;

/// Synchronization operations, in the order the decoder issued them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    EngineSignal(GpuContext, SyncObject),
    EngineWait(GpuContext, SyncObject),
    ResourceWait(GpuContext, u64),
    ResourceSignal(GpuContext, u64),
    Submit(GpuContext),
}

struct Buffer {
    name: &'static str,
    data: Vec<u8>,
}

struct Mapping<'a> {
    data: &'a mut [u8],
    mapped: &'a mut usize,
}

impl<'a> MappedResource for Mapping<'a> {
    fn as_slice(&self) -> &[u8] {
        &*self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut *self.data
    }
}

impl<'a> Drop for Mapping<'a> {
    fn drop(&mut self) {
        *self.mapped -= 1;
    }
}

/// Dummy backend keeping every resource in host memory.
#[derive(Default)]
pub struct Backend {
    next_id: u64,
    buffers: HashMap<u64, Buffer>,
    sync_objects: HashSet<SyncObject>,
    pending: HashMap<GpuContext, CommandBuffer>,
    completed_frames: HashSet<u32>,
    mapped: usize,

    /// Every submitted command buffer.
    pub submitted: Vec<CommandBuffer>,
    /// Every synchronization operation and submission.
    pub sync_events: Vec<SyncEvent>,
    /// Every allocation, as (name, size).
    pub allocations: Vec<(&'static str, usize)>,
    /// Sizes passed to `resize_command_buffer`.
    pub resizes: Vec<usize>,

    /// Allocations of buffers with this name fail.
    pub fail_allocation: Option<&'static str>,
    /// All locks fail.
    pub fail_lock: bool,
    /// Number of upcoming command buffer size verifications that fail.
    pub verify_failures: usize,
    /// Statuses reported instead of the default for a feedback number.
    pub status_overrides: HashMap<u32, CodecStatus>,
}

impl Backend {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the current content of `resource`.
    pub fn contents(&self, resource: &GpuResource) -> Option<&[u8]> {
        self.buffers.get(&resource.id).map(|b| b.data.as_slice())
    }

    /// Overwrites the content of `resource` starting at `offset`, as a client would.
    pub fn write(&mut self, resource: &GpuResource, offset: usize, data: &[u8]) -> HwResult<()> {
        let buffer = self
            .buffers
            .get_mut(&resource.id)
            .ok_or_else(|| anyhow!("unknown resource {}", resource.name))?;
        let end = offset + data.len();
        if end > buffer.data.len() {
            return Err(anyhow!("write past the end of {}", buffer.name).into());
        }
        buffer.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Number of buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Number of sync objects currently alive.
    pub fn live_sync_objects(&self) -> usize {
        self.sync_objects.len()
    }

    /// Number of buffers currently mapped.
    pub fn mapped_buffers(&self) -> usize {
        self.mapped
    }

    /// Number of allocations made so far for buffers called `name`.
    pub fn allocation_count(&self, name: &str) -> usize {
        self.allocations.iter().filter(|(n, _)| *n == name).count()
    }

    /// Commands of every submission on `context`, flattened.
    pub fn submitted_commands(&self, context: GpuContext) -> impl Iterator<Item = &HwCommand> {
        self.submitted
            .iter()
            .filter(move |cb| cb.context == context)
            .flat_map(|cb| cb.commands.iter())
    }

    fn copy(
        &mut self,
        src: &GpuResource,
        dst: &GpuResource,
        len: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> HwResult<()> {
        let src_data = self
            .buffers
            .get(&src.id)
            .ok_or_else(|| anyhow!("firmware copy from unknown resource {}", src.name))?;
        let bytes = src_data
            .data
            .get(src_offset..src_offset + len)
            .ok_or_else(|| anyhow!("firmware copy reads past the end of {}", src.name))?
            .to_vec();

        let dst_data = self
            .buffers
            .get_mut(&dst.id)
            .ok_or_else(|| anyhow!("firmware copy to unknown resource {}", dst.name))?;
        dst_data
            .data
            .get_mut(dst_offset..dst_offset + len)
            .ok_or_else(|| anyhow!("firmware copy writes past the end of {}", dst.name))?
            .copy_from_slice(&bytes);

        Ok(())
    }
}

impl HwInterface for Backend {
    fn allocate(
        &mut self,
        size: usize,
        name: &'static str,
        init: AllocInit,
    ) -> HwResult<GpuResource> {
        if self.fail_allocation == Some(name) {
            return Err(HwError::AllocationFailed {
                name: name.to_string(),
            });
        }

        let fill = match init {
            AllocInit::Uninitialized => UNINITIALIZED_PATTERN,
            AllocInit::Zeroed => 0,
            AllocInit::Fill(value) => value,
        };

        self.next_id += 1;
        let resource = GpuResource {
            id: self.next_id,
            size,
            name,
        };
        self.buffers.insert(
            resource.id,
            Buffer {
                name,
                data: vec![fill; size],
            },
        );
        self.allocations.push((name, size));

        Ok(resource)
    }

    fn free(&mut self, resource: &GpuResource) {
        self.buffers.remove(&resource.id);
    }

    fn lock<'a>(
        &'a mut self,
        resource: &GpuResource,
        _mode: LockMode,
    ) -> HwResult<Box<dyn MappedResource + 'a>> {
        let lock_failed = || HwError::LockFailed {
            name: resource.name.to_string(),
        };

        if self.fail_lock {
            return Err(lock_failed());
        }

        let buffer = self.buffers.get_mut(&resource.id).ok_or_else(lock_failed)?;
        self.mapped += 1;

        Ok(Box::new(Mapping {
            data: &mut buffer.data,
            mapped: &mut self.mapped,
        }))
    }

    fn get_command_buffer(&mut self, context: GpuContext) -> HwResult<CommandBuffer> {
        Ok(self
            .pending
            .remove(&context)
            .unwrap_or_else(|| CommandBuffer::new(context)))
    }

    fn return_command_buffer(&mut self, cmd_buffer: CommandBuffer) {
        self.pending.insert(cmd_buffer.context, cmd_buffer);
    }

    fn submit_command_buffer(&mut self, context: GpuContext) -> HwResult<()> {
        let cmd_buffer = self
            .pending
            .remove(&context)
            .ok_or_else(|| anyhow!("no pending command buffer on {:?}", context))?;

        for command in &cmd_buffer.commands {
            match command {
                HwCommand::HucCopy {
                    src,
                    dst,
                    len,
                    src_offset,
                    dst_offset,
                } => self.copy(src, dst, *len, *src_offset, *dst_offset)?,
                HwCommand::StatusReportEnd {
                    feedback_number, ..
                } => {
                    self.completed_frames.insert(*feedback_number);
                }
                _ => (),
            }
        }

        self.sync_events.push(SyncEvent::Submit(context));
        self.submitted.push(cmd_buffer);

        Ok(())
    }

    fn verify_command_buffer_size(
        &mut self,
        _context: GpuContext,
        _requested: usize,
    ) -> HwResult<()> {
        if self.verify_failures > 0 {
            self.verify_failures -= 1;
            return Err(HwError::NoSpace);
        }

        Ok(())
    }

    fn resize_command_buffer(&mut self, _context: GpuContext, size: usize) -> HwResult<()> {
        self.resizes.push(size);
        Ok(())
    }

    fn create_sync_object(&mut self) -> HwResult<SyncObject> {
        self.next_id += 1;
        let sync = SyncObject(self.next_id);
        self.sync_objects.insert(sync);
        Ok(sync)
    }

    fn destroy_sync_object(&mut self, sync: SyncObject) {
        self.sync_objects.remove(&sync);
    }

    fn engine_signal(&mut self, context: GpuContext, sync: SyncObject) -> HwResult<()> {
        self.sync_events.push(SyncEvent::EngineSignal(context, sync));
        Ok(())
    }

    fn engine_wait(&mut self, context: GpuContext, sync: SyncObject) -> HwResult<()> {
        self.sync_events.push(SyncEvent::EngineWait(context, sync));
        Ok(())
    }

    fn resource_wait(&mut self, context: GpuContext, resource: &GpuResource) -> HwResult<()> {
        self.sync_events
            .push(SyncEvent::ResourceWait(context, resource.id));
        Ok(())
    }

    fn resource_signal(&mut self, context: GpuContext, resource: &GpuResource) -> HwResult<()> {
        self.sync_events
            .push(SyncEvent::ResourceSignal(context, resource.id));
        Ok(())
    }

    fn query_status(&mut self, feedback_number: u32) -> HwResult<CodecStatus> {
        if let Some(status) = self.status_overrides.get(&feedback_number) {
            return Ok(*status);
        }

        Ok(if self.completed_frames.contains(&feedback_number) {
            CodecStatus::Complete
        } else {
            CodecStatus::Incomplete
        })
    }

    fn frame_crc(&mut self, surface: &Surface) -> HwResult<u32> {
        let data = self
            .contents(&surface.resource)
            .ok_or_else(|| anyhow!("unknown surface {}", surface.resource.name))?;
        Ok(crc32fast::hash(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_init() {
        let mut backend = Backend::new();

        let zeroed = backend.allocate(16, "Zeroed", AllocInit::Zeroed).unwrap();
        let filled = backend.allocate(16, "Filled", AllocInit::Fill(0xff)).unwrap();
        let raw = backend
            .allocate(16, "Raw", AllocInit::Uninitialized)
            .unwrap();

        assert_eq!(backend.contents(&zeroed), Some(&[0u8; 16][..]));
        assert_eq!(backend.contents(&filled), Some(&[0xffu8; 16][..]));
        assert_eq!(backend.contents(&raw), Some(&[UNINITIALIZED_PATTERN; 16][..]));
        assert_eq!(backend.live_buffers(), 3);

        backend.free(&raw);
        assert_eq!(backend.live_buffers(), 2);
        assert_eq!(backend.contents(&raw), None);
    }

    #[test]
    fn allocation_failure() {
        let mut backend = Backend::new();
        backend.fail_allocation = Some("Broken");

        assert!(backend.allocate(16, "Fine", AllocInit::Zeroed).is_ok());
        assert!(matches!(
            backend.allocate(16, "Broken", AllocInit::Zeroed),
            Err(HwError::AllocationFailed { name }) if name == "Broken"
        ));
    }

    #[test]
    fn lock_unmaps_on_drop() {
        let mut backend = Backend::new();
        let res = backend.allocate(4, "Buffer", AllocInit::Zeroed).unwrap();

        {
            let mut mapping = backend.lock(&res, LockMode::WriteOnly).unwrap();
            mapping.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        }

        assert_eq!(backend.mapped_buffers(), 0);
        assert_eq!(backend.contents(&res), Some(&[1u8, 2, 3, 4][..]));

        backend.fail_lock = true;
        assert!(matches!(
            backend.lock(&res, LockMode::ReadOnly),
            Err(HwError::LockFailed { .. })
        ));
    }

    #[test]
    fn firmware_copy_runs_on_submit() {
        let mut backend = Backend::new();
        let src = backend.allocate(8, "Src", AllocInit::Fill(7)).unwrap();
        let dst = backend.allocate(8, "Dst", AllocInit::Zeroed).unwrap();

        let mut cmd_buffer = backend.get_command_buffer(GpuContext::Video).unwrap();
        backend
            .firmware_copy(&mut cmd_buffer, &src, &dst, 4, 0, 2)
            .unwrap();
        backend.return_command_buffer(cmd_buffer);

        assert_eq!(backend.contents(&dst), Some(&[0u8; 8][..]));

        backend.submit_command_buffer(GpuContext::Video).unwrap();
        assert_eq!(backend.contents(&dst), Some(&[0u8, 0, 7, 7, 7, 7, 0, 0][..]));
        assert_eq!(
            backend.sync_events,
            vec![SyncEvent::Submit(GpuContext::Video)]
        );
    }

    #[test]
    fn firmware_copy_out_of_range() {
        let mut backend = Backend::new();
        let src = backend.allocate(8, "Src", AllocInit::Zeroed).unwrap();
        let dst = backend.allocate(4, "Dst", AllocInit::Zeroed).unwrap();

        let mut cmd_buffer = backend.get_command_buffer(GpuContext::Video).unwrap();
        backend
            .firmware_copy(&mut cmd_buffer, &src, &dst, 8, 0, 0)
            .unwrap();
        backend.return_command_buffer(cmd_buffer);

        assert!(backend.submit_command_buffer(GpuContext::Video).is_err());
    }

    #[test]
    fn verify_failures() {
        let mut backend = Backend::new();
        backend.verify_failures = 1;

        assert!(matches!(
            backend.verify_command_buffer_size(GpuContext::Video, 64),
            Err(HwError::NoSpace)
        ));
        assert!(backend
            .verify_command_buffer_size(GpuContext::Video, 64)
            .is_ok());
    }
}

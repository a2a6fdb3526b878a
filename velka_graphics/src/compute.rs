//! Compute dispatch context: a single command buffer submitted synchronously
//! on the background queue, with hazard-driven barriers between dispatches.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;

use crate::{
    buffer::Buffer,
    command::CommandBufferSet,
    engine::{DestructObject, EngineShared, MAX_BOUND_USF},
    pipeline::ComputePipeline,
    types::{BufferUsage, Hazard, QueueId, UpdateMode},
    uniform::{UniformAttachment, UniformSet},
};

pub(crate) fn group_count(count: u32, local_size: u32) -> u32 {
    debug_assert!(count > 0);
    debug_assert!(local_size > 0);
    (count + local_size - 1) / local_size
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DispatchBarrier {
    /// No dependency on prior dispatches.
    None,
    /// Shader writes must be visible to subsequent shader reads.
    Memory,
    /// Execution-only ordering, no access masks.
    Execution,
}

/// See "Compute to Compute Dependencies" in the Khronos synchronization
/// examples: a write-after-read hazard needs only an execution dependency.
pub(crate) fn dispatch_barrier(hazard: Hazard) -> DispatchBarrier {
    match hazard {
        Hazard::None => DispatchBarrier::None,
        Hazard::ReadAfterWrite | Hazard::Any => DispatchBarrier::Memory,
        Hazard::WriteAfterRead => DispatchBarrier::Execution,
    }
}

pub struct Compute {
    engine: Arc<EngineShared>,
    bound: Mutex<Option<Arc<ComputePipeline>>>,
    commands: CommandBufferSet,
    fence: vk::Fence,
}

impl Compute {
    pub(crate) fn new(engine: Arc<EngineShared>) -> Result<Arc<Compute>> {
        let commands = CommandBufferSet::new(&engine, 1, false)?;

        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = match unsafe { engine.device().create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(err) => {
                commands.destroy(engine.device());
                return Err(err).context("vkCreateFence failed");
            }
        };

        Ok(Arc::new(Compute {
            engine,
            bound: Mutex::new(None),
            commands,
            fence,
        }))
    }

    pub fn update_mode(&self) -> UpdateMode {
        UpdateMode::Synchronous
    }

    fn command_buffer(&self) -> vk::CommandBuffer {
        self.commands.get(0)
    }

    pub fn begin(&self) -> bool {
        if self.engine.is_shutdown() {
            log::error!("begin after shutdown");
            return false;
        }

        let cb = self.command_buffer();
        unsafe {
            if self
                .engine
                .device()
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .is_err()
            {
                return false;
            }

            let begin_info = vk::CommandBufferBeginInfo::default();
            self.engine
                .device()
                .begin_command_buffer(cb, &begin_info)
                .is_ok()
        }
    }

    /// Submit on the background queue and wait for completion.
    pub fn end(&self) {
        let cb = self.command_buffer();
        unsafe {
            let _ = self.engine.device().end_command_buffer(cb);
            let _ = self
                .engine
                .device()
                .reset_fences(std::slice::from_ref(&self.fence));
        }

        if !self
            .engine
            .queue_submit(QueueId::Background, cb, &[], &[], None, self.fence)
        {
            log::warn!("compute submit failed");
            return;
        }

        let waited = unsafe {
            self.engine
                .device()
                .wait_for_fences(std::slice::from_ref(&self.fence), true, u64::MAX)
        };
        if waited.is_err() {
            log::warn!("vkWaitForFences failed");
            self.engine.queue_wait_idle(QueueId::Background);
        }

        *self.bound.lock() = None;
    }

    fn check_update(buffer: &Buffer) -> bool {
        if !matches!(
            buffer.usage(),
            BufferUsage::Uniform | BufferUsage::Storage
        ) {
            log::warn!("invalid usage {:?}", buffer.usage());
            return false;
        }
        if buffer.update_mode() != UpdateMode::Synchronous {
            log::warn!("invalid update mode {:?}", buffer.update_mode());
            return false;
        }
        true
    }

    pub fn write_buffer(
        &self,
        buffer: &Arc<Buffer>,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        debug_assert!(Self::check_update(buffer));
        debug_assert!(offset + data.len() <= buffer.size());

        if buffer.usage() == BufferUsage::Storage {
            if !self
                .engine
                .xfer
                .write_storage(&self.engine, buffer, data.len(), offset, data)
            {
                return Err(anyhow::anyhow!("storage write failed"));
            }
        } else {
            buffer.write_memory(0, offset, data);
        }
        Ok(())
    }

    pub fn read_buffer(
        &self,
        buffer: &Arc<Buffer>,
        offset: usize,
        data: &mut [u8],
    ) -> Result<()> {
        debug_assert!(Self::check_update(buffer));
        debug_assert!(offset + data.len() <= buffer.size());

        if buffer.usage() == BufferUsage::Storage {
            if !self
                .engine
                .xfer
                .read_storage(&self.engine, buffer, data.len(), offset, data)
            {
                return Err(anyhow::anyhow!("storage read failed"));
            }
        } else {
            buffer.read_memory(0, offset, data);
        }
        Ok(())
    }

    /// Re-bind `*Ref` buffer attachments. Compute sets are not replicated,
    /// so slot zero is always the one written.
    pub fn update_uniform_set_refs(&self, us: &Arc<UniformSet>, ua_array: &[UniformAttachment]) {
        us.update_refs(0, ua_array);
    }

    pub fn bind_compute_pipeline(&self, cp: &Arc<ComputePipeline>) {
        let cb = self.command_buffer();
        unsafe {
            self.engine.device().cmd_bind_pipeline(
                cb,
                vk::PipelineBindPoint::COMPUTE,
                cp.handle,
            );
        }
        *self.bound.lock() = Some(cp.clone());
    }

    pub fn bind_uniform_sets(&self, us_array: &[&Arc<UniformSet>]) {
        let bound = self.bound.lock().clone();
        let cp = match bound {
            Some(cp) => cp,
            None => {
                log::warn!("bind_uniform_sets without a bound pipeline");
                return;
            }
        };

        if us_array.is_empty() || us_array.len() > MAX_BOUND_USF {
            log::error!("invalid uniform set count {}", us_array.len());
            return;
        }

        let descriptor_sets = us_array
            .iter()
            .map(|us| us.descriptor_set(0))
            .collect::<Vec<_>>();

        let first = us_array[0].set_index();
        let cb = self.command_buffer();
        unsafe {
            self.engine.device().cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::COMPUTE,
                cp.pipeline_layout.handle,
                first,
                &descriptor_sets,
                &[],
            );
        }
    }

    /// Insert the hazard's barrier and dispatch
    /// `ceil(count / local_size)` workgroups per axis.
    pub fn dispatch(
        &self,
        hazard: Hazard,
        count_x: u32,
        count_y: u32,
        count_z: u32,
        local_size_x: u32,
        local_size_y: u32,
        local_size_z: u32,
    ) {
        let cb = self.command_buffer();
        let stage = vk::PipelineStageFlags::COMPUTE_SHADER;

        match dispatch_barrier(hazard) {
            DispatchBarrier::None => {}
            DispatchBarrier::Memory => {
                let barrier = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ);
                unsafe {
                    self.engine.device().cmd_pipeline_barrier(
                        cb,
                        stage,
                        stage,
                        vk::DependencyFlags::empty(),
                        std::slice::from_ref(&barrier),
                        &[],
                        &[],
                    );
                }
            }
            DispatchBarrier::Execution => unsafe {
                self.engine.device().cmd_pipeline_barrier(
                    cb,
                    stage,
                    stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[],
                );
            },
        }

        unsafe {
            self.engine.device().cmd_dispatch(
                cb,
                group_count(count_x, local_size_x),
                group_count(count_y, local_size_y),
                group_count(count_z, local_size_z),
            );
        }
    }
}

impl Drop for Compute {
    fn drop(&mut self) {
        let commands = std::mem::replace(&mut self.commands, CommandBufferSet::empty());
        self.engine.delete_object(DestructObject::Compute {
            fence: self.fence,
            commands,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_counts_round_up() {
        assert_eq!(group_count(1, 1), 1);
        assert_eq!(group_count(1024, 64), 16);
        assert_eq!(group_count(1025, 64), 17);
        assert_eq!(group_count(63, 64), 1);
    }

    #[test]
    fn hazard_selects_barrier() {
        assert_eq!(dispatch_barrier(Hazard::None), DispatchBarrier::None);
        assert_eq!(
            dispatch_barrier(Hazard::ReadAfterWrite),
            DispatchBarrier::Memory
        );
        assert_eq!(dispatch_barrier(Hazard::Any), DispatchBarrier::Memory);
        assert_eq!(
            dispatch_barrier(Hazard::WriteAfterRead),
            DispatchBarrier::Execution
        );
    }
}

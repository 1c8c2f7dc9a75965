//! One-time command submission.
//!
//! Every stage of a scene build records its commands into the same reusable command buffer,
//! submits it and blocks on a fence before returning. Nothing recorded here is ever in flight
//! when control returns to the caller.

use ash::{prelude::VkResult, vk};

pub struct OneShotEncoder {
    device: ash::Device,
    queue: vk::Queue,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl Drop for OneShotEncoder {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

impl OneShotEncoder {
    pub fn new(device: ash::Device, queue_family_index: u32, queue: vk::Queue) -> VkResult<Self> {
        unsafe {
            let pool = device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    flags: vk::CommandPoolCreateFlags::TRANSIENT
                        | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                    queue_family_index,
                    ..Default::default()
                },
                None,
            )?;
            let buffer = match device.allocate_command_buffers(&vk::CommandBufferAllocateInfo {
                command_pool: pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
                ..Default::default()
            }) {
                Ok(buffers) => buffers[0],
                Err(err) => {
                    device.destroy_command_pool(pool, None);
                    return Err(err);
                }
            };
            let fence = match device.create_fence(&vk::FenceCreateInfo::default(), None) {
                Ok(fence) => fence,
                Err(err) => {
                    device.destroy_command_pool(pool, None);
                    return Err(err);
                }
            };
            Ok(Self {
                device,
                queue,
                pool,
                buffer,
                fence,
            })
        }
    }

    /// Records commands with `record`, submits them and waits until they retire.
    pub fn submit_and_wait(&mut self, record: impl FnOnce(vk::CommandBuffer)) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(
                self.buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )?;
            record(self.buffer);
            self.device.end_command_buffer(self.buffer)?;

            self.device.queue_submit2(
                self.queue,
                &[vk::SubmitInfo2::default().command_buffer_infos(&[
                    vk::CommandBufferSubmitInfo {
                        command_buffer: self.buffer,
                        ..Default::default()
                    },
                ])],
                self.fence,
            )?;
            self.device.wait_for_fences(&[self.fence], true, !0)?;
            self.device.reset_fences(&[self.fence])?;
        }
        Ok(())
    }
}

/// Records a global memory barrier.
pub fn memory_barrier(
    device: &ash::Device,
    buffer: vk::CommandBuffer,
    src_stage_mask: vk::PipelineStageFlags2,
    src_access_mask: vk::AccessFlags2,
    dst_stage_mask: vk::PipelineStageFlags2,
    dst_access_mask: vk::AccessFlags2,
) {
    unsafe {
        device.cmd_pipeline_barrier2(
            buffer,
            &vk::DependencyInfo::default().memory_barriers(&[vk::MemoryBarrier2 {
                src_stage_mask,
                src_access_mask,
                dst_stage_mask,
                dst_access_mask,
                ..Default::default()
            }]),
        );
    }
}

// Immediate command submission
//
// A synchronous single-use channel to the graphics queue, used outside the
// frame loop for staging uploads and one-shot layout priming. Owns one
// scratch command buffer and one fence; callers are serialized by the
// blocking wait, so it must not be shared across threads.

use anyhow::{Context, Result};
use ash::vk;

use super::RenderDevice;

/// Uploads are small; a hung queue should surface as an error, not a hang.
const SUBMIT_TIMEOUT_NS: u64 = 10_000_000_000;

pub struct ImmediateExecutor {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl ImmediateExecutor {
    pub fn new(device: &RenderDevice) -> Result<Self> {
        let fence_info = vk::FenceCreateInfo::default();
        let fence = unsafe { device.device.create_fence(&fence_info, None) }
            .context("Failed to create immediate submit fence")?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = match unsafe { device.device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.device.destroy_fence(fence, None) };
                return Err(e).context("Failed to create immediate command pool");
            }
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe {
                    device.device.destroy_command_pool(command_pool, None);
                    device.device.destroy_fence(fence, None);
                }
                return Err(e).context("Failed to allocate immediate command buffer");
            }
        };

        Ok(Self {
            command_pool,
            command_buffer,
            fence,
        })
    }

    /// Record `record` into the scratch buffer, submit it, and block until
    /// the GPU has finished executing it.
    pub fn submit(
        &self,
        device: &RenderDevice,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<()> {
        let cmd = self.command_buffer;

        unsafe {
            device.device.reset_fences(&[self.fence])?;
            device
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.device.begin_command_buffer(cmd, &begin_info)?;

            record(&device.device, cmd);

            device.device.end_command_buffer(cmd)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

            device
                .device
                .queue_submit(device.graphics_queue, &[submit_info], self.fence)
                .context("Failed to submit immediate commands")?;

            device
                .device
                .wait_for_fences(&[self.fence], true, SUBMIT_TIMEOUT_NS)
                .context("Timed out waiting for immediate submit")?;
        }

        Ok(())
    }

    pub fn destroy(&mut self, device: &RenderDevice) {
        unsafe {
            device.device.destroy_command_pool(self.command_pool, None);
            device.device.destroy_fence(self.fence, None);
        }
    }
}

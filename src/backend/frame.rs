// Per-frame command and synchronization state
//
// A fixed ring of frame slots bounds how far the CPU can record ahead of
// the GPU: slot i cannot be rerecorded until its previous submission's
// fence has signaled. The wait and the fence reset are split across two
// guard types so recording is unreachable without the wait having
// happened, and an aborted frame never resets a fence it will not submit.

use anyhow::{Context, Result};
use ash::vk;

use super::RenderDevice;

/// How many frames the CPU may be ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Bounded wait on a slot's completion fence. Hitting this is fatal, not
/// a retry point: it means the GPU stopped consuming work.
const FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

/// One reusable bundle of command recording and synchronization state.
struct FrameSlot {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    /// Signaled by acquire, waited on by this slot's submit.
    image_available: vk::Semaphore,
    /// Signaled by this slot's submit, waited on before the slot is reused.
    complete_fence: vk::Fence,
}

pub struct FrameRing {
    slots: Vec<FrameSlot>,
}

impl FrameRing {
    pub fn new(device: &RenderDevice) -> Result<Self> {
        let mut ring = Self {
            slots: Vec::with_capacity(FRAMES_IN_FLIGHT),
        };

        for _ in 0..FRAMES_IN_FLIGHT {
            match Self::create_slot(device) {
                Ok(slot) => ring.slots.push(slot),
                Err(e) => {
                    ring.destroy(device);
                    return Err(e);
                }
            }
        }

        Ok(ring)
    }

    fn create_slot(device: &RenderDevice) -> Result<FrameSlot> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create frame command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(e).context("Failed to allocate frame command buffer");
            }
        };

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let image_available = match unsafe { device.device.create_semaphore(&semaphore_info, None) }
        {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(e).context("Failed to create image-available semaphore");
            }
        };

        // Signaled so the first wait on a fresh slot passes immediately
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let complete_fence = match unsafe { device.device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe {
                    device.device.destroy_semaphore(image_available, None);
                    device.device.destroy_command_pool(command_pool, None);
                }
                return Err(e).context("Failed to create frame completion fence");
            }
        };

        Ok(FrameSlot {
            command_pool,
            command_buffer,
            image_available,
            complete_fence,
        })
    }

    /// Map a frame number onto its slot.
    pub fn slot_index(frame_number: u64) -> usize {
        (frame_number % FRAMES_IN_FLIGHT as u64) as usize
    }

    /// Block (bounded) until the slot for `frame_number` has finished its
    /// previous GPU work. The returned guard is the only path to recording.
    ///
    /// The fence is not reset here: a frame aborted after this wait (stale
    /// surface) leaves the fence signaled, so the next wait on the slot
    /// cannot deadlock.
    pub fn wait_slot<'a>(
        &'a self,
        device: &RenderDevice,
        frame_number: u64,
    ) -> Result<SlotReady<'a>> {
        let slot = &self.slots[Self::slot_index(frame_number)];

        unsafe {
            device
                .device
                .wait_for_fences(&[slot.complete_fence], true, FENCE_TIMEOUT_NS)
                .context("Timed out waiting for frame completion fence")?;
        }

        Ok(SlotReady { slot })
    }

    /// Destroy all slots. Callers must have ensured no slot is in flight.
    pub fn destroy(&mut self, device: &RenderDevice) {
        unsafe {
            for slot in self.slots.drain(..) {
                device.device.destroy_command_pool(slot.command_pool, None);
                device.device.destroy_semaphore(slot.image_available, None);
                device.device.destroy_fence(slot.complete_fence, None);
            }
        }
    }
}

/// Proof that the slot's completion fence was observed signaled.
pub struct SlotReady<'a> {
    slot: &'a FrameSlot,
}

impl<'a> SlotReady<'a> {
    /// Semaphore for the image acquire that precedes recording.
    pub fn image_available(&self) -> vk::Semaphore {
        self.slot.image_available
    }

    /// Reset the fence and the command buffer and begin recording.
    ///
    /// Consumes the wait proof: a command buffer can only be (re)recorded
    /// through the guard this returns.
    pub fn begin_recording(self, device: &RenderDevice) -> Result<FrameRecording<'a>> {
        unsafe {
            device.device.reset_fences(&[self.slot.complete_fence])?;
            device.device.reset_command_buffer(
                self.slot.command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )?;

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .device
                .begin_command_buffer(self.slot.command_buffer, &begin_info)?;
        }

        Ok(FrameRecording { slot: self.slot })
    }
}

/// An open command buffer for one frame, plus the synchronization handles
/// its submission must use.
pub struct FrameRecording<'a> {
    slot: &'a FrameSlot,
}

impl FrameRecording<'_> {
    pub fn cmd(&self) -> vk::CommandBuffer {
        self.slot.command_buffer
    }

    pub fn image_available(&self) -> vk::Semaphore {
        self.slot.image_available
    }

    pub fn complete_fence(&self) -> vk::Fence {
        self.slot.complete_fence
    }

    /// End recording. The buffer is ready for queue submission.
    pub fn end(&self, device: &RenderDevice) -> Result<()> {
        unsafe { device.device.end_command_buffer(self.slot.command_buffer) }?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_least_double_buffered() {
        assert!(FRAMES_IN_FLIGHT >= 2);
    }

    #[test]
    fn slot_index_round_robins() {
        let k = FRAMES_IN_FLIGHT as u64;
        for frame in 0..16u64 {
            assert_eq!(FrameRing::slot_index(frame), (frame % k) as usize);
        }
    }

    #[test]
    fn consecutive_frames_use_distinct_slots() {
        for frame in 0..8u64 {
            assert_ne!(
                FrameRing::slot_index(frame),
                FrameRing::slot_index(frame + 1)
            );
        }
    }

    #[test]
    fn slot_reuse_period_is_ring_size() {
        for frame in 0..8u64 {
            assert_eq!(
                FrameRing::slot_index(frame),
                FrameRing::slot_index(frame + FRAMES_IN_FLIGHT as u64)
            );
        }
    }
}

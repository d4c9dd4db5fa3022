// SPDX-License-Identifier: CEPL-1.0
use anyhow::{ensure, Context, Result};
use ash::vk;
use std::mem::size_of;
use std::time::Duration;
use volcanic_math::FrameTransforms;

use crate::device::DeviceContext;
use crate::error::VkError;
use crate::memory::GpuBuffer;

/// Which frame slot last submitted work for each swapchain image.
///
/// Images can be acquired out of order, so waiting on the current slot's
/// fence alone does not prove the acquired image is idle.
#[derive(Clone, Debug)]
pub struct FrameTracker {
    frames_in_flight: usize,
    current: usize,
    images_in_flight: Vec<Option<usize>>,
}

impl FrameTracker {
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current: 0,
            images_in_flight: vec![None; image_count],
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Record that the current slot now owns `image`. Returns the other slot
    /// whose fence must be waited on first, if any.
    pub fn claim_image(&mut self, image: usize) -> Option<usize> {
        if image >= self.images_in_flight.len() {
            self.images_in_flight.resize(image + 1, None);
        }
        let previous = self.images_in_flight[image].replace(self.current);
        previous.filter(|&slot| slot != self.current)
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames_in_flight;
    }

    /// Forget all owners; the swapchain images were replaced.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight = vec![None; image_count];
    }
}

/// Per-slot sync objects, command buffer and uniform buffer.
pub struct FrameSlot {
    device: ash::Device,
    pub(crate) image_available: vk::Semaphore,
    pub(crate) render_finished: vk::Semaphore,
    pub(crate) in_flight: vk::Fence,
    /// Freed with the owning pool.
    pub(crate) cmd: vk::CommandBuffer,
    pub(crate) uniform: GpuBuffer,
}

impl FrameSlot {
    fn new(dev: &DeviceContext, cmd: vk::CommandBuffer) -> Result<Self> {
        let uniform = GpuBuffer::host_visible(
            dev,
            size_of::<FrameTransforms>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )
        .context("frame uniform buffer")?;
        let device = &dev.device;
        let mut slot = Self {
            device: device.clone(),
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight: vk::Fence::null(),
            cmd,
            uniform,
        };
        let sem_info = vk::SemaphoreCreateInfo::default();
        // Signaled so the very first wait on this slot returns at once.
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        unsafe {
            slot.image_available = device
                .create_semaphore(&sem_info, None)
                .context("create_semaphore(image_available)")?;
            slot.render_finished = device
                .create_semaphore(&sem_info, None)
                .context("create_semaphore(render_finished)")?;
            slot.in_flight = device
                .create_fence(&fence_info, None)
                .context("create_fence(in_flight)")?;
        }
        Ok(slot)
    }

    pub fn write_transforms(&self, t: &FrameTransforms) -> Result<()> {
        self.uniform.write_bytes(0, t.as_bytes())
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.in_flight, None);
            self.device.destroy_semaphore(self.render_finished, None);
            self.device.destroy_semaphore(self.image_available, None);
        }
    }
}

/// F frame slots cycled round-robin, plus per-image ownership tracking.
pub struct FrameSynchronizer {
    device: ash::Device,
    pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    tracker: FrameTracker,
    timeout_ns: u64,
}

impl FrameSynchronizer {
    pub fn new(
        dev: &DeviceContext,
        frames_in_flight: usize,
        image_count: usize,
        timeout: Duration,
    ) -> Result<Self> {
        ensure!(frames_in_flight >= 1, "at least one frame in flight is required");
        let family = dev
            .indices
            .graphics
            .context("frame synchronizer needs a graphics family")?;
        let device = &dev.device;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("create_command_pool(frames)")?;
        let mut sync = Self {
            device: device.clone(),
            pool,
            slots: Vec::with_capacity(frames_in_flight),
            tracker: FrameTracker::new(frames_in_flight, image_count),
            timeout_ns: timeout.as_nanos().min(u64::MAX as u128) as u64,
        };

        let alloc = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);
        let cmds = unsafe { device.allocate_command_buffers(&alloc) }
            .context("allocate_command_buffers(frames)")?;
        for cmd in cmds {
            sync.slots.push(FrameSlot::new(dev, cmd)?);
        }
        Ok(sync)
    }

    pub fn timeout_ns(&self) -> u64 {
        self.timeout_ns
    }

    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.tracker.current()]
    }

    pub fn current_index(&self) -> usize {
        self.tracker.current()
    }

    pub fn uniform_buffers(&self) -> Vec<vk::Buffer> {
        self.slots.iter().map(|s| s.uniform.handle()).collect()
    }

    /// Step 1: wait for the slot's previous submission. `Ok(false)` on timeout.
    pub fn wait_current(&self) -> Result<bool> {
        let fence = self.current_slot().in_flight;
        match unsafe { self.device.wait_for_fences(&[fence], true, self.timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e).context("wait_for_fences(in_flight)"),
        }
    }

    /// Step 3: make sure no other slot is still rendering into `image`.
    /// An image is already acquired at this point, so a timeout is fatal.
    pub fn claim_image(&mut self, image: usize) -> Result<()> {
        if let Some(other) = self.tracker.claim_image(image) {
            let fence = self.slots[other].in_flight;
            match unsafe { self.device.wait_for_fences(&[fence], true, self.timeout_ns) } {
                Ok(()) => {}
                Err(vk::Result::TIMEOUT) => {
                    return Err(VkError::Timeout("swapchain image fence").into())
                }
                Err(e) => return Err(e).context("wait_for_fences(image in flight)"),
            }
        }
        Ok(())
    }

    /// Step 5: reset the slot's command buffer and open it for recording.
    pub fn begin_recording(&self) -> Result<vk::CommandBuffer> {
        let cmd = self.current_slot().cmd;
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("reset_command_buffer")?;
            self.device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
                .context("begin_command_buffer")?;
        }
        Ok(cmd)
    }

    /// Step 6: reset the fence only now that a submit is certain, then submit.
    pub fn submit(&self, queue: vk::Queue, cmd: vk::CommandBuffer) -> Result<()> {
        let slot = self.current_slot();
        let waits = [slot.image_available];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cmds = [cmd];
        let signals = [slot.render_finished];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signals);
        unsafe {
            self.device
                .reset_fences(&[slot.in_flight])
                .context("reset_fences")?;
            self.device
                .queue_submit(queue, &[submit], slot.in_flight)
                .context("queue_submit")?;
        }
        Ok(())
    }

    pub fn advance(&mut self) {
        self.tracker.advance();
    }

    pub fn reset_images(&mut self, image_count: usize) {
        self.tracker.reset_images(image_count);
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        unsafe {
            // Command buffers go with the pool; slots drop their sync objects after.
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_cycle_round_robin() {
        let mut t = FrameTracker::new(2, 3);
        let seen: Vec<usize> = (0..5)
            .map(|_| {
                let c = t.current();
                t.advance();
                c
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn claim_reports_only_other_slots() {
        let mut t = FrameTracker::new(2, 3);
        assert_eq!(t.claim_image(1), None);
        // same slot, same image: its own fence was already waited on
        assert_eq!(t.claim_image(1), None);
        t.advance();
        assert_eq!(t.claim_image(1), Some(0));
        assert_eq!(t.claim_image(2), None);
    }

    #[test]
    fn reset_forgets_owners() {
        let mut t = FrameTracker::new(2, 2);
        t.claim_image(0);
        t.advance();
        t.reset_images(3);
        assert_eq!(t.claim_image(0), None);
        assert_eq!(t.claim_image(2), None);
    }

    #[test]
    fn zero_frames_is_clamped_to_one() {
        let mut t = FrameTracker::new(0, 2);
        assert_eq!(t.frames_in_flight(), 1);
        t.advance();
        assert_eq!(t.current(), 0);
    }

    /// Drives the tracker against a fake GPU where every submission stays
    /// pending until its fence is explicitly waited on.
    fn simulate(frames: usize, image_count: usize, acquires: &[usize]) {
        let mut t = FrameTracker::new(frames, image_count);
        // pending[slot] = image that slot's unfinished submission renders to
        let mut pending: Vec<Option<usize>> = vec![None; frames];
        for &image in acquires {
            let slot = t.current();
            pending[slot] = None; // step 1
            if let Some(other) = t.claim_image(image) {
                pending[other] = None; // step 3
            }
            assert!(
                pending.iter().all(|p| *p != Some(image)),
                "image {image} still being rendered by another slot"
            );
            pending[slot] = Some(image); // step 6
            assert!(pending.iter().flatten().count() <= frames);
            t.advance();
        }
    }

    #[test]
    fn out_of_order_acquires_never_overlap() {
        simulate(2, 3, &[0, 1, 2, 0, 0, 1, 2, 2, 1, 0, 2, 1]);
        simulate(3, 2, &[0, 1, 1, 0, 0, 1, 0, 1]);
        simulate(2, 4, &[3, 2, 1, 0, 3, 3, 2, 0]);
    }
}

// Frame pacing
//
// FRAME CYCLE (per buffering slot):
//   wait fence -> reset fence -> acquire image -> reset + begin commands
//   -> caller records -> end commands -> submit -> present -> advance slot
//
// A slot is only reused after the fence of its previous submission signaled,
// so the CPU records at most `N - 1` frames ahead of GPU completion.

use anyhow::Context;
use ash::vk;
use std::sync::Arc;

use super::context::GraphicsContext;
use super::device::VulkanDevice;
use super::sync::FrameSlot;

/// Frames the CPU may have in flight
pub const BUFFERING_DEPTH: usize = 2;

/// Failures of the per-frame path
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Timed out waiting for the frame fence")]
    FenceTimeout,

    #[error("Timed out acquiring a swapchain image")]
    AcquireTimeout,

    /// The surface changed and the swapchain no longer matches it
    #[error("Swapchain is out of date")]
    OutOfDate,

    #[error("Device lost")]
    DeviceLost,

    #[error("Frame scheduler misuse: {0}")]
    InvalidState(&'static str),

    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for FrameError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::OutOfDate,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::Vulkan(other),
        }
    }
}

/// Fixed ring of `N` slots indexed by `frame_count % N`, remembering which
/// frame each slot last submitted.
///
/// A ring needs at least one slot; `N == 0` does not compile:
///
/// ```compile_fail
/// use paced_renderer::backend::frame::FrameRing;
///
/// let ring: FrameRing<u8, 0> = FrameRing::new([]);
/// ```
pub struct FrameRing<T, const N: usize> {
    slots: [T; N],
    pending: [Option<u64>; N],
    frame_count: u64,
}

impl<T, const N: usize> FrameRing<T, N> {
    const NON_EMPTY: () = assert!(N > 0, "FrameRing needs at least one slot");

    pub fn new(slots: [T; N]) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_EMPTY;
        Self {
            slots,
            pending: [None; N],
            frame_count: 0,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn slot_index(&self) -> usize {
        (self.frame_count % N as u64) as usize
    }

    pub fn current(&self) -> &T {
        &self.slots[self.slot_index()]
    }

    pub fn slots(&self) -> &[T] {
        &self.slots
    }

    /// The current slot's fence has signaled: forget its pending frame and
    /// return it
    pub fn retire_current(&mut self) -> Option<u64> {
        let index = self.slot_index();
        self.pending[index].take()
    }

    pub fn mark_submitted(&mut self) {
        let index = self.slot_index();
        self.pending[index] = Some(self.frame_count);
    }

    pub fn advance(&mut self) {
        self.frame_count += 1;
    }

    /// Submissions not yet observed complete
    pub fn in_flight(&self) -> usize {
        self.pending.iter().filter(|p| p.is_some()).count()
    }
}

/// Source of presentable images for the scheduler. `Swapchain` is the one
/// used for on-screen rendering.
pub trait PresentChain {
    /// Start acquiring an image; `signal` is signaled once it is ready.
    /// Returns the image index and whether the chain is suboptimal.
    fn acquire_next_image(
        &self,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result>;

    /// Queue `image_index` for presentation after `wait_semaphores`.
    /// Returns whether the chain is suboptimal.
    fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool, vk::Result>;
}

/// What the caller records into between `begin_frame` and `end_frame`
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub image_index: u32,
    pub slot_index: usize,
    pub command_buffer: vk::CommandBuffer,
    pub frame_number: u64,
}

pub struct FrameScheduler<const N: usize = BUFFERING_DEPTH> {
    ring: FrameRing<FrameSlot, N>,
    // Image index acquired by `begin_frame`, cleared by `end_frame`
    recording: Option<u32>,
    timeout_ns: u64,
    device: Arc<VulkanDevice>,
}

impl<const N: usize> FrameScheduler<N> {
    pub fn new(ctx: &GraphicsContext, timeout_ns: u64) -> anyhow::Result<Self> {
        let slots = (0..N)
            .map(|_| FrameSlot::new(ctx))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let slots: [FrameSlot; N] = slots
            .try_into()
            .ok()
            .context("Failed to build frame slots")?;

        log::info!("Frame scheduler ready ({} slots)", N);

        Ok(Self {
            ring: FrameRing::new(slots),
            recording: None,
            timeout_ns,
            device: Arc::clone(ctx.device()),
        })
    }

    pub const fn buffering_depth(&self) -> usize {
        N
    }

    pub fn frame_count(&self) -> u64 {
        self.ring.frame_count()
    }

    pub fn in_flight(&self) -> usize {
        self.ring.in_flight()
    }

    /// Wait for the current slot, acquire an image and start recording.
    ///
    /// After an error the current slot's fence may already be reset; the
    /// scheduler must not be driven again.
    pub fn begin_frame<C: PresentChain + ?Sized>(
        &mut self,
        chain: &C,
    ) -> Result<FrameContext, FrameError> {
        if self.recording.is_some() {
            return Err(FrameError::InvalidState("begin_frame called twice"));
        }

        let device = &self.device.device;
        let slot = self.ring.current();
        let fence = [slot.render_fence.raw()];

        unsafe { device.wait_for_fences(&fence, true, self.timeout_ns) }.map_err(|e| match e {
            vk::Result::TIMEOUT => FrameError::FenceTimeout,
            other => other.into(),
        })?;

        let image_ready = slot.image_ready.raw();
        let command_buffer = slot.command_buffer;
        if let Some(retired) = self.ring.retire_current() {
            log::trace!("Frame {} retired", retired);
        }

        unsafe { device.reset_fences(&fence) }?;

        let image_index = match chain.acquire_next_image(self.timeout_ns, image_ready) {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Present chain is suboptimal for the surface");
                }
                index
            }
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
                return Err(FrameError::AcquireTimeout)
            }
            Err(e) => return Err(e.into()),
        };

        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(command_buffer, &begin_info)?;
        }

        self.recording = Some(image_index);

        Ok(FrameContext {
            image_index,
            slot_index: self.ring.slot_index(),
            command_buffer,
            frame_number: self.ring.frame_count(),
        })
    }

    /// Finish recording, submit to the graphics queue and present.
    pub fn end_frame<C: PresentChain + ?Sized>(&mut self, chain: &C) -> Result<(), FrameError> {
        let image_index = self
            .recording
            .take()
            .ok_or(FrameError::InvalidState("end_frame called without begin_frame"))?;

        let device = &self.device;
        let slot = self.ring.current();

        unsafe { device.device.end_command_buffer(slot.command_buffer) }?;

        let wait_semaphores = [slot.image_ready.raw()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [slot.command_buffer];
        let signal_semaphores = [slot.render_complete.raw()];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device.device.queue_submit(
                device.graphics_queue,
                &[submit_info.build()],
                slot.render_fence.raw(),
            )
        }?;

        let presented = chain.present(device.present_queue, image_index, &signal_semaphores);

        self.ring.mark_submitted();
        self.ring.advance();

        match presented {
            Ok(true) => log::debug!("Present chain is suboptimal for the surface"),
            Ok(false) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }
}

impl<const N: usize> Drop for FrameScheduler<N> {
    fn drop(&mut self) {
        // Slots may still be referenced by submitted work
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_cycle_modulo_depth() {
        let mut ring = FrameRing::new(['a', 'b']);
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push((ring.slot_index(), *ring.current()));
            ring.advance();
        }
        assert_eq!(seen, vec![(0, 'a'), (1, 'b'), (0, 'a'), (1, 'b'), (0, 'a')]);
        assert_eq!(ring.frame_count(), 5);
    }

    #[test]
    fn cpu_never_runs_more_than_depth_minus_one_frames_ahead() {
        let mut ring: FrameRing<(), BUFFERING_DEPTH> = FrameRing::new([(); BUFFERING_DEPTH]);

        for frame in 0..64u64 {
            // begin_frame: fence wait retires exactly the slot's previous frame
            let retired = ring.retire_current();
            if frame >= BUFFERING_DEPTH as u64 {
                assert_eq!(retired, Some(frame - BUFFERING_DEPTH as u64));
            } else {
                assert_eq!(retired, None);
            }
            assert!(ring.in_flight() <= BUFFERING_DEPTH - 1);

            // end_frame
            ring.mark_submitted();
            ring.advance();
            assert!(ring.in_flight() <= BUFFERING_DEPTH);
        }
    }

    #[test]
    fn single_slot_ring_serializes_frames() {
        let mut ring: FrameRing<(), 1> = FrameRing::new([()]);
        for frame in 0..4u64 {
            assert_eq!(ring.slot_index(), 0);
            assert_eq!(ring.retire_current(), frame.checked_sub(1));
            assert_eq!(ring.in_flight(), 0);
            ring.mark_submitted();
            ring.advance();
        }
    }

    #[test]
    fn deeper_ring_keeps_the_same_bound() {
        let mut ring: FrameRing<u8, 3> = FrameRing::new([0, 1, 2]);
        for frame in 0..10u64 {
            let retired = ring.retire_current();
            assert_eq!(retired, frame.checked_sub(3));
            assert!(ring.in_flight() <= 2);
            ring.mark_submitted();
            ring.advance();
        }
    }

    #[test]
    fn vulkan_results_map_to_frame_errors() {
        assert_eq!(
            FrameError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            FrameError::OutOfDate
        );
        assert_eq!(
            FrameError::from(vk::Result::ERROR_DEVICE_LOST),
            FrameError::DeviceLost
        );
        assert_eq!(
            FrameError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            FrameError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        );
    }
}

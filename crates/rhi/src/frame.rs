//! Frame pacer.
//!
//! Owns the per-slot synchronization objects and command buffers and drives
//! the slot side of the acquire → record → submit → present cycle:
//!
//! ```text
//! Idle ─begin─▶ Acquiring ─▶ Recording ─end─▶ Submitting ─▶ Presenting ─▶ Idle
//! ```
//!
//! Each slot has one fence (created signaled), an image-acquired and a
//! work-complete semaphore, a command pool and one primary command buffer.
//! A slot is only recorded into again after its fence has been observed
//! signaled, which bounds the work in flight to the number of slots.
//!
//! With GPU timing enabled each slot also owns a two-entry timestamp pool.
//! The frame writes the first entry at the top of its first submission and
//! the second at the bottom of its last; the pair is read back without
//! waiting the next time the slot comes around.

use std::time::Duration;

use ash::vk;
use tracing::{debug, error, info, warn};

use crate::error::{RhiError, RhiResult};
use crate::native::{NativeDevice, SubmitDesc};
use crate::slot::{next_slot, SlotTag};
use vkframe_core::FrameTimer;

/// Phase of the frame cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Acquiring,
    Recording,
    Submitting,
    Presenting,
}

/// GPU-side state of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// No unfinished work.
    Idle,
    /// Being recorded on the CPU.
    Recording,
    /// Submitted; the fence has not been observed signaled yet.
    InFlight,
}

/// Synchronization objects and command buffer of one slot.
#[derive(Debug)]
pub struct FrameSlot {
    pub fence: vk::Fence,
    pub image_acquired: vk::Semaphore,
    pub work_complete: vk::Semaphore,
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub state: SlotState,
    /// Frame start and end timestamps.
    pub timestamps: Option<vk::QueryPool>,
    /// Both timestamps went out in submissions that have not been read yet.
    timestamps_pending: bool,
}

/// Round-robin owner of the frame slots.
#[derive(Debug)]
pub struct FramePacer {
    slots: Vec<FrameSlot>,
    current: usize,
    frame_count: u64,
    phase: FramePhase,
    device_lost: bool,
    timeout_ns: u64,
    timer: FrameTimer,
    /// Nanoseconds per timestamp tick.
    timestamp_period: f64,
    gpu_frame_time: Option<Duration>,
}

impl FramePacer {
    /// Creates `frames_in_flight` slots. `gpu_timestamps` gives each slot a
    /// timestamp pool when the device can write timestamps.
    pub fn new<D: NativeDevice + ?Sized>(
        device: &D,
        frames_in_flight: usize,
        timeout_ns: u64,
        gpu_timestamps: bool,
    ) -> RhiResult<Self> {
        let period = if gpu_timestamps {
            let period = device.timestamp_period();
            if period.is_none() {
                warn!("GPU timestamps requested but the queue cannot write them");
            }
            period
        } else {
            None
        };
        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            let command_pool = device.create_command_pool()?;
            slots.push(FrameSlot {
                fence: device.create_fence(true)?,
                image_acquired: device.create_semaphore()?,
                work_complete: device.create_semaphore()?,
                command_pool,
                command_buffer: device
                    .allocate_command_buffer(command_pool, vk::CommandBufferLevel::PRIMARY)?,
                state: SlotState::Idle,
                timestamps: match period {
                    Some(_) => Some(device.create_timestamp_pool(2)?),
                    None => None,
                },
                timestamps_pending: false,
            });
        }
        info!(
            "Frame pacer created with {} frame slots (GPU timestamps {})",
            frames_in_flight,
            if period.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            slots,
            current: 0,
            frame_count: 0,
            phase: FramePhase::Idle,
            device_lost: false,
            timeout_ns,
            timer: FrameTimer::new(),
            timestamp_period: f64::from(period.unwrap_or(0.0)),
            gpu_frame_time: None,
        })
    }

    #[inline]
    pub fn current_slot(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Frames submitted so far.
    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    #[inline]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: FramePhase) {
        self.phase = phase;
    }

    #[inline]
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    /// Tag for work recorded into the current slot.
    #[inline]
    pub fn current_tag(&self) -> SlotTag {
        SlotTag::Slot(self.current)
    }

    #[inline]
    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    /// Latches device loss; every later frame call reports it.
    pub fn mark_device_lost(&mut self) {
        if !self.device_lost {
            error!("Device lost; rendering stops until the backend is recreated");
        }
        self.device_lost = true;
        self.phase = FramePhase::Idle;
    }

    fn note(&mut self, error: RhiError) -> RhiError {
        if matches!(error, RhiError::DeviceLost) {
            self.mark_device_lost();
        }
        error
    }

    /// Blocks until the current slot's previous submission has retired.
    pub fn wait_for_slot<D: NativeDevice + ?Sized>(&mut self, device: &D) -> RhiResult<()> {
        let slot = &self.slots[self.current];
        if slot.state != SlotState::InFlight {
            return Ok(());
        }
        match device.wait_fence(slot.fence, self.timeout_ns) {
            Ok(()) => {
                self.slots[self.current].state = SlotState::Idle;
                Ok(())
            }
            Err(e) => Err(self.note(e)),
        }
    }

    /// Marks every in-flight slot whose fence is signaled as idle.
    pub fn poll<D: NativeDevice + ?Sized>(&mut self, device: &D) -> RhiResult<()> {
        for index in 0..self.slots.len() {
            if self.slots[index].state != SlotState::InFlight {
                continue;
            }
            match device.fence_status(self.slots[index].fence) {
                Ok(true) => self.slots[index].state = SlotState::Idle,
                Ok(false) => {}
                Err(e) => return Err(self.note(e)),
            }
        }
        Ok(())
    }

    /// True when no unfinished work carries `tag`.
    pub fn is_retired(&self, tag: SlotTag) -> bool {
        match tag {
            SlotTag::Untracked => true,
            SlotTag::Slot(index) => self
                .slots
                .get(index)
                .is_none_or(|slot| slot.state != SlotState::InFlight),
            SlotTag::Any => self.slots.iter().all(|s| s.state != SlotState::InFlight),
        }
    }

    /// Resets the current slot's command pool and begins its primary buffer.
    pub fn begin_recording<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
    ) -> RhiResult<vk::CommandBuffer> {
        let slot = &self.slots[self.current];
        let (pool, cb) = (slot.command_pool, slot.command_buffer);
        device
            .reset_command_pool(pool)
            .and_then(|()| device.begin_command_buffer(cb, None))
            .map_err(|e| self.note(e))?;
        self.slots[self.current].state = SlotState::Recording;
        self.phase = FramePhase::Recording;
        Ok(cb)
    }

    /// Ends the current primary buffer and submits it, signaling the slot
    /// fence.
    pub fn submit<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        signal: Option<vk::Semaphore>,
    ) -> RhiResult<()> {
        self.phase = FramePhase::Submitting;
        let slot = &self.slots[self.current];
        let submit = SubmitDesc {
            command_buffer: slot.command_buffer,
            wait,
            signal,
            fence: slot.fence,
        };
        let result = device
            .end_command_buffer(submit.command_buffer)
            .and_then(|()| device.reset_fence(submit.fence))
            .and_then(|()| device.submit(&submit));
        match result {
            Ok(()) => {
                self.slots[self.current].state = SlotState::InFlight;
                Ok(())
            }
            Err(e) => {
                self.slots[self.current].state = SlotState::Idle;
                self.phase = FramePhase::Idle;
                Err(self.note(e))
            }
        }
    }

    /// Timestamp pool of the current slot, if GPU timing is on.
    #[inline]
    pub fn timestamp_pool(&self) -> Option<vk::QueryPool> {
        self.slots[self.current].timestamps
    }

    /// Both timestamps of the current slot went out; read them when the slot
    /// comes around again.
    pub fn mark_timestamps_pending(&mut self) {
        let slot = &mut self.slots[self.current];
        slot.timestamps_pending = slot.timestamps.is_some();
    }

    /// Reads the current slot's timestamps from its previous frame. Never
    /// waits; results that are not available yet are dropped.
    pub fn collect_timestamps<D: NativeDevice + ?Sized>(&mut self, device: &D) -> RhiResult<()> {
        let slot = &self.slots[self.current];
        let Some(pool) = slot.timestamps else {
            return Ok(());
        };
        if !slot.timestamps_pending || slot.state == SlotState::InFlight {
            return Ok(());
        }
        self.slots[self.current].timestamps_pending = false;
        match device.timestamp_results(pool, 2) {
            Ok(Some(ticks)) if ticks.len() == 2 => {
                let elapsed = ticks[1].saturating_sub(ticks[0]) as f64 * self.timestamp_period;
                self.gpu_frame_time = Some(Duration::from_nanos(elapsed as u64));
                Ok(())
            }
            Ok(_) => {
                debug!("Timestamps of slot {} were not available", self.current);
                Ok(())
            }
            Err(e) => Err(self.note(e)),
        }
    }

    /// GPU time between the start and end of the last timed frame.
    pub fn last_gpu_frame_time(&self) -> Option<Duration> {
        self.gpu_frame_time
    }

    /// Rotates to the next slot.
    pub fn advance(&mut self) {
        self.current = next_slot(self.current, self.slots.len());
        self.frame_count += 1;
        self.phase = FramePhase::Idle;
        let dt = self.timer.tick();
        debug!("Frame {} done in {:?}", self.frame_count, dt);
    }

    /// Marks every slot idle. Only valid after a device-idle wait.
    pub fn mark_all_idle(&mut self) {
        for slot in &mut self.slots {
            slot.state = SlotState::Idle;
        }
    }

    pub fn last_frame_time(&self) -> Duration {
        self.timer.last_frame_time()
    }

    pub fn average_frame_time(&self) -> Duration {
        self.timer.average_frame_time()
    }

    /// Destroys every slot's objects. Only valid after a device-idle wait.
    pub fn destroy<D: NativeDevice + ?Sized>(&mut self, device: &D) {
        for slot in self.slots.drain(..) {
            device.free_command_buffer(slot.command_pool, slot.command_buffer);
            device.destroy_command_pool(slot.command_pool);
            device.destroy_semaphore(slot.image_acquired);
            device.destroy_semaphore(slot.work_complete);
            device.destroy_fence(slot.fence);
            if let Some(pool) = slot.timestamps {
                device.destroy_query_pool(pool);
            }
        }
        info!("Frame pacer destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{NativeCommands, NullDevice};

    #[test]
    fn test_rotation() {
        let device = NullDevice::new();
        let mut pacer = FramePacer::new(&device, 3, u64::MAX, false).unwrap();
        for m in 1..=7u64 {
            pacer.wait_for_slot(&device).unwrap();
            pacer.begin_recording(&device).unwrap();
            pacer.submit(&device, None, None).unwrap();
            pacer.advance();
            assert_eq!(pacer.current_slot() as u64, m % 3);
        }
        assert_eq!(pacer.frame_count(), 7);
        pacer.destroy(&device);
    }

    #[test]
    fn test_retirement_tracks_fences() {
        let device = NullDevice::manual();
        let mut pacer = FramePacer::new(&device, 2, 0, false).unwrap();

        pacer.begin_recording(&device).unwrap();
        pacer.submit(&device, None, None).unwrap();
        assert!(!pacer.is_retired(SlotTag::Slot(0)));
        assert!(pacer.is_retired(SlotTag::Slot(1)));
        assert!(!pacer.is_retired(SlotTag::Any));
        assert!(pacer.is_retired(SlotTag::Untracked));

        pacer.poll(&device).unwrap();
        assert!(!pacer.is_retired(SlotTag::Slot(0)));

        device.complete_submissions();
        pacer.poll(&device).unwrap();
        assert!(pacer.is_retired(SlotTag::Slot(0)));
        assert!(pacer.is_retired(SlotTag::Any));
    }

    #[test]
    fn test_wait_times_out_in_manual_mode() {
        let device = NullDevice::manual();
        let mut pacer = FramePacer::new(&device, 1, 1_000, false).unwrap();
        pacer.begin_recording(&device).unwrap();
        pacer.submit(&device, None, None).unwrap();
        pacer.advance();
        assert!(matches!(
            pacer.wait_for_slot(&device),
            Err(RhiError::FenceTimeout)
        ));
        device.complete_submissions();
        pacer.wait_for_slot(&device).unwrap();
    }

    #[test]
    fn test_device_loss_is_sticky() {
        let device = NullDevice::new();
        let mut pacer = FramePacer::new(&device, 2, u64::MAX, false).unwrap();
        device.set_device_lost(true);
        pacer.begin_recording(&device).unwrap_err();
        assert!(pacer.is_device_lost());
        device.set_device_lost(false);
        assert!(pacer.is_device_lost());
    }

    #[test]
    fn test_timestamps_read_when_slot_returns() {
        let device = NullDevice::manual();
        let mut pacer = FramePacer::new(&device, 1, 0, true).unwrap();
        assert_eq!(device.query_pool_count(), 1);

        let cb = pacer.begin_recording(&device).unwrap();
        let pool = pacer.timestamp_pool().unwrap();
        device.cmd_reset_query_pool(cb, pool, 0, 2);
        device.cmd_write_timestamp(cb, vk::PipelineStageFlags::TOP_OF_PIPE, pool, 0);
        device.cmd_dispatch(cb, 8, 8, 1);
        device.cmd_write_timestamp(cb, vk::PipelineStageFlags::BOTTOM_OF_PIPE, pool, 1);
        pacer.submit(&device, None, None).unwrap();
        pacer.mark_timestamps_pending();
        pacer.advance();

        pacer.collect_timestamps(&device).unwrap();
        assert_eq!(pacer.last_gpu_frame_time(), None);

        device.complete_submissions();
        pacer.wait_for_slot(&device).unwrap();
        pacer.collect_timestamps(&device).unwrap();
        assert_eq!(pacer.last_gpu_frame_time(), Some(Duration::from_micros(2)));

        pacer.destroy(&device);
        assert_eq!(device.query_pool_count(), 0);
    }
}

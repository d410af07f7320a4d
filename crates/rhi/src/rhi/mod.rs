//! The backend front end.
//!
//! [`Rhi`] ties the six pieces of the kernel together: the resource store,
//! the binding-set pool allocator, per-pass resource tracking, the deferred
//! command list, the release queue and the frame pacer. Everything is driven
//! from one submitting thread; only secondary command lists obtained from
//! [`Rhi::record_secondary`] may be filled elsewhere.
//!
//! # Frame cycle
//!
//! ```text
//! begin_frame ─▶ resource_update / passes / draws ─▶ end_frame
//!      │                                                 │
//!      └ waits for the slot's fence, flushes releases    └ replays, submits, presents, rotates
//! ```
//!
//! `begin_offscreen_frame`/`end_offscreen_frame` run the same cycle without a
//! swapchain. `finish` drains the GPU, either mid-frame (submitting what has
//! been recorded so far) or between frames.

mod pass;
mod resources;
mod updates;

pub use pass::{PassOptions, PassTarget};

use std::time::Duration;

use ash::vk;
use tracing::{debug, error, info, warn};

use crate::cache::MaterialCache;
use crate::command::{CommandList, ImageRange};
use crate::error::{FrameOpResult, RhiError, RhiResult};
use crate::frame::{FramePacer, FramePhase};
use crate::native::NativeDevice;
use crate::pool::BindingPoolAllocator;
use crate::release::{ReleasePayload, ReleaseQueue};
use crate::resource::SwapChainId;
use crate::slot::SlotTag;
use crate::store::ResourceStore;
use crate::tracker::{tracked_image_barrier, TextureUsageState};
use crate::update::{Readback, ReadbackResult};
use vkframe_core::BackendConfig;

use pass::ActivePass;
use updates::OpenUpdate;

/// What the current frame renders to.
#[derive(Clone, Copy, Debug)]
enum FrameKind {
    Swapchain {
        id: SwapChainId,
        image_index: u32,
        /// Access state of the acquired image.
        image_state: TextureUsageState,
    },
    Offscreen,
}

#[derive(Debug)]
struct ActiveFrame {
    kind: FrameKind,
    /// The image-acquired semaphore has not been waited on by a submission
    /// yet.
    acquire_pending: bool,
    /// The primary buffer went out mid-frame; it is begun again once the
    /// slot retires.
    restart_pending: bool,
    /// The frame-start timestamp is recorded; the end one goes in the last
    /// submission.
    timestamps: bool,
}

/// A staging copy whose result becomes readable when `tag` retires.
#[derive(Debug)]
struct PendingReadback {
    staging: vk::Buffer,
    tag: SlotTag,
    /// The copy has gone out in a submission.
    submitted: bool,
    len: usize,
    extent: Option<vk::Extent2D>,
    format: Option<vk::Format>,
    readback: Readback,
}

/// Snapshot of backend counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RhiStats {
    /// Frames submitted so far.
    pub frame_count: u64,
    pub current_slot: usize,
    pub frames_in_flight: usize,
    pub pool_count: usize,
    /// Allocated binding sets per pool.
    pub sets_per_pool: Vec<u32>,
    pub pending_releases: usize,
    pub pending_readbacks: usize,
    /// Resources with live native objects.
    pub live_resources: usize,
    pub last_frame_time: Duration,
    pub average_frame_time: Duration,
    /// GPU time of the last timed frame; `None` without GPU timestamps.
    pub last_gpu_frame_time: Option<Duration>,
}

/// Resource and command lifecycle manager over a [`NativeDevice`].
///
/// # Teardown
///
/// Dropping the backend waits for the device to go idle, destroys every
/// remaining resource, force-flushes the release queue, completes pending
/// readbacks, then destroys the binding-set pools and the per-slot
/// synchronization objects. The device itself is dropped last.
pub struct Rhi<D: NativeDevice> {
    device: D,
    config: BackendConfig,
    store: ResourceStore,
    pools: BindingPoolAllocator,
    releases: ReleaseQueue,
    pacer: FramePacer,
    /// Primary list of the frame being recorded.
    list: CommandList,
    frame: Option<ActiveFrame>,
    pass: Option<ActivePass>,
    /// In-backend secondary lists; the top one receives pass commands.
    secondary_stack: Vec<CommandList>,
    open_update: Option<OpenUpdate>,
    readbacks: Vec<PendingReadback>,
    materials: MaterialCache,
}

impl<D: NativeDevice> std::fmt::Debug for Rhi<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rhi")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<D: NativeDevice> Rhi<D> {
    /// Creates the backend and its frame slots.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ConfigError`] for an invalid configuration, or the
    /// device error that prevented creating the per-slot objects.
    pub fn new(device: D, config: BackendConfig) -> RhiResult<Self> {
        config.validate()?;
        let pacer = FramePacer::new(
            &device,
            config.frames_in_flight,
            config.fence_timeout_ns(),
            config.gpu_timestamps,
        )?;
        info!(
            "RHI created ({} frames in flight, {} sets per pool, debug markers {})",
            config.frames_in_flight,
            config.pool.max_sets,
            if config.debug_markers { "on" } else { "off" }
        );
        Ok(Self {
            pools: BindingPoolAllocator::new(config.pool),
            device,
            config,
            store: ResourceStore::default(),
            releases: ReleaseQueue::new(),
            pacer,
            list: CommandList::new(),
            frame: None,
            pass: None,
            secondary_stack: Vec::new(),
            open_update: None,
            readbacks: Vec::new(),
            materials: MaterialCache::new(),
        })
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.pacer.frames_in_flight()
    }

    /// Slot the next (or current) frame records into.
    #[inline]
    pub fn current_slot(&self) -> usize {
        self.pacer.current_slot()
    }

    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.pacer.frame_count()
    }

    #[inline]
    pub fn phase(&self) -> FramePhase {
        self.pacer.phase()
    }

    #[inline]
    pub fn is_device_lost(&self) -> bool {
        self.pacer.is_device_lost()
    }

    /// True between `begin_*frame` and `end_*frame`.
    #[inline]
    pub fn in_frame(&self) -> bool {
        self.frame.is_some()
    }

    /// The primary list recorded so far this frame.
    pub fn command_list(&self) -> &CommandList {
        &self.list
    }

    pub fn stats(&self) -> RhiStats {
        RhiStats {
            frame_count: self.pacer.frame_count(),
            current_slot: self.pacer.current_slot(),
            frames_in_flight: self.pacer.frames_in_flight(),
            pool_count: self.pools.pool_count(),
            sets_per_pool: self.pools.sets_per_pool(),
            pending_releases: self.releases.len(),
            pending_readbacks: self.readbacks.len(),
            live_resources: self.store.live_count(),
            last_frame_time: self.pacer.last_frame_time(),
            average_frame_time: self.pacer.average_frame_time(),
            last_gpu_frame_time: self.pacer.last_gpu_frame_time(),
        }
    }

    // -- pipeline cache -----------------------------------------------------

    /// The driver's pipeline cache blob, unmodified.
    pub fn pipeline_cache_data(&self) -> RhiResult<Vec<u8>> {
        self.device.pipeline_cache_data()
    }

    /// Seeds the pipeline cache with a blob from an earlier run. Call before
    /// creating pipelines.
    pub fn set_pipeline_cache_data(&mut self, data: &[u8]) -> RhiResult<()> {
        debug!("Seeding pipeline cache with {} bytes", data.len());
        self.device.set_pipeline_cache_data(data)
    }

    // -- frame cycle --------------------------------------------------------

    /// Starts a frame presenting to `swapchain`.
    ///
    /// Blocks until the current slot's previous submission has retired, then
    /// frees whatever that retirement unblocked and acquires an image. An
    /// out-of-date surface returns [`FrameOpResult::SwapChainOutOfDate`]
    /// without consuming a slot.
    pub fn begin_frame(&mut self, swapchain: SwapChainId) -> FrameOpResult {
        self.begin(Some(swapchain)).into()
    }

    /// Ends the frame: replays the recorded commands, submits them and
    /// presents. The slot rotates once the submission went through, even if
    /// presentation reports an out-of-date surface.
    pub fn end_frame(&mut self) -> FrameOpResult {
        self.end(true).into()
    }

    /// Starts a frame that renders only to textures.
    pub fn begin_offscreen_frame(&mut self) -> FrameOpResult {
        self.begin(None).into()
    }

    pub fn end_offscreen_frame(&mut self) -> FrameOpResult {
        self.end(false).into()
    }

    /// Waits for all submitted work.
    ///
    /// Inside a frame, the commands recorded so far are submitted and waited
    /// for, and recording continues on the same slot. Outside a frame, the
    /// device is waited idle. Both flush the release queue and complete
    /// readbacks.
    ///
    /// Commands recorded before a mid-frame `finish` are submitted once,
    /// even when the wait times out. The slot's command buffer is begun
    /// again by the next `finish` or `end_*frame` once the submission has
    /// retired; until then those calls report the timeout.
    pub fn finish(&mut self) -> FrameOpResult {
        self.finish_inner().into()
    }

    fn note(&mut self, error: RhiError) -> RhiError {
        if matches!(error, RhiError::DeviceLost) {
            self.pacer.mark_device_lost();
        }
        error
    }

    fn begin(&mut self, swapchain: Option<SwapChainId>) -> RhiResult<()> {
        if self.pacer.is_device_lost() {
            return Err(RhiError::DeviceLost);
        }
        if self.frame.is_some() {
            return Err(RhiError::InvalidState(
                "a frame is already being recorded".to_string(),
            ));
        }
        let result = self.begin_inner(swapchain);
        if result.is_err() && !self.pacer.is_device_lost() {
            self.pacer.set_phase(FramePhase::Idle);
        }
        result
    }

    fn begin_inner(&mut self, swapchain: Option<SwapChainId>) -> RhiResult<()> {
        self.pacer.set_phase(FramePhase::Acquiring);
        self.pacer.wait_for_slot(&self.device)?;
        self.pacer.poll(&self.device)?;
        self.pacer.collect_timestamps(&self.device)?;
        self.flush_releases(false);
        self.complete_readbacks(false);

        let kind = match swapchain {
            Some(id) => {
                let signal = self.pacer.current().image_acquired;
                let record = self.store.usable_mut(id)?;
                let native = record.native.as_ref().ok_or_else(|| {
                    let name = &record.meta.name;
                    RhiError::InvalidState(format!("swapchain '{name}' has no images"))
                })?;
                let image_index = match self.device.acquire_next_image(native, signal) {
                    Ok(index) => index,
                    Err(RhiError::SwapChainOutOfDate) => {
                        warn!("Swapchain '{}' is out of date", record.meta.name);
                        return Err(RhiError::SwapChainOutOfDate);
                    }
                    Err(e) => return Err(self.note(e)),
                };
                record.current_image = image_index;
                let layout = record
                    .image_layouts
                    .get(image_index as usize)
                    .copied()
                    .unwrap_or(vk::ImageLayout::UNDEFINED);
                FrameKind::Swapchain {
                    id,
                    image_index,
                    image_state: TextureUsageState::new(
                        layout,
                        vk::AccessFlags::empty(),
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    ),
                }
            }
            None => FrameKind::Offscreen,
        };

        self.pacer.begin_recording(&self.device)?;
        self.list.reset();
        let timestamps = self.pacer.timestamp_pool();
        if let Some(pool) = timestamps {
            self.list.reset_queries(pool, 0, 2);
            self.list
                .write_timestamp(vk::PipelineStageFlags::TOP_OF_PIPE, pool, 0);
        }
        self.frame = Some(ActiveFrame {
            kind,
            acquire_pending: swapchain.is_some(),
            restart_pending: false,
            timestamps: timestamps.is_some(),
        });
        Ok(())
    }

    fn end(&mut self, presenting: bool) -> RhiResult<()> {
        let Some(frame) = self.frame.as_ref() else {
            return Err(RhiError::InvalidState("no frame is being recorded".to_string()));
        };
        let is_swapchain = matches!(frame.kind, FrameKind::Swapchain { .. });
        if self.pass.is_some() || is_swapchain != presenting {
            let reason = if self.pass.is_some() {
                "a pass is still open"
            } else if presenting {
                "end_frame called for an offscreen frame"
            } else {
                "end_offscreen_frame called for a swapchain frame"
            };
            return Err(RhiError::InvalidState(reason.to_string()));
        }
        self.resume_recording()?;
        let Some(frame) = self.frame.take() else {
            return Err(RhiError::InvalidState("no frame is being recorded".to_string()));
        };
        if let Some(open) = self.open_update.take() {
            warn!("Dynamic update of buffer {:?} was never ended", open.buffer);
        }

        let tag = self.pacer.current_tag();
        let mut present = None;
        if let FrameKind::Swapchain {
            id,
            image_index,
            mut image_state,
        } = frame.kind
        {
            let record = self.store.usable_mut(id)?;
            if let Some(native) = record.native.as_ref()
                && let Some(&image) = native.images.get(image_index as usize)
            {
                let target = TextureUsageState::new(
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::AccessFlags::empty(),
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                );
                if let Some(barrier) =
                    tracked_image_barrier(image, ImageRange::color(1), &mut image_state, target)
                {
                    self.list.pipeline_barrier(&[], &[barrier]);
                }
                if let Some(layout) = record.image_layouts.get_mut(image_index as usize) {
                    *layout = vk::ImageLayout::PRESENT_SRC_KHR;
                }
            }
            self.store.touch(id.into(), tag);
            present = Some((id, image_index));
        }

        let timed = frame.timestamps.then(|| self.pacer.timestamp_pool()).flatten();
        if let Some(pool) = timed {
            self.list
                .write_timestamp(vk::PipelineStageFlags::BOTTOM_OF_PIPE, pool, 1);
        }
        let signal = present.map(|_| self.pacer.current().work_complete);
        self.submit_current(frame.acquire_pending, signal)?;
        if timed.is_some() {
            self.pacer.mark_timestamps_pending();
        }

        let result = match present {
            Some((id, image_index)) => self.present(id, image_index),
            None => Ok(()),
        };
        self.pacer.advance();
        result
    }

    fn present(&mut self, id: SwapChainId, image_index: u32) -> RhiResult<()> {
        self.pacer.set_phase(FramePhase::Presenting);
        let wait = self.pacer.current().work_complete;
        let record = self.store.usable(id)?;
        let Some(native) = record.native.as_ref() else {
            return Ok(());
        };
        match self.device.present(native, image_index, wait) {
            Ok(()) => Ok(()),
            Err(RhiError::SwapChainOutOfDate) => {
                warn!("Swapchain '{}' went out of date at present", record.meta.name);
                Err(RhiError::SwapChainOutOfDate)
            }
            Err(e) => Err(self.note(e)),
        }
    }

    /// Replays the frame's lists into the current slot's command buffers and
    /// submits them.
    fn submit_current(
        &mut self,
        wait_for_acquire: bool,
        signal: Option<vk::Semaphore>,
    ) -> RhiResult<()> {
        let (pool, cb, acquired) = {
            let slot = self.pacer.current();
            (slot.command_pool, slot.command_buffer, slot.image_acquired)
        };
        let tag = self.pacer.current_tag();

        let mut secondaries = Vec::with_capacity(self.list.secondaries().len());
        let recorded = self.replay_secondaries(pool, &mut secondaries);
        let submitted = recorded.and_then(|()| {
            self.list
                .replay(&self.device, cb, &secondaries, self.config.debug_markers);
            let wait = wait_for_acquire
                .then_some((acquired, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
            self.pacer.submit(&self.device, wait, signal)
        });
        for buffer in secondaries {
            self.releases
                .enqueue(ReleasePayload::SecondaryCommandBuffer { pool, buffer }, tag, None);
        }
        match submitted {
            Ok(()) => {
                for readback in self.readbacks.iter_mut().filter(|r| r.tag == tag) {
                    readback.submitted = true;
                }
                Ok(())
            }
            Err(e) => {
                self.fail_readbacks(tag, "the submission carrying the readback failed");
                Err(self.note(e))
            }
        }
    }

    fn replay_secondaries(
        &self,
        pool: vk::CommandPool,
        out: &mut Vec<vk::CommandBuffer>,
    ) -> RhiResult<()> {
        for secondary in self.list.secondaries() {
            let cb = self
                .device
                .allocate_command_buffer(pool, vk::CommandBufferLevel::SECONDARY)?;
            out.push(cb);
            self.device.begin_command_buffer(cb, secondary.inheritance())?;
            secondary.replay(&self.device, cb, &[], self.config.debug_markers);
            self.device.end_command_buffer(cb)?;
        }
        Ok(())
    }

    fn finish_inner(&mut self) -> RhiResult<()> {
        if self.pacer.is_device_lost() {
            return Err(RhiError::DeviceLost);
        }
        if self.pass.is_some() {
            return Err(RhiError::InvalidState(
                "cannot finish while a pass is open".to_string(),
            ));
        }
        if self.frame.as_ref().is_some_and(|f| f.restart_pending) {
            return self.resume_recording();
        }
        match self.frame.as_mut() {
            Some(frame) => {
                let wait_for_acquire = std::mem::take(&mut frame.acquire_pending);
                frame.restart_pending = true;
                let submitted = self.submit_current(wait_for_acquire, None);
                self.list.reset();
                if !self.pacer.is_device_lost() {
                    self.pacer.set_phase(FramePhase::Recording);
                }
                if let Err(e) = submitted {
                    if let Some(frame) = self.frame.as_mut() {
                        frame.acquire_pending = wait_for_acquire;
                        frame.timestamps = false;
                    }
                    return Err(e);
                }
                self.resume_recording()?;
            }
            None => {
                if let Err(e) = self.device.wait_idle() {
                    return Err(self.note(e));
                }
                self.pacer.mark_all_idle();
                self.flush_releases(false);
                self.complete_readbacks(false);
            }
        }
        Ok(())
    }

    /// Waits out a mid-frame submission and begins the slot's primary buffer
    /// again. A no-op unless `finish` left the frame waiting.
    ///
    /// Releases are not flushed here: objects released since the submission
    /// carry the same slot tag and may still be used by the list.
    fn resume_recording(&mut self) -> RhiResult<()> {
        if !self.frame.as_ref().is_some_and(|f| f.restart_pending) {
            return Ok(());
        }
        self.pacer.wait_for_slot(&self.device)?;
        self.complete_readbacks(false);
        self.pacer.begin_recording(&self.device)?;
        if let Some(frame) = self.frame.as_mut() {
            frame.restart_pending = false;
        }
        Ok(())
    }

    // -- release queue --------------------------------------------------------

    /// Frees every queued release whose work has retired (or all of them when
    /// `forced`), and drops the records of fully destroyed resources.
    fn flush_releases(&mut self, forced: bool) {
        let pacer = &self.pacer;
        let ready = self.releases.flush(forced, |tag| pacer.is_retired(tag));
        if ready.is_empty() {
            return;
        }
        debug!("Freeing {} released objects", ready.len());
        for entry in ready {
            entry.payload.free(&self.device, &mut self.pools);
            if let Some(owner) = entry.owner {
                self.store.remove(owner);
            }
        }
    }

    /// Resolves readbacks whose copies never reached the GPU as failed.
    fn fail_readbacks(&mut self, tag: SlotTag, reason: &str) {
        let pending = std::mem::take(&mut self.readbacks);
        for readback in pending {
            if readback.tag != tag || readback.submitted {
                self.readbacks.push(readback);
                continue;
            }
            readback.readback.fail(reason);
            self.device.destroy_buffer(readback.staging);
        }
    }

    /// Copies finished readbacks out of their staging buffers.
    fn complete_readbacks(&mut self, forced: bool) {
        let pending = std::mem::take(&mut self.readbacks);
        for readback in pending {
            if !forced && !(readback.submitted && self.pacer.is_retired(readback.tag)) {
                self.readbacks.push(readback);
                continue;
            }
            if !readback.submitted {
                readback.readback.fail("the readback was never submitted");
            } else if self.pacer.is_device_lost() {
                readback.readback.fail("device lost");
            } else {
                match self.device.mapped_range(readback.staging) {
                    Some(mapped) if mapped.len >= readback.len => {
                        // SAFETY: the copy into the staging buffer has retired
                        // and nothing else maps it.
                        let bytes = unsafe {
                            crate::store::mapped_slice(mapped.ptr, readback.len)
                        };
                        readback.readback.complete(ReadbackResult {
                            data: bytes.to_vec(),
                            extent: readback.extent,
                            format: readback.format,
                        });
                    }
                    _ => readback.readback.fail("readback staging buffer is not mapped"),
                }
            }
            self.device.destroy_buffer(readback.staging);
        }
    }
}

impl<D: NativeDevice> Drop for Rhi<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Device idle wait failed during teardown: {}", e);
        }
        self.pacer.mark_all_idle();
        self.frame = None;
        self.pass = None;
        self.secondary_stack.clear();

        self.materials.clear();
        for id in self.store.live_ids() {
            if let Err(e) = self.destroy(id) {
                error!("Failed to destroy {} during teardown: {}", id.kind(), e);
            }
        }
        self.flush_releases(true);
        self.complete_readbacks(true);
        self.pools.destroy_all(&self.device);
        self.pacer.destroy(&self.device);
        info!("RHI destroyed");
    }
}

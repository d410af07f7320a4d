//! CPU-simulated device.
//!
//! Buffers and images are byte arrays, descriptor pools enforce their
//! capacities, and copy commands recorded into command buffers execute when
//! the submission completes. Submissions complete immediately unless the
//! device was created with [`NullDevice::manual`], in which case a test
//! drives completion with [`NullDevice::complete_submissions`].
//!
//! Timestamp queries read a tick counter that advances once per executed
//! call, so a frame's GPU time grows with the work it submitted.
//!
//! Faults can be injected: an out-of-date surface, device loss, failed
//! memory allocation and a rejected submission.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk::{self, Handle};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::{
    DescriptorResource, DescriptorWrite, MappedRange, MemoryPlacement, NativeBufferDesc,
    NativeCommands, NativeDevice, NativeImage, NativeImageDesc, NativeSwapchain,
    NativeSwapchainDesc, SubmitDesc,
};
use crate::binding::LayoutBinding;
use crate::command::{AttachmentInfo, BufferBarrier, ImageBarrier, RenderingInheritance};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc};
use crate::pool::pool_sizes;
use crate::resource::{texel_size, SamplerDesc};
use vkframe_core::PoolConfig;

const SWAPCHAIN_IMAGES: usize = 3;
const SWAPCHAIN_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;
/// Nanoseconds per simulated timestamp tick.
const TIMESTAMP_PERIOD: f32 = 1000.0;

/// One recorded command-buffer call.
#[derive(Clone, Debug)]
pub enum NullCall {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImage {
        src: vk::Image,
        dst: vk::Image,
        region: vk::ImageCopy,
    },
    CopyImageToBuffer {
        src: vk::Image,
        dst: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    BlitImage {
        src: vk::Image,
        dst: vk::Image,
        region: vk::ImageBlit,
    },
    PipelineBarrier {
        buffers: Vec<BufferBarrier>,
        images: Vec<ImageBarrier>,
    },
    BeginRendering {
        area: vk::Rect2D,
        colors: Vec<AttachmentInfo>,
        depth: Option<AttachmentInfo>,
        secondary_contents: bool,
    },
    EndRendering,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSet {
        set: vk::DescriptorSet,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<vk::Buffer>,
        offsets: Vec<u64>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    SetBlendConstants([f32; 4]),
    SetStencilReference(u32),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    BeginLabel(String),
    EndLabel,
    InsertLabel(String),
    ExecuteCommands(Vec<vk::CommandBuffer>),
    ResetQueries {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
    WriteTimestamp {
        pool: vk::QueryPool,
        query: u32,
    },
}

/// A completed or queued submission. Calls of executed secondary buffers are
/// inlined after their `ExecuteCommands` entry.
#[derive(Clone, Debug)]
pub struct NullSubmission {
    pub command_buffer: vk::CommandBuffer,
    pub calls: Vec<NullCall>,
    pub wait: Option<vk::Semaphore>,
    pub signal: Option<vk::Semaphore>,
    pub fence: vk::Fence,
}

/// Heap bytes with a stable address, so a mapping can outlive the lock.
struct HostMemory {
    ptr: NonNull<[u8]>,
}

// SAFETY: the allocation is uniquely owned; access goes through the state
// lock or through a mapping used by the single submitting thread.
unsafe impl Send for HostMemory {}

impl HostMemory {
    fn zeroed(len: usize) -> Self {
        let bytes = vec![0u8; len].into_boxed_slice();
        Self {
            ptr: NonNull::from(Box::leak(bytes)),
        }
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: valid for the lifetime of `self`.
        unsafe { self.ptr.as_ref() }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: valid for the lifetime of `self`, borrowed mutably.
        unsafe { self.ptr.as_mut() }
    }

    fn mapping(&self) -> MappedRange {
        MappedRange {
            ptr: self.ptr.cast(),
            len: self.ptr.len(),
        }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: created by `Box::leak` in `zeroed` and dropped once.
        unsafe { drop(Box::from_raw(self.ptr.as_ptr())) }
    }
}

struct NullBuffer {
    memory: HostMemory,
    mappable: bool,
}

struct NullImage {
    extent: vk::Extent2D,
    texel: usize,
    levels: Vec<Vec<u8>>,
    default_view: vk::ImageView,
}

impl NullImage {
    fn level_width(&self, level: u32) -> usize {
        (self.extent.width >> level).max(1) as usize
    }

    fn level_height(&self, level: u32) -> usize {
        (self.extent.height >> level).max(1) as usize
    }

    fn texel_offset(&self, level: u32, x: i32, y: i32) -> usize {
        (y.max(0) as usize * self.level_width(level) + x.max(0) as usize) * self.texel
    }
}

struct NullPool {
    max_sets: u32,
    capacity: FxHashMap<vk::DescriptorType, u32>,
    used: FxHashMap<vk::DescriptorType, u32>,
    sets: u32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

#[derive(Default)]
struct NullCommandBuffer {
    pool: vk::CommandPool,
    calls: Vec<NullCall>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ObjectKind {
    ImageView,
    Sampler,
    SetLayout,
    PipelineLayout,
    Pipeline,
    Semaphore,
    CommandPool,
    Swapchain,
}

#[derive(Default)]
struct NullState {
    manual: bool,
    next_handle: u64,
    buffers: FxHashMap<vk::Buffer, NullBuffer>,
    images: FxHashMap<vk::Image, NullImage>,
    objects: FxHashMap<u64, ObjectKind>,
    set_layouts: FxHashMap<vk::DescriptorSetLayout, Vec<LayoutBinding>>,
    pools: FxHashMap<vk::DescriptorPool, NullPool>,
    descriptors: FxHashMap<(vk::DescriptorSet, u32), DescriptorResource>,
    descriptor_writes: usize,
    fences: FxHashMap<vk::Fence, FenceState>,
    command_buffers: FxHashMap<vk::CommandBuffer, NullCommandBuffer>,
    swapchain_cursor: FxHashMap<vk::SwapchainKHR, u32>,
    query_pools: FxHashMap<vk::QueryPool, Vec<Option<u64>>>,
    clock: u64,
    pipeline_cache: Vec<u8>,
    pipelines_created: usize,
    queued: Vec<NullSubmission>,
    submissions: Vec<NullSubmission>,
    out_of_date: bool,
    device_lost: bool,
    fail_next_allocation: bool,
    fail_next_submit: bool,
}

impl NullState {
    fn mint<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn mint_object<H: Handle>(&mut self, kind: ObjectKind) -> H {
        self.next_handle += 1;
        self.objects.insert(self.next_handle, kind);
        H::from_raw(self.next_handle)
    }

    fn forget_object<H: Handle>(&mut self, handle: H, kind: ObjectKind) {
        match self.objects.remove(&handle.as_raw()) {
            Some(found) if found == kind => {}
            found => warn!("Null device: destroy of unknown {:?} ({:?})", kind, found),
        }
    }

    fn check_lost(&self) -> RhiResult<()> {
        if self.device_lost {
            Err(RhiError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn take_allocation_failure(&mut self, what: &str) -> RhiResult<()> {
        if std::mem::take(&mut self.fail_next_allocation) {
            return Err(RhiError::ResourceCreationFailed(format!(
                "simulated out of device memory for {what}"
            )));
        }
        Ok(())
    }

    fn record(&mut self, cb: vk::CommandBuffer, call: NullCall) {
        match self.command_buffers.get_mut(&cb) {
            Some(buffer) => buffer.calls.push(call),
            None => warn!("Null device: call recorded into unknown command buffer"),
        }
    }

    /// Calls of `cb` with executed secondaries inlined.
    fn flattened(&self, cb: vk::CommandBuffer) -> Vec<NullCall> {
        let mut out = Vec::new();
        if let Some(buffer) = self.command_buffers.get(&cb) {
            for call in &buffer.calls {
                out.push(call.clone());
                if let NullCall::ExecuteCommands(secondaries) = call {
                    for &secondary in secondaries {
                        out.extend(self.flattened(secondary));
                    }
                }
            }
        }
        out
    }

    fn complete(&mut self, submission: NullSubmission) {
        for call in &submission.calls {
            self.execute(call);
        }
        if let Some(state) = self.fences.get_mut(&submission.fence) {
            *state = FenceState::Signaled;
        }
        self.submissions.push(submission);
    }

    fn complete_all(&mut self) {
        for submission in std::mem::take(&mut self.queued) {
            self.complete(submission);
        }
    }

    fn execute(&mut self, call: &NullCall) {
        self.clock += 1;
        match call {
            NullCall::CopyBuffer { src, dst, region } => {
                let Some(bytes) = self.buffer_bytes(*src, region.src_offset, region.size) else {
                    return warn!("Null device: buffer copy source out of range");
                };
                self.write_buffer(*dst, region.dst_offset, &bytes);
            }
            NullCall::CopyBufferToImage { src, dst, regions } => {
                for region in regions {
                    self.copy_buffer_to_image(*src, *dst, region);
                }
            }
            NullCall::CopyImageToBuffer { src, dst, regions } => {
                for region in regions {
                    self.copy_image_to_buffer(*src, *dst, region);
                }
            }
            NullCall::CopyImage { src, dst, region } => self.copy_image(*src, *dst, region),
            NullCall::BlitImage { src, dst, region } => self.blit_image(*src, *dst, region),
            NullCall::ResetQueries { pool, first, count } => {
                if let Some(queries) = self.query_pools.get_mut(pool) {
                    let start = (*first as usize).min(queries.len());
                    let end = (start + *count as usize).min(queries.len());
                    queries[start..end].fill(None);
                }
            }
            NullCall::WriteTimestamp { pool, query } => {
                let clock = self.clock;
                match self
                    .query_pools
                    .get_mut(pool)
                    .and_then(|queries| queries.get_mut(*query as usize))
                {
                    Some(slot) => *slot = Some(clock),
                    None => warn!("Null device: timestamp written to unknown query"),
                }
            }
            _ => {}
        }
    }

    fn buffer_bytes(&self, buffer: vk::Buffer, offset: u64, len: u64) -> Option<Vec<u8>> {
        let bytes = self.buffers.get(&buffer)?.memory.bytes();
        let start = offset as usize;
        bytes.get(start..start + len as usize).map(<[u8]>::to_vec)
    }

    fn write_buffer(&mut self, buffer: vk::Buffer, offset: u64, data: &[u8]) {
        let Some(target) = self.buffers.get_mut(&buffer) else {
            return;
        };
        let start = offset as usize;
        match target.memory.bytes_mut().get_mut(start..start + data.len()) {
            Some(dst) => dst.copy_from_slice(data),
            None => warn!("Null device: buffer write out of range"),
        }
    }

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        region: &vk::BufferImageCopy,
    ) {
        let Some(buffer) = self.buffers.get(&src) else {
            return;
        };
        let Some(image) = self.images.get_mut(&dst) else {
            return;
        };
        let level = region.image_subresource.mip_level;
        let width = region.image_extent.width as usize;
        let row_length = match region.buffer_row_length {
            0 => width,
            n => n as usize,
        };
        let row_bytes = width * image.texel;
        for y in 0..region.image_extent.height as usize {
            let from = region.buffer_offset as usize + y * row_length * image.texel;
            let row = region.image_offset.y + y as i32;
            let to = image.texel_offset(level, region.image_offset.x, row);
            let (Some(source), Some(level_bytes)) = (
                buffer.memory.bytes().get(from..from + row_bytes),
                image.levels.get_mut(level as usize),
            ) else {
                return warn!("Null device: buffer-to-image copy out of range");
            };
            if let Some(target) = level_bytes.get_mut(to..to + row_bytes) {
                target.copy_from_slice(source);
            }
        }
    }

    fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        dst: vk::Buffer,
        region: &vk::BufferImageCopy,
    ) {
        let Some(image) = self.images.get(&src) else {
            return;
        };
        let Some(buffer) = self.buffers.get_mut(&dst) else {
            return;
        };
        let level = region.image_subresource.mip_level;
        let width = region.image_extent.width as usize;
        let row_length = match region.buffer_row_length {
            0 => width,
            n => n as usize,
        };
        let row_bytes = width * image.texel;
        for y in 0..region.image_extent.height as usize {
            let row = region.image_offset.y + y as i32;
            let from = image.texel_offset(level, region.image_offset.x, row);
            let to = region.buffer_offset as usize + y * row_length * image.texel;
            let source = image
                .levels
                .get(level as usize)
                .and_then(|bytes| bytes.get(from..from + row_bytes));
            let target = buffer.memory.bytes_mut().get_mut(to..to + row_bytes);
            match (source, target) {
                (Some(source), Some(target)) => target.copy_from_slice(source),
                _ => return warn!("Null device: image-to-buffer copy out of range"),
            }
        }
    }

    fn copy_image(&mut self, src: vk::Image, dst: vk::Image, region: &vk::ImageCopy) {
        let src_level = region.src_subresource.mip_level;
        let dst_level = region.dst_subresource.mip_level;
        let mut rows = Vec::new();
        let Some(image) = self.images.get(&src) else {
            return;
        };
        let row_bytes = region.extent.width as usize * image.texel;
        for y in 0..region.extent.height as i32 {
            let from = image.texel_offset(src_level, region.src_offset.x, region.src_offset.y + y);
            let row = image
                .levels
                .get(src_level as usize)
                .and_then(|bytes| bytes.get(from..from + row_bytes));
            match row {
                Some(row) => rows.push(row.to_vec()),
                None => return warn!("Null device: image copy source out of range"),
            }
        }
        let Some(image) = self.images.get_mut(&dst) else {
            return;
        };
        for (y, row) in rows.iter().enumerate() {
            let row_y = region.dst_offset.y + y as i32;
            let to = image.texel_offset(dst_level, region.dst_offset.x, row_y);
            if let Some(target) = image
                .levels
                .get_mut(dst_level as usize)
                .and_then(|bytes| bytes.get_mut(to..to + row.len()))
            {
                target.copy_from_slice(row);
            }
        }
    }

    /// Nearest-texel scaling between two rectangles.
    fn blit_image(&mut self, src: vk::Image, dst: vk::Image, region: &vk::ImageBlit) {
        let src_level = region.src_subresource.mip_level;
        let dst_level = region.dst_subresource.mip_level;
        let [s0, s1] = region.src_offsets;
        let [d0, d1] = region.dst_offsets;
        let (src_w, src_h) = ((s1.x - s0.x).max(1), (s1.y - s0.y).max(1));
        let (dst_w, dst_h) = ((d1.x - d0.x).max(1), (d1.y - d0.y).max(1));

        let Some(image) = self.images.get(&src) else {
            return;
        };
        let texel = image.texel;
        let Some(source) = image.levels.get(src_level as usize) else {
            return;
        };
        let mut texels = Vec::with_capacity((dst_w * dst_h) as usize * texel);
        for y in 0..dst_h {
            for x in 0..dst_w {
                let sx = s0.x + x * src_w / dst_w;
                let sy = s0.y + y * src_h / dst_h;
                let from = image.texel_offset(src_level, sx, sy);
                match source.get(from..from + texel) {
                    Some(bytes) => texels.extend_from_slice(bytes),
                    None => return warn!("Null device: blit source out of range"),
                }
            }
        }

        let Some(image) = self.images.get_mut(&dst) else {
            return;
        };
        if image.level_width(dst_level) < (d0.x + dst_w) as usize
            || image.level_height(dst_level) < (d0.y + dst_h) as usize
        {
            return warn!("Null device: blit destination out of range");
        }
        for y in 0..dst_h {
            for x in 0..dst_w {
                let to = image.texel_offset(dst_level, d0.x + x, d0.y + y);
                let from = ((y * dst_w + x) as usize) * texel;
                if let Some(target) = image
                    .levels
                    .get_mut(dst_level as usize)
                    .and_then(|bytes| bytes.get_mut(to..to + texel))
                {
                    target.copy_from_slice(&texels[from..from + texel]);
                }
            }
        }
    }

    fn insert_image(
        &mut self,
        extent: vk::Extent2D,
        format: vk::Format,
        mip_levels: u32,
    ) -> NativeImage {
        let texel = texel_size(format).unwrap_or(4) as usize;
        let levels = (0..mip_levels.max(1))
            .map(|level| {
                let w = (extent.width >> level).max(1) as usize;
                let h = (extent.height >> level).max(1) as usize;
                vec![0u8; w * h * texel]
            })
            .collect();
        let image: vk::Image = self.mint();
        let view = self.mint_object(ObjectKind::ImageView);
        self.images.insert(
            image,
            NullImage {
                extent,
                texel,
                levels,
                default_view: view,
            },
        );
        NativeImage { image, view }
    }
}

/// A device that runs on the CPU. Cloning shares the device.
#[derive(Clone, Default)]
pub struct NullDevice {
    state: Arc<Mutex<NullState>>,
}

impl std::fmt::Debug for NullDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NullDevice")
            .field("live_objects", &self.live_object_count())
            .finish()
    }
}

impl NullDevice {
    /// A device whose submissions complete as soon as they are made.
    pub fn new() -> Self {
        Self::default()
    }

    /// A device whose submissions stay pending until
    /// [`NullDevice::complete_submissions`] is called.
    pub fn manual() -> Self {
        let device = Self::default();
        device.state().manual = true;
        device
    }

    fn state(&self) -> MutexGuard<'_, NullState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Executes and retires every queued submission, in order.
    pub fn complete_submissions(&self) {
        self.state().complete_all();
    }

    /// Submissions made but not yet completed.
    pub fn pending_submissions(&self) -> usize {
        self.state().queued.len()
    }

    /// Makes acquire and present report an out-of-date surface.
    pub fn set_out_of_date(&self, out_of_date: bool) {
        self.state().out_of_date = out_of_date;
    }

    /// Makes every queue, fence and recording call report device loss.
    pub fn set_device_lost(&self, lost: bool) {
        self.state().device_lost = lost;
    }

    /// Fails the next buffer or image creation.
    pub fn fail_next_allocation(&self) {
        self.state().fail_next_allocation = true;
    }

    /// Rejects the next queue submission with an out-of-memory error.
    pub fn fail_next_submit(&self) {
        self.state().fail_next_submit = true;
    }

    /// Current bytes of a buffer.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state()
            .buffers
            .get(&buffer)
            .map(|b| b.memory.bytes().to_vec())
    }

    /// Current bytes of one image level.
    pub fn image_contents(&self, image: vk::Image, level: u32) -> Option<Vec<u8>> {
        self.state()
            .images
            .get(&image)
            .and_then(|i| i.levels.get(level as usize).cloned())
    }

    /// Completed submissions, oldest first.
    pub fn submissions(&self) -> Vec<NullSubmission> {
        self.state().submissions.clone()
    }

    pub fn last_submission(&self) -> Option<NullSubmission> {
        self.state().submissions.last().cloned()
    }

    /// What a descriptor binding was last written with.
    pub fn descriptor(&self, set: vk::DescriptorSet, binding: u32) -> Option<DescriptorResource> {
        self.state().descriptors.get(&(set, binding)).copied()
    }

    /// Total descriptor writes issued.
    pub fn descriptor_write_count(&self) -> usize {
        self.state().descriptor_writes
    }

    pub fn descriptor_pool_count(&self) -> usize {
        self.state().pools.len()
    }

    /// Graphics and compute pipelines built so far, including destroyed ones.
    pub fn pipelines_created(&self) -> usize {
        self.state().pipelines_created
    }

    pub fn buffer_count(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn image_count(&self) -> usize {
        self.state().images.len()
    }

    pub fn query_pool_count(&self) -> usize {
        self.state().query_pools.len()
    }

    /// Every native object not yet destroyed.
    pub fn live_object_count(&self) -> usize {
        let state = self.state();
        state.buffers.len()
            + state.images.len()
            + state.objects.len()
            + state.set_layouts.len()
            + state.pools.len()
            + state.fences.len()
            + state.query_pools.len()
    }
}

impl NativeCommands for NullDevice {
    fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        self.state().record(cb, NullCall::CopyBuffer { src, dst, region });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        _layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.state().record(
            cb,
            NullCall::CopyBufferToImage {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        region: vk::ImageCopy,
    ) {
        self.state().record(cb, NullCall::CopyImage { src, dst, region });
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        _layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.state().record(
            cb,
            NullCall::CopyImageToBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_blit_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        region: vk::ImageBlit,
        _filter: vk::Filter,
    ) {
        self.state().record(cb, NullCall::BlitImage { src, dst, region });
    }

    fn cmd_pipeline_barrier(
        &self,
        cb: vk::CommandBuffer,
        buffers: &[BufferBarrier],
        images: &[ImageBarrier],
    ) {
        self.state().record(
            cb,
            NullCall::PipelineBarrier {
                buffers: buffers.to_vec(),
                images: images.to_vec(),
            },
        );
    }

    fn cmd_begin_rendering(
        &self,
        cb: vk::CommandBuffer,
        area: vk::Rect2D,
        colors: &[AttachmentInfo],
        depth: Option<&AttachmentInfo>,
        secondary_contents: bool,
    ) {
        self.state().record(
            cb,
            NullCall::BeginRendering {
                area,
                colors: colors.to_vec(),
                depth: depth.copied(),
                secondary_contents,
            },
        );
    }

    fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        self.state().record(cb, NullCall::EndRendering);
    }

    fn cmd_bind_pipeline(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.state()
            .record(cb, NullCall::BindPipeline { bind_point, pipeline });
    }

    fn cmd_bind_descriptor_set(
        &self,
        cb: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) {
        self.state().record(
            cb,
            NullCall::BindDescriptorSet {
                set,
                dynamic_offsets: dynamic_offsets.to_vec(),
            },
        );
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) {
        self.state().record(
            cb,
            NullCall::BindVertexBuffers {
                first_binding,
                buffers: buffers.to_vec(),
                offsets: offsets.to_vec(),
            },
        );
    }

    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        _index_type: vk::IndexType,
    ) {
        self.state()
            .record(cb, NullCall::BindIndexBuffer { buffer, offset });
    }

    fn cmd_set_viewport(&self, cb: vk::CommandBuffer, viewport: vk::Viewport) {
        self.state().record(cb, NullCall::SetViewport(viewport));
    }

    fn cmd_set_scissor(&self, cb: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.state().record(cb, NullCall::SetScissor(scissor));
    }

    fn cmd_set_blend_constants(&self, cb: vk::CommandBuffer, constants: [f32; 4]) {
        self.state().record(cb, NullCall::SetBlendConstants(constants));
    }

    fn cmd_set_stencil_reference(&self, cb: vk::CommandBuffer, reference: u32) {
        self.state().record(cb, NullCall::SetStencilReference(reference));
    }

    fn cmd_draw(
        &self,
        cb: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.state().record(
            cb,
            NullCall::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.state().record(
            cb,
            NullCall::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.state().record(cb, NullCall::Dispatch { x, y, z });
    }

    fn cmd_begin_debug_label(&self, cb: vk::CommandBuffer, label: &str, _color: [f32; 4]) {
        self.state().record(cb, NullCall::BeginLabel(label.to_string()));
    }

    fn cmd_end_debug_label(&self, cb: vk::CommandBuffer) {
        self.state().record(cb, NullCall::EndLabel);
    }

    fn cmd_insert_debug_label(&self, cb: vk::CommandBuffer, label: &str, _color: [f32; 4]) {
        self.state().record(cb, NullCall::InsertLabel(label.to_string()));
    }

    fn cmd_execute_commands(&self, cb: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        self.state()
            .record(cb, NullCall::ExecuteCommands(secondaries.to_vec()));
    }

    fn cmd_reset_query_pool(
        &self,
        cb: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) {
        self.state()
            .record(cb, NullCall::ResetQueries { pool, first, count });
    }

    fn cmd_write_timestamp(
        &self,
        cb: vk::CommandBuffer,
        _stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    ) {
        self.state()
            .record(cb, NullCall::WriteTimestamp { pool, query });
    }
}

impl NativeDevice for NullDevice {
    fn create_buffer(&self, desc: &NativeBufferDesc<'_>) -> RhiResult<vk::Buffer> {
        let mut state = self.state();
        state.take_allocation_failure(desc.name)?;
        let buffer = state.mint();
        state.buffers.insert(
            buffer,
            NullBuffer {
                memory: HostMemory::zeroed(desc.size as usize),
                mappable: desc.placement != MemoryPlacement::DeviceLocal,
            },
        );
        debug!("Null device: buffer '{}' ({} bytes)", desc.name, desc.size);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if self.state().buffers.remove(&buffer).is_none() {
            warn!("Null device: destroy of unknown buffer");
        }
    }

    fn mapped_range(&self, buffer: vk::Buffer) -> Option<MappedRange> {
        self.state()
            .buffers
            .get(&buffer)
            .filter(|b| b.mappable)
            .map(|b| b.memory.mapping())
    }

    fn create_image(&self, desc: &NativeImageDesc<'_>) -> RhiResult<NativeImage> {
        let mut state = self.state();
        state.take_allocation_failure(desc.name)?;
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RhiError::ResourceCreationFailed(format!(
                "image '{}' has an empty extent",
                desc.name
            )));
        }
        Ok(state.insert_image(desc.extent, desc.format, desc.mip_levels))
    }

    fn destroy_image(&self, image: NativeImage) {
        let mut state = self.state();
        if state.images.remove(&image.image).is_none() {
            warn!("Null device: destroy of unknown image");
        }
        state.forget_object(image.view, ObjectKind::ImageView);
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        level: u32,
    ) -> RhiResult<vk::ImageView> {
        let mut state = self.state();
        match state.images.get(&image) {
            Some(found) if (level as usize) < found.levels.len() => {
                Ok(state.mint_object(ObjectKind::ImageView))
            }
            Some(_) => Err(RhiError::ResourceCreationFailed(format!(
                "image has no level {level}"
            ))),
            None => Err(RhiError::InvalidHandle("unknown image".to_string())),
        }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state().forget_object(view, ObjectKind::ImageView);
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> RhiResult<vk::Sampler> {
        Ok(self.state().mint_object(ObjectKind::Sampler))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state().forget_object(sampler, ObjectKind::Sampler);
    }

    fn create_binding_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let mut state = self.state();
        let layout = state.mint();
        state.set_layouts.insert(layout, bindings.to_vec());
        Ok(layout)
    }

    fn destroy_binding_layout(&self, layout: vk::DescriptorSetLayout) {
        if self.state().set_layouts.remove(&layout).is_none() {
            warn!("Null device: destroy of unknown binding layout");
        }
    }

    fn create_pipeline_layout(
        &self,
        _set_layout: Option<vk::DescriptorSetLayout>,
    ) -> RhiResult<vk::PipelineLayout> {
        Ok(self.state().mint_object(ObjectKind::PipelineLayout))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state().forget_object(layout, ObjectKind::PipelineLayout);
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        _layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline> {
        if desc.stages.is_empty() || desc.stages.iter().any(|s| s.spirv.is_empty()) {
            return Err(RhiError::PipelineError(
                "graphics pipeline has an empty shader stage".to_string(),
            ));
        }
        let mut state = self.state();
        state.pipelines_created += 1;
        Ok(state.mint_object(ObjectKind::Pipeline))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
        _layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline> {
        if desc.shader.spirv.is_empty() {
            return Err(RhiError::PipelineError(
                "compute pipeline has an empty shader".to_string(),
            ));
        }
        let mut state = self.state();
        state.pipelines_created += 1;
        Ok(state.mint_object(ObjectKind::Pipeline))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state().forget_object(pipeline, ObjectKind::Pipeline);
    }

    fn pipeline_cache_data(&self) -> RhiResult<Vec<u8>> {
        let state = self.state();
        if !state.pipeline_cache.is_empty() {
            return Ok(state.pipeline_cache.clone());
        }
        let mut data = b"NULLPIPELINECACHE".to_vec();
        data.extend_from_slice(&(state.pipelines_created as u32).to_le_bytes());
        Ok(data)
    }

    fn set_pipeline_cache_data(&self, data: &[u8]) -> RhiResult<()> {
        self.state().pipeline_cache = data.to_vec();
        Ok(())
    }

    fn create_descriptor_pool(&self, config: &PoolConfig) -> RhiResult<vk::DescriptorPool> {
        let mut state = self.state();
        let pool = state.mint();
        let capacity = pool_sizes(config)
            .into_iter()
            .map(|size| (size.ty, size.descriptor_count))
            .collect();
        state.pools.insert(
            pool,
            NullPool {
                max_sets: config.max_sets,
                capacity,
                used: FxHashMap::default(),
                sets: 0,
            },
        );
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        let mut state = self.state();
        let found = state
            .pools
            .get_mut(&pool)
            .ok_or_else(|| RhiError::InvalidHandle("unknown descriptor pool".to_string()))?;
        found.used.clear();
        found.sets = 0;
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        if self.state().pools.remove(&pool).is_none() {
            warn!("Null device: destroy of unknown descriptor pool");
        }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state();
        let mut needed: FxHashMap<vk::DescriptorType, u32> = FxHashMap::default();
        for layout in layouts {
            let bindings = state
                .set_layouts
                .get(layout)
                .ok_or_else(|| RhiError::InvalidHandle("unknown binding layout".to_string()))?;
            for binding in bindings {
                *needed.entry(binding.descriptor_type).or_default() += 1;
            }
        }

        let found = state
            .pools
            .get_mut(&pool)
            .ok_or_else(|| RhiError::InvalidHandle("unknown descriptor pool".to_string()))?;
        if found.sets + layouts.len() as u32 > found.max_sets {
            return Err(RhiError::PoolExhausted);
        }
        for (ty, count) in &needed {
            let used = found.used.get(ty).copied().unwrap_or(0);
            let capacity = found.capacity.get(ty).copied().unwrap_or(0);
            if used + count > capacity {
                return Err(RhiError::PoolExhausted);
            }
        }
        for (ty, count) in needed {
            *found.used.entry(ty).or_default() += count;
        }
        found.sets += layouts.len() as u32;

        Ok((0..layouts.len()).map(|_| state.mint()).collect())
    }

    fn write_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state();
        for write in writes {
            state
                .descriptors
                .insert((write.set, write.binding), write.resource);
        }
        state.descriptor_writes += writes.len();
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.state();
        let fence = state.mint();
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(fence, initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if self.state().fences.remove(&fence).is_none() {
            warn!("Null device: destroy of unknown fence");
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        let state = self.state();
        state.check_lost()?;
        Ok(state.fences.get(&fence) == Some(&FenceState::Signaled))
    }

    fn wait_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> RhiResult<()> {
        let state = self.state();
        state.check_lost()?;
        match state.fences.get(&fence) {
            Some(FenceState::Signaled) => Ok(()),
            Some(_) => Err(RhiError::FenceTimeout),
            None => Err(RhiError::InvalidHandle("unknown fence".to_string())),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        let mut state = self.state();
        match state.fences.get_mut(&fence) {
            Some(found) => {
                *found = FenceState::Unsignaled;
                Ok(())
            }
            None => Err(RhiError::InvalidHandle("unknown fence".to_string())),
        }
    }

    fn timestamp_period(&self) -> Option<f32> {
        Some(TIMESTAMP_PERIOD)
    }

    fn create_timestamp_pool(&self, count: u32) -> RhiResult<vk::QueryPool> {
        let mut state = self.state();
        let pool = state.mint();
        state.query_pools.insert(pool, vec![None; count as usize]);
        Ok(pool)
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        if self.state().query_pools.remove(&pool).is_none() {
            warn!("Null device: destroy of unknown query pool");
        }
    }

    fn timestamp_results(&self, pool: vk::QueryPool, count: u32) -> RhiResult<Option<Vec<u64>>> {
        let state = self.state();
        state.check_lost()?;
        let queries = state
            .query_pools
            .get(&pool)
            .ok_or_else(|| RhiError::InvalidHandle("unknown query pool".to_string()))?;
        Ok(queries
            .iter()
            .take(count as usize)
            .copied()
            .collect::<Option<Vec<u64>>>()
            .filter(|values| values.len() == count as usize))
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        Ok(self.state().mint_object(ObjectKind::Semaphore))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state().forget_object(semaphore, ObjectKind::Semaphore);
    }

    fn create_command_pool(&self) -> RhiResult<vk::CommandPool> {
        Ok(self.state().mint_object(ObjectKind::CommandPool))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        let mut state = self.state();
        state.check_lost()?;
        for buffer in state.command_buffers.values_mut() {
            if buffer.pool == pool {
                buffer.calls.clear();
            }
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state();
        state.command_buffers.retain(|_, buffer| buffer.pool != pool);
        state.forget_object(pool, ObjectKind::CommandPool);
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> RhiResult<vk::CommandBuffer> {
        let mut state = self.state();
        let cb = state.mint();
        state.command_buffers.insert(
            cb,
            NullCommandBuffer {
                pool,
                calls: Vec::new(),
            },
        );
        Ok(cb)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, cb: vk::CommandBuffer) {
        self.state().command_buffers.remove(&cb);
    }

    fn begin_command_buffer(
        &self,
        cb: vk::CommandBuffer,
        _inheritance: Option<&RenderingInheritance>,
    ) -> RhiResult<()> {
        let mut state = self.state();
        state.check_lost()?;
        let buffer = state
            .command_buffers
            .get_mut(&cb)
            .ok_or_else(|| RhiError::InvalidHandle("unknown command buffer".to_string()))?;
        buffer.calls.clear();
        Ok(())
    }

    fn end_command_buffer(&self, _cb: vk::CommandBuffer) -> RhiResult<()> {
        Ok(())
    }

    fn submit(&self, submit: &SubmitDesc) -> RhiResult<()> {
        let mut state = self.state();
        state.check_lost()?;
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        match state.fences.get_mut(&submit.fence) {
            Some(fence) => *fence = FenceState::Pending,
            None => return Err(RhiError::InvalidHandle("unknown fence".to_string())),
        }
        let submission = NullSubmission {
            command_buffer: submit.command_buffer,
            calls: state.flattened(submit.command_buffer),
            wait: submit.wait.map(|(semaphore, _)| semaphore),
            signal: submit.signal,
            fence: submit.fence,
        };
        if state.manual {
            state.queued.push(submission);
        } else {
            state.complete(submission);
        }
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state();
        state.check_lost()?;
        state.complete_all();
        Ok(())
    }

    fn create_swapchain(
        &self,
        desc: &NativeSwapchainDesc,
        old: Option<&NativeSwapchain>,
    ) -> RhiResult<NativeSwapchain> {
        let mut state = self.state();
        state.check_lost()?;
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RhiError::SwapchainError("surface has zero size".to_string()));
        }
        let handle = state.mint_object(ObjectKind::Swapchain);
        let mut images = SmallVec::new();
        let mut views = SmallVec::new();
        for _ in 0..SWAPCHAIN_IMAGES {
            let image = state.insert_image(desc.extent, SWAPCHAIN_FORMAT, 1);
            images.push(image.image);
            views.push(image.view);
        }
        if old.is_some() {
            debug!("Null device: swapchain replaces an older one");
        }
        Ok(NativeSwapchain {
            handle,
            format: SWAPCHAIN_FORMAT,
            extent: desc.extent,
            images,
            views,
        })
    }

    fn destroy_swapchain(&self, swapchain: NativeSwapchain) {
        let mut state = self.state();
        for image in &swapchain.images {
            if let Some(found) = state.images.remove(image) {
                state.forget_object(found.default_view, ObjectKind::ImageView);
            }
        }
        state.swapchain_cursor.remove(&swapchain.handle);
        state.forget_object(swapchain.handle, ObjectKind::Swapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: &NativeSwapchain,
        _signal: vk::Semaphore,
    ) -> RhiResult<u32> {
        let mut state = self.state();
        state.check_lost()?;
        if state.out_of_date {
            return Err(RhiError::SwapChainOutOfDate);
        }
        let count = swapchain.images.len() as u32;
        let cursor = state.swapchain_cursor.entry(swapchain.handle).or_default();
        let index = *cursor;
        *cursor = (index + 1) % count.max(1);
        Ok(index)
    }

    fn present(
        &self,
        _swapchain: &NativeSwapchain,
        _image_index: u32,
        _wait: vk::Semaphore,
    ) -> RhiResult<()> {
        let state = self.state();
        state.check_lost()?;
        if state.out_of_date {
            return Err(RhiError::SwapChainOutOfDate);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_null_device_is_send_sync() {
        _assert_send_sync::<NullDevice>();
    }

    fn host_buffer(device: &NullDevice, size: u64) -> vk::Buffer {
        device
            .create_buffer(&NativeBufferDesc {
                name: "test",
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                placement: MemoryPlacement::HostVisible,
            })
            .unwrap()
    }

    fn submit_one(device: &NullDevice, record: impl FnOnce(vk::CommandBuffer)) -> vk::Fence {
        let pool = device.create_command_pool().unwrap();
        let cb = device
            .allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        device.begin_command_buffer(cb, None).unwrap();
        record(cb);
        device.end_command_buffer(cb).unwrap();
        let fence = device.create_fence(false).unwrap();
        device
            .submit(&SubmitDesc {
                command_buffer: cb,
                wait: None,
                signal: None,
                fence,
            })
            .unwrap();
        fence
    }

    #[test]
    fn test_mapped_memory_is_visible() {
        let device = NullDevice::new();
        let buffer = host_buffer(&device, 8);
        let mapped = device.mapped_range(buffer).unwrap();
        unsafe { std::ptr::write_bytes(mapped.ptr.as_ptr(), 0xAB, mapped.len) };
        assert_eq!(device.buffer_contents(buffer).unwrap(), vec![0xAB; 8]);
    }

    #[test]
    fn test_device_local_is_not_mappable() {
        let device = NullDevice::new();
        let buffer = device
            .create_buffer(&NativeBufferDesc {
                name: "local",
                size: 16,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                placement: MemoryPlacement::DeviceLocal,
            })
            .unwrap();
        assert!(device.mapped_range(buffer).is_none());
    }

    #[test]
    fn test_copies_run_on_completion() {
        let device = NullDevice::manual();
        let src = host_buffer(&device, 4);
        let dst = host_buffer(&device, 4);
        let mapped = device.mapped_range(src).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), mapped.ptr.as_ptr(), 4) };

        let fence = submit_one(&device, |cb| {
            device.cmd_copy_buffer(
                cb,
                src,
                dst,
                vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: 4,
                },
            )
        });
        assert_eq!(device.buffer_contents(dst).unwrap(), vec![0; 4]);
        assert!(!device.fence_status(fence).unwrap());

        device.complete_submissions();
        assert_eq!(device.buffer_contents(dst).unwrap(), vec![1, 2, 3, 4]);
        assert!(device.fence_status(fence).unwrap());
    }

    #[test]
    fn test_image_round_trip_through_buffers() {
        let device = NullDevice::new();
        let image = device
            .create_image(&NativeImageDesc {
                name: "image",
                extent: vk::Extent2D { width: 2, height: 2 },
                format: vk::Format::R8G8B8A8_UNORM,
                mip_levels: 1,
                samples: 1,
                usage: vk::ImageUsageFlags::TRANSFER_DST,
            })
            .unwrap();
        let upload = host_buffer(&device, 16);
        let readback = host_buffer(&device, 16);
        let mapped = device.mapped_range(upload).unwrap();
        let pixels: Vec<u8> = (0..16).collect();
        unsafe { std::ptr::copy_nonoverlapping(pixels.as_ptr(), mapped.ptr.as_ptr(), 16) };

        let region = vk::BufferImageCopy {
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_extent: vk::Extent3D {
                width: 2,
                height: 2,
                depth: 1,
            },
            ..Default::default()
        };
        submit_one(&device, |cb| {
            device.cmd_copy_buffer_to_image(
                cb,
                upload,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            device.cmd_copy_image_to_buffer(
                cb,
                image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                readback,
                &[region],
            );
        });
        assert_eq!(device.buffer_contents(readback).unwrap(), pixels);
    }

    #[test]
    fn test_descriptor_pool_capacity() {
        let device = NullDevice::new();
        let layout = device
            .create_binding_layout(&[LayoutBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                stages: vk::ShaderStageFlags::COMPUTE,
            }])
            .unwrap();
        let pool = device
            .create_descriptor_pool(&PoolConfig {
                max_sets: 8,
                storage_images: 2,
                ..PoolConfig::default()
            })
            .unwrap();

        device.allocate_descriptor_sets(pool, &[layout, layout]).unwrap();
        assert!(matches!(
            device.allocate_descriptor_sets(pool, &[layout]),
            Err(RhiError::PoolExhausted)
        ));
        device.reset_descriptor_pool(pool).unwrap();
        device.allocate_descriptor_sets(pool, &[layout]).unwrap();
    }

    #[test]
    fn test_timestamps_follow_executed_work() {
        let device = NullDevice::manual();
        let pool = device.create_timestamp_pool(2).unwrap();
        submit_one(&device, |cb| {
            device.cmd_reset_query_pool(cb, pool, 0, 2);
            device.cmd_write_timestamp(cb, vk::PipelineStageFlags::TOP_OF_PIPE, pool, 0);
            device.cmd_dispatch(cb, 1, 1, 1);
            device.cmd_dispatch(cb, 1, 1, 1);
            device.cmd_write_timestamp(cb, vk::PipelineStageFlags::BOTTOM_OF_PIPE, pool, 1);
        });
        assert_eq!(device.timestamp_results(pool, 2).unwrap(), None);

        device.complete_submissions();
        let ticks = device.timestamp_results(pool, 2).unwrap().unwrap();
        assert_eq!(ticks[1] - ticks[0], 3);

        device.destroy_query_pool(pool);
        assert_eq!(device.query_pool_count(), 0);
    }

    #[test]
    fn test_injected_faults() {
        let device = NullDevice::new();
        let swapchain = device
            .create_swapchain(
                &NativeSwapchainDesc {
                    surface: vk::SurfaceKHR::null(),
                    extent: vk::Extent2D {
                        width: 64,
                        height: 64,
                    },
                    vsync: true,
                    transfer_source: false,
                },
                None,
            )
            .unwrap();
        let semaphore = device.create_semaphore().unwrap();
        assert_eq!(device.acquire_next_image(&swapchain, semaphore).unwrap(), 0);
        assert_eq!(device.acquire_next_image(&swapchain, semaphore).unwrap(), 1);

        device.set_out_of_date(true);
        assert!(matches!(
            device.acquire_next_image(&swapchain, semaphore),
            Err(RhiError::SwapChainOutOfDate)
        ));
        device.set_out_of_date(false);

        device.set_device_lost(true);
        assert!(matches!(device.wait_idle(), Err(RhiError::DeviceLost)));
        device.set_device_lost(false);

        device.fail_next_allocation();
        assert!(device
            .create_buffer(&NativeBufferDesc {
                name: "doomed",
                size: 4,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                placement: MemoryPlacement::HostVisible,
            })
            .is_err());

        device.destroy_swapchain(swapchain);
        device.destroy_semaphore(semaphore);
        assert_eq!(device.live_object_count(), 0);
    }
}

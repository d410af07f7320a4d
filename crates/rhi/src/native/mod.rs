//! The native device seam.
//!
//! Everything above this module records into [`crate::command::CommandList`]
//! and keeps bookkeeping; the graphics API is only reached through
//! [`NativeDevice`] (object lifetime, memory, synchronization, submission,
//! presentation) and [`NativeCommands`] (one method per replayed command).
//! Native handles are plain `ash::vk` handle values.
//!
//! Two implementations ship with the crate:
//! - [`AshDevice`] drives a real Vulkan 1.3 device.
//! - [`NullDevice`] simulates a device on the CPU for tests and headless runs.

mod null;
mod vulkan;

pub use null::{NullCall, NullDevice, NullSubmission};
pub use vulkan::AshDevice;

use std::ptr::NonNull;

use ash::vk;
use smallvec::SmallVec;

use crate::binding::LayoutBinding;
use crate::command::{AttachmentInfo, BufferBarrier, ImageBarrier, RenderingInheritance};
use crate::error::RhiResult;
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc};
use crate::resource::SamplerDesc;
use vkframe_core::PoolConfig;

/// Where buffer memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryPlacement {
    /// Device-local, not mappable.
    DeviceLocal,
    /// Host-visible and persistently mapped, for uploads and dynamic data.
    HostVisible,
    /// Host-visible and cached, for readbacks.
    HostReadback,
}

/// Native buffer creation parameters.
#[derive(Clone, Debug)]
pub struct NativeBufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub placement: MemoryPlacement,
}

/// Native image creation parameters. A default view over every level is
/// created alongside the image.
#[derive(Clone, Debug)]
pub struct NativeImageDesc<'a> {
    pub name: &'a str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub samples: u32,
    pub usage: vk::ImageUsageFlags,
}

/// An image plus its default view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

/// A persistently mapped buffer range.
#[derive(Clone, Copy, Debug)]
pub struct MappedRange {
    pub ptr: NonNull<u8>,
    pub len: usize,
}

/// What a descriptor write points at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DescriptorResource {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

/// One descriptor write.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub resource: DescriptorResource,
}

/// One queue submission.
#[derive(Clone, Debug)]
pub struct SubmitDesc {
    pub command_buffer: vk::CommandBuffer,
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal: Option<vk::Semaphore>,
    pub fence: vk::Fence,
}

/// Swapchain creation parameters.
#[derive(Clone, Copy, Debug)]
pub struct NativeSwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub extent: vk::Extent2D,
    pub vsync: bool,
    /// Images may be copied out for readback.
    pub transfer_source: bool,
}

/// A created swapchain with its images and views.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeSwapchain {
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: SmallVec<[vk::Image; 4]>,
    pub views: SmallVec<[vk::ImageView; 4]>,
}

/// Command-recording half of the seam. Every method maps to one replayed
/// [`crate::command::Command`].
#[allow(clippy::too_many_arguments)]
pub trait NativeCommands {
    fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_copy_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageCopy,
    );
    fn cmd_copy_image_to_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_blit_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageBlit,
        filter: vk::Filter,
    );
    fn cmd_pipeline_barrier(
        &self,
        cb: vk::CommandBuffer,
        buffers: &[BufferBarrier],
        images: &[ImageBarrier],
    );
    fn cmd_begin_rendering(
        &self,
        cb: vk::CommandBuffer,
        area: vk::Rect2D,
        colors: &[AttachmentInfo],
        depth: Option<&AttachmentInfo>,
        secondary_contents: bool,
    );
    fn cmd_end_rendering(&self, cb: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_set(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    );
    fn cmd_bind_vertex_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    );
    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    );
    fn cmd_set_viewport(&self, cb: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, cb: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_set_blend_constants(&self, cb: vk::CommandBuffer, constants: [f32; 4]);
    fn cmd_set_stencil_reference(&self, cb: vk::CommandBuffer, reference: u32);
    fn cmd_draw(
        &self,
        cb: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_begin_debug_label(&self, cb: vk::CommandBuffer, label: &str, color: [f32; 4]);
    fn cmd_end_debug_label(&self, cb: vk::CommandBuffer);
    fn cmd_insert_debug_label(&self, cb: vk::CommandBuffer, label: &str, color: [f32; 4]);
    fn cmd_execute_commands(&self, cb: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]);
    fn cmd_reset_query_pool(
        &self,
        cb: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    );
    fn cmd_write_timestamp(
        &self,
        cb: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    );
}

/// Object, memory, synchronization and queue half of the seam.
///
/// Destroy calls take handles the caller created through the same device and
/// never fail; a backend logs and ignores handles it does not know.
pub trait NativeDevice: NativeCommands + Send + Sync {
    // -- buffers ----------------------------------------------------------

    fn create_buffer(&self, desc: &NativeBufferDesc<'_>) -> RhiResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// The mapped range of a host-visible buffer, `None` for device-local
    /// memory.
    fn mapped_range(&self, buffer: vk::Buffer) -> Option<MappedRange>;

    // -- images -----------------------------------------------------------

    fn create_image(&self, desc: &NativeImageDesc<'_>) -> RhiResult<NativeImage>;
    /// Destroys an image together with its default view.
    fn destroy_image(&self, image: NativeImage);
    /// A view of a single mip level.
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        level: u32,
    ) -> RhiResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // -- layouts and pipelines --------------------------------------------

    fn create_binding_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> RhiResult<vk::DescriptorSetLayout>;
    fn destroy_binding_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(
        &self,
        set_layout: Option<vk::DescriptorSetLayout>,
    ) -> RhiResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline>;
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
        layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    /// Serialized pipeline cache, byte-for-byte as the driver produced it.
    fn pipeline_cache_data(&self) -> RhiResult<Vec<u8>>;
    /// Seeds the pipeline cache. Must be called before pipelines are built.
    fn set_pipeline_cache_data(&self, data: &[u8]) -> RhiResult<()>;

    // -- binding-set pools ------------------------------------------------

    fn create_descriptor_pool(&self, config: &PoolConfig) -> RhiResult<vk::DescriptorPool>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Allocates one set per layout. Fails with
    /// [`crate::RhiError::PoolExhausted`] when the pool has no room.
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>>;
    fn write_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // -- synchronization --------------------------------------------------

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Non-blocking query; `true` once signaled.
    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool>;
    /// Blocks until signaled. Fails with [`crate::RhiError::FenceTimeout`]
    /// after `timeout_ns`.
    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RhiResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()>;
    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // -- queries ----------------------------------------------------------

    /// Nanoseconds per timestamp tick, `None` when the graphics queue cannot
    /// write timestamps.
    fn timestamp_period(&self) -> Option<f32>;
    fn create_timestamp_pool(&self, count: u32) -> RhiResult<vk::QueryPool>;
    fn destroy_query_pool(&self, pool: vk::QueryPool);
    /// Non-blocking read of `count` timestamps. `None` until all of them are
    /// available.
    fn timestamp_results(&self, pool: vk::QueryPool, count: u32) -> RhiResult<Option<Vec<u64>>>;

    // -- command buffers --------------------------------------------------

    fn create_command_pool(&self) -> RhiResult<vk::CommandPool>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> RhiResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, cb: vk::CommandBuffer);
    /// Begins one-time recording. Secondary buffers pass the attachment
    /// formats of the pass they execute in.
    fn begin_command_buffer(
        &self,
        cb: vk::CommandBuffer,
        inheritance: Option<&RenderingInheritance>,
    ) -> RhiResult<()>;
    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> RhiResult<()>;

    // -- queue ------------------------------------------------------------

    fn submit(&self, submit: &SubmitDesc) -> RhiResult<()>;
    fn wait_idle(&self) -> RhiResult<()>;

    // -- presentation -----------------------------------------------------

    fn create_swapchain(
        &self,
        desc: &NativeSwapchainDesc,
        old: Option<&NativeSwapchain>,
    ) -> RhiResult<NativeSwapchain>;
    /// Destroys the swapchain together with its image views.
    fn destroy_swapchain(&self, swapchain: NativeSwapchain);
    /// Acquires the next image, signaling `signal` when it is ready.
    fn acquire_next_image(
        &self,
        swapchain: &NativeSwapchain,
        signal: vk::Semaphore,
    ) -> RhiResult<u32>;
    fn present(
        &self,
        swapchain: &NativeSwapchain,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RhiResult<()>;
}

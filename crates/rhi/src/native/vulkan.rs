//! Vulkan 1.3 implementation of the device seam.
//!
//! [`AshDevice`] wraps a logical device and queue created by the caller.
//! Memory comes from `gpu-allocator`, passes use dynamic rendering, and
//! presentation goes through the `VK_KHR_swapchain` loader.
//!
//! The caller keeps ownership of the instance and device and must drop the
//! `AshDevice` before destroying either.

use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use super::{
    DescriptorResource, DescriptorWrite, MappedRange, MemoryPlacement, NativeBufferDesc,
    NativeCommands, NativeDevice, NativeImage, NativeImageDesc, NativeSwapchain,
    NativeSwapchainDesc, SubmitDesc,
};
use crate::binding::LayoutBinding;
use crate::command::{AttachmentInfo, BufferBarrier, ImageBarrier, RenderingInheritance};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, ShaderStageDesc};
use crate::pool::pool_sizes;
use crate::resource::{aspect_mask, sample_count_flags, SamplerDesc};
use vkframe_core::PoolConfig;

/// A Vulkan device, queue and memory allocator.
pub struct AshDevice {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    /// Queue access is externally synchronized.
    queue: Mutex<vk::Queue>,
    allocator: Mutex<Allocator>,
    buffers: Mutex<FxHashMap<vk::Buffer, Allocation>>,
    images: Mutex<FxHashMap<vk::Image, Allocation>>,
    pipeline_cache: Mutex<vk::PipelineCache>,
    timestamp_period: Option<f32>,
    timestamp_mask: u64,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl AshDevice {
    /// Wraps a logical device.
    ///
    /// `queue_family` must support graphics, compute and presentation; queue
    /// 0 of that family is used for everything. Pass `debug_utils` only if
    /// `VK_EXT_debug_utils` was enabled on the instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator or pipeline cache cannot be created.
    pub fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        debug_utils: bool,
    ) -> RhiResult<Self> {
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;
        info!("GPU memory allocator initialized");

        let pipeline_cache = unsafe {
            device.create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)?
        };

        let limits = unsafe { instance.get_physical_device_properties(physical_device) }.limits;
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let valid_bits = families
            .get(queue_family as usize)
            .map_or(0, |family| family.timestamp_valid_bits);
        let timestamp_period =
            (valid_bits > 0 && limits.timestamp_period > 0.0).then_some(limits.timestamp_period);
        let timestamp_mask = match valid_bits {
            0 => 0,
            64.. => u64::MAX,
            bits => (1u64 << bits) - 1,
        };
        if timestamp_period.is_none() {
            debug!("Queue family {} cannot write timestamps", queue_family);
        }

        Ok(Self {
            surface_loader: ash::khr::surface::Instance::new(entry, instance),
            swapchain_loader: ash::khr::swapchain::Device::new(instance, &device),
            debug_utils: debug_utils.then(|| ash::ext::debug_utils::Device::new(instance, &device)),
            device,
            physical_device,
            queue_family,
            queue: Mutex::new(queue),
            allocator: Mutex::new(allocator),
            buffers: Mutex::new(FxHashMap::default()),
            images: Mutex::new(FxHashMap::default()),
            pipeline_cache: Mutex::new(pipeline_cache),
            timestamp_period,
            timestamp_mask,
        })
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> RhiResult<Allocation> {
        let mut allocator = lock(&self.allocator)?;
        Ok(allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?)
    }

    fn free(&self, allocation: Allocation) {
        let mut allocator = self.allocator.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = allocator.free(allocation) {
            error!("Failed to free allocation: {:?}", e);
        }
    }

    fn view(
        &self,
        image: vk::Image,
        format: vk::Format,
        base_level: u32,
        level_count: u32,
    ) -> RhiResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask(format))
                    .base_mip_level(base_level)
                    .level_count(level_count)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        Ok(unsafe { self.device.create_image_view(&create_info, None)? })
    }

    fn shader_module(&self, stage: &ShaderStageDesc) -> RhiResult<vk::ShaderModule> {
        if stage.spirv.is_empty() {
            return Err(RhiError::PipelineError(format!(
                "{:?} shader has no code",
                stage.stage
            )));
        }
        let create_info = vk::ShaderModuleCreateInfo::default().code(&stage.spirv);
        Ok(unsafe { self.device.create_shader_module(&create_info, None)? })
    }

    fn with_label(
        &self,
        label: &str,
        color: [f32; 4],
        f: impl FnOnce(&ash::ext::debug_utils::Device, &vk::DebugUtilsLabelEXT),
    ) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(label) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::default().label_name(&name).color(color);
        f(debug_utils, &label);
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        let pipeline_cache = *self
            .pipeline_cache
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        unsafe { self.device.destroy_pipeline_cache(pipeline_cache, None) };

        let buffers = self.buffers.get_mut().unwrap_or_else(PoisonError::into_inner);
        let images = self.images.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !buffers.is_empty() || !images.is_empty() {
            warn!(
                "Device dropped with {} buffers and {} images still allocated",
                buffers.len(),
                images.len()
            );
        }
        info!("Native device released");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> RhiResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| RhiError::InvalidState("device lock poisoned".to_string()))
}

fn memory_location(placement: MemoryPlacement) -> MemoryLocation {
    match placement {
        MemoryPlacement::DeviceLocal => MemoryLocation::GpuOnly,
        MemoryPlacement::HostVisible => MemoryLocation::CpuToGpu,
        MemoryPlacement::HostReadback => MemoryLocation::GpuToCpu,
    }
}

/// Combined source and destination stages of a barrier batch.
fn stage_masks(
    buffers: &[BufferBarrier],
    images: &[ImageBarrier],
) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
    let src = buffers
        .iter()
        .map(|b| b.src_stage)
        .chain(images.iter().map(|i| i.src_stage))
        .fold(vk::PipelineStageFlags::empty(), |acc, s| acc | s);
    let dst = buffers
        .iter()
        .map(|b| b.dst_stage)
        .chain(images.iter().map(|i| i.dst_stage))
        .fold(vk::PipelineStageFlags::empty(), |acc, s| acc | s);
    let src = if src.is_empty() {
        vk::PipelineStageFlags::TOP_OF_PIPE
    } else {
        src
    };
    let dst = if dst.is_empty() {
        vk::PipelineStageFlags::BOTTOM_OF_PIPE
    } else {
        dst
    };
    (src, dst)
}

fn attachment_info(attachment: &AttachmentInfo) -> vk::RenderingAttachmentInfo<'static> {
    let info = vk::RenderingAttachmentInfo::default()
        .image_view(attachment.view)
        .image_layout(attachment.layout)
        .load_op(attachment.load_op)
        .store_op(attachment.store_op)
        .clear_value(attachment.clear.to_vk());
    match attachment.resolve {
        Some(view) => info
            .resolve_mode(vk::ResolveModeFlags::AVERAGE)
            .resolve_image_view(view)
            .resolve_image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        None => info,
    }
}

impl NativeCommands for AshDevice {
    fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        unsafe { self.device.cmd_copy_buffer(cb, src, dst, &[region]) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer_to_image(cb, src, dst, layout, regions) };
    }

    fn cmd_copy_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageCopy,
    ) {
        unsafe {
            self.device
                .cmd_copy_image(cb, src, src_layout, dst, dst_layout, &[region])
        };
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.device.cmd_copy_image_to_buffer(cb, src, layout, dst, regions) };
    }

    fn cmd_blit_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageBlit,
        filter: vk::Filter,
    ) {
        unsafe {
            self.device
                .cmd_blit_image(cb, src, src_layout, dst, dst_layout, &[region], filter)
        };
    }

    fn cmd_pipeline_barrier(
        &self,
        cb: vk::CommandBuffer,
        buffers: &[BufferBarrier],
        images: &[ImageBarrier],
    ) {
        let (src_stage, dst_stage) = stage_masks(buffers, images);
        let buffer_barriers: SmallVec<[vk::BufferMemoryBarrier; 8]> = buffers
            .iter()
            .map(|b| {
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(b.src_access)
                    .dst_access_mask(b.dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(b.buffer)
                    .offset(b.offset)
                    .size(b.size)
            })
            .collect();
        let image_barriers: SmallVec<[vk::ImageMemoryBarrier; 8]> = images
            .iter()
            .map(|i| {
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(i.src_access)
                    .dst_access_mask(i.dst_access)
                    .old_layout(i.old_layout)
                    .new_layout(i.new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(i.image)
                    .subresource_range(i.range.to_vk())
            })
            .collect();
        unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &buffer_barriers,
                &image_barriers,
            );
        }
    }

    fn cmd_begin_rendering(
        &self,
        cb: vk::CommandBuffer,
        area: vk::Rect2D,
        colors: &[AttachmentInfo],
        depth: Option<&AttachmentInfo>,
        secondary_contents: bool,
    ) {
        let color_attachments: SmallVec<[vk::RenderingAttachmentInfo; 4]> =
            colors.iter().map(attachment_info).collect();
        let depth_attachment = depth.map(attachment_info);
        let flags = if secondary_contents {
            vk::RenderingFlags::CONTENTS_SECONDARY_COMMAND_BUFFERS
        } else {
            vk::RenderingFlags::empty()
        };
        let mut rendering_info = vk::RenderingInfo::default()
            .flags(flags)
            .render_area(area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }
        unsafe { self.device.cmd_begin_rendering(cb, &rendering_info) };
    }

    fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(cb) };
    }

    fn cmd_bind_pipeline(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(cb, bind_point, pipeline) };
    }

    fn cmd_bind_descriptor_set(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(cb, bind_point, layout, 0, &[set], dynamic_offsets)
        };
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cb, first_binding, buffers, offsets)
        };
    }

    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        unsafe { self.device.cmd_bind_index_buffer(cb, buffer, offset, index_type) };
    }

    fn cmd_set_viewport(&self, cb: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(cb, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, cb: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(cb, 0, &[scissor]) };
    }

    fn cmd_set_blend_constants(&self, cb: vk::CommandBuffer, constants: [f32; 4]) {
        unsafe { self.device.cmd_set_blend_constants(cb, &constants) };
    }

    fn cmd_set_stencil_reference(&self, cb: vk::CommandBuffer, reference: u32) {
        unsafe {
            self.device
                .cmd_set_stencil_reference(cb, vk::StencilFaceFlags::FRONT_AND_BACK, reference)
        };
    }

    fn cmd_draw(
        &self,
        cb: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw(cb, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                cb,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cb, x, y, z) };
    }

    fn cmd_begin_debug_label(&self, cb: vk::CommandBuffer, label: &str, color: [f32; 4]) {
        self.with_label(label, color, |utils, label| unsafe {
            utils.cmd_begin_debug_utils_label(cb, label)
        });
    }

    fn cmd_end_debug_label(&self, cb: vk::CommandBuffer) {
        if let Some(utils) = &self.debug_utils {
            unsafe { utils.cmd_end_debug_utils_label(cb) };
        }
    }

    fn cmd_insert_debug_label(&self, cb: vk::CommandBuffer, label: &str, color: [f32; 4]) {
        self.with_label(label, color, |utils, label| unsafe {
            utils.cmd_insert_debug_utils_label(cb, label)
        });
    }

    fn cmd_execute_commands(&self, cb: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        unsafe { self.device.cmd_execute_commands(cb, secondaries) };
    }

    fn cmd_reset_query_pool(
        &self,
        cb: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) {
        unsafe { self.device.cmd_reset_query_pool(cb, pool, first, count) };
    }

    fn cmd_write_timestamp(
        &self,
        cb: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    ) {
        unsafe { self.device.cmd_write_timestamp(cb, stage, pool, query) };
    }
}

impl NativeDevice for AshDevice {
    fn create_buffer(&self, desc: &NativeBufferDesc<'_>) -> RhiResult<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let location = memory_location(desc.placement);
        let allocation = match self.allocate(desc.name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        lock(&self.buffers)?.insert(buffer, allocation);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let allocation = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&buffer);
        match allocation {
            Some(allocation) => self.free(allocation),
            None => warn!("Destroying buffer without a tracked allocation"),
        }
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn mapped_range(&self, buffer: vk::Buffer) -> Option<MappedRange> {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let allocation = buffers.get(&buffer)?;
        let ptr = allocation.mapped_ptr()?;
        Some(MappedRange {
            ptr: NonNull::new(ptr.as_ptr().cast::<u8>())?,
            len: allocation.size() as usize,
        })
    }

    fn create_image(&self, desc: &NativeImageDesc<'_>) -> RhiResult<NativeImage> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(sample_count_flags(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let location = MemoryLocation::GpuOnly;
        let allocation = match self.allocate(desc.name, requirements, location, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        let view = bound
            .map_err(RhiError::from)
            .and_then(|()| self.view(image, desc.format, 0, desc.mip_levels));
        match view {
            Ok(view) => {
                lock(&self.images)?.insert(image, allocation);
                debug!("Created image '{}'", desc.name);
                Ok(NativeImage { image, view })
            }
            Err(e) => {
                self.free(allocation);
                unsafe { self.device.destroy_image(image, None) };
                Err(e)
            }
        }
    }

    fn destroy_image(&self, image: NativeImage) {
        unsafe { self.device.destroy_image_view(image.view, None) };
        let allocation = self
            .images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&image.image);
        if let Some(allocation) = allocation {
            self.free(allocation);
        }
        unsafe { self.device.destroy_image(image.image, None) };
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        level: u32,
    ) -> RhiResult<vk::ImageView> {
        self.view(image, format, level, 1)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<vk::Sampler> {
        let (mipmap_mode, max_lod) = match desc.mipmap {
            Some(filter) => (filter.to_vk_mipmap(), vk::LOD_CLAMP_NONE),
            None => (vk::SamplerMipmapMode::NEAREST, 0.0),
        };
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter.to_vk())
            .min_filter(desc.min_filter.to_vk())
            .mipmap_mode(mipmap_mode)
            .address_mode_u(desc.address_u.to_vk())
            .address_mode_v(desc.address_v.to_vk())
            .address_mode_w(desc.address_w.to_vk())
            .min_lod(0.0)
            .max_lod(max_lod);
        Ok(unsafe { self.device.create_sampler(&create_info, None)? })
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_binding_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(b.stages)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        Ok(unsafe { self.device.create_descriptor_set_layout(&create_info, None)? })
    }

    fn destroy_binding_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layout: Option<vk::DescriptorSetLayout>,
    ) -> RhiResult<vk::PipelineLayout> {
        let set_layouts: SmallVec<[vk::DescriptorSetLayout; 1]> = set_layout.into_iter().collect();
        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        Ok(unsafe { self.device.create_pipeline_layout(&create_info, None)? })
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline> {
        let entry_points = desc
            .stages
            .iter()
            .map(|s| CString::new(s.entry_point.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RhiError::PipelineError(format!("invalid entry point: {e}")))?;

        let mut modules = Vec::with_capacity(desc.stages.len());
        for stage in &desc.stages {
            match self.shader_module(stage) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for module in modules {
                        unsafe { self.device.destroy_shader_module(module, None) };
                    }
                    return Err(e);
                }
            }
        }
        let shader_stages: Vec<vk::PipelineShaderStageCreateInfo> = desc
            .stages
            .iter()
            .zip(&modules)
            .zip(&entry_points)
            .map(|((stage, &module), name)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage.to_vk())
                    .module(module)
                    .name(name)
            })
            .collect();

        let vertex_bindings = desc.vertex_input.vk_bindings();
        let vertex_attributes = desc.vertex_input.vk_attributes();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.topology.to_vk())
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(desc.line_width)
            .cull_mode(desc.cull_mode.to_vk())
            .front_face(desc.front_face.to_vk());

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(sample_count_flags(desc.sample_count));

        let has_depth = desc.depth_format.is_some();
        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(has_depth && desc.depth_test)
            .depth_write_enable(has_depth && desc.depth_write)
            .depth_compare_op(desc.depth_compare.to_vk())
            .stencil_test_enable(has_depth && desc.stencil_test);

        let color_blend_attachments = desc.vk_blend_attachments();
        let color_blend_state =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

        let dynamic_states = desc.dynamic_states();
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&desc.color_formats);
        if let Some(depth_format) = desc.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
            if aspect_mask(depth_format).contains(vk::ImageAspectFlags::STENCIL) {
                rendering_info = rendering_info.stencil_attachment_format(depth_format);
            }
        }

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let cache = *lock(&self.pipeline_cache)?;
        let result = unsafe {
            self.device
                .create_graphics_pipelines(cache, &[pipeline_info], None)
        };
        for module in modules {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
        let pipelines = result.map_err(|(_, e)| RhiError::PipelineError(format!("{e:?}")))?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::PipelineError("no pipeline returned".to_string()))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
        layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline> {
        let entry_point = CString::new(desc.shader.entry_point.as_str())
            .map_err(|e| RhiError::PipelineError(format!("invalid entry point: {e}")))?;
        let module = self.shader_module(&desc.shader)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let cache = *lock(&self.pipeline_cache)?;
        let result = unsafe {
            self.device
                .create_compute_pipelines(cache, &[pipeline_info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };
        let pipelines = result.map_err(|(_, e)| RhiError::PipelineError(format!("{e:?}")))?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::PipelineError("no pipeline returned".to_string()))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn pipeline_cache_data(&self) -> RhiResult<Vec<u8>> {
        let cache = *lock(&self.pipeline_cache)?;
        Ok(unsafe { self.device.get_pipeline_cache_data(cache)? })
    }

    fn set_pipeline_cache_data(&self, data: &[u8]) -> RhiResult<()> {
        let mut cache = lock(&self.pipeline_cache)?;
        let seeded = unsafe {
            self.device.create_pipeline_cache(
                &vk::PipelineCacheCreateInfo::default().initial_data(data),
                None,
            )
        };
        let replacement = match seeded {
            Ok(seeded) => seeded,
            Err(e) => {
                warn!("Pipeline cache data rejected ({:?}); starting empty", e);
                unsafe {
                    self.device
                        .create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)?
                }
            }
        };
        unsafe { self.device.destroy_pipeline_cache(*cache, None) };
        *cache = replacement;
        debug!("Pipeline cache seeded with {} bytes", data.len());
        Ok(())
    }

    fn create_descriptor_pool(&self, config: &PoolConfig) -> RhiResult<vk::DescriptorPool> {
        let sizes = pool_sizes(config);
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(config.max_sets)
            .pool_sizes(&sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&create_info, None)? })
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?
        };
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        Ok(unsafe { self.device.allocate_descriptor_sets(&alloc_info)? })
    }

    fn write_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = writes
            .iter()
            .map(|w| match w.resource {
                DescriptorResource::Buffer {
                    buffer,
                    offset,
                    range,
                } => vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range,
                },
                DescriptorResource::Image { .. } => vk::DescriptorBufferInfo::default(),
            })
            .collect();
        let image_infos: Vec<vk::DescriptorImageInfo> = writes
            .iter()
            .map(|w| match w.resource {
                DescriptorResource::Image {
                    view,
                    sampler,
                    layout,
                } => vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                },
                DescriptorResource::Buffer { .. } => vk::DescriptorImageInfo::default(),
            })
            .collect();
        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(w.set)
                    .dst_binding(w.binding)
                    .descriptor_type(w.descriptor_type);
                match w.resource {
                    DescriptorResource::Buffer { .. } => {
                        write.buffer_info(std::slice::from_ref(&buffer_infos[i]))
                    }
                    DescriptorResource::Image { .. } => {
                        write.image_info(std::slice::from_ref(&image_infos[i]))
                    }
                }
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&create_info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RhiResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns)? };
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn timestamp_period(&self) -> Option<f32> {
        self.timestamp_period
    }

    fn create_timestamp_pool(&self, count: u32) -> RhiResult<vk::QueryPool> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        Ok(unsafe { self.device.create_query_pool(&create_info, None)? })
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) };
    }

    fn timestamp_results(&self, pool: vk::QueryPool, count: u32) -> RhiResult<Option<Vec<u64>>> {
        let mut ticks = vec![0u64; count as usize];
        let result = unsafe {
            self.device
                .get_query_pool_results(pool, 0, &mut ticks, vk::QueryResultFlags::TYPE_64)
        };
        match result {
            Ok(()) => Ok(Some(
                ticks.into_iter().map(|t| t & self.timestamp_mask).collect(),
            )),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_pool(&self) -> RhiResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.queue_family);
        Ok(unsafe { self.device.create_command_pool(&create_info, None)? })
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())?
        };
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> RhiResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN))
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, cb: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[cb]) };
    }

    fn begin_command_buffer(
        &self,
        cb: vk::CommandBuffer,
        inheritance: Option<&RenderingInheritance>,
    ) -> RhiResult<()> {
        match inheritance {
            None => {
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                unsafe { self.device.begin_command_buffer(cb, &begin_info)? };
            }
            Some(inheritance) => {
                let depth_format = inheritance.depth_format.unwrap_or(vk::Format::UNDEFINED);
                let mut rendering = vk::CommandBufferInheritanceRenderingInfo::default()
                    .color_attachment_formats(&inheritance.color_formats)
                    .depth_attachment_format(depth_format)
                    .rasterization_samples(sample_count_flags(inheritance.samples));
                let inheritance_info =
                    vk::CommandBufferInheritanceInfo::default().push_next(&mut rendering);
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(
                        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                            | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
                    )
                    .inheritance_info(&inheritance_info);
                unsafe { self.device.begin_command_buffer(cb, &begin_info)? };
            }
        }
        Ok(())
    }

    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> RhiResult<()> {
        unsafe { self.device.end_command_buffer(cb)? };
        Ok(())
    }

    fn submit(&self, submit: &SubmitDesc) -> RhiResult<()> {
        let command_buffers = [submit.command_buffer];
        let wait_semaphores: SmallVec<[vk::Semaphore; 1]> =
            submit.wait.iter().map(|&(semaphore, _)| semaphore).collect();
        let wait_stages: SmallVec<[vk::PipelineStageFlags; 1]> =
            submit.wait.iter().map(|&(_, stage)| stage).collect();
        let signal_semaphores: SmallVec<[vk::Semaphore; 1]> = submit.signal.into_iter().collect();
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let queue = lock(&self.queue)?;
        unsafe { self.device.queue_submit(*queue, &[submit_info], submit.fence)? };
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let _queue = lock(&self.queue)?;
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn create_swapchain(
        &self,
        desc: &NativeSwapchainDesc,
        old: Option<&NativeSwapchain>,
    ) -> RhiResult<NativeSwapchain> {
        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                self.physical_device,
                self.queue_family,
                desc.surface,
            )?
        };
        if !supported {
            return Err(RhiError::SwapchainError(
                "queue family cannot present to the surface".to_string(),
            ));
        }

        let support = SwapchainSupportDetails::query(
            self.physical_device,
            desc.surface,
            &self.surface_loader,
        )?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "Inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        }

        let surface_format = choose_surface_format(&support.formats);
        let present_mode = if desc.vsync {
            vk::PresentModeKHR::FIFO
        } else {
            choose_present_mode(&support.present_modes)
        };
        let extent = choose_extent(&support.capabilities, desc.extent.width, desc.extent.height);
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::SwapChainOutOfDate);
        }
        let image_count = determine_image_count(&support.capabilities);

        info!(
            "Creating swapchain: {}x{}, format {:?}, present mode {:?}, {} images",
            extent.width, extent.height, surface_format.format, present_mode, image_count
        );

        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST;
        if desc.transfer_source {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |o| o.handle));

        let handle = unsafe { self.swapchain_loader.create_swapchain(&create_info, None)? };
        let images = match unsafe { self.swapchain_loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.swapchain_loader.destroy_swapchain(handle, None) };
                return Err(e.into());
            }
        };

        let mut views = SmallVec::new();
        for &image in &images {
            match self.view(image, surface_format.format, 0, 1) {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        unsafe { self.device.destroy_image_view(view, None) };
                    }
                    unsafe { self.swapchain_loader.destroy_swapchain(handle, None) };
                    return Err(RhiError::SwapchainError(format!(
                        "Failed to create image view: {e}"
                    )));
                }
            }
        }
        info!("Swapchain created with {} images", images.len());

        Ok(NativeSwapchain {
            handle,
            format: surface_format.format,
            extent,
            images: images.into_iter().collect(),
            views,
        })
    }

    fn destroy_swapchain(&self, swapchain: NativeSwapchain) {
        for view in swapchain.views {
            unsafe { self.device.destroy_image_view(view, None) };
        }
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain.handle, None) };
        debug!("Swapchain destroyed");
    }

    fn acquire_next_image(
        &self,
        swapchain: &NativeSwapchain,
        signal: vk::Semaphore,
    ) -> RhiResult<u32> {
        let (index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain.handle,
                u64::MAX,
                signal,
                vk::Fence::null(),
            )?
        };
        if suboptimal {
            // The semaphore will still be signaled, so the image has to be used.
            debug!("Acquired image from a suboptimal swapchain");
        }
        Ok(index)
    }

    fn present(
        &self,
        swapchain: &NativeSwapchain,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RhiResult<()> {
        let swapchains = [swapchain.handle];
        let image_indices = [image_index];
        let wait_semaphores = [wait];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = lock(&self.queue)?;
        let suboptimal = unsafe { self.swapchain_loader.queue_present(*queue, &present_info)? };
        if suboptimal {
            return Err(RhiError::SwapChainOutOfDate);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Swapchain selection
// ---------------------------------------------------------------------------

/// Swapchain surface support details.
#[derive(Debug, Clone)]
struct SwapchainSupportDetails {
    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> RhiResult<Self> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };

        debug!(
            "Swapchain support: {} formats, {} present modes, image count: {}-{}",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count,
            if capabilities.max_image_count == 0 {
                "unlimited".to_string()
            } else {
                capabilities.max_image_count.to_string()
            }
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    #[inline]
    fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Prefers B8G8R8A8_SRGB, then B8G8R8A8_UNORM, then whatever comes first.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let find = |format: vk::Format| {
        formats
            .iter()
            .find(|f| f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .copied()
    };
    if let Some(format) = find(vk::Format::B8G8R8A8_SRGB) {
        return format;
    }
    if let Some(format) = find(vk::Format::B8G8R8A8_UNORM) {
        warn!("Using fallback surface format: B8G8R8A8_UNORM with SRGB_NONLINEAR");
        return format;
    }
    warn!("Using first available surface format: {:?}", formats[0].format);
    formats[0]
}

/// MAILBOX when available, otherwise FIFO (always supported).
fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's current extent, or the requested size clamped to its
/// limits when the surface leaves it to the swapchain.
fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum when there is one.
fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

// Safety: every ash handle and loader is Send + Sync, and mutable state is
// behind mutexes.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<AshDevice>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ImageRange;

    #[test]
    fn test_choose_surface_format_prefers_srgb() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn test_choose_surface_format_fallback() {
        let formats = vec![vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_choose_present_mode() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::MAILBOX);
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_choose_extent_clamps_to_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 2000,
                height: 2000,
            },
            ..Default::default()
        };
        assert_eq!(
            choose_extent(&capabilities, 3000, 50),
            vk::Extent2D {
                width: 2000,
                height: 100
            }
        );

        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..capabilities
        };
        assert_eq!(choose_extent(&fixed, 800, 600).width, 1920);
    }

    #[test]
    fn test_determine_image_count() {
        let capped = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capped), 2);
        let unlimited = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&unlimited), 3);
    }

    #[test]
    fn test_stage_masks_union() {
        let buffer = BufferBarrier {
            buffer: vk::Buffer::null(),
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_access: vk::AccessFlags::SHADER_WRITE,
            dst_access: vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_stage: vk::PipelineStageFlags::VERTEX_INPUT,
        };
        let image = ImageBarrier {
            image: vk::Image::null(),
            range: ImageRange::color(1),
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::empty(),
            dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        };
        let (src, dst) = stage_masks(&[buffer], &[image]);
        assert_eq!(src, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(
            dst,
            vk::PipelineStageFlags::VERTEX_INPUT | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(
            stage_masks(&[], &[]),
            (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE
            )
        );
    }

    #[test]
    fn test_memory_location() {
        assert_eq!(memory_location(MemoryPlacement::DeviceLocal), MemoryLocation::GpuOnly);
        assert_eq!(memory_location(MemoryPlacement::HostVisible), MemoryLocation::CpuToGpu);
        assert_eq!(memory_location(MemoryPlacement::HostReadback), MemoryLocation::GpuToCpu);
    }
}

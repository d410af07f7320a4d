//! Passes, bindings, draws and secondary command lists.
//!
//! Every resource a pass touches is recorded by the pass tracker as it is
//! bound. When the pass ends, the tracker's barriers are written into the
//! batch marker appended at pass begin, so they replay before the pass body.

use ash::vk;
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::{FrameKind, Rhi};
use crate::binding::{BindingResource, StorageAccess};
use crate::command::{
    AttachmentInfo, ClearValue, CommandList, ImageRange, PreparedBindingSet, PreparedBuffer,
    PreparedIndexBuffer, PreparedPipeline, RenderingInheritance,
};
use crate::error::{RhiError, RhiResult};
use crate::native::NativeDevice;
use crate::resource::*;
use crate::tracker::{
    BufferAccess, BufferStage, ComputeHazards, PassResourceTracker, TextureAccess, TextureStage,
};
use crate::update::ResourceUpdateBatch;

/// Where a render pass draws.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassTarget {
    /// The image acquired by the current frame, plus the swapchain's depth
    /// buffer if it has one.
    SwapChain(SwapChainId),
    RenderTarget(RenderTargetId),
}

/// How a render pass starts.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PassOptions {
    /// Clear color attachments to this value; load them otherwise.
    pub color_clear: Option<[f32; 4]>,
    /// Clear depth and stencil; load them otherwise.
    pub depth_clear: Option<(f32, u32)>,
    /// The pass body is recorded only through secondary command lists.
    pub uses_secondaries: bool,
}

impl PassOptions {
    pub fn clear(color: [f32; 4]) -> Self {
        Self {
            color_clear: Some(color),
            depth_clear: Some((1.0, 0)),
            uses_secondaries: false,
        }
    }
}

#[derive(Debug)]
pub(super) enum PassKind {
    Render {
        uses_secondaries: bool,
        inheritance: RenderingInheritance,
    },
    Compute,
}

/// A storage binding checked for hazards before each dispatch.
#[derive(Clone, Copy, Debug)]
enum StorageUse {
    Buffer(vk::Buffer, BufferAccess),
    Image(vk::Image, ImageRange, TextureAccess),
}

#[derive(Debug)]
pub(super) struct ActivePass {
    kind: PassKind,
    /// Barrier batch marker written at pass end.
    batch: u32,
    tracker: PassResourceTracker,
    hazards: ComputeHazards,
    /// Layout and bind point of the bound pipeline.
    pipeline: Option<(vk::PipelineLayout, vk::PipelineBindPoint)>,
    storage: Vec<StorageUse>,
}

impl ActivePass {
    fn new(kind: PassKind, batch: u32) -> Self {
        Self {
            kind,
            batch,
            tracker: PassResourceTracker::new(),
            hazards: ComputeHazards::default(),
            pipeline: None,
            storage: Vec::new(),
        }
    }

    fn is_compute(&self) -> bool {
        matches!(self.kind, PassKind::Compute)
    }
}

fn storage_buffer_access(access: StorageAccess) -> BufferAccess {
    match access {
        StorageAccess::Load => BufferAccess::StorageLoad,
        StorageAccess::Store => BufferAccess::StorageStore,
        StorageAccess::LoadStore => BufferAccess::StorageLoadStore,
    }
}

fn storage_texture_access(access: StorageAccess) -> TextureAccess {
    match access {
        StorageAccess::Load => TextureAccess::StorageLoad,
        StorageAccess::Store => TextureAccess::StorageStore,
        StorageAccess::LoadStore => TextureAccess::StorageLoadStore,
    }
}

fn load_op(clear: bool) -> vk::AttachmentLoadOp {
    if clear {
        vk::AttachmentLoadOp::CLEAR
    } else {
        vk::AttachmentLoadOp::LOAD
    }
}

fn depth_attachment(view: vk::ImageView, options: &PassOptions) -> AttachmentInfo {
    let (depth, stencil) = options.depth_clear.unwrap_or((1.0, 0));
    AttachmentInfo {
        view,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        load_op: load_op(options.depth_clear.is_some()),
        store_op: vk::AttachmentStoreOp::STORE,
        clear: ClearValue::DepthStencil { depth, stencil },
        resolve: None,
    }
}

/// Attachments of a render pass being set up.
#[derive(Default)]
struct PassAttachments {
    colors: SmallVec<[AttachmentInfo; 4]>,
    depth: Option<AttachmentInfo>,
    inheritance: RenderingInheritance,
    extent: vk::Extent2D,
}

impl<D: NativeDevice> Rhi<D> {
    // -- render passes ------------------------------------------------------

    /// Starts a render pass. `updates` are recorded first, outside the pass.
    pub fn begin_pass(
        &mut self,
        target: PassTarget,
        options: PassOptions,
        updates: Option<ResourceUpdateBatch>,
    ) -> RhiResult<()> {
        self.require_frame("begin_pass")?;
        if self.pass.is_some() {
            return Err(RhiError::InvalidState("a pass is already open".to_string()));
        }
        if let Some(batch) = updates {
            self.apply_updates(batch)?;
        }

        let mut tracker = PassResourceTracker::new();
        let attachments = match target {
            PassTarget::SwapChain(id) => self.swapchain_attachments(id, &options, &mut tracker)?,
            PassTarget::RenderTarget(id) => {
                self.render_target_attachments(id, &options, &mut tracker)?
            }
        };

        let batch = self.list.transition_pass_resources();
        self.list.begin_pass(
            vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: attachments.extent,
            },
            &attachments.colors,
            attachments.depth,
            options.uses_secondaries,
        );
        let mut pass = ActivePass::new(
            PassKind::Render {
                uses_secondaries: options.uses_secondaries,
                inheritance: attachments.inheritance,
            },
            batch,
        );
        pass.tracker = tracker;
        self.pass = Some(pass);
        Ok(())
    }

    fn swapchain_attachments(
        &mut self,
        id: SwapChainId,
        options: &PassOptions,
        tracker: &mut PassResourceTracker,
    ) -> RhiResult<PassAttachments> {
        let tag = self.pacer.current_tag();
        let Some(frame) = self.frame.as_mut() else {
            return Err(RhiError::InvalidState("no frame is being recorded".to_string()));
        };
        let FrameKind::Swapchain {
            id: presenting,
            image_index,
            ref mut image_state,
        } = frame.kind
        else {
            return Err(RhiError::InvalidState(
                "offscreen frames cannot render to a swapchain".to_string(),
            ));
        };
        if presenting != id {
            return Err(RhiError::InvalidState(
                "the swapchain is not the one this frame presents to".to_string(),
            ));
        }

        let record = self.store.usable_mut(id)?;
        let native = record.native.as_ref().ok_or_else(|| {
            RhiError::InvalidState(format!("swapchain '{}' has no images", record.meta.name))
        })?;
        let index = image_index as usize;
        let (Some(&image), Some(&view)) = (native.images.get(index), native.views.get(index))
        else {
            return Err(RhiError::InvalidState(format!(
                "swapchain '{}' has no image {}",
                record.meta.name, image_index
            )));
        };
        let format = native.format;
        let extent = native.extent;
        let depth_buffer = record.desc.depth_stencil;
        let samples = if record.msaa.is_empty() {
            1
        } else {
            record.desc.sample_count.max(1)
        };

        tracker.track_texture(
            image,
            ImageRange::color(1),
            image_state,
            TextureAccess::ColorOutput,
            TextureStage::ColorAttachmentOutput.to_vk(),
        );
        let mut color = AttachmentInfo {
            view,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            load_op: load_op(options.color_clear.is_some()),
            store_op: vk::AttachmentStoreOp::STORE,
            clear: ClearValue::Color(options.color_clear.unwrap_or_default()),
            resolve: None,
        };
        // Multisampled swapchains draw into their own image and resolve into
        // the presented one.
        if let (Some(target), Some(state)) =
            (record.msaa.get(index), record.msaa_usage.get_mut(index))
        {
            tracker.track_texture(
                target.image,
                ImageRange::color(1),
                state,
                TextureAccess::ColorOutput,
                TextureStage::ColorAttachmentOutput.to_vk(),
            );
            color.view = target.view;
            color.store_op = vk::AttachmentStoreOp::DONT_CARE;
            color.resolve = Some(view);
        }

        let mut out = PassAttachments {
            extent,
            ..Default::default()
        };
        out.colors.push(color);
        out.inheritance.color_formats.push(format);
        out.inheritance.samples = samples;

        if let Some(depth) = depth_buffer {
            let record = self.store.usable_mut(depth)?;
            if record.desc.extent != extent {
                warn!(
                    "Depth buffer '{}' is {}x{} but the swapchain is {}x{}",
                    record.meta.name,
                    record.desc.extent.width,
                    record.desc.extent.height,
                    extent.width,
                    extent.height
                );
            }
            let format = record.desc.format;
            tracker.track_texture(
                record.image,
                ImageRange::new(aspect_mask(format), 0, 1),
                &mut record.usage,
                TextureAccess::DepthStencilOutput,
                TextureStage::FragmentTests.to_vk(),
            );
            out.depth = Some(depth_attachment(record.view, options));
            out.inheritance.depth_format = Some(format);
            self.store.touch(depth.into(), tag);
        }
        self.store.touch(id.into(), tag);
        Ok(out)
    }

    fn render_target_attachments(
        &mut self,
        id: RenderTargetId,
        options: &PassOptions,
        tracker: &mut PassResourceTracker,
    ) -> RhiResult<PassAttachments> {
        let tag = self.pacer.current_tag();
        let record = self.store.usable(id)?;
        if self.store.is_stale(&record.attached) {
            return Err(RhiError::InvalidState(format!(
                "render target '{}' refers to recreated attachments; create it again",
                record.meta.name
            )));
        }
        let desc = record.desc.clone();
        let color_views = record.color_views.clone();
        let resolve_views = record.resolve_views.clone();
        let depth_view = record.depth_view;
        let mut out = PassAttachments {
            extent: record.extent,
            ..Default::default()
        };
        out.inheritance.color_formats = record.color_formats.iter().copied().collect();
        out.inheritance.depth_format = record.depth_format;
        out.inheritance.samples = 1;

        for (i, (attachment, view)) in desc.color.iter().zip(color_views).enumerate() {
            out.inheritance.samples = self.track_attachment(
                tracker,
                attachment,
                TextureAccess::ColorOutput,
                TextureStage::ColorAttachmentOutput,
            )?;
            let resolve = resolve_views.get(i).copied().flatten();
            if let (Some(texture), Some(_)) = (attachment.resolve, resolve) {
                let target = AttachmentDesc {
                    level: attachment.resolve_level,
                    ..AttachmentDesc::texture(texture)
                };
                self.track_attachment(
                    tracker,
                    &target,
                    TextureAccess::ColorOutput,
                    TextureStage::ColorAttachmentOutput,
                )?;
            }
            out.colors.push(AttachmentInfo {
                view,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                load_op: load_op(options.color_clear.is_some()),
                store_op: vk::AttachmentStoreOp::STORE,
                clear: ClearValue::Color(options.color_clear.unwrap_or_default()),
                resolve,
            });
        }
        if let (Some(attachment), Some(view)) = (desc.depth_stencil, depth_view) {
            out.inheritance.samples = self.track_attachment(
                tracker,
                &attachment,
                TextureAccess::DepthStencilOutput,
                TextureStage::FragmentTests,
            )?;
            out.depth = Some(depth_attachment(view, options));
        }
        self.store.touch(id.into(), tag);
        Ok(out)
    }

    /// Tracks one attachment image and returns its sample count.
    fn track_attachment(
        &mut self,
        tracker: &mut PassResourceTracker,
        attachment: &AttachmentDesc,
        access: TextureAccess,
        stage: TextureStage,
    ) -> RhiResult<u32> {
        let tag = self.pacer.current_tag();
        let samples = match attachment.source {
            AttachmentSource::Texture(texture) => {
                let record = self.store.usable_mut(texture)?;
                tracker.track_texture(
                    record.image,
                    ImageRange::new(aspect_mask(record.desc.format), attachment.level, 1),
                    &mut record.usage,
                    access,
                    stage.to_vk(),
                );
                record.desc.sample_count
            }
            AttachmentSource::RenderBuffer(render_buffer) => {
                let record = self.store.usable_mut(render_buffer)?;
                tracker.track_texture(
                    record.image,
                    ImageRange::new(aspect_mask(record.desc.format), 0, 1),
                    &mut record.usage,
                    access,
                    stage.to_vk(),
                );
                record.desc.sample_count
            }
        };
        self.store.touch(attachment.source.into(), tag);
        Ok(samples.max(1))
    }

    /// Ends the render pass and fills in its barriers. `updates` are recorded
    /// after the pass.
    pub fn end_pass(&mut self, updates: Option<ResourceUpdateBatch>) -> RhiResult<()> {
        self.close_pass(false)?;
        self.list.end_pass();
        match updates {
            Some(batch) => self.apply_updates(batch),
            None => Ok(()),
        }
    }

    // -- compute passes -----------------------------------------------------

    /// Starts a compute pass. `updates` are recorded first.
    pub fn begin_compute_pass(&mut self, updates: Option<ResourceUpdateBatch>) -> RhiResult<()> {
        self.require_frame("begin_compute_pass")?;
        if self.pass.is_some() {
            return Err(RhiError::InvalidState("a pass is already open".to_string()));
        }
        if let Some(batch) = updates {
            self.apply_updates(batch)?;
        }
        let batch = self.list.transition_pass_resources();
        self.pass = Some(ActivePass::new(PassKind::Compute, batch));
        Ok(())
    }

    pub fn end_compute_pass(&mut self, updates: Option<ResourceUpdateBatch>) -> RhiResult<()> {
        self.close_pass(true)?;
        match updates {
            Some(batch) => self.apply_updates(batch),
            None => Ok(()),
        }
    }

    fn close_pass(&mut self, compute: bool) -> RhiResult<()> {
        match &self.pass {
            None => return Err(RhiError::InvalidState("no pass is open".to_string())),
            Some(pass) if pass.is_compute() != compute => {
                return Err(RhiError::InvalidState(format!(
                    "the open pass is a {} pass",
                    if pass.is_compute() { "compute" } else { "render" }
                )));
            }
            Some(_) if !self.secondary_stack.is_empty() => {
                return Err(RhiError::InvalidState(
                    "a secondary command list is still open".to_string(),
                ));
            }
            Some(_) => {}
        }
        if let Some(pass) = self.pass.take() {
            let (buffers, images) = pass.tracker.finish();
            if !buffers.is_empty() || !images.is_empty() {
                debug!(
                    "Pass barriers: {} buffer, {} image",
                    buffers.len(),
                    images.len()
                );
            }
            self.list.set_pass_barriers(pass.batch, buffers, images);
        }
        Ok(())
    }

    // -- recording target ---------------------------------------------------

    fn render_pass(&self) -> RhiResult<&ActivePass> {
        match &self.pass {
            Some(pass) if !pass.is_compute() => Ok(pass),
            Some(_) => Err(RhiError::InvalidState(
                "not allowed in a compute pass".to_string(),
            )),
            None => Err(RhiError::InvalidState("no render pass is open".to_string())),
        }
    }

    fn compute_pass(&self) -> RhiResult<&ActivePass> {
        match &self.pass {
            Some(pass) if pass.is_compute() => Ok(pass),
            _ => Err(RhiError::InvalidState("no compute pass is open".to_string())),
        }
    }

    /// The list pass commands go to: the innermost open secondary, or the
    /// frame's primary list. Direct recording into a pass that declared
    /// secondaries is rejected.
    fn pass_list(&mut self) -> RhiResult<&mut CommandList> {
        let Some(pass) = &self.pass else {
            return Err(RhiError::InvalidState("no pass is open".to_string()));
        };
        if let PassKind::Render {
            uses_secondaries: true,
            ..
        } = pass.kind
            && self.secondary_stack.is_empty()
        {
            return Err(RhiError::InvalidState(
                "this pass records through secondary command lists only".to_string(),
            ));
        }
        Ok(self.secondary_stack.last_mut().unwrap_or(&mut self.list))
    }

    fn secondary_inheritance(&self) -> RhiResult<RenderingInheritance> {
        match &self.render_pass()?.kind {
            PassKind::Render {
                uses_secondaries: true,
                inheritance,
            } => Ok(inheritance.clone()),
            _ => Err(RhiError::InvalidState(
                "the pass was not begun with uses_secondaries".to_string(),
            )),
        }
    }

    // -- pipelines and binding sets -----------------------------------------

    pub fn set_graphics_pipeline(&mut self, id: GraphicsPipelineId) -> RhiResult<()> {
        self.render_pass()?;
        let prepared = self.resolve_graphics_pipeline(id)?;
        if let Some(pass) = self.pass.as_mut() {
            pass.pipeline = Some((prepared.layout, prepared.bind_point));
        }
        self.pass_list()?.bind_pipeline(&prepared);
        Ok(())
    }

    pub fn set_compute_pipeline(&mut self, id: ComputePipelineId) -> RhiResult<()> {
        self.compute_pass()?;
        let tag = self.pacer.current_tag();
        let record = self.store.usable(id)?;
        let prepared = PreparedPipeline {
            pipeline: record.pipeline,
            layout: record.layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        };
        self.store.touch(id.into(), tag);
        if let Some(pass) = self.pass.as_mut() {
            pass.pipeline = Some((prepared.layout, prepared.bind_point));
        }
        self.pass_list()?.bind_pipeline(&prepared);
        Ok(())
    }

    fn resolve_graphics_pipeline(&mut self, id: GraphicsPipelineId) -> RhiResult<PreparedPipeline> {
        let tag = self.pacer.current_tag();
        let record = self.store.usable(id)?;
        let prepared = PreparedPipeline {
            pipeline: record.pipeline,
            layout: record.layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        };
        self.store.touch(id.into(), tag);
        Ok(prepared)
    }

    /// Binds a binding set for the bound pipeline. `dynamic_offsets` pairs
    /// binding numbers with offsets; unlisted dynamic bindings use 0.
    pub fn set_binding_set(
        &mut self,
        id: BindingSetId,
        dynamic_offsets: &[(u32, u32)],
    ) -> RhiResult<()> {
        let Some((layout, bind_point)) = self.pass.as_ref().and_then(|p| p.pipeline) else {
            return Err(RhiError::InvalidState(
                "bind a pipeline before its binding set".to_string(),
            ));
        };
        let prepared = self.resolve_binding_set(id, layout, bind_point, dynamic_offsets)?;
        self.pass_list()?.bind_binding_set(&prepared);
        Ok(())
    }

    /// Rewrites the current slot's set if it refers to an older generation
    /// of any resource.
    fn refresh_binding_set(&mut self, id: BindingSetId, slot: usize) -> RhiResult<()> {
        let record = self.store.usable(id)?;
        let (Some(bound), Some(&set)) = (record.bound.get(slot), record.sets.get(slot)) else {
            return Err(RhiError::InvalidState(format!(
                "binding set '{}' has no set for slot {}",
                record.meta.name, slot
            )));
        };
        if !self.store.is_stale(bound) {
            return Ok(());
        }
        warn!(
            "Binding set '{}' refers to recreated resources, rewriting slot {}",
            record.meta.name, slot
        );
        let desc = record.desc.clone();
        let (writes, refs) = self.store.binding_writes(&desc, set, slot)?;
        self.device.write_descriptor_sets(&writes);
        if let Some(record) = self.store.get_mut(id) {
            record.bound[slot] = refs;
        }
        Ok(())
    }

    /// Refreshes, tracks and resolves a binding set for the current slot.
    fn resolve_binding_set(
        &mut self,
        id: BindingSetId,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
        offsets: &[(u32, u32)],
    ) -> RhiResult<PreparedBindingSet> {
        let slot = self.pacer.current_slot();
        let tag = self.pacer.current_tag();
        let in_compute = self.pass.as_ref().is_some_and(ActivePass::is_compute);
        self.refresh_binding_set(id, slot)?;

        let record = self.store.usable(id)?;
        let set = record.sets[slot];
        let dynamic_offsets = record
            .dynamic_bindings
            .iter()
            .map(|binding| {
                offsets
                    .iter()
                    .find(|(b, _)| b == binding)
                    .map_or(0, |&(_, offset)| offset)
            })
            .collect();
        let bindings = record.desc.bindings.clone();

        let mut storage = Vec::new();
        for binding in &bindings {
            let stage = if in_compute {
                vk::PipelineStageFlags::COMPUTE_SHADER
            } else {
                let stages = BufferStage::from_shader_stages(binding.stages);
                if stages.is_empty() {
                    vk::PipelineStageFlags::ALL_GRAPHICS
                } else {
                    stages
                }
            };
            match binding.resource {
                BindingResource::UniformBuffer { buffer, .. } => {
                    self.track_buffer_use(buffer, BufferAccess::UniformRead, stage)?;
                }
                BindingResource::StorageBuffer { buffer, access, .. } => {
                    let access = storage_buffer_access(access);
                    let native = self.track_buffer_use(buffer, access, stage)?;
                    storage.push(StorageUse::Buffer(native, access));
                }
                BindingResource::SampledTexture { texture, sampler } => {
                    self.track_texture_use(texture, None, TextureAccess::Sample, stage)?;
                    self.store.touch(sampler.into(), tag);
                }
                BindingResource::StorageImage {
                    texture,
                    level,
                    access,
                } => {
                    let access = storage_texture_access(access);
                    let (image, range) =
                        self.track_texture_use(texture, Some(level), access, stage)?;
                    storage.push(StorageUse::Image(image, range, access));
                }
            }
        }
        self.store.touch(id.into(), tag);
        if let Some(pass) = self.pass.as_mut() {
            pass.storage = storage;
        }
        Ok(PreparedBindingSet {
            set,
            layout,
            bind_point,
            dynamic_offsets,
        })
    }

    /// Applies pending host writes, then records the access in the pass.
    /// Returns the native copy used by the current slot.
    fn track_buffer_use(
        &mut self,
        buffer: BufferId,
        access: BufferAccess,
        stage: vk::PipelineStageFlags,
    ) -> RhiResult<vk::Buffer> {
        let slot = self.pacer.current_slot();
        let tag = self.pacer.current_tag();
        self.store.apply_pending_writes(&self.device, buffer, slot)?;
        let Some(pass) = self.pass.as_mut() else {
            return Err(RhiError::InvalidState("no pass is open".to_string()));
        };
        let record = self.store.usable_mut(buffer)?;
        let index = record.native_index(slot);
        let native = record.natives[index];
        pass.tracker
            .track_buffer(native, &mut record.usage[index], access, stage);
        self.store.touch(buffer.into(), tag);
        Ok(native)
    }

    fn track_texture_use(
        &mut self,
        texture: TextureId,
        level: Option<u32>,
        access: TextureAccess,
        stage: vk::PipelineStageFlags,
    ) -> RhiResult<(vk::Image, ImageRange)> {
        let tag = self.pacer.current_tag();
        let Some(pass) = self.pass.as_mut() else {
            return Err(RhiError::InvalidState("no pass is open".to_string()));
        };
        let record = self.store.usable_mut(texture)?;
        let aspect = aspect_mask(record.desc.format);
        let range = match level {
            Some(level) => ImageRange::new(aspect, level, 1),
            None => ImageRange::new(aspect, 0, record.desc.mip_levels),
        };
        let image = record.image;
        pass.tracker
            .track_texture(image, range, &mut record.usage, access, stage);
        self.store.touch(texture.into(), tag);
        Ok((image, range))
    }

    // -- vertex input and draws ---------------------------------------------

    /// Binds vertex buffers starting at `first_binding`, and optionally an
    /// index buffer. Buffers are `(id, byte offset)` pairs.
    pub fn set_vertex_input(
        &mut self,
        first_binding: u32,
        buffers: &[(BufferId, u64)],
        index: Option<(BufferId, u64, vk::IndexType)>,
    ) -> RhiResult<()> {
        self.render_pass()?;
        let mut prepared: SmallVec<[PreparedBuffer; 4]> = SmallVec::new();
        for &(id, offset) in buffers {
            prepared.push(self.prepare_vertex_buffer(id, offset)?);
        }
        let index = index
            .map(|(id, offset, index_type)| self.prepare_index_buffer(id, offset, index_type))
            .transpose()?;

        let list = self.pass_list()?;
        if !prepared.is_empty() {
            list.bind_vertex_buffers(first_binding, &prepared);
        }
        if let Some(index) = index {
            list.bind_index_buffer(&index);
        }
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) -> RhiResult<()> {
        self.render_pass()?;
        self.pass_list()?.set_viewport(viewport);
        Ok(())
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) -> RhiResult<()> {
        self.render_pass()?;
        self.pass_list()?.set_scissor(scissor);
        Ok(())
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) -> RhiResult<()> {
        self.render_pass()?;
        self.pass_list()?.set_blend_constants(constants);
        Ok(())
    }

    pub fn set_stencil_ref(&mut self, reference: u32) -> RhiResult<()> {
        self.render_pass()?;
        self.pass_list()?.set_stencil_ref(reference);
        Ok(())
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.render_pass()?;
        self.pass_list()?
            .draw(vertex_count, instance_count, first_vertex, first_instance);
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.render_pass()?;
        self.pass_list()?.draw_indexed(
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
        Ok(())
    }

    /// Records a dispatch, preceded by a barrier for every storage resource
    /// an earlier dispatch of this pass wrote, or read when this one writes.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.compute_pass()?;
        let mut buffer_barriers = SmallVec::<[_; 4]>::new();
        let mut image_barriers = SmallVec::<[_; 4]>::new();
        if let Some(pass) = self.pass.as_mut() {
            for &storage in &pass.storage {
                match storage {
                    StorageUse::Buffer(buffer, access) => {
                        buffer_barriers.extend(pass.hazards.buffer(buffer, access));
                    }
                    StorageUse::Image(image, range, access) => {
                        image_barriers.extend(pass.hazards.image(image, range, access));
                    }
                }
            }
        }
        let list = self.pass_list()?;
        list.pipeline_barrier(&buffer_barriers, &image_barriers);
        list.dispatch(x, y, z);
        Ok(())
    }

    // -- debug markers ------------------------------------------------------

    fn marker_list(&mut self) -> RhiResult<&mut CommandList> {
        self.require_frame("debug markers")?;
        Ok(self.secondary_stack.last_mut().unwrap_or(&mut self.list))
    }

    /// Opens a labeled region. Recorded always, replayed only with debug
    /// markers enabled.
    pub fn debug_mark_begin(&mut self, label: &str) -> RhiResult<()> {
        self.marker_list()?.debug_marker_begin(label, [0.0; 4]);
        Ok(())
    }

    pub fn debug_mark_end(&mut self) -> RhiResult<()> {
        self.marker_list()?.debug_marker_end();
        Ok(())
    }

    pub fn debug_mark_msg(&mut self, message: &str) -> RhiResult<()> {
        self.marker_list()?.debug_marker_insert(message, [0.0; 4]);
        Ok(())
    }

    // -- secondary command lists --------------------------------------------

    /// Pushes an in-backend secondary list; pass commands go to it until
    /// [`Rhi::end_secondary`].
    pub fn begin_secondary(&mut self) -> RhiResult<()> {
        let inheritance = self.secondary_inheritance()?;
        let mut list = self.list.take_spare();
        list.set_inheritance(Some(inheritance));
        self.secondary_stack.push(list);
        Ok(())
    }

    /// Pops the innermost secondary list and splices it into the frame.
    pub fn end_secondary(&mut self) -> RhiResult<()> {
        let list = self
            .secondary_stack
            .pop()
            .ok_or_else(|| RhiError::InvalidState("no secondary list is open".to_string()))?;
        self.list.execute_secondary(list)
    }

    /// Hands out an empty secondary list for recording on another thread.
    /// Resolve resources for it with the `prepare_*` calls, then splice it
    /// with [`Rhi::execute_secondary`] before the pass ends.
    pub fn record_secondary(&mut self) -> RhiResult<CommandList> {
        let inheritance = self.secondary_inheritance()?;
        let mut list = self.list.take_spare();
        list.set_inheritance(Some(inheritance));
        Ok(list)
    }

    pub fn execute_secondary(&mut self, list: CommandList) -> RhiResult<()> {
        let inheritance = self.secondary_inheritance()?;
        if list.inheritance() != Some(&inheritance) {
            return Err(RhiError::InvalidState(
                "secondary list was recorded for different attachments".to_string(),
            ));
        }
        self.list.execute_secondary(list)
    }

    /// Resolves a graphics pipeline for a secondary list.
    pub fn prepare_graphics_pipeline(
        &mut self,
        id: GraphicsPipelineId,
    ) -> RhiResult<PreparedPipeline> {
        self.render_pass()?;
        self.resolve_graphics_pipeline(id)
    }

    /// Resolves and tracks a binding set for `pipeline` in the current slot.
    pub fn prepare_binding_set(
        &mut self,
        id: BindingSetId,
        pipeline: GraphicsPipelineId,
        dynamic_offsets: &[(u32, u32)],
    ) -> RhiResult<PreparedBindingSet> {
        self.render_pass()?;
        let layout = self.store.usable(pipeline)?.layout;
        self.resolve_binding_set(id, layout, vk::PipelineBindPoint::GRAPHICS, dynamic_offsets)
    }

    pub fn prepare_vertex_buffer(
        &mut self,
        id: BufferId,
        offset: u64,
    ) -> RhiResult<PreparedBuffer> {
        self.render_pass()?;
        let buffer = self.track_buffer_use(
            id,
            BufferAccess::VertexInput,
            vk::PipelineStageFlags::VERTEX_INPUT,
        )?;
        Ok(PreparedBuffer { buffer, offset })
    }

    pub fn prepare_index_buffer(
        &mut self,
        id: BufferId,
        offset: u64,
        index_type: vk::IndexType,
    ) -> RhiResult<PreparedIndexBuffer> {
        self.render_pass()?;
        let buffer = self.track_buffer_use(
            id,
            BufferAccess::IndexRead,
            vk::PipelineStageFlags::VERTEX_INPUT,
        )?;
        Ok(PreparedIndexBuffer {
            buffer,
            offset,
            index_type,
        })
    }
}

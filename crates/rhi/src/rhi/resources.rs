//! Resource registration, (re)creation and retirement.

use ash::vk;
use tracing::{debug, warn};

use super::updates::OpenUpdate;
use super::{FrameKind, Rhi};
use crate::binding::BindingSetDesc;
use crate::cache::MaterialKey;
use crate::error::{RhiError, RhiResult};
use crate::native::NativeDevice;
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc};
use crate::release::ReleasePayload;
use crate::resource::*;
use crate::slot::SlotTag;
use crate::store::{mapped_slice, StoreKey};
use crate::tracker::TextureUsageState;

impl<D: NativeDevice> Rhi<D> {
    // -- registration -------------------------------------------------------

    /// Registers a buffer. Natives are built by [`Rhi::create`].
    pub fn new_buffer(&mut self, name: &str, desc: BufferDesc) -> BufferId {
        self.store.insert(BufferRecord {
            meta: ResourceMeta::new(name),
            desc,
            natives: Vec::new(),
            usage: Vec::new(),
            pending: Vec::new(),
        })
    }

    pub fn new_texture(&mut self, name: &str, desc: TextureDesc) -> TextureId {
        self.store.insert(TextureRecord {
            meta: ResourceMeta::new(name),
            desc,
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            level_views: Vec::new(),
            usage: TextureUsageState::default(),
            imported: false,
        })
    }

    pub fn new_render_buffer(&mut self, name: &str, desc: RenderBufferDesc) -> RenderBufferId {
        self.store.insert(RenderBufferRecord {
            meta: ResourceMeta::new(name),
            desc,
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            usage: TextureUsageState::default(),
        })
    }

    pub fn new_sampler(&mut self, name: &str, desc: SamplerDesc) -> SamplerId {
        self.store.insert(SamplerRecord {
            meta: ResourceMeta::new(name),
            desc,
            sampler: vk::Sampler::null(),
        })
    }

    pub fn new_graphics_pipeline(
        &mut self,
        name: &str,
        desc: GraphicsPipelineDesc,
    ) -> GraphicsPipelineId {
        self.store.insert(GraphicsPipelineRecord {
            meta: ResourceMeta::new(name),
            desc,
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
        })
    }

    pub fn new_compute_pipeline(
        &mut self,
        name: &str,
        desc: ComputePipelineDesc,
    ) -> ComputePipelineId {
        self.store.insert(ComputePipelineRecord {
            meta: ResourceMeta::new(name),
            desc,
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
        })
    }

    /// Registers a binding set. Every referenced resource must be created
    /// before the set is.
    pub fn new_binding_set(&mut self, name: &str, desc: BindingSetDesc) -> BindingSetId {
        self.store.insert(BindingSetRecord {
            meta: ResourceMeta::new(name),
            desc,
            layout: vk::DescriptorSetLayout::null(),
            sets: Vec::new(),
            pool_index: None,
            bound: Vec::new(),
            dynamic_bindings: Vec::new(),
        })
    }

    pub fn new_render_target(&mut self, name: &str, desc: RenderTargetDesc) -> RenderTargetId {
        self.store.insert(RenderTargetRecord {
            meta: ResourceMeta::new(name),
            desc,
            color_views: Vec::new(),
            resolve_views: Vec::new(),
            depth_view: None,
            extent: vk::Extent2D::default(),
            color_formats: Vec::new(),
            depth_format: None,
            attached: Vec::new(),
        })
    }

    pub fn new_swapchain(&mut self, name: &str, desc: SwapChainDesc) -> SwapChainId {
        self.store.insert(SwapChainRecord {
            meta: ResourceMeta::new(name),
            desc,
            native: None,
            image_layouts: Vec::new(),
            msaa: Vec::new(),
            msaa_usage: Vec::new(),
            current_image: 0,
        })
    }

    // -- one-step creation --------------------------------------------------

    /// Registers and creates a buffer. Nothing stays registered on failure.
    pub fn create_buffer(&mut self, name: &str, desc: BufferDesc) -> RhiResult<BufferId> {
        let id = self.new_buffer(name, desc);
        self.create_registered(id)
    }

    pub fn create_texture(&mut self, name: &str, desc: TextureDesc) -> RhiResult<TextureId> {
        let id = self.new_texture(name, desc);
        self.create_registered(id)
    }

    pub fn create_render_buffer(
        &mut self,
        name: &str,
        desc: RenderBufferDesc,
    ) -> RhiResult<RenderBufferId> {
        let id = self.new_render_buffer(name, desc);
        self.create_registered(id)
    }

    pub fn create_sampler(&mut self, name: &str, desc: SamplerDesc) -> RhiResult<SamplerId> {
        let id = self.new_sampler(name, desc);
        self.create_registered(id)
    }

    pub fn create_graphics_pipeline(
        &mut self,
        name: &str,
        desc: GraphicsPipelineDesc,
    ) -> RhiResult<GraphicsPipelineId> {
        let id = self.new_graphics_pipeline(name, desc);
        self.create_registered(id)
    }

    pub fn create_compute_pipeline(
        &mut self,
        name: &str,
        desc: ComputePipelineDesc,
    ) -> RhiResult<ComputePipelineId> {
        let id = self.new_compute_pipeline(name, desc);
        self.create_registered(id)
    }

    pub fn create_binding_set(
        &mut self,
        name: &str,
        desc: BindingSetDesc,
    ) -> RhiResult<BindingSetId> {
        let id = self.new_binding_set(name, desc);
        self.create_registered(id)
    }

    pub fn create_render_target(
        &mut self,
        name: &str,
        desc: RenderTargetDesc,
    ) -> RhiResult<RenderTargetId> {
        let id = self.new_render_target(name, desc);
        self.create_registered(id)
    }

    pub fn create_swapchain(&mut self, name: &str, desc: SwapChainDesc) -> RhiResult<SwapChainId> {
        let id = self.new_swapchain(name, desc);
        self.create_registered(id)
    }

    fn create_registered<K>(&mut self, id: K) -> RhiResult<K>
    where
        K: StoreKey + Into<ResourceId>,
    {
        match self.create(id) {
            Ok(_) => Ok(id),
            Err(e) => {
                self.store.remove(id.into());
                Err(e)
            }
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Creates the native objects of a registered resource, or recreates them
    /// if it already has some. Old natives go through the release queue.
    ///
    /// Returns the new generation (1 after the first successful call).
    ///
    /// # Errors
    ///
    /// Creation failures are reported as [`RhiError::ResourceCreationFailed`]
    /// and leave the resource without natives; the backend itself stays
    /// usable.
    pub fn create(&mut self, id: impl Into<ResourceId>) -> RhiResult<u32> {
        let id = id.into();
        if self.pacer.is_device_lost() {
            return Err(RhiError::DeviceLost);
        }
        self.check_live(id)?;
        if self.is_presenting(id) {
            return Err(RhiError::InvalidState(
                "cannot recreate a swapchain while a frame presents to it".to_string(),
            ));
        }

        let tag = self.release_tag(id);
        let frames = self.pacer.frames_in_flight();
        let result = match (id, self.store.take_natives(id)) {
            (ResourceId::SwapChain(k), Some(ReleasePayload::SwapChain { swapchain, msaa })) => {
                let created =
                    self.store
                        .create_swapchain(&self.device, k, self.config.vsync, Some(&swapchain));
                self.releases
                    .enqueue(ReleasePayload::SwapChain { swapchain, msaa }, tag, None);
                created
            }
            (_, old) => {
                if let Some(payload) = old {
                    self.releases.enqueue(payload, tag, None);
                }
                self.store
                    .create_natives(&self.device, &mut self.pools, id, frames, self.config.vsync)
            }
        };

        match result {
            Ok(()) => {
                let generation = self.store.mark_created(id);
                debug!(
                    "Created {} '{}' (generation {})",
                    id.kind(),
                    self.store.name(id).unwrap_or_default(),
                    generation
                );
                Ok(generation)
            }
            Err(e) => Err(self.creation_error(id, e)),
        }
    }

    /// Makes a registered texture use a caller-owned image and view instead
    /// of backend-created ones. The backend never frees the imported objects;
    /// `layout` is the image's layout at the time of the call.
    ///
    /// Returns the new generation.
    pub fn create_texture_from_native(
        &mut self,
        id: TextureId,
        native: NativeTexture,
    ) -> RhiResult<u32> {
        if self.pacer.is_device_lost() {
            return Err(RhiError::DeviceLost);
        }
        self.check_live(id.into())?;
        if native.image == vk::Image::null() || native.view == vk::ImageView::null() {
            return Err(RhiError::InvalidHandle(
                "native textures need an image and a view".to_string(),
            ));
        }
        let tag = self.release_tag(id.into());
        if let Some(old) = self.store.take_natives(id.into()) {
            self.releases.enqueue(old, tag, None);
        }
        self.store.import_texture(&self.device, id, native)?;
        Ok(self.store.mark_created(id.into()))
    }

    /// Returns unused backend memory: retired releases, idle binding pools
    /// and spare command-list capacity. Must be called outside a frame.
    pub fn release_cached_resources(&mut self) -> RhiResult<()> {
        if self.frame.is_some() {
            return Err(RhiError::InvalidState(
                "cached resources cannot be released inside a frame".to_string(),
            ));
        }
        self.flush_releases(false);
        let freed = self.pools.trim(&self.device)?;
        self.list.release_capacity();
        self.secondary_stack.clear();
        self.secondary_stack.shrink_to_fit();
        debug!("Released cached resources ({} binding pools)", freed);
        Ok(())
    }

    fn creation_error(&mut self, id: ResourceId, error: RhiError) -> RhiError {
        match error {
            RhiError::DeviceLost => {
                self.pacer.mark_device_lost();
                error
            }
            RhiError::SwapChainOutOfDate
            | RhiError::InvalidHandle(_)
            | RhiError::InvalidState(_)
            | RhiError::ResourceCreationFailed(_) => error,
            other => {
                let name = self.store.name(id).unwrap_or_default();
                warn!("Failed to create {} '{}': {}", id.kind(), name, other);
                RhiError::ResourceCreationFailed(format!("{} '{}': {}", id.kind(), name, other))
            }
        }
    }

    /// Retires a resource. The handle is invalid from now on; its natives are
    /// freed once the last frame that used them has retired.
    pub fn destroy(&mut self, id: impl Into<ResourceId>) -> RhiResult<()> {
        let id = id.into();
        self.check_live(id)?;
        if self.is_presenting(id) {
            return Err(RhiError::InvalidState(
                "cannot destroy a swapchain while a frame presents to it".to_string(),
            ));
        }
        if self
            .open_update
            .as_ref()
            .is_some_and(|open| ResourceId::from(open.buffer) == id)
        {
            self.open_update = None;
        }
        if let ResourceId::GraphicsPipeline(pipeline) = id {
            self.materials.forget(pipeline);
        }

        let tag = self.release_tag(id);
        let name = self.store.name(id).unwrap_or_default();
        match self.store.take_natives(id) {
            Some(payload) => {
                self.store.set_lifecycle(
                    id,
                    Lifecycle {
                        logical: LogicalState::Destroyed,
                        physical: PhysicalState::PendingFree,
                    },
                );
                self.releases.enqueue(payload, tag, Some(id));
            }
            None => self.store.remove(id),
        }
        debug!("Destroyed {} '{}' (release tag {:?})", id.kind(), name, tag);
        Ok(())
    }

    fn check_live(&self, id: ResourceId) -> RhiResult<()> {
        if !self.store.contains(id) {
            return Err(RhiError::InvalidHandle(format!("unknown or freed {}", id.kind())));
        }
        if self.store.lifecycle(id).logical == LogicalState::Destroyed {
            return Err(RhiError::InvalidHandle(format!(
                "{} '{}' was destroyed",
                id.kind(),
                self.store.name(id).unwrap_or_default()
            )));
        }
        Ok(())
    }

    fn is_presenting(&self, id: ResourceId) -> bool {
        matches!(
            self.frame.as_ref().map(|f| f.kind),
            Some(FrameKind::Swapchain { id: sc, .. }) if ResourceId::from(sc) == id
        )
    }

    /// Tag under which a resource's natives are released.
    ///
    /// Unused resources go immediately. Inside a swapchain frame the last
    /// recorded slot is exact; anywhere else the release waits for every
    /// slot.
    fn release_tag(&self, id: ResourceId) -> SlotTag {
        match self.store.last_active(id) {
            SlotTag::Untracked => SlotTag::Untracked,
            tag if matches!(
                self.frame.as_ref().map(|f| f.kind),
                Some(FrameKind::Swapchain { .. })
            ) =>
            {
                tag
            }
            _ => SlotTag::Any,
        }
    }

    // -- queries ------------------------------------------------------------

    /// Generation of the resource's natives: 0 before the first `create`.
    pub fn generation(&self, id: impl Into<ResourceId>) -> Option<u32> {
        self.store.generation(id.into())
    }

    /// Two-phase lifecycle state. Handles whose record is gone report
    /// [`Lifecycle::FREED`].
    pub fn lifecycle(&self, id: impl Into<ResourceId>) -> Lifecycle {
        self.store.lifecycle(id.into())
    }

    pub fn resource_name(&self, id: impl Into<ResourceId>) -> Option<String> {
        self.store.name(id.into())
    }

    /// Which submitted work last used the resource.
    pub fn last_active(&self, id: impl Into<ResourceId>) -> SlotTag {
        self.store.last_active(id.into())
    }

    /// The native copy of a buffer used by `slot`.
    pub fn native_buffer(&self, id: BufferId, slot: usize) -> Option<vk::Buffer> {
        let record = self.store.get(id)?;
        record.natives.get(record.native_index(slot)).copied()
    }

    pub fn native_image(&self, id: TextureId) -> Option<vk::Image> {
        self.store
            .get(id)
            .map(|r| r.image)
            .filter(|image| *image != vk::Image::null())
    }

    /// The image, view and current layout behind a created texture.
    pub fn native_texture(&self, id: TextureId) -> Option<NativeTexture> {
        self.store
            .get(id)
            .filter(|r| r.image != vk::Image::null())
            .map(|r| NativeTexture {
                image: r.image,
                view: r.view,
                layout: r.usage.layout,
            })
    }

    /// The descriptor set a binding set uses in `slot`.
    pub fn native_binding_set(&self, id: BindingSetId, slot: usize) -> Option<vk::DescriptorSet> {
        self.store.get(id)?.sets.get(slot).copied()
    }

    /// Pixel size of the swapchain's images as created.
    pub fn swapchain_extent(&self, id: SwapChainId) -> Option<vk::Extent2D> {
        self.store.get(id)?.native.as_ref().map(|n| n.extent)
    }

    pub fn swapchain_image_count(&self, id: SwapChainId) -> usize {
        self.store
            .get(id)
            .and_then(|r| r.native.as_ref())
            .map_or(0, |n| n.images.len())
    }

    // -- description changes ------------------------------------------------

    /// Replaces a buffer's description; applied by the next `create`.
    pub fn set_buffer_desc(&mut self, id: BufferId, desc: BufferDesc) -> RhiResult<()> {
        self.check_live(id.into())?;
        if let Some(record) = self.store.get_mut(id) {
            record.desc = desc;
        }
        Ok(())
    }

    pub fn set_texture_desc(&mut self, id: TextureId, desc: TextureDesc) -> RhiResult<()> {
        self.check_live(id.into())?;
        if let Some(record) = self.store.get_mut(id) {
            record.desc = desc;
        }
        Ok(())
    }

    pub fn set_render_buffer_desc(
        &mut self,
        id: RenderBufferId,
        desc: RenderBufferDesc,
    ) -> RhiResult<()> {
        self.check_live(id.into())?;
        if let Some(record) = self.store.get_mut(id) {
            record.desc = desc;
        }
        Ok(())
    }

    /// Records the surface's new pixel size after a resize; `create` then
    /// rebuilds the swapchain at that size.
    pub fn set_swapchain_pixel_size(
        &mut self,
        id: SwapChainId,
        size: vk::Extent2D,
    ) -> RhiResult<()> {
        self.check_live(id.into())?;
        if let Some(record) = self.store.get_mut(id) {
            record.desc.pixel_size = size;
        }
        Ok(())
    }

    // -- direct buffer updates ----------------------------------------------

    /// Opens a buffer for CPU writes within the current frame.
    ///
    /// For dynamic buffers the returned bytes are the current slot's own
    /// copy, so writes never race with earlier frames still reading the
    /// other copies. For device-local buffers the returned bytes are a
    /// zero-filled staging area replacing the whole buffer when
    /// [`Rhi::end_dynamic_update`] is called.
    pub fn begin_dynamic_update(&mut self, id: BufferId) -> RhiResult<&mut [u8]> {
        if self.frame.is_none() {
            return Err(RhiError::InvalidState(
                "dynamic updates need a frame".to_string(),
            ));
        }
        if let Some(open) = &self.open_update {
            return Err(RhiError::InvalidState(format!(
                "update of buffer {:?} is still open",
                open.buffer
            )));
        }
        let slot = self.pacer.current_slot();
        let tag = self.pacer.current_tag();
        let (kind, size) = {
            let record = self.store.usable(id)?;
            (record.desc.kind, record.desc.size as usize)
        };

        if kind != BufferKind::Dynamic {
            let open = self.open_update.insert(OpenUpdate {
                buffer: id,
                staged: Some(vec![0; size]),
            });
            return Ok(open.staged.as_deref_mut().unwrap_or_default());
        }

        self.store.apply_pending_writes(&self.device, id, slot)?;
        let record = self.store.usable(id)?;
        let native = record.natives[record.native_index(slot)];
        let mapped = self.device.mapped_range(native).ok_or_else(|| {
            RhiError::InvalidState(format!("buffer '{}' is not host-visible", record.meta.name))
        })?;
        self.store.touch(id.into(), tag);
        self.open_update = Some(OpenUpdate {
            buffer: id,
            staged: None,
        });
        // SAFETY: the slot owning this copy has retired, and the mapping
        // stays valid while the buffer lives; the slice borrows `self`.
        Ok(unsafe { mapped_slice(mapped.ptr, size.min(mapped.len)) })
    }

    /// Closes an update opened by [`Rhi::begin_dynamic_update`]. Staged
    /// writes to device-local buffers are recorded as an upload.
    pub fn end_dynamic_update(&mut self, id: BufferId) -> RhiResult<()> {
        match self.open_update.take() {
            Some(open) if open.buffer == id => match open.staged {
                Some(data) => self.record_static_upload(id, 0, &data),
                None => Ok(()),
            },
            Some(open) => {
                self.open_update = Some(open);
                Err(RhiError::InvalidState(
                    "end_dynamic_update does not match the open update".to_string(),
                ))
            }
            None => Err(RhiError::InvalidState("no dynamic update is open".to_string())),
        }
    }

    // -- materials ----------------------------------------------------------

    /// Returns a graphics pipeline shared by every material with the same
    /// shaders and `discriminator`, creating it on first use. Each call takes
    /// a reference; drop it with [`Rhi::release_material`].
    pub fn material_pipeline(
        &mut self,
        name: &str,
        desc: GraphicsPipelineDesc,
        discriminator: u64,
    ) -> RhiResult<GraphicsPipelineId> {
        let key = MaterialKey::for_pipeline(&desc, discriminator).ok_or_else(|| {
            RhiError::InvalidState(format!("material '{name}' needs vertex and fragment stages"))
        })?;
        if let Some(pipeline) = self.materials.acquire(key) {
            return Ok(pipeline);
        }
        let pipeline = self.create_graphics_pipeline(name, desc)?;
        self.materials.insert(key, pipeline);
        debug!("Cached material pipeline '{}'", name);
        Ok(pipeline)
    }

    /// Drops one reference taken by [`Rhi::material_pipeline`]. The pipeline
    /// is destroyed with the last one.
    pub fn release_material(&mut self, pipeline: GraphicsPipelineId) -> RhiResult<()> {
        if !self.materials.contains(pipeline) {
            return Err(RhiError::InvalidHandle(
                "pipeline is not a cached material".to_string(),
            ));
        }
        if self.materials.release(pipeline) {
            self.destroy(pipeline)?;
        }
        Ok(())
    }
}

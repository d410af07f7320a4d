//! Frame-slot resource store.
//!
//! Holds every resource record in typed slot maps and builds native objects
//! for them. Multi-buffered resources (dynamic buffers, binding sets) get one
//! native copy per frame slot so a write to the current slot's copy never
//! races with a previous slot still being read by the GPU.
//!
//! The store only creates natives and hands old ones back as
//! [`ReleasePayload`]s; deciding when they are freed is the release queue's
//! job.

use std::ptr::NonNull;

use ash::vk;
use slotmap::SlotMap;
use tracing::{debug, warn};

use crate::binding::{BindingResource, BindingSetDesc};
use crate::error::{RhiError, RhiResult};
use crate::native::{
    DescriptorResource, DescriptorWrite, MemoryPlacement, NativeBufferDesc, NativeDevice,
    NativeImage, NativeImageDesc, NativeSwapchain, NativeSwapchainDesc,
};
use crate::pool::BindingPoolAllocator;
use crate::release::ReleasePayload;
use crate::resource::*;
use crate::slot::SlotTag;
use crate::tracker::{BufferUsageState, TextureUsageState};

/// Typed access from a handle to its record map.
pub(crate) trait StoreKey: slotmap::Key + 'static {
    type Record: Record;

    fn map(store: &ResourceStore) -> &SlotMap<Self, Self::Record>;
    fn map_mut(store: &mut ResourceStore) -> &mut SlotMap<Self, Self::Record>;
}

macro_rules! store_key {
    ($key:ident => $record:ident, $field:ident) => {
        impl StoreKey for $key {
            type Record = $record;

            #[inline]
            fn map(store: &ResourceStore) -> &SlotMap<Self, $record> {
                &store.$field
            }

            #[inline]
            fn map_mut(store: &mut ResourceStore) -> &mut SlotMap<Self, $record> {
                &mut store.$field
            }
        }
    };
}

#[derive(Debug, Default)]
pub(crate) struct ResourceStore {
    pub(crate) buffers: SlotMap<BufferId, BufferRecord>,
    pub(crate) textures: SlotMap<TextureId, TextureRecord>,
    pub(crate) render_buffers: SlotMap<RenderBufferId, RenderBufferRecord>,
    pub(crate) samplers: SlotMap<SamplerId, SamplerRecord>,
    pub(crate) graphics_pipelines: SlotMap<GraphicsPipelineId, GraphicsPipelineRecord>,
    pub(crate) compute_pipelines: SlotMap<ComputePipelineId, ComputePipelineRecord>,
    pub(crate) binding_sets: SlotMap<BindingSetId, BindingSetRecord>,
    pub(crate) render_targets: SlotMap<RenderTargetId, RenderTargetRecord>,
    pub(crate) swapchains: SlotMap<SwapChainId, SwapChainRecord>,
}

store_key!(BufferId => BufferRecord, buffers);
store_key!(TextureId => TextureRecord, textures);
store_key!(RenderBufferId => RenderBufferRecord, render_buffers);
store_key!(SamplerId => SamplerRecord, samplers);
store_key!(GraphicsPipelineId => GraphicsPipelineRecord, graphics_pipelines);
store_key!(ComputePipelineId => ComputePipelineRecord, compute_pipelines);
store_key!(BindingSetId => BindingSetRecord, binding_sets);
store_key!(RenderTargetId => RenderTargetRecord, render_targets);
store_key!(SwapChainId => SwapChainRecord, swapchains);

/// Dispatches `$body` with `$rec` bound to the record behind a [`ResourceId`].
macro_rules! with_record {
    ($store:expr, $id:expr, |$rec:ident| $body:expr) => {
        match $id {
            ResourceId::Buffer(k) => $store.buffers.get(k).map(|$rec| $body),
            ResourceId::Texture(k) => $store.textures.get(k).map(|$rec| $body),
            ResourceId::RenderBuffer(k) => $store.render_buffers.get(k).map(|$rec| $body),
            ResourceId::Sampler(k) => $store.samplers.get(k).map(|$rec| $body),
            ResourceId::GraphicsPipeline(k) => $store.graphics_pipelines.get(k).map(|$rec| $body),
            ResourceId::ComputePipeline(k) => $store.compute_pipelines.get(k).map(|$rec| $body),
            ResourceId::BindingSet(k) => $store.binding_sets.get(k).map(|$rec| $body),
            ResourceId::RenderTarget(k) => $store.render_targets.get(k).map(|$rec| $body),
            ResourceId::SwapChain(k) => $store.swapchains.get(k).map(|$rec| $body),
        }
    };
}

macro_rules! with_record_mut {
    ($store:expr, $id:expr, |$rec:ident| $body:expr) => {
        match $id {
            ResourceId::Buffer(k) => $store.buffers.get_mut(k).map(|$rec| $body),
            ResourceId::Texture(k) => $store.textures.get_mut(k).map(|$rec| $body),
            ResourceId::RenderBuffer(k) => $store.render_buffers.get_mut(k).map(|$rec| $body),
            ResourceId::Sampler(k) => $store.samplers.get_mut(k).map(|$rec| $body),
            ResourceId::GraphicsPipeline(k) => {
                $store.graphics_pipelines.get_mut(k).map(|$rec| $body)
            }
            ResourceId::ComputePipeline(k) => {
                $store.compute_pipelines.get_mut(k).map(|$rec| $body)
            }
            ResourceId::BindingSet(k) => $store.binding_sets.get_mut(k).map(|$rec| $body),
            ResourceId::RenderTarget(k) => $store.render_targets.get_mut(k).map(|$rec| $body),
            ResourceId::SwapChain(k) => $store.swapchains.get_mut(k).map(|$rec| $body),
        }
    };
}

impl ResourceStore {
    pub(crate) fn insert<K: StoreKey>(&mut self, record: K::Record) -> K {
        K::map_mut(self).insert(record)
    }

    #[inline]
    pub(crate) fn get<K: StoreKey>(&self, id: K) -> Option<&K::Record> {
        K::map(self).get(id)
    }

    #[inline]
    pub(crate) fn get_mut<K: StoreKey>(&mut self, id: K) -> Option<&mut K::Record> {
        K::map_mut(self).get_mut(id)
    }

    /// The record, if it exists and has live natives.
    pub(crate) fn usable<K: StoreKey>(&self, id: K) -> RhiResult<&K::Record> {
        let record = self.get(id).ok_or_else(|| missing(K::Record::KIND))?;
        if !record.meta().life.is_usable() {
            return Err(not_created(K::Record::KIND, &record.meta().name));
        }
        Ok(record)
    }

    pub(crate) fn usable_mut<K: StoreKey>(&mut self, id: K) -> RhiResult<&mut K::Record> {
        let record = self.get_mut(id).ok_or_else(|| missing(K::Record::KIND))?;
        if !record.meta().life.is_usable() {
            return Err(not_created(K::Record::KIND, &record.meta().name));
        }
        Ok(record)
    }

    pub(crate) fn contains(&self, id: ResourceId) -> bool {
        with_record!(self, id, |r| r.meta().life).is_some()
    }

    pub(crate) fn lifecycle(&self, id: ResourceId) -> Lifecycle {
        with_record!(self, id, |r| r.meta().life).unwrap_or(Lifecycle::FREED)
    }

    pub(crate) fn generation(&self, id: ResourceId) -> Option<u32> {
        with_record!(self, id, |r| r.meta().generation)
    }

    pub(crate) fn name(&self, id: ResourceId) -> Option<String> {
        with_record!(self, id, |r| r.meta().name.clone())
    }

    pub(crate) fn last_active(&self, id: ResourceId) -> SlotTag {
        with_record!(self, id, |r| r.meta().last_active).unwrap_or_default()
    }

    /// Records a use of the resource by work tagged `tag`.
    pub(crate) fn touch(&mut self, id: ResourceId, tag: SlotTag) {
        with_record_mut!(self, id, |r| {
            let meta = r.meta_mut();
            meta.last_active = meta.last_active.touch(tag);
        });
    }

    pub(crate) fn set_lifecycle(&mut self, id: ResourceId, life: Lifecycle) {
        with_record_mut!(self, id, |r| r.meta_mut().life = life);
    }

    /// Marks a successful (re)creation: natives live, generation bumped,
    /// no recorded use yet.
    pub(crate) fn mark_created(&mut self, id: ResourceId) -> u32 {
        with_record_mut!(self, id, |r| {
            let meta = r.meta_mut();
            meta.life.physical = PhysicalState::Live;
            meta.generation += 1;
            meta.last_active = SlotTag::Untracked;
            meta.generation
        })
        .unwrap_or(0)
    }

    pub(crate) fn remove(&mut self, id: ResourceId) {
        match id {
            ResourceId::Buffer(k) => drop(self.buffers.remove(k)),
            ResourceId::Texture(k) => drop(self.textures.remove(k)),
            ResourceId::RenderBuffer(k) => drop(self.render_buffers.remove(k)),
            ResourceId::Sampler(k) => drop(self.samplers.remove(k)),
            ResourceId::GraphicsPipeline(k) => drop(self.graphics_pipelines.remove(k)),
            ResourceId::ComputePipeline(k) => drop(self.compute_pipelines.remove(k)),
            ResourceId::BindingSet(k) => drop(self.binding_sets.remove(k)),
            ResourceId::RenderTarget(k) => drop(self.render_targets.remove(k)),
            ResourceId::SwapChain(k) => drop(self.swapchains.remove(k)),
        }
    }

    /// Every logically live resource, dependents (binding sets, render
    /// targets, pipelines) first.
    pub(crate) fn live_ids(&self) -> Vec<ResourceId> {
        fn live<K: StoreKey + Into<ResourceId>>(
            map: &SlotMap<K, K::Record>,
            out: &mut Vec<ResourceId>,
        ) {
            out.extend(
                map.iter()
                    .filter(|(_, r)| r.meta().life.logical == LogicalState::Live)
                    .map(|(k, _)| k.into()),
            );
        }
        let mut out = Vec::new();
        live(&self.graphics_pipelines, &mut out);
        live(&self.compute_pipelines, &mut out);
        live(&self.binding_sets, &mut out);
        live(&self.render_targets, &mut out);
        live(&self.swapchains, &mut out);
        live(&self.samplers, &mut out);
        live(&self.textures, &mut out);
        live(&self.render_buffers, &mut out);
        live(&self.buffers, &mut out);
        out
    }

    /// Number of resources with live natives.
    pub(crate) fn live_count(&self) -> usize {
        fn count<K: StoreKey>(map: &SlotMap<K, K::Record>) -> usize {
            map.values()
                .filter(|r| r.meta().life.physical == PhysicalState::Live)
                .count()
        }
        count(&self.buffers)
            + count(&self.textures)
            + count(&self.render_buffers)
            + count(&self.samplers)
            + count(&self.graphics_pipelines)
            + count(&self.compute_pipelines)
            + count(&self.binding_sets)
            + count(&self.render_targets)
            + count(&self.swapchains)
    }

    /// Takes the live natives of a resource for release, leaving the record
    /// unallocated. Returns `None` when there is nothing to free.
    pub(crate) fn take_natives(&mut self, id: ResourceId) -> Option<ReleasePayload> {
        let payload = match id {
            ResourceId::Buffer(k) => {
                let r = self.buffers.get_mut(k)?;
                r.pending.iter_mut().for_each(Vec::clear);
                (!r.natives.is_empty()).then(|| ReleasePayload::Buffer {
                    buffers: std::mem::take(&mut r.natives),
                })
            }
            ResourceId::Texture(k) => {
                let r = self.textures.get_mut(k)?;
                let image = NativeImage {
                    image: std::mem::take(&mut r.image),
                    view: std::mem::take(&mut r.view),
                };
                let level_views = std::mem::take(&mut r.level_views);
                if std::mem::take(&mut r.imported) {
                    (!level_views.is_empty())
                        .then_some(ReleasePayload::ImportedTexture { level_views })
                } else {
                    (image.image != vk::Image::null())
                        .then_some(ReleasePayload::Texture { image, level_views })
                }
            }
            ResourceId::RenderBuffer(k) => {
                let r = self.render_buffers.get_mut(k)?;
                (r.image != vk::Image::null()).then(|| ReleasePayload::RenderBuffer {
                    image: NativeImage {
                        image: std::mem::take(&mut r.image),
                        view: std::mem::take(&mut r.view),
                    },
                })
            }
            ResourceId::Sampler(k) => {
                let r = self.samplers.get_mut(k)?;
                (r.sampler != vk::Sampler::null()).then(|| ReleasePayload::Sampler {
                    sampler: std::mem::take(&mut r.sampler),
                })
            }
            ResourceId::GraphicsPipeline(k) => {
                let r = self.graphics_pipelines.get_mut(k)?;
                (r.pipeline != vk::Pipeline::null()).then(|| ReleasePayload::Pipeline {
                    pipeline: std::mem::take(&mut r.pipeline),
                    layout: std::mem::take(&mut r.layout),
                })
            }
            ResourceId::ComputePipeline(k) => {
                let r = self.compute_pipelines.get_mut(k)?;
                (r.pipeline != vk::Pipeline::null()).then(|| ReleasePayload::Pipeline {
                    pipeline: std::mem::take(&mut r.pipeline),
                    layout: std::mem::take(&mut r.layout),
                })
            }
            ResourceId::BindingSet(k) => {
                let r = self.binding_sets.get_mut(k)?;
                r.sets.clear();
                r.bound.clear();
                (r.layout != vk::DescriptorSetLayout::null()).then(|| ReleasePayload::BindingSet {
                    pool_index: r.pool_index.take(),
                    layout: std::mem::take(&mut r.layout),
                })
            }
            ResourceId::RenderTarget(k) => {
                let r = self.render_targets.get_mut(k)?;
                let mut views = std::mem::take(&mut r.color_views);
                views.extend(r.resolve_views.drain(..).flatten());
                views.extend(r.depth_view.take());
                r.attached.clear();
                (!views.is_empty()).then_some(ReleasePayload::RenderTarget { views })
            }
            ResourceId::SwapChain(k) => {
                let r = self.swapchains.get_mut(k)?;
                r.image_layouts.clear();
                r.msaa_usage.clear();
                let msaa = std::mem::take(&mut r.msaa);
                r.native
                    .take()
                    .map(|swapchain| ReleasePayload::SwapChain { swapchain, msaa })
            }
        };
        self.set_physical(id, PhysicalState::Unallocated);
        payload
    }

    fn set_physical(&mut self, id: ResourceId, physical: PhysicalState) {
        with_record_mut!(self, id, |r| r.meta_mut().life.physical = physical);
    }

    // -- native creation --------------------------------------------------

    /// Builds natives for an unallocated resource. On failure the record
    /// stays unallocated and nothing leaks.
    pub(crate) fn create_natives<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        pools: &mut BindingPoolAllocator,
        id: ResourceId,
        frames_in_flight: usize,
        vsync: bool,
    ) -> RhiResult<()> {
        match id {
            ResourceId::Buffer(k) => self.create_buffer(device, k, frames_in_flight),
            ResourceId::Texture(k) => self.create_texture(device, k),
            ResourceId::RenderBuffer(k) => self.create_render_buffer(device, k),
            ResourceId::Sampler(k) => {
                let record = self.get_mut(k).ok_or_else(|| missing("sampler"))?;
                record.sampler = device.create_sampler(&record.desc)?;
                Ok(())
            }
            ResourceId::GraphicsPipeline(k) => self.create_graphics_pipeline(device, k),
            ResourceId::ComputePipeline(k) => self.create_compute_pipeline(device, k),
            ResourceId::BindingSet(k) => {
                self.create_binding_set(device, pools, k, frames_in_flight)
            }
            ResourceId::RenderTarget(k) => self.create_render_target(device, k),
            ResourceId::SwapChain(k) => self.create_swapchain(device, k, vsync, None),
        }
    }

    fn create_buffer<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        id: BufferId,
        frames_in_flight: usize,
    ) -> RhiResult<()> {
        let record = self.get_mut(id).ok_or_else(|| missing("buffer"))?;
        if record.desc.size == 0 {
            return Err(RhiError::ResourceCreationFailed(format!(
                "buffer '{}' has zero size",
                record.meta.name
            )));
        }
        let placement = match record.desc.kind {
            BufferKind::Dynamic => MemoryPlacement::HostVisible,
            BufferKind::Immutable | BufferKind::Static => MemoryPlacement::DeviceLocal,
        };
        let count = record.desc.native_count(frames_in_flight);
        let mut natives = Vec::with_capacity(count);
        for _ in 0..count {
            let created = device.create_buffer(&NativeBufferDesc {
                name: &record.meta.name,
                size: record.desc.size,
                usage: record.desc.usage.to_vk_usage(),
                placement,
            });
            match created {
                Ok(buffer) => natives.push(buffer),
                Err(e) => {
                    for buffer in natives {
                        device.destroy_buffer(buffer);
                    }
                    return Err(e);
                }
            }
        }
        record.natives = natives;
        record.usage = vec![BufferUsageState::default(); count];
        record.pending = vec![Vec::new(); count];
        debug!(
            "Created {} buffer '{}' ({} bytes x {})",
            record.desc.usage.name(),
            record.meta.name,
            record.desc.size,
            count
        );
        Ok(())
    }

    fn create_texture<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        id: TextureId,
    ) -> RhiResult<()> {
        let record = self.get_mut(id).ok_or_else(|| missing("texture"))?;
        let desc = record.desc;
        let native = device.create_image(&NativeImageDesc {
            name: &record.meta.name,
            extent: desc.extent,
            format: desc.format,
            mip_levels: desc.mip_levels,
            samples: desc.sample_count,
            usage: desc.to_vk_usage(),
        })?;
        let mut level_views = Vec::new();
        if desc.usage.storage {
            for level in 0..desc.mip_levels {
                match device.create_image_view(native.image, desc.format, level) {
                    Ok(view) => level_views.push(view),
                    Err(e) => {
                        level_views.into_iter().for_each(|v| device.destroy_image_view(v));
                        device.destroy_image(native);
                        return Err(e);
                    }
                }
            }
        }
        record.image = native.image;
        record.view = native.view;
        record.level_views = level_views;
        record.usage = TextureUsageState::default();
        debug!(
            "Created texture '{}' ({}x{}, {} levels)",
            record.meta.name, desc.extent.width, desc.extent.height, desc.mip_levels
        );
        Ok(())
    }

    fn create_render_buffer<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        id: RenderBufferId,
    ) -> RhiResult<()> {
        let record = self.get_mut(id).ok_or_else(|| missing("render buffer"))?;
        let usage = match record.desc.kind {
            RenderBufferKind::DepthStencil => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            RenderBufferKind::Color => vk::ImageUsageFlags::COLOR_ATTACHMENT,
        };
        let native = device.create_image(&NativeImageDesc {
            name: &record.meta.name,
            extent: record.desc.extent,
            format: record.desc.format,
            mip_levels: 1,
            samples: record.desc.sample_count,
            usage,
        })?;
        record.image = native.image;
        record.view = native.view;
        record.usage = TextureUsageState::default();
        Ok(())
    }

    fn binding_layout(
        &self,
        binding_set: Option<BindingSetId>,
    ) -> RhiResult<Option<vk::DescriptorSetLayout>> {
        binding_set
            .map(|id| self.usable(id).map(|set| set.layout))
            .transpose()
    }

    fn create_graphics_pipeline<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        id: GraphicsPipelineId,
    ) -> RhiResult<()> {
        let record = self.get(id).ok_or_else(|| missing("graphics pipeline"))?;
        let set_layout = self.binding_layout(record.desc.binding_set)?;
        let layout = device.create_pipeline_layout(set_layout)?;
        let pipeline = match device.create_graphics_pipeline(&record.desc, layout) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                device.destroy_pipeline_layout(layout);
                return Err(e);
            }
        };
        let record = self.get_mut(id).ok_or_else(|| missing("graphics pipeline"))?;
        record.pipeline = pipeline;
        record.layout = layout;
        Ok(())
    }

    fn create_compute_pipeline<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        id: ComputePipelineId,
    ) -> RhiResult<()> {
        let record = self.get(id).ok_or_else(|| missing("compute pipeline"))?;
        let set_layout = self.binding_layout(record.desc.binding_set)?;
        let layout = device.create_pipeline_layout(set_layout)?;
        let pipeline = match device.create_compute_pipeline(&record.desc, layout) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                device.destroy_pipeline_layout(layout);
                return Err(e);
            }
        };
        let record = self.get_mut(id).ok_or_else(|| missing("compute pipeline"))?;
        record.pipeline = pipeline;
        record.layout = layout;
        Ok(())
    }

    fn create_binding_set<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        pools: &mut BindingPoolAllocator,
        id: BindingSetId,
        frames_in_flight: usize,
    ) -> RhiResult<()> {
        let record = self.get(id).ok_or_else(|| missing("binding set"))?;
        if record.desc.has_duplicates() {
            return Err(RhiError::ResourceCreationFailed(format!(
                "binding set '{}' declares a binding twice",
                record.meta.name
            )));
        }
        let desc = record.desc.clone();
        let layout = device.create_binding_layout(&desc.layout_bindings())?;
        let (sets, pool_index) = match pools.allocate(device, &vec![layout; frames_in_flight]) {
            Ok(allocated) => allocated,
            Err(e) => {
                device.destroy_binding_layout(layout);
                return Err(e);
            }
        };

        let mut bound = Vec::with_capacity(frames_in_flight);
        for (slot, &set) in sets.iter().enumerate() {
            match self.binding_writes(&desc, set, slot) {
                Ok((writes, refs)) => {
                    device.write_descriptor_sets(&writes);
                    bound.push(refs);
                }
                Err(e) => {
                    pools.release(pool_index);
                    device.destroy_binding_layout(layout);
                    return Err(e);
                }
            }
        }

        let record = self.get_mut(id).ok_or_else(|| missing("binding set"))?;
        record.layout = layout;
        record.sets = sets;
        record.pool_index = Some(pool_index);
        record.bound = bound;
        record.dynamic_bindings = desc.dynamic_bindings();
        Ok(())
    }

    /// Descriptor writes for one slot's set, and the resource generations
    /// they capture.
    pub(crate) fn binding_writes(
        &self,
        desc: &BindingSetDesc,
        set: vk::DescriptorSet,
        slot: usize,
    ) -> RhiResult<(Vec<DescriptorWrite>, Vec<BoundResource>)> {
        let mut writes = Vec::with_capacity(desc.bindings.len());
        let mut bound = Vec::with_capacity(desc.bindings.len());
        for binding in &desc.bindings {
            let resource = match binding.resource {
                BindingResource::UniformBuffer {
                    buffer,
                    offset,
                    size,
                    ..
                }
                | BindingResource::StorageBuffer {
                    buffer,
                    offset,
                    size,
                    ..
                } => {
                    let record = self.usable(buffer)?;
                    bound.push(BoundResource {
                        id: buffer.into(),
                        generation: record.meta.generation,
                    });
                    DescriptorResource::Buffer {
                        buffer: record.natives[record.native_index(slot)],
                        offset,
                        range: size,
                    }
                }
                BindingResource::SampledTexture { texture, sampler } => {
                    let texture_record = self.usable(texture)?;
                    let sampler_record = self.usable(sampler)?;
                    bound.push(BoundResource {
                        id: texture.into(),
                        generation: texture_record.meta.generation,
                    });
                    bound.push(BoundResource {
                        id: sampler.into(),
                        generation: sampler_record.meta.generation,
                    });
                    DescriptorResource::Image {
                        view: texture_record.view,
                        sampler: sampler_record.sampler,
                        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }
                }
                BindingResource::StorageImage { texture, level, .. } => {
                    let record = self.usable(texture)?;
                    bound.push(BoundResource {
                        id: texture.into(),
                        generation: record.meta.generation,
                    });
                    let view = record
                        .level_views
                        .get(level as usize)
                        .copied()
                        .ok_or_else(|| {
                            RhiError::InvalidState(format!(
                                "texture '{}' has no storage view for level {}",
                                record.meta.name, level
                            ))
                        })?;
                    DescriptorResource::Image {
                        view,
                        sampler: vk::Sampler::null(),
                        layout: vk::ImageLayout::GENERAL,
                    }
                }
            };
            writes.push(DescriptorWrite {
                set,
                binding: binding.binding,
                descriptor_type: binding.resource.descriptor_type(),
                resource,
            });
        }
        Ok((writes, bound))
    }

    /// True when a slot's set references an older generation of something.
    pub(crate) fn is_stale(&self, bound: &[BoundResource]) -> bool {
        bound
            .iter()
            .any(|b| self.generation(b.id) != Some(b.generation))
    }

    fn create_render_target<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        id: RenderTargetId,
    ) -> RhiResult<()> {
        let record = self.get(id).ok_or_else(|| missing("render target"))?;
        let desc = record.desc.clone();
        if desc.color.is_empty() && desc.depth_stencil.is_none() {
            return Err(RhiError::ResourceCreationFailed(format!(
                "render target '{}' has no attachments",
                record.meta.name
            )));
        }

        let mut created = Vec::new();
        let mut resolve_views = Vec::new();
        let mut attached = Vec::new();
        let mut extent = None;
        let result = (|| -> RhiResult<(Vec<vk::Format>, Option<vk::Format>)> {
            let mut color_formats = Vec::new();
            let mut depth_format = None;
            let attachments = desc
                .color
                .iter()
                .map(|a| (a, false))
                .chain(desc.depth_stencil.iter().map(|a| (a, true)));
            for (attachment, is_depth) in attachments {
                let found = self.attachment_image(attachment.source, attachment.level)?;
                if *extent.get_or_insert(found.extent) != found.extent {
                    return Err(RhiError::ResourceCreationFailed(
                        "render target attachments differ in size".to_string(),
                    ));
                }
                let view = device.create_image_view(found.image, found.format, attachment.level)?;
                created.push(view);
                attached.push(BoundResource {
                    id: attachment.source.into(),
                    generation: found.generation,
                });
                if is_depth {
                    if attachment.resolve.is_some() {
                        return Err(RhiError::ResourceCreationFailed(
                            "depth-stencil attachments cannot be resolved".to_string(),
                        ));
                    }
                    depth_format = Some(found.format);
                    continue;
                }
                color_formats.push(found.format);
                let Some(texture) = attachment.resolve else {
                    resolve_views.push(None);
                    continue;
                };
                let level = attachment.resolve_level;
                let target = self.attachment_image(AttachmentSource::Texture(texture), level)?;
                if found.samples <= 1 || target.samples != 1 {
                    return Err(RhiError::ResourceCreationFailed(
                        "resolve needs a multisampled attachment and a single-sample target"
                            .to_string(),
                    ));
                }
                if target.format != found.format || target.extent != found.extent {
                    return Err(RhiError::ResourceCreationFailed(
                        "resolve target differs from its attachment in format or size".to_string(),
                    ));
                }
                let view = device.create_image_view(target.image, target.format, level)?;
                resolve_views.push(Some(view));
                attached.push(BoundResource {
                    id: ResourceId::Texture(texture),
                    generation: target.generation,
                });
            }
            Ok((color_formats, depth_format))
        })();

        let (color_formats, depth_format) = match result {
            Ok(formats) => formats,
            Err(e) => {
                created
                    .into_iter()
                    .chain(resolve_views.into_iter().flatten())
                    .for_each(|v| device.destroy_image_view(v));
                return Err(e);
            }
        };
        let record = self.get_mut(id).ok_or_else(|| missing("render target"))?;
        let depth_view = depth_format.and_then(|_| created.pop());
        record.color_views = created;
        record.resolve_views = resolve_views;
        record.depth_view = depth_view;
        record.extent = extent.unwrap_or_default();
        record.color_formats = color_formats;
        record.depth_format = depth_format;
        record.attached = attached;
        Ok(())
    }

    /// The image behind one level of an attachment source.
    fn attachment_image(
        &self,
        source: AttachmentSource,
        level: u32,
    ) -> RhiResult<AttachmentImage> {
        match source {
            AttachmentSource::Texture(texture) => {
                let record = self.usable(texture)?;
                if level >= record.desc.mip_levels {
                    return Err(RhiError::ResourceCreationFailed(format!(
                        "texture '{}' has no level {}",
                        record.meta.name, level
                    )));
                }
                Ok(AttachmentImage {
                    image: record.image,
                    format: record.desc.format,
                    extent: vk::Extent2D {
                        width: (record.desc.extent.width >> level).max(1),
                        height: (record.desc.extent.height >> level).max(1),
                    },
                    samples: record.desc.sample_count.max(1),
                    generation: record.meta.generation,
                })
            }
            AttachmentSource::RenderBuffer(render_buffer) => {
                let record = self.usable(render_buffer)?;
                Ok(AttachmentImage {
                    image: record.image,
                    format: record.desc.format,
                    extent: record.desc.extent,
                    samples: record.desc.sample_count.max(1),
                    generation: record.meta.generation,
                })
            }
        }
    }

    /// Adopts a caller-owned image as a texture's natives. Storage textures
    /// get backend-owned single-level views.
    pub(crate) fn import_texture<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        id: TextureId,
        native: NativeTexture,
    ) -> RhiResult<()> {
        let record = self.get_mut(id).ok_or_else(|| missing("texture"))?;
        if native.image == vk::Image::null() || native.view == vk::ImageView::null() {
            return Err(RhiError::InvalidHandle(format!(
                "texture '{}' cannot import a null image or view",
                record.meta.name
            )));
        }
        let desc = record.desc;
        let mut level_views = Vec::new();
        if desc.usage.storage {
            for level in 0..desc.mip_levels {
                match device.create_image_view(native.image, desc.format, level) {
                    Ok(view) => level_views.push(view),
                    Err(e) => {
                        level_views.into_iter().for_each(|v| device.destroy_image_view(v));
                        return Err(e);
                    }
                }
            }
        }
        record.image = native.image;
        record.view = native.view;
        record.level_views = level_views;
        record.imported = true;
        record.usage = TextureUsageState::new(
            native.layout,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        );
        debug!(
            "Texture '{}' imported a native image ({}x{}, {} levels)",
            record.meta.name, desc.extent.width, desc.extent.height, desc.mip_levels
        );
        Ok(())
    }

    /// Builds a swapchain, reusing `old`'s images where the driver can.
    /// `old` is not destroyed here.
    pub(crate) fn create_swapchain<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        id: SwapChainId,
        vsync: bool,
        old: Option<&NativeSwapchain>,
    ) -> RhiResult<()> {
        let record = self.get_mut(id).ok_or_else(|| missing("swapchain"))?;
        let native = device.create_swapchain(
            &NativeSwapchainDesc {
                surface: record.desc.surface,
                extent: record.desc.pixel_size,
                vsync,
                transfer_source: record.desc.readback,
            },
            old,
        )?;
        let samples = record.desc.sample_count.max(1);
        let mut msaa = Vec::new();
        if samples > 1 {
            for _ in 0..native.images.len() {
                let created = device.create_image(&NativeImageDesc {
                    name: &record.meta.name,
                    extent: native.extent,
                    format: native.format,
                    mip_levels: 1,
                    samples,
                    usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                });
                match created {
                    Ok(image) => msaa.push(image),
                    Err(e) => {
                        msaa.into_iter().for_each(|image| device.destroy_image(image));
                        device.destroy_swapchain(native);
                        return Err(e);
                    }
                }
            }
        }
        record.image_layouts = vec![vk::ImageLayout::UNDEFINED; native.images.len()];
        record.msaa_usage = vec![TextureUsageState::default(); msaa.len()];
        record.msaa = msaa;
        record.current_image = 0;
        debug!(
            "Swapchain '{}' has {} images ({}x{})",
            record.meta.name,
            native.images.len(),
            native.extent.width,
            native.extent.height
        );
        record.native = Some(native);
        Ok(())
    }

    // -- host writes ------------------------------------------------------

    /// Applies writes queued for `slot` to a dynamic buffer's mapped copy.
    pub(crate) fn apply_pending_writes<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        id: BufferId,
        slot: usize,
    ) -> RhiResult<()> {
        let record = self.usable_mut(id)?;
        let index = record.native_index(slot);
        if record.pending.get(index).is_none_or(Vec::is_empty) {
            return Ok(());
        }
        let mapped = device.mapped_range(record.natives[index]).ok_or_else(|| {
            RhiError::InvalidState(format!("buffer '{}' is not host-visible", record.meta.name))
        })?;
        for write in record.pending[index].drain(..) {
            let end = write.offset as usize + write.data.len();
            if end > mapped.len {
                warn!(
                    "Dropped out-of-range write to buffer '{}' ({}..{})",
                    record.meta.name, write.offset, end
                );
                continue;
            }
            // SAFETY: the range was checked against the mapping, and the slot
            // owning this copy has retired.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    write.data.as_ptr(),
                    mapped.ptr.as_ptr().add(write.offset as usize),
                    write.data.len(),
                );
            }
        }
        Ok(())
    }
}

/// A mapped slice of one native copy.
///
/// # Safety
///
/// `ptr` must point at `len` mapped bytes that nothing else accesses for
/// `'a`.
pub(crate) unsafe fn mapped_slice<'a>(ptr: NonNull<u8>, len: usize) -> &'a mut [u8] {
    // SAFETY: upheld by the caller.
    unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) }
}

/// One level of an attachment's image.
struct AttachmentImage {
    image: vk::Image,
    format: vk::Format,
    extent: vk::Extent2D,
    samples: u32,
    generation: u32,
}

fn missing(kind: &str) -> RhiError {
    RhiError::InvalidHandle(format!("unknown or freed {kind}"))
}

fn not_created(kind: &str, name: &str) -> RhiError {
    RhiError::InvalidState(format!("{kind} '{name}' has no native objects"))
}

//! Resource handles, descriptions and the two-phase lifecycle.
//!
//! Every resource is addressed by a typed [`slotmap`] key. A resource is
//! registered with a `new_*` call on [`crate::Rhi`], given native objects by
//! `create`, and retired by `destroy`. Retirement is two-phase: the logical
//! resource is gone as soon as `destroy` returns, but its native objects stay
//! alive in the release queue until the GPU work that used them has retired.
//!
//! ```text
//! logical:   Live ──────────────destroy()──▶ Destroyed
//! physical:  Unallocated ─create()─▶ Live ─destroy()─▶ PendingFree ─fence─▶ Freed
//! ```

use ash::vk;
use slotmap::new_key_type;

use crate::binding::BindingSetDesc;
use crate::native::{NativeImage, NativeSwapchain};
use crate::pipeline::{ComputePipelineDesc, GraphicsPipelineDesc};
use crate::slot::SlotTag;
use crate::tracker::{BufferUsageState, TextureUsageState};

new_key_type! {
    /// Handle to a buffer.
    pub struct BufferId;
    /// Handle to a sampled or storage texture.
    pub struct TextureId;
    /// Handle to a render-only image (depth-stencil or color).
    pub struct RenderBufferId;
    /// Handle to a sampler.
    pub struct SamplerId;
    /// Handle to a graphics pipeline.
    pub struct GraphicsPipelineId;
    /// Handle to a compute pipeline.
    pub struct ComputePipelineId;
    /// Handle to a binding set.
    pub struct BindingSetId;
    /// Handle to a texture render target.
    pub struct RenderTargetId;
    /// Handle to a swapchain.
    pub struct SwapChainId;
}

/// Any resource handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferId),
    Texture(TextureId),
    RenderBuffer(RenderBufferId),
    Sampler(SamplerId),
    GraphicsPipeline(GraphicsPipelineId),
    ComputePipeline(ComputePipelineId),
    BindingSet(BindingSetId),
    RenderTarget(RenderTargetId),
    SwapChain(SwapChainId),
}

macro_rules! resource_id_from {
    ($($ty:ident => $var:ident),* $(,)?) => {
        $(
            impl From<$ty> for ResourceId {
                #[inline]
                fn from(id: $ty) -> Self {
                    ResourceId::$var(id)
                }
            }
        )*
    };
}

resource_id_from!(
    BufferId => Buffer,
    TextureId => Texture,
    RenderBufferId => RenderBuffer,
    SamplerId => Sampler,
    GraphicsPipelineId => GraphicsPipeline,
    ComputePipelineId => ComputePipeline,
    BindingSetId => BindingSet,
    RenderTargetId => RenderTarget,
    SwapChainId => SwapChain,
);

impl ResourceId {
    /// Short kind name used in log and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceId::Buffer(_) => "buffer",
            ResourceId::Texture(_) => "texture",
            ResourceId::RenderBuffer(_) => "render buffer",
            ResourceId::Sampler(_) => "sampler",
            ResourceId::GraphicsPipeline(_) => "graphics pipeline",
            ResourceId::ComputePipeline(_) => "compute pipeline",
            ResourceId::BindingSet(_) => "binding set",
            ResourceId::RenderTarget(_) => "render target",
            ResourceId::SwapChain(_) => "swapchain",
        }
    }
}

/// Logical half of the lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalState {
    Live,
    Destroyed,
}

/// Physical half of the lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhysicalState {
    /// No native objects (never created, or creation failed).
    Unallocated,
    /// Native objects exist and may be used.
    Live,
    /// Destroyed logically; native objects wait in the release queue.
    PendingFree,
    /// Native objects have been freed.
    Freed,
}

/// Combined lifecycle of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lifecycle {
    pub logical: LogicalState,
    pub physical: PhysicalState,
}

impl Lifecycle {
    pub(crate) const NEW: Lifecycle = Lifecycle {
        logical: LogicalState::Live,
        physical: PhysicalState::Unallocated,
    };

    /// Lifecycle reported for handles whose record no longer exists.
    pub const FREED: Lifecycle = Lifecycle {
        logical: LogicalState::Destroyed,
        physical: PhysicalState::Freed,
    };

    /// True when the resource can be used for recording.
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.logical == LogicalState::Live && self.physical == PhysicalState::Live
    }
}

/// Bookkeeping shared by every resource record.
#[derive(Debug)]
pub(crate) struct ResourceMeta {
    pub(crate) name: String,
    pub(crate) life: Lifecycle,
    /// 0 until the first successful `create`, then bumped on every recreate.
    pub(crate) generation: u32,
    pub(crate) last_active: SlotTag,
}

impl ResourceMeta {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            life: Lifecycle::NEW,
            generation: 0,
            last_active: SlotTag::Untracked,
        }
    }
}

/// Access to the shared metadata of a record.
pub(crate) trait Record {
    const KIND: &'static str;

    fn meta(&self) -> &ResourceMeta;
    fn meta_mut(&mut self) -> &mut ResourceMeta;
}

macro_rules! impl_record {
    ($ty:ident, $kind:literal) => {
        impl Record for $ty {
            const KIND: &'static str = $kind;

            #[inline]
            fn meta(&self) -> &ResourceMeta {
                &self.meta
            }

            #[inline]
            fn meta_mut(&mut self) -> &mut ResourceMeta {
                &mut self.meta
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// How a buffer's contents change over its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// Device-local, uploaded once.
    Immutable,
    /// Device-local, updated through staging copies.
    Static,
    /// Host-visible, one copy per frame slot, rewritten every frame.
    Dynamic,
}

/// What a buffer is bound as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Storage,
}

impl BufferUsage {
    /// Converts to Vulkan buffer usage flags. Every buffer may also be the
    /// source or destination of a copy.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        let transfer = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        match self {
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER | transfer,
            BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER | transfer,
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER | transfer,
            BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER | transfer,
        }
    }

    /// Returns a human-readable name for the usage type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "Vertex",
            BufferUsage::Index => "Index",
            BufferUsage::Uniform => "Uniform",
            BufferUsage::Storage => "Storage",
        }
    }
}

/// Buffer description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub kind: BufferKind,
    pub usage: BufferUsage,
    pub size: u64,
}

impl BufferDesc {
    /// Number of native copies the buffer needs.
    #[inline]
    pub fn native_count(&self, frames_in_flight: usize) -> usize {
        if self.kind == BufferKind::Dynamic {
            frames_in_flight
        } else {
            1
        }
    }
}

/// A host write waiting to be applied to one native copy.
#[derive(Clone, Debug)]
pub(crate) struct HostWrite {
    pub(crate) offset: u64,
    pub(crate) data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct BufferRecord {
    pub(crate) meta: ResourceMeta,
    pub(crate) desc: BufferDesc,
    /// One per frame slot for dynamic buffers, otherwise one.
    pub(crate) natives: Vec<vk::Buffer>,
    /// Last-known access state, per native copy.
    pub(crate) usage: Vec<BufferUsageState>,
    /// Writes queued per frame slot, applied when that slot uses the buffer.
    pub(crate) pending: Vec<Vec<HostWrite>>,
}

impl BufferRecord {
    /// Index of the native copy used by `slot`.
    #[inline]
    pub(crate) fn native_index(&self, slot: usize) -> usize {
        if self.natives.len() > 1 { slot } else { 0 }
    }
}

impl_record!(BufferRecord, "buffer");

// ---------------------------------------------------------------------------
// Textures and render buffers
// ---------------------------------------------------------------------------

/// What a texture may be used for, besides being a copy source/destination.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextureUsage {
    pub sampled: bool,
    pub render_target: bool,
    pub storage: bool,
}

/// 2D texture description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// A single-level, single-sample sampled texture.
    pub fn sampled(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            format,
            mip_levels: 1,
            sample_count: 1,
            usage: TextureUsage {
                sampled: true,
                ..Default::default()
            },
        }
    }

    /// Full mip chain length for the extent.
    pub fn full_mip_count(extent: vk::Extent2D) -> u32 {
        32 - extent.width.max(extent.height).max(1).leading_zeros()
    }

    /// Converts to Vulkan image usage flags.
    pub fn to_vk_usage(&self) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if self.usage.sampled {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.usage.render_target {
            flags |= if is_depth_format(self.format) {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            };
        }
        if self.usage.storage {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        flags
    }
}

#[derive(Debug)]
pub(crate) struct TextureRecord {
    pub(crate) meta: ResourceMeta,
    pub(crate) desc: TextureDesc,
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    /// Single-level views for storage access, one per mip level.
    pub(crate) level_views: Vec<vk::ImageView>,
    pub(crate) usage: TextureUsageState,
    /// The image and default view belong to the caller and are never freed.
    pub(crate) imported: bool,
}

impl_record!(TextureRecord, "texture");

/// An image created outside the backend, adopted as a texture's natives.
///
/// `view` must cover every mip level of `image`. `layout` is the layout the
/// image is in when it is handed over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeTexture {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
}

/// Render buffer flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderBufferKind {
    DepthStencil,
    Color,
}

/// Render buffer description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderBufferDesc {
    pub kind: RenderBufferKind,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub sample_count: u32,
}

impl RenderBufferDesc {
    /// A single-sample depth-stencil buffer.
    pub fn depth_stencil(width: u32, height: u32) -> Self {
        Self {
            kind: RenderBufferKind::DepthStencil,
            extent: vk::Extent2D { width, height },
            format: vk::Format::D24_UNORM_S8_UINT,
            sample_count: 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RenderBufferRecord {
    pub(crate) meta: ResourceMeta,
    pub(crate) desc: RenderBufferDesc,
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) usage: TextureUsageState,
}

impl_record!(RenderBufferRecord, "render buffer");

// ---------------------------------------------------------------------------
// Samplers
// ---------------------------------------------------------------------------

/// Texel filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

impl Filter {
    /// Converts to Vulkan filter.
    pub fn to_vk(self) -> vk::Filter {
        match self {
            Filter::Nearest => vk::Filter::NEAREST,
            Filter::Linear => vk::Filter::LINEAR,
        }
    }

    /// Converts to Vulkan mipmap mode.
    pub fn to_vk_mipmap(self) -> vk::SamplerMipmapMode {
        match self {
            Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
            Filter::Linear => vk::SamplerMipmapMode::LINEAR,
        }
    }
}

/// Texture coordinate wrapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddressMode {
    #[default]
    Repeat,
    ClampToEdge,
    MirroredRepeat,
}

impl AddressMode {
    /// Converts to Vulkan address mode.
    pub fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        }
    }
}

/// Sampler description. `mipmap: None` disables mipmapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap: Option<Filter>,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
}

#[derive(Debug)]
pub(crate) struct SamplerRecord {
    pub(crate) meta: ResourceMeta,
    pub(crate) desc: SamplerDesc,
    pub(crate) sampler: vk::Sampler,
}

impl_record!(SamplerRecord, "sampler");

// ---------------------------------------------------------------------------
// Pipelines and binding sets
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct GraphicsPipelineRecord {
    pub(crate) meta: ResourceMeta,
    pub(crate) desc: GraphicsPipelineDesc,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
}

impl_record!(GraphicsPipelineRecord, "graphics pipeline");

#[derive(Debug)]
pub(crate) struct ComputePipelineRecord {
    pub(crate) meta: ResourceMeta,
    pub(crate) desc: ComputePipelineDesc,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
}

impl_record!(ComputePipelineRecord, "compute pipeline");

/// A resource reference a binding set wrote into one of its native sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BoundResource {
    pub(crate) id: ResourceId,
    pub(crate) generation: u32,
}

#[derive(Debug)]
pub(crate) struct BindingSetRecord {
    pub(crate) meta: ResourceMeta,
    pub(crate) desc: BindingSetDesc,
    pub(crate) layout: vk::DescriptorSetLayout,
    /// One native set per frame slot.
    pub(crate) sets: Vec<vk::DescriptorSet>,
    pub(crate) pool_index: Option<usize>,
    /// What each per-slot set currently references.
    pub(crate) bound: Vec<Vec<BoundResource>>,
    /// Binding numbers with dynamic offsets, ascending.
    pub(crate) dynamic_bindings: Vec<u32>,
}

impl_record!(BindingSetRecord, "binding set");

// ---------------------------------------------------------------------------
// Render targets and swapchains
// ---------------------------------------------------------------------------

/// An image an attachment renders into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentSource {
    Texture(TextureId),
    RenderBuffer(RenderBufferId),
}

impl From<AttachmentSource> for ResourceId {
    fn from(source: AttachmentSource) -> Self {
        match source {
            AttachmentSource::Texture(id) => ResourceId::Texture(id),
            AttachmentSource::RenderBuffer(id) => ResourceId::RenderBuffer(id),
        }
    }
}

/// One attachment of a render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub source: AttachmentSource,
    /// Mip level rendered into (textures only).
    pub level: u32,
    /// Single-sample texture a multisampled color attachment is averaged
    /// into when the pass ends.
    pub resolve: Option<TextureId>,
    pub resolve_level: u32,
}

impl AttachmentDesc {
    pub fn texture(texture: TextureId) -> Self {
        Self {
            source: AttachmentSource::Texture(texture),
            level: 0,
            resolve: None,
            resolve_level: 0,
        }
    }

    pub fn render_buffer(render_buffer: RenderBufferId) -> Self {
        Self {
            source: AttachmentSource::RenderBuffer(render_buffer),
            level: 0,
            resolve: None,
            resolve_level: 0,
        }
    }

    /// Resolves into `level` of `texture` at the end of every pass.
    pub fn with_resolve(mut self, texture: TextureId, level: u32) -> Self {
        self.resolve = Some(texture);
        self.resolve_level = level;
        self
    }
}

/// Texture render target description.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderTargetDesc {
    pub color: Vec<AttachmentDesc>,
    pub depth_stencil: Option<AttachmentDesc>,
}

#[derive(Debug)]
pub(crate) struct RenderTargetRecord {
    pub(crate) meta: ResourceMeta,
    pub(crate) desc: RenderTargetDesc,
    pub(crate) color_views: Vec<vk::ImageView>,
    /// Resolve view per color attachment.
    pub(crate) resolve_views: Vec<Option<vk::ImageView>>,
    pub(crate) depth_view: Option<vk::ImageView>,
    pub(crate) extent: vk::Extent2D,
    pub(crate) color_formats: Vec<vk::Format>,
    pub(crate) depth_format: Option<vk::Format>,
    /// Attachment generations at creation; a newer generation means the
    /// views point at freed images.
    pub(crate) attached: Vec<BoundResource>,
}

impl_record!(RenderTargetRecord, "render target");

/// Swapchain description. The surface comes from the windowing layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapChainDesc {
    pub surface: vk::SurfaceKHR,
    pub pixel_size: vk::Extent2D,
    pub depth_stencil: Option<RenderBufferId>,
    /// Above 1, passes render into a multisampled image per swapchain image
    /// that is resolved into it.
    pub sample_count: u32,
    /// Images can be copied out with
    /// [`crate::ResourceUpdateBatch::read_back_swapchain`].
    pub readback: bool,
}

impl SwapChainDesc {
    /// Single-sample, no depth buffer, no readback.
    pub fn new(surface: vk::SurfaceKHR, pixel_size: vk::Extent2D) -> Self {
        Self {
            surface,
            pixel_size,
            depth_stencil: None,
            sample_count: 1,
            readback: false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SwapChainRecord {
    pub(crate) meta: ResourceMeta,
    pub(crate) desc: SwapChainDesc,
    pub(crate) native: Option<NativeSwapchain>,
    /// Current layout of each swapchain image.
    pub(crate) image_layouts: Vec<vk::ImageLayout>,
    pub(crate) current_image: u32,
    /// Multisampled color image per swapchain image.
    pub(crate) msaa: Vec<NativeImage>,
    pub(crate) msaa_usage: Vec<TextureUsageState>,
}

impl_record!(SwapChainRecord, "swapchain");

// ---------------------------------------------------------------------------
// Format helpers
// ---------------------------------------------------------------------------

/// Bytes per texel for the uncompressed formats the backend reads back.
pub fn texel_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// True for formats with a depth and/or stencil aspect.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::S8_UINT
    )
}

/// Image aspect flags for a format.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Converts a sample count to Vulkan flags, falling back to one sample.
pub fn sample_count_flags(count: u32) -> vk::SampleCountFlags {
    match count {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_usage_to_vk() {
        assert!(
            BufferUsage::Vertex
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::VERTEX_BUFFER)
        );
        assert!(
            BufferUsage::Index
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::INDEX_BUFFER)
        );
        assert!(
            BufferUsage::Uniform
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::UNIFORM_BUFFER)
        );
        assert!(
            BufferUsage::Storage
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::STORAGE_BUFFER)
        );
        assert!(
            BufferUsage::Vertex
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::TRANSFER_DST)
        );
    }

    #[test]
    fn test_native_count() {
        let dynamic = BufferDesc {
            kind: BufferKind::Dynamic,
            usage: BufferUsage::Uniform,
            size: 256,
        };
        let static_ = BufferDesc {
            kind: BufferKind::Static,
            ..dynamic
        };
        assert_eq!(dynamic.native_count(3), 3);
        assert_eq!(static_.native_count(3), 1);
    }

    #[test]
    fn test_full_mip_count() {
        assert_eq!(
            TextureDesc::full_mip_count(vk::Extent2D {
                width: 256,
                height: 128
            }),
            9
        );
        assert_eq!(
            TextureDesc::full_mip_count(vk::Extent2D {
                width: 1,
                height: 1
            }),
            1
        );
    }

    #[test]
    fn test_texture_usage_flags() {
        let mut desc = TextureDesc::sampled(64, 64, vk::Format::R8G8B8A8_UNORM);
        desc.usage.render_target = true;
        let flags = desc.to_vk_usage();
        assert!(flags.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(flags.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(!flags.contains(vk::ImageUsageFlags::STORAGE));
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
        assert!(is_depth_format(vk::Format::D24_UNORM_S8_UINT));
        assert!(!is_depth_format(vk::Format::B8G8R8A8_SRGB));
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(sample_count_flags(4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(sample_count_flags(3), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn test_attachment_resolve() {
        let mut textures = slotmap::SlotMap::<TextureId, ()>::with_key();
        let (msaa, single) = (textures.insert(()), textures.insert(()));
        let desc = AttachmentDesc::texture(msaa).with_resolve(single, 2);
        assert_eq!(desc.source, AttachmentSource::Texture(msaa));
        assert_eq!(desc.resolve, Some(single));
        assert_eq!(desc.resolve_level, 2);
        assert_eq!(AttachmentDesc::texture(msaa).resolve, None);
    }

    #[test]
    fn test_lifecycle_usable() {
        assert!(!Lifecycle::NEW.is_usable());
        assert!(!Lifecycle::FREED.is_usable());
        let live = Lifecycle {
            logical: LogicalState::Live,
            physical: PhysicalState::Live,
        };
        assert!(live.is_usable());
    }

    #[test]
    fn test_resource_id_from() {
        let id = BufferId::default();
        assert_eq!(ResourceId::from(id), ResourceId::Buffer(id));
        assert_eq!(ResourceId::from(id).kind(), "buffer");
    }
}

//! Deferred command list.
//!
//! [`CommandList`] records graphics operations as small fixed-size
//! [`Command`] values. Variable-length payloads (attachments, copy regions,
//! dynamic offsets, vertex buffer arrays, debug label bytes, barriers) go to
//! side tables and are referenced by [`Span`]. No native calls happen while
//! recording; [`CommandList::replay`] is the only place that talks to the
//! device.
//!
//! Recording order is not submission order for barriers: a pass records a
//! [`Command::TransitionPassResources`] marker before its `BeginPass`, and the
//! pass tracker fills the marker's barrier batch when the pass ends.
//!
//! A list is `Send`, so render pass bodies can be recorded on worker threads
//! with the `Prepared*` values resolved by [`crate::Rhi`] and spliced back in
//! with `execute_secondary`.

use ash::vk;
use smallvec::SmallVec;

use crate::error::{RhiError, RhiResult};
use crate::native::NativeCommands;

/// A range into one of a list's side tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub len: u32,
}

impl Span {
    fn of<T>(table: &mut Vec<T>, items: impl IntoIterator<Item = T>) -> Span {
        let start = table.len();
        table.extend(items);
        Span {
            start: start as u32,
            len: (table.len() - start) as u32,
        }
    }

    #[inline]
    fn slice<T>(self, table: &[T]) -> &[T] {
        let start = self.start as usize;
        &table[start..start + self.len as usize]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Subresource range of a color or depth image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageRange {
    pub aspect: vk::ImageAspectFlags,
    pub base_level: u32,
    pub level_count: u32,
}

impl ImageRange {
    /// Every level of a color image.
    pub fn color(level_count: u32) -> Self {
        Self {
            aspect: vk::ImageAspectFlags::COLOR,
            base_level: 0,
            level_count,
        }
    }

    pub fn new(aspect: vk::ImageAspectFlags, base_level: u32, level_count: u32) -> Self {
        Self {
            aspect,
            base_level,
            level_count,
        }
    }

    /// Smallest range covering both.
    pub fn union(self, other: ImageRange) -> ImageRange {
        let start = self.base_level.min(other.base_level);
        let end = (self.base_level + self.level_count).max(other.base_level + other.level_count);
        ImageRange {
            aspect: self.aspect | other.aspect,
            base_level: start,
            level_count: end - start,
        }
    }

    pub fn to_vk(self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: self.base_level,
            level_count: self.level_count,
            base_array_layer: 0,
            layer_count: 1,
        }
    }
}

/// Buffer memory barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Image memory barrier with layout transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub range: ImageRange,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Clear value of an attachment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// One attachment of a `BeginPass`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttachmentInfo {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: ClearValue,
    /// Single-sample view the attachment is averaged into at pass end.
    pub resolve: Option<vk::ImageView>,
}

/// Attachment formats a secondary command buffer renders with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderingInheritance {
    pub color_formats: SmallVec<[vk::Format; 4]>,
    pub depth_format: Option<vk::Format>,
    pub samples: u32,
}

/// Barrier batch filled in at pass end.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BarrierBatch {
    pub buffers: Span,
    pub images: Span,
}

/// One recorded operation. Payloads never own heap memory.
#[derive(Clone, Copy, Debug)]
pub enum Command {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: Span,
    },
    CopyImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageCopy,
    },
    CopyImageToBuffer {
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: Span,
    },
    ImageBarrier {
        barriers: Span,
    },
    BufferBarrier {
        barriers: Span,
    },
    BlitImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageBlit,
        filter: vk::Filter,
    },
    BeginPass {
        render_area: vk::Rect2D,
        colors: Span,
        /// Index into the attachment table.
        depth: Option<u32>,
        secondary: bool,
    },
    EndPass,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindBindingSet {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
        dynamic_offsets: Span,
    },
    BindVertexBuffer {
        first_binding: u32,
        buffers: Span,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    SetBlendConstants([f32; 4]),
    SetStencilRef(u32),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DebugMarkerBegin {
        label: Span,
        color: [f32; 4],
    },
    DebugMarkerEnd,
    DebugMarkerInsert {
        label: Span,
        color: [f32; 4],
    },
    TransitionPassResources {
        batch: u32,
    },
    ExecuteSecondary {
        list: u32,
    },
    ResetQueries {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
    WriteTimestamp {
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    },
}

/// A resolved pipeline, safe to use from a worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreparedPipeline {
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) bind_point: vk::PipelineBindPoint,
}

/// A resolved binding set for the current frame slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedBindingSet {
    pub(crate) set: vk::DescriptorSet,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) bind_point: vk::PipelineBindPoint,
    pub(crate) dynamic_offsets: SmallVec<[u32; 4]>,
}

/// A resolved vertex buffer binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreparedBuffer {
    pub(crate) buffer: vk::Buffer,
    pub(crate) offset: u64,
}

/// A resolved index buffer binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreparedIndexBuffer {
    pub(crate) buffer: vk::Buffer,
    pub(crate) offset: u64,
    pub(crate) index_type: vk::IndexType,
}

/// Replayable log of graphics operations.
#[derive(Debug, Default)]
pub struct CommandList {
    commands: Vec<Command>,
    attachments: Vec<AttachmentInfo>,
    copy_regions: Vec<vk::BufferImageCopy>,
    dynamic_offsets: Vec<u32>,
    vertex_buffers: Vec<vk::Buffer>,
    vertex_offsets: Vec<u64>,
    labels: Vec<u8>,
    buffer_barriers: Vec<BufferBarrier>,
    image_barriers: Vec<ImageBarrier>,
    pass_barriers: Vec<BarrierBatch>,
    secondaries: Vec<CommandList>,
    spare: Vec<CommandList>,
    inheritance: Option<RenderingInheritance>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A list meant to be executed inside a pass with the given attachments.
    pub fn secondary(inheritance: RenderingInheritance) -> Self {
        Self {
            inheritance: Some(inheritance),
            ..Default::default()
        }
    }

    /// Clears the log and every side table, keeping their capacity.
    /// Spliced secondary lists are kept for reuse.
    pub fn reset(&mut self) {
        self.commands.clear();
        self.attachments.clear();
        self.copy_regions.clear();
        self.dynamic_offsets.clear();
        self.vertex_buffers.clear();
        self.vertex_offsets.clear();
        self.labels.clear();
        self.buffer_barriers.clear();
        self.image_barriers.clear();
        self.pass_barriers.clear();
        for mut list in self.secondaries.drain(..) {
            list.reset();
            list.inheritance = None;
            self.spare.push(list);
        }
        self.inheritance = None;
    }

    /// Drops spare secondaries and the capacity kept by [`CommandList::reset`].
    /// Only call on an empty list.
    pub fn release_capacity(&mut self) {
        self.spare.clear();
        self.commands.shrink_to_fit();
        self.attachments.shrink_to_fit();
        self.copy_regions.shrink_to_fit();
        self.dynamic_offsets.shrink_to_fit();
        self.vertex_buffers.shrink_to_fit();
        self.vertex_offsets.shrink_to_fit();
        self.labels.shrink_to_fit();
        self.buffer_barriers.shrink_to_fit();
        self.image_barriers.shrink_to_fit();
        self.pass_barriers.shrink_to_fit();
    }

    /// A cleared list from the reuse pool, or a new one.
    pub fn take_spare(&mut self) -> CommandList {
        self.spare.pop().unwrap_or_default()
    }

    pub fn set_inheritance(&mut self, inheritance: Option<RenderingInheritance>) {
        self.inheritance = inheritance;
    }

    pub fn inheritance(&self) -> Option<&RenderingInheritance> {
        self.inheritance.as_ref()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn secondaries(&self) -> &[CommandList] {
        &self.secondaries
    }

    pub fn buffer_barriers(&self, span: Span) -> &[BufferBarrier] {
        span.slice(&self.buffer_barriers)
    }

    pub fn image_barriers(&self, span: Span) -> &[ImageBarrier] {
        span.slice(&self.image_barriers)
    }

    pub fn pass_barriers(&self, batch: u32) -> Option<BarrierBatch> {
        self.pass_barriers.get(batch as usize).copied()
    }

    pub fn label(&self, span: Span) -> &str {
        std::str::from_utf8(span.slice(&self.labels)).unwrap_or("")
    }

    #[inline]
    fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    // -- transfers --------------------------------------------------------

    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) {
        self.push(Command::CopyBuffer { src, dst, region });
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        let regions = Span::of(&mut self.copy_regions, regions.iter().copied());
        self.push(Command::CopyBufferToImage {
            src,
            dst,
            layout,
            regions,
        });
    }

    pub fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageCopy,
    ) {
        self.push(Command::CopyImage {
            src,
            src_layout,
            dst,
            dst_layout,
            region,
        });
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        let regions = Span::of(&mut self.copy_regions, regions.iter().copied());
        self.push(Command::CopyImageToBuffer {
            src,
            layout,
            dst,
            regions,
        });
    }

    pub fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageBlit,
        filter: vk::Filter,
    ) {
        self.push(Command::BlitImage {
            src,
            src_layout,
            dst,
            dst_layout,
            region,
            filter,
        });
    }

    /// Appends immediate barriers. Empty slices record nothing.
    pub fn pipeline_barrier(&mut self, buffers: &[BufferBarrier], images: &[ImageBarrier]) {
        if !buffers.is_empty() {
            let barriers = Span::of(&mut self.buffer_barriers, buffers.iter().copied());
            self.push(Command::BufferBarrier { barriers });
        }
        if !images.is_empty() {
            let barriers = Span::of(&mut self.image_barriers, images.iter().copied());
            self.push(Command::ImageBarrier { barriers });
        }
    }

    // -- passes -----------------------------------------------------------

    /// Appends an empty barrier batch marker and returns its index.
    pub fn transition_pass_resources(&mut self) -> u32 {
        let batch = self.pass_barriers.len() as u32;
        self.pass_barriers.push(BarrierBatch::default());
        self.push(Command::TransitionPassResources { batch });
        batch
    }

    /// Fills a marker appended by [`CommandList::transition_pass_resources`].
    pub fn set_pass_barriers(
        &mut self,
        batch: u32,
        buffers: Vec<BufferBarrier>,
        images: Vec<ImageBarrier>,
    ) {
        let filled = BarrierBatch {
            buffers: Span::of(&mut self.buffer_barriers, buffers),
            images: Span::of(&mut self.image_barriers, images),
        };
        if let Some(slot) = self.pass_barriers.get_mut(batch as usize) {
            *slot = filled;
        }
    }

    pub fn begin_pass(
        &mut self,
        render_area: vk::Rect2D,
        colors: &[AttachmentInfo],
        depth: Option<AttachmentInfo>,
        secondary: bool,
    ) {
        let colors = Span::of(&mut self.attachments, colors.iter().copied());
        let depth = depth.map(|d| {
            self.attachments.push(d);
            (self.attachments.len() - 1) as u32
        });
        self.push(Command::BeginPass {
            render_area,
            colors,
            depth,
            secondary,
        });
    }

    pub fn end_pass(&mut self) {
        self.push(Command::EndPass);
    }

    // -- state ------------------------------------------------------------

    pub fn bind_pipeline(&mut self, pipeline: &PreparedPipeline) {
        self.push(Command::BindPipeline {
            bind_point: pipeline.bind_point,
            pipeline: pipeline.pipeline,
        });
    }

    pub fn bind_binding_set(&mut self, set: &PreparedBindingSet) {
        let dynamic_offsets =
            Span::of(&mut self.dynamic_offsets, set.dynamic_offsets.iter().copied());
        self.push(Command::BindBindingSet {
            bind_point: set.bind_point,
            layout: set.layout,
            set: set.set,
            dynamic_offsets,
        });
    }

    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[PreparedBuffer]) {
        let span = Span::of(&mut self.vertex_buffers, buffers.iter().map(|b| b.buffer));
        self.vertex_offsets.extend(buffers.iter().map(|b| b.offset));
        self.push(Command::BindVertexBuffer {
            first_binding,
            buffers: span,
        });
    }

    pub fn bind_index_buffer(&mut self, index: &PreparedIndexBuffer) {
        self.push(Command::BindIndexBuffer {
            buffer: index.buffer,
            offset: index.offset,
            index_type: index.index_type,
        });
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.push(Command::SetViewport(viewport));
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.push(Command::SetScissor(scissor));
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.push(Command::SetBlendConstants(constants));
    }

    pub fn set_stencil_ref(&mut self, reference: u32) {
        self.push(Command::SetStencilRef(reference));
    }

    // -- work -------------------------------------------------------------

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.push(Command::Dispatch { x, y, z });
    }

    // -- queries ----------------------------------------------------------

    pub fn reset_queries(&mut self, pool: vk::QueryPool, first: u32, count: u32) {
        self.push(Command::ResetQueries { pool, first, count });
    }

    pub fn write_timestamp(
        &mut self,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    ) {
        self.push(Command::WriteTimestamp { stage, pool, query });
    }

    // -- debug markers ----------------------------------------------------

    pub fn debug_marker_begin(&mut self, label: &str, color: [f32; 4]) {
        let label = Span::of(&mut self.labels, label.bytes());
        self.push(Command::DebugMarkerBegin { label, color });
    }

    pub fn debug_marker_end(&mut self) {
        self.push(Command::DebugMarkerEnd);
    }

    pub fn debug_marker_insert(&mut self, label: &str, color: [f32; 4]) {
        let label = Span::of(&mut self.labels, label.bytes());
        self.push(Command::DebugMarkerInsert { label, color });
    }

    // -- secondaries ------------------------------------------------------

    /// Splices a secondary list at the current position.
    pub fn execute_secondary(&mut self, list: CommandList) -> RhiResult<()> {
        if !list.secondaries.is_empty() {
            return Err(RhiError::InvalidState(
                "secondary command lists cannot execute other secondaries".to_string(),
            ));
        }
        if self.inheritance.is_some() {
            return Err(RhiError::InvalidState(
                "cannot execute a secondary command list inside another secondary".to_string(),
            ));
        }
        let index = self.secondaries.len() as u32;
        self.secondaries.push(list);
        self.push(Command::ExecuteSecondary { list: index });
        Ok(())
    }

    /// Moves the commands of `other` to the end of this list, remapping
    /// side-table spans.
    pub fn append(&mut self, other: &CommandList) -> RhiResult<()> {
        for command in &other.commands {
            match *command {
                Command::CopyBufferToImage {
                    src,
                    dst,
                    layout,
                    regions,
                } => {
                    self.copy_buffer_to_image(src, dst, layout, regions.slice(&other.copy_regions))
                }
                Command::CopyImageToBuffer {
                    src,
                    layout,
                    dst,
                    regions,
                } => {
                    self.copy_image_to_buffer(src, layout, dst, regions.slice(&other.copy_regions))
                }
                Command::ImageBarrier { barriers } => {
                    self.pipeline_barrier(&[], barriers.slice(&other.image_barriers))
                }
                Command::BufferBarrier { barriers } => {
                    self.pipeline_barrier(barriers.slice(&other.buffer_barriers), &[])
                }
                Command::BeginPass {
                    render_area,
                    colors,
                    depth,
                    secondary,
                } => self.begin_pass(
                    render_area,
                    colors.slice(&other.attachments),
                    depth.map(|d| other.attachments[d as usize]),
                    secondary,
                ),
                Command::BindBindingSet {
                    bind_point,
                    layout,
                    set,
                    dynamic_offsets,
                } => {
                    let offsets = dynamic_offsets.slice(&other.dynamic_offsets);
                    let dynamic_offsets =
                        Span::of(&mut self.dynamic_offsets, offsets.iter().copied());
                    self.push(Command::BindBindingSet {
                        bind_point,
                        layout,
                        set,
                        dynamic_offsets,
                    });
                }
                Command::BindVertexBuffer {
                    first_binding,
                    buffers,
                } => {
                    let span = Span::of(
                        &mut self.vertex_buffers,
                        buffers.slice(&other.vertex_buffers).iter().copied(),
                    );
                    self.vertex_offsets
                        .extend_from_slice(buffers.slice(&other.vertex_offsets));
                    self.push(Command::BindVertexBuffer {
                        first_binding,
                        buffers: span,
                    });
                }
                Command::DebugMarkerBegin { label, color } => {
                    self.debug_marker_begin(other.label(label), color)
                }
                Command::DebugMarkerInsert { label, color } => {
                    self.debug_marker_insert(other.label(label), color)
                }
                Command::TransitionPassResources { batch } => {
                    let target = self.transition_pass_resources();
                    if let Some(filled) = other.pass_barriers(batch) {
                        self.set_pass_barriers(
                            target,
                            other.buffer_barriers(filled.buffers).to_vec(),
                            other.image_barriers(filled.images).to_vec(),
                        );
                    }
                }
                Command::ExecuteSecondary { .. } => {
                    return Err(RhiError::InvalidState(
                        "cannot append a list that executes secondaries".to_string(),
                    ));
                }
                plain => self.push(plain),
            }
        }
        Ok(())
    }

    /// Issues every recorded command into `cb`, in order.
    ///
    /// `secondary_buffers[i]` is the native buffer the i-th spliced secondary
    /// list was replayed into. Debug markers are dropped unless
    /// `debug_markers` is set.
    pub fn replay<D: NativeCommands + ?Sized>(
        &self,
        device: &D,
        cb: vk::CommandBuffer,
        secondary_buffers: &[vk::CommandBuffer],
        debug_markers: bool,
    ) {
        for command in &self.commands {
            match *command {
                Command::CopyBuffer { src, dst, region } => {
                    device.cmd_copy_buffer(cb, src, dst, region)
                }
                Command::CopyBufferToImage {
                    src,
                    dst,
                    layout,
                    regions,
                } => device.cmd_copy_buffer_to_image(
                    cb,
                    src,
                    dst,
                    layout,
                    regions.slice(&self.copy_regions),
                ),
                Command::CopyImage {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    region,
                } => device.cmd_copy_image(cb, src, src_layout, dst, dst_layout, region),
                Command::CopyImageToBuffer {
                    src,
                    layout,
                    dst,
                    regions,
                } => device.cmd_copy_image_to_buffer(
                    cb,
                    src,
                    layout,
                    dst,
                    regions.slice(&self.copy_regions),
                ),
                Command::ImageBarrier { barriers } => {
                    device.cmd_pipeline_barrier(cb, &[], barriers.slice(&self.image_barriers))
                }
                Command::BufferBarrier { barriers } => {
                    device.cmd_pipeline_barrier(cb, barriers.slice(&self.buffer_barriers), &[])
                }
                Command::BlitImage {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    region,
                    filter,
                } => device.cmd_blit_image(cb, src, src_layout, dst, dst_layout, region, filter),
                Command::BeginPass {
                    render_area,
                    colors,
                    depth,
                    secondary,
                } => device.cmd_begin_rendering(
                    cb,
                    render_area,
                    colors.slice(&self.attachments),
                    depth.and_then(|d| self.attachments.get(d as usize)),
                    secondary,
                ),
                Command::EndPass => device.cmd_end_rendering(cb),
                Command::BindPipeline {
                    bind_point,
                    pipeline,
                } => device.cmd_bind_pipeline(cb, bind_point, pipeline),
                Command::BindBindingSet {
                    bind_point,
                    layout,
                    set,
                    dynamic_offsets,
                } => device.cmd_bind_descriptor_set(
                    cb,
                    bind_point,
                    layout,
                    set,
                    dynamic_offsets.slice(&self.dynamic_offsets),
                ),
                Command::BindVertexBuffer {
                    first_binding,
                    buffers,
                } => device.cmd_bind_vertex_buffers(
                    cb,
                    first_binding,
                    buffers.slice(&self.vertex_buffers),
                    buffers.slice(&self.vertex_offsets),
                ),
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => device.cmd_bind_index_buffer(cb, buffer, offset, index_type),
                Command::SetViewport(viewport) => device.cmd_set_viewport(cb, viewport),
                Command::SetScissor(scissor) => device.cmd_set_scissor(cb, scissor),
                Command::SetBlendConstants(constants) => {
                    device.cmd_set_blend_constants(cb, constants)
                }
                Command::SetStencilRef(reference) => {
                    device.cmd_set_stencil_reference(cb, reference)
                }
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => device.cmd_draw(
                    cb,
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                ),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => device.cmd_draw_indexed(
                    cb,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                ),
                Command::Dispatch { x, y, z } => device.cmd_dispatch(cb, x, y, z),
                Command::DebugMarkerBegin { label, color } if debug_markers => {
                    device.cmd_begin_debug_label(cb, self.label(label), color)
                }
                Command::DebugMarkerEnd if debug_markers => device.cmd_end_debug_label(cb),
                Command::DebugMarkerInsert { label, color } if debug_markers => {
                    device.cmd_insert_debug_label(cb, self.label(label), color)
                }
                Command::DebugMarkerBegin { .. }
                | Command::DebugMarkerEnd
                | Command::DebugMarkerInsert { .. } => {}
                Command::TransitionPassResources { batch } => {
                    if let Some(filled) = self.pass_barriers(batch)
                        && !(filled.buffers.is_empty() && filled.images.is_empty())
                    {
                        device.cmd_pipeline_barrier(
                            cb,
                            filled.buffers.slice(&self.buffer_barriers),
                            filled.images.slice(&self.image_barriers),
                        );
                    }
                }
                Command::ExecuteSecondary { list } => {
                    if let Some(&secondary) = secondary_buffers.get(list as usize) {
                        device.cmd_execute_commands(cb, &[secondary]);
                    }
                }
                Command::ResetQueries { pool, first, count } => {
                    device.cmd_reset_query_pool(cb, pool, first, count)
                }
                Command::WriteTimestamp { stage, pool, query } => {
                    device.cmd_write_timestamp(cb, stage, pool, query)
                }
            }
        }
    }
}

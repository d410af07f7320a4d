//! Pass resource tracking and barrier synthesis.
//!
//! A [`PassResourceTracker`] lives for one render or compute pass. Every
//! buffer and texture touch inside the pass widens the tracked access/stage
//! pair for that native object. At pass end, [`PassResourceTracker::finish`]
//! diffs each entry against the state the object had when the pass began and
//! yields the barriers that must run before the pass body.
//!
//! The global state passed to `track_*` is the last-known state of the native
//! object across passes, so a texture sampled by two passes in a row only
//! gets a barrier before the first one.

use ash::vk;
use rustc_hash::FxHashMap;

use crate::command::{BufferBarrier, ImageBarrier, ImageRange};

const WRITE_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::SHADER_WRITE.as_raw()
        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags::HOST_WRITE.as_raw()
        | vk::AccessFlags::MEMORY_WRITE.as_raw(),
);

#[inline]
fn is_read_only(access: vk::AccessFlags) -> bool {
    !access.intersects(WRITE_ACCESS)
}

/// Last-known access state of a native buffer. An empty stage means the
/// buffer has not been used by any recorded work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferUsageState {
    pub access: vk::AccessFlags,
    pub stage: vk::PipelineStageFlags,
}

impl Default for BufferUsageState {
    fn default() -> Self {
        Self {
            access: vk::AccessFlags::empty(),
            stage: vk::PipelineStageFlags::empty(),
        }
    }
}

impl BufferUsageState {
    pub fn new(access: vk::AccessFlags, stage: vk::PipelineStageFlags) -> Self {
        Self { access, stage }
    }

    #[inline]
    pub fn is_unused(&self) -> bool {
        self.stage.is_empty()
    }

    fn subsumes(&self, other: &BufferUsageState) -> bool {
        self.access.contains(other.access) && self.stage.contains(other.stage)
    }
}

/// Last-known layout and access state of a native image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureUsageState {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
    pub stage: vk::PipelineStageFlags,
}

impl Default for TextureUsageState {
    fn default() -> Self {
        Self {
            layout: vk::ImageLayout::UNDEFINED,
            access: vk::AccessFlags::empty(),
            stage: vk::PipelineStageFlags::empty(),
        }
    }
}

impl TextureUsageState {
    pub fn new(
        layout: vk::ImageLayout,
        access: vk::AccessFlags,
        stage: vk::PipelineStageFlags,
    ) -> Self {
        Self {
            layout,
            access,
            stage,
        }
    }

    fn subsumes(&self, other: &TextureUsageState) -> bool {
        self.layout == other.layout
            && self.access.contains(other.access)
            && self.stage.contains(other.stage)
    }
}

/// How a pass accesses a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferAccess {
    VertexInput,
    IndexRead,
    UniformRead,
    StorageLoad,
    StorageStore,
    StorageLoadStore,
}

impl BufferAccess {
    pub fn to_vk(self) -> vk::AccessFlags {
        match self {
            BufferAccess::VertexInput => vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            BufferAccess::IndexRead => vk::AccessFlags::INDEX_READ,
            BufferAccess::UniformRead => vk::AccessFlags::UNIFORM_READ,
            BufferAccess::StorageLoad => vk::AccessFlags::SHADER_READ,
            BufferAccess::StorageStore => vk::AccessFlags::SHADER_WRITE,
            BufferAccess::StorageLoadStore => {
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
            }
        }
    }
}

/// Pipeline stage a buffer access happens in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferStage {
    VertexInput,
    VertexShader,
    FragmentShader,
    ComputeShader,
}

impl BufferStage {
    pub fn to_vk(self) -> vk::PipelineStageFlags {
        match self {
            BufferStage::VertexInput => vk::PipelineStageFlags::VERTEX_INPUT,
            BufferStage::VertexShader => vk::PipelineStageFlags::VERTEX_SHADER,
            BufferStage::FragmentShader => vk::PipelineStageFlags::FRAGMENT_SHADER,
            BufferStage::ComputeShader => vk::PipelineStageFlags::COMPUTE_SHADER,
        }
    }

    /// Converts shader visibility flags to the stages they run in.
    pub fn from_shader_stages(stages: vk::ShaderStageFlags) -> vk::PipelineStageFlags {
        let mut out = vk::PipelineStageFlags::empty();
        if stages.contains(vk::ShaderStageFlags::VERTEX) {
            out |= vk::PipelineStageFlags::VERTEX_SHADER;
        }
        if stages.contains(vk::ShaderStageFlags::FRAGMENT) {
            out |= vk::PipelineStageFlags::FRAGMENT_SHADER;
        }
        if stages.contains(vk::ShaderStageFlags::COMPUTE) {
            out |= vk::PipelineStageFlags::COMPUTE_SHADER;
        }
        out
    }
}

/// How a pass accesses a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureAccess {
    Sample,
    ColorOutput,
    DepthStencilOutput,
    StorageLoad,
    StorageStore,
    StorageLoadStore,
}

impl TextureAccess {
    pub fn to_vk(self) -> vk::AccessFlags {
        match self {
            TextureAccess::Sample | TextureAccess::StorageLoad => vk::AccessFlags::SHADER_READ,
            TextureAccess::ColorOutput => {
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            }
            TextureAccess::DepthStencilOutput => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            TextureAccess::StorageStore => vk::AccessFlags::SHADER_WRITE,
            TextureAccess::StorageLoadStore => {
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
            }
        }
    }

    /// Image layout the access requires.
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            TextureAccess::Sample => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            TextureAccess::ColorOutput => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            TextureAccess::DepthStencilOutput => {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            }
            TextureAccess::StorageLoad
            | TextureAccess::StorageStore
            | TextureAccess::StorageLoadStore => vk::ImageLayout::GENERAL,
        }
    }
}

/// Pipeline stage a texture access happens in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureStage {
    ColorAttachmentOutput,
    FragmentTests,
    VertexShader,
    FragmentShader,
    ComputeShader,
}

impl TextureStage {
    pub fn to_vk(self) -> vk::PipelineStageFlags {
        match self {
            TextureStage::ColorAttachmentOutput => {
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            }
            TextureStage::FragmentTests => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            }
            TextureStage::VertexShader => vk::PipelineStageFlags::VERTEX_SHADER,
            TextureStage::FragmentShader => vk::PipelineStageFlags::FRAGMENT_SHADER,
            TextureStage::ComputeShader => vk::PipelineStageFlags::COMPUTE_SHADER,
        }
    }
}

#[derive(Debug)]
struct BufferEntry {
    buffer: vk::Buffer,
    begin: BufferUsageState,
    pass: BufferUsageState,
}

#[derive(Debug)]
struct TextureEntry {
    image: vk::Image,
    range: ImageRange,
    begin: TextureUsageState,
    pass: TextureUsageState,
}

/// Ephemeral per-pass access tracker.
///
/// Entries keep first-touch order so the synthesized barriers are
/// deterministic.
#[derive(Debug, Default)]
pub struct PassResourceTracker {
    buffers: Vec<BufferEntry>,
    buffer_index: FxHashMap<vk::Buffer, usize>,
    textures: Vec<TextureEntry>,
    texture_index: FxHashMap<vk::Image, usize>,
}

impl PassResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.textures.is_empty()
    }

    /// Records a buffer access, widening the pass entry and updating the
    /// buffer's global state.
    pub fn track_buffer(
        &mut self,
        buffer: vk::Buffer,
        global: &mut BufferUsageState,
        access: BufferAccess,
        stage: vk::PipelineStageFlags,
    ) {
        let used = BufferUsageState::new(access.to_vk(), stage);
        let index = match self.buffer_index.get(&buffer).copied() {
            Some(index) => {
                let entry = &mut self.buffers[index];
                entry.pass.access |= used.access;
                entry.pass.stage |= used.stage;
                index
            }
            None => {
                let index = self.buffers.len();
                self.buffer_index.insert(buffer, index);
                self.buffers.push(BufferEntry {
                    buffer,
                    begin: *global,
                    pass: used,
                });
                index
            }
        };
        let entry = &self.buffers[index];
        *global = if is_read_only(entry.begin.access) && is_read_only(entry.pass.access) {
            BufferUsageState::new(
                entry.begin.access | entry.pass.access,
                entry.begin.stage | entry.pass.stage,
            )
        } else {
            entry.pass
        };
    }

    /// Records a texture access. Conflicting layouts within one pass fall
    /// back to `GENERAL`.
    pub fn track_texture(
        &mut self,
        image: vk::Image,
        range: ImageRange,
        global: &mut TextureUsageState,
        access: TextureAccess,
        stage: vk::PipelineStageFlags,
    ) {
        let used = TextureUsageState::new(access.layout(), access.to_vk(), stage);
        let index = match self.texture_index.get(&image).copied() {
            Some(index) => {
                let entry = &mut self.textures[index];
                if entry.pass.layout != used.layout {
                    entry.pass.layout = vk::ImageLayout::GENERAL;
                }
                entry.pass.access |= used.access;
                entry.pass.stage |= used.stage;
                entry.range = entry.range.union(range);
                index
            }
            None => {
                let index = self.textures.len();
                self.texture_index.insert(image, index);
                self.textures.push(TextureEntry {
                    image,
                    range,
                    begin: *global,
                    pass: used,
                });
                index
            }
        };
        let entry = &self.textures[index];
        *global = if entry.begin.layout == entry.pass.layout
            && is_read_only(entry.begin.access)
            && is_read_only(entry.pass.access)
        {
            TextureUsageState::new(
                entry.pass.layout,
                entry.begin.access | entry.pass.access,
                entry.begin.stage | entry.pass.stage,
            )
        } else {
            entry.pass
        };
    }

    /// Consumes the tracker and returns the barriers needed before the pass.
    pub fn finish(self) -> (Vec<BufferBarrier>, Vec<ImageBarrier>) {
        let buffers = self
            .buffers
            .iter()
            .filter_map(|e| buffer_transition(e.buffer, &e.begin, &e.pass))
            .collect();
        let images = self
            .textures
            .iter()
            .filter_map(|e| image_transition(e.image, e.range, &e.begin, &e.pass))
            .collect();
        (buffers, images)
    }
}

fn buffer_transition(
    buffer: vk::Buffer,
    begin: &BufferUsageState,
    target: &BufferUsageState,
) -> Option<BufferBarrier> {
    if begin.is_unused() {
        return None;
    }
    if is_read_only(begin.access) && is_read_only(target.access) && begin.subsumes(target) {
        return None;
    }
    Some(BufferBarrier {
        buffer,
        offset: 0,
        size: vk::WHOLE_SIZE,
        src_access: begin.access,
        dst_access: target.access,
        src_stage: begin.stage,
        dst_stage: target.stage,
    })
}

fn image_transition(
    image: vk::Image,
    range: ImageRange,
    begin: &TextureUsageState,
    target: &TextureUsageState,
) -> Option<ImageBarrier> {
    if is_read_only(begin.access) && is_read_only(target.access) && begin.subsumes(target) {
        return None;
    }
    let src_stage = if begin.stage.is_empty() {
        vk::PipelineStageFlags::TOP_OF_PIPE
    } else {
        begin.stage
    };
    Some(ImageBarrier {
        image,
        range,
        old_layout: begin.layout,
        new_layout: target.layout,
        src_access: begin.access,
        dst_access: target.access,
        src_stage,
        dst_stage: target.stage,
    })
}

/// Barrier for a buffer access recorded outside a pass (copies, readbacks).
/// Updates `state` to the new access.
pub fn tracked_buffer_barrier(
    buffer: vk::Buffer,
    state: &mut BufferUsageState,
    access: vk::AccessFlags,
    stage: vk::PipelineStageFlags,
) -> Option<BufferBarrier> {
    let target = BufferUsageState::new(access, stage);
    let barrier = buffer_transition(buffer, state, &target);
    *state = target;
    barrier
}

/// Barrier for an image access recorded outside a pass. Updates `state`.
pub fn tracked_image_barrier(
    image: vk::Image,
    range: ImageRange,
    state: &mut TextureUsageState,
    target: TextureUsageState,
) -> Option<ImageBarrier> {
    let barrier = image_transition(image, range, state, &target);
    *state = target;
    barrier
}

/// Storage accesses seen so far in a compute pass, since the last barrier
/// on each resource.
///
/// A dispatch that accesses a resource written by an earlier dispatch of the
/// same pass needs a compute-to-compute barrier right before it, which the
/// pass-begin barrier batch cannot provide. A write after earlier reads only
/// needs the reads to finish, so it gets an execution barrier with no access
/// masks.
#[derive(Debug, Default)]
pub struct ComputeHazards {
    buffers: FxHashMap<vk::Buffer, vk::AccessFlags>,
    images: FxHashMap<vk::Image, StorageImageUse>,
}

#[derive(Clone, Copy, Debug)]
struct StorageImageUse {
    range: ImageRange,
    layout: vk::ImageLayout,
    access: vk::AccessFlags,
}

/// Source access of the barrier `next` needs after `prev`, or `None` when
/// both only read.
fn hazard_src_access(prev: vk::AccessFlags, next: vk::AccessFlags) -> Option<vk::AccessFlags> {
    if !is_read_only(prev) {
        Some(vk::AccessFlags::SHADER_WRITE)
    } else if !is_read_only(next) {
        Some(vk::AccessFlags::empty())
    } else {
        None
    }
}

impl ComputeHazards {
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.images.clear();
    }

    /// Checks a buffer access against earlier dispatches and records it.
    pub fn buffer(&mut self, buffer: vk::Buffer, access: BufferAccess) -> Option<BufferBarrier> {
        let access = access.to_vk();
        let Some(prev) = self.buffers.get_mut(&buffer) else {
            self.buffers.insert(buffer, access);
            return None;
        };
        let Some(src_access) = hazard_src_access(*prev, access) else {
            *prev |= access;
            return None;
        };
        *prev = access;
        Some(BufferBarrier {
            buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_access,
            dst_access: if src_access.is_empty() {
                vk::AccessFlags::empty()
            } else {
                access
            },
            src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        })
    }

    /// Checks a storage image access against earlier dispatches and records
    /// it.
    pub fn image(
        &mut self,
        image: vk::Image,
        range: ImageRange,
        access: TextureAccess,
    ) -> Option<ImageBarrier> {
        let next = StorageImageUse {
            range,
            layout: access.layout(),
            access: access.to_vk(),
        };
        let Some(prev) = self.images.get_mut(&image) else {
            self.images.insert(image, next);
            return None;
        };
        let Some(src_access) = hazard_src_access(prev.access, next.access) else {
            prev.range = prev.range.union(next.range);
            prev.access |= next.access;
            return None;
        };
        let barrier = ImageBarrier {
            image,
            range: prev.range.union(next.range),
            old_layout: prev.layout,
            new_layout: next.layout,
            src_access,
            dst_access: if src_access.is_empty() {
                vk::AccessFlags::empty()
            } else {
                next.access
            },
            src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        };
        *prev = next;
        Some(barrier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn buffer(raw: u64) -> vk::Buffer {
        vk::Buffer::from_raw(raw)
    }

    fn image(raw: u64) -> vk::Image {
        vk::Image::from_raw(raw)
    }

    fn uploaded_buffer() -> BufferUsageState {
        BufferUsageState::new(vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
    }

    fn uploaded_texture() -> TextureUsageState {
        TextureUsageState::new(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        )
    }

    #[test]
    fn test_read_then_write_unions_access() {
        let mut tracker = PassResourceTracker::new();
        let mut global = uploaded_buffer();
        let stage = vk::PipelineStageFlags::COMPUTE_SHADER;
        tracker.track_buffer(buffer(1), &mut global, BufferAccess::StorageLoad, stage);
        tracker.track_buffer(buffer(1), &mut global, BufferAccess::StorageStore, stage);

        let (buffers, images) = tracker.finish();
        assert!(images.is_empty());
        assert_eq!(buffers.len(), 1);
        assert_eq!(
            buffers[0].dst_access,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(buffers[0].src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(global.access, buffers[0].dst_access);
    }

    #[test]
    fn test_unused_buffer_needs_no_barrier() {
        let mut tracker = PassResourceTracker::new();
        let mut global = BufferUsageState::default();
        tracker.track_buffer(
            buffer(1),
            &mut global,
            BufferAccess::VertexInput,
            BufferStage::VertexInput.to_vk(),
        );
        let (buffers, _) = tracker.finish();
        assert!(buffers.is_empty());
        assert_eq!(global.access, vk::AccessFlags::VERTEX_ATTRIBUTE_READ);
    }

    #[test]
    fn test_sampled_texture_second_pass_has_no_barrier() {
        let range = ImageRange::color(1);
        let stage = TextureStage::FragmentShader.to_vk();
        let mut global = uploaded_texture();

        let mut first = PassResourceTracker::new();
        first.track_texture(image(7), range, &mut global, TextureAccess::Sample, stage);
        let (_, barriers) = first.finish();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(
            barriers[0].new_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );

        let mut second = PassResourceTracker::new();
        second.track_texture(image(7), range, &mut global, TextureAccess::Sample, stage);
        let (_, barriers) = second.finish();
        assert!(barriers.is_empty());
    }

    #[test]
    fn test_conflicting_layouts_become_general() {
        let mut tracker = PassResourceTracker::new();
        let mut global = uploaded_texture();
        let range = ImageRange::color(1);
        let stage = TextureStage::ComputeShader.to_vk();
        tracker.track_texture(image(3), range, &mut global, TextureAccess::Sample, stage);
        tracker.track_texture(image(3), range, &mut global, TextureAccess::StorageStore, stage);
        let (_, barriers) = tracker.finish();
        assert_eq!(barriers[0].new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(global.layout, vk::ImageLayout::GENERAL);
    }

    #[test]
    fn test_first_image_use_starts_at_top_of_pipe() {
        let mut tracker = PassResourceTracker::new();
        let mut global = TextureUsageState::default();
        tracker.track_texture(
            image(9),
            ImageRange::color(1),
            &mut global,
            TextureAccess::ColorOutput,
            TextureStage::ColorAttachmentOutput.to_vk(),
        );
        let (_, barriers) = tracker.finish();
        assert_eq!(barriers[0].src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn test_barriers_keep_first_touch_order() {
        let mut tracker = PassResourceTracker::new();
        let mut a = uploaded_buffer();
        let mut b = uploaded_buffer();
        let stage = vk::PipelineStageFlags::VERTEX_SHADER;
        tracker.track_buffer(buffer(20), &mut b, BufferAccess::UniformRead, stage);
        tracker.track_buffer(buffer(10), &mut a, BufferAccess::UniformRead, stage);
        let (buffers, _) = tracker.finish();
        assert_eq!(buffers[0].buffer, buffer(20));
        assert_eq!(buffers[1].buffer, buffer(10));
    }

    #[test]
    fn test_tracked_buffer_barrier() {
        let mut state = BufferUsageState::default();
        assert!(
            tracked_buffer_barrier(
                buffer(1),
                &mut state,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TRANSFER
            )
            .is_none()
        );
        let barrier = tracked_buffer_barrier(
            buffer(1),
            &mut state,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        );
        assert!(barrier.is_some());
        assert_eq!(state.access, vk::AccessFlags::TRANSFER_READ);
    }

    #[test]
    fn test_compute_hazards() {
        let mut hazards = ComputeHazards::default();
        assert!(hazards.buffer(buffer(5), BufferAccess::StorageStore).is_none());
        let barrier = hazards.buffer(buffer(5), BufferAccess::StorageLoad);
        assert!(barrier.is_some());
        assert!(hazards.buffer(buffer(5), BufferAccess::StorageLoad).is_none());

        let range = ImageRange::color(1);
        assert!(hazards.image(image(2), range, TextureAccess::StorageStore).is_none());
        assert!(hazards.image(image(2), range, TextureAccess::StorageLoad).is_some());
    }

    #[test]
    fn test_write_after_read_waits_for_readers() {
        let mut hazards = ComputeHazards::default();
        assert!(hazards.buffer(buffer(6), BufferAccess::StorageLoad).is_none());
        assert!(hazards.buffer(buffer(6), BufferAccess::StorageLoad).is_none());
        let barrier = hazards
            .buffer(buffer(6), BufferAccess::StorageStore)
            .expect("write after read");
        assert_eq!(barrier.src_access, vk::AccessFlags::empty());
        assert_eq!(barrier.dst_access, vk::AccessFlags::empty());
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags::COMPUTE_SHADER);

        let barrier = hazards
            .buffer(buffer(6), BufferAccess::StorageLoad)
            .expect("read after write");
        assert_eq!(barrier.src_access, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(barrier.dst_access, vk::AccessFlags::SHADER_READ);

        let range = ImageRange::color(1);
        assert!(hazards.image(image(4), range, TextureAccess::StorageLoad).is_none());
        let barrier = hazards
            .image(image(4), range, TextureAccess::StorageStore)
            .expect("image write after read");
        assert_eq!(barrier.src_access, vk::AccessFlags::empty());
        assert_eq!(barrier.old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::GENERAL);
    }
}

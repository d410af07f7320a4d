//! Graphics and compute pipeline descriptions.
//!
//! Pipelines are described with plain data ([`GraphicsPipelineDesc`],
//! [`ComputePipelineDesc`]) and created through [`crate::Rhi`]. The native
//! device turns a description into a `VkPipeline` using dynamic rendering,
//! so pipelines carry attachment formats instead of a render pass.
//!
//! Viewport and scissor are always dynamic state. Blend constants and the
//! stencil reference are dynamic when the description enables blending or
//! stencil testing.
//!
//! # Example
//!
//! ```no_run
//! use vkframe_rhi::pipeline::{
//!     GraphicsPipelineDesc, ShaderStage, ShaderStageDesc, VertexInputLayout,
//! };
//! use vkframe_rhi::vk;
//!
//! # fn example(vs: Vec<u32>, fs: Vec<u32>) {
//! let desc = GraphicsPipelineDesc::new(
//!     ShaderStageDesc::new(ShaderStage::Vertex, vs),
//!     ShaderStageDesc::new(ShaderStage::Fragment, fs),
//! )
//! .with_vertex_input(VertexInputLayout::interleaved(20, &[
//!     (vk::Format::R32G32_SFLOAT, 0),
//!     (vk::Format::R32G32B32_SFLOAT, 8),
//! ]))
//! .with_color_format(vk::Format::B8G8R8A8_SRGB);
//! # let _ = desc;
//! # }
//! ```

use ash::vk;

use crate::resource::BindingSetId;

/// Shader stage of a SPIR-V module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Converts to Vulkan shader stage flags.
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// One shader stage: SPIR-V words plus entry point.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderStageDesc {
    pub stage: ShaderStage,
    pub spirv: Vec<u32>,
    pub entry_point: String,
}

impl ShaderStageDesc {
    /// A stage using the conventional `main` entry point.
    pub fn new(stage: ShaderStage, spirv: Vec<u32>) -> Self {
        Self {
            stage,
            spirv,
            entry_point: "main".to_string(),
        }
    }
}

/// Primitive topology for input assembly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

impl PrimitiveTopology {
    /// Converts to Vulkan primitive topology.
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        }
    }
}

/// Face culling mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

impl CullMode {
    /// Converts to Vulkan cull mode flags.
    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
        }
    }
}

/// Front face winding order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

impl FrontFace {
    /// Converts to Vulkan front face.
    pub fn to_vk(self) -> vk::FrontFace {
        match self {
            FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
            FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
        }
    }
}

/// Depth comparison operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    /// Converts to Vulkan compare op.
    pub fn to_vk(self) -> vk::CompareOp {
        match self {
            CompareOp::Never => vk::CompareOp::NEVER,
            CompareOp::Less => vk::CompareOp::LESS,
            CompareOp::Equal => vk::CompareOp::EQUAL,
            CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareOp::Greater => vk::CompareOp::GREATER,
            CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
            CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareOp::Always => vk::CompareOp::ALWAYS,
        }
    }
}

/// Blend factor for color blending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
}

impl BlendFactor {
    /// Converts to Vulkan blend factor.
    pub fn to_vk(self) -> vk::BlendFactor {
        match self {
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
            BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
            BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
            BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
            BlendFactor::ConstantColor => vk::BlendFactor::CONSTANT_COLOR,
            BlendFactor::OneMinusConstantColor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
        }
    }

    fn uses_constant(self) -> bool {
        matches!(
            self,
            BlendFactor::ConstantColor | BlendFactor::OneMinusConstantColor
        )
    }
}

/// Blend operation for color blending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendOp {
    /// Converts to Vulkan blend op.
    pub fn to_vk(self) -> vk::BlendOp {
        match self {
            BlendOp::Add => vk::BlendOp::ADD,
            BlendOp::Subtract => vk::BlendOp::SUBTRACT,
            BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOp::Min => vk::BlendOp::MIN,
            BlendOp::Max => vk::BlendOp::MAX,
        }
    }
}

/// Blend state of one color attachment. `None` factors mean blending off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlendState {
    pub enabled: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enabled: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
        }
    }
}

impl BlendState {
    /// Premultiplied-alpha style blending: `src * a + dst * (1 - a)`.
    pub fn alpha_blend() -> Self {
        Self {
            enabled: true,
            src_color: BlendFactor::SrcAlpha,
            dst_color: BlendFactor::OneMinusSrcAlpha,
            ..Default::default()
        }
    }

    /// Converts to Vulkan pipeline color blend attachment state.
    pub fn to_vk(&self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: self.enabled.into(),
            src_color_blend_factor: self.src_color.to_vk(),
            dst_color_blend_factor: self.dst_color.to_vk(),
            color_blend_op: self.color_op.to_vk(),
            src_alpha_blend_factor: self.src_alpha.to_vk(),
            dst_alpha_blend_factor: self.dst_alpha.to_vk(),
            alpha_blend_op: self.alpha_op.to_vk(),
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }

    fn uses_constant(&self) -> bool {
        self.enabled
            && [self.src_color, self.dst_color, self.src_alpha, self.dst_alpha]
                .iter()
                .any(|f| f.uses_constant())
    }
}

/// One vertex buffer binding slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBinding {
    pub stride: u32,
    pub per_instance: bool,
}

/// One vertex attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Vertex input layout of a graphics pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VertexInputLayout {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexInputLayout {
    /// A single per-vertex binding with attributes at consecutive locations.
    pub fn interleaved(stride: u32, attributes: &[(vk::Format, u32)]) -> Self {
        Self {
            bindings: vec![VertexBinding {
                stride,
                per_instance: false,
            }],
            attributes: attributes
                .iter()
                .enumerate()
                .map(|(location, &(format, offset))| VertexAttribute {
                    location: location as u32,
                    binding: 0,
                    format,
                    offset,
                })
                .collect(),
        }
    }

    /// Vulkan binding descriptions, numbered by position.
    pub fn vk_bindings(&self) -> Vec<vk::VertexInputBindingDescription> {
        self.bindings
            .iter()
            .enumerate()
            .map(|(binding, b)| vk::VertexInputBindingDescription {
                binding: binding as u32,
                stride: b.stride,
                input_rate: if b.per_instance {
                    vk::VertexInputRate::INSTANCE
                } else {
                    vk::VertexInputRate::VERTEX
                },
            })
            .collect()
    }

    /// Vulkan attribute descriptions.
    pub fn vk_attributes(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: a.format,
                offset: a.offset,
            })
            .collect()
    }
}

/// Graphics pipeline description.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphicsPipelineDesc {
    pub stages: Vec<ShaderStageDesc>,
    pub vertex_input: VertexInputLayout,
    pub topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareOp,
    pub stencil_test: bool,
    /// Blend state per color attachment; missing entries use the default.
    pub blend: Vec<BlendState>,
    pub sample_count: u32,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    /// Binding set whose layout the pipeline is built against.
    pub binding_set: Option<BindingSetId>,
    pub line_width: f32,
}

impl GraphicsPipelineDesc {
    /// A pipeline with the given vertex and fragment stages and defaults for
    /// everything else.
    pub fn new(vertex: ShaderStageDesc, fragment: ShaderStageDesc) -> Self {
        Self {
            stages: vec![vertex, fragment],
            vertex_input: VertexInputLayout::default(),
            topology: PrimitiveTopology::default(),
            cull_mode: CullMode::default(),
            front_face: FrontFace::default(),
            depth_test: false,
            depth_write: false,
            depth_compare: CompareOp::default(),
            stencil_test: false,
            blend: Vec::new(),
            sample_count: 1,
            color_formats: Vec::new(),
            depth_format: None,
            binding_set: None,
            line_width: 1.0,
        }
    }

    pub fn with_vertex_input(mut self, layout: VertexInputLayout) -> Self {
        self.vertex_input = layout;
        self
    }

    pub fn with_color_format(mut self, format: vk::Format) -> Self {
        self.color_formats.push(format);
        self
    }

    /// Enables depth testing and writing against `format`.
    pub fn with_depth(mut self, format: vk::Format, compare: CompareOp) -> Self {
        self.depth_format = Some(format);
        self.depth_test = true;
        self.depth_write = true;
        self.depth_compare = compare;
        self
    }

    pub fn with_binding_set(mut self, binding_set: BindingSetId) -> Self {
        self.binding_set = Some(binding_set);
        self
    }

    pub fn with_blend(mut self, blend: BlendState) -> Self {
        self.blend.push(blend);
        self
    }

    /// Per-attachment blend states, padded with defaults.
    pub fn vk_blend_attachments(&self) -> Vec<vk::PipelineColorBlendAttachmentState> {
        (0..self.color_formats.len())
            .map(|i| self.blend.get(i).copied().unwrap_or_default().to_vk())
            .collect()
    }

    /// Dynamic states the pipeline is created with.
    pub fn dynamic_states(&self) -> Vec<vk::DynamicState> {
        let mut states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        if self.blend.iter().any(BlendState::uses_constant) {
            states.push(vk::DynamicState::BLEND_CONSTANTS);
        }
        if self.stencil_test {
            states.push(vk::DynamicState::STENCIL_REFERENCE);
        }
        states
    }

    /// Looks up the stage of a given kind.
    pub fn stage(&self, stage: ShaderStage) -> Option<&ShaderStageDesc> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Compute pipeline description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputePipelineDesc {
    pub shader: ShaderStageDesc,
    pub binding_set: Option<BindingSetId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(kind: ShaderStage) -> ShaderStageDesc {
        ShaderStageDesc::new(kind, vec![0x0723_0203])
    }

    #[test]
    fn test_shader_stage_to_vk() {
        assert_eq!(ShaderStage::Vertex.to_vk(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(ShaderStage::Fragment.to_vk(), vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(ShaderStage::Compute.to_vk(), vk::ShaderStageFlags::COMPUTE);
    }

    #[test]
    fn test_fixed_function_to_vk() {
        assert_eq!(
            PrimitiveTopology::TriangleStrip.to_vk(),
            vk::PrimitiveTopology::TRIANGLE_STRIP
        );
        assert_eq!(CullMode::Back.to_vk(), vk::CullModeFlags::BACK);
        assert_eq!(FrontFace::Clockwise.to_vk(), vk::FrontFace::CLOCKWISE);
        assert_eq!(CompareOp::LessOrEqual.to_vk(), vk::CompareOp::LESS_OR_EQUAL);
        assert_eq!(BlendOp::ReverseSubtract.to_vk(), vk::BlendOp::REVERSE_SUBTRACT);
        assert_eq!(
            BlendFactor::OneMinusSrcAlpha.to_vk(),
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
    }

    #[test]
    fn test_alpha_blend_state() {
        let state = BlendState::alpha_blend().to_vk();
        assert_eq!(state.blend_enable, vk::TRUE);
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn test_interleaved_vertex_input() {
        let layout = VertexInputLayout::interleaved(
            20,
            &[
                (vk::Format::R32G32_SFLOAT, 0),
                (vk::Format::R32G32B32_SFLOAT, 8),
            ],
        );
        let bindings = layout.vk_bindings();
        let attributes = layout.vk_attributes();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 20);
        assert_eq!(bindings[0].input_rate, vk::VertexInputRate::VERTEX);
        assert_eq!(attributes[1].location, 1);
        assert_eq!(attributes[1].offset, 8);
    }

    #[test]
    fn test_dynamic_states() {
        let desc =
            GraphicsPipelineDesc::new(stage(ShaderStage::Vertex), stage(ShaderStage::Fragment))
            .with_color_format(vk::Format::B8G8R8A8_SRGB);
        assert_eq!(desc.dynamic_states().len(), 2);

        let desc = desc.with_blend(BlendState {
            enabled: true,
            src_color: BlendFactor::ConstantColor,
            ..Default::default()
        });
        assert!(desc
            .dynamic_states()
            .contains(&vk::DynamicState::BLEND_CONSTANTS));
    }

    #[test]
    fn test_blend_attachments_padded() {
        let desc =
            GraphicsPipelineDesc::new(stage(ShaderStage::Vertex), stage(ShaderStage::Fragment))
            .with_color_format(vk::Format::R8G8B8A8_UNORM)
            .with_color_format(vk::Format::R8G8B8A8_UNORM)
            .with_blend(BlendState::alpha_blend());
        let attachments = desc.vk_blend_attachments();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].blend_enable, vk::TRUE);
        assert_eq!(attachments[1].blend_enable, vk::FALSE);
    }

    #[test]
    fn test_stage_lookup() {
        let desc =
            GraphicsPipelineDesc::new(stage(ShaderStage::Vertex), stage(ShaderStage::Fragment));
        assert!(desc.stage(ShaderStage::Fragment).is_some());
        assert!(desc.stage(ShaderStage::Compute).is_none());
    }
}

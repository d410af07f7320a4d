//! Shared setup for the integration tests.

#![allow(dead_code)]

use vkframe_core::BackendConfig;
use vkframe_rhi::native::{NullCall, NullDevice};
use vkframe_rhi::pipeline::{GraphicsPipelineDesc, ShaderStage, ShaderStageDesc};
use vkframe_rhi::resource::{AttachmentDesc, TextureUsage};
use vkframe_rhi::{
    vk, BindingSetId, BufferDesc, BufferKind, BufferUsage, GraphicsPipelineId, Rhi,
    RenderTargetDesc, RenderTargetId, TextureDesc, TextureId,
};

/// SPIR-V magic number; the null device only checks that code is present.
pub const SPIRV: [u32; 1] = [0x0723_0203];

pub fn config(frames_in_flight: usize) -> BackendConfig {
    BackendConfig {
        frames_in_flight,
        ..BackendConfig::default()
    }
}

/// A backend over an immediately completing null device. The returned
/// device shares state with the one inside the backend.
pub fn backend(frames_in_flight: usize) -> (NullDevice, Rhi<NullDevice>) {
    let device = NullDevice::new();
    let rhi = Rhi::new(device.clone(), config(frames_in_flight)).expect("backend");
    (device, rhi)
}

/// Like [`backend`], but submissions stay pending until
/// [`NullDevice::complete_submissions`].
pub fn manual_backend(frames_in_flight: usize) -> (NullDevice, Rhi<NullDevice>) {
    let device = NullDevice::manual();
    let rhi = Rhi::new(device.clone(), config(frames_in_flight)).expect("backend");
    (device, rhi)
}

pub fn shader(stage: ShaderStage) -> ShaderStageDesc {
    ShaderStageDesc::new(stage, SPIRV.to_vec())
}

pub fn pipeline_desc(binding_set: Option<BindingSetId>) -> GraphicsPipelineDesc {
    let desc = GraphicsPipelineDesc::new(shader(ShaderStage::Vertex), shader(ShaderStage::Fragment))
        .with_color_format(vk::Format::R8G8B8A8_UNORM);
    match binding_set {
        Some(set) => desc.with_binding_set(set),
        None => desc,
    }
}

pub fn pipeline(
    rhi: &mut Rhi<NullDevice>,
    binding_set: Option<BindingSetId>,
) -> GraphicsPipelineId {
    rhi.create_graphics_pipeline("pipeline", pipeline_desc(binding_set))
        .expect("pipeline")
}

pub fn buffer(
    rhi: &mut Rhi<NullDevice>,
    kind: BufferKind,
    usage: BufferUsage,
    size: u64,
) -> vkframe_rhi::BufferId {
    rhi.create_buffer("buffer", BufferDesc { kind, usage, size })
        .expect("buffer")
}

/// A 4x4 RGBA8 texture usable as a color attachment, and a render target
/// over it.
pub fn color_target(rhi: &mut Rhi<NullDevice>) -> (TextureId, RenderTargetId) {
    let texture = rhi
        .create_texture(
            "color",
            TextureDesc {
                extent: vk::Extent2D {
                    width: 4,
                    height: 4,
                },
                format: vk::Format::R8G8B8A8_UNORM,
                mip_levels: 1,
                sample_count: 1,
                usage: TextureUsage {
                    sampled: true,
                    render_target: true,
                    storage: false,
                },
            },
        )
        .expect("color texture");
    let target = rhi
        .create_render_target(
            "target",
            RenderTargetDesc {
                color: vec![AttachmentDesc::texture(texture)],
                depth_stencil: None,
            },
        )
        .expect("render target");
    (texture, target)
}

/// Calls of the most recent completed submission.
pub fn last_calls(device: &NullDevice) -> Vec<NullCall> {
    device
        .last_submission()
        .map(|s| s.calls)
        .unwrap_or_default()
}

/// Index of the first call matching `pred`.
pub fn position(calls: &[NullCall], pred: impl Fn(&NullCall) -> bool) -> Option<usize> {
    calls.iter().position(pred)
}

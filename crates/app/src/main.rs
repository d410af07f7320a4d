//! vkframe demo - drives the backend through a few offscreen frames.
//!
//! Runs against the simulated device so it works without a GPU. The frame
//! loop is the same one a windowed application would run: update per-frame
//! uniforms, record a pass, submit, and let the pacer recycle slots.

use anyhow::{Context, Result, bail};
use bytemuck::{Pod, Zeroable};
use tracing::{info, warn};

use vkframe_core::{BackendConfig, FrameTimer};
use vkframe_rhi::pipeline::{GraphicsPipelineDesc, ShaderStage, ShaderStageDesc, VertexInputLayout};
use vkframe_rhi::resource::{AttachmentDesc, TextureUsage};
use vkframe_rhi::{
    BindingSetDesc, BufferDesc, BufferKind, BufferUsage, FrameOpResult, NullDevice, PassOptions,
    PassTarget, RenderTargetDesc, ResourceUpdateBatch, Rhi, TextureDesc, vk,
};

const CONFIG_PATH: &str = "vkframe.toml";
const DEFAULT_FRAMES: u64 = 8;
const TARGET_SIZE: u32 = 64;

/// Stand-in module; the simulated device only checks for the magic number.
const SPIRV: [u32; 1] = [0x0723_0203];

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct FrameUniforms {
    time: f32,
    frame: u32,
    _pad: [u32; 2],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.5],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        position: [0.5, 0.5],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        position: [-0.5, 0.5],
        color: [0.0, 0.0, 1.0],
    },
];

fn frame_count_arg() -> Result<u64> {
    match std::env::args().nth(1) {
        None => Ok(DEFAULT_FRAMES),
        Some(arg) => arg
            .parse()
            .with_context(|| format!("frame count must be a number, got '{arg}'")),
    }
}

fn main() -> Result<()> {
    vkframe_core::init_logging();
    info!("Starting vkframe demo");

    let frames = frame_count_arg()?;
    let config = BackendConfig::load_or_default(CONFIG_PATH);
    let mut rhi = Rhi::new(NullDevice::new(), config).context("failed to create backend")?;

    let vertices = rhi.create_buffer(
        "triangle vertices",
        BufferDesc {
            kind: BufferKind::Immutable,
            usage: BufferUsage::Vertex,
            size: std::mem::size_of_val(&TRIANGLE) as u64,
        },
    )?;
    let uniforms = rhi.create_buffer(
        "frame uniforms",
        BufferDesc {
            kind: BufferKind::Dynamic,
            usage: BufferUsage::Uniform,
            size: std::mem::size_of::<FrameUniforms>() as u64,
        },
    )?;
    let color = rhi.create_texture(
        "color",
        TextureDesc {
            extent: vk::Extent2D {
                width: TARGET_SIZE,
                height: TARGET_SIZE,
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
    )?;
    let target = rhi.create_render_target(
        "main target",
        RenderTargetDesc {
            color: vec![AttachmentDesc::texture(color)],
            depth_stencil: None,
        },
    )?;
    let globals = rhi.create_binding_set(
        "globals",
        BindingSetDesc::new().uniform_buffer(
            0,
            vk::ShaderStageFlags::VERTEX,
            uniforms,
            std::mem::size_of::<FrameUniforms>() as u64,
        ),
    )?;
    let pipeline = rhi.material_pipeline(
        "vertex color",
        GraphicsPipelineDesc::new(
            ShaderStageDesc::new(ShaderStage::Vertex, SPIRV.to_vec()),
            ShaderStageDesc::new(ShaderStage::Fragment, SPIRV.to_vec()),
        )
        .with_vertex_input(VertexInputLayout::interleaved(
            std::mem::size_of::<Vertex>() as u32,
            &[(vk::Format::R32G32_SFLOAT, 0), (vk::Format::R32G32B32_SFLOAT, 8)],
        ))
        .with_color_format(vk::Format::R8G8B8A8_UNORM)
        .with_binding_set(globals),
        0,
    )?;

    let mut initial = Some({
        let mut batch = ResourceUpdateBatch::new();
        batch.upload_static_buffer(vertices, 0, bytemuck::cast_slice(&TRIANGLE));
        batch
    });
    let mut timer = FrameTimer::new();
    let mut readback = None;

    for frame in 0..frames {
        match rhi.begin_offscreen_frame() {
            FrameOpResult::Success => {}
            FrameOpResult::DeviceLost => bail!("device lost at frame {frame}"),
            other => {
                warn!("Skipping frame {}: {:?}", frame, other);
                continue;
            }
        }

        let elapsed = timer.elapsed().as_secs_f32();
        let data = FrameUniforms {
            time: elapsed,
            frame: frame as u32,
            _pad: [0; 2],
        };
        rhi.begin_dynamic_update(uniforms)?
            .copy_from_slice(bytemuck::bytes_of(&data));
        rhi.end_dynamic_update(uniforms)?;

        rhi.debug_mark_begin("main pass")?;
        rhi.begin_pass(
            PassTarget::RenderTarget(target),
            PassOptions::clear([0.1, 0.1, 0.1, 1.0]),
            initial.take(),
        )?;
        rhi.set_graphics_pipeline(pipeline)?;
        rhi.set_binding_set(globals, &[])?;
        rhi.set_vertex_input(0, &[(vertices, 0)], None)?;
        rhi.set_viewport(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: TARGET_SIZE as f32,
            height: TARGET_SIZE as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        })?;
        rhi.set_scissor(vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: vk::Extent2D {
                width: TARGET_SIZE,
                height: TARGET_SIZE,
            },
        })?;
        rhi.draw(TRIANGLE.len() as u32, 1, 0, 0)?;

        let last = frame + 1 == frames;
        let after = last.then(|| {
            let mut batch = ResourceUpdateBatch::new();
            readback = Some(batch.read_back_texture(color, 0));
            batch
        });
        rhi.end_pass(after)?;
        rhi.debug_mark_end()?;

        let result = rhi.end_offscreen_frame();
        if !result.is_success() {
            bail!("frame {frame} failed to submit: {result:?}");
        }
        timer.tick();
    }

    if !rhi.finish().is_success() {
        bail!("backend failed to drain outstanding work");
    }
    if let Some(readback) = readback {
        match readback.take() {
            Some(image) => info!(
                "Read back {} bytes of the final frame ({:?})",
                image.data.len(),
                image.extent
            ),
            None => warn!(
                "Readback of the final frame failed: {}",
                readback.error().unwrap_or_default()
            ),
        }
    }

    let stats = rhi.stats();
    info!(
        "Rendered {} frames, {} pool(s), {} live resource(s), avg frame {:?}",
        stats.frame_count,
        stats.pool_count,
        stats.live_resources,
        timer.average_frame_time()
    );

    rhi.release_material(pipeline)?;
    Ok(())
}

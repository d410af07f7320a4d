//! Resource and command lifecycle kernel for a Vulkan rendering backend.
//!
//! This crate sits between a renderer and the graphics API. It handles:
//! - Resource records with generations and deferred native destruction
//! - Per-slot copies of dynamic buffers and binding sets
//! - Pooled binding-set allocation
//! - Automatic barriers for resources used in passes
//! - A replayable command list with secondary lists
//! - Frame pacing over a fixed number of frames in flight
//!
//! All of it is driven through [`Rhi`]. The graphics API is reached only
//! through the [`native::NativeDevice`] seam; [`native::AshDevice`] talks to
//! Vulkan and [`native::NullDevice`] simulates a device for tests.

mod error;
mod rhi;
mod store;

pub mod binding;
pub mod cache;
pub mod command;
pub mod frame;
pub mod native;
pub mod pipeline;
pub mod pool;
pub mod release;
pub mod resource;
pub mod slot;
pub mod tracker;
pub mod update;

pub use binding::{BindingDesc, BindingResource, BindingSetDesc, StorageAccess};
pub use command::{
    CommandList, PreparedBindingSet, PreparedBuffer, PreparedIndexBuffer, PreparedPipeline,
};
pub use error::{FrameOpResult, RhiError, RhiResult};
pub use frame::FramePhase;
pub use native::{AshDevice, NativeDevice, NullDevice};
pub use resource::{
    AttachmentDesc, BufferDesc, BufferId, BufferKind, BufferUsage, ComputePipelineId,
    GraphicsPipelineId, Lifecycle, LogicalState, PhysicalState, RenderBufferDesc, RenderBufferId,
    RenderTargetDesc, RenderTargetId, ResourceId, SamplerDesc, SamplerId, SwapChainDesc,
    SwapChainId, TextureDesc, TextureId, BindingSetId, NativeTexture,
};
pub use rhi::{PassOptions, PassTarget, Rhi, RhiStats};
pub use slot::{SlotTag, MAX_FRAMES_IN_FLIGHT};
pub use update::{Readback, ReadbackResult, ResourceUpdateBatch};

// Re-export ash types that users might need
pub use ash::vk;

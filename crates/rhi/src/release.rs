//! Deferred release queue.
//!
//! Destroying a resource hands its native objects to the queue together with
//! the [`SlotTag`] of the last submitted work that used them. A flush frees
//! an entry only once that work has retired, or unconditionally when forced
//! after a device-idle wait.

use ash::vk;
use tracing::debug;

use crate::native::{NativeDevice, NativeImage, NativeSwapchain};
use crate::pool::BindingPoolAllocator;
use crate::resource::ResourceId;
use crate::slot::SlotTag;

/// Native objects of one retired resource (or one retired generation of it).
#[derive(Debug)]
pub enum ReleasePayload {
    Buffer {
        buffers: Vec<vk::Buffer>,
    },
    /// Transient upload/readback buffer owned by the backend.
    StagingBuffer {
        buffer: vk::Buffer,
    },
    Texture {
        image: NativeImage,
        level_views: Vec<vk::ImageView>,
    },
    /// Views the backend made over a caller-owned image.
    ImportedTexture {
        level_views: Vec<vk::ImageView>,
    },
    RenderBuffer {
        image: NativeImage,
    },
    Sampler {
        sampler: vk::Sampler,
    },
    Pipeline {
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
    },
    BindingSet {
        pool_index: Option<usize>,
        layout: vk::DescriptorSetLayout,
    },
    RenderTarget {
        views: Vec<vk::ImageView>,
    },
    SwapChain {
        swapchain: NativeSwapchain,
        /// Per-image multisampled color images, empty without MSAA.
        msaa: Vec<NativeImage>,
    },
    SecondaryCommandBuffer {
        pool: vk::CommandPool,
        buffer: vk::CommandBuffer,
    },
}

impl ReleasePayload {
    /// Frees the native objects. Binding sets return their pool reference
    /// instead of freeing individual sets.
    pub fn free<D: NativeDevice + ?Sized>(self, device: &D, pools: &mut BindingPoolAllocator) {
        match self {
            ReleasePayload::Buffer { buffers } => {
                for buffer in buffers {
                    device.destroy_buffer(buffer);
                }
            }
            ReleasePayload::StagingBuffer { buffer } => device.destroy_buffer(buffer),
            ReleasePayload::Texture { image, level_views } => {
                for view in level_views {
                    device.destroy_image_view(view);
                }
                device.destroy_image(image);
            }
            ReleasePayload::ImportedTexture { level_views } => {
                for view in level_views {
                    device.destroy_image_view(view);
                }
            }
            ReleasePayload::RenderBuffer { image } => device.destroy_image(image),
            ReleasePayload::Sampler { sampler } => device.destroy_sampler(sampler),
            ReleasePayload::Pipeline { pipeline, layout } => {
                device.destroy_pipeline(pipeline);
                device.destroy_pipeline_layout(layout);
            }
            ReleasePayload::BindingSet { pool_index, layout } => {
                if let Some(index) = pool_index {
                    pools.release(index);
                }
                device.destroy_binding_layout(layout);
            }
            ReleasePayload::RenderTarget { views } => {
                for view in views {
                    device.destroy_image_view(view);
                }
            }
            ReleasePayload::SwapChain { swapchain, msaa } => {
                for image in msaa {
                    device.destroy_image(image);
                }
                device.destroy_swapchain(swapchain);
            }
            ReleasePayload::SecondaryCommandBuffer { pool, buffer } => {
                device.free_command_buffer(pool, buffer);
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ReleasePayload::Buffer { .. } => "buffer",
            ReleasePayload::StagingBuffer { .. } => "staging buffer",
            ReleasePayload::Texture { .. } => "texture",
            ReleasePayload::ImportedTexture { .. } => "imported texture",
            ReleasePayload::RenderBuffer { .. } => "render buffer",
            ReleasePayload::Sampler { .. } => "sampler",
            ReleasePayload::Pipeline { .. } => "pipeline",
            ReleasePayload::BindingSet { .. } => "binding set",
            ReleasePayload::RenderTarget { .. } => "render target",
            ReleasePayload::SwapChain { .. } => "swapchain",
            ReleasePayload::SecondaryCommandBuffer { .. } => "secondary command buffer",
        }
    }
}

/// One queued release.
#[derive(Debug)]
pub struct ReleaseEntry {
    pub payload: ReleasePayload,
    pub slot: SlotTag,
    /// The destroyed resource, if the entry retires a whole resource rather
    /// than an old generation or a backend-internal object.
    pub owner: Option<ResourceId>,
}

/// FIFO of pending releases.
#[derive(Debug, Default)]
pub struct ReleaseQueue {
    entries: Vec<ReleaseEntry>,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, payload: ReleasePayload, slot: SlotTag, owner: Option<ResourceId>) {
        debug!("Queued {} release ({:?})", payload.kind(), slot);
        self.entries.push(ReleaseEntry {
            payload,
            slot,
            owner,
        });
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns the entries that may be freed now, in enqueue
    /// order. Entries whose work has not retired stay queued.
    pub fn flush(
        &mut self,
        forced: bool,
        mut is_retired: impl FnMut(SlotTag) -> bool,
    ) -> Vec<ReleaseEntry> {
        if forced {
            return std::mem::take(&mut self.entries);
        }
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| is_retired(entry.slot));
        self.entries = pending;
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn sampler(raw: u64) -> ReleasePayload {
        ReleasePayload::Sampler {
            sampler: vk::Sampler::from_raw(raw),
        }
    }

    #[test]
    fn test_flush_keeps_unretired_entries() {
        let mut queue = ReleaseQueue::new();
        queue.enqueue(sampler(1), SlotTag::Slot(0), None);
        queue.enqueue(sampler(2), SlotTag::Slot(1), None);
        queue.enqueue(sampler(3), SlotTag::Untracked, None);

        let freed = queue.flush(false, |tag| tag != SlotTag::Slot(1));
        assert_eq!(freed.len(), 2);
        assert_eq!(freed[0].slot, SlotTag::Slot(0));
        assert_eq!(freed[1].slot, SlotTag::Untracked);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_flush_is_idempotent_without_progress() {
        let mut queue = ReleaseQueue::new();
        queue.enqueue(sampler(1), SlotTag::Slot(0), None);
        queue.enqueue(sampler(2), SlotTag::Any, None);
        for _ in 0..5 {
            assert!(queue.flush(false, |_| false).is_empty());
            assert_eq!(queue.len(), 2);
        }
    }

    #[test]
    fn test_forced_flush_drains() {
        let mut queue = ReleaseQueue::new();
        queue.enqueue(sampler(1), SlotTag::Slot(2), None);
        queue.enqueue(sampler(2), SlotTag::Any, None);
        assert_eq!(queue.flush(true, |_| false).len(), 2);
        assert!(queue.is_empty());
    }
}

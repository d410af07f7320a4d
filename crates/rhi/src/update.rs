//! Resource update batches and readbacks.
//!
//! A [`ResourceUpdateBatch`] collects uploads, copies, mip generation and
//! readbacks. Nothing happens until the batch is handed to
//! [`crate::Rhi::resource_update`] (or to `begin_pass`/`end_pass`), which
//! records the transfers into the current frame.
//!
//! Readbacks complete asynchronously: the returned [`Readback`] becomes ready
//! once the frame that recorded the copy has retired. Reads of host-visible
//! dynamic buffers complete immediately.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;

use crate::resource::{BufferId, TextureId};

/// One queued operation.
#[derive(Debug)]
pub(crate) enum UpdateOp {
    DynamicBufferWrite {
        buffer: BufferId,
        offset: u64,
        data: Vec<u8>,
    },
    StaticBufferUpload {
        buffer: BufferId,
        offset: u64,
        data: Vec<u8>,
    },
    TextureUpload {
        texture: TextureId,
        level: u32,
        data: Vec<u8>,
    },
    TextureCopy {
        src: TextureId,
        dst: TextureId,
        level: u32,
    },
    GenerateMips {
        texture: TextureId,
    },
    BufferReadback {
        buffer: BufferId,
        offset: u64,
        size: u64,
        readback: Readback,
    },
    TextureReadback {
        texture: TextureId,
        level: u32,
        readback: Readback,
    },
    SwapchainReadback {
        readback: Readback,
    },
}

/// An ordered list of resource updates.
#[derive(Debug, Default)]
pub struct ResourceUpdateBatch {
    pub(crate) ops: Vec<UpdateOp>,
}

impl ResourceUpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Writes into every frame-slot copy of a dynamic buffer. Each copy is
    /// updated when its slot next uses the buffer.
    pub fn update_dynamic_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) {
        self.ops.push(UpdateOp::DynamicBufferWrite {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    /// Uploads into a device-local buffer through a staging copy.
    pub fn upload_static_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) {
        self.ops.push(UpdateOp::StaticBufferUpload {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    /// Uploads one full mip level. `data` holds tightly packed rows.
    pub fn upload_texture(&mut self, texture: TextureId, level: u32, data: &[u8]) {
        self.ops.push(UpdateOp::TextureUpload {
            texture,
            level,
            data: data.to_vec(),
        });
    }

    /// Copies one mip level between two textures of the same size and format.
    pub fn copy_texture(&mut self, src: TextureId, dst: TextureId, level: u32) {
        self.ops.push(UpdateOp::TextureCopy { src, dst, level });
    }

    /// Fills levels 1.. of a texture by successive downscaling blits.
    pub fn generate_mips(&mut self, texture: TextureId) {
        self.ops.push(UpdateOp::GenerateMips { texture });
    }

    /// Reads `size` bytes of a buffer starting at `offset`.
    pub fn read_back_buffer(&mut self, buffer: BufferId, offset: u64, size: u64) -> Readback {
        let readback = Readback::new();
        self.ops.push(UpdateOp::BufferReadback {
            buffer,
            offset,
            size,
            readback: readback.clone(),
        });
        readback
    }

    /// Reads one mip level of a texture as tightly packed rows.
    pub fn read_back_texture(&mut self, texture: TextureId, level: u32) -> Readback {
        let readback = Readback::new();
        self.ops.push(UpdateOp::TextureReadback {
            texture,
            level,
            readback: readback.clone(),
        });
        readback
    }

    /// Reads the swapchain image the current frame renders to, as it is at
    /// this point of the frame. The swapchain must have been created with
    /// `readback` set.
    pub fn read_back_swapchain(&mut self) -> Readback {
        let readback = Readback::new();
        self.ops.push(UpdateOp::SwapchainReadback {
            readback: readback.clone(),
        });
        readback
    }

    /// Moves the operations of `other` to the end of this batch.
    pub fn merge(&mut self, mut other: ResourceUpdateBatch) {
        self.ops.append(&mut other.ops);
    }
}

/// Completed readback data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadbackResult {
    pub data: Vec<u8>,
    /// Pixel size for texture readbacks.
    pub extent: Option<vk::Extent2D>,
    pub format: Option<vk::Format>,
}

#[derive(Debug, Default)]
enum ReadbackState {
    #[default]
    Pending,
    Ready(ReadbackResult),
    Failed(String),
    Taken,
}

/// Handle to an in-progress readback. Clones share the result.
#[derive(Clone, Debug, Default)]
pub struct Readback {
    state: Arc<Mutex<ReadbackState>>,
}

impl Readback {
    fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ReadbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once the result (or a failure) is available.
    pub fn is_ready(&self) -> bool {
        !matches!(*self.lock(), ReadbackState::Pending)
    }

    /// The failure reason, if the readback could not be completed.
    pub fn error(&self) -> Option<String> {
        match &*self.lock() {
            ReadbackState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Takes the result. Returns `None` while pending, after a failure, or
    /// once taken.
    pub fn take(&self) -> Option<ReadbackResult> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, ReadbackState::Taken) {
            ReadbackState::Ready(result) => Some(result),
            other => {
                *state = other;
                None
            }
        }
    }

    pub(crate) fn complete(&self, result: ReadbackResult) {
        *self.lock() = ReadbackState::Ready(result);
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) {
        *self.lock() = ReadbackState::Failed(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn test_batch_keeps_order() {
        let mut buffers: SlotMap<BufferId, ()> = SlotMap::with_key();
        let buffer = buffers.insert(());
        let mut batch = ResourceUpdateBatch::new();
        batch.update_dynamic_buffer(buffer, 0, &[1, 2, 3]);
        let _ = batch.read_back_buffer(buffer, 0, 3);
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops[0], UpdateOp::DynamicBufferWrite { .. }));
        assert!(matches!(batch.ops[1], UpdateOp::BufferReadback { size: 3, .. }));
    }

    #[test]
    fn test_merge_appends() {
        let mut textures: SlotMap<TextureId, ()> = SlotMap::with_key();
        let texture = textures.insert(());
        let mut a = ResourceUpdateBatch::new();
        a.generate_mips(texture);
        let mut b = ResourceUpdateBatch::new();
        b.upload_texture(texture, 0, &[0; 4]);
        a.merge(b);
        assert_eq!(a.len(), 2);
        assert!(matches!(a.ops[1], UpdateOp::TextureUpload { level: 0, .. }));
    }

    #[test]
    fn test_readback_take_once() {
        let readback = Readback::new();
        let shared = readback.clone();
        assert!(!readback.is_ready());
        assert!(readback.take().is_none());

        shared.complete(ReadbackResult {
            data: vec![7; 4],
            extent: None,
            format: None,
        });
        assert!(readback.is_ready());
        assert_eq!(readback.take().map(|r| r.data), Some(vec![7; 4]));
        assert!(readback.take().is_none());
    }

    #[test]
    fn test_readback_failure() {
        let readback = Readback::new();
        readback.fail("device lost");
        assert!(readback.is_ready());
        assert_eq!(readback.error().as_deref(), Some("device lost"));
        assert!(readback.take().is_none());
    }
}

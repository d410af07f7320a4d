//! Recording of resource update batches.

use ash::vk;
use tracing::{debug, warn};

use super::{FrameKind, PendingReadback, Rhi};
use crate::command::ImageRange;
use crate::error::{RhiError, RhiResult};
use crate::native::{MemoryPlacement, NativeBufferDesc, NativeDevice};
use crate::release::ReleasePayload;
use crate::resource::{
    aspect_mask, is_depth_format, texel_size, BufferId, BufferKind, HostWrite, TextureId,
};
use crate::store::mapped_slice;
use crate::tracker::{tracked_buffer_barrier, tracked_image_barrier, TextureUsageState};
use crate::update::{Readback, ReadbackResult, ResourceUpdateBatch, UpdateOp};

/// A buffer opened by `begin_dynamic_update`.
#[derive(Debug)]
pub(super) struct OpenUpdate {
    pub(super) buffer: BufferId,
    /// Staging bytes for device-local buffers.
    pub(super) staged: Option<Vec<u8>>,
}

fn level_extent(extent: vk::Extent2D, level: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: (extent.width >> level).max(1),
        height: (extent.height >> level).max(1),
    }
}

fn subresource(aspect: vk::ImageAspectFlags, level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: aspect,
        mip_level: level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn far_corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

fn transfer_state(layout: vk::ImageLayout, access: vk::AccessFlags) -> TextureUsageState {
    TextureUsageState::new(layout, access, vk::PipelineStageFlags::TRANSFER)
}

impl<D: NativeDevice> Rhi<D> {
    /// Records a batch of uploads, copies and readbacks into the current
    /// frame, in batch order.
    ///
    /// Dynamic buffer writes may be queued outside a frame; everything else
    /// records commands and needs one. Not allowed inside a pass: hand the
    /// batch to `begin_pass`/`end_pass` instead.
    ///
    /// # Errors
    ///
    /// Stops at the first failing operation. Readbacks later in the batch
    /// are failed rather than left pending.
    pub fn resource_update(&mut self, batch: ResourceUpdateBatch) -> RhiResult<()> {
        if self.pass.is_some() {
            return Err(RhiError::InvalidState(
                "resource updates cannot be recorded inside a pass".to_string(),
            ));
        }
        self.apply_updates(batch)
    }

    pub(super) fn apply_updates(&mut self, batch: ResourceUpdateBatch) -> RhiResult<()> {
        let mut ops = batch.ops.into_iter();
        while let Some(op) = ops.next() {
            if let Err(e) = self.apply_update(op) {
                for rest in ops {
                    if let UpdateOp::BufferReadback { readback, .. }
                    | UpdateOp::TextureReadback { readback, .. }
                    | UpdateOp::SwapchainReadback { readback } = rest
                    {
                        readback.fail(format!("batch aborted: {e}"));
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn apply_update(&mut self, op: UpdateOp) -> RhiResult<()> {
        match op {
            UpdateOp::DynamicBufferWrite {
                buffer,
                offset,
                data,
            } => self.queue_dynamic_write(buffer, offset, data),
            UpdateOp::StaticBufferUpload {
                buffer,
                offset,
                data,
            } => self.record_static_upload(buffer, offset, &data),
            UpdateOp::TextureUpload {
                texture,
                level,
                data,
            } => self.record_texture_upload(texture, level, &data),
            UpdateOp::TextureCopy { src, dst, level } => self.record_texture_copy(src, dst, level),
            UpdateOp::GenerateMips { texture } => self.record_mip_chain(texture),
            UpdateOp::BufferReadback {
                buffer,
                offset,
                size,
                readback,
            } => {
                let result = self.record_buffer_readback(buffer, offset, size, &readback);
                if let Err(e) = &result {
                    readback.fail(e.to_string());
                }
                result
            }
            UpdateOp::TextureReadback {
                texture,
                level,
                readback,
            } => {
                let result = self.record_texture_readback(texture, level, &readback);
                if let Err(e) = &result {
                    readback.fail(e.to_string());
                }
                result
            }
            UpdateOp::SwapchainReadback { readback } => {
                let result = self.record_swapchain_readback(&readback);
                if let Err(e) = &result {
                    readback.fail(e.to_string());
                }
                result
            }
        }
    }

    pub(super) fn require_frame(&self, what: &str) -> RhiResult<()> {
        if self.frame.is_none() {
            return Err(RhiError::InvalidState(format!("{what} needs a frame")));
        }
        Ok(())
    }

    fn check_buffer_range(&self, buffer: BufferId, offset: u64, len: u64) -> RhiResult<BufferKind> {
        let record = self.store.usable(buffer)?;
        if offset.checked_add(len).is_none_or(|end| end > record.desc.size) {
            return Err(RhiError::InvalidState(format!(
                "range {}+{} is outside buffer '{}' ({} bytes)",
                offset, len, record.meta.name, record.desc.size
            )));
        }
        Ok(record.desc.kind)
    }

    /// Queues a write for every slot's copy of a dynamic buffer.
    fn queue_dynamic_write(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: Vec<u8>,
    ) -> RhiResult<()> {
        let kind = self.check_buffer_range(buffer, offset, data.len() as u64)?;
        let record = self.store.usable_mut(buffer)?;
        if kind != BufferKind::Dynamic {
            return Err(RhiError::InvalidState(format!(
                "buffer '{}' is not dynamic",
                record.meta.name
            )));
        }
        let Some((last, rest)) = record.pending.split_last_mut() else {
            return Ok(());
        };
        for pending in rest {
            pending.push(HostWrite {
                offset,
                data: data.clone(),
            });
        }
        last.push(HostWrite { offset, data });
        Ok(())
    }

    fn create_staging(&self, size: u64, placement: MemoryPlacement) -> RhiResult<vk::Buffer> {
        self.device.create_buffer(&NativeBufferDesc {
            name: "staging",
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            placement,
        })
    }

    /// Creates a host-visible buffer holding `data`.
    fn staged_copy_of(&self, data: &[u8]) -> RhiResult<vk::Buffer> {
        let staging = self.create_staging(data.len() as u64, MemoryPlacement::HostVisible)?;
        match self.device.mapped_range(staging) {
            Some(mapped) if mapped.len >= data.len() => {
                // SAFETY: the buffer was just created and no submission uses
                // it yet.
                unsafe { mapped_slice(mapped.ptr, data.len()) }.copy_from_slice(data);
                Ok(staging)
            }
            _ => {
                self.device.destroy_buffer(staging);
                Err(RhiError::InvalidState(
                    "staging buffer is not host-visible".to_string(),
                ))
            }
        }
    }

    pub(super) fn record_static_upload(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> RhiResult<()> {
        let kind = self.check_buffer_range(buffer, offset, data.len() as u64)?;
        if kind == BufferKind::Dynamic {
            return self.queue_dynamic_write(buffer, offset, data.to_vec());
        }
        self.require_frame("upload_static_buffer")?;
        if data.is_empty() {
            return Ok(());
        }

        let staging = self.staged_copy_of(data)?;
        let tag = self.pacer.current_tag();
        let record = self.store.usable_mut(buffer)?;
        let dst = record.natives[0];
        if let Some(barrier) = tracked_buffer_barrier(
            dst,
            &mut record.usage[0],
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ) {
            self.list.pipeline_barrier(&[barrier], &[]);
        }
        self.list.copy_buffer(
            staging,
            dst,
            vk::BufferCopy {
                src_offset: 0,
                dst_offset: offset,
                size: data.len() as u64,
            },
        );
        self.store.touch(buffer.into(), tag);
        self.releases
            .enqueue(ReleasePayload::StagingBuffer { buffer: staging }, tag, None);
        Ok(())
    }

    fn record_texture_upload(
        &mut self,
        texture: TextureId,
        level: u32,
        data: &[u8],
    ) -> RhiResult<()> {
        self.require_frame("upload_texture")?;
        let record = self.store.usable(texture)?;
        let desc = record.desc;
        if level >= desc.mip_levels {
            return Err(RhiError::InvalidState(format!(
                "texture '{}' has no level {}",
                record.meta.name, level
            )));
        }
        let texel = texel_size(desc.format).ok_or_else(|| {
            RhiError::InvalidState(format!("cannot upload format {:?}", desc.format))
        })?;
        let extent = level_extent(desc.extent, level);
        let expected = extent.width as usize * extent.height as usize * texel as usize;
        if data.len() != expected {
            return Err(RhiError::InvalidState(format!(
                "upload to '{}' level {} needs {} bytes, got {}",
                record.meta.name,
                level,
                expected,
                data.len()
            )));
        }

        let staging = self.staged_copy_of(data)?;
        let tag = self.pacer.current_tag();
        let aspect = aspect_mask(desc.format);
        let record = self.store.usable_mut(texture)?;
        let image = record.image;
        if let Some(barrier) = tracked_image_barrier(
            image,
            ImageRange::new(aspect, 0, desc.mip_levels),
            &mut record.usage,
            transfer_state(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        ) {
            self.list.pipeline_barrier(&[], &[barrier]);
        }
        self.list.copy_buffer_to_image(
            staging,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: subresource(aspect, level),
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            }],
        );
        self.store.touch(texture.into(), tag);
        self.releases
            .enqueue(ReleasePayload::StagingBuffer { buffer: staging }, tag, None);
        Ok(())
    }

    fn record_texture_copy(&mut self, src: TextureId, dst: TextureId, level: u32) -> RhiResult<()> {
        self.require_frame("copy_texture")?;
        if src == dst {
            return Err(RhiError::InvalidState(
                "copy_texture needs two distinct textures".to_string(),
            ));
        }
        let src_desc = self.store.usable(src)?.desc;
        let dst_desc = self.store.usable(dst)?.desc;
        if src_desc.extent != dst_desc.extent || src_desc.format != dst_desc.format {
            return Err(RhiError::InvalidState(
                "copy_texture needs textures of the same size and format".to_string(),
            ));
        }
        if level >= src_desc.mip_levels || level >= dst_desc.mip_levels {
            return Err(RhiError::InvalidState(format!(
                "copy_texture level {level} is out of range"
            )));
        }

        let tag = self.pacer.current_tag();
        let aspect = aspect_mask(src_desc.format);
        let mut barriers = Vec::with_capacity(2);

        let record = self.store.usable_mut(src)?;
        let src_image = record.image;
        barriers.extend(tracked_image_barrier(
            src_image,
            ImageRange::new(aspect, 0, src_desc.mip_levels),
            &mut record.usage,
            transfer_state(
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::TRANSFER_READ,
            ),
        ));
        let record = self.store.usable_mut(dst)?;
        let dst_image = record.image;
        barriers.extend(tracked_image_barrier(
            dst_image,
            ImageRange::new(aspect, 0, dst_desc.mip_levels),
            &mut record.usage,
            transfer_state(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        ));
        self.list.pipeline_barrier(&[], &barriers);

        let extent = level_extent(src_desc.extent, level);
        self.list.copy_image(
            src_image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageCopy {
                src_subresource: subresource(aspect, level),
                src_offset: vk::Offset3D::default(),
                dst_subresource: subresource(aspect, level),
                dst_offset: vk::Offset3D::default(),
                extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            },
        );
        self.store.touch(src.into(), tag);
        self.store.touch(dst.into(), tag);
        Ok(())
    }

    /// Blits each level from the one above it. The image stays in `GENERAL`
    /// for the whole chain.
    fn record_mip_chain(&mut self, texture: TextureId) -> RhiResult<()> {
        self.require_frame("generate_mips")?;
        let tag = self.pacer.current_tag();
        let record = self.store.usable_mut(texture)?;
        let desc = record.desc;
        if desc.mip_levels <= 1 {
            debug!("Texture '{}' has a single level, no mips to generate", record.meta.name);
            return Ok(());
        }
        let image = record.image;
        let aspect = aspect_mask(desc.format);
        if let Some(barrier) = tracked_image_barrier(
            image,
            ImageRange::new(aspect, 0, desc.mip_levels),
            &mut record.usage,
            transfer_state(
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
            ),
        ) {
            self.list.pipeline_barrier(&[], &[barrier]);
        }

        for level in 1..desc.mip_levels {
            if level > 1 {
                // The previous blit wrote the level this one reads.
                self.list.pipeline_barrier(
                    &[],
                    &[crate::command::ImageBarrier {
                        image,
                        range: ImageRange::new(aspect, level - 1, 1),
                        old_layout: vk::ImageLayout::GENERAL,
                        new_layout: vk::ImageLayout::GENERAL,
                        src_access: vk::AccessFlags::TRANSFER_WRITE,
                        dst_access: vk::AccessFlags::TRANSFER_READ,
                        src_stage: vk::PipelineStageFlags::TRANSFER,
                        dst_stage: vk::PipelineStageFlags::TRANSFER,
                    }],
                );
            }
            self.list.blit_image(
                image,
                vk::ImageLayout::GENERAL,
                image,
                vk::ImageLayout::GENERAL,
                vk::ImageBlit {
                    src_subresource: subresource(aspect, level - 1),
                    src_offsets: [
                        vk::Offset3D::default(),
                        far_corner(level_extent(desc.extent, level - 1)),
                    ],
                    dst_subresource: subresource(aspect, level),
                    dst_offsets: [
                        vk::Offset3D::default(),
                        far_corner(level_extent(desc.extent, level)),
                    ],
                },
                vk::Filter::LINEAR,
            );
        }
        self.store.touch(texture.into(), tag);
        Ok(())
    }

    fn record_buffer_readback(
        &mut self,
        buffer: BufferId,
        offset: u64,
        size: u64,
        readback: &Readback,
    ) -> RhiResult<()> {
        let kind = self.check_buffer_range(buffer, offset, size)?;
        let (start, end) = (offset as usize, (offset + size) as usize);

        if kind == BufferKind::Dynamic {
            let slot = self.pacer.current_slot();
            self.store.apply_pending_writes(&self.device, buffer, slot)?;
            let record = self.store.usable(buffer)?;
            let native = record.natives[record.native_index(slot)];
            let mapped = self
                .device
                .mapped_range(native)
                .filter(|m| m.len >= end)
                .ok_or_else(|| {
                    RhiError::InvalidState(format!("buffer '{}' is not mapped", record.meta.name))
                })?;
            // SAFETY: the GPU only reads dynamic buffers, and the range was
            // checked against the mapping.
            let bytes = unsafe { mapped_slice(mapped.ptr, end) };
            readback.complete(ReadbackResult {
                data: bytes[start..end].to_vec(),
                extent: None,
                format: None,
            });
            return Ok(());
        }

        self.require_frame("read_back_buffer")?;
        let staging = self.create_staging(size.max(1), MemoryPlacement::HostReadback)?;
        let tag = self.pacer.current_tag();
        let record = self.store.usable_mut(buffer)?;
        let src = record.natives[0];
        if let Some(barrier) = tracked_buffer_barrier(
            src,
            &mut record.usage[0],
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ) {
            self.list.pipeline_barrier(&[barrier], &[]);
        }
        if size > 0 {
            self.list.copy_buffer(
                src,
                staging,
                vk::BufferCopy {
                    src_offset: offset,
                    dst_offset: 0,
                    size,
                },
            );
        }
        self.store.touch(buffer.into(), tag);
        self.readbacks.push(PendingReadback {
            staging,
            tag,
            submitted: false,
            len: size as usize,
            extent: None,
            format: None,
            readback: readback.clone(),
        });
        Ok(())
    }

    fn record_texture_readback(
        &mut self,
        texture: TextureId,
        level: u32,
        readback: &Readback,
    ) -> RhiResult<()> {
        self.require_frame("read_back_texture")?;
        let record = self.store.usable(texture)?;
        let desc = record.desc;
        if is_depth_format(desc.format) {
            return Err(RhiError::InvalidState(format!(
                "cannot read back depth texture '{}'",
                record.meta.name
            )));
        }
        if level >= desc.mip_levels {
            return Err(RhiError::InvalidState(format!(
                "texture '{}' has no level {}",
                record.meta.name, level
            )));
        }
        let Some(texel) = texel_size(desc.format) else {
            warn!("Readback of unsupported format {:?}", desc.format);
            return Err(RhiError::InvalidState(format!(
                "cannot read back format {:?}",
                desc.format
            )));
        };
        let extent = level_extent(desc.extent, level);
        let len = extent.width as usize * extent.height as usize * texel as usize;

        let staging = self.create_staging(len as u64, MemoryPlacement::HostReadback)?;
        let tag = self.pacer.current_tag();
        let aspect = aspect_mask(desc.format);
        let record = self.store.usable_mut(texture)?;
        let image = record.image;
        if let Some(barrier) = tracked_image_barrier(
            image,
            ImageRange::new(aspect, 0, desc.mip_levels),
            &mut record.usage,
            transfer_state(
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::TRANSFER_READ,
            ),
        ) {
            self.list.pipeline_barrier(&[], &[barrier]);
        }
        self.list.copy_image_to_buffer(
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            staging,
            &[vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: subresource(aspect, level),
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            }],
        );
        self.store.touch(texture.into(), tag);
        self.readbacks.push(PendingReadback {
            staging,
            tag,
            submitted: false,
            len,
            extent: Some(extent),
            format: Some(desc.format),
            readback: readback.clone(),
        });
        Ok(())
    }

    fn record_swapchain_readback(&mut self, readback: &Readback) -> RhiResult<()> {
        self.require_frame("read_back_swapchain")?;
        let Some(FrameKind::Swapchain {
            id, image_index, ..
        }) = self.frame.as_ref().map(|f| f.kind)
        else {
            return Err(RhiError::InvalidState(
                "swapchain readbacks need a swapchain frame, not an offscreen one".to_string(),
            ));
        };
        let record = self.store.usable(id)?;
        if !record.desc.readback {
            return Err(RhiError::InvalidState(format!(
                "swapchain '{}' was not created for readback",
                record.meta.name
            )));
        }
        let native = record.native.as_ref().ok_or_else(|| {
            RhiError::InvalidState(format!("swapchain '{}' has no images", record.meta.name))
        })?;
        let Some(&image) = native.images.get(image_index as usize) else {
            return Err(RhiError::InvalidState(format!(
                "swapchain '{}' has no image {}",
                record.meta.name, image_index
            )));
        };
        let (format, extent) = (native.format, native.extent);
        let Some(texel) = texel_size(format) else {
            return Err(RhiError::InvalidState(format!(
                "cannot read back format {format:?}"
            )));
        };
        let len = extent.width as usize * extent.height as usize * texel as usize;

        let staging = self.create_staging(len as u64, MemoryPlacement::HostReadback)?;
        let tag = self.pacer.current_tag();
        if let Some(FrameKind::Swapchain { image_state, .. }) =
            self.frame.as_mut().map(|f| &mut f.kind)
            && let Some(barrier) = tracked_image_barrier(
                image,
                ImageRange::color(1),
                image_state,
                transfer_state(
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::TRANSFER_READ,
                ),
            )
        {
            self.list.pipeline_barrier(&[], &[barrier]);
        }
        self.list.copy_image_to_buffer(
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            staging,
            &[vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: subresource(vk::ImageAspectFlags::COLOR, 0),
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            }],
        );
        self.store.touch(id.into(), tag);
        debug!(
            "Reading back swapchain image {} ({}x{})",
            image_index, extent.width, extent.height
        );
        self.readbacks.push(PendingReadback {
            staging,
            tag,
            submitted: false,
            len,
            extent: Some(extent),
            format: Some(format),
            readback: readback.clone(),
        });
        Ok(())
    }
}

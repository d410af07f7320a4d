//! Binding set descriptions.
//!
//! A binding set is the group of buffers, textures and samplers a draw or
//! dispatch consumes, realized as one `VkDescriptorSet` per frame slot. The
//! layout is derived from the description itself; the shader reflection stage
//! that produced the binding numbers lives outside this crate.

use ash::vk;

use crate::resource::{BufferId, ResourceId, SamplerId, TextureId};

/// Read/write mode of a storage binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageAccess {
    Load,
    Store,
    LoadStore,
}

impl StorageAccess {
    #[inline]
    pub fn writes(self) -> bool {
        !matches!(self, StorageAccess::Load)
    }
}

/// The resource behind one binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingResource {
    /// A uniform buffer range. With `dynamic_offset` the offset is supplied
    /// at bind time and added to `offset`.
    UniformBuffer {
        buffer: BufferId,
        offset: u64,
        size: u64,
        dynamic_offset: bool,
    },
    SampledTexture {
        texture: TextureId,
        sampler: SamplerId,
    },
    StorageBuffer {
        buffer: BufferId,
        offset: u64,
        size: u64,
        access: StorageAccess,
    },
    StorageImage {
        texture: TextureId,
        level: u32,
        access: StorageAccess,
    },
}

impl BindingResource {
    /// Vulkan descriptor type of the binding.
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            BindingResource::UniformBuffer {
                dynamic_offset: true,
                ..
            } => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            BindingResource::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
            BindingResource::SampledTexture { .. } => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            BindingResource::StorageBuffer { .. } => vk::DescriptorType::STORAGE_BUFFER,
            BindingResource::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    /// Resources referenced by the binding.
    pub fn referenced(&self) -> impl Iterator<Item = ResourceId> {
        let (first, second): (ResourceId, Option<ResourceId>) = match *self {
            BindingResource::UniformBuffer { buffer, .. }
            | BindingResource::StorageBuffer { buffer, .. } => (buffer.into(), None),
            BindingResource::SampledTexture { texture, sampler } => {
                (texture.into(), Some(sampler.into()))
            }
            BindingResource::StorageImage { texture, .. } => (texture.into(), None),
        };
        std::iter::once(first).chain(second)
    }
}

/// One binding of a set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingDesc {
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
    pub resource: BindingResource,
}

/// Layout entry handed to the native device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

/// Binding set description.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindingSetDesc {
    pub bindings: Vec<BindingDesc>,
}

impl BindingSetDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uniform_buffer(
        mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        buffer: BufferId,
        size: u64,
    ) -> Self {
        self.bindings.push(BindingDesc {
            binding,
            stages,
            resource: BindingResource::UniformBuffer {
                buffer,
                offset: 0,
                size,
                dynamic_offset: false,
            },
        });
        self
    }

    /// A uniform buffer whose offset is given to `set_binding_set`.
    pub fn dynamic_uniform_buffer(
        mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        buffer: BufferId,
        size: u64,
    ) -> Self {
        self.bindings.push(BindingDesc {
            binding,
            stages,
            resource: BindingResource::UniformBuffer {
                buffer,
                offset: 0,
                size,
                dynamic_offset: true,
            },
        });
        self
    }

    pub fn sampled_texture(
        mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        texture: TextureId,
        sampler: SamplerId,
    ) -> Self {
        self.bindings.push(BindingDesc {
            binding,
            stages,
            resource: BindingResource::SampledTexture { texture, sampler },
        });
        self
    }

    pub fn storage_buffer(
        mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        buffer: BufferId,
        size: u64,
        access: StorageAccess,
    ) -> Self {
        self.bindings.push(BindingDesc {
            binding,
            stages,
            resource: BindingResource::StorageBuffer {
                buffer,
                offset: 0,
                size,
                access,
            },
        });
        self
    }

    pub fn storage_image(
        mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        texture: TextureId,
        level: u32,
        access: StorageAccess,
    ) -> Self {
        self.bindings.push(BindingDesc {
            binding,
            stages,
            resource: BindingResource::StorageImage {
                texture,
                level,
                access,
            },
        });
        self
    }

    /// Layout entries, sorted by binding number.
    pub fn layout_bindings(&self) -> Vec<LayoutBinding> {
        let mut out: Vec<LayoutBinding> = self
            .bindings
            .iter()
            .map(|b| LayoutBinding {
                binding: b.binding,
                descriptor_type: b.resource.descriptor_type(),
                stages: b.stages,
            })
            .collect();
        out.sort_by_key(|b| b.binding);
        out
    }

    /// Binding numbers that take a dynamic offset, ascending. Dynamic offsets
    /// are consumed in this order.
    pub fn dynamic_bindings(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self
            .bindings
            .iter()
            .filter(|b| {
                b.resource.descriptor_type() == vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            })
            .map(|b| b.binding)
            .collect();
        out.sort_unstable();
        out
    }

    /// Every resource the set references, in binding order.
    pub fn referenced(&self) -> Vec<ResourceId> {
        self.bindings
            .iter()
            .flat_map(|b| b.resource.referenced())
            .collect()
    }

    /// Checks for duplicate binding numbers.
    pub fn has_duplicates(&self) -> bool {
        let mut seen: Vec<u32> = self.bindings.iter().map(|b| b.binding).collect();
        seen.sort_unstable();
        seen.windows(2).any(|w| w[0] == w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use slotmap::SlotMap;

    #[test]
    fn test_descriptor_types() {
        let mut buffers: SlotMap<BufferId, ()> = SlotMap::with_key();
        let buffer = buffers.insert(());
        let desc = BindingSetDesc::new()
            .dynamic_uniform_buffer(1, vk::ShaderStageFlags::VERTEX, buffer, 64)
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX, buffer, 64)
            .storage_buffer(
                2,
                vk::ShaderStageFlags::COMPUTE,
                buffer,
                256,
                StorageAccess::LoadStore,
            );

        let layout = desc.layout_bindings();
        assert_eq!(layout[0].binding, 0);
        assert_eq!(layout[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(
            layout[1].descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
        assert_eq!(layout[2].descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(desc.dynamic_bindings(), vec![1]);
    }

    #[test]
    fn test_referenced_includes_sampler() {
        let mut textures: SlotMap<TextureId, ()> = SlotMap::with_key();
        let mut samplers: SlotMap<SamplerId, ()> = SlotMap::with_key();
        let texture = textures.insert(());
        let sampler = samplers.insert(());
        let desc = BindingSetDesc::new().sampled_texture(
            0,
            vk::ShaderStageFlags::FRAGMENT,
            texture,
            sampler,
        );
        assert_eq!(
            desc.referenced(),
            vec![ResourceId::Texture(texture), ResourceId::Sampler(sampler)]
        );
    }

    #[test]
    fn test_duplicates() {
        let mut buffers: SlotMap<BufferId, ()> = SlotMap::with_key();
        let buffer = buffers.insert(());
        let desc = BindingSetDesc::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX, buffer, 16)
            .uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT, buffer, 16);
        assert!(desc.has_duplicates());
    }

    #[test]
    fn test_storage_access_writes() {
        assert!(!StorageAccess::Load.writes());
        assert!(StorageAccess::Store.writes());
        assert!(StorageAccess::LoadStore.writes());
    }
}

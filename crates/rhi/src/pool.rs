//! Binding-set pool allocator.
//!
//! Binding sets are carved out of coarse descriptor pools with fixed
//! per-category capacities. Pools never grow; when every pool is full a new
//! one is created. A pool whose reference count drops to zero is reset and
//! reused by the next allocation that reaches it.
//!
//! Allocation and release are not thread-safe and are only called from the
//! submitting thread.

use ash::vk;
use tracing::{debug, info};

use crate::error::{RhiError, RhiResult};
use crate::native::NativeDevice;
use vkframe_core::PoolConfig;

/// One descriptor pool and its bookkeeping.
#[derive(Debug)]
pub struct BindingPool {
    pub handle: vk::DescriptorPool,
    /// Live binding sets drawing from this pool.
    pub ref_count: u32,
    /// Sets handed out since the last reset.
    pub allocated_sets: u32,
}

/// Allocator over a growing list of [`BindingPool`]s.
#[derive(Debug)]
pub struct BindingPoolAllocator {
    pools: Vec<BindingPool>,
    config: PoolConfig,
}

impl BindingPoolAllocator {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pools: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn pools(&self) -> &[BindingPool] {
        &self.pools
    }

    #[inline]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Allocates one set per layout from a single pool and returns the sets
    /// with the index of the pool they came from.
    ///
    /// Pools are scanned newest first. Unreferenced pools are reset before
    /// being tried. A full pool is skipped; if none has room a new pool is
    /// created.
    pub fn allocate<D: NativeDevice + ?Sized>(
        &mut self,
        device: &D,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<(Vec<vk::DescriptorSet>, usize)> {
        let count = layouts.len() as u32;
        if count == 0 || count > self.config.max_sets {
            return Err(RhiError::InvalidState(format!(
                "cannot allocate {} binding sets from pools of {}",
                count, self.config.max_sets
            )));
        }

        for index in (0..self.pools.len()).rev() {
            let pool = &mut self.pools[index];
            if pool.ref_count == 0 && pool.allocated_sets > 0 {
                device.reset_descriptor_pool(pool.handle)?;
                pool.allocated_sets = 0;
                debug!("Recycled binding-set pool {}", index);
            }
            if pool.allocated_sets + count > self.config.max_sets {
                continue;
            }
            match device.allocate_descriptor_sets(pool.handle, layouts) {
                Ok(sets) => return Ok((sets, self.claim(index, count))),
                Err(RhiError::PoolExhausted) => continue,
                Err(e) => return Err(e),
            }
        }

        let handle = device
            .create_descriptor_pool(&self.config)
            .map_err(|e| RhiError::ResourceCreationFailed(format!("binding-set pool: {e}")))?;
        self.pools.push(BindingPool {
            handle,
            ref_count: 0,
            allocated_sets: 0,
        });
        let index = self.pools.len() - 1;
        info!(
            "Created binding-set pool {} ({} sets per pool)",
            index, self.config.max_sets
        );

        let sets = device
            .allocate_descriptor_sets(handle, layouts)
            .map_err(|e| RhiError::ResourceCreationFailed(format!("binding sets: {e}")))?;
        Ok((sets, self.claim(index, count)))
    }

    fn claim(&mut self, index: usize, count: u32) -> usize {
        let pool = &mut self.pools[index];
        pool.ref_count += 1;
        pool.allocated_sets += count;
        index
    }

    /// Drops one reference on a pool. At zero the pool becomes recyclable;
    /// callers only release once the sets' last use has retired.
    pub fn release(&mut self, index: usize) {
        match self.pools.get_mut(index) {
            Some(pool) if pool.ref_count > 0 => {
                pool.ref_count -= 1;
                if pool.ref_count == 0 {
                    debug!("Binding-set pool {} is unreferenced", index);
                }
            }
            _ => debug_assert!(false, "release of unreferenced binding-set pool {index}"),
        }
    }

    /// Allocated set count per pool.
    pub fn sets_per_pool(&self) -> Vec<u32> {
        self.pools.iter().map(|p| p.allocated_sets).collect()
    }

    /// Resets every unreferenced pool and destroys unreferenced pools at the
    /// end of the list. Pools in the middle stay, since binding sets hold
    /// pool indices. Returns the number of pools destroyed.
    pub fn trim<D: NativeDevice + ?Sized>(&mut self, device: &D) -> RhiResult<usize> {
        for pool in self.pools.iter_mut().filter(|p| p.ref_count == 0) {
            if pool.allocated_sets > 0 {
                device.reset_descriptor_pool(pool.handle)?;
                pool.allocated_sets = 0;
            }
        }
        let mut destroyed = 0;
        while self.pools.last().is_some_and(|p| p.ref_count == 0) {
            if let Some(pool) = self.pools.pop() {
                device.destroy_descriptor_pool(pool.handle);
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            info!("Destroyed {} idle binding-set pools", destroyed);
        }
        Ok(destroyed)
    }

    /// Destroys every pool. Only valid after a device-idle wait.
    pub fn destroy_all<D: NativeDevice + ?Sized>(&mut self, device: &D) {
        for pool in self.pools.drain(..) {
            device.destroy_descriptor_pool(pool.handle);
        }
    }
}

/// Pool sizes for a pool configuration.
pub fn pool_sizes(config: &PoolConfig) -> Vec<vk::DescriptorPoolSize> {
    [
        (vk::DescriptorType::UNIFORM_BUFFER, config.uniform_buffers),
        (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, config.uniform_buffers),
        (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, config.sampled_images),
        (vk::DescriptorType::STORAGE_BUFFER, config.storage_buffers),
        (vk::DescriptorType::STORAGE_IMAGE, config.storage_images),
    ]
    .into_iter()
    .filter(|&(_, count)| count > 0)
    .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
        ty,
        descriptor_count,
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::LayoutBinding;
    use crate::native::NullDevice;

    fn layout(device: &NullDevice) -> vk::DescriptorSetLayout {
        device
            .create_binding_layout(&[LayoutBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                stages: vk::ShaderStageFlags::VERTEX,
            }])
            .unwrap()
    }

    fn small_pools(max_sets: u32) -> PoolConfig {
        PoolConfig {
            max_sets,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_pool_sizes_skip_zero_categories() {
        let config = PoolConfig {
            storage_images: 0,
            ..PoolConfig::default()
        };
        let sizes = pool_sizes(&config);
        assert_eq!(sizes.len(), 4);
        assert!(sizes.iter().all(|s| s.ty != vk::DescriptorType::STORAGE_IMAGE));
    }

    #[test]
    fn test_new_pool_only_when_all_full() {
        let device = NullDevice::new();
        let layout = layout(&device);
        let mut allocator = BindingPoolAllocator::new(small_pools(4));

        for i in 0..4 {
            let (_, pool) = allocator.allocate(&device, &[layout]).unwrap();
            assert_eq!(pool, 0, "allocation {i} should fit the first pool");
        }
        assert_eq!(allocator.pool_count(), 1);

        let (_, pool) = allocator.allocate(&device, &[layout]).unwrap();
        assert_eq!(pool, 1);
        assert_eq!(allocator.pool_count(), 2);
        assert_eq!(allocator.sets_per_pool(), vec![4, 1]);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let device = NullDevice::new();
        let layout = layout(&device);
        let mut allocator = BindingPoolAllocator::new(small_pools(8));
        let mut live = Vec::new();

        // Interleave allocations of 1..=3 sets with releases.
        for step in 0..200u32 {
            let count = (step % 3 + 1) as usize;
            let (_, pool) = allocator.allocate(&device, &vec![layout; count]).unwrap();
            live.push(pool);
            if step % 4 == 3 {
                let pool = live.remove((step as usize * 7) % live.len());
                allocator.release(pool);
            }
            for pool in allocator.pools() {
                assert!(pool.allocated_sets <= 8);
            }
        }
    }

    #[test]
    fn test_unreferenced_pool_is_recycled() {
        let device = NullDevice::new();
        let layout = layout(&device);
        let mut allocator = BindingPoolAllocator::new(small_pools(2));

        let (_, a) = allocator.allocate(&device, &[layout]).unwrap();
        let (_, b) = allocator.allocate(&device, &[layout]).unwrap();
        assert_eq!((a, b), (0, 0));
        allocator.release(a);
        allocator.release(b);

        let (_, c) = allocator.allocate(&device, &[layout]).unwrap();
        assert_eq!(c, 0);
        assert_eq!(allocator.pool_count(), 1);
        assert_eq!(allocator.pools()[0].allocated_sets, 1);
    }

    #[test]
    fn test_three_hundred_allocations() {
        let device = NullDevice::new();
        let layout = layout(&device);
        let mut allocator = BindingPoolAllocator::new(small_pools(128));
        let mut handles = std::collections::HashSet::new();

        for _ in 0..300 {
            let (sets, _) = allocator.allocate(&device, &[layout]).unwrap();
            assert!(handles.insert(sets[0]));
        }
        assert!(allocator.pool_count() >= 3);
        assert_eq!(handles.len(), 300);
    }

    #[test]
    fn test_trim_drops_trailing_idle_pools() {
        let device = NullDevice::new();
        let layout = layout(&device);
        let mut allocator = BindingPoolAllocator::new(small_pools(1));
        let (_, a) = allocator.allocate(&device, &[layout]).unwrap();
        let (_, b) = allocator.allocate(&device, &[layout]).unwrap();
        let (_, c) = allocator.allocate(&device, &[layout]).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        allocator.release(a);
        allocator.release(c);
        assert_eq!(allocator.trim(&device).unwrap(), 1);
        assert_eq!(allocator.pool_count(), 2);
        assert_eq!(allocator.sets_per_pool(), vec![0, 1]);
        assert_eq!(device.descriptor_pool_count(), 2);

        allocator.release(b);
        assert_eq!(allocator.trim(&device).unwrap(), 2);
        assert_eq!(device.descriptor_pool_count(), 0);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let device = NullDevice::new();
        let layout = layout(&device);
        let mut allocator = BindingPoolAllocator::new(small_pools(2));
        assert!(allocator.allocate(&device, &[layout; 3]).is_err());
        assert_eq!(allocator.pool_count(), 0);
    }
}

//! Material pipeline cache.
//!
//! Graphics pipelines built from the same vertex/fragment SPIR-V pair (plus a
//! caller-chosen discriminator for fixed-function state) are shared. The cache
//! belongs to one [`crate::Rhi`] and is emptied when it is dropped.

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHasher};

use crate::pipeline::{GraphicsPipelineDesc, ShaderStage};
use crate::resource::GraphicsPipelineId;

/// Hash of a shader pair and discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MaterialKey(u64);

impl MaterialKey {
    pub fn new(vertex: &[u32], fragment: &[u32], discriminator: u64) -> Self {
        let mut hasher = FxHasher::default();
        vertex.hash(&mut hasher);
        fragment.hash(&mut hasher);
        discriminator.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Key for a pipeline description, `None` unless it has both a vertex
    /// and a fragment stage.
    pub fn for_pipeline(desc: &GraphicsPipelineDesc, discriminator: u64) -> Option<Self> {
        let vertex = desc.stage(ShaderStage::Vertex)?;
        let fragment = desc.stage(ShaderStage::Fragment)?;
        Some(Self::new(&vertex.spirv, &fragment.spirv, discriminator))
    }
}

#[derive(Debug)]
struct MaterialEntry {
    pipeline: GraphicsPipelineId,
    refs: u32,
}

/// Reference-counted map from material keys to pipelines.
#[derive(Debug, Default)]
pub struct MaterialCache {
    entries: FxHashMap<MaterialKey, MaterialEntry>,
}

impl MaterialCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the cached pipeline and takes a reference on it.
    pub fn acquire(&mut self, key: MaterialKey) -> Option<GraphicsPipelineId> {
        let entry = self.entries.get_mut(&key)?;
        entry.refs += 1;
        Some(entry.pipeline)
    }

    /// Caches a new pipeline with one reference.
    pub fn insert(&mut self, key: MaterialKey, pipeline: GraphicsPipelineId) {
        self.entries.insert(key, MaterialEntry { pipeline, refs: 1 });
    }

    /// Drops one reference to `pipeline`. Returns true when it was the last
    /// one and the entry was removed.
    pub fn release(&mut self, pipeline: GraphicsPipelineId) -> bool {
        let Some((&key, entry)) = self
            .entries
            .iter_mut()
            .find(|(_, e)| e.pipeline == pipeline)
        else {
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            self.entries.remove(&key);
            return true;
        }
        false
    }

    /// Forgets a pipeline destroyed outside the cache.
    pub fn forget(&mut self, pipeline: GraphicsPipelineId) {
        self.entries.retain(|_, e| e.pipeline != pipeline);
    }

    pub fn contains(&self, pipeline: GraphicsPipelineId) -> bool {
        self.entries.values().any(|e| e.pipeline == pipeline)
    }

    /// Empties the cache, returning every cached pipeline.
    pub fn clear(&mut self) -> Vec<GraphicsPipelineId> {
        self.entries.drain().map(|(_, e)| e.pipeline).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn pipelines(n: usize) -> Vec<GraphicsPipelineId> {
        let mut map: SlotMap<GraphicsPipelineId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn test_key_depends_on_every_input() {
        let base = MaterialKey::new(&[1, 2], &[3, 4], 0);
        assert_eq!(base, MaterialKey::new(&[1, 2], &[3, 4], 0));
        assert_ne!(base, MaterialKey::new(&[1, 2], &[3, 5], 0));
        assert_ne!(base, MaterialKey::new(&[1, 2], &[3, 4], 1));
        assert_ne!(base, MaterialKey::new(&[3, 4], &[1, 2], 0));
    }

    #[test]
    fn test_acquire_and_release_count_references() {
        let ids = pipelines(1);
        let key = MaterialKey::new(&[1], &[2], 0);
        let mut cache = MaterialCache::new();
        assert!(cache.acquire(key).is_none());

        cache.insert(key, ids[0]);
        assert_eq!(cache.acquire(key), Some(ids[0]));
        assert!(!cache.release(ids[0]));
        assert!(cache.release(ids[0]));
        assert!(cache.is_empty());
        assert!(!cache.release(ids[0]));
    }

    #[test]
    fn test_forget_and_clear() {
        let ids = pipelines(2);
        let mut cache = MaterialCache::new();
        cache.insert(MaterialKey::new(&[1], &[2], 0), ids[0]);
        cache.insert(MaterialKey::new(&[1], &[2], 1), ids[1]);
        cache.forget(ids[0]);
        assert!(!cache.contains(ids[0]));
        assert_eq!(cache.clear(), vec![ids[1]]);
        assert!(cache.is_empty());
    }
}

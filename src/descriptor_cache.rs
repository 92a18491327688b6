//! Descriptor-write elision cache (C7/C10, §4.10, P11).
//!
//! `update_pipeline_state` re-uploads global/instance UBO bytes and sampler
//! bindings every call; most calls in a frame loop pass identical data
//! (the camera didn't move, the material didn't change). This cache lets
//! the backend skip the write when the new value is bitwise identical to
//! what's already bound, and counts how many it skipped.

use fxhash::FxHashMap;

use crate::handle::TextureHandle;

/// Per-pipeline cache of the last-applied global UBO bytes, per-instance
/// UBO bytes, and per-instance texture bindings.
#[derive(Default)]
pub struct DescriptorWriteCache {
    global_bytes: Option<Vec<u8>>,
    instance_bytes: FxHashMap<u32, Vec<u8>>,
    instance_textures: FxHashMap<u32, Vec<TextureHandle>>,
    writes_avoided: u64,
}

impl DescriptorWriteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes_avoided(&self) -> u64 {
        self.writes_avoided
    }

    /// Read-and-clear, for telemetry (§4.10 "readable and resettable").
    pub fn reset_writes_avoided(&mut self) -> u64 {
        std::mem::take(&mut self.writes_avoided)
    }

    /// Returns `true` if the global UBO actually needed a write.
    pub fn apply_global_uniform(&mut self, bytes: &[u8]) -> bool {
        if self.global_bytes.as_deref() == Some(bytes) {
            self.writes_avoided += 1;
            return false;
        }
        self.global_bytes = Some(bytes.to_vec());
        true
    }

    /// Returns `true` if this instance's UBO actually needed a write.
    pub fn apply_instance_uniform(&mut self, instance: u32, bytes: &[u8]) -> bool {
        if self.instance_bytes.get(&instance).map(Vec::as_slice) == Some(bytes) {
            self.writes_avoided += 1;
            return false;
        }
        self.instance_bytes.insert(instance, bytes.to_vec());
        true
    }

    /// Compares each texture binding slot against the cache; only the
    /// slots that differ are reported as needing a write, the rest count
    /// toward `writes_avoided`. Returns the number of slots that needed a
    /// write.
    pub fn apply_instance_textures(&mut self, instance: u32, textures: &[TextureHandle]) -> usize {
        let cached = self
            .instance_textures
            .entry(instance)
            .or_insert_with(|| vec![TextureHandle::default(); textures.len()]);
        if cached.len() != textures.len() {
            *cached = vec![TextureHandle::default(); textures.len()];
        }

        let mut writes_needed = 0;
        for (slot, texture) in textures.iter().enumerate() {
            if cached[slot] == *texture {
                self.writes_avoided += 1;
            } else {
                cached[slot] = *texture;
                writes_needed += 1;
            }
        }
        writes_needed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn some_textures(n: usize) -> (SlotMap<TextureHandle, ()>, Vec<TextureHandle>) {
        let mut table = SlotMap::with_key();
        let handles = (0..n).map(|_| table.insert(())).collect();
        (table, handles)
    }

    #[test]
    fn first_write_is_never_elided() {
        let mut cache = DescriptorWriteCache::new();
        assert!(cache.apply_global_uniform(&[1, 2, 3, 4]));
        assert_eq!(cache.writes_avoided(), 0);
    }

    /// P11 — identical bytes/textures on the second call elide all bindings.
    #[test]
    fn p11_identical_second_call_elides_every_binding() {
        let mut cache = DescriptorWriteCache::new();
        let (_table, textures) = some_textures(2);
        let global = [9u8; 64];
        let instance = [1u8; 16];

        assert!(cache.apply_global_uniform(&global));
        assert!(cache.apply_instance_uniform(0, &instance));
        assert_eq!(cache.apply_instance_textures(0, &textures), 2);
        assert_eq!(cache.writes_avoided(), 0);

        assert!(!cache.apply_global_uniform(&global));
        assert!(!cache.apply_instance_uniform(0, &instance));
        assert_eq!(cache.apply_instance_textures(0, &textures), 0);

        // 1 global + 1 instance UBO + 2 textures = 4 elided bindings.
        assert_eq!(cache.writes_avoided(), 4);
    }

    #[test]
    fn changed_bytes_are_not_elided() {
        let mut cache = DescriptorWriteCache::new();
        assert!(cache.apply_instance_uniform(3, &[1, 2, 3]));
        assert!(cache.apply_instance_uniform(3, &[1, 2, 4]));
        assert_eq!(cache.writes_avoided(), 0);
    }

    #[test]
    fn reset_clears_counter() {
        let mut cache = DescriptorWriteCache::new();
        cache.apply_global_uniform(&[1]);
        cache.apply_global_uniform(&[1]);
        assert_eq!(cache.reset_writes_avoided(), 1);
        assert_eq!(cache.writes_avoided(), 0);
    }

    #[test]
    fn mismatched_texture_count_forces_full_rewrite() {
        let mut cache = DescriptorWriteCache::new();
        let (_t1, textures_a) = some_textures(1);
        let (_t2, textures_b) = some_textures(2);
        assert_eq!(cache.apply_instance_textures(0, &textures_a), 1);
        assert_eq!(cache.apply_instance_textures(0, &textures_b), 2);
    }
}

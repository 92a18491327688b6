//! Typed, arena-scoped resource handles.
//!
//! The reference implementation passed `void*` handles across the API
//! boundary. Here every resource table is a [`slotmap::SlotMap`] and every
//! handle is a new-type wrapping a `slotmap::DefaultKey`: looking up a
//! destroyed (or never-created) handle fails the slot's generation check
//! instead of touching freed memory (P13), and a handle can never be
//! confused with a handle from a different resource table because the
//! wrapper types are distinct.

use slotmap::new_key_type;

new_key_type! {
    pub struct BufferHandle;
    pub struct TextureHandle;
    pub struct PipelineHandle;
    pub struct InstanceStateHandle;
    pub struct RenderTargetHandle;
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn stale_handle_fails_lookup_even_after_slot_reuse() {
        let mut table: SlotMap<BufferHandle, u32> = SlotMap::with_key();
        let h1 = table.insert(1);
        table.remove(h1);
        let h2 = table.insert(2);
        // h2 may or may not reuse h1's slot index, but h1 must never resolve
        // to h2's data (P13).
        assert!(table.get(h1).is_none());
        assert_eq!(*table.get(h2).unwrap(), 2);
    }
}

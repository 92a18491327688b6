//! Indirect-draw ring bookkeeping (C11, §4.9).
//!
//! Pure write-offset accounting; the backing triple-buffered device buffer
//! (with its fallback memory-property tiers) is owned by the Vulkan
//! backend. This module only tracks, per in-flight frame, how many draw
//! records have been written so far.

use crate::config::INDIRECT_DRAW_COMMAND_SIZE;

/// Host-visible mirror of the GPU ABI record for `vkCmdDrawIndexedIndirect`
/// (§6). 20 bytes: five packed `u32`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndirectDrawCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: u32,
    pub first_instance: u32,
}

impl IndirectDrawCommand {
    pub const SIZE: u64 = INDIRECT_DRAW_COMMAND_SIZE;

    pub fn to_bytes(self) -> [u8; 20] {
        let mut bytes = [0u8; 20];
        bytes[0..4].copy_from_slice(&self.index_count.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.instance_count.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.first_index.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.vertex_offset.to_ne_bytes());
        bytes[16..20].copy_from_slice(&self.first_instance.to_ne_bytes());
        bytes
    }
}

/// Memory-property tier a backend managed to allocate the ring's backing
/// buffers in, tried in the order given in §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingMemoryTier {
    DeviceLocalHostCoherent,
    HostCoherent,
    HostOnly,
}

impl RingMemoryTier {
    /// Only `HostOnly` requires an explicit `vkFlushMappedMemoryRanges`
    /// equivalent before the GPU reads it.
    pub fn needs_flush(self) -> bool {
        matches!(self, RingMemoryTier::HostOnly)
    }
}

/// `base_draw` plus whether the allocation succeeded, mirroring the
/// `(base_draw, ptr)` / failure pair from §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingAllocation {
    pub base_draw: u32,
    pub count: u32,
}

/// Per-in-flight-frame write-offset bookkeeping over a ring of `max_draws`
/// slots (S6).
pub struct IndirectRing {
    max_draws: u32,
    memory_tier: RingMemoryTier,
    write_offsets: Vec<u32>,
    active_frame: usize,
}

impl IndirectRing {
    pub fn new(max_draws: u32, buffering_frames: u32, memory_tier: RingMemoryTier) -> Self {
        IndirectRing {
            max_draws,
            memory_tier,
            write_offsets: vec![0; buffering_frames as usize],
            active_frame: 0,
        }
    }

    pub fn max_draws(&self) -> u32 {
        self.max_draws
    }

    pub fn memory_tier(&self) -> RingMemoryTier {
        self.memory_tier
    }

    /// Selects the active buffer for this frame and resets its write
    /// offset to 0.
    pub fn begin_frame(&mut self, frame_index: usize) {
        self.active_frame = frame_index;
        self.write_offsets[frame_index] = 0;
    }

    /// Bump-allocate `count` draw slots from the active buffer. Fails
    /// without mutating state if the ring would overflow (S6).
    pub fn alloc(&mut self, count: u32) -> Option<RingAllocation> {
        let offset = self.write_offsets[self.active_frame];
        if offset.checked_add(count)? > self.max_draws {
            return None;
        }
        self.write_offsets[self.active_frame] = offset + count;
        Some(RingAllocation { base_draw: offset, count })
    }

    pub fn write_offset(&self) -> u32 {
        self.write_offsets[self.active_frame]
    }

    pub fn remaining(&self) -> u32 {
        self.max_draws - self.write_offsets[self.active_frame]
    }

    /// Index of the active buffer in the backend's per-frame buffer table
    /// (§4.9): which backing `vk::Buffer` `draw_indexed_indirect` should
    /// bind this frame.
    pub fn get_current(&self) -> usize {
        self.active_frame
    }

    /// Byte range within the active buffer that needs an explicit flush
    /// before the GPU reads it, or `None` when the memory tier is already
    /// host-coherent (§4.9). The caller issues the actual
    /// `vkFlushMappedMemoryRanges` call against its backing buffer.
    pub fn flush_range(&self, base: u32, count: u32) -> Option<(u64, u64)> {
        if !self.memory_tier.needs_flush() {
            return None;
        }
        Some((base as u64 * IndirectDrawCommand::SIZE, count as u64 * IndirectDrawCommand::SIZE))
    }

    /// Flushes the active buffer's full written prefix.
    pub fn flush_current(&self) -> Option<(u64, u64)> {
        self.flush_range(0, self.write_offsets[self.active_frame])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirect_draw_command_round_trips_through_bytes() {
        let cmd = IndirectDrawCommand { index_count: 36, instance_count: 1, first_index: 0, vertex_offset: 12, first_instance: 0 };
        let bytes = cmd.to_bytes();
        assert_eq!(bytes.len(), IndirectDrawCommand::SIZE as usize);
        assert_eq!(u32::from_ne_bytes(bytes[0..4].try_into().unwrap()), 36);
        assert_eq!(u32::from_ne_bytes(bytes[12..16].try_into().unwrap()), 12);
    }

    /// S6 — indirect ring overflow.
    #[test]
    fn s6_ring_overflow_leaves_offset_unchanged() {
        let mut ring = IndirectRing::new(4, 3, RingMemoryTier::DeviceLocalHostCoherent);
        ring.begin_frame(0);

        let first = ring.alloc(3).unwrap();
        assert_eq!(first, RingAllocation { base_draw: 0, count: 3 });

        let second = ring.alloc(2);
        assert!(second.is_none());
        assert_eq!(ring.write_offset(), 3);
    }

    #[test]
    fn begin_frame_resets_only_the_selected_buffer() {
        let mut ring = IndirectRing::new(8, 2, RingMemoryTier::HostCoherent);
        ring.begin_frame(0);
        ring.alloc(5).unwrap();
        ring.begin_frame(1);
        assert_eq!(ring.write_offset(), 0);
        ring.begin_frame(0);
        assert_eq!(ring.write_offset(), 5);
    }

    #[test]
    fn host_only_tier_requires_flush() {
        assert!(RingMemoryTier::HostOnly.needs_flush());
        assert!(!RingMemoryTier::HostCoherent.needs_flush());
        assert!(!RingMemoryTier::DeviceLocalHostCoherent.needs_flush());
    }

    #[test]
    fn remaining_tracks_capacity_minus_write_offset() {
        let mut ring = IndirectRing::new(10, 1, RingMemoryTier::HostCoherent);
        ring.begin_frame(0);
        assert_eq!(ring.remaining(), 10);
        ring.alloc(4).unwrap();
        assert_eq!(ring.remaining(), 6);
    }

    #[test]
    fn get_current_tracks_the_selected_buffer() {
        let mut ring = IndirectRing::new(4, 3, RingMemoryTier::HostCoherent);
        ring.begin_frame(2);
        assert_eq!(ring.get_current(), 2);
        ring.begin_frame(0);
        assert_eq!(ring.get_current(), 0);
    }

    #[test]
    fn flush_range_is_none_on_coherent_tiers() {
        let ring = IndirectRing::new(4, 1, RingMemoryTier::DeviceLocalHostCoherent);
        assert_eq!(ring.flush_range(0, 4), None);
        let ring = IndirectRing::new(4, 1, RingMemoryTier::HostCoherent);
        assert_eq!(ring.flush_range(0, 4), None);
    }

    #[test]
    fn flush_range_spans_bytes_on_host_only_tier() {
        let ring = IndirectRing::new(16, 1, RingMemoryTier::HostOnly);
        assert_eq!(ring.flush_range(2, 3), Some((2 * IndirectDrawCommand::SIZE, 3 * IndirectDrawCommand::SIZE)));
    }

    #[test]
    fn flush_current_covers_the_written_prefix() {
        let mut ring = IndirectRing::new(16, 1, RingMemoryTier::HostOnly);
        ring.begin_frame(0);
        ring.alloc(5).unwrap();
        assert_eq!(ring.flush_current(), Some((0, 5 * IndirectDrawCommand::SIZE)));
    }
}

//! Shared description types and bitsets for the resource subsystem (C7/C10).

use bitflags::bitflags;

bitflags! {
    /// Buffer usage bitset (§3 Buffer).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX       = 1 << 0;
        const INDEX        = 1 << 1;
        const UNIFORM      = 1 << 2;
        const INDIRECT     = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

bitflags! {
    /// Memory-property request bitset (§3 Buffer, §4.6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        const DEVICE_LOCAL  = 1 << 0;
        const HOST_VISIBLE  = 1 << 1;
        const HOST_COHERENT = 1 << 2;
    }
}

bitflags! {
    /// Texture property bitset (§3 Texture).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureProperties: u32 {
        const WRITABLE         = 1 << 0;
        const HAS_TRANSPARENCY = 1 << 1;
    }
}

bitflags! {
    /// Render-pass clear-flags bitset (§3 Render pass, §4.4).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u32 {
        const CLEAR_COLOR   = 1 << 0;
        const CLEAR_DEPTH   = 1 << 1;
        const CLEAR_STENCIL = 1 << 2;
        const USE_DEPTH     = 1 << 3;
    }
}

/// Description supplied to `create_buffer` (§4.6).
#[derive(Debug, Clone)]
pub struct BufferDescription {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory_properties: MemoryProperties,
    pub bind_on_create: bool,
    pub persistently_mapped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureType {
    Texture2D,
    CubeMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapMode {
    Repeat,
    ClampToEdge,
    MirroredRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Description supplied to `create_texture` / `update_texture` (§4.7).
#[derive(Debug, Clone)]
pub struct TextureDescription {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub texture_type: TextureType,
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
    pub wrap_w: WrapMode,
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub use_anisotropy: bool,
    pub properties: TextureProperties,
    pub generation: u64,
}

impl TextureDescription {
    /// §4.7: `HAS_TRANSPARENCY` is set for any 4-channel/alpha-carrying format.
    pub fn carries_transparency(&self) -> bool {
        self.channels == 4
    }

    /// §4.7: `mip_levels = 1 + floor(log2(max(w,h)))` when linear blit is
    /// available on the target format, else 1.
    pub fn mip_levels(&self, supports_linear_blit: bool) -> u32 {
        if !supports_linear_blit {
            return 1;
        }
        let max_dim = self.width.max(self.height).max(1);
        1 + (31 - max_dim.leading_zeros())
    }
}

/// A sub-rectangle write target for `write_texture` (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct TextureWriteRegion {
    pub mip: u32,
    pub layer: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_levels_matches_spec_formula() {
        let desc = TextureDescription {
            width: 1024,
            height: 512,
            channels: 4,
            texture_type: TextureType::Texture2D,
            wrap_u: WrapMode::Repeat,
            wrap_v: WrapMode::Repeat,
            wrap_w: WrapMode::Repeat,
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            use_anisotropy: false,
            properties: TextureProperties::empty(),
            generation: 0,
        };
        // max(1024,512) = 1024 = 2^10 -> 1 + 10 = 11
        assert_eq!(desc.mip_levels(true), 11);
        assert_eq!(desc.mip_levels(false), 1);
    }

    #[test]
    fn four_channel_textures_carry_transparency() {
        let mut desc = TextureDescription {
            width: 4,
            height: 4,
            channels: 3,
            texture_type: TextureType::Texture2D,
            wrap_u: WrapMode::Repeat,
            wrap_v: WrapMode::Repeat,
            wrap_w: WrapMode::Repeat,
            min_filter: FilterMode::Nearest,
            mag_filter: FilterMode::Nearest,
            use_anisotropy: false,
            properties: TextureProperties::empty(),
            generation: 0,
        };
        assert!(!desc.carries_transparency());
        desc.channels = 4;
        assert!(desc.carries_transparency());
    }
}

//! Ambient configuration surface.
//!
//! The reference implementation read most of these tunables from a
//! `Settings` file through the `config` crate. This crate keeps the same
//! shape of knobs but leaves loading them from disk to the host application:
//! `DeviceRequirements` and `RendererConfig` simply derive `serde::Deserialize`
//! so a host can hydrate them from TOML/JSON/env if it wants to.

use serde::{Deserialize, Serialize};

/// Number of frames the swapchain is allowed to have in flight at once,
/// before clamping to the actual swapchain image count.
pub const BUFFERING_FRAMES: u32 = 3;

/// Alignment required for uniform buffer object strides (`global_ubo_stride`,
/// `instance_ubo_stride`). 256 is the conservative cross-vendor value for
/// `minUniformBufferOffsetAlignment`.
pub const UBO_ALIGNMENT: u64 = 256;

/// Byte size of one `INDIRECT_DRAW_COMMAND` record (5 little-endian u32
/// fields matching `vkCmdDrawIndexedIndirect`'s ABI).
pub const INDIRECT_DRAW_COMMAND_SIZE: u64 = 20;

/// Requirements the device selector (C3) scores candidate physical devices
/// against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRequirements {
    /// Require a discrete GPU (integrated GPUs still considered, scored lower).
    pub prefer_discrete_gpu: bool,
    /// Required device extensions beyond `VK_KHR_swapchain` (always required).
    pub required_extensions: Vec<String>,
    /// Enable validation layers / the debug messenger.
    pub enable_validation: bool,
    /// Require sampler anisotropy support.
    pub require_sampler_anisotropy: bool,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        DeviceRequirements {
            prefer_discrete_gpu: true,
            required_extensions: Vec::new(),
            enable_validation: cfg!(debug_assertions),
            require_sampler_anisotropy: false,
        }
    }
}

/// Top-level tunables for the frontend, separate from per-device
/// requirements so a host can reconfigure buffering without re-running
/// device selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    pub buffering_frames: u32,
    pub max_instance_states_per_pipeline: u32,
    pub indirect_ring_max_draws: u32,
    pub application_name: String,
    pub engine_name: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        RendererConfig {
            buffering_frames: BUFFERING_FRAMES,
            max_instance_states_per_pipeline: 1024,
            indirect_ring_max_draws: 4096,
            application_name: "app".to_string(),
            engine_name: "engine".to_string(),
        }
    }
}

//! Single-threaded, explicit-submission renderer frontend over a pluggable
//! GPU backend. The Vulkan backend under [`backend::vulkan`] is the only
//! reference implementation today; [`frontend::Renderer`] is the public
//! entry point applications drive.

pub mod arena;
pub mod backend;
pub mod config;
pub mod descriptor_cache;
pub mod error;
pub mod frame_state;
pub mod frontend;
pub mod handle;
pub mod indirect;
pub mod logging;
pub mod render_pass;
pub mod resources;
pub mod shader_config;
pub mod sub_allocator;

pub use backend::vulkan::VulkanBackend;
pub use backend::{BackendType, DeviceInformation, GraphicsPipelineDescription, PipelineStateUpdate, RenderBackend};
pub use config::{DeviceRequirements, RendererConfig};
pub use error::{ErrorKind, Result};
pub use frontend::Renderer;
pub use handle::{BufferHandle, InstanceStateHandle, PipelineHandle, RenderTargetHandle, TextureHandle};
pub use render_pass::RenderPassDomain;
pub use resources::{BufferDescription, BufferUsage, MemoryProperties, TextureDescription, TextureType, TextureWriteRegion};

//! Backend virtual table (§3A, §6).
//!
//! The source specification's backend is a struct of function pointers
//! selected by a `backend_type` tag. Here that becomes a trait object
//! boundary: [`RenderBackend`] is the seam the frontend orchestrator (C9)
//! drives, and [`BackendType`] picks which implementation `initialize`
//! constructs. `VULKAN` is the only variant with a real implementation;
//! the enum stays open for future backends per §6.

pub mod vulkan;

use crate::descriptor_cache::DescriptorWriteCache;
use crate::error::{ErrorKind, Result};
use crate::handle::{BufferHandle, InstanceStateHandle, PipelineHandle, RenderTargetHandle, TextureHandle};
use crate::render_pass::RenderPassDomain;
use crate::resources::{BufferDescription, TextureDescription, TextureWriteRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendType {
    Vulkan,
}

/// Queried once after `initialize`, surfaced to the host for diagnostics
/// and UI (§4.1).
#[derive(Debug, Clone)]
pub struct DeviceInformation {
    pub device_name: String,
    pub driver_version: u32,
    pub api_version: u32,
    pub is_discrete_gpu: bool,
}

/// Description handed to `create_graphics_pipeline` (§4.10): a laid-out
/// shader config plus the domain it targets and an instance-state cap.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDescription {
    pub shader_config: crate::shader_config::ShaderConfig,
    pub domain: RenderPassDomain,
    pub max_instance_states: u32,
}

/// Opaque per-resource uniform/material write, already laid out by the
/// caller according to the pipeline's `ShaderConfig` (§4.10).
#[derive(Debug, Clone, Default)]
pub struct PipelineStateUpdate {
    pub global_uniform_bytes: Option<Vec<u8>>,
    /// Which instance slot `instance_uniform_bytes`/`instance_textures`
    /// target; `None` (the default) means this update carries no
    /// per-instance payload at all.
    pub instance: Option<InstanceStateHandle>,
    pub instance_uniform_bytes: Option<Vec<u8>>,
    pub instance_textures: Vec<TextureHandle>,
}

/// The seam between the frontend orchestrator and a concrete GPU API.
/// Every method mirrors one row of §6's public API / backend virtual
/// table; fallible ones return the public [`ErrorKind`] taxonomy, never a
/// backend-specific error type.
pub trait RenderBackend {
    fn initialize(&mut self, requirements: &crate::config::DeviceRequirements, window_extent: (u32, u32)) -> Result<()>;
    fn shutdown(&mut self);
    fn on_resize(&mut self, width: u32, height: u32) -> Result<()>;
    fn get_device_information(&self) -> DeviceInformation;
    fn wait_idle(&mut self) -> Result<()>;

    fn begin_frame(&mut self, delta_time: f32) -> ErrorKind;
    fn end_frame(&mut self, delta_time: f32) -> ErrorKind;
    fn begin_render_pass(&mut self, domain: RenderPassDomain, target: RenderTargetHandle) -> ErrorKind;
    fn end_render_pass(&mut self) -> ErrorKind;

    fn create_buffer(&mut self, description: &BufferDescription, initial_data: Option<&[u8]>) -> Result<BufferHandle>;
    fn update_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> ErrorKind;
    fn upload_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> ErrorKind;
    fn destroy_buffer(&mut self, handle: BufferHandle);
    fn bind_vertex_buffer(&mut self, handle: BufferHandle, binding: u32) -> ErrorKind;
    fn bind_index_buffer(&mut self, handle: BufferHandle) -> ErrorKind;

    fn create_texture(&mut self, description: &TextureDescription, initial_data: Option<&[u8]>) -> Result<TextureHandle>;
    fn update_texture(&mut self, handle: TextureHandle, description: &TextureDescription) -> ErrorKind;
    fn write_texture(&mut self, handle: TextureHandle, region: TextureWriteRegion, data: &[u8]) -> ErrorKind;
    fn resize_texture(&mut self, handle: TextureHandle, width: u32, height: u32, preserve_contents: bool) -> ErrorKind;
    fn destroy_texture(&mut self, handle: TextureHandle);

    fn create_graphics_pipeline(&mut self, description: &GraphicsPipelineDescription) -> Result<PipelineHandle>;
    fn destroy_pipeline(&mut self, handle: PipelineHandle);
    fn acquire_instance_state(&mut self, pipeline: PipelineHandle) -> Result<InstanceStateHandle>;
    fn release_instance_state(&mut self, pipeline: PipelineHandle, handle: InstanceStateHandle) -> ErrorKind;
    fn update_pipeline_state(&mut self, pipeline: PipelineHandle, update: &PipelineStateUpdate) -> ErrorKind;

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32);

    /// Read-and-clear telemetry counter backed by a [`DescriptorWriteCache`]
    /// per pipeline (§4.10, P11).
    fn get_and_reset_descriptor_writes_avoided(&mut self, pipeline: PipelineHandle) -> u64;
}

pub(crate) fn new_descriptor_cache() -> DescriptorWriteCache {
    DescriptorWriteCache::new()
}

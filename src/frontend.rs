//! Public frontend orchestrator (C9, §4.1).
//!
//! `Renderer<B>` is generic over any [`RenderBackend`] so the Vulkan
//! implementation under [`crate::backend::vulkan`] is just the default
//! instantiation, not a hard-coded dependency. It owns the main/scratch
//! arenas, the resize mutex from §5, and the cached window size; every
//! fallible call forwards straight to the backend and never panics on a
//! device/driver condition.

use std::sync::Mutex;

use crate::arena::FrameArena;
use crate::backend::{GraphicsPipelineDescription, PipelineStateUpdate, RenderBackend};
use crate::error::{ErrorKind, Result};
use crate::handle::{BufferHandle, InstanceStateHandle, PipelineHandle, RenderTargetHandle, TextureHandle};
use crate::render_pass::RenderPassDomain;
use crate::resources::{BufferDescription, TextureDescription, TextureWriteRegion};

/// The public handle an application holds. Wraps a `B: RenderBackend` —
/// concretely `VulkanBackend<W>` — behind the same orchestration logic
/// regardless of which backend is selected (§3A `BackendType`).
pub struct Renderer<B> {
    backend: B,
    main_arena: FrameArena,
    scratch_arena: FrameArena,
    resize_guard: Mutex<()>,
    window_size: (u32, u32),
    initialized: bool,
}

impl<B: RenderBackend> Renderer<B> {
    /// Wraps an already-constructed backend. The backend itself is built
    /// with whatever window/display handles it needs (§6 `window`
    /// parameter); `initialize` only drives the device/swapchain setup and
    /// the arena/window-size bookkeeping this layer owns.
    pub fn new(backend: B) -> Self {
        Renderer {
            backend,
            main_arena: FrameArena::new(),
            scratch_arena: FrameArena::new(),
            resize_guard: Mutex::new(()),
            window_size: (0, 0),
            initialized: false,
        }
    }

    pub fn main_arena(&self) -> &FrameArena {
        &self.main_arena
    }

    pub fn scratch_arena(&self) -> &FrameArena {
        &self.scratch_arena
    }

    /// §4.1 `initialize`: creates the main/scratch arenas (done at
    /// [`Renderer::new`]), drives `backend.initialize`, and records the
    /// initial window pixel size.
    pub fn initialize(&mut self, requirements: &crate::config::DeviceRequirements, window_pixel_size: (u32, u32)) -> Result<()> {
        self.backend.initialize(requirements, window_pixel_size)?;
        self.window_size = window_pixel_size;
        self.initialized = true;
        Ok(())
    }

    /// §4.1 `destroy`: fails silently on double-destroy.
    pub fn destroy(&mut self) {
        if !self.initialized {
            return;
        }
        let _ = self.backend.wait_idle();
        self.backend.shutdown();
        self.initialized = false;
    }

    /// §4.1 `resize`: serialised under the frontend mutex since resize
    /// events may arrive from a windowing-event thread distinct from the
    /// render loop (§5).
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let _guard = self.resize_guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.backend.on_resize(width, height)?;
        self.window_size = (width, height);
        Ok(())
    }

    pub fn window_size(&self) -> (u32, u32) {
        self.window_size
    }

    pub fn wait_idle(&mut self) -> Result<()> {
        self.backend.wait_idle()
    }

    pub fn device_information(&self) -> crate::backend::DeviceInformation {
        self.backend.get_device_information()
    }

    pub fn begin_frame(&mut self, delta_time: f32) -> ErrorKind {
        self.backend.begin_frame(delta_time)
    }

    pub fn end_frame(&mut self, delta_time: f32) -> ErrorKind {
        self.backend.end_frame(delta_time)
    }

    /// §6 shape: `begin_render_pass(domain)`. Targets the current swapchain
    /// image; offscreen render targets would pass a real
    /// [`RenderTargetHandle`] here once C7 grows an API to create one (out
    /// of the distilled spec's scope, §1 Non-goals).
    pub fn begin_render_pass(&mut self, domain: RenderPassDomain) -> ErrorKind {
        self.backend.begin_render_pass(domain, RenderTargetHandle::default())
    }

    pub fn end_render_pass(&mut self) -> ErrorKind {
        self.backend.end_render_pass()
    }

    pub fn create_buffer(&mut self, description: &BufferDescription, initial_data: Option<&[u8]>) -> Result<BufferHandle> {
        self.backend.create_buffer(description, initial_data)
    }

    pub fn update_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> ErrorKind {
        self.backend.update_buffer(handle, offset, data)
    }

    pub fn upload_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> ErrorKind {
        self.backend.upload_buffer(handle, offset, data)
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        self.backend.destroy_buffer(handle);
    }

    pub fn bind_vertex_buffer(&mut self, handle: BufferHandle, binding: u32) -> ErrorKind {
        self.backend.bind_vertex_buffer(handle, binding)
    }

    pub fn bind_index_buffer(&mut self, handle: BufferHandle) -> ErrorKind {
        self.backend.bind_index_buffer(handle)
    }

    pub fn create_texture(&mut self, description: &TextureDescription, initial_data: Option<&[u8]>) -> Result<TextureHandle> {
        self.backend.create_texture(description, initial_data)
    }

    pub fn update_texture(&mut self, handle: TextureHandle, description: &TextureDescription) -> ErrorKind {
        self.backend.update_texture(handle, description)
    }

    pub fn write_texture(&mut self, handle: TextureHandle, region: TextureWriteRegion, data: &[u8]) -> ErrorKind {
        self.backend.write_texture(handle, region, data)
    }

    pub fn resize_texture(&mut self, handle: TextureHandle, width: u32, height: u32, preserve_contents: bool) -> ErrorKind {
        self.backend.resize_texture(handle, width, height, preserve_contents)
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        self.backend.destroy_texture(handle);
    }

    pub fn create_graphics_pipeline(&mut self, description: &GraphicsPipelineDescription) -> Result<PipelineHandle> {
        self.backend.create_graphics_pipeline(description)
    }

    pub fn destroy_pipeline(&mut self, handle: PipelineHandle) {
        self.backend.destroy_pipeline(handle);
    }

    pub fn acquire_instance_state(&mut self, pipeline: PipelineHandle) -> Result<InstanceStateHandle> {
        self.backend.acquire_instance_state(pipeline)
    }

    pub fn release_instance_state(&mut self, pipeline: PipelineHandle, handle: InstanceStateHandle) -> ErrorKind {
        self.backend.release_instance_state(pipeline, handle)
    }

    /// §6 `update_global_state`: a convenience wrapper that only touches the
    /// pipeline's global-scope UBO bytes, leaving instance state untouched.
    pub fn update_global_state(&mut self, pipeline: PipelineHandle, uniform_bytes: Vec<u8>) -> ErrorKind {
        let update = PipelineStateUpdate { global_uniform_bytes: Some(uniform_bytes), ..Default::default() };
        self.backend.update_pipeline_state(pipeline, &update)
    }

    /// §6 `update_instance_state`: touches only the per-instance UBO bytes
    /// and texture bindings (the "material") of `instance`.
    pub fn update_instance_state(
        &mut self,
        pipeline: PipelineHandle,
        instance: InstanceStateHandle,
        uniform_bytes: Vec<u8>,
        material_textures: Vec<TextureHandle>,
    ) -> ErrorKind {
        let update = PipelineStateUpdate {
            global_uniform_bytes: None,
            instance: Some(instance),
            instance_uniform_bytes: Some(uniform_bytes),
            instance_textures: material_textures,
        };
        self.backend.update_pipeline_state(pipeline, &update)
    }

    /// §6 `update_pipeline_state`: the general form touching both scopes at
    /// once.
    pub fn update_pipeline_state(&mut self, pipeline: PipelineHandle, update: &PipelineStateUpdate) -> ErrorKind {
        self.backend.update_pipeline_state(pipeline, update)
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.backend.draw(vertex_count, instance_count, first_vertex, first_instance);
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) {
        self.backend.draw_indexed(index_count, instance_count, first_index, vertex_offset, first_instance);
    }

    pub fn get_and_reset_descriptor_writes_avoided(&mut self, pipeline: PipelineHandle) -> u64 {
        self.backend.get_and_reset_descriptor_writes_avoided(pipeline)
    }
}

impl<B> Drop for Renderer<B> {
    /// Backstop for an application that forgets to call [`Renderer::destroy`]
    /// explicitly; the real teardown still needs `&mut self` access to the
    /// backend, which a `Drop` impl on a generic `B` can't call without the
    /// `RenderBackend` bound, so this only asserts the invariant in debug
    /// builds rather than silently swallowing it.
    fn drop(&mut self) {
        debug_assert!(!self.initialized, "Renderer dropped without calling destroy()");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceInformation;

    /// A backend double that only tracks call counts, letting the
    /// orchestration logic above (arena lifetime, resize mutex, double-
    /// destroy) be tested without a GPU.
    #[derive(Default)]
    struct RecordingBackend {
        initialize_calls: u32,
        shutdown_calls: u32,
        resize_calls: u32,
    }

    impl RenderBackend for RecordingBackend {
        fn initialize(&mut self, _requirements: &crate::config::DeviceRequirements, _window_extent: (u32, u32)) -> Result<()> {
            self.initialize_calls += 1;
            Ok(())
        }
        fn shutdown(&mut self) {
            self.shutdown_calls += 1;
        }
        fn on_resize(&mut self, _width: u32, _height: u32) -> Result<()> {
            self.resize_calls += 1;
            Ok(())
        }
        fn get_device_information(&self) -> DeviceInformation {
            DeviceInformation { device_name: "test".into(), driver_version: 0, api_version: 0, is_discrete_gpu: false }
        }
        fn wait_idle(&mut self) -> Result<()> {
            Ok(())
        }
        fn begin_frame(&mut self, _delta_time: f32) -> ErrorKind {
            ErrorKind::None
        }
        fn end_frame(&mut self, _delta_time: f32) -> ErrorKind {
            ErrorKind::None
        }
        fn begin_render_pass(&mut self, _domain: RenderPassDomain, _target: RenderTargetHandle) -> ErrorKind {
            ErrorKind::None
        }
        fn end_render_pass(&mut self) -> ErrorKind {
            ErrorKind::None
        }
        fn create_buffer(&mut self, _description: &BufferDescription, _initial_data: Option<&[u8]>) -> Result<BufferHandle> {
            Err(ErrorKind::Unknown)
        }
        fn update_buffer(&mut self, _handle: BufferHandle, _offset: u64, _data: &[u8]) -> ErrorKind {
            ErrorKind::None
        }
        fn upload_buffer(&mut self, _handle: BufferHandle, _offset: u64, _data: &[u8]) -> ErrorKind {
            ErrorKind::None
        }
        fn destroy_buffer(&mut self, _handle: BufferHandle) {}
        fn bind_vertex_buffer(&mut self, _handle: BufferHandle, _binding: u32) -> ErrorKind {
            ErrorKind::None
        }
        fn bind_index_buffer(&mut self, _handle: BufferHandle) -> ErrorKind {
            ErrorKind::None
        }
        fn create_texture(&mut self, _description: &TextureDescription, _initial_data: Option<&[u8]>) -> Result<TextureHandle> {
            Err(ErrorKind::Unknown)
        }
        fn update_texture(&mut self, _handle: TextureHandle, _description: &TextureDescription) -> ErrorKind {
            ErrorKind::None
        }
        fn write_texture(&mut self, _handle: TextureHandle, _region: TextureWriteRegion, _data: &[u8]) -> ErrorKind {
            ErrorKind::None
        }
        fn resize_texture(&mut self, _handle: TextureHandle, _width: u32, _height: u32, _preserve_contents: bool) -> ErrorKind {
            ErrorKind::None
        }
        fn destroy_texture(&mut self, _handle: TextureHandle) {}
        fn create_graphics_pipeline(&mut self, _description: &GraphicsPipelineDescription) -> Result<PipelineHandle> {
            Err(ErrorKind::Unknown)
        }
        fn destroy_pipeline(&mut self, _handle: PipelineHandle) {}
        fn acquire_instance_state(&mut self, _pipeline: PipelineHandle) -> Result<InstanceStateHandle> {
            Err(ErrorKind::Unknown)
        }
        fn release_instance_state(&mut self, _pipeline: PipelineHandle, _handle: InstanceStateHandle) -> ErrorKind {
            ErrorKind::None
        }
        fn update_pipeline_state(&mut self, _pipeline: PipelineHandle, _update: &PipelineStateUpdate) -> ErrorKind {
            ErrorKind::None
        }
        fn draw(&mut self, _vertex_count: u32, _instance_count: u32, _first_vertex: u32, _first_instance: u32) {}
        fn draw_indexed(&mut self, _index_count: u32, _instance_count: u32, _first_index: u32, _vertex_offset: i32, _first_instance: u32) {}
        fn get_and_reset_descriptor_writes_avoided(&mut self, _pipeline: PipelineHandle) -> u64 {
            0
        }
    }

    #[test]
    fn initialize_records_window_size_and_destroy_is_idempotent() {
        let mut renderer = Renderer::new(RecordingBackend::default());
        renderer.initialize(&crate::config::DeviceRequirements::default(), (1280, 720)).unwrap();
        assert_eq!(renderer.window_size(), (1280, 720));

        renderer.destroy();
        renderer.destroy();
        assert_eq!(renderer.backend.shutdown_calls, 1, "destroy must be a silent no-op the second time");
    }

    #[test]
    fn resize_forwards_to_backend_and_updates_cached_size() {
        let mut renderer = Renderer::new(RecordingBackend::default());
        renderer.initialize(&crate::config::DeviceRequirements::default(), (800, 600)).unwrap();
        renderer.resize(1920, 1080).unwrap();
        assert_eq!(renderer.window_size(), (1920, 1080));
        assert_eq!(renderer.backend.resize_calls, 1);
    }
}

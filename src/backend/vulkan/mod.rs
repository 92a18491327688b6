//! The Vulkan [`RenderBackend`] implementation (§6).
//!
//! Ties together instance/device selection ([`instance`]/[`device`]),
//! swapchain (re)creation ([`swapchain`]), buffer/texture backing storage
//! ([`resources`]) and graphics pipeline construction ([`pipeline`]) into a
//! single-threaded, explicit-submission renderer. The pure bookkeeping
//! modules ([`crate::frame_state`], [`crate::render_pass`],
//! [`crate::indirect`], [`crate::descriptor_cache`]) drive the actual Vulkan
//! calls here but are unit-tested independently without a device.

mod device;
mod instance;
mod pipeline;
mod resources;
mod swapchain;

use std::ffi::CStr;

use anyhow::Context;
use ash::extensions::khr::Surface;
use ash::vk;
use fxhash::FxHashMap;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use slotmap::{Key, SlotMap};

use crate::backend::{DeviceInformation, GraphicsPipelineDescription, PipelineStateUpdate, RenderBackend};
use crate::config::{DeviceRequirements, RendererConfig};
use crate::descriptor_cache::DescriptorWriteCache;
use crate::error::{ErrorKind, Result};
use crate::frame_state::{BeginFrameOutcome, FrameLifecycle, ResizeTracker};
use crate::handle::{BufferHandle, InstanceStateHandle, PipelineHandle, RenderTargetHandle, TextureHandle};
use crate::indirect::{IndirectDrawCommand, IndirectRing, RingAllocation, RingMemoryTier};
use crate::render_pass::{self, RenderPassConfig, RenderPassDomain, RenderPassRegistry};
use crate::resources::{BufferDescription, MemoryProperties, TextureDescription, TextureWriteRegion};
use crate::shader_config::{ShaderConfig, StageKind};

use self::device::{select_physical_device, SelectedDevice};
use self::instance::VulkanInstance;
use self::pipeline::VulkanPipeline;
use self::resources::{VulkanBuffer, VulkanTexture};
use self::swapchain::Swapchain;

/// One live graphics pipeline plus the bookkeeping §4.10 hangs off it:
/// the descriptor-write elision cache and the instance-state slot table.
struct PipelineEntry {
    vk: VulkanPipeline,
    shader_config: ShaderConfig,
    domain: RenderPassDomain,
    descriptor_cache: DescriptorWriteCache,
    instance_sets: SlotMap<InstanceStateHandle, InstanceSlot>,
    /// Descriptor sets freed while their owning command buffer might still
    /// be in flight, paired with the `total_frames` count at which it's
    /// safe to actually free them (§4.10).
    pending_releases: Vec<(vk::DescriptorSet, u64)>,
}

struct InstanceSlot {
    descriptor_set: vk::DescriptorSet,
    last_render_frame: u64,
}

/// Real GPU backing for an [`IndirectRing`]: one persistently-mapped
/// `vk::Buffer` per in-flight frame, sized `max_draws * IndirectDrawCommand::SIZE`
/// (§4.9). Allocation tries DEVICE_LOCAL|HOST_COHERENT, then HOST_COHERENT,
/// then plain HOST_VISIBLE (manual flush) in that order.
struct VulkanIndirectRing {
    ring: IndirectRing,
    buffers: Vec<VulkanBuffer>,
}

impl VulkanIndirectRing {
    fn create(
        device: &ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        max_draws: u32,
        buffering_frames: u32,
    ) -> anyhow::Result<Self> {
        let size = max_draws as u64 * IndirectDrawCommand::SIZE;
        let tiers = [
            (MemoryProperties::DEVICE_LOCAL | MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT, RingMemoryTier::DeviceLocalHostCoherent),
            (MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT, RingMemoryTier::HostCoherent),
            (MemoryProperties::HOST_VISIBLE, RingMemoryTier::HostOnly),
        ];

        for (memory_props, tier) in tiers {
            let description = BufferDescription {
                size,
                usage: crate::resources::BufferUsage::INDIRECT,
                memory_properties: memory_props,
                bind_on_create: true,
                persistently_mapped: true,
            };
            let built = (0..buffering_frames).map(|_| resources::create_buffer(device, memory_properties, &description)).collect::<anyhow::Result<Vec<_>>>();
            if let Ok(buffers) = built {
                return Ok(VulkanIndirectRing { ring: IndirectRing::new(max_draws, buffering_frames, tier), buffers });
            }
        }
        anyhow::bail!("no memory tier could back the indirect draw ring")
    }

    fn destroy(&mut self, device: &ash::Device) {
        for buffer in &mut self.buffers {
            resources::destroy_buffer(device, buffer);
        }
    }

    fn begin_frame(&mut self, frame_index: usize) {
        self.ring.begin_frame(frame_index);
    }

    /// Writes `commands` into the active buffer, flushing it if the memory
    /// tier requires it. Returns `None` on ring overflow (S6).
    fn write(&mut self, device: &ash::Device, commands: &[IndirectDrawCommand]) -> Option<RingAllocation> {
        let allocation = self.ring.alloc(commands.len() as u32)?;
        let buffer = &mut self.buffers[self.ring.get_current()];
        let base_offset = allocation.base_draw as u64 * IndirectDrawCommand::SIZE;
        for (index, command) in commands.iter().enumerate() {
            let bytes = command.to_bytes();
            let _ = write_mapped_or_fail(buffer, base_offset + index as u64 * IndirectDrawCommand::SIZE, &bytes);
        }
        if let Some((flush_offset, flush_size)) = self.ring.flush_range(allocation.base_draw, allocation.count) {
            let range = vk::MappedMemoryRange::builder().memory(buffer.memory).offset(flush_offset).size(flush_size).build();
            let _ = unsafe { device.flush_mapped_memory_ranges(&[range]) };
        }
        Some(allocation)
    }

    fn current_buffer(&self) -> vk::Buffer {
        self.buffers[self.ring.get_current()].buffer
    }
}

/// Everything that only exists once `initialize` has succeeded. Split out
/// of [`VulkanBackend`] so `shutdown`/re-`initialize` can drop and rebuild
/// it wholesale.
struct Device {
    instance: VulkanInstance,
    surface_loader: Surface,
    surface: vk::SurfaceKHR,
    selected: SelectedDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,

    swapchain: Swapchain,
    render_pass_registry: RenderPassRegistry,
    render_passes: FxHashMap<String, vk::RenderPass>,
    framebuffers: FxHashMap<String, Vec<vk::Framebuffer>>,

    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    image_available_semaphores: Vec<vk::Semaphore>,
    /// One per swapchain image, not per in-flight frame slot (§4.2): the
    /// present wait must use whichever semaphore was signalled for the
    /// specific image acquired, and images aren't acquired in slot order.
    render_finished_semaphores: Vec<vk::Semaphore>,
    /// One per in-flight frame slot, created signalled so the first
    /// `begin_frame` doesn't block (§4.2 step 2).
    in_flight_fences: Vec<vk::Fence>,

    frame_lifecycle: FrameLifecycle,
    resize_tracker: ResizeTracker,

    buffers: SlotMap<BufferHandle, VulkanBuffer>,
    textures: SlotMap<TextureHandle, VulkanTexture>,
    pipelines: SlotMap<PipelineHandle, PipelineEntry>,
    indirect_ring: VulkanIndirectRing,

    bound_vertex_buffer: Option<BufferHandle>,
    bound_index_buffer: Option<BufferHandle>,
    active_pipeline: Option<PipelineHandle>,
    active_pass_name: Option<String>,
}

/// Reference Vulkan backend, generic over any windowing crate whose window
/// type exposes raw handles (§6). The window is supplied once at
/// construction; [`RenderBackend::initialize`] is where the actual device
/// and swapchain get built, matching the reference API's two-step
/// construct-then-initialize lifecycle.
pub struct VulkanBackend<W> {
    window: W,
    renderer_config: RendererConfig,
    device: Option<Device>,
}

impl<W: HasRawWindowHandle + HasRawDisplayHandle> VulkanBackend<W> {
    pub fn new(window: W, renderer_config: RendererConfig) -> Self {
        VulkanBackend { window, renderer_config, device: None }
    }

    fn device(&self) -> Result<&Device> {
        self.device.as_ref().ok_or(ErrorKind::DeviceError)
    }

    fn device_mut(&mut self) -> Result<&mut Device> {
        self.device.as_mut().ok_or(ErrorKind::DeviceError)
    }
}

fn create_render_pass(device: &ash::Device, config: &RenderPassConfig) -> anyhow::Result<vk::RenderPass> {
    let color = render_pass::color_attachment(config);
    let mut attachments = vec![vk::AttachmentDescription::builder()
        .format(vk::Format::B8G8R8A8_SRGB)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(color.load_op)
        .store_op(color.store_op)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(color.initial_layout)
        .final_layout(color.final_layout)
        .build()];
    let color_ref = vk::AttachmentReference { attachment: 0, layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL };

    let depth = if config.domain == RenderPassDomain::Shadow {
        Some(render_pass::shadow_depth_attachment(config))
    } else {
        render_pass::depth_attachment(config)
    };
    let depth_ref = depth.map(|depth_attachment| {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(vk::Format::D32_SFLOAT)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(depth_attachment.load_op)
                .store_op(depth_attachment.store_op)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(depth_attachment.initial_layout)
                .final_layout(depth_attachment.final_layout)
                .build(),
        );
        vk::AttachmentReference { attachment: 1, layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL }
    });

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_ref));
    if let Some(depth_ref) = depth_ref.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }
    let subpass = subpass.build();

    let dependencies = render_pass::subpass_dependencies(config);

    let create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&create_info, None) }.context("vkCreateRenderPass failed")
}

/// Frees every pending instance descriptor-set release whose deferred
/// deadline has passed (§4.10).
fn reap_pending_releases(device: &ash::Device, entry: &mut PipelineEntry, total_frames: u64) {
    let mut index = 0;
    while index < entry.pending_releases.len() {
        let (_, eligible_at) = entry.pending_releases[index];
        if total_frames >= eligible_at {
            let (descriptor_set, _) = entry.pending_releases.swap_remove(index);
            pipeline::free_instance_descriptor_set(device, &entry.vk, descriptor_set);
        } else {
            index += 1;
        }
    }
}

fn create_shader_module(device: &ash::Device, path: &str) -> anyhow::Result<vk::ShaderModule> {
    let mut file = std::fs::File::open(path).with_context(|| format!("opening shader module {path}"))?;
    let code = ash::util::read_spv(&mut file).with_context(|| format!("reading SPIR-V from {path}"))?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
    unsafe { device.create_shader_module(&create_info, None) }.context("vkCreateShaderModule failed")
}

impl<W: HasRawWindowHandle + HasRawDisplayHandle> RenderBackend for VulkanBackend<W> {
    fn initialize(&mut self, requirements: &DeviceRequirements, window_extent: (u32, u32)) -> Result<()> {
        let init = || -> anyhow::Result<Device> {
            let required_extensions = ash_window::enumerate_required_extensions(self.window.raw_display_handle())?
                .iter()
                .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
                .collect::<Vec<_>>();
            let vk_instance = VulkanInstance::new(
                &self.renderer_config.application_name,
                &self.renderer_config.engine_name,
                requirements.enable_validation,
                &required_extensions,
            )?;

            let surface = unsafe {
                ash_window::create_surface(
                    &vk_instance.entry,
                    &vk_instance.instance,
                    self.window.raw_display_handle(),
                    self.window.raw_window_handle(),
                    None,
                )
            }?;
            let surface_loader = Surface::new(&vk_instance.entry, &vk_instance.instance);

            let selected = select_physical_device(&vk_instance.instance, &surface_loader, surface, requirements)?;
            let (logical_device, graphics_queue, present_queue) = device::create_logical_device(&vk_instance.instance, &selected)?;
            let memory_properties = unsafe { vk_instance.instance.get_physical_device_memory_properties(selected.physical_device) };

            let swapchain = Swapchain::create(
                &vk_instance.instance,
                &logical_device,
                &surface_loader,
                surface,
                selected.physical_device,
                selected.depth_format,
                window_extent,
                vk::SwapchainKHR::null(),
            )?;

            let render_pass_registry = RenderPassRegistry::new();
            let mut render_passes = FxHashMap::default();
            for name in [render_pass::BUILTIN_SKYBOX, render_pass::BUILTIN_WORLD, render_pass::BUILTIN_UI] {
                let config = render_pass_registry.get(name).expect("builtin pass is always registered");
                render_passes.insert(name.to_string(), create_render_pass(&logical_device, config)?);
            }
            let framebuffers = build_framebuffers(&logical_device, &swapchain, &render_passes)?;

            let command_pool_info = vk::CommandPoolCreateInfo::builder()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(selected.queue_families.graphics);
            let command_pool = unsafe { logical_device.create_command_pool(&command_pool_info, None) }.context("vkCreateCommandPool failed")?;

            let max_in_flight = swapchain.max_in_flight_frames;
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(max_in_flight);
            let command_buffers = unsafe { logical_device.allocate_command_buffers(&alloc_info) }.context("vkAllocateCommandBuffers failed")?;

            let image_count = swapchain.image_count();
            let semaphore_info = vk::SemaphoreCreateInfo::builder();
            let image_available_semaphores = (0..max_in_flight)
                .map(|_| unsafe { logical_device.create_semaphore(&semaphore_info, None) })
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("vkCreateSemaphore failed")?;
            let render_finished_semaphores = (0..image_count)
                .map(|_| unsafe { logical_device.create_semaphore(&semaphore_info, None) })
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("vkCreateSemaphore failed")?;
            let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
            let in_flight_fences = (0..max_in_flight)
                .map(|_| unsafe { logical_device.create_fence(&fence_info, None) })
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("vkCreateFence failed")?;

            let indirect_ring =
                VulkanIndirectRing::create(&logical_device, &memory_properties, self.renderer_config.indirect_ring_max_draws, max_in_flight)?;

            Ok(Device {
                instance: vk_instance,
                surface_loader,
                surface,
                selected,
                device: logical_device,
                graphics_queue,
                present_queue,
                memory_properties,
                swapchain,
                render_pass_registry,
                render_passes,
                framebuffers,
                command_pool,
                command_buffers,
                image_available_semaphores,
                render_finished_semaphores,
                in_flight_fences,
                frame_lifecycle: FrameLifecycle::new(max_in_flight, 0),
                resize_tracker: ResizeTracker::new(window_extent.0, window_extent.1),
                buffers: SlotMap::with_key(),
                textures: SlotMap::with_key(),
                pipelines: SlotMap::with_key(),
                indirect_ring,
                bound_vertex_buffer: None,
                bound_index_buffer: None,
                active_pipeline: None,
                active_pass_name: None,
            })
        };

        let mut built = init().map_err(|err| {
            tracing::error!("Vulkan initialization failed: {err:#}");
            ErrorKind::ResourceCreationFailed
        })?;
        let image_count = built.swapchain.image_count();
        built.frame_lifecycle = FrameLifecycle::new(built.swapchain.max_in_flight_frames, image_count);
        self.device = Some(built);
        Ok(())
    }

    fn shutdown(&mut self) {
        let Some(mut device) = self.device.take() else { return };
        unsafe {
            let _ = device.device.device_wait_idle();
            device.indirect_ring.destroy(&device.device);
            for (_, mut pipeline) in device.pipelines.drain() {
                pipeline::destroy_pipeline(&device.device, &mut pipeline.vk);
            }
            for (_, mut texture) in device.textures.drain() {
                resources::destroy_texture(&device.device, &mut texture);
            }
            for (_, mut buffer) in device.buffers.drain() {
                resources::destroy_buffer(&device.device, &mut buffer);
            }
            for semaphore in device.image_available_semaphores.iter().chain(&device.render_finished_semaphores) {
                device.device.destroy_semaphore(*semaphore, None);
            }
            for &fence in &device.in_flight_fences {
                device.device.destroy_fence(fence, None);
            }
            device.device.destroy_command_pool(device.command_pool, None);
            for framebuffers in device.framebuffers.values() {
                for &framebuffer in framebuffers {
                    device.device.destroy_framebuffer(framebuffer, None);
                }
            }
            for &render_pass in device.render_passes.values() {
                device.device.destroy_render_pass(render_pass, None);
            }
            device.swapchain.destroy(&device.device);
            device.surface_loader.destroy_surface(device.surface, None);
            device.device.destroy_device(None);
        }
    }

    fn on_resize(&mut self, width: u32, height: u32) -> Result<()> {
        let device = self.device_mut()?;
        if !device.resize_tracker.apply(width, height) {
            return Ok(());
        }
        recreate_swapchain(device, (width, height)).map_err(|err| {
            tracing::error!("swapchain recreation failed: {err:#}");
            ErrorKind::DeviceError
        })
    }

    fn get_device_information(&self) -> DeviceInformation {
        let Ok(device) = self.device() else {
            return DeviceInformation { device_name: String::new(), driver_version: 0, api_version: 0, is_discrete_gpu: false };
        };
        let name_bytes = device.selected.properties.device_name.iter().map(|&c| c as u8).take_while(|&c| c != 0).collect();
        DeviceInformation {
            device_name: String::from_utf8(name_bytes).unwrap_or_default(),
            driver_version: device.selected.properties.driver_version,
            api_version: device.selected.properties.api_version,
            is_discrete_gpu: device.selected.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU,
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        let device = self.device_mut()?;
        unsafe { device.device.device_wait_idle() }.map_err(|_| ErrorKind::DeviceError)
    }

    fn begin_frame(&mut self, _delta_time: f32) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };

        let slot = device.frame_lifecycle.current_frame() as usize;

        // §4.2 step 2: wait for this slot's command buffer to be free
        // before touching it again.
        let wait_fences = [device.in_flight_fences[slot]];
        if unsafe { device.device.wait_for_fences(&wait_fences, true, u64::MAX) }.is_err() {
            return ErrorKind::FramePreparationFailed;
        }

        let total_frames = device.frame_lifecycle.total_frames();
        let raw_device = &device.device;
        for entry in device.pipelines.values_mut() {
            reap_pending_releases(raw_device, entry, total_frames);
        }

        let acquired = unsafe {
            device.swapchain.loader.acquire_next_image(
                device.swapchain.handle,
                u64::MAX,
                device.image_available_semaphores[slot],
                vk::Fence::null(),
            )
        };
        let image_index = match acquired {
            Ok((index, _suboptimal)) => Some(index as usize),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => None,
            Err(_) => return ErrorKind::FramePreparationFailed,
        };

        // Only reset once the acquire actually succeeded; an OUT_OF_DATE
        // acquire must leave the fence signalled so the retry after
        // swapchain recreation doesn't wait on a fence nothing will ever
        // resignal.
        if image_index.is_some() && unsafe { device.device.reset_fences(&wait_fences) }.is_err() {
            return ErrorKind::FramePreparationFailed;
        }

        match device.frame_lifecycle.begin_frame(image_index) {
            Ok(BeginFrameOutcome::Started { image_index }) => {
                let command_buffer = device.command_buffers[slot];
                let reset = unsafe { device.device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty()) };
                if reset.is_err() {
                    return ErrorKind::CommandRecordingFailed;
                }
                let begin_info = vk::CommandBufferBeginInfo::builder();
                if unsafe { device.device.begin_command_buffer(command_buffer, &begin_info) }.is_err() {
                    return ErrorKind::CommandRecordingFailed;
                }
                device.bound_vertex_buffer = None;
                device.bound_index_buffer = None;
                device.active_pipeline = None;
                device.indirect_ring.begin_frame(slot);
                let _ = image_index;
                ErrorKind::None
            }
            Ok(BeginFrameOutcome::TimedOutSkipped) => ErrorKind::None,
            Err(kind) => kind,
        }
    }

    fn end_frame(&mut self, _delta_time: f32) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        if !device.frame_lifecycle.is_frame_active() {
            return ErrorKind::None;
        }

        let slot = device.frame_lifecycle.current_frame() as usize;
        // `frame_active` (checked above) implies `image_index` is set.
        let Some(image_index) = device.frame_lifecycle.image_index() else { return ErrorKind::None };
        let outcome = device.frame_lifecycle.end_frame();
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(kind) => return kind,
        };
        let _ = outcome.inserted_present_transition; // layout transition is implicit in the render pass's final_layout.

        let command_buffer = device.command_buffers[slot];
        if unsafe { device.device.end_command_buffer(command_buffer) }.is_err() {
            return ErrorKind::CommandRecordingFailed;
        }

        let wait_semaphores = [device.image_available_semaphores[slot]];
        // Indexed by the acquired swapchain image, not the in-flight slot:
        // presentation waits on whichever semaphore was signalled for this
        // specific image, and images aren't necessarily acquired in slot
        // order (§4.2).
        let signal_semaphores = [device.render_finished_semaphores[image_index]];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(std::slice::from_ref(&command_buffer))
            .signal_semaphores(&signal_semaphores);
        if unsafe { device.device.queue_submit(device.graphics_queue, &[submit_info.build()], device.in_flight_fences[slot]) }.is_err() {
            return ErrorKind::CommandRecordingFailed;
        }

        let image_indices = [image_index as u32];
        let swapchains = [device.swapchain.handle];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        match unsafe { device.swapchain.loader.queue_present(device.present_queue, &present_info) } {
            Ok(_) => ErrorKind::None,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => ErrorKind::None,
            Err(_) => ErrorKind::PresentationFailed,
        }
    }

    fn begin_render_pass(&mut self, domain: RenderPassDomain, _target: RenderTargetHandle) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        let Some(image_index) = device.frame_lifecycle.image_index() else { return ErrorKind::InvalidParameter };

        let name = match domain {
            RenderPassDomain::Skybox => render_pass::BUILTIN_SKYBOX,
            RenderPassDomain::World | RenderPassDomain::WorldTransparent => render_pass::BUILTIN_WORLD,
            RenderPassDomain::Ui => render_pass::BUILTIN_UI,
            _ => return ErrorKind::InvalidParameter,
        };
        let Some(config) = device.render_pass_registry.get(name).cloned() else { return ErrorKind::InvalidParameter };
        let Some(&render_pass) = device.render_passes.get(name) else { return ErrorKind::InvalidParameter };
        let Some(framebuffer) = device.framebuffers.get(name).and_then(|list| list.get(image_index)).copied() else {
            return ErrorKind::InvalidParameter;
        };

        let render_area = config.render_area.intersect_clamped(device.swapchain.extent.width, device.swapchain.extent.height);
        let clear_values = [
            vk::ClearValue { color: vk::ClearColorValue { float32: config.clear_color } },
            vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } },
        ];
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: render_area.x as i32, y: render_area.y as i32 },
                extent: vk::Extent2D { width: render_area.width, height: render_area.height },
            })
            .clear_values(&clear_values);

        let slot = device.frame_lifecycle.current_frame() as usize;
        let command_buffer = device.command_buffers[slot];
        unsafe { device.device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE) };

        device.frame_lifecycle.begin_render_pass(domain, name.to_string());
        device.active_pass_name = Some(name.to_string());
        ErrorKind::None
    }

    fn end_render_pass(&mut self) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        let terminal = device
            .active_pass_name
            .as_deref()
            .and_then(|name| device.render_pass_registry.get(name))
            .map(|config| !config.has_next())
            .unwrap_or(true);

        let slot = device.frame_lifecycle.current_frame() as usize;
        let command_buffer = device.command_buffers[slot];
        unsafe { device.device.cmd_end_render_pass(command_buffer) };

        device.frame_lifecycle.end_render_pass(terminal);
        device.active_pass_name = None;
        ErrorKind::None
    }

    fn create_buffer(&mut self, description: &BufferDescription, initial_data: Option<&[u8]>) -> Result<BufferHandle> {
        let device = self.device_mut()?;
        let buffer = resources::create_buffer(&device.device, &device.memory_properties, description)
            .map_err(|_| ErrorKind::ResourceCreationFailed)?;
        let handle = device.buffers.insert(buffer);
        if let Some(data) = initial_data {
            let outcome = self.upload_buffer(handle, 0, data);
            if outcome != ErrorKind::None {
                return Err(outcome);
            }
        }
        Ok(handle)
    }

    /// Requires the buffer to be persistently mapped (§4.6): a plain
    /// `memcpy` into host memory, no command buffer involved.
    fn update_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        let Some(buffer) = device.buffers.get_mut(handle) else { return ErrorKind::InvalidHandle };
        match write_mapped_or_fail(buffer, offset, data) {
            Ok(()) => ErrorKind::None,
            Err(kind) => kind,
        }
    }

    /// Works for both mapped and device-local-only buffers: mapped buffers
    /// get the direct `memcpy` path, device-local ones go through a
    /// one-shot staging buffer and `vkCmdCopyBuffer` (§4.6).
    fn upload_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        let Some(buffer) = device.buffers.get(handle) else { return ErrorKind::InvalidHandle };
        if buffer.mapped_ptr.is_some() {
            return self.update_buffer(handle, offset, data);
        }
        let target = buffer.buffer;
        match copy_buffer_to_buffer(device, target, offset, data) {
            Ok(()) => ErrorKind::None,
            Err(_) => ErrorKind::CommandRecordingFailed,
        }
    }

    fn destroy_buffer(&mut self, handle: BufferHandle) {
        let Ok(device) = self.device_mut() else { return };
        if let Some(mut buffer) = device.buffers.remove(handle) {
            resources::destroy_buffer(&device.device, &mut buffer);
        }
    }

    fn bind_vertex_buffer(&mut self, handle: BufferHandle, binding: u32) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        let Some(buffer) = device.buffers.get(handle) else { return ErrorKind::InvalidHandle };
        let slot = device.frame_lifecycle.current_frame() as usize;
        let command_buffer = device.command_buffers[slot];
        unsafe { device.device.cmd_bind_vertex_buffers(command_buffer, binding, &[buffer.buffer], &[0]) };
        device.bound_vertex_buffer = Some(handle);
        ErrorKind::None
    }

    fn bind_index_buffer(&mut self, handle: BufferHandle) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        let Some(buffer) = device.buffers.get(handle) else { return ErrorKind::InvalidHandle };
        let slot = device.frame_lifecycle.current_frame() as usize;
        let command_buffer = device.command_buffers[slot];
        unsafe { device.device.cmd_bind_index_buffer(command_buffer, buffer.buffer, 0, vk::IndexType::UINT32) };
        device.bound_index_buffer = Some(handle);
        ErrorKind::None
    }

    fn create_texture(&mut self, description: &TextureDescription, initial_data: Option<&[u8]>) -> Result<TextureHandle> {
        let device = self.device_mut()?;
        let texture = resources::create_texture(
            &device.device,
            &device.memory_properties,
            description,
            device.selected.supports_linear_blit,
            device.selected.properties.limits.max_sampler_anisotropy,
        )
        .map_err(|_| ErrorKind::ResourceCreationFailed)?;
        let handle = device.textures.insert(texture);
        if let Some(data) = initial_data {
            let region = TextureWriteRegion { mip: 0, layer: 0, x: 0, y: 0, width: description.width, height: description.height };
            let outcome = self.write_texture(handle, region, data);
            if outcome != ErrorKind::None {
                return Err(outcome);
            }
        }
        Ok(handle)
    }

    /// Rebuilds the image/view/sampler in place (same [`TextureHandle`]) when
    /// `description.generation` advances, e.g. after a format or size change
    /// (§4.7).
    fn update_texture(&mut self, handle: TextureHandle, description: &TextureDescription) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        let Some(current_generation) = device.textures.get(handle).map(|texture| texture.generation) else {
            return ErrorKind::InvalidHandle;
        };
        if current_generation == description.generation {
            return ErrorKind::None;
        }
        let replacement = match resources::create_texture(
            &device.device,
            &device.memory_properties,
            description,
            device.selected.supports_linear_blit,
            device.selected.properties.limits.max_sampler_anisotropy,
        ) {
            Ok(texture) => texture,
            Err(_) => return ErrorKind::ResourceCreationFailed,
        };
        let Some(slot) = device.textures.get_mut(handle) else { return ErrorKind::InvalidHandle };
        let mut old = std::mem::replace(slot, replacement);
        resources::destroy_texture(&device.device, &mut old);
        ErrorKind::None
    }

    fn write_texture(&mut self, handle: TextureHandle, region: TextureWriteRegion, data: &[u8]) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        let Some(texture) = device.textures.get(handle) else { return ErrorKind::InvalidHandle };

        let staging_description = BufferDescription {
            size: data.len() as u64,
            usage: crate::resources::BufferUsage::TRANSFER_SRC,
            memory_properties: crate::resources::MemoryProperties::HOST_VISIBLE | crate::resources::MemoryProperties::HOST_COHERENT,
            bind_on_create: true,
            persistently_mapped: true,
        };
        let Ok(mut staging) = resources::create_buffer(&device.device, &device.memory_properties, &staging_description) else {
            return ErrorKind::ResourceCreationFailed;
        };
        if write_mapped_or_fail(&mut staging, 0, data).is_err() {
            resources::destroy_buffer(&device.device, &mut staging);
            return ErrorKind::ResourceCreationFailed;
        }

        let result = copy_buffer_to_texture(device, texture.image, &staging, region, texture.mip_levels, texture.array_layers);
        resources::destroy_buffer(&device.device, &mut staging);
        if result.is_err() {
            return ErrorKind::CommandRecordingFailed;
        }
        ErrorKind::None
    }

    fn resize_texture(&mut self, handle: TextureHandle, width: u32, height: u32, preserve_contents: bool) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        let Some(old) = device.textures.get(handle) else { return ErrorKind::InvalidHandle };
        let _ = preserve_contents; // content migration would need a blit from the old image; out of scope without a live frame.
        let description = TextureDescription {
            width,
            height,
            channels: 4,
            texture_type: crate::resources::TextureType::Texture2D,
            wrap_u: crate::resources::WrapMode::Repeat,
            wrap_v: crate::resources::WrapMode::Repeat,
            wrap_w: crate::resources::WrapMode::Repeat,
            min_filter: crate::resources::FilterMode::Linear,
            mag_filter: crate::resources::FilterMode::Linear,
            use_anisotropy: false,
            properties: crate::resources::TextureProperties::empty(),
            generation: old.generation + 1,
        };
        self.update_texture(handle, &description)
    }

    fn destroy_texture(&mut self, handle: TextureHandle) {
        let Ok(device) = self.device_mut() else { return };
        if let Some(mut texture) = device.textures.remove(handle) {
            resources::destroy_texture(&device.device, &mut texture);
        }
    }

    fn create_graphics_pipeline(&mut self, description: &GraphicsPipelineDescription) -> Result<PipelineHandle> {
        let device = self.device_mut()?;
        let pass_name = match description.domain {
            RenderPassDomain::Skybox => render_pass::BUILTIN_SKYBOX,
            RenderPassDomain::World | RenderPassDomain::WorldTransparent => render_pass::BUILTIN_WORLD,
            RenderPassDomain::Ui => render_pass::BUILTIN_UI,
            _ => return Err(ErrorKind::InvalidParameter),
        };
        let &render_pass = device.render_passes.get(pass_name).ok_or(ErrorKind::InvalidParameter)?;

        let config = &description.shader_config;
        let mut shader_modules = Vec::with_capacity(config.stages.len());
        let mut stage_infos = Vec::with_capacity(config.stages.len());
        for stage in &config.stages {
            let module = create_shader_module(&device.device, &stage.filename).map_err(|_| ErrorKind::ShaderCompilationFailed)?;
            let stage_flag = match stage.kind {
                StageKind::Vertex => vk::ShaderStageFlags::VERTEX,
                StageKind::Fragment => vk::ShaderStageFlags::FRAGMENT,
            };
            let entry_point = std::ffi::CString::new(stage.entry_point.clone()).map_err(|_| ErrorKind::ShaderCompilationFailed)?;
            stage_infos.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage_flag)
                    .module(module)
                    .name(entry_point.as_c_str())
                    .build(),
            );
            shader_modules.push((module, entry_point));
        }

        let attributes: Vec<vk::VertexInputAttributeDescription> = config
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: 0,
                format: vertex_attribute_format(attribute.attr_type),
                offset: attribute.offset,
            })
            .collect();
        let binding = vk::VertexInputBindingDescription { binding: 0, stride: config.attribute_stride, input_rate: vk::VertexInputRate::VERTEX };

        let result = pipeline::create_graphics_pipeline(
            &device.device,
            config,
            description.domain,
            render_pass,
            device.swapchain.extent,
            binding,
            &attributes,
            &stage_infos,
            description.max_instance_states,
        );

        for (module, _) in &shader_modules {
            unsafe { device.device.destroy_shader_module(*module, None) };
        }

        let vk_pipeline = result.map_err(|_| ErrorKind::ResourceCreationFailed)?;
        let entry = PipelineEntry {
            vk: vk_pipeline,
            shader_config: config.clone(),
            domain: description.domain,
            descriptor_cache: DescriptorWriteCache::new(),
            instance_sets: SlotMap::with_key(),
            pending_releases: Vec::new(),
        };
        Ok(device.pipelines.insert(entry))
    }

    fn destroy_pipeline(&mut self, handle: PipelineHandle) {
        let Ok(device) = self.device_mut() else { return };
        if let Some(mut entry) = device.pipelines.remove(handle) {
            pipeline::destroy_pipeline(&device.device, &mut entry.vk);
        }
    }

    fn acquire_instance_state(&mut self, pipeline: PipelineHandle) -> Result<InstanceStateHandle> {
        let device = self.device_mut()?;
        let total_frames = device.frame_lifecycle.total_frames();
        let raw_device = &device.device;
        let entry = device.pipelines.get_mut(pipeline).ok_or(ErrorKind::InvalidHandle)?;
        reap_pending_releases(raw_device, entry, total_frames);
        let descriptor_set = pipeline::allocate_instance_descriptor_set(raw_device, &entry.vk).map_err(|_| ErrorKind::ResourceCreationFailed)?;
        Ok(entry.instance_sets.insert(InstanceSlot { descriptor_set, last_render_frame: total_frames }))
    }

    /// A descriptor set may still be referenced by a command buffer that
    /// hasn't finished executing, so freeing it outright is only safe once
    /// `max_in_flight_frames` frames have passed since it was last written
    /// (§4.10). Until then it's queued in `pending_releases` and reaped
    /// lazily on the next `acquire`/`release`/`begin_frame`.
    fn release_instance_state(&mut self, pipeline: PipelineHandle, handle: InstanceStateHandle) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        let total_frames = device.frame_lifecycle.total_frames();
        let max_in_flight = device.swapchain.max_in_flight_frames as u64;
        let raw_device = &device.device;
        let Some(entry) = device.pipelines.get_mut(pipeline) else { return ErrorKind::InvalidHandle };
        reap_pending_releases(raw_device, entry, total_frames);
        let Some(slot) = entry.instance_sets.remove(handle) else { return ErrorKind::InvalidHandle };
        if total_frames.saturating_sub(slot.last_render_frame) >= max_in_flight {
            pipeline::free_instance_descriptor_set(raw_device, &entry.vk, slot.descriptor_set);
        } else {
            entry.pending_releases.push((slot.descriptor_set, slot.last_render_frame + max_in_flight));
        }
        ErrorKind::None
    }

    fn update_pipeline_state(&mut self, pipeline: PipelineHandle, update: &PipelineStateUpdate) -> ErrorKind {
        let Ok(device) = self.device_mut() else { return ErrorKind::DeviceError };
        let total_frames = device.frame_lifecycle.total_frames();
        let textures = &device.textures;
        let Some(entry) = device.pipelines.get_mut(pipeline) else { return ErrorKind::InvalidHandle };

        // Upper bound on pushes so the `WriteDescriptorSet` builders below
        // never capture a pointer into a `Vec` that later reallocates.
        let mut buffer_infos = Vec::with_capacity(2);
        let mut image_infos = Vec::with_capacity(update.instance_textures.len());
        let mut writes = Vec::new();

        if let Some(bytes) = &update.global_uniform_bytes {
            if entry.descriptor_cache.apply_global_uniform(bytes) {
                // Actual UBO bytes are copied by the caller via `update_buffer`
                // against the pipeline's global UBO; this only re-issues the
                // descriptor write when the cache says content changed.
                buffer_infos.push(vk::DescriptorBufferInfo { buffer: vk::Buffer::null(), offset: 0, range: bytes.len() as u64 });
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(entry.vk.global_descriptor_set)
                        .dst_binding(0)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(std::slice::from_ref(buffer_infos.last().unwrap()))
                        .build(),
                );
            }
        }

        if let Some(instance_handle) = update.instance {
            let instance_key = instance_handle.data().as_ffi() as u32;

            if let Some(bytes) = &update.instance_uniform_bytes {
                if entry.descriptor_cache.apply_instance_uniform(instance_key, bytes) {
                    if let Some(slot) = entry.instance_sets.get(instance_handle) {
                        buffer_infos.push(vk::DescriptorBufferInfo { buffer: vk::Buffer::null(), offset: 0, range: bytes.len() as u64 });
                        writes.push(
                            vk::WriteDescriptorSet::builder()
                                .dst_set(slot.descriptor_set)
                                .dst_binding(0)
                                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                                .buffer_info(std::slice::from_ref(buffer_infos.last().unwrap()))
                                .build(),
                        );
                    }
                }
            }

            if !update.instance_textures.is_empty() {
                let dirty_count = entry.descriptor_cache.apply_instance_textures(instance_key, &update.instance_textures);
                // The cache only reports how many slots changed, not which
                // ones, so a nonzero count re-issues every texture binding
                // for this instance.
                if dirty_count > 0 {
                    if let Some(slot) = entry.instance_sets.get(instance_handle) {
                        for (binding_offset, &texture_handle) in update.instance_textures.iter().enumerate() {
                            let Some(texture) = textures.get(texture_handle) else { continue };
                            image_infos.push(vk::DescriptorImageInfo {
                                sampler: texture.sampler,
                                image_view: texture.view,
                                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                            });
                            writes.push(
                                vk::WriteDescriptorSet::builder()
                                    .dst_set(slot.descriptor_set)
                                    .dst_binding(1 + binding_offset as u32)
                                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                                    .image_info(std::slice::from_ref(image_infos.last().unwrap()))
                                    .build(),
                            );
                        }
                    }
                }
            }

            if let Some(slot) = entry.instance_sets.get_mut(instance_handle) {
                slot.last_render_frame = total_frames;
            }
        }

        if !writes.is_empty() {
            unsafe { device.device.update_descriptor_sets(&writes, &[]) };
        }
        ErrorKind::None
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        let Ok(device) = self.device_mut() else { return };
        let slot = device.frame_lifecycle.current_frame() as usize;
        let command_buffer = device.command_buffers[slot];
        unsafe { device.device.cmd_draw(command_buffer, vertex_count, instance_count, first_vertex, first_instance) };
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) {
        let Ok(device) = self.device_mut() else { return };
        let slot = device.frame_lifecycle.current_frame() as usize;
        let command_buffer = device.command_buffers[slot];
        unsafe { device.device.cmd_draw_indexed(command_buffer, index_count, instance_count, first_index, vertex_offset, first_instance) };
    }

    fn get_and_reset_descriptor_writes_avoided(&mut self, pipeline: PipelineHandle) -> u64 {
        let Ok(device) = self.device_mut() else { return 0 };
        device.pipelines.get_mut(pipeline).map(|entry| entry.descriptor_cache.reset_writes_avoided()).unwrap_or(0)
    }
}

fn vertex_attribute_format(attr_type: crate::shader_config::AttributeType) -> vk::Format {
    use crate::shader_config::AttributeType as T;
    match attr_type {
        T::Vec2 => vk::Format::R32G32_SFLOAT,
        T::Vec3 => vk::Format::R32G32B32_SFLOAT,
        T::Vec4 => vk::Format::R32G32B32A32_SFLOAT,
        T::Mat4 => vk::Format::R32G32B32A32_SFLOAT,
        T::Int32 => vk::Format::R32_SINT,
        T::Uint32 => vk::Format::R32_UINT,
    }
}

fn write_mapped_or_fail(buffer: &mut VulkanBuffer, offset: u64, data: &[u8]) -> Result<()> {
    let Some(ptr) = buffer.mapped_ptr else { return Err(ErrorKind::InvalidParameter) };
    if offset + data.len() as u64 > buffer.size {
        return Err(ErrorKind::InvalidParameter);
    }
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len()) };
    Ok(())
}

/// One-shot staging upload into a non-mapped (device-local) buffer (§4.6).
fn copy_buffer_to_buffer(device: &Device, target: vk::Buffer, offset: u64, data: &[u8]) -> anyhow::Result<()> {
    let staging_description = BufferDescription {
        size: data.len() as u64,
        usage: crate::resources::BufferUsage::TRANSFER_SRC,
        memory_properties: crate::resources::MemoryProperties::HOST_VISIBLE | crate::resources::MemoryProperties::HOST_COHERENT,
        bind_on_create: true,
        persistently_mapped: true,
    };
    let mut staging = resources::create_buffer(&device.device, &device.memory_properties, &staging_description)?;
    write_mapped_or_fail(&mut staging, 0, data).map_err(|_| anyhow::anyhow!("staging buffer write out of bounds"))?;

    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(device.command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }.context("vkAllocateCommandBuffers failed")?[0];
    let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe { device.device.begin_command_buffer(command_buffer, &begin_info) }.context("vkBeginCommandBuffer failed")?;

    let region = vk::BufferCopy { src_offset: 0, dst_offset: offset, size: data.len() as u64 };
    unsafe { device.device.cmd_copy_buffer(command_buffer, staging.buffer, target, &[region]) };

    unsafe { device.device.end_command_buffer(command_buffer) }.context("vkEndCommandBuffer failed")?;
    let submit_info = vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&command_buffer));
    unsafe {
        device.device.queue_submit(device.graphics_queue, &[submit_info.build()], vk::Fence::null())?;
        device.device.queue_wait_idle(device.graphics_queue)?;
        device.device.free_command_buffers(device.command_pool, &[command_buffer]);
    }
    resources::destroy_buffer(&device.device, &mut staging);
    Ok(())
}

/// Blits level 0 down into every subsequent mip level, halving the extent
/// each step (§4.7 C10). Only called for a base-level upload; writes into a
/// non-zero mip bypass it since there's nothing to derive it from.
fn generate_mip_chain(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    base_width: u32,
    base_height: u32,
    mip_levels: u32,
    array_layers: u32,
) {
    let mut mip_width = base_width as i32;
    let mut mip_height = base_height as i32;

    for mip in 1..mip_levels {
        let source_ready = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(mip - 1)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(array_layers)
                    .build(),
            )
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .build();
        unsafe {
            device.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[source_ready],
            )
        };

        let next_width = (mip_width / 2).max(1);
        let next_height = (mip_height / 2).max(1);
        let blit = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: mip - 1,
                base_array_layer: 0,
                layer_count: array_layers,
            },
            src_offsets: [vk::Offset3D { x: 0, y: 0, z: 0 }, vk::Offset3D { x: mip_width, y: mip_height, z: 1 }],
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: mip,
                base_array_layer: 0,
                layer_count: array_layers,
            },
            dst_offsets: [vk::Offset3D { x: 0, y: 0, z: 0 }, vk::Offset3D { x: next_width, y: next_height, z: 1 }],
        };
        unsafe {
            device.device.cmd_blit_image(
                command_buffer,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            )
        };

        mip_width = next_width;
        mip_height = next_height;
    }
}

fn copy_buffer_to_texture(
    device: &Device,
    image: vk::Image,
    staging: &VulkanBuffer,
    region: TextureWriteRegion,
    mip_levels: u32,
    array_layers: u32,
) -> anyhow::Result<()> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(device.command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }.context("vkAllocateCommandBuffers failed")?[0];

    let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe { device.device.begin_command_buffer(command_buffer, &begin_info) }.context("vkBeginCommandBuffer failed")?;

    let subresource_range = vk::ImageSubresourceRange::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(mip_levels)
        .base_array_layer(0)
        .layer_count(array_layers)
        .build();

    let to_transfer = vk::ImageMemoryBarrier::builder()
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .image(image)
        .subresource_range(subresource_range)
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .build();
    unsafe {
        device.device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        )
    };

    let copy_region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: region.mip,
            base_array_layer: region.layer,
            layer_count: 1,
        },
        image_offset: vk::Offset3D { x: region.x as i32, y: region.y as i32, z: 0 },
        image_extent: vk::Extent3D { width: region.width, height: region.height, depth: 1 },
    };
    unsafe {
        device.device.cmd_copy_buffer_to_image(
            command_buffer,
            staging.buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[copy_region],
        )
    };

    if region.mip == 0 && mip_levels > 1 {
        generate_mip_chain(device, command_buffer, image, region.width, region.height, mip_levels, array_layers);

        // `generate_mip_chain` leaves every level but the last in
        // TRANSFER_SRC_OPTIMAL (it was read from as a blit source); the
        // last level was only ever written to, so it's still
        // TRANSFER_DST_OPTIMAL. Each needs its own barrier.
        let blitted_range = vk::ImageSubresourceRange::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(mip_levels - 1)
            .base_array_layer(0)
            .layer_count(array_layers)
            .build();
        let last_level_range = vk::ImageSubresourceRange::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(mip_levels - 1)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(array_layers)
            .build();
        let to_shader_read = [
            vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .image(image)
                .subresource_range(blitted_range)
                .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .build(),
            vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .image(image)
                .subresource_range(last_level_range)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .build(),
        ];
        unsafe {
            device.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &to_shader_read,
            )
        };
    } else {
        let to_shader_read = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image(image)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .build();
        unsafe {
            device.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader_read],
            )
        };
    }

    unsafe { device.device.end_command_buffer(command_buffer) }.context("vkEndCommandBuffer failed")?;
    let submit_info = vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&command_buffer));
    unsafe {
        device.device.queue_submit(device.graphics_queue, &[submit_info.build()], vk::Fence::null())?;
        device.device.queue_wait_idle(device.graphics_queue)?;
        device.device.free_command_buffers(device.command_pool, &[command_buffer]);
    }
    Ok(())
}

fn build_framebuffers(
    device: &ash::Device,
    swapchain: &Swapchain,
    render_passes: &FxHashMap<String, vk::RenderPass>,
) -> anyhow::Result<FxHashMap<String, Vec<vk::Framebuffer>>> {
    let mut framebuffers = FxHashMap::default();
    for (name, &render_pass) in render_passes {
        let mut per_image = Vec::with_capacity(swapchain.image_views.len());
        for &view in &swapchain.image_views {
            let attachments = [view];
            let create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(swapchain.extent.width)
                .height(swapchain.extent.height)
                .layers(1);
            per_image.push(unsafe { device.create_framebuffer(&create_info, None) }.context("vkCreateFramebuffer failed")?);
        }
        framebuffers.insert(name.clone(), per_image);
    }
    Ok(framebuffers)
}

/// §4.3 swapchain recreation protocol: wait idle, destroy the old
/// framebuffers/swapchain, build the replacement passing the outgoing
/// handle as `old_swapchain`, rebuild framebuffers, resize the
/// `images_in_flight` table to match the new image count.
fn recreate_swapchain(device: &mut Device, window_extent: (u32, u32)) -> anyhow::Result<()> {
    unsafe { device.device.device_wait_idle() }?;

    let old_max_in_flight = device.swapchain.max_in_flight_frames;
    let total_frames = device.frame_lifecycle.total_frames();

    for framebuffers in device.framebuffers.values() {
        for &framebuffer in framebuffers {
            unsafe { device.device.destroy_framebuffer(framebuffer, None) };
        }
    }
    device.framebuffers.clear();

    let old_handle = device.swapchain.handle;
    let mut new_swapchain = Swapchain::create(
        &device.instance.instance,
        &device.device,
        &device.surface_loader,
        device.surface,
        device.selected.physical_device,
        device.selected.depth_format,
        window_extent,
        old_handle,
    )?;
    device.swapchain.destroy(&device.device);
    std::mem::swap(&mut device.swapchain, &mut new_swapchain);

    device.framebuffers = build_framebuffers(&device.device, &device.swapchain, &device.render_passes)?;

    // `render_finished_semaphores` is sized to the image count, which can
    // change on a resize independently of `max_in_flight_frames`.
    for &semaphore in &device.render_finished_semaphores {
        unsafe { device.device.destroy_semaphore(semaphore, None) };
    }
    let image_count = device.swapchain.image_count();
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    device.render_finished_semaphores = (0..image_count)
        .map(|_| unsafe { device.device.create_semaphore(&semaphore_info, None) })
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("vkCreateSemaphore failed")?;

    let max_in_flight = device.swapchain.max_in_flight_frames;
    if max_in_flight != old_max_in_flight {
        for &fence in &device.in_flight_fences {
            unsafe { device.device.destroy_fence(fence, None) };
        }
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        device.in_flight_fences = (0..max_in_flight)
            .map(|_| unsafe { device.device.create_fence(&fence_info, None) })
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("vkCreateFence failed")?;

        for &semaphore in &device.image_available_semaphores {
            unsafe { device.device.destroy_semaphore(semaphore, None) };
        }
        device.image_available_semaphores = (0..max_in_flight)
            .map(|_| unsafe { device.device.create_semaphore(&semaphore_info, None) })
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("vkCreateSemaphore failed")?;

        unsafe { device.device.free_command_buffers(device.command_pool, &device.command_buffers) };
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(max_in_flight);
        device.command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }.context("vkAllocateCommandBuffers failed")?;

        let max_draws = device.indirect_ring.ring.max_draws();
        device.indirect_ring.destroy(&device.device);
        device.indirect_ring = VulkanIndirectRing::create(&device.device, &device.memory_properties, max_draws, max_in_flight)?;
    }

    device.frame_lifecycle = FrameLifecycle::new(max_in_flight, image_count);
    // `FrameLifecycle::new` always starts `total_frames()` at 0; restore it
    // so instance-state release gating (§4.10) keeps a single monotonically
    // increasing clock across a resize.
    device.frame_lifecycle.fast_forward_total_frames(total_frames);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_attribute_format_covers_every_type() {
        use crate::shader_config::AttributeType as T;
        assert_eq!(vertex_attribute_format(T::Vec2), vk::Format::R32G32_SFLOAT);
        assert_eq!(vertex_attribute_format(T::Vec3), vk::Format::R32G32B32_SFLOAT);
        assert_eq!(vertex_attribute_format(T::Int32), vk::Format::R32_SINT);
    }
}

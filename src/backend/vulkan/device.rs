//! Physical device selection and logical device/queue creation (C3).

use std::ffi::CStr;

use anyhow::{bail, Context, Result};
use ash::extensions::khr::Surface;
use ash::vk;

use crate::config::DeviceRequirements;

const SWAPCHAIN_EXTENSION: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_KHR_swapchain\0") };

pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub queue_families: QueueFamilyIndices,
    pub depth_format: vk::Format,
    pub supports_sampler_anisotropy: bool,
    pub supports_linear_blit: bool,
}

/// Candidate depth formats in preference order (first that supports
/// `DEPTH_STENCIL_ATTACHMENT` as an optimal-tiling feature wins).
const DEPTH_FORMAT_CANDIDATES: &[vk::Format] =
    &[vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT, vk::Format::D24_UNORM_S8_UINT];

pub fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &Surface,
    surface: vk::SurfaceKHR,
    requirements: &DeviceRequirements,
) -> Result<SelectedDevice> {
    let candidates = unsafe { instance.enumerate_physical_devices() }.context("vkEnumeratePhysicalDevices failed")?;
    if candidates.is_empty() {
        bail!("no Vulkan-capable physical devices found");
    }

    let mut best: Option<(i32, SelectedDevice)> = None;
    for physical_device in candidates {
        let Some((score, device)) = score_device(instance, surface_loader, surface, physical_device, requirements) else {
            continue;
        };
        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            best = Some((score, device));
        }
    }

    best.map(|(_, device)| device).context("no physical device satisfies the configured requirements")
}

fn score_device(
    instance: &ash::Instance,
    surface_loader: &Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    requirements: &DeviceRequirements,
) -> Option<(i32, SelectedDevice)> {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let features = unsafe { instance.get_physical_device_features(physical_device) };

    if requirements.require_sampler_anisotropy && features.sampler_anisotropy == vk::FALSE {
        return None;
    }

    let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }.ok()?;
    let has_swapchain = extensions
        .iter()
        .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == SWAPCHAIN_EXTENSION);
    if !has_swapchain {
        return None;
    }
    for required in &requirements.required_extensions {
        let required = to_cstring_lossy(required);
        let found = extensions.iter().any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == required.as_c_str());
        if !found {
            return None;
        }
    }

    let queue_families = find_queue_families(instance, surface_loader, surface, physical_device)?;
    let depth_format = pick_depth_format(instance, physical_device)?;

    let mut score = 0;
    if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        score += if requirements.prefer_discrete_gpu { 1000 } else { 0 };
    }
    score += properties.limits.max_image_dimension2_d as i32 / 1024;

    let supports_linear_blit = supports_linear_blit_for_rgba8(instance, physical_device);

    Some((
        score,
        SelectedDevice {
            physical_device,
            properties,
            queue_families,
            depth_format,
            supports_sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            supports_linear_blit,
        },
    ))
}

fn to_cstring_lossy(s: &str) -> std::ffi::CString {
    std::ffi::CString::new(s).unwrap_or_default()
}

fn find_queue_families(
    instance: &ash::Instance,
    surface_loader: &Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Option<QueueFamilyIndices> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let graphics = families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))?
        as u32;

    let present = (0..families.len() as u32).find(|&index| {
        unsafe { surface_loader.get_physical_device_surface_support(physical_device, index, surface) }.unwrap_or(false)
    })?;

    Some(QueueFamilyIndices { graphics, present })
}

fn pick_depth_format(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Option<vk::Format> {
    DEPTH_FORMAT_CANDIDATES.iter().copied().find(|&format| {
        let properties = unsafe { instance.get_physical_device_format_properties(physical_device, format) };
        properties.optimal_tiling_features.contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

fn supports_linear_blit_for_rgba8(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> bool {
    let properties = unsafe { instance.get_physical_device_format_properties(physical_device, vk::Format::R8G8B8A8_UNORM) };
    properties.optimal_tiling_features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
}

pub fn create_logical_device(
    instance: &ash::Instance,
    selected: &SelectedDevice,
) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
    let unique_families: Vec<u32> = {
        let mut families = vec![selected.queue_families.graphics, selected.queue_families.present];
        families.sort_unstable();
        families.dedup();
        families
    };

    let priorities = [1.0f32];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| vk::DeviceQueueCreateInfo::builder().queue_family_index(family).queue_priorities(&priorities).build())
        .collect();

    let extension_ptrs = [SWAPCHAIN_EXTENSION.as_ptr()];
    let enabled_features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(selected.supports_sampler_anisotropy).build();

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_ptrs)
        .enabled_features(&enabled_features);

    let device = unsafe { instance.create_device(selected.physical_device, &create_info, None) }.context("vkCreateDevice failed")?;

    let graphics_queue = unsafe { device.get_device_queue(selected.queue_families.graphics, 0) };
    let present_queue = unsafe { device.get_device_queue(selected.queue_families.present, 0) };

    Ok((device, graphics_queue, present_queue))
}

/// First memory type whose bits match `type_filter` and whose properties
/// are a superset of `required` (§4.6 step 3).
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&index| {
        let type_matches = type_filter & (1 << index) != 0;
        let properties_match = memory_properties.memory_types[index as usize].property_flags.contains(required);
        type_matches && properties_match
    })
}

//! Swapchain selection, (re)creation, and the depth attachment (C4, §4.3).

use anyhow::{Context, Result};
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk;

use crate::config::BUFFERING_FRAMES;

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .unwrap_or(formats[0])
}

pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window_pixel_size: (u32, u32)) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window_pixel_size.0.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        height: window_pixel_size.1.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    }
}

pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

pub fn max_in_flight_frames(image_count: u32) -> u32 {
    image_count.min(BUFFERING_FRAMES)
}

/// Live swapchain state: handle, chosen format/extent, color image views,
/// and the shared depth attachment (§3 Swapchain).
pub struct Swapchain {
    pub loader: SwapchainLoader,
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub depth_format: vk::Format,
    pub depth_image: vk::Image,
    pub depth_image_view: vk::ImageView,
    pub depth_memory: vk::DeviceMemory,
    pub max_in_flight_frames: u32,
}

impl Swapchain {
    /// Builds (or rebuilds, passing the previous handle as `old_swapchain`)
    /// the swapchain and its image views (§4.3 recreation protocol step 5).
    /// Depth image (re)allocation is left to the caller since it needs the
    /// device's memory-type table.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        instance: &ash::Instance,
        device: &ash::Device,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
        depth_format: vk::Format,
        window_pixel_size: (u32, u32),
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let capabilities = unsafe { surface_loader.get_physical_device_surface_capabilities(physical_device, surface) }
            .context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR failed")?;
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface) }
            .context("vkGetPhysicalDeviceSurfaceFormatsKHR failed")?;
        let present_modes = unsafe { surface_loader.get_physical_device_surface_present_modes(physical_device, surface) }
            .context("vkGetPhysicalDeviceSurfacePresentModesKHR failed")?;

        let surface_format = choose_surface_format(&formats);
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&capabilities, window_pixel_size);
        let image_count = choose_image_count(&capabilities);

        let loader = SwapchainLoader::new(instance, device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }.context("vkCreateSwapchainKHR failed")?;
        let images = unsafe { loader.get_swapchain_images(handle) }.context("vkGetSwapchainImagesKHR failed")?;

        let image_views = images
            .iter()
            .map(|&image| create_color_view(device, image, surface_format.format))
            .collect::<Result<Vec<_>>>()?;

        Ok(Swapchain {
            loader,
            handle,
            format: surface_format.format,
            extent,
            images,
            image_views,
            depth_format,
            depth_image: vk::Image::null(),
            depth_image_view: vk::ImageView::null(),
            depth_memory: vk::DeviceMemory::null(),
            max_in_flight_frames: max_in_flight_frames(image_count),
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Destroys only what this type owns directly: image views and the
    /// swapchain handle. The depth attachment and the swapchain's raw
    /// color images (owned by the swapchain itself) are not destroyed
    /// individually. Callers pass the outgoing handle as `old_swapchain`
    /// to [`Swapchain::create`] when recreating, per the driver-smoothing
    /// hint in §4.3 step 5.
    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            if self.depth_image_view != vk::ImageView::null() {
                device.destroy_image_view(self.depth_image_view, None);
            }
            if self.depth_image != vk::Image::null() {
                device.destroy_image(self.depth_image, None);
            }
            if self.depth_memory != vk::DeviceMemory::null() {
                device.free_memory(self.depth_memory, None);
            }
            self.loader.destroy_swapchain(self.handle, None);
        }
    }
}

fn create_color_view(device: &ash::Device, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
    let subresource_range = vk::ImageSubresourceRange::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
        .build();
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(subresource_range);
    unsafe { device.create_image_view(&create_info, None) }.context("vkCreateImageView failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_srgb_bgra8_when_available() {
        let formats = vec![
            vk::SurfaceFormatKHR { format: vk::Format::R8G8B8A8_UNORM, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR },
            vk::SurfaceFormatKHR { format: vk::Format::B8G8R8A8_SRGB, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR },
        ];
        let chosen = choose_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_format_when_preferred_is_absent() {
        let formats = vec![vk::SurfaceFormatKHR { format: vk::Format::R8G8B8A8_UNORM, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR }];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn prefers_mailbox_present_mode() {
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO]), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn max_in_flight_frames_is_capped_by_buffering_frames() {
        assert_eq!(max_in_flight_frames(2), 2);
        assert_eq!(max_in_flight_frames(3), 3);
        assert_eq!(max_in_flight_frames(4), BUFFERING_FRAMES);
    }
}

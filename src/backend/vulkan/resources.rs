//! Buffer and texture backing storage (C7).
//!
//! Each live [`VulkanBuffer`] owns a [`crate::sub_allocator::OffsetAllocator`]
//! over its logical byte range, matching §4.6 step 6. Memory-type selection
//! retries without `DEVICE_LOCAL` once before failing (§4.6 step 3).

use anyhow::{bail, Context, Result};
use ash::vk;

use crate::backend::vulkan::device::find_memory_type;
use crate::resources::{BufferDescription, MemoryProperties, TextureDescription};
use crate::sub_allocator::OffsetAllocator;

pub struct VulkanBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: u64,
    pub mapped_ptr: Option<*mut u8>,
    pub allocator: OffsetAllocator,
}

fn to_vk_usage(usage: crate::resources::BufferUsage) -> vk::BufferUsageFlags {
    use crate::resources::BufferUsage as U;
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(U::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(U::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(U::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(U::INDIRECT) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if usage.contains(U::TRANSFER_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(U::TRANSFER_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    flags
}

fn to_vk_memory_properties(properties: MemoryProperties) -> vk::MemoryPropertyFlags {
    let mut flags = vk::MemoryPropertyFlags::empty();
    if properties.contains(MemoryProperties::DEVICE_LOCAL) {
        flags |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
    }
    if properties.contains(MemoryProperties::HOST_VISIBLE) {
        flags |= vk::MemoryPropertyFlags::HOST_VISIBLE;
    }
    if properties.contains(MemoryProperties::HOST_COHERENT) {
        flags |= vk::MemoryPropertyFlags::HOST_COHERENT;
    }
    flags
}

/// §4.6 steps 2-6.
pub fn create_buffer(
    device: &ash::Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    description: &BufferDescription,
) -> Result<VulkanBuffer> {
    let create_info = vk::BufferCreateInfo::builder()
        .size(description.size)
        .usage(to_vk_usage(description.usage))
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { device.create_buffer(&create_info, None) }.context("vkCreateBuffer failed")?;
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

    let mut wanted = to_vk_memory_properties(description.memory_properties);
    let mut memory_type = find_memory_type(memory_properties, requirements.memory_type_bits, wanted);
    if memory_type.is_none() && wanted.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        wanted.remove(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        memory_type = find_memory_type(memory_properties, requirements.memory_type_bits, wanted);
    }
    let Some(memory_type) = memory_type else {
        unsafe { device.destroy_buffer(buffer, None) };
        bail!("no memory type satisfies the requested buffer properties");
    };

    let alloc_info = vk::MemoryAllocateInfo::builder().allocation_size(requirements.size).memory_type_index(memory_type);
    let memory = unsafe { device.allocate_memory(&alloc_info, None) }.context("vkAllocateMemory failed")?;

    if description.bind_on_create {
        unsafe { device.bind_buffer_memory(buffer, memory, 0) }.context("vkBindBufferMemory failed")?;
    }

    let mapped_ptr = if description.persistently_mapped {
        let ptr = unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
            .context("vkMapMemory failed")?;
        Some(ptr as *mut u8)
    } else {
        None
    };

    Ok(VulkanBuffer { buffer, memory, size: description.size, mapped_ptr, allocator: OffsetAllocator::new(description.size) })
}

pub fn destroy_buffer(device: &ash::Device, buffer: &mut VulkanBuffer) {
    unsafe {
        if buffer.mapped_ptr.is_some() {
            device.unmap_memory(buffer.memory);
        }
        device.destroy_buffer(buffer.buffer, None);
        device.free_memory(buffer.memory, None);
    }
}

pub struct VulkanTexture {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub generation: u64,
}

fn to_vk_filter(filter: crate::resources::FilterMode) -> vk::Filter {
    match filter {
        crate::resources::FilterMode::Nearest => vk::Filter::NEAREST,
        crate::resources::FilterMode::Linear => vk::Filter::LINEAR,
    }
}

fn to_vk_address_mode(wrap: crate::resources::WrapMode) -> vk::SamplerAddressMode {
    match wrap {
        crate::resources::WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
        crate::resources::WrapMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        crate::resources::WrapMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
    }
}

/// §4.7: cube maps are always 6 array layers with a single mip level and
/// clamp-to-edge sampling on every axis, regardless of the description's
/// requested wrap modes; ordinary 2D textures use the description as-is.
fn cube_aware_image_params(
    description: &TextureDescription,
    supports_linear_blit: bool,
) -> (bool, u32, u32, (vk::SamplerAddressMode, vk::SamplerAddressMode, vk::SamplerAddressMode)) {
    let is_cube = description.texture_type == crate::resources::TextureType::CubeMap;
    let array_layers = if is_cube { 6 } else { 1 };
    let mip_levels = if is_cube { 1 } else { description.mip_levels(supports_linear_blit) };
    let address_modes = if is_cube {
        (vk::SamplerAddressMode::CLAMP_TO_EDGE, vk::SamplerAddressMode::CLAMP_TO_EDGE, vk::SamplerAddressMode::CLAMP_TO_EDGE)
    } else {
        (to_vk_address_mode(description.wrap_u), to_vk_address_mode(description.wrap_v), to_vk_address_mode(description.wrap_w))
    };
    (is_cube, array_layers, mip_levels, address_modes)
}

/// §4.7: dispatches on `texture_type`; cube maps always get 1 mip and
/// clamp-to-edge sampling regardless of the description's wrap modes.
pub fn create_texture(
    device: &ash::Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    description: &TextureDescription,
    supports_linear_blit: bool,
    max_anisotropy: f32,
) -> Result<VulkanTexture> {
    let (is_cube, array_layers, mip_levels, (address_mode_u, address_mode_v, address_mode_w)) =
        cube_aware_image_params(description, supports_linear_blit);

    let mut create_flags = vk::ImageCreateFlags::empty();
    if is_cube {
        create_flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
    }

    let create_info = vk::ImageCreateInfo::builder()
        .flags(create_flags)
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_UNORM)
        .extent(vk::Extent3D { width: description.width, height: description.height, depth: 1 })
        .mip_levels(mip_levels)
        .array_layers(array_layers)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe { device.create_image(&create_info, None) }.context("vkCreateImage failed")?;
    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let memory_type = find_memory_type(memory_properties, requirements.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        .context("no device-local memory type for texture")?;
    let alloc_info = vk::MemoryAllocateInfo::builder().allocation_size(requirements.size).memory_type_index(memory_type);
    let memory = unsafe { device.allocate_memory(&alloc_info, None) }.context("vkAllocateMemory failed")?;
    unsafe { device.bind_image_memory(image, memory, 0) }.context("vkBindImageMemory failed")?;

    let view_type = if is_cube { vk::ImageViewType::CUBE } else { vk::ImageViewType::TYPE_2D };
    let subresource_range = vk::ImageSubresourceRange::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(mip_levels)
        .base_array_layer(0)
        .layer_count(array_layers)
        .build();
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(view_type)
        .format(vk::Format::R8G8B8A8_UNORM)
        .subresource_range(subresource_range);
    let view = unsafe { device.create_image_view(&view_info, None) }.context("vkCreateImageView failed")?;

    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(to_vk_filter(description.mag_filter))
        .min_filter(to_vk_filter(description.min_filter))
        .address_mode_u(address_mode_u)
        .address_mode_v(address_mode_v)
        .address_mode_w(address_mode_w)
        .anisotropy_enable(description.use_anisotropy)
        .max_anisotropy(max_anisotropy)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .min_lod(0.0)
        .max_lod(mip_levels as f32 - 1.0);
    let sampler = unsafe { device.create_sampler(&sampler_info, None) }.context("vkCreateSampler failed")?;

    Ok(VulkanTexture { image, memory, view, sampler, mip_levels, array_layers, generation: description.generation })
}

pub fn destroy_texture(device: &ash::Device, texture: &mut VulkanTexture) {
    unsafe {
        device.destroy_sampler(texture.sampler, None);
        device.destroy_image_view(texture.view, None);
        device.destroy_image(texture.image, None);
        device.free_memory(texture.memory, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::BufferUsage;

    #[test]
    fn buffer_usage_flags_translate_every_bit() {
        let usage = BufferUsage::VERTEX | BufferUsage::TRANSFER_DST;
        let vk_usage = to_vk_usage(usage);
        assert!(vk_usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(vk_usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!vk_usage.contains(vk::BufferUsageFlags::INDEX_BUFFER));
    }

    #[test]
    fn memory_property_flags_translate_every_bit() {
        let props = MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT;
        let flags = to_vk_memory_properties(props);
        assert!(flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        assert!(flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT));
        assert!(!flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));
    }

    fn cube_description(wrap: crate::resources::WrapMode) -> crate::resources::TextureDescription {
        crate::resources::TextureDescription {
            width: 64,
            height: 64,
            channels: 4,
            texture_type: crate::resources::TextureType::CubeMap,
            wrap_u: wrap,
            wrap_v: wrap,
            wrap_w: wrap,
            min_filter: crate::resources::FilterMode::Linear,
            mag_filter: crate::resources::FilterMode::Linear,
            use_anisotropy: false,
            properties: crate::resources::TextureProperties::empty(),
            generation: 0,
        }
    }

    /// S4: a 64x64 cube map always gets 6 layers, 1 mip, and clamp-to-edge
    /// sampling regardless of the description's requested wrap mode.
    #[test]
    fn cube_map_forces_six_layers_one_mip_and_clamp_to_edge() {
        let description = cube_description(crate::resources::WrapMode::Repeat);
        let (is_cube, array_layers, mip_levels, address_modes) = cube_aware_image_params(&description, true);
        assert!(is_cube);
        assert_eq!(array_layers, 6);
        assert_eq!(mip_levels, 1);
        assert_eq!(address_modes, (vk::SamplerAddressMode::CLAMP_TO_EDGE, vk::SamplerAddressMode::CLAMP_TO_EDGE, vk::SamplerAddressMode::CLAMP_TO_EDGE));
    }

    #[test]
    fn ordinary_2d_texture_keeps_its_own_wrap_mode_and_mip_chain() {
        let mut description = cube_description(crate::resources::WrapMode::Repeat);
        description.texture_type = crate::resources::TextureType::Texture2D;
        let (is_cube, array_layers, mip_levels, address_modes) = cube_aware_image_params(&description, true);
        assert!(!is_cube);
        assert_eq!(array_layers, 1);
        assert_eq!(mip_levels, description.mip_levels(true));
        assert_eq!(address_modes.0, vk::SamplerAddressMode::REPEAT);
    }
}

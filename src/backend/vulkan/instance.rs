//! Instance creation and the debug messenger (part of C3).

use std::ffi::{c_void, CStr, CString};

use anyhow::{Context, Result};
use ash::extensions::ext::DebugUtils;
use ash::vk;

const VALIDATION_LAYER: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

pub struct VulkanInstance {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub debug_utils: Option<DebugUtils>,
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    pub fn new(application_name: &str, engine_name: &str, enable_validation: bool, required_extensions: &[&CStr]) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.context("failed to load the Vulkan loader")?;

        let app_name = CString::new(application_name)?;
        let engine_name = CString::new(engine_name)?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extension_ptrs: Vec<*const i8> = required_extensions.iter().map(|name| name.as_ptr()).collect();
        if enable_validation {
            extension_ptrs.push(DebugUtils::name().as_ptr());
        }

        let mut layer_ptrs: Vec<*const i8> = Vec::new();
        if enable_validation && layer_is_available(&entry, VALIDATION_LAYER)? {
            layer_ptrs.push(VALIDATION_LAYER.as_ptr());
        } else if enable_validation {
            tracing::warn!("validation requested but VK_LAYER_KHRONOS_validation is not available");
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }.context("vkCreateInstance failed")?;

        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger_info = debug_messenger_create_info();
            let messenger = unsafe { debug_utils.create_debug_utils_messenger(&messenger_info, None) }
                .context("vkCreateDebugUtilsMessengerEXT failed")?;
            (Some(debug_utils), Some(messenger))
        } else {
            (None, None)
        };

        Ok(VulkanInstance { entry, instance, debug_utils, debug_messenger })
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn layer_is_available(entry: &ash::Entry, name: &CStr) -> Result<bool> {
    let layers = entry.enumerate_instance_layer_properties().context("failed to enumerate instance layers")?;
    Ok(layers.iter().any(|layer| {
        let layer_name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        layer_name == name
    }))
}

fn debug_messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .build()
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => tracing::error!(target: "vulkan", "{message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => tracing::warn!(target: "vulkan", "{message}"),
        _ => tracing::debug!(target: "vulkan", "{message}"),
    }
    vk::FALSE
}

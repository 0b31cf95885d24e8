// Vulkan instance
//
// Responsibilities:
// - Loading the Vulkan library
// - Instance creation, with validation layers when the debug level asks for them
// - Routing validation messages into the backend's debug sink

use anyhow::{Context, Result};
use ash::{vk, Entry};
use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

use crate::config::PulseConfig;
use crate::debug::DebugSink;
use crate::types::Severity;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct VulkanInstance {
    pub instance: ash::Instance,
    entry: Entry,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    /// Target of the messenger's user data pointer
    sink: Arc<DebugSink>,
}

impl VulkanInstance {
    pub fn new(config: &PulseConfig, sink: Arc<DebugSink>) -> Result<Self> {
        let entry = unsafe { Entry::load() }.context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation =
            sink.is_high_level() && config.vulkan.validation_layers && has_validation_layer(&entry);
        if sink.is_high_level() && config.vulkan.validation_layers && !enable_validation {
            sink.warn("(Vulkan) validation layers requested but not installed");
        }

        let instance = create_instance(&entry, &config.vulkan.application_name, enable_validation)?;

        let debug_utils = if enable_validation {
            match setup_debug_messenger(&entry, &instance, &sink) {
                Ok(utils) => Some(utils),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::info!("Created Vulkan instance (validation: {})", enable_validation);
        Ok(Self {
            instance,
            entry,
            debug_utils,
            sink,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn sink(&self) -> &Arc<DebugSink> {
        &self.sink
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn has_validation_layer(entry: &Entry) -> bool {
    entry
        .enumerate_instance_layer_properties()
        .map(|layers| {
            layers
                .iter()
                .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER)
        })
        .unwrap_or(false)
}

fn create_instance(entry: &Entry, app_name: &str, enable_validation: bool) -> Result<ash::Instance> {
    let app_name_cstr = CString::new(app_name)?;
    let engine_name = CString::new("Pulse")?;

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name_cstr)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let extensions = if enable_validation {
        vec![ash::extensions::ext::DebugUtils::name().as_ptr()]
    } else {
        vec![]
    };
    let layer_names = if enable_validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    unsafe { entry.create_instance(&create_info, None) }.context("Failed to create Vulkan instance")
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
    sink: &Arc<DebugSink>,
) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .user_data(Arc::as_ptr(sink) as *mut c_void);

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .context("Failed to create debug messenger")?;

    Ok((debug_utils, messenger))
}

// Forwards validation output to the sink that owns this instance
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || p_user_data.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();
    let sink = &*(p_user_data as *const DebugSink);

    let severity = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => Severity::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => Severity::Warning,
        _ => Severity::Info,
    };
    sink.emit(severity, format_args!("[Vulkan] {}", message));

    vk::FALSE
}

//! `VK_EXT_debug_utils` messenger plumbing.
//!
//! Messages from the validation layer are forwarded to the validation
//! channel with the prefix `Vulkan`, keeping the layer's own severity as
//! the `tracing` level.

use std::{ffi::CStr, sync::Arc};

use ash::vk;
use thiserror::Error;

use crate::instance::Instance;

/// Lowest messenger severity that reaches the log.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub enum VulkanLogLevel {
    #[default]
    Verbose,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Error)]
pub enum DebugMessengerError {
    #[error("VK_EXT_debug_utils is not enabled on the instance")]
    ExtensionNotLoaded,
    #[error("Vulkan error creating debug messenger: {0}")]
    Vulkan(vk::Result),
}

pub fn severity_mask(
    level: VulkanLogLevel,
) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    match level {
        VulkanLogLevel::Verbose => S::VERBOSE | S::INFO | S::WARNING | S::ERROR,
        VulkanLogLevel::Info => S::INFO | S::WARNING | S::ERROR,
        VulkanLogLevel::Warning => S::WARNING | S::ERROR,
        VulkanLogLevel::Error => S::ERROR,
    }
}

/// Create info shared by the standalone messenger and the one chained
/// into `vkCreateInstance`.
pub fn messenger_create_info(
    level: VulkanLogLevel,
) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severity_mask(level))
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback))
}

fn message_type_str(
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
) -> &'static str {
    match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "GENERAL",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "VALIDATION",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "PERFORMANCE",
        _ => "UNKNOWN",
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    //SAFETY: Vulkan guarantees p_callback_data is valid for the duration of
    //the callback, checked non-null above
    let data = unsafe { &*p_callback_data };
    let message = if data.p_message.is_null() {
        "".into()
    } else {
        //SAFETY: p_message is a NUL-terminated string owned by the layer
        unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy()
    };
    let id_name = if data.p_message_id_name.is_null() {
        "".into()
    } else {
        //SAFETY: p_message_id_name is a NUL-terminated string owned by the layer
        unsafe { CStr::from_ptr(data.p_message_id_name) }.to_string_lossy()
    };
    let type_str = message_type_str(message_type);
    let id = data.message_id_number;

    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    match message_severity {
        S::ERROR => onyx_log::validation!(
            level: tracing::Level::ERROR,
            "Vulkan",
            "[{type_str}] [{id} : {id_name}]\n{message}"
        ),
        S::WARNING => onyx_log::validation!(
            level: tracing::Level::WARN,
            "Vulkan",
            "[{type_str}] [{id} : {id_name}]\n{message}"
        ),
        S::INFO => onyx_log::validation!(
            level: tracing::Level::INFO,
            "Vulkan",
            "[{type_str}] [{id} : {id_name}]\n{message}"
        ),
        _ => onyx_log::validation!(
            level: tracing::Level::TRACE,
            "Vulkan",
            "[{type_str}] [{id} : {id_name}]\n{message}"
        ),
    }

    vk::FALSE
}

/// A live `VkDebugUtilsMessengerEXT`, destroyed on drop.
pub struct DebugMessenger {
    parent: Arc<Instance>,
    handle: vk::DebugUtilsMessengerEXT,
    level: VulkanLogLevel,
}

impl std::fmt::Debug for DebugMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugMessenger")
            .field("handle", &self.handle)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

impl DebugMessenger {
    pub fn new(
        instance: &Arc<Instance>,
        level: VulkanLogLevel,
    ) -> Result<Self, DebugMessengerError> {
        let create_info = messenger_create_info(level);
        // SAFETY: create_info points at a `'static` callback and carries no
        // borrowed data.
        let handle =
            unsafe { instance.create_raw_debug_messenger(&create_info) }?;
        tracing::debug!("Created debug messenger {:?} ({level:?})", handle);
        Ok(Self {
            parent: Arc::clone(instance),
            handle,
            level,
        })
    }

    pub fn raw_handle(&self) -> vk::DebugUtilsMessengerEXT {
        self.handle
    }
}

impl Drop for DebugMessenger {
    fn drop(&mut self) {
        tracing::debug!("Dropping debug messenger {:?}", self.handle);
        // SAFETY: handle was created from parent and this is its only
        // destruction path.
        unsafe { self.parent.destroy_raw_debug_messenger(self.handle) };
    }
}

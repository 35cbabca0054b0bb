//! The logical device and its single graphics+compute queue.
//!
//! Raw entry points live here as `unsafe fn` methods whose contracts
//! are spelled out per method; buffers, textures and swapchains call
//! them instead of touching `ash::Device` themselves.

use std::ffi::{CStr, CString};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use thiserror::Error;

use crate::instance::Instance;
use crate::negotiate::{self, CapabilityKind};
use crate::physical::PhysicalDeviceInfo;
use crate::swapchain::CreateSwapchainError;

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error("{0:?} has no queue family with graphics and compute")]
    NoQueueFamily(String),
    #[error("Listing device extensions failed: {0}")]
    EnumerateExtensions(vk::Result),
    #[error("vkCreateDevice failed: {0}")]
    DeviceCreationFailed(vk::Result),
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Object name contains a NUL byte: {0}")]
    InvalidName(std::ffi::NulError),
    #[error("vkSetDebugUtilsObjectNameEXT failed: {0}")]
    Vulkan(vk::Result),
}

/// A resource that takes memory through `vkBind*Memory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bindable {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

impl Bindable {
    pub fn is_null(self) -> bool {
        match self {
            Bindable::Buffer(b) => b == vk::Buffer::null(),
            Bindable::Image(i) => i == vk::Image::null(),
        }
    }
}

pub struct Device {
    instance: Arc<Instance>,
    handle: ash::Device,
    physical_device: vk::PhysicalDevice,
    limits: vk::PhysicalDeviceLimits,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    max_allocation_size: vk::DeviceSize,
    extensions: Vec<CString>,
    swapchain_fns: Option<ash::khr::swapchain::Device>,
    debug_utils_fns: Option<ash::ext::debug_utils::Device>,
    queue: vk::Queue,
    queue_family: u32,
    swapchain_serial: AtomicU64,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("queue_family", &self.queue_family)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Destroying device {:?}", self.handle.handle());
        // SAFETY: every child holds an Arc<Device>, none are left.
        unsafe { self.handle.destroy_device(None) };
    }
}

impl Device {
    /// Create a device on `physical` with one queue from its
    /// graphics+compute family.
    ///
    /// `extensions` go through negotiation, so unsupported ones are
    /// dropped with a warning. `features` are enabled as given.
    pub fn new(
        instance: &Arc<Instance>,
        physical: &PhysicalDeviceInfo,
        extensions: &[&CStr],
        features: &vk::PhysicalDeviceFeatures,
    ) -> Result<Self, CreateDeviceError> {
        let Some(queue_family) = physical.queue_family else {
            return Err(CreateDeviceError::NoQueueFamily(
                physical.name.clone(),
            ));
        };

        // SAFETY: physical.handle was enumerated from instance.
        let available = unsafe {
            instance.enumerate_raw_device_extensions(physical.handle)
        }
        .map_err(CreateDeviceError::EnumerateExtensions)?;
        let enabled = negotiate::negotiate(
            CapabilityKind::DeviceExtension,
            extensions,
            &negotiate::extension_names(&available),
        );
        let enabled_ptrs: Vec<_> = enabled.iter().map(|e| e.as_ptr()).collect();

        let priority = [1.0];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priority)];
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&enabled_ptrs)
            .enabled_features(features);

        // SAFETY: create_info only borrows locals that outlive the call.
        let handle =
            unsafe { instance.create_raw_device(physical.handle, &create_info) }
                .map_err(CreateDeviceError::DeviceCreationFailed)?;
        // SAFETY: queue 0 of queue_family was requested above.
        let queue = unsafe { handle.get_device_queue(queue_family, 0) };

        tracing::info!(
            "Using {:?} ({:?}, Vulkan {}) with queue family {queue_family}",
            physical.name,
            physical.device_type,
            physical.api_version,
        );

        let swapchain_fns = enabled
            .contains(&ash::khr::swapchain::NAME)
            .then(|| instance.swapchain_fns(&handle));
        let debug_utils_fns = instance.debug_utils_fns(&handle);

        let device = Self {
            instance: Arc::clone(instance),
            handle,
            physical_device: physical.handle,
            limits: physical.limits,
            memory_properties: physical.memory,
            max_allocation_size: physical.max_allocation_size,
            extensions: enabled.iter().map(|&e| e.to_owned()).collect(),
            swapchain_fns,
            debug_utils_fns,
            queue,
            queue_family,
            swapchain_serial: AtomicU64::new(0),
        };
        // SAFETY: the queue was retrieved from this device above.
        if let Err(e) = unsafe {
            device.set_object_name(device.queue, Some(c"Onyx graphics queue"))
        } {
            tracing::warn!("Couldn't name the graphics queue: {e}");
        }
        Ok(device)
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.limits.non_coherent_atom_size
    }

    /// Largest single allocation, `u64::MAX` when unknown.
    pub fn max_allocation_size(&self) -> vk::DeviceSize {
        self.max_allocation_size
    }

    pub fn extensions(&self) -> &[CString] {
        &self.extensions
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Blocks until the queue drains. Meant for teardown and resize, not
    /// per-frame use.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: the handle is live for as long as self is.
        unsafe { self.handle.device_wait_idle() }
    }

    /// Counter used to tell swapchain generations apart in debug names.
    pub fn next_swapchain_serial(&self) -> u64 {
        self.swapchain_serial.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Device {
    pub fn has_swapchain_support(&self) -> bool {
        self.swapchain_fns.is_some()
    }

    fn swapchain_loader(
        &self,
    ) -> Result<&ash::khr::swapchain::Device, CreateSwapchainError> {
        self.swapchain_fns
            .as_ref()
            .ok_or(CreateSwapchainError::SwapchainNotEnabled)
    }

    /// # Safety
    /// Every handle in `info` (surface, old swapchain) must belong to
    /// this device or its instance. A non-null `old_swapchain` must not
    /// have been retired already.
    pub unsafe fn create_raw_swapchain(
        &self,
        info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, CreateSwapchainError> {
        let fns = self.swapchain_loader()?;
        // SAFETY: forwarded caller contract.
        unsafe { fns.create_swapchain(info, None) }
            .map_err(CreateSwapchainError::VulkanCreate)
    }

    /// # Safety
    /// `swapchain` must be live and made by this device.
    pub unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, CreateSwapchainError> {
        let fns = self.swapchain_loader()?;
        // SAFETY: forwarded caller contract.
        unsafe { fns.get_swapchain_images(swapchain) }
            .map_err(CreateSwapchainError::VulkanGetImages)
    }

    /// # Safety
    /// `swapchain` must be made by this device. Its views must already
    /// be gone and no queued work may present from it.
    pub unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(fns) = &self.swapchain_fns {
            // SAFETY: forwarded caller contract.
            unsafe { fns.destroy_swapchain(swapchain, None) };
        }
    }

    /// # Safety
    /// `info.image` must belong to this device.
    pub unsafe fn create_raw_image_view(
        &self,
        info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: forwarded caller contract.
        unsafe { self.handle.create_image_view(info, None) }
    }

    /// # Safety
    /// `view` must be made by this device and unused from here on.
    pub unsafe fn destroy_raw_image_view(&self, view: vk::ImageView) {
        // SAFETY: forwarded caller contract.
        unsafe { self.handle.destroy_image_view(view, None) };
    }
}

impl Device {
    pub fn has_debug_utils(&self) -> bool {
        self.debug_utils_fns.is_some()
    }

    /// Attach `name` to `object` for validation messages and capture
    /// tools. Does nothing without debug utils or without a name.
    ///
    /// # Safety
    /// `object` must be a live handle owned by this device.
    pub unsafe fn set_object_name<H: vk::Handle>(
        &self,
        object: H,
        name: Option<&CStr>,
    ) -> Result<(), NameObjectError> {
        let (Some(fns), Some(name)) = (&self.debug_utils_fns, name) else {
            return Ok(());
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name);
        // SAFETY: forwarded caller contract.
        unsafe { fns.set_debug_utils_object_name(&info) }
            .map_err(NameObjectError::Vulkan)
    }

    /// Like [`set_object_name`](Self::set_object_name), but only builds
    /// the name when it will be used.
    ///
    /// # Safety
    /// See [`set_object_name`](Self::set_object_name).
    pub unsafe fn set_object_name_with<H: vk::Handle>(
        &self,
        object: H,
        make_name: impl FnOnce() -> Option<CString>,
    ) -> Result<(), NameObjectError> {
        if !self.has_debug_utils() {
            return Ok(());
        }
        let name = make_name();
        // SAFETY: forwarded caller contract.
        unsafe { self.set_object_name(object, name.as_deref()) }
    }

    /// # Safety
    /// See [`set_object_name`](Self::set_object_name).
    pub unsafe fn set_object_name_str<H: vk::Handle>(
        &self,
        object: H,
        name: &str,
    ) -> Result<(), NameObjectError> {
        if !self.has_debug_utils() {
            return Ok(());
        }
        let name = CString::new(name).map_err(NameObjectError::InvalidName)?;
        // SAFETY: forwarded caller contract.
        unsafe { self.set_object_name(object, Some(&name)) }
    }
}

impl Device {
    /// # Safety
    /// `info` may only borrow data that outlives the call.
    pub unsafe fn create_raw_buffer(
        &self,
        info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: forwarded caller contract.
        unsafe { self.handle.create_buffer(info, None) }
    }

    /// # Safety
    /// `info` may only borrow data that outlives the call.
    pub unsafe fn create_raw_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        // SAFETY: forwarded caller contract.
        unsafe { self.handle.create_image(info, None) }
    }

    /// # Safety
    /// `target` must be a live handle made by this device.
    pub unsafe fn raw_memory_requirements(
        &self,
        target: Bindable,
    ) -> vk::MemoryRequirements {
        // SAFETY: forwarded caller contract.
        unsafe {
            match target {
                Bindable::Buffer(b) => {
                    self.handle.get_buffer_memory_requirements(b)
                }
                Bindable::Image(i) => {
                    self.handle.get_image_memory_requirements(i)
                }
            }
        }
    }

    /// # Safety
    /// `target` and `memory` must belong to this device, `target` must be
    /// unbound, and `offset` must honour the reported requirements.
    pub unsafe fn bind_raw_memory(
        &self,
        target: Bindable,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded caller contract.
        unsafe {
            match target {
                Bindable::Buffer(b) => {
                    self.handle.bind_buffer_memory(b, memory, offset)
                }
                Bindable::Image(i) => {
                    self.handle.bind_image_memory(i, memory, offset)
                }
            }
        }
    }

    /// # Safety
    /// `target` must be made by this device, destroyed only once, and
    /// out of reach of any queued work.
    pub unsafe fn destroy_raw(&self, target: Bindable) {
        // SAFETY: forwarded caller contract.
        unsafe {
            match target {
                Bindable::Buffer(b) => self.handle.destroy_buffer(b, None),
                Bindable::Image(i) => self.handle.destroy_image(i, None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn null_bindables() {
        assert!(Bindable::Buffer(vk::Buffer::null()).is_null());
        assert!(Bindable::Image(vk::Image::null()).is_null());
        assert!(!Bindable::Image(vk::Image::from_raw(7)).is_null());
    }
}

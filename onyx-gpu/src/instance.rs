//! Loader bring-up and everything hanging directly off a `VkInstance`.
//!
//! [`Instance::new`] negotiates layers and extensions against what the
//! loader actually offers. Only the platform surface extensions are hard
//! requirements; validation and debug utils fall away with a warning.
//!
//! Raw queries on physical devices and surfaces are grouped into
//! [`PhysicalProbe`] and [`SurfaceSupport`] so callers see one snapshot
//! rather than a handful of loose getters.

use std::ffi::{CStr, CString};
use std::fmt;

use ash::vk;
use raw_window_handle::HasDisplayHandle;
use thiserror::Error;

use crate::debug::{self, DebugMessengerError, VulkanLogLevel};
use crate::negotiate::{self, CapabilityKind};
use crate::surface::{
    CreateSurfaceError, SurfaceQueryError, SurfaceSupport, SurfaceSupportError,
};
use crate::window::WindowSource;

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// A Vulkan version word (`VK_MAKE_API_VERSION` with variant 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VkVersion(u32);

impl VkVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(0, major, minor, patch))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn major(self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(self) -> u32 {
        vk::api_version_patch(self.0)
    }

    /// Compares `major.minor` only.
    pub fn at_least(self, major: u32, minor: u32) -> bool {
        (self.major(), self.minor()) >= (major, minor)
    }
}

impl fmt::Display for VkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

/// Parameters for [`Instance::new`].
#[derive(Debug, Clone)]
pub struct InstanceDesc<'a> {
    pub app_name: &'a str,
    pub app_version: VkVersion,
    pub validation: bool,
    /// Messenger and object names.
    pub debug_utils: bool,
    /// Shader printf through the validation layer. Ignored without it.
    pub debug_printf: bool,
    pub messenger_log_level: VulkanLogLevel,
}

/// Everything the selector and device creation need to know about one
/// physical device, read in a single pass.
#[derive(Debug, Clone)]
pub struct PhysicalProbe {
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    /// `None` before Vulkan 1.1 on either side.
    pub max_allocation_size: Option<vk::DeviceSize>,
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Vulkan loader unavailable: {0}")]
    Loading(ash::LoadingError),
    #[error("Window has no usable display handle: {0}")]
    InvalidDisplayHandle(raw_window_handle::HandleError),
    #[error("Loader lacks required surface extensions: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error("vkCreateInstance path failed: {0}")]
    UnknownVulkan(#[from] vk::Result),
    #[error("Application name contains a NUL byte")]
    InvalidAppName,
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Out of memory while listing physical devices")]
    MemoryExhaustion,
    #[error("Listing physical devices failed: {0}")]
    UnknownVulkan(vk::Result),
}

/// Root of every Vulkan object the engine creates.
///
/// Children keep an `Arc<Instance>`, so dropping the last handle here
/// happens strictly after they are gone.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    surface_fns: Option<ash::khr::surface::Instance>,
    layers: Vec<CString>,
    extensions: Vec<CString>,
    api_version: VkVersion,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("api_version", &self.api_version)
            .field("layers", &self.layers)
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Destroying instance {:?}", self.handle.handle());
        // SAFETY: no child object can outlive us, each holds an Arc.
        unsafe { self.handle.destroy_instance(None) };
    }
}

/// Surface extensions the platform behind `display` needs.
fn platform_surface_extensions(
    display: &impl HasDisplayHandle,
) -> Result<Vec<&'static CStr>, InstanceCreationError> {
    let raw = display
        .display_handle()
        .map_err(InstanceCreationError::InvalidDisplayHandle)?
        .as_raw();
    let names = ash_window::enumerate_required_extensions(raw)?;
    Ok(names
        .iter()
        // SAFETY: ash_window returns pointers to static NUL-terminated
        // extension names.
        .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
        .collect())
}

/// Optional loader queries degrade to an empty list, with a warning.
fn listed_or_empty<T>(
    listed: Result<Vec<T>, vk::Result>,
    what: &str,
) -> Vec<T> {
    listed.unwrap_or_else(|e| {
        tracing::warn!("Couldn't enumerate {what}, assuming none: {e}");
        Vec::new()
    })
}

impl Instance {
    /// Load Vulkan and create an instance for `desc`.
    ///
    /// With a `display`, its platform surface extensions must be
    /// available or this fails with
    /// [`MissingExtensions`](InstanceCreationError::MissingExtensions).
    ///
    /// # Safety
    /// Loading the Vulkan library runs its initialisation code, which we
    /// cannot check.
    pub unsafe fn new(
        desc: &InstanceDesc<'_>,
        display: Option<&impl HasDisplayHandle>,
    ) -> Result<Self, InstanceCreationError> {
        let app_name = CString::new(desc.app_name)
            .map_err(|_| InstanceCreationError::InvalidAppName)?;

        // SAFETY: the entry is stored in the returned Instance and
        // outlives every handle loaded through it.
        let entry = unsafe { ash::Entry::load() }
            .map_err(InstanceCreationError::Loading)?;

        // SAFETY: entry points were just loaded.
        let api_version = match unsafe { entry.try_enumerate_instance_version() }
        {
            Ok(Some(ver)) => ver,
            _ => vk::API_VERSION_1_0,
        };

        let surface_exts = match display {
            Some(display) => platform_surface_extensions(display)?,
            None => Vec::new(),
        };

        // SAFETY: entry points were just loaded.
        let available_layers = listed_or_empty(
            unsafe { entry.enumerate_instance_layer_properties() },
            "instance layers",
        );
        let wanted_layers: &[&CStr] =
            if desc.validation { &[VALIDATION_LAYER] } else { &[] };
        let layers = negotiate::negotiate(
            CapabilityKind::InstanceLayer,
            wanted_layers,
            &negotiate::layer_names(&available_layers),
        );
        let validating = layers.contains(&VALIDATION_LAYER);

        // SAFETY: None asks for loader and implicit-layer extensions.
        let mut available_exts =
            unsafe { entry.enumerate_instance_extension_properties(None) }?;
        if validating {
            // validation_features only shows up under the layer's name.
            // SAFETY: the layer name was just reported by the loader.
            let from_layer = unsafe {
                entry.enumerate_instance_extension_properties(Some(
                    VALIDATION_LAYER,
                ))
            };
            available_exts.extend(listed_or_empty(
                from_layer,
                "validation layer extensions",
            ));
        }

        let mut wanted_exts = surface_exts.clone();
        if desc.debug_utils {
            wanted_exts.push(ash::ext::debug_utils::NAME);
        }
        if validating && desc.debug_printf {
            wanted_exts.push(ash::ext::validation_features::NAME);
        }
        let extensions = negotiate::negotiate(
            CapabilityKind::InstanceExtension,
            &wanted_exts,
            &negotiate::extension_names(&available_exts),
        );

        let missing: Vec<String> = surface_exts
            .iter()
            .filter(|&&ext| !extensions.contains(&ext))
            .map(|ext| ext.to_string_lossy().into_owned())
            .collect();
        if !missing.is_empty() {
            return Err(InstanceCreationError::MissingExtensions(missing));
        }

        let has_debug_utils = extensions.contains(&ash::ext::debug_utils::NAME);
        let has_printf =
            extensions.contains(&ash::ext::validation_features::NAME);

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(desc.app_version.to_raw())
            .engine_name(c"Onyx-Engine")
            .engine_version(crate::engine_version().to_raw())
            .api_version(api_version);
        let ext_ptrs: Vec<_> = extensions.iter().map(|e| e.as_ptr()).collect();
        let layer_ptrs: Vec<_> = layers.iter().map(|l| l.as_ptr()).collect();

        // Chained messenger covers vkCreateInstance and vkDestroyInstance.
        let mut messenger_info =
            debug::messenger_create_info(desc.messenger_log_level);
        let printf = [vk::ValidationFeatureEnableEXT::DEBUG_PRINTF];
        let mut features = vk::ValidationFeaturesEXT::default()
            .enabled_validation_features(&printf);

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&ext_ptrs);
        if has_debug_utils {
            create_info = create_info.push_next(&mut messenger_info);
        }
        if has_printf {
            create_info = create_info.push_next(&mut features);
        }

        // SAFETY: create_info and its chain live until the call returns.
        let handle = unsafe { entry.create_instance(&create_info, None) }?;
        let api_version = VkVersion::from_raw(api_version);
        tracing::debug!(
            "Created instance {:?} at Vulkan {api_version}",
            handle.handle()
        );

        let debug_utils = has_debug_utils
            .then(|| ash::ext::debug_utils::Instance::new(&entry, &handle));
        let surface_fns = (!surface_exts.is_empty())
            .then(|| ash::khr::surface::Instance::new(&entry, &handle));

        Ok(Self {
            layers: layers.iter().map(|&l| l.to_owned()).collect(),
            extensions: extensions.iter().map(|&e| e.to_owned()).collect(),
            entry,
            handle,
            debug_utils,
            surface_fns,
            api_version,
        })
    }

    pub fn layers(&self) -> &[CString] {
        &self.layers
    }

    pub fn extensions(&self) -> &[CString] {
        &self.extensions
    }

    pub fn has_debug_utils(&self) -> bool {
        self.debug_utils.is_some()
    }

    /// What `vkEnumerateInstanceVersion` reported, not what was asked for.
    pub fn api_version(&self) -> VkVersion {
        self.api_version
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }

    /// Physical device handles. Meaningless outside this instance.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        // SAFETY: the instance handle is live.
        unsafe { self.handle.enumerate_physical_devices() }.map_err(|e| {
            match e {
                vk::Result::ERROR_OUT_OF_HOST_MEMORY
                | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                    FetchPhysicalDeviceError::MemoryExhaustion
                }
                other => FetchPhysicalDeviceError::UnknownVulkan(other),
            }
        })
    }

    /// Read properties, features, memory heaps and queue families of
    /// `physical` in one go.
    ///
    /// # Safety
    /// `physical` must come from [`fetch_raw_physical_devices`] on this
    /// instance.
    ///
    /// [`fetch_raw_physical_devices`]: Self::fetch_raw_physical_devices
    pub unsafe fn probe_raw_physical_device(
        &self,
        physical: vk::PhysicalDevice,
    ) -> PhysicalProbe {
        let ash = &self.handle;
        // SAFETY: physical belongs to this instance (caller contract).
        let (properties, features, memory, queue_families) = unsafe {
            (
                ash.get_physical_device_properties(physical),
                ash.get_physical_device_features(physical),
                ash.get_physical_device_memory_properties(physical),
                ash.get_physical_device_queue_family_properties(physical),
            )
        };

        let device_ver = VkVersion::from_raw(properties.api_version);
        let max_allocation_size = (self.api_version.at_least(1, 1)
            && device_ver.at_least(1, 1))
        .then(|| {
            let mut maintenance3 =
                vk::PhysicalDeviceMaintenance3Properties::default();
            let mut props2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut maintenance3);
            // SAFETY: vkGetPhysicalDeviceProperties2 is core on 1.1 and
            // both sides were just checked.
            unsafe { ash.get_physical_device_properties2(physical, &mut props2) };
            maintenance3.max_memory_allocation_size
        });

        PhysicalProbe {
            properties,
            features,
            memory,
            queue_families,
            max_allocation_size,
        }
    }

    /// # Safety
    /// `physical` must belong to this instance.
    pub unsafe fn enumerate_raw_device_extensions(
        &self,
        physical: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, vk::Result> {
        // SAFETY: forwarded caller contract.
        unsafe { self.handle.enumerate_device_extension_properties(physical) }
    }

    /// # Safety
    /// `physical` must belong to this instance and every handle named in
    /// `info` must stay valid for the call.
    pub unsafe fn create_raw_device(
        &self,
        physical: vk::PhysicalDevice,
        info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: forwarded caller contract.
        unsafe { self.handle.create_device(physical, info, None) }
    }

    /// Loader for `VK_KHR_swapchain` entry points on `device`.
    pub fn swapchain_fns(
        &self,
        device: &ash::Device,
    ) -> ash::khr::swapchain::Device {
        ash::khr::swapchain::Device::new(&self.handle, device)
    }

    /// Device-level debug utils, if the instance enabled them.
    pub fn debug_utils_fns(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.debug_utils
            .as_ref()
            .map(|_| ash::ext::debug_utils::Device::new(&self.handle, device))
    }
}

impl Instance {
    /// # Safety
    /// The callback in `info` has to remain callable while the
    /// messenger exists.
    pub unsafe fn create_raw_debug_messenger(
        &self,
        info: &vk::DebugUtilsMessengerCreateInfoEXT<'_>,
    ) -> Result<vk::DebugUtilsMessengerEXT, DebugMessengerError> {
        let Some(debug_utils) = &self.debug_utils else {
            return Err(DebugMessengerError::ExtensionNotLoaded);
        };
        // SAFETY: forwarded caller contract.
        unsafe { debug_utils.create_debug_utils_messenger(info, None) }
            .map_err(DebugMessengerError::Vulkan)
    }

    /// # Safety
    /// `messenger` must be a live messenger made by this instance.
    pub unsafe fn destroy_raw_debug_messenger(
        &self,
        messenger: vk::DebugUtilsMessengerEXT,
    ) {
        if let Some(debug_utils) = &self.debug_utils {
            // SAFETY: forwarded caller contract.
            unsafe {
                debug_utils.destroy_debug_utils_messenger(messenger, None)
            };
        }
    }
}

impl Instance {
    fn surface_fns(&self) -> Option<&ash::khr::surface::Instance> {
        self.surface_fns.as_ref()
    }

    /// # Safety
    /// The surface must be destroyed before `source`'s window goes away,
    /// and only used with this instance.
    pub unsafe fn create_raw_surface<W: WindowSource + ?Sized>(
        &self,
        source: &W,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError> {
        if self.surface_fns().is_none() {
            return Err(CreateSurfaceError::MissingExtension);
        }
        let display = source
            .display_handle()
            .map_err(CreateSurfaceError::InvalidDisplayHandle)?;
        let window = source
            .window_handle()
            .map_err(CreateSurfaceError::InvalidWindowHandle)?;
        // SAFETY: the handles describe a live window; keeping it alive is
        // the caller's job.
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.handle,
                display.as_raw(),
                window.as_raw(),
                None,
            )
        }
        .map_err(CreateSurfaceError::VulkanError)
    }

    /// # Safety
    /// Nothing may still use `surface`, including queued GPU work, and it
    /// must have been made by this instance.
    pub unsafe fn destroy_raw_surface(&self, surface: vk::SurfaceKHR) {
        match self.surface_fns() {
            // SAFETY: forwarded caller contract.
            Some(fns) => unsafe { fns.destroy_surface(surface, None) },
            None => tracing::error!(
                "Surface {surface:?} outlived its extension loader"
            ),
        }
    }

    /// # Safety
    /// `physical` and `surface` must both belong to this instance.
    pub unsafe fn raw_queue_family_presents(
        &self,
        physical: vk::PhysicalDevice,
        family: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceSupportError> {
        let fns = self
            .surface_fns()
            .ok_or(SurfaceSupportError::ExtensionNotLoaded)?;
        // SAFETY: forwarded caller contract.
        unsafe {
            fns.get_physical_device_surface_support(physical, family, surface)
        }
        .map_err(SurfaceSupportError::Vulkan)
    }

    /// Capabilities, formats and present modes of `surface` on
    /// `physical`.
    ///
    /// # Safety
    /// `physical` and `surface` must both belong to this instance.
    pub unsafe fn query_raw_surface_support(
        &self,
        physical: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<SurfaceSupport, SurfaceQueryError> {
        let fns = self
            .surface_fns()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: forwarded caller contract.
        unsafe {
            Ok(SurfaceSupport {
                capabilities: fns
                    .get_physical_device_surface_capabilities(
                        physical, surface,
                    )
                    .map_err(SurfaceQueryError::Vulkan)?,
                formats: fns
                    .get_physical_device_surface_formats(physical, surface)
                    .map_err(SurfaceQueryError::Vulkan)?,
                present_modes: fns
                    .get_physical_device_surface_present_modes(
                        physical, surface,
                    )
                    .map_err(SurfaceQueryError::Vulkan)?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_components() {
        let raw = vk::make_api_version(0, 1, 3, 275);
        let ver = VkVersion::from_raw(raw);
        assert_eq!(ver, VkVersion::new(1, 3, 275));
        assert_eq!((ver.major(), ver.minor(), ver.patch()), (1, 3, 275));
        assert_eq!(ver.to_raw(), raw);
        assert_eq!(ver.to_string(), "1.3.275");
    }

    #[test]
    fn at_least_ignores_patch() {
        let ver = VkVersion::new(1, 1, 0);
        assert!(ver.at_least(1, 0));
        assert!(ver.at_least(1, 1));
        assert!(!ver.at_least(1, 2));
        assert!(!VkVersion::new(1, 0, 999).at_least(1, 1));
        assert!(VkVersion::new(2, 0, 0).at_least(1, 3));
    }

    #[test]
    fn failed_optional_listing_warns_and_is_empty() {
        use onyx_log::{ConsoleLayer, MemoryWriter, SeverityFlags};
        use tracing_subscriber::layer::SubscriberExt;

        let out = MemoryWriter::default();
        let layer = ConsoleLayer::new(SeverityFlags::ALL)
            .with_ansi(false)
            .to_writer(out.clone());
        let subscriber = tracing_subscriber::registry().with(layer);

        let (failed, listed) =
            tracing::subscriber::with_default(subscriber, || {
                let failed: Vec<u32> = listed_or_empty(
                    Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
                    "instance layers",
                );
                let listed =
                    listed_or_empty(Ok(vec![7u32]), "instance layers");
                (failed, listed)
            });

        assert!(failed.is_empty());
        assert_eq!(listed, [7]);
        let text = out.contents();
        assert!(text.contains("[Warning]"));
        assert!(
            text.contains("Couldn't enumerate instance layers, assuming none:")
        );
        assert_eq!(text.matches("Couldn't enumerate").count(), 1);
    }
}

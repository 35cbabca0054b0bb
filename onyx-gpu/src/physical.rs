//! Physical device discovery and selection.

use ash::vk;

use crate::instance::{Instance, VkVersion};

/// Cached description of one enumerated physical device.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: VkVersion,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub limits: vk::PhysicalDeviceLimits,
    /// `u64::MAX` when the device can't report it.
    pub max_allocation_size: vk::DeviceSize,
    /// First queue family with both graphics and compute, if any.
    pub queue_family: Option<u32>,
}

impl PhysicalDeviceInfo {
    /// # Safety
    /// `handle` must be a valid physical device enumerated from `instance`.
    pub unsafe fn query(
        instance: &Instance,
        handle: vk::PhysicalDevice,
    ) -> Self {
        // SAFETY: forwarded caller contract.
        let probe = unsafe { instance.probe_raw_physical_device(handle) };
        let props = &probe.properties;
        let queue_family = probe
            .queue_families
            .iter()
            .position(|qf| {
                qf.queue_count > 0
                    && qf.queue_flags.contains(
                        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                    )
            })
            .map(|idx| idx as u32);

        Self {
            handle,
            name: props
                .device_name_as_c_str()
                .unwrap_or(c"unknown")
                .to_string_lossy()
                .into_owned(),
            device_type: props.device_type,
            api_version: VkVersion::from_raw(props.api_version),
            features: probe.features,
            memory: probe.memory,
            limits: props.limits,
            max_allocation_size: probe
                .max_allocation_size
                .unwrap_or(vk::DeviceSize::MAX),
            queue_family,
        }
    }
}

/// Enumerate every physical device on `instance` with its cached info.
pub fn enumerate(
    instance: &Instance,
) -> Result<Vec<PhysicalDeviceInfo>, crate::instance::FetchPhysicalDeviceError>
{
    Ok(instance
        .fetch_raw_physical_devices()?
        .into_iter()
        // SAFETY: every handle was just enumerated from instance.
        .map(|dev| unsafe { PhysicalDeviceInfo::query(instance, dev) })
        .collect())
}

fn feature_bits(features: &vk::PhysicalDeviceFeatures) -> &[vk::Bool32] {
    const COUNT: usize = std::mem::size_of::<vk::PhysicalDeviceFeatures>()
        / std::mem::size_of::<vk::Bool32>();
    // SAFETY: VkPhysicalDeviceFeatures is a #[repr(C)] struct made up
    // solely of VkBool32 fields, so it has the layout of [Bool32; COUNT].
    unsafe {
        std::slice::from_raw_parts(
            (features as *const vk::PhysicalDeviceFeatures).cast::<vk::Bool32>(),
            COUNT,
        )
    }
}

/// True if every feature set in `required` is also set in `available`.
///
/// Features left unset in `required` are never a requirement.
pub fn supports_features(
    required: &vk::PhysicalDeviceFeatures,
    available: &vk::PhysicalDeviceFeatures,
) -> bool {
    feature_bits(required)
        .iter()
        .zip(feature_bits(available))
        .all(|(&req, &avail)| req == vk::FALSE || avail != vk::FALSE)
}

fn type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        _ => 2,
    }
}

/// Pick the device to create a logical device on.
///
/// Devices missing a required feature or a graphics+compute queue family
/// are rejected. Among the rest a discrete GPU wins over an integrated
/// one, which wins over anything else; ties go to enumeration order.
pub fn select_physical_device<'a>(
    devices: &'a [PhysicalDeviceInfo],
    required: &vk::PhysicalDeviceFeatures,
) -> Option<&'a PhysicalDeviceInfo> {
    devices
        .iter()
        .filter(|dev| {
            if dev.queue_family.is_none() {
                tracing::debug!(
                    "Skipping {:?}: no graphics+compute queue family",
                    dev.name
                );
                return false;
            }
            if !supports_features(required, &dev.features) {
                tracing::debug!(
                    "Skipping {:?}: missing required features",
                    dev.name
                );
                return false;
            }
            true
        })
        .min_by_key(|dev| type_rank(dev.device_type))
}

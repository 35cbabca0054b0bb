//! The backend-neutral device interface.
//!
//! A [`GpuDevice`] walks the [`DeviceState`] chain in `init`, hands out
//! buffers and textures while `Running`, and walks the chain back down
//! in `shutdown`.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::AllocationError;
use thiserror::Error;

use crate::allocator::AllocatorCreationError;
use crate::buffer::{Buffer, BufferCreateInfo};
use crate::debug::VulkanLogLevel;
use crate::device::CreateDeviceError;
use crate::instance::{
    FetchPhysicalDeviceError, InstanceCreationError, VkVersion,
};
use crate::surface::{CreateSurfaceError, SurfaceSupportError};
use crate::swapchain::CreateSwapchainError;
use crate::texture::{Texture, TextureCreateInfo, TextureDescError};
use crate::window::WindowSource;

/// Bring-up progress of a device. Each step is reached only after every
/// earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceState {
    Uninitialized,
    InstanceReady,
    DeviceReady,
    SurfaceReady,
    SwapchainReady,
    AllocatorReady,
    Running,
    Destroyed,
}

/// Coarse outcome of a device call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    Failed = -1,
    NotImplemented = -2,
}

impl ResultCode {
    pub fn of<T>(result: &Result<T, CreateResourceError>) -> Self {
        match result {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GpuDeviceConfig {
    pub app_name: String,
    pub app_version: VkVersion,
    pub validation: bool,
    pub debug_utils: bool,
    pub messenger_log_level: VulkanLogLevel,
    pub debug_printf: bool,
    /// Every feature set here must be present on the chosen device.
    pub required_features: vk::PhysicalDeviceFeatures,
    pub device_extensions: Vec<&'static std::ffi::CStr>,
    pub preferred_format: Option<vk::Format>,
}

impl Default for GpuDeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "Application".to_owned(),
            app_version: VkVersion::new(0, 0, 1),
            validation: cfg!(debug_assertions),
            debug_utils: cfg!(debug_assertions),
            messenger_log_level: VulkanLogLevel::Verbose,
            debug_printf: true,
            required_features: vk::PhysicalDeviceFeatures::default(),
            device_extensions: vec![ash::khr::swapchain::NAME],
            preferred_format: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("init called on a device in state {0:?}")]
    InvalidState(DeviceState),
    #[error("Instance creation failed: {0}")]
    Instance(#[from] InstanceCreationError),
    #[error("Couldn't enumerate physical devices: {0}")]
    EnumeratePhysicalDevices(#[from] FetchPhysicalDeviceError),
    #[error("No physical device has the required features")]
    NoCompatibleDevice,
    #[error("Device creation failed: {0}")]
    Device(#[from] CreateDeviceError),
    #[error("Surface creation failed: {0}")]
    Surface(#[from] CreateSurfaceError),
    #[error("Couldn't check present support: {0}")]
    PresentSupport(#[from] SurfaceSupportError),
    #[error("The selected queue family can't present to the window surface")]
    NoPresentSupport,
    #[error("Swapchain creation failed: {0}")]
    Swapchain(#[from] CreateSwapchainError),
    #[error("Allocator creation failed: {0}")]
    Allocator(#[from] AllocatorCreationError),
}

#[derive(Debug, Error)]
pub enum CreateResourceError {
    #[error("Device is not running (state {0:?})")]
    NotRunning(DeviceState),
    #[error("Invalid buffer size {size} (must be in 1..={max})")]
    InvalidSize {
        size: vk::DeviceSize,
        max: vk::DeviceSize,
    },
    #[error("Invalid texture description: {0}")]
    InvalidTexture(#[from] TextureDescError),
    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),
    #[error("Vulkan error creating image: {0}")]
    CreateImage(vk::Result),
    #[error("Memory allocation failed: {0}")]
    AllocateMemory(AllocationError),
    #[error("Vulkan error binding memory: {0}")]
    BindMemory(vk::Result),
    #[error("Swapchain creation failed: {0}")]
    Swapchain(#[from] CreateSwapchainError),
    #[error("Not implemented by this backend")]
    NotImplemented,
}

impl CreateResourceError {
    pub fn code(&self) -> ResultCode {
        match self {
            CreateResourceError::NotImplemented => ResultCode::NotImplemented,
            _ => ResultCode::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum DestroyResourceError {
    #[error("Device is not running (state {0:?})")]
    NotRunning(DeviceState),
    #[error("{0:?} was created by a different device")]
    ForeignResource(String),
    #[error("{0:?} was already destroyed")]
    AlreadyDestroyed(String),
}

impl DestroyResourceError {
    pub fn code(&self) -> ResultCode {
        ResultCode::Failed
    }
}

/// A GPU backend presenting to windows of type `W`.
///
/// Calls are expected from a single owning thread. Resources it hands
/// out may be shared freely.
pub trait GpuDevice<W: WindowSource> {
    /// Bring the device from `Uninitialized` to `Running`, presenting to
    /// `window`. On failure the state is left at the last completed step.
    fn init(&mut self, window: Arc<W>) -> Result<(), InitError>;

    /// Wait for the device to go idle and tear down everything `init`
    /// built, in reverse. Safe to call any number of times.
    fn shutdown(&mut self);

    fn state(&self) -> DeviceState;

    fn create_buffer(
        &self,
        info: &BufferCreateInfo<'_>,
    ) -> Result<Buffer, CreateResourceError>;

    fn destroy_buffer(
        &self,
        buffer: &Buffer,
    ) -> Result<(), DestroyResourceError>;

    fn create_texture(
        &self,
        info: &TextureCreateInfo<'_>,
    ) -> Result<Texture, CreateResourceError>;

    fn destroy_texture(
        &self,
        texture: &Texture,
    ) -> Result<(), DestroyResourceError>;

    /// Rebuild the swapchain for the window's current size.
    fn create_swapchain(&mut self) -> Result<(), CreateResourceError> {
        Err(CreateResourceError::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered_by_bring_up() {
        use DeviceState as S;
        let chain = [
            S::Uninitialized,
            S::InstanceReady,
            S::DeviceReady,
            S::SurfaceReady,
            S::SwapchainReady,
            S::AllocatorReady,
            S::Running,
            S::Destroyed,
        ];
        assert!(chain.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn result_codes() {
        let ok: Result<(), CreateResourceError> = Ok(());
        assert_eq!(ResultCode::of(&ok), ResultCode::Success);

        let failed: Result<(), _> =
            Err(CreateResourceError::InvalidSize { size: 0, max: 1 });
        assert_eq!(ResultCode::of(&failed), ResultCode::Failed);

        let missing: Result<(), _> = Err(CreateResourceError::NotImplemented);
        assert_eq!(ResultCode::of(&missing), ResultCode::NotImplemented);

        let destroy = DestroyResourceError::AlreadyDestroyed("b".into());
        assert_eq!(destroy.code(), ResultCode::Failed);
        assert_eq!(ResultCode::NotImplemented as i32, -2);
    }

    #[test]
    fn default_config_requests_swapchain() {
        let config = GpuDeviceConfig::default();
        assert_eq!(config.app_name, "Application");
        assert_eq!(config.app_version, VkVersion::new(0, 0, 1));
        assert_eq!(config.device_extensions, [ash::khr::swapchain::NAME]);
        assert_eq!(config.validation, cfg!(debug_assertions));
        assert!(config.preferred_format.is_none());
    }
}

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::instance::Instance;
use crate::window::WindowSource;

#[derive(Debug, Error)]
pub enum CreateSurfaceError {
    #[error("Window has no usable display handle: {0}")]
    InvalidDisplayHandle(raw_window_handle::HandleError),
    #[error("Window has no usable window handle: {0}")]
    InvalidWindowHandle(raw_window_handle::HandleError),
    #[error("vkCreate*SurfaceKHR failed: {0}")]
    VulkanError(vk::Result),
    #[error("Instance was created without surface extensions")]
    MissingExtension,
}

#[derive(Debug, Error)]
pub enum SurfaceSupportError {
    #[error("Instance was created without surface extensions")]
    ExtensionNotLoaded,
    #[error("Present support query failed: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum SurfaceQueryError {
    #[error("Instance was created without surface extensions")]
    ExtensionNotLoaded,
    #[error("Surface support query failed: {0}")]
    Vulkan(vk::Result),
}

/// What a physical device can do with a surface right now. Stale after
/// any resize.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// The presentation target of one window.
///
/// Holds the window as well as the instance; the surface dies with
/// either.
pub struct Surface<W: WindowSource> {
    instance: Arc<Instance>,
    window: Arc<W>,
    handle: vk::SurfaceKHR,
}

impl<W: WindowSource> std::fmt::Debug for Surface<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.handle)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl<W: WindowSource> Surface<W> {
    /// # Safety
    /// Drop the surface whenever the platform invalidates it (winit
    /// suspend on Android). GPU work that presents to it must be
    /// finished by the time it drops.
    pub unsafe fn new(
        instance: &Arc<Instance>,
        window: Arc<W>,
    ) -> Result<Self, CreateSurfaceError> {
        // SAFETY: the window Arc stored below keeps the handles alive.
        let handle = unsafe { instance.create_raw_surface(window.as_ref()) }?;
        Ok(Self {
            instance: Arc::clone(instance),
            window,
            handle,
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn raw_handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// The window's client area as it is now, not at creation.
    pub fn window_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.window.width(),
            height: self.window.height(),
        }
    }

    /// # Safety
    /// `physical` must come from this surface's instance.
    pub unsafe fn supports_queue_family(
        &self,
        physical: vk::PhysicalDevice,
        family: u32,
    ) -> Result<bool, SurfaceSupportError> {
        // SAFETY: self.handle is ours, physical is the caller's.
        unsafe {
            self.instance
                .raw_queue_family_presents(physical, family, self.handle)
        }
    }

    /// # Safety
    /// `physical` must come from this surface's instance.
    pub unsafe fn query_support(
        &self,
        physical: vk::PhysicalDevice,
    ) -> Result<SurfaceSupport, SurfaceQueryError> {
        // SAFETY: self.handle is ours, physical is the caller's.
        unsafe { self.instance.query_raw_surface_support(physical, self.handle) }
    }
}

impl<W: WindowSource> Drop for Surface<W> {
    fn drop(&mut self) {
        tracing::debug!("Destroying surface {:?}", self.handle);
        // SAFETY: swapchains hold an Arc to us, so none is left.
        unsafe { self.instance.destroy_raw_surface(self.handle) };
    }
}

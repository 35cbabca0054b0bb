//! The Vulkan implementation of [`GpuDevice`].

use std::sync::Arc;

use crate::allocator::{Allocator, ResourceAllocator};
use crate::buffer::{Buffer, BufferCreateInfo};
use crate::debug::DebugMessenger;
use crate::device::Device;
use crate::gpu_device::{
    CreateResourceError, DestroyResourceError, DeviceState, GpuDevice,
    GpuDeviceConfig, InitError,
};
use crate::instance::{Instance, InstanceDesc};
use crate::physical;
use crate::surface::Surface;
use crate::swapchain::Swapchain;
use crate::texture::{Texture, TextureCreateInfo};
use crate::window::WindowSource;

/// Owns every backend object for one window.
///
/// `init` fills the slots top to bottom; `shutdown` empties them bottom
/// to top.
pub struct VulkanGpuDevice<W: WindowSource> {
    config: GpuDeviceConfig,
    state: DeviceState,
    debug_messenger: Option<DebugMessenger>,
    allocator: Option<Arc<dyn ResourceAllocator>>,
    swapchain: Option<Swapchain<W>>,
    surface: Option<Arc<Surface<W>>>,
    device: Option<Arc<Device>>,
    instance: Option<Arc<Instance>>,
    window: Option<Arc<W>>,
}

impl<W: WindowSource> std::fmt::Debug for VulkanGpuDevice<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanGpuDevice")
            .field("state", &self.state)
            .field("device", &self.device)
            .field("swapchain", &self.swapchain)
            .finish_non_exhaustive()
    }
}

impl<W: WindowSource> Default for VulkanGpuDevice<W> {
    fn default() -> Self {
        Self::new(GpuDeviceConfig::default())
    }
}

impl<W: WindowSource> VulkanGpuDevice<W> {
    pub fn new(config: GpuDeviceConfig) -> Self {
        Self {
            config,
            state: DeviceState::Uninitialized,
            debug_messenger: None,
            allocator: None,
            swapchain: None,
            surface: None,
            device: None,
            instance: None,
            window: None,
        }
    }

    pub fn config(&self) -> &GpuDeviceConfig {
        &self.config
    }

    pub fn instance(&self) -> Option<&Arc<Instance>> {
        self.instance.as_ref()
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    pub fn swapchain(&self) -> Option<&Swapchain<W>> {
        self.swapchain.as_ref()
    }

    pub fn debug_messenger(&self) -> Option<&DebugMessenger> {
        self.debug_messenger.as_ref()
    }

    fn advance(&mut self, state: DeviceState) {
        tracing::debug!("GPU device state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn running_allocator(&self) -> Option<&Arc<dyn ResourceAllocator>> {
        match self.state {
            DeviceState::Running => self.allocator.as_ref(),
            _ => None,
        }
    }

    fn init_chain(&mut self, window: Arc<W>) -> Result<(), InitError> {
        let config = &self.config;
        let desc = InstanceDesc {
            app_name: &config.app_name,
            app_version: config.app_version,
            validation: config.validation,
            debug_utils: config.debug_utils,
            debug_printf: config.debug_printf,
            messenger_log_level: config.messenger_log_level,
        };
        //SAFETY: Loads vulkan via libloading. The instance is only
        //destroyed after every object created from it.
        let instance =
            Arc::new(unsafe { Instance::new(&desc, Some(window.as_ref())) }?);
        self.window = Some(Arc::clone(&window));
        self.instance = Some(Arc::clone(&instance));
        self.advance(DeviceState::InstanceReady);

        let candidates = physical::enumerate(&instance)?;
        for candidate in &candidates {
            tracing::debug!(
                "Found physical device {:?} ({:?}, api {})",
                candidate.name,
                candidate.device_type,
                candidate.api_version
            );
        }
        let chosen = physical::select_physical_device(
            &candidates,
            &self.config.required_features,
        )
        .ok_or(InitError::NoCompatibleDevice)?;
        let device = Arc::new(Device::new(
            &instance,
            chosen,
            &self.config.device_extensions,
            &self.config.required_features,
        )?);
        self.device = Some(Arc::clone(&device));
        self.advance(DeviceState::DeviceReady);

        //SAFETY: The surface is dropped in shutdown, after the device has
        //gone idle and before the instance.
        let surface =
            Arc::new(unsafe { Surface::new(&instance, Arc::clone(&window)) }?);
        self.surface = Some(Arc::clone(&surface));
        self.advance(DeviceState::SurfaceReady);

        // SAFETY: the device's physical device was enumerated from the
        // surface's instance.
        let can_present = unsafe {
            surface.supports_queue_family(
                device.physical_device(),
                device.queue_family(),
            )
        }?;
        if !can_present {
            return Err(InitError::NoPresentSupport);
        }

        let swapchain = Swapchain::new(
            &device,
            &surface,
            surface.window_extent(),
            self.config.preferred_format,
        )?;
        tracing::debug!("Created swapchain {:?}", swapchain);
        self.swapchain = Some(swapchain);
        self.advance(DeviceState::SwapchainReady);

        let allocator = Allocator::new(&device, self.config.debug_utils)?;
        self.allocator = Some(Arc::new(allocator));
        self.advance(DeviceState::AllocatorReady);

        if self.config.debug_utils && instance.has_debug_utils() {
            match DebugMessenger::new(
                &instance,
                self.config.messenger_log_level,
            ) {
                Ok(messenger) => self.debug_messenger = Some(messenger),
                Err(e) => {
                    tracing::warn!("Couldn't create debug messenger: {e}")
                }
            }
        }

        self.advance(DeviceState::Running);
        Ok(())
    }
}

impl<W: WindowSource> GpuDevice<W> for VulkanGpuDevice<W> {
    fn init(&mut self, window: Arc<W>) -> Result<(), InitError> {
        if self.state != DeviceState::Uninitialized {
            return Err(InitError::InvalidState(self.state));
        }
        let _span = tracing::debug_span!("gpu_device_init").entered();
        self.init_chain(window).inspect_err(|e| {
            onyx_log::fatal!(
                "GPU device initialization stopped at {:?}: {e}",
                self.state
            )
        })
    }

    fn shutdown(&mut self) {
        if self.state == DeviceState::Destroyed {
            return;
        }
        let _span = tracing::debug_span!("gpu_device_shutdown").entered();

        if let Some(device) = &self.device
            && let Err(e) = device.wait_idle()
        {
            tracing::error!("Error while waiting for device idle: {e}");
        }

        self.debug_messenger = None;
        if let Some(allocator) = self.allocator.take() {
            let outstanding = Arc::strong_count(&allocator) - 1;
            if outstanding > 0 {
                tracing::warn!(
                    "{outstanding} resources are still alive at shutdown; \
                     the allocator is released when the last one drops"
                );
            }
        }
        self.swapchain = None;
        self.surface = None;
        self.device = None;
        self.instance = None;
        self.window = None;

        self.advance(DeviceState::Destroyed);
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn create_buffer(
        &self,
        info: &BufferCreateInfo<'_>,
    ) -> Result<Buffer, CreateResourceError> {
        let Some(allocator) = self.running_allocator() else {
            tracing::error!(
                "Can't create buffer {:?} while the device is {:?}",
                info.name,
                self.state
            );
            return Err(CreateResourceError::NotRunning(self.state));
        };
        Buffer::create(allocator, info)
    }

    fn destroy_buffer(
        &self,
        buffer: &Buffer,
    ) -> Result<(), DestroyResourceError> {
        let allocator = self
            .running_allocator()
            .ok_or(DestroyResourceError::NotRunning(self.state))?;
        buffer.destroy(allocator)
    }

    fn create_texture(
        &self,
        info: &TextureCreateInfo<'_>,
    ) -> Result<Texture, CreateResourceError> {
        let Some(allocator) = self.running_allocator() else {
            tracing::error!(
                "Can't create texture {:?} while the device is {:?}",
                info.name,
                self.state
            );
            return Err(CreateResourceError::NotRunning(self.state));
        };
        Texture::create(allocator, info)
    }

    fn destroy_texture(
        &self,
        texture: &Texture,
    ) -> Result<(), DestroyResourceError> {
        let allocator = self
            .running_allocator()
            .ok_or(DestroyResourceError::NotRunning(self.state))?;
        texture.destroy(allocator)
    }

    fn create_swapchain(&mut self) -> Result<(), CreateResourceError> {
        let (DeviceState::Running, Some(device), Some(surface)) =
            (self.state, &self.device, &self.surface)
        else {
            return Err(CreateResourceError::NotRunning(self.state));
        };

        let extent = surface.window_extent();
        if extent.width == 0 || extent.height == 0 {
            tracing::trace!(
                "Skipping swapchain recreate because window extent is zero: \
                 {}x{}",
                extent.width,
                extent.height
            );
            return Ok(());
        }
        if let Some(existing) = &self.swapchain
            && existing.extent() == extent
        {
            return Ok(());
        }

        let _span = tracing::debug_span!(
            "swapchain_recreate",
            width = extent.width,
            height = extent.height
        )
        .entered();
        if let Err(e) = device.wait_idle() {
            tracing::error!("Error while waiting for device idle: {e}");
        }
        let swapchain = Swapchain::new_with_old(
            device,
            surface,
            extent,
            self.swapchain.as_ref(),
            self.config.preferred_format,
        )
        .inspect_err(|e| {
            tracing::error!("Error while recreating swapchain: {e}")
        })?;
        self.swapchain = Some(swapchain);
        Ok(())
    }
}

impl<W: WindowSource> Drop for VulkanGpuDevice<W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MemoryUsage;
    use crate::buffer::tests::FakeAllocator;
    use ash::vk;
    use raw_window_handle::{
        DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle,
        WindowHandle,
    };

    struct HeadlessWindow;

    impl HasDisplayHandle for HeadlessWindow {
        fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    impl HasWindowHandle for HeadlessWindow {
        fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    impl WindowSource for HeadlessWindow {
        fn width(&self) -> u32 {
            0
        }

        fn height(&self) -> u32 {
            0
        }
    }

    fn buffer_info() -> BufferCreateInfo<'static> {
        BufferCreateInfo {
            name: "early",
            size: 64,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory: MemoryUsage::CpuToGpu,
        }
    }

    #[test]
    fn resources_need_a_running_device() {
        let mut gpu = VulkanGpuDevice::<HeadlessWindow>::default();
        assert_eq!(gpu.state(), DeviceState::Uninitialized);
        assert!(matches!(
            gpu.create_buffer(&buffer_info()),
            Err(CreateResourceError::NotRunning(DeviceState::Uninitialized))
        ));
        assert!(matches!(
            gpu.create_texture(&TextureCreateInfo::default()),
            Err(CreateResourceError::NotRunning(_))
        ));
        assert!(matches!(
            gpu.create_swapchain(),
            Err(CreateResourceError::NotRunning(_))
        ));

        let elsewhere = FakeAllocator::shared(1024);
        let buffer = Buffer::create(&elsewhere, &buffer_info()).unwrap();
        assert!(matches!(
            gpu.destroy_buffer(&buffer),
            Err(DestroyResourceError::NotRunning(_))
        ));
        assert!(!buffer.is_destroyed());
    }

    #[test]
    fn running_device_serves_resources_and_outlives_shutdown() {
        use onyx_log::{ConsoleLayer, MemoryWriter, SeverityFlags};
        use tracing_subscriber::layer::SubscriberExt;

        let fake = Arc::new(FakeAllocator::new(1 << 20));
        let tracker = Arc::downgrade(&fake);
        let shared: Arc<dyn ResourceAllocator> = fake;
        let mut gpu = VulkanGpuDevice::<HeadlessWindow>::default();
        gpu.allocator = Some(shared);
        gpu.state = DeviceState::Running;
        let mut gpu: Box<dyn GpuDevice<HeadlessWindow>> = Box::new(gpu);

        let buffer = gpu.create_buffer(&buffer_info()).unwrap();
        let texture = gpu
            .create_texture(&TextureCreateInfo {
                name: "albedo",
                width: 4,
                height: 4,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tracker.upgrade().unwrap().live(), 2);

        gpu.destroy_texture(&texture).unwrap();
        gpu.destroy_buffer(&buffer).unwrap();
        assert!(texture.is_destroyed());
        assert!(buffer.is_destroyed());
        assert!(matches!(
            gpu.destroy_buffer(&buffer),
            Err(DestroyResourceError::AlreadyDestroyed(_))
        ));

        let elsewhere = FakeAllocator::shared(1024);
        let foreign = Buffer::create(&elsewhere, &buffer_info()).unwrap();
        assert!(matches!(
            gpu.destroy_buffer(&foreign),
            Err(DestroyResourceError::ForeignResource(_))
        ));
        assert!(!foreign.is_destroyed());
        drop(buffer);
        drop(texture);

        let survivor = gpu.create_buffer(&buffer_info()).unwrap();
        let out = MemoryWriter::default();
        let layer = ConsoleLayer::new(SeverityFlags::ALL)
            .with_ansi(false)
            .to_writer(out.clone());
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || gpu.shutdown());

        assert_eq!(gpu.state(), DeviceState::Destroyed);
        assert!(
            out.contents()
                .contains("1 resources are still alive at shutdown")
        );
        assert!(matches!(
            gpu.destroy_buffer(&survivor),
            Err(DestroyResourceError::NotRunning(DeviceState::Destroyed))
        ));
        assert!(!survivor.is_destroyed());
        assert_eq!(tracker.upgrade().unwrap().live(), 1);

        drop(survivor);
        assert!(tracker.upgrade().is_none());
    }

    #[test]
    fn shutdown_is_idempotent_and_final() {
        let mut gpu = VulkanGpuDevice::<HeadlessWindow>::default();
        gpu.shutdown();
        assert_eq!(gpu.state(), DeviceState::Destroyed);
        gpu.shutdown();
        assert_eq!(gpu.state(), DeviceState::Destroyed);
        assert!(gpu.device().is_none());
        assert!(gpu.swapchain().is_none());

        assert!(matches!(
            gpu.init(Arc::new(HeadlessWindow)),
            Err(InitError::InvalidState(DeviceState::Destroyed))
        ));
    }

    #[test]
    fn works_through_the_trait_object() {
        let mut gpu: Box<dyn GpuDevice<HeadlessWindow>> =
            Box::new(VulkanGpuDevice::new(GpuDeviceConfig {
                app_name: "trait object".to_owned(),
                ..Default::default()
            }));
        assert_eq!(gpu.state(), DeviceState::Uninitialized);
        gpu.shutdown();
        assert_eq!(gpu.state(), DeviceState::Destroyed);
    }
}

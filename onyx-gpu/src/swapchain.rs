//! Presentable image chain for a [`Surface`].
//!
//! Every decision about how the chain looks is made by
//! [`SwapchainPlan::choose`] from a [`SurfaceSupport`] snapshot, so it
//! can be checked without a GPU. [`Swapchain::new_with_old`] turns a
//! plan into Vulkan objects, optionally retiring a previous chain.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::surface::{Surface, SurfaceQueryError, SurfaceSupport};
use crate::window::WindowSource;

#[derive(Debug, Error)]
pub enum CreateSwapchainError {
    #[error("Device, surface and old swapchain don't share an instance")]
    MismatchedParams,
    #[error("Surface reports no formats")]
    NoSurfaceFormats,
    #[error("Swapchain extent {width}x{height} has a zero side")]
    InvalidExtent { width: u32, height: u32 },
    #[error("VK_KHR_swapchain is not enabled on this device")]
    SwapchainNotEnabled,
    #[error("Surface query failed: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),
    #[error("vkCreateSwapchainKHR failed: {0}")]
    VulkanCreate(vk::Result),
    #[error("vkGetSwapchainImagesKHR failed: {0}")]
    VulkanGetImages(vk::Result),
    #[error("Creating a swapchain image view failed: {0}")]
    VulkanCreateImageView(vk::Result),
}

/// Tried in order; FIFO is guaranteed and is the fallback.
const PRESENT_MODES: [vk::PresentModeKHR; 3] = [
    vk::PresentModeKHR::MAILBOX,
    vk::PresentModeKHR::IMMEDIATE,
    vk::PresentModeKHR::FIFO_RELAXED,
];

const COMPOSITE_ALPHA: [vk::CompositeAlphaFlagsKHR; 3] = [
    vk::CompositeAlphaFlagsKHR::OPAQUE,
    vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
];

/// The shape of a swapchain, decided before anything is created.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
}

impl SwapchainPlan {
    /// Pick every swapchain parameter for `support`.
    ///
    /// The format is `preferred` when offered and otherwise the first
    /// one reported. Fails only when the surface reports no formats.
    pub fn choose(
        support: &SurfaceSupport,
        desired: vk::Extent2D,
        preferred: Option<vk::Format>,
    ) -> Result<Self, CreateSwapchainError> {
        let caps = &support.capabilities;
        let surface_format = preferred
            .and_then(|want| {
                support.formats.iter().find(|f| f.format == want)
            })
            .or_else(|| support.formats.first())
            .copied()
            .ok_or(CreateSwapchainError::NoSurfaceFormats)?;

        let present_mode = PRESENT_MODES
            .into_iter()
            .find(|mode| support.present_modes.contains(mode))
            .unwrap_or(vk::PresentModeKHR::FIFO);

        // u32::MAX in current_extent means the window lets us decide.
        let extent = if caps.current_extent.width == u32::MAX {
            vk::Extent2D {
                width: desired.width.clamp(
                    caps.min_image_extent.width,
                    caps.max_image_extent.width,
                ),
                height: desired.height.clamp(
                    caps.min_image_extent.height,
                    caps.max_image_extent.height,
                ),
            }
        } else {
            caps.current_extent
        };

        // max_image_count of 0 means unbounded.
        let wanted = caps.min_image_count.saturating_add(1).max(1);
        let image_count = match caps.max_image_count {
            0 => wanted,
            max => wanted.min(max),
        };

        let transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let composite_alpha = COMPOSITE_ALPHA
            .into_iter()
            .find(|&alpha| caps.supported_composite_alpha.contains(alpha))
            .unwrap_or(vk::CompositeAlphaFlagsKHR::INHERIT);

        Ok(Self {
            surface_format,
            present_mode,
            extent,
            image_count,
            transform,
            composite_alpha,
        })
    }
}

/// Creates, names and destroys views. Split out so view bookkeeping can
/// be tested against a fake.
trait ViewFactory {
    fn create(
        &mut self,
        info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result>;
    fn destroy(&mut self, view: vk::ImageView);
    fn name(&mut self, index: usize, view: vk::ImageView);
}

/// A colour view for each image. Either every view is made or, on
/// failure, the ones made so far are destroyed again.
fn build_views(
    images: &[vk::Image],
    format: vk::Format,
    factory: &mut impl ViewFactory,
) -> Result<Vec<vk::ImageView>, CreateSwapchainError> {
    let color = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1);
    let mut views = Vec::with_capacity(images.len());
    for (index, &image) in images.iter().enumerate() {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(color);
        match factory.create(&info) {
            Ok(view) => {
                factory.name(index, view);
                views.push(view);
            }
            Err(e) => {
                views.drain(..).for_each(|view| factory.destroy(view));
                return Err(CreateSwapchainError::VulkanCreateImageView(e));
            }
        }
    }
    Ok(views)
}

/// Views made directly on a [`Device`], named after their swapchain
/// generation.
struct DeviceViews<'a> {
    device: &'a Device,
    serial: u64,
}

impl ViewFactory for DeviceViews<'_> {
    fn create(
        &mut self,
        info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: info.image is a swapchain image of self.device.
        unsafe { self.device.create_raw_image_view(info) }
    }

    fn destroy(&mut self, view: vk::ImageView) {
        // SAFETY: view was made by create above and never handed out.
        unsafe { self.device.destroy_raw_image_view(view) };
    }

    fn name(&mut self, index: usize, view: vk::ImageView) {
        let serial = self.serial;
        // SAFETY: view is live and owned by self.device.
        let named = unsafe {
            self.device.set_object_name_with(view, || {
                CString::new(format!("Swapchain {serial} View {}", index + 1))
                    .ok()
            })
        };
        if let Err(e) = named {
            tracing::warn!("Could not name swapchain view {view:?}: {e}");
        }
    }
}

pub struct Swapchain<W: WindowSource> {
    device: Arc<Device>,
    surface: Arc<Surface<W>>,
    handle: vk::SwapchainKHR,
    plan: SwapchainPlan,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
}

impl<W: WindowSource> std::fmt::Debug for Swapchain<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("plan", &self.plan)
            .field("images", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl<W: WindowSource> Swapchain<W> {
    pub fn new(
        device: &Arc<Device>,
        surface: &Arc<Surface<W>>,
        desired_extent: vk::Extent2D,
        preferred_format: Option<vk::Format>,
    ) -> Result<Self, CreateSwapchainError> {
        Self::new_with_old(
            device,
            surface,
            desired_extent,
            None,
            preferred_format,
        )
    }

    /// Build a swapchain, retiring `old` if given.
    ///
    /// `old` must come from the same device and surface. The driver
    /// retires it, but its images stay valid until the caller drops it.
    /// Surface support is queried fresh on every call.
    pub fn new_with_old(
        device: &Arc<Device>,
        surface: &Arc<Surface<W>>,
        desired_extent: vk::Extent2D,
        old: Option<&Self>,
        preferred_format: Option<vk::Format>,
    ) -> Result<Self, CreateSwapchainError> {
        if !device.has_swapchain_support() {
            return Err(CreateSwapchainError::SwapchainNotEnabled);
        }
        if desired_extent.width == 0 || desired_extent.height == 0 {
            return Err(CreateSwapchainError::InvalidExtent {
                width: desired_extent.width,
                height: desired_extent.height,
            });
        }
        let same_instance = Arc::ptr_eq(surface.instance(), device.parent());
        let same_parents = old.is_none_or(|old| {
            Arc::ptr_eq(&old.device, device)
                && Arc::ptr_eq(&old.surface, surface)
        });
        if !same_instance || !same_parents {
            return Err(CreateSwapchainError::MismatchedParams);
        }

        // SAFETY: device and surface share an instance, checked above.
        let support = unsafe { surface.query_support(device.physical_device()) }?;
        let plan =
            SwapchainPlan::choose(&support, desired_extent, preferred_format)?;
        tracing::debug!("Building swapchain: {plan:?}");

        let families = [device.queue_family()];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw_handle())
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&families)
            .pre_transform(plan.transform)
            .composite_alpha(plan.composite_alpha)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |o| o.handle));

        // SAFETY: every handle in create_info belongs to device or its
        // instance, and old is still alive.
        let handle = unsafe { device.create_raw_swapchain(&create_info) }?;
        let serial = device.next_swapchain_serial();
        // SAFETY: handle was just created on device.
        let named = unsafe {
            device.set_object_name_with(handle, || {
                CString::new(format!("Swapchain {serial}")).ok()
            })
        };
        if let Err(e) = named {
            tracing::warn!("Could not name swapchain {handle:?}: {e}");
        }

        let images_and_views = (|| -> Result<_, CreateSwapchainError> {
            // SAFETY: handle is live and made by device.
            let images = unsafe { device.get_raw_swapchain_images(handle) }?;
            for (index, &image) in images.iter().enumerate() {
                // SAFETY: swapchain images belong to device.
                let named = unsafe {
                    device.set_object_name_with(image, || {
                        let name =
                            format!("Swapchain {serial} Image {}", index + 1);
                        CString::new(name).ok()
                    })
                };
                if let Err(e) = named {
                    tracing::warn!("Could not name swapchain image: {e}");
                }
            }
            let mut factory = DeviceViews { device, serial };
            let views = build_views(
                &images,
                plan.surface_format.format,
                &mut factory,
            )?;
            Ok((images, views))
        })();
        let (images, views) = match images_and_views {
            Ok(parts) => parts,
            Err(e) => {
                // SAFETY: handle never escaped this function.
                unsafe { device.destroy_raw_swapchain(handle) };
                return Err(e);
            }
        };

        Ok(Self {
            device: Arc::clone(device),
            surface: Arc::clone(surface),
            handle,
            plan,
            images,
            views,
        })
    }

    pub fn plan(&self) -> &SwapchainPlan {
        &self.plan
    }

    pub fn format(&self) -> vk::Format {
        self.plan.surface_format.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.plan.surface_format.color_space
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.plan.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }

    pub fn raw_handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn surface(&self) -> &Arc<Surface<W>> {
        &self.surface
    }
}

impl<W: WindowSource> Drop for Swapchain<W> {
    fn drop(&mut self) {
        tracing::debug!("Destroying swapchain {:?}", self.handle);
        // The owner waits for the device to go idle before dropping us.
        for view in self.views.drain(..) {
            // SAFETY: views are ours and destroyed exactly here.
            unsafe { self.device.destroy_raw_image_view(view) };
        }
        // SAFETY: its views are gone and nothing else holds the handle.
        unsafe { self.device.destroy_raw_swapchain(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn srgb(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn support() -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                current_extent: extent(800, 600),
                min_image_count: 2,
                supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                ..Default::default()
            },
            formats: vec![
                srgb(vk::Format::R8G8B8A8_UNORM),
                srgb(vk::Format::B8G8R8A8_SRGB),
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }

    fn plan(support: &SurfaceSupport) -> SwapchainPlan {
        SwapchainPlan::choose(support, extent(1920, 1080), None)
            .expect("surface has formats")
    }

    #[test]
    fn format_is_preferred_then_first() {
        let support = support();
        assert_eq!(
            plan(&support).surface_format.format,
            vk::Format::R8G8B8A8_UNORM
        );

        let chosen = SwapchainPlan::choose(
            &support,
            extent(1, 1),
            Some(vk::Format::B8G8R8A8_SRGB),
        )
        .map(|p| p.surface_format.format);
        assert_eq!(chosen.ok(), Some(vk::Format::B8G8R8A8_SRGB));

        let chosen = SwapchainPlan::choose(
            &support,
            extent(1, 1),
            Some(vk::Format::R16G16B16A16_SFLOAT),
        )
        .map(|p| p.surface_format.format);
        assert_eq!(chosen.ok(), Some(vk::Format::R8G8B8A8_UNORM));
    }

    #[test]
    fn no_formats_is_an_error() {
        let mut support = support();
        support.formats.clear();
        let result = SwapchainPlan::choose(
            &support,
            extent(1, 1),
            Some(vk::Format::B8G8R8A8_SRGB),
        );
        assert!(matches!(result, Err(CreateSwapchainError::NoSurfaceFormats)));
    }

    #[test]
    fn present_mode_preference() {
        use vk::PresentModeKHR as P;
        let mut support = support();
        let mut mode_for = |modes: &[P]| {
            support.present_modes = modes.to_vec();
            plan(&support).present_mode
        };
        assert_eq!(mode_for(&[P::FIFO]), P::FIFO);
        assert_eq!(mode_for(&[P::FIFO, P::IMMEDIATE, P::MAILBOX]), P::MAILBOX);
        assert_eq!(mode_for(&[P::FIFO_RELAXED, P::IMMEDIATE]), P::IMMEDIATE);
        assert_eq!(mode_for(&[P::FIFO, P::FIFO_RELAXED]), P::FIFO_RELAXED);
        assert_eq!(mode_for(&[]), P::FIFO);
        assert_eq!(mode_for(&[P::SHARED_DEMAND_REFRESH]), P::FIFO);
    }

    #[test]
    fn fixed_extent_wins_over_desired() {
        assert_eq!(plan(&support()).extent, extent(800, 600));
    }

    #[test]
    fn free_extent_is_clamped() {
        let mut support = support();
        let caps = &mut support.capabilities;
        caps.current_extent = extent(u32::MAX, u32::MAX);
        caps.min_image_extent = extent(640, 480);
        caps.max_image_extent = extent(1920, 1080);
        let chosen = SwapchainPlan::choose(&support, extent(4000, 200), None)
            .map(|p| p.extent);
        assert_eq!(chosen.ok(), Some(extent(1920, 480)));
    }

    #[test]
    fn image_count_stays_within_bounds() {
        let mut support = support();
        for min in 0..6u32 {
            for max in [0u32, 1, 2, 3, 4, 8] {
                if max != 0 && max < min {
                    continue;
                }
                support.capabilities.min_image_count = min;
                support.capabilities.max_image_count = max;
                let count = plan(&support).image_count;
                assert!(count >= min.max(1), "min {min} max {max}");
                if max == 0 {
                    assert_eq!(count, min + 1);
                } else {
                    assert!(count <= max, "min {min} max {max}");
                }
            }
        }
    }

    #[test]
    fn transform_and_alpha_fallbacks() {
        use vk::CompositeAlphaFlagsKHR as A;
        use vk::SurfaceTransformFlagsKHR as T;
        let mut support = support();
        let caps = &mut support.capabilities;
        caps.supported_transforms = T::ROTATE_90;
        caps.current_transform = T::ROTATE_90;
        caps.supported_composite_alpha = A::PRE_MULTIPLIED | A::INHERIT;
        let chosen = plan(&support);
        assert_eq!(chosen.transform, T::ROTATE_90);
        assert_eq!(chosen.composite_alpha, A::PRE_MULTIPLIED);

        support.capabilities.supported_transforms = T::IDENTITY | T::ROTATE_90;
        support.capabilities.supported_composite_alpha = A::OPAQUE | A::INHERIT;
        let chosen = plan(&support);
        assert_eq!(chosen.transform, T::IDENTITY);
        assert_eq!(chosen.composite_alpha, A::OPAQUE);
    }

    #[derive(Default)]
    struct FakeViews {
        fail_at: Option<usize>,
        made: Vec<vk::ImageView>,
        destroyed: Vec<vk::ImageView>,
        named: Vec<usize>,
        seen: Vec<(vk::Image, vk::ImageViewType, u32, u32)>,
    }

    impl ViewFactory for FakeViews {
        fn create(
            &mut self,
            info: &vk::ImageViewCreateInfo<'_>,
        ) -> Result<vk::ImageView, vk::Result> {
            if self.fail_at == Some(self.made.len()) {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            self.seen.push((
                info.image,
                info.view_type,
                info.subresource_range.level_count,
                info.subresource_range.layer_count,
            ));
            let view = vk::ImageView::from_raw(100 + self.made.len() as u64);
            self.made.push(view);
            Ok(view)
        }

        fn destroy(&mut self, view: vk::ImageView) {
            self.destroyed.push(view);
        }

        fn name(&mut self, index: usize, _view: vk::ImageView) {
            self.named.push(index);
        }
    }

    fn images() -> [vk::Image; 3] {
        [1, 2, 3].map(vk::Image::from_raw)
    }

    #[test]
    fn views_are_cleaned_up_on_partial_failure() {
        let mut fake = FakeViews {
            fail_at: Some(2),
            ..Default::default()
        };
        let result =
            build_views(&images(), vk::Format::B8G8R8A8_UNORM, &mut fake);
        assert!(matches!(
            result,
            Err(CreateSwapchainError::VulkanCreateImageView(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            ))
        ));
        assert_eq!(fake.destroyed, fake.made);
        assert_eq!(fake.destroyed.len(), 2);
    }

    #[test]
    fn one_named_view_per_image() {
        let mut fake = FakeViews::default();
        let views =
            build_views(&images(), vk::Format::B8G8R8A8_UNORM, &mut fake)
                .expect("no failure injected");
        assert_eq!(views, fake.made);
        assert!(fake.destroyed.is_empty());
        assert_eq!(fake.named, [0, 1, 2]);
        for (seen, image) in fake.seen.iter().zip(images()) {
            assert_eq!(*seen, (image, vk::ImageViewType::TYPE_2D, 1, 1));
        }
    }
}

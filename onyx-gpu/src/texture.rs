//! GPU textures and the validation applied to their descriptions.

use std::sync::{Arc, RwLock, RwLockReadGuard};

use ash::vk;
use thiserror::Error;

use crate::allocator::{MemoryUsage, RawImage, ResourceAllocator};
use crate::gpu_device::{CreateResourceError, DestroyResourceError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TextureType {
    D1,
    #[default]
    D2,
    D3,
    /// Six square 2D layers.
    Cube,
}

impl TextureType {
    pub fn image_type(self) -> vk::ImageType {
        match self {
            TextureType::D1 => vk::ImageType::TYPE_1D,
            TextureType::D2 | TextureType::Cube => vk::ImageType::TYPE_2D,
            TextureType::D3 => vk::ImageType::TYPE_3D,
        }
    }

    pub fn array_layers(self) -> u32 {
        match self {
            TextureType::Cube => 6,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SampleCount {
    #[default]
    X1,
    X2,
    X4,
    X8,
    X16,
    X32,
    X64,
}

impl SampleCount {
    pub fn flags(self) -> vk::SampleCountFlags {
        match self {
            SampleCount::X1 => vk::SampleCountFlags::TYPE_1,
            SampleCount::X2 => vk::SampleCountFlags::TYPE_2,
            SampleCount::X4 => vk::SampleCountFlags::TYPE_4,
            SampleCount::X8 => vk::SampleCountFlags::TYPE_8,
            SampleCount::X16 => vk::SampleCountFlags::TYPE_16,
            SampleCount::X32 => vk::SampleCountFlags::TYPE_32,
            SampleCount::X64 => vk::SampleCountFlags::TYPE_64,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextureDescError {
    #[error("Texture extent {0}x{1}x{2} has a zero dimension")]
    ZeroExtent(u32, u32, u32),
    #[error("{requested} mip levels requested, at most {max} fit the extent")]
    InvalidMipLevels { requested: u32, max: u32 },
    #[error("{0:?} texture has extent {1}x{2}x{3}")]
    ExtentMismatch(TextureType, u32, u32, u32),
    #[error("Multisampled textures must be 2D with a single mip level")]
    InvalidMultisample,
}

#[derive(Debug, Clone, Copy)]
pub struct TextureCreateInfo<'a> {
    pub name: &'a str,
    pub texture_type: TextureType,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub sample_count: SampleCount,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory: MemoryUsage,
}

impl Default for TextureCreateInfo<'_> {
    fn default() -> Self {
        Self {
            name: "",
            texture_type: TextureType::D2,
            width: 1,
            height: 1,
            depth: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            mip_levels: 1,
            sample_count: SampleCount::X1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED,
            memory: MemoryUsage::GpuOnly,
        }
    }
}

/// Length of the full mip chain for an extent whose largest side is
/// `max_dim`.
pub fn max_mip_levels(max_dim: u32) -> u32 {
    u32::BITS - max_dim.leading_zeros()
}

impl TextureCreateInfo<'_> {
    pub fn validate(&self) -> Result<(), TextureDescError> {
        let (w, h, d) = (self.width, self.height, self.depth);
        if w == 0 || h == 0 || d == 0 {
            return Err(TextureDescError::ZeroExtent(w, h, d));
        }

        let shape_ok = match self.texture_type {
            TextureType::D1 => h == 1 && d == 1,
            TextureType::D2 => d == 1,
            TextureType::D3 => true,
            TextureType::Cube => w == h && d == 1,
        };
        if !shape_ok {
            return Err(TextureDescError::ExtentMismatch(
                self.texture_type,
                w,
                h,
                d,
            ));
        }

        let max = max_mip_levels(w.max(h).max(d));
        if self.mip_levels == 0 || self.mip_levels > max {
            return Err(TextureDescError::InvalidMipLevels {
                requested: self.mip_levels,
                max,
            });
        }

        if self.sample_count != SampleCount::X1
            && (self.texture_type != TextureType::D2 || self.mip_levels > 1)
        {
            return Err(TextureDescError::InvalidMultisample);
        }
        Ok(())
    }

    /// The `VkImageCreateInfo` for this description, exclusively owned by
    /// the given queue family.
    pub fn image_create_info<'b>(
        &self,
        queue_family_indices: &'b [u32],
    ) -> vk::ImageCreateInfo<'b> {
        let flags = match self.texture_type {
            TextureType::Cube => vk::ImageCreateFlags::CUBE_COMPATIBLE,
            _ => vk::ImageCreateFlags::empty(),
        };
        vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(self.texture_type.image_type())
            .format(self.format)
            .extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: self.depth,
            })
            .mip_levels(self.mip_levels)
            .array_layers(self.texture_type.array_layers())
            .samples(self.sample_count.flags())
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(queue_family_indices)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }
}

/// Handle state of a [`Texture`], read under its lock.
#[derive(Debug)]
pub struct TextureState {
    raw: Option<RawImage>,
    extent: vk::Extent3D,
}

impl TextureState {
    /// The image handle, or null once destroyed.
    pub fn raw_handle(&self) -> vk::Image {
        self.raw.as_ref().map_or(vk::Image::null(), |raw| raw.handle)
    }

    /// Width, height and depth; all zero once destroyed.
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn has_allocation(&self) -> bool {
        self.raw
            .as_ref()
            .is_some_and(|raw| raw.allocation.is_some())
    }

    pub fn is_destroyed(&self) -> bool {
        self.raw.is_none()
    }
}

/// A named image and the memory bound to it. Locking follows
/// [`Buffer`](crate::Buffer).
pub struct Texture {
    name: String,
    texture_type: TextureType,
    format: vk::Format,
    owner: Arc<dyn ResourceAllocator>,
    state: RwLock<TextureState>,
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("name", &self.name)
            .field("texture_type", &self.texture_type)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Texture {
    pub fn create(
        allocator: &Arc<dyn ResourceAllocator>,
        info: &TextureCreateInfo<'_>,
    ) -> Result<Self, CreateResourceError> {
        let result = Self::create_inner(allocator, info);
        if let Err(e) = &result {
            tracing::error!("Failed to create texture {:?}: {e}", info.name);
        }
        result
    }

    fn create_inner(
        allocator: &Arc<dyn ResourceAllocator>,
        info: &TextureCreateInfo<'_>,
    ) -> Result<Self, CreateResourceError> {
        info.validate()?;
        let raw = allocator.create_image(info)?;
        tracing::debug!(
            "Created {:?} texture {:?} ({}x{}x{}): {:?}",
            info.texture_type,
            info.name,
            info.width,
            info.height,
            info.depth,
            raw.handle
        );

        Ok(Self {
            name: info.name.to_owned(),
            texture_type: info.texture_type,
            format: info.format,
            owner: Arc::clone(allocator),
            state: RwLock::new(TextureState {
                raw: Some(raw),
                extent: vk::Extent3D {
                    width: info.width,
                    height: info.height,
                    depth: info.depth,
                },
            }),
        })
    }

    /// Release the texture through `allocator`, which must be the one
    /// that created it. Afterwards the handle is null and the extent is
    /// zero.
    pub fn destroy(
        &self,
        allocator: &Arc<dyn ResourceAllocator>,
    ) -> Result<(), DestroyResourceError> {
        if !std::ptr::addr_eq(Arc::as_ptr(&self.owner), Arc::as_ptr(allocator))
        {
            return Err(DestroyResourceError::ForeignResource(
                self.name.clone(),
            ));
        }

        let mut state = self.state.write().expect("texture lock poisoned");
        let Some(raw) = state.raw.take() else {
            tracing::warn!("Texture {:?} was already destroyed", self.name);
            return Err(DestroyResourceError::AlreadyDestroyed(
                self.name.clone(),
            ));
        };
        tracing::debug!("Destroying texture {:?}: {:?}", self.name, raw.handle);
        state.extent = vk::Extent3D::default();
        self.owner.destroy_image(raw);
        Ok(())
    }

    pub fn read(&self) -> RwLockReadGuard<'_, TextureState> {
        self.state.read().expect("texture lock poisoned")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn texture_type(&self) -> TextureType {
        self.texture_type
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn raw_image(&self) -> vk::Image {
        self.read().raw_handle()
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.read().extent()
    }

    pub fn is_destroyed(&self) -> bool {
        self.read().is_destroyed()
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(raw) = state.raw.take() {
            tracing::debug!(
                "Dropping texture {:?}: {:?}",
                self.name,
                raw.handle
            );
            self.owner.destroy_image(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::tests::FakeAllocator;

    fn desc(
        texture_type: TextureType,
        (width, height, depth): (u32, u32, u32),
    ) -> TextureCreateInfo<'static> {
        TextureCreateInfo {
            name: "test texture",
            texture_type,
            width,
            height,
            depth,
            ..Default::default()
        }
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(max_mip_levels(1), 1);
        assert_eq!(max_mip_levels(2), 2);
        assert_eq!(max_mip_levels(255), 8);
        assert_eq!(max_mip_levels(256), 9);
        assert_eq!(max_mip_levels(u32::MAX), 32);
    }

    #[test]
    fn shapes_are_checked_per_type() {
        use TextureType as T;
        assert!(desc(T::D1, (64, 1, 1)).validate().is_ok());
        assert!(desc(T::D2, (64, 32, 1)).validate().is_ok());
        assert!(desc(T::D3, (64, 32, 8)).validate().is_ok());
        assert!(desc(T::Cube, (32, 32, 1)).validate().is_ok());

        for bad in [
            desc(T::D1, (64, 2, 1)),
            desc(T::D2, (64, 32, 2)),
            desc(T::Cube, (32, 16, 1)),
            desc(T::Cube, (32, 32, 6)),
        ] {
            assert!(matches!(
                bad.validate(),
                Err(TextureDescError::ExtentMismatch(..))
            ));
        }
        assert_eq!(
            desc(T::D2, (0, 32, 1)).validate(),
            Err(TextureDescError::ZeroExtent(0, 32, 1))
        );
    }

    #[test]
    fn mip_levels_bounded_by_extent() {
        let mut info = desc(TextureType::D2, (256, 16, 1));
        info.mip_levels = 9;
        assert!(info.validate().is_ok());
        info.mip_levels = 10;
        assert_eq!(
            info.validate(),
            Err(TextureDescError::InvalidMipLevels {
                requested: 10,
                max: 9
            })
        );
        info.mip_levels = 0;
        assert!(info.validate().is_err());
    }

    #[test]
    fn multisampling_needs_single_mip_2d() {
        let mut info = desc(TextureType::D2, (64, 64, 1));
        info.sample_count = SampleCount::X4;
        assert!(info.validate().is_ok());

        info.mip_levels = 2;
        assert_eq!(info.validate(), Err(TextureDescError::InvalidMultisample));

        let mut cube = desc(TextureType::Cube, (64, 64, 1));
        cube.sample_count = SampleCount::X4;
        assert_eq!(cube.validate(), Err(TextureDescError::InvalidMultisample));
    }

    #[test]
    fn cube_is_layered_2d() {
        let indices = [3];
        let info = desc(TextureType::Cube, (16, 16, 1));
        let ci = info.image_create_info(&indices);
        assert_eq!(ci.image_type, vk::ImageType::TYPE_2D);
        assert_eq!(ci.array_layers, 6);
        assert!(ci.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE));
        assert_eq!(ci.queue_family_index_count, 1);
        assert_eq!(ci.sharing_mode, vk::SharingMode::EXCLUSIVE);

        let ci = desc(TextureType::D3, (4, 4, 4)).image_create_info(&indices);
        assert_eq!(ci.image_type, vk::ImageType::TYPE_3D);
        assert_eq!(ci.array_layers, 1);
        assert_eq!(ci.extent.depth, 4);
    }

    #[test]
    fn destroy_leaves_sentinels() {
        let fake = Arc::new(FakeAllocator::new(u64::MAX));
        let alloc: Arc<dyn ResourceAllocator> = fake.clone();
        for (ty, extent) in [
            (TextureType::D1, (128, 1, 1)),
            (TextureType::D2, (256, 256, 1)),
            (TextureType::D3, (16, 16, 16)),
            (TextureType::Cube, (64, 64, 1)),
        ] {
            let texture = Texture::create(&alloc, &desc(ty, extent)).unwrap();
            assert_ne!(texture.raw_image(), vk::Image::null());
            assert_eq!(texture.extent().width, extent.0);

            texture.destroy(&alloc).unwrap();
            assert_eq!(texture.raw_image(), vk::Image::null());
            assert_eq!(texture.extent(), vk::Extent3D::default());
            assert!(!texture.read().has_allocation());
            assert_eq!(texture.texture_type(), ty);
        }
        assert_eq!(fake.live(), 0);
    }

    #[test]
    fn invalid_description_never_reaches_allocator() {
        let fake = Arc::new(FakeAllocator::new(u64::MAX));
        let alloc: Arc<dyn ResourceAllocator> = fake.clone();
        let err = Texture::create(&alloc, &desc(TextureType::D2, (0, 0, 1)))
            .unwrap_err();
        assert!(matches!(err, CreateResourceError::InvalidTexture(_)));
        assert_eq!(fake.live(), 0);
    }

    #[test]
    fn double_and_foreign_destroy() {
        let ours = FakeAllocator::shared(u64::MAX);
        let theirs = FakeAllocator::shared(u64::MAX);
        let texture =
            Texture::create(&ours, &desc(TextureType::D2, (8, 8, 1))).unwrap();
        assert!(matches!(
            texture.destroy(&theirs),
            Err(DestroyResourceError::ForeignResource(_))
        ));
        texture.destroy(&ours).unwrap();
        assert!(matches!(
            texture.destroy(&ours),
            Err(DestroyResourceError::AlreadyDestroyed(_))
        ));
    }
}

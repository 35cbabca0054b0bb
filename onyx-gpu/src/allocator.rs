//! The memory-allocation binding behind every [`Buffer`](crate::Buffer)
//! and [`Texture`](crate::Texture).
//!
//! [`ResourceAllocator`] is the seam resources are written against;
//! [`Allocator`] implements it with a `gpu-allocator` allocator bound to
//! one (instance, physical device, device) triple.

use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{
    AllocationError, AllocatorDebugSettings, MemoryLocation,
    vulkan::{
        Allocation, AllocationCreateDesc, AllocationScheme,
        Allocator as GpuAllocator, AllocatorCreateDesc,
    },
};
use thiserror::Error;

use crate::buffer::BufferCreateInfo;
use crate::device::{Bindable, Device};
use crate::gpu_device::CreateResourceError;
use crate::texture::TextureCreateInfo;

/// Who reads and writes an allocation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Never mapped. Textures, vertex data, render targets.
    #[default]
    GpuOnly,
    /// Written by the host each frame or once for staging.
    CpuToGpu,
    /// Written by the GPU, read back on the host.
    GpuToCpu,
}

impl MemoryUsage {
    pub fn location(self) -> MemoryLocation {
        match self {
            Self::GpuOnly => MemoryLocation::GpuOnly,
            Self::CpuToGpu => MemoryLocation::CpuToGpu,
            Self::GpuToCpu => MemoryLocation::GpuToCpu,
        }
    }
}

/// 2 for an ideal memory type, 1 for a usable one, `None` when `flags`
/// can't serve `usage` at all.
pub fn score_memory_type(
    flags: vk::MemoryPropertyFlags,
    usage: MemoryUsage,
) -> Option<u32> {
    use vk::MemoryPropertyFlags as F;
    let (required, ideal) = match usage {
        MemoryUsage::GpuOnly => {
            (F::DEVICE_LOCAL, !flags.contains(F::HOST_VISIBLE))
        }
        // Resizable BAR or unified memory.
        MemoryUsage::CpuToGpu => {
            (F::HOST_VISIBLE, flags.contains(F::DEVICE_LOCAL))
        }
        MemoryUsage::GpuToCpu => {
            (F::HOST_VISIBLE, flags.contains(F::HOST_CACHED))
        }
    };
    flags.contains(required).then_some(1 + u32::from(ideal))
}

/// Highest-scoring memory type allowed by `requirements`. Ties go to
/// the lower index.
pub fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    requirements: &vk::MemoryRequirements,
    usage: MemoryUsage,
) -> Option<u32> {
    let count = (props.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
    let mut best: Option<(u32, u32)> = None;
    for (index, ty) in props.memory_types[..count].iter().enumerate() {
        if requirements.memory_type_bits & (1 << index) == 0 {
            continue;
        }
        let Some(score) = score_memory_type(ty.property_flags, usage) else {
            continue;
        };
        if best.is_none_or(|(top, _)| score > top) {
            best = Some((score, index as u32));
        }
    }
    best.map(|(_, index)| index)
}

/// Pin `requirements` to the selected memory type. Host-visible memory
/// without coherence is padded to `atom` so flushes stay in bounds.
fn narrow_requirements(
    props: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    usage: MemoryUsage,
    atom: vk::DeviceSize,
) -> vk::MemoryRequirements {
    use vk::MemoryPropertyFlags as F;
    let Some(index) = select_memory_type(props, &requirements, usage) else {
        return requirements;
    };
    let flags = props.memory_types[index as usize].property_flags;
    let mut narrowed = vk::MemoryRequirements {
        memory_type_bits: 1 << index,
        ..requirements
    };
    if atom > 0
        && flags.contains(F::HOST_VISIBLE)
        && !flags.contains(F::HOST_COHERENT)
    {
        narrowed.size = narrowed.size.next_multiple_of(atom);
        narrowed.alignment = narrowed.alignment.max(atom);
    }
    narrowed
}

/// A buffer handle plus the allocation bound to it.
#[derive(Debug)]
pub struct RawBuffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
}

/// An image handle plus the allocation bound to it.
#[derive(Debug)]
pub struct RawImage {
    pub handle: vk::Image,
    pub allocation: Option<Allocation>,
}

/// Creates and releases the native objects behind buffers and textures.
///
/// Descriptions arrive already validated. Whatever `create_*` returns
/// is handed back to the matching `destroy_*` exactly once.
pub trait ResourceAllocator: Send + Sync + std::fmt::Debug {
    /// Largest size a single buffer allocation may request.
    fn max_allocation_size(&self) -> vk::DeviceSize;

    fn create_buffer(
        &self,
        info: &BufferCreateInfo<'_>,
    ) -> Result<RawBuffer, CreateResourceError>;

    fn destroy_buffer(&self, buffer: RawBuffer);

    fn create_image(
        &self,
        info: &TextureCreateInfo<'_>,
    ) -> Result<RawImage, CreateResourceError>;

    fn destroy_image(&self, image: RawImage);
}

#[derive(Debug, Error)]
pub enum AllocatorCreationError {
    #[error("Failed to create GPU allocator: {0}")]
    GpuAllocator(#[from] AllocationError),
}

/// `gpu-allocator` bound to a [`Device`].
pub struct Allocator {
    // Declared before `device` so the allocator is torn down first.
    inner: Mutex<GpuAllocator>,
    device: Arc<Device>,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl Allocator {
    /// Bind a new allocator to `device`. With `debug` set, leaks are
    /// reported when the allocator is dropped.
    pub fn new(
        device: &Arc<Device>,
        debug: bool,
    ) -> Result<Self, AllocatorCreationError> {
        let inner = GpuAllocator::new(&AllocatorCreateDesc {
            instance: device.parent().ash_instance().clone(),
            device: device.ash_device().clone(),
            physical_device: device.physical_device(),
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: debug,
                log_memory_information: debug,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;
        tracing::debug!("Created allocator for {:?}", device);

        Ok(Self {
            inner: Mutex::new(inner),
            device: Arc::clone(device),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        let requirements = narrow_requirements(
            self.device.memory_properties(),
            requirements,
            usage,
            self.device.non_coherent_atom_size(),
        );
        self.inner
            .lock()
            .expect("allocator lock poisoned")
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: usage.location(),
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
    }

    fn free(&self, allocation: Allocation) {
        if let Err(e) = self
            .inner
            .lock()
            .expect("allocator lock poisoned")
            .free(allocation)
        {
            tracing::error!("Failed to free GPU allocation: {e}");
        }
    }
}

impl Allocator {
    /// Name `target`, then allocate and bind memory for it. On failure
    /// `target` is destroyed and nothing leaks.
    fn back_with_memory(
        &self,
        target: Bindable,
        name: &str,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, CreateResourceError> {
        let device = &self.device;
        // SAFETY: target was just created on this device.
        let named = unsafe {
            match target {
                Bindable::Buffer(b) => device.set_object_name_str(b, name),
                Bindable::Image(i) => device.set_object_name_str(i, name),
            }
        };
        if let Err(e) = named {
            tracing::warn!("Could not name {name:?}: {e}");
        }

        // SAFETY: target was just created on this device.
        let requirements = unsafe { device.raw_memory_requirements(target) };
        let allocation = match self.allocate(name, requirements, usage, linear)
        {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: target is unbound and never left this function.
                unsafe { device.destroy_raw(target) };
                return Err(CreateResourceError::AllocateMemory(e));
            }
        };

        // SAFETY: the allocation came from this device's allocator and
        // satisfies the requirements it was made from.
        let bound = unsafe {
            device.bind_raw_memory(
                target,
                allocation.memory(),
                allocation.offset(),
            )
        };
        if let Err(e) = bound {
            self.free(allocation);
            // SAFETY: target never left this function.
            unsafe { device.destroy_raw(target) };
            return Err(CreateResourceError::BindMemory(e));
        }
        Ok(allocation)
    }

    fn release(&self, target: Bindable, allocation: Option<Allocation>) {
        if !target.is_null() {
            // SAFETY: handles reach here once, from the matching create.
            unsafe { self.device.destroy_raw(target) };
        }
        if let Some(allocation) = allocation {
            self.free(allocation);
        }
    }
}

impl ResourceAllocator for Allocator {
    fn max_allocation_size(&self) -> vk::DeviceSize {
        self.device.max_allocation_size()
    }

    fn create_buffer(
        &self,
        info: &BufferCreateInfo<'_>,
    ) -> Result<RawBuffer, CreateResourceError> {
        let families = [self.device.queue_family()];
        let create_info = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&families);
        // SAFETY: create_info borrows only locals.
        let handle = unsafe { self.device.create_raw_buffer(&create_info) }
            .map_err(CreateResourceError::CreateBuffer)?;

        let allocation = self.back_with_memory(
            Bindable::Buffer(handle),
            info.name,
            info.memory,
            true,
        )?;
        Ok(RawBuffer {
            handle,
            allocation: Some(allocation),
        })
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        self.release(Bindable::Buffer(buffer.handle), buffer.allocation);
    }

    fn create_image(
        &self,
        info: &TextureCreateInfo<'_>,
    ) -> Result<RawImage, CreateResourceError> {
        let families = [self.device.queue_family()];
        let create_info = info.image_create_info(&families);
        // SAFETY: create_info borrows only locals and info.
        let handle = unsafe { self.device.create_raw_image(&create_info) }
            .map_err(CreateResourceError::CreateImage)?;

        let allocation = self.back_with_memory(
            Bindable::Image(handle),
            info.name,
            info.memory,
            info.tiling == vk::ImageTiling::LINEAR,
        )?;
        Ok(RawImage {
            handle,
            allocation: Some(allocation),
        })
    }

    fn destroy_image(&self, image: RawImage) {
        self.release(Bindable::Image(image.handle), image.allocation);
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        tracing::debug!("Dropping allocator for {:?}", self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(
        types: &[vk::MemoryPropertyFlags],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    fn reqs(bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 100,
            alignment: 16,
            memory_type_bits: bits,
        }
    }

    use vk::MemoryPropertyFlags as F;

    #[test]
    fn gpu_only_prefers_pure_vram() {
        let score = |flags| score_memory_type(flags, MemoryUsage::GpuOnly);
        assert_eq!(score(F::DEVICE_LOCAL), Some(2));
        assert_eq!(score(F::DEVICE_LOCAL | F::HOST_VISIBLE), Some(1));
        assert_eq!(score(F::HOST_VISIBLE), None);
    }

    #[test]
    fn host_usages_need_host_visible() {
        let upload = |flags| score_memory_type(flags, MemoryUsage::CpuToGpu);
        let readback = |flags| score_memory_type(flags, MemoryUsage::GpuToCpu);
        assert_eq!(upload(F::DEVICE_LOCAL), None);
        assert_eq!(readback(F::DEVICE_LOCAL), None);
        assert_eq!(upload(F::DEVICE_LOCAL | F::HOST_VISIBLE), Some(2));
        assert_eq!(readback(F::HOST_VISIBLE | F::HOST_CACHED), Some(2));
        assert_eq!(readback(F::HOST_VISIBLE), Some(1));
    }

    #[test]
    fn select_respects_type_bits_and_prefers_lowest_index() {
        let props = memory_properties(&[
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::DEVICE_LOCAL,
            F::DEVICE_LOCAL,
            F::DEVICE_LOCAL | F::HOST_VISIBLE,
        ]);
        assert_eq!(
            select_memory_type(&props, &reqs(0b1111), MemoryUsage::GpuOnly),
            Some(1)
        );
        assert_eq!(
            select_memory_type(&props, &reqs(0b1100), MemoryUsage::GpuOnly),
            Some(2)
        );
        assert_eq!(
            select_memory_type(&props, &reqs(0b1111), MemoryUsage::CpuToGpu),
            Some(3)
        );
        assert_eq!(
            select_memory_type(&props, &reqs(0b0110), MemoryUsage::CpuToGpu),
            None
        );
    }

    #[test]
    fn padding_applies_only_to_non_coherent_host_memory() {
        let props = memory_properties(&[F::HOST_VISIBLE, F::DEVICE_LOCAL]);
        let narrowed =
            narrow_requirements(&props, reqs(0b11), MemoryUsage::CpuToGpu, 64);
        assert_eq!(narrowed.size, 128);
        assert_eq!(narrowed.alignment, 64);
        assert_eq!(narrowed.memory_type_bits, 0b01);

        let narrowed =
            narrow_requirements(&props, reqs(0b11), MemoryUsage::GpuOnly, 64);
        assert_eq!(narrowed.size, 100);
        assert_eq!(narrowed.alignment, 16);
        assert_eq!(narrowed.memory_type_bits, 0b10);
    }

    #[test]
    fn unmatched_requirements_pass_through() {
        let props = memory_properties(&[F::DEVICE_LOCAL]);
        let narrowed =
            narrow_requirements(&props, reqs(0b1), MemoryUsage::GpuToCpu, 64);
        assert_eq!(narrowed.size, 100);
        assert_eq!(narrowed.memory_type_bits, 0b1);
    }
}

//! GPU buffers.

use std::sync::{Arc, RwLock, RwLockReadGuard};

use ash::vk;

use crate::allocator::{MemoryUsage, RawBuffer, ResourceAllocator};
use crate::gpu_device::{CreateResourceError, DestroyResourceError};

/// Size reported by a buffer that has been destroyed.
pub const INVALID_SIZE: vk::DeviceSize = vk::DeviceSize::MAX;

#[derive(Debug, Clone, Copy)]
pub struct BufferCreateInfo<'a> {
    /// Diagnostic label, attached to the Vulkan object and the allocation.
    pub name: &'a str,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryUsage,
}

/// Handle state of a [`Buffer`], read under its lock.
#[derive(Debug)]
pub struct BufferState {
    raw: Option<RawBuffer>,
    size: vk::DeviceSize,
}

impl BufferState {
    /// The buffer handle, or null once destroyed.
    pub fn raw_handle(&self) -> vk::Buffer {
        self.raw
            .as_ref()
            .map_or(vk::Buffer::null(), |raw| raw.handle)
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
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

/// A named buffer and the memory bound to it.
///
/// Any number of threads may hold [`Buffer::read`] at once; destruction
/// takes the lock exclusively. Dropping a live buffer releases it.
pub struct Buffer {
    name: String,
    owner: Arc<dyn ResourceAllocator>,
    state: RwLock<BufferState>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Buffer {
    pub fn create(
        allocator: &Arc<dyn ResourceAllocator>,
        info: &BufferCreateInfo<'_>,
    ) -> Result<Self, CreateResourceError> {
        let result = Self::create_inner(allocator, info);
        if let Err(e) = &result {
            tracing::error!("Failed to create buffer {:?}: {e}", info.name);
        }
        result
    }

    fn create_inner(
        allocator: &Arc<dyn ResourceAllocator>,
        info: &BufferCreateInfo<'_>,
    ) -> Result<Self, CreateResourceError> {
        let max = allocator.max_allocation_size();
        // INVALID_SIZE is reserved for destroyed buffers.
        if info.size == 0 || info.size == INVALID_SIZE || info.size > max {
            return Err(CreateResourceError::InvalidSize {
                size: info.size,
                max,
            });
        }

        let raw = allocator.create_buffer(info)?;
        tracing::debug!(
            "Created buffer {:?} ({} bytes): {:?}",
            info.name,
            info.size,
            raw.handle
        );

        Ok(Self {
            name: info.name.to_owned(),
            owner: Arc::clone(allocator),
            state: RwLock::new(BufferState {
                raw: Some(raw),
                size: info.size,
            }),
        })
    }

    /// Release the buffer through `allocator`, which must be the one that
    /// created it. Afterwards the handle is null and the size is
    /// [`INVALID_SIZE`].
    ///
    /// Blocks until every outstanding [`Buffer::read`] guard is dropped.
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

        let mut state = self.state.write().expect("buffer lock poisoned");
        let Some(raw) = state.raw.take() else {
            tracing::warn!("Buffer {:?} was already destroyed", self.name);
            return Err(DestroyResourceError::AlreadyDestroyed(
                self.name.clone(),
            ));
        };
        tracing::debug!("Destroying buffer {:?}: {:?}", self.name, raw.handle);
        state.size = INVALID_SIZE;
        self.owner.destroy_buffer(raw);
        Ok(())
    }

    /// Shared access to the handle state.
    pub fn read(&self) -> RwLockReadGuard<'_, BufferState> {
        self.state.read().expect("buffer lock poisoned")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.read().raw_handle()
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.read().size()
    }

    pub fn is_destroyed(&self) -> bool {
        self.read().is_destroyed()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(raw) = state.raw.take() {
            tracing::debug!(
                "Dropping buffer {:?}: {:?}",
                self.name,
                raw.handle
            );
            self.owner.destroy_buffer(raw);
        }
    }
}

//! The GPU device layer of the Onyx engine, built on [`ash`].
//!
//! [`VulkanGpuDevice`] brings up and tears down every backend object a
//! renderer needs, in strict dependency order, and hands out
//! [`Buffer`]s and [`Texture`]s allocated through
//! [`gpu-allocator`](gpu_allocator). The backend-neutral surface is the
//! [`GpuDevice`] trait.
//!
//! # Object hierarchy
//!
//! ```text
//! Instance
//! ├── DebugMessenger
//! ├── Surface<W>
//! │   └── Swapchain<W>
//! └── Device
//!     └── Allocator
//!         ├── Buffer
//!         └── Texture
//! ```
//!
//! Each wrapper holds its parent via `Arc` so parents cannot be
//! destroyed while children are alive.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod allocator;
pub mod buffer;
pub mod debug;
pub mod device;
pub mod gpu_device;
pub mod instance;
pub mod negotiate;
pub mod physical;
pub mod surface;
pub mod swapchain;
pub mod texture;
pub mod vulkan;
pub mod window;

pub use ash;

pub use allocator::{MemoryUsage, ResourceAllocator};
pub use buffer::{Buffer, BufferCreateInfo, INVALID_SIZE};
pub use gpu_device::{
    CreateResourceError, DestroyResourceError, DeviceState, GpuDevice,
    GpuDeviceConfig, InitError, ResultCode,
};
pub use texture::{SampleCount, Texture, TextureCreateInfo, TextureType};
pub use vulkan::VulkanGpuDevice;
pub use window::WindowSource;

use instance::VkVersion;

pub const ENGINE_NAME: &str = "Onyx-Engine";

/// The engine version, taken from this crate's package version.
pub fn engine_version() -> VkVersion {
    let part = |s: &str| s.parse().unwrap_or(0);
    VkVersion::new(
        part(env!("CARGO_PKG_VERSION_MAJOR")),
        part(env!("CARGO_PKG_VERSION_MINOR")),
        part(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

/// Logs the engine banner. Call once at start-up, after the logger.
pub fn initialize() {
    let ver = engine_version();
    tracing::info!(
        "Initializing {ENGINE_NAME} v{}.{}.{}",
        ver.major(),
        ver.minor(),
        ver.patch()
    );
}

pub fn terminate() {
    tracing::info!("Terminating {ENGINE_NAME}");
}

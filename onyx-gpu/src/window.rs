use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// The window a device presents to.
///
/// Supplies the native handles for surface creation and the current
/// client-area size in physical pixels. The device only ever reads from
/// it.
pub trait WindowSource: HasDisplayHandle + HasWindowHandle {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

// Window / surface collaborator
//
// The core only needs three things from the window: raw platform handles,
// the framebuffer size in pixels, and the instance extensions required to
// create a surface for those handles.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{
    HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle,
};
use std::ffi::CStr;

pub trait WindowSurface {
    fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)>;

    /// Current framebuffer size in pixels
    fn framebuffer_size(&self) -> (u32, u32);

    fn required_extensions(&self) -> Result<Vec<&'static CStr>> {
        let (display, _) = self.raw_handles()?;
        required_extensions_for(display)
    }
}

impl WindowSurface for winit::window::Window {
    fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)> {
        let display = self
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window = self
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();
        Ok((display, window))
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }
}

/// Surface extension plus the platform extension matching the display handle
pub fn required_extensions_for(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => anyhow::bail!("Unsupported display handle: {:?}", other),
    };
    Ok(vec![khr::Surface::name(), platform])
}

/// Create a platform surface for the window.
///
/// # Safety
/// The handles must stay valid for the lifetime of the returned surface and
/// `instance` must have been created with [`required_extensions_for`].
pub unsafe fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .context("Xlib display handle has no display pointer")?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut _)
                .window(handle.window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display
                .connection
                .context("Xcb display handle has no connection")?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr() as *mut _)
                .window(handle.window.get());
            khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr() as *mut _)
                .surface(handle.surface.as_ptr() as *mut _);
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)
        }
        _ => anyhow::bail!("Unsupported window handle type"),
    };

    surface.context("Failed to create Vulkan surface")
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{WaylandDisplayHandle, WindowsDisplayHandle};
    use std::ptr::NonNull;

    #[test]
    fn extensions_follow_the_display_platform() {
        let windows = RawDisplayHandle::Windows(WindowsDisplayHandle::new());
        let exts = required_extensions_for(windows).unwrap();
        assert_eq!(exts, vec![khr::Surface::name(), khr::Win32Surface::name()]);

        let mut dummy = 0u8;
        let wayland = RawDisplayHandle::Wayland(WaylandDisplayHandle::new(
            NonNull::from(&mut dummy).cast(),
        ));
        let exts = required_extensions_for(wayland).unwrap();
        assert_eq!(exts[1], khr::WaylandSurface::name());
    }
}

//! Presentation surfaces and the support queries a swapchain is built from.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::{CreateSurfaceHandleError, Instance};

#[derive(Debug, Error)]
pub enum SurfaceQueryError {
    #[error("instance was created without windowing support")]
    WindowingNotEnabled,

    #[error("surface query failed: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for SurfaceQueryError {
    fn from(value: vk::Result) -> Self {
        if value == vk::Result::ERROR_EXTENSION_NOT_PRESENT {
            SurfaceQueryError::WindowingNotEnabled
        } else {
            SurfaceQueryError::Vulkan(value)
        }
    }
}

/// An owned `VkSurfaceKHR` bound to the window it was created from.
///
/// The surface keeps both its parent [`Instance`] and the window source
/// alive through `Arc`s, so the usual destruction-order mistakes (window
/// gone before surface, instance gone before surface) are unrepresentable.
pub struct Surface<W: HasWindowHandle + HasDisplayHandle> {
    instance: Arc<Instance>,
    handle: vk::SurfaceKHR,
    // Never read, only kept alive: the native window must outlive the surface.
    _window: Arc<W>,
}

impl<W: HasWindowHandle + HasDisplayHandle> fmt::Debug for Surface<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.handle)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl<W: HasWindowHandle + HasDisplayHandle> Surface<W> {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The surface must be dropped when the windowing system invalidates the
    /// window's native handle (for example a suspend event on mobile
    /// platforms), and no in-flight GPU work may still reference resources
    /// derived from it at that point.
    pub unsafe fn new(
        instance: &Arc<Instance>,
        window: Arc<W>,
    ) -> Result<Self, CreateSurfaceHandleError> {
        // SAFETY: the Arc<W> stored below keeps the window alive for the
        // surface's whole lifetime.
        let handle = unsafe { instance.create_surface_handle(window.as_ref()) }?;
        Ok(Self {
            instance: Arc::clone(instance),
            handle,
            _window: window,
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn as_raw(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Whether `queue_family` on `physical` can present to this surface.
    ///
    /// # Safety
    /// `physical` must be a device handle derived from this surface's
    /// instance.
    pub unsafe fn supports_queue_family(
        &self,
        physical: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<bool, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance; self.handle is alive.
        Ok(unsafe {
            self.instance
                .surface_support(physical, queue_family, self.handle)
        }?)
    }

    /// Current capabilities (extent bounds, image count bounds, transforms)
    /// of this surface on `physical`.
    ///
    /// # Safety
    /// `physical` must be a device handle derived from this surface's
    /// instance.
    pub unsafe fn capabilities(
        &self,
        physical: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance; self.handle is alive.
        Ok(unsafe { self.instance.surface_capabilities(physical, self.handle) }?)
    }

    /// The (pixel-encoding, color-space) pairs this surface supports on
    /// `physical`. The set is fixed for the surface/device pair; it only
    /// changes if the surface itself is recreated.
    ///
    /// # Safety
    /// `physical` must be a device handle derived from this surface's
    /// instance.
    pub unsafe fn formats(
        &self,
        physical: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance; self.handle is alive.
        Ok(unsafe { self.instance.surface_formats(physical, self.handle) }?)
    }

    /// The present modes this surface supports on `physical`. Like
    /// [`formats`](Self::formats), immutable per surface/device pair.
    ///
    /// # Safety
    /// `physical` must be a device handle derived from this surface's
    /// instance.
    pub unsafe fn present_modes(
        &self,
        physical: vk::PhysicalDevice,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance; self.handle is alive.
        Ok(unsafe { self.instance.surface_present_modes(physical, self.handle) }?)
    }
}

impl<W: HasWindowHandle + HasDisplayHandle> Drop for Surface<W> {
    fn drop(&mut self) {
        tracing::debug!("Dropping surface {:?}", self.handle);
        // SAFETY: reaching drop means every swapchain created against this
        // surface has already been destroyed (they hold the surface by Arc).
        unsafe { self.instance.destroy_surface_handle(self.handle) };
    }
}

//! CPU–GPU and GPU–GPU synchronization primitives.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateSyncError {
    #[error("Vulkan error creating synchronization object: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum FenceWaitError {
    #[error("timed out waiting for fence")]
    Timeout,

    #[error("Vulkan error waiting for fence: {0}")]
    Vulkan(vk::Result),
}

/// An owned binary fence.
///
/// The render-loop cycle is [`wait_then_reset`](Self::wait_then_reset)
/// before re-recording a frame, then passing [`as_raw`](Self::as_raw) to the
/// submission that will signal it.
pub struct Fence {
    device: Arc<Device>,
    handle: vk::Fence,
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Create a fence. Start `signaled` for fences that gate the first
    /// iteration of a wait-reset-submit loop.
    pub fn new(
        device: &Arc<Device>,
        signaled: bool,
        label: Option<&str>,
    ) -> Result<Self, CreateSyncError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: the create info is self-contained.
        let handle =
            unsafe { device.create_fence(&create_info) }.map_err(CreateSyncError::Vulkan)?;
        if let Some(label) = label {
            // SAFETY: handle was created above from this device.
            unsafe { device.label_with(handle, || label.to_owned()) };
        }
        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    /// Block until signaled or until `timeout_ns` elapses (`u64::MAX` waits
    /// forever).
    pub fn wait(&self, timeout_ns: u64) -> Result<(), FenceWaitError> {
        // SAFETY: handle is a live fence from this device.
        unsafe {
            self.device
                .wait_for_fences(&[self.handle], true, timeout_ns)
        }
        .map_err(|e| match e {
            vk::Result::TIMEOUT => FenceWaitError::Timeout,
            other => FenceWaitError::Vulkan(other),
        })
    }

    /// Return the fence to the unsignaled state.
    ///
    /// # Safety
    /// The fence must not be pending: either it was never submitted or the
    /// GPU has already signaled it.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees the fence is not pending; `&mut self`
        // rules out same-thread aliasing through this wrapper.
        unsafe { self.device.reset_fences(&[self.handle]) }
    }

    /// Wait for the signal, then reset. The `&mut` receiver prevents this
    /// wrapper from being re-submitted between the two steps on this thread;
    /// raw-handle users on other threads are the caller's problem.
    pub fn wait_then_reset(&mut self, timeout_ns: u64) -> Result<(), FenceWaitError> {
        self.wait(timeout_ns)?;
        // SAFETY: the wait above proved the fence is signaled, hence not
        // pending.
        unsafe { self.reset() }.map_err(FenceWaitError::Vulkan)
    }

    /// Non-blocking signal check.
    pub fn is_signaled(&self) -> Result<bool, vk::Result> {
        // SAFETY: handle is a live fence from this device.
        unsafe { self.device.fence_status(self.handle) }
    }

    pub fn as_raw(&self) -> vk::Fence {
        self.handle
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        // SAFETY: the wrapper owns the handle; callers must not drop a fence
        // that is still pending.
        unsafe { self.device.destroy_fence(self.handle) };
    }
}

/// An owned binary semaphore, driven entirely by queue operations; the CPU
/// can neither query nor reset it.
pub struct Semaphore {
    device: Arc<Device>,
    handle: vk::Semaphore,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    pub fn new(device: &Arc<Device>, label: Option<&str>) -> Result<Self, CreateSyncError> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: the create info is self-contained.
        let handle = unsafe { device.create_semaphore(&create_info) }
            .map_err(CreateSyncError::Vulkan)?;
        if let Some(label) = label {
            // SAFETY: handle was created above from this device.
            unsafe { device.label_with(handle, || label.to_owned()) };
        }
        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    pub fn as_raw(&self) -> vk::Semaphore {
        self.handle
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        tracing::debug!("Dropping semaphore {:?}", self.handle);
        // SAFETY: the wrapper owns the handle; callers must not drop a
        // semaphore with a pending wait or signal.
        unsafe { self.device.destroy_semaphore(self.handle) };
    }
}

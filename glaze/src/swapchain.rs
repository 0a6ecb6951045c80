//! Swapchain construction and the surface-format / present-mode
//! negotiation it is built on.
//!
//! The two selectors, [`select_surface_format`] and [`select_present_mode`],
//! are pure and total: they always return a value from the supported set the
//! device reported, with one documented exception for the
//! `VK_FORMAT_UNDEFINED` sentinel. They never perform Vulkan calls — the
//! caller queries support through [`Surface`](crate::surface::Surface) and
//! hands the immutable results in.

use std::fmt;
use std::sync::{Arc, Mutex};

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::device::Device;
use crate::surface::{Surface, SurfaceQueryError};

/// Preferences consulted when negotiating the swapchain configuration.
///
/// `format_candidates` is scanned in order; candidates whose color space is
/// not `color_space` are skipped. `low_latency` trades the strict FIFO queue
/// for mailbox (queue-latest) presentation when the device offers it.
#[derive(Debug, Clone)]
pub struct PresentPolicy {
    pub format_candidates: Vec<vk::SurfaceFormatKHR>,
    pub color_space: vk::ColorSpaceKHR,
    pub low_latency: bool,
}

/// Encoding returned for the "any format is allowed" sentinel case.
const FALLBACK_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

impl Default for PresentPolicy {
    fn default() -> Self {
        let srgb = vk::ColorSpaceKHR::SRGB_NONLINEAR;
        Self {
            format_candidates: [
                vk::Format::B8G8R8A8_SRGB,
                vk::Format::R8G8B8A8_SRGB,
                vk::Format::B8G8R8A8_UNORM,
                vk::Format::R8G8B8A8_UNORM,
            ]
            .into_iter()
            .map(|format| vk::SurfaceFormatKHR {
                format,
                color_space: srgb,
            })
            .collect(),
            color_space: srgb,
            low_latency: false,
        }
    }
}

/// Pick one supported surface format.
///
/// A single-entry supported set with `VK_FORMAT_UNDEFINED` means the device
/// lets the application choose freely; a widely supported 8-bit BGRA
/// encoding in the policy's preferred color space is returned even though
/// that exact pair is absent from the reported set. In every other case the
/// result is an element of `supported`: the first policy candidate found in
/// the set wins, and when nothing matches the device's first entry is used.
///
/// `supported` must be non-empty, as guaranteed by a conformant driver for
/// any surface/device pair that reports presentation support.
pub fn select_surface_format(
    supported: &[vk::SurfaceFormatKHR],
    policy: &PresentPolicy,
) -> vk::SurfaceFormatKHR {
    if supported.len() == 1 && supported[0].format == vk::Format::UNDEFINED {
        return vk::SurfaceFormatKHR {
            format: FALLBACK_FORMAT,
            color_space: policy.color_space,
        };
    }

    for candidate in &policy.format_candidates {
        if candidate.color_space != policy.color_space {
            continue;
        }
        for entry in supported {
            if entry.format == candidate.format && entry.color_space == candidate.color_space {
                return *entry;
            }
        }
    }

    supported[0]
}

/// Pick one supported present mode.
///
/// `low_latency` asks for mailbox (latest-ready image wins, no tearing);
/// otherwise strict FIFO is requested. When the desired mode is missing the
/// result is FIFO, which every conformant device supports, so the function
/// never fails.
pub fn select_present_mode(
    supported: &[vk::PresentModeKHR],
    low_latency: bool,
) -> vk::PresentModeKHR {
    let desired = if low_latency {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    };
    if supported.contains(&desired) {
        desired
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Resolve the swapchain extent against the surface capabilities. A current
/// extent of `u32::MAX` means the window manager leaves the size to us, in
/// which case the requested extent is clamped to the allowed range.
fn resolve_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: requested.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: requested.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One image more than the driver minimum, capped by the maximum when the
/// surface bounds it (`max_image_count == 0` means unbounded).
fn resolve_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count.saturating_add(1);
    if capabilities.max_image_count != 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}

fn resolve_composite_alpha(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::CompositeAlphaFlagsKHR {
    use vk::CompositeAlphaFlagsKHR as A;
    for mode in [A::OPAQUE, A::PRE_MULTIPLIED, A::POST_MULTIPLIED] {
        if capabilities.supported_composite_alpha.contains(mode) {
            return mode;
        }
    }
    A::INHERIT
}

/// Create a 2D color view per swapchain image through injected raw calls,
/// unwinding the views already created when one fails. Factored this way so
/// the cleanup path is testable without a device.
fn build_image_views<C, D>(
    images: &[vk::Image],
    format: vk::Format,
    mut create: C,
    mut destroy: D,
) -> Result<Vec<vk::ImageView>, vk::Result>
where
    C: FnMut(&vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView, vk::Result>,
    D: FnMut(vk::ImageView),
{
    let mut views = Vec::with_capacity(images.len());
    for image in images.iter().copied() {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        match create(&info) {
            Ok(view) => views.push(view),
            Err(e) => {
                for view in views.drain(..) {
                    destroy(view);
                }
                return Err(e);
            }
        }
    }
    Ok(views)
}

#[derive(Debug, Error)]
pub enum CreateSwapchainError {
    #[error("device and surface come from different instances")]
    ForeignSurface,

    #[error("old swapchain belongs to a different device or surface")]
    ForeignOldSwapchain,

    #[error("requested extent {width}x{height} has a zero dimension")]
    ZeroExtent { width: u32, height: u32 },

    #[error("surface support query failed: {0}")]
    Query(#[from] SurfaceQueryError),

    #[error("the surface reported no formats")]
    NoFormats,

    #[error("the surface reported no present modes")]
    NoPresentModes,

    #[error("vkCreateSwapchainKHR failed: {0}")]
    Create(vk::Result),

    #[error("vkGetSwapchainImagesKHR failed: {0}")]
    GetImages(vk::Result),

    #[error("creating a swapchain image view failed: {0}")]
    CreateView(vk::Result),
}

/// What a frame acquisition produced.
#[derive(Debug, Clone, Copy)]
pub struct AcquiredImage {
    pub index: u32,
    /// The swapchain still works but no longer matches the surface exactly;
    /// recreate at the next convenient point.
    pub suboptimal: bool,
}

/// An owned `VkSwapchainKHR` with its images and color views.
///
/// Holds its [`Device`] and [`Surface`] parents alive. `acquire` is
/// serialized internally because `vkAcquireNextImageKHR` requires external
/// synchronization on the swapchain handle.
pub struct Swapchain<W: HasWindowHandle + HasDisplayHandle> {
    device: Arc<Device>,
    surface: Arc<Surface<W>>,
    handle: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    acquire_lock: Mutex<()>,
}

impl<W: HasWindowHandle + HasDisplayHandle> fmt::Debug for Swapchain<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("format", &self.format.format)
            .field("color_space", &self.format.color_space)
            .field("present_mode", &self.present_mode)
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl<W: HasWindowHandle + HasDisplayHandle> Swapchain<W> {
    /// Create a swapchain for `surface` sized as close to `requested_extent`
    /// as the surface allows, configured per `policy`.
    pub fn new(
        device: &Arc<Device>,
        surface: &Arc<Surface<W>>,
        requested_extent: vk::Extent2D,
        policy: &PresentPolicy,
    ) -> Result<Self, CreateSwapchainError> {
        Self::new_with_old(device, surface, requested_extent, policy, None)
    }

    /// Like [`new`](Self::new), but hands the driver the retiring swapchain
    /// so it can recycle presentable images. The caller must still keep GPU
    /// work referencing `old` synchronized; retiring does not wait.
    pub fn new_with_old(
        device: &Arc<Device>,
        surface: &Arc<Surface<W>>,
        requested_extent: vk::Extent2D,
        policy: &PresentPolicy,
        old: Option<&Self>,
    ) -> Result<Self, CreateSwapchainError> {
        if !Arc::ptr_eq(surface.instance(), device.instance()) {
            return Err(CreateSwapchainError::ForeignSurface);
        }
        if let Some(old) = old {
            if !Arc::ptr_eq(&old.device, device) || !Arc::ptr_eq(&old.surface, surface) {
                return Err(CreateSwapchainError::ForeignOldSwapchain);
            }
        }
        if requested_extent.width == 0 || requested_extent.height == 0 {
            return Err(CreateSwapchainError::ZeroExtent {
                width: requested_extent.width,
                height: requested_extent.height,
            });
        }

        let physical = device.physical();
        // SAFETY: physical belongs to the same instance as surface, checked
        // above via the Arc identity of the instances.
        let capabilities = unsafe { surface.capabilities(physical) }?;
        // SAFETY: as above.
        let formats = unsafe { surface.formats(physical) }?;
        // SAFETY: as above.
        let present_modes = unsafe { surface.present_modes(physical) }?;

        if formats.is_empty() {
            return Err(CreateSwapchainError::NoFormats);
        }
        if present_modes.is_empty() {
            return Err(CreateSwapchainError::NoPresentModes);
        }

        let format = select_surface_format(&formats, policy);
        let present_mode = select_present_mode(&present_modes, policy.low_latency);
        let extent = resolve_extent(&capabilities, requested_extent);
        let image_count = resolve_image_count(&capabilities);
        let composite_alpha = resolve_composite_alpha(&capabilities);
        tracing::debug!(
            "Swapchain config: {:?}/{:?}, {:?}, {}x{}, {} images",
            format.format,
            format.color_space,
            present_mode,
            extent.width,
            extent.height,
            image_count,
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.as_raw())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(composite_alpha)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |s| s.handle));

        // SAFETY: the create info references the live surface and values
        // taken from its own support queries; the old swapchain, when given,
        // was validated to come from this device/surface pair.
        let handle = unsafe { device.create_swapchain_khr(&create_info) }
            .map_err(CreateSwapchainError::Create)?;
        // SAFETY: handle was created above from this device.
        unsafe { device.label_with(handle, || "swapchain".to_owned()) };

        // SAFETY: handle is a live swapchain from this device.
        let images = match unsafe { device.swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                // SAFETY: nothing references the fresh swapchain yet.
                unsafe { device.destroy_swapchain_khr(handle) };
                return Err(CreateSwapchainError::GetImages(e));
            }
        };
        for (index, image) in images.iter().enumerate() {
            // SAFETY: the image is owned by the live swapchain.
            unsafe { device.label_with(*image, || format!("swapchain image {index}")) };
        }

        let views = build_image_views(
            &images,
            format.format,
            // SAFETY: each info references a live swapchain image and a
            // standard 2D color subresource range.
            |info| unsafe { device.create_image_view(info) },
            // SAFETY: the view being destroyed was created just above and
            // has no other users.
            |view| unsafe { device.destroy_image_view(view) },
        )
        .map_err(|e| {
            // SAFETY: all views are already destroyed by the helper; the
            // swapchain has no other references.
            unsafe { device.destroy_swapchain_khr(handle) };
            CreateSwapchainError::CreateView(e)
        })?;
        for (index, view) in views.iter().enumerate() {
            // SAFETY: the view was created above from this device.
            unsafe { device.label_with(*view, || format!("swapchain view {index}")) };
        }

        Ok(Self {
            device: Arc::clone(device),
            surface: Arc::clone(surface),
            handle,
            format,
            present_mode,
            extent,
            images,
            views,
            acquire_lock: Mutex::new(()),
        })
    }

    pub fn as_raw(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire the next presentable image, signalling `semaphore` when the
    /// presentation engine releases it.
    ///
    /// `Err(vk::Result::ERROR_OUT_OF_DATE_KHR)` means the swapchain must be
    /// recreated before any further acquire or present.
    ///
    /// # Safety
    /// `semaphore` must be an unsignaled binary semaphore from this
    /// swapchain's device with no pending wait.
    pub unsafe fn acquire(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> Result<AcquiredImage, vk::Result> {
        let _guard = self.acquire_lock.lock().expect("acquire lock poisoned");
        // SAFETY: access to the swapchain handle is serialized by the guard;
        // caller guarantees the semaphore contract.
        let (index, suboptimal) = unsafe {
            self.device
                .acquire_image_khr(self.handle, timeout_ns, semaphore, vk::Fence::null())
        }?;
        Ok(AcquiredImage { index, suboptimal })
    }

    /// Queue image `index` for presentation once `wait_semaphore` signals.
    ///
    /// Returns `Ok(true)` when the swapchain is suboptimal and should be
    /// recreated soon; `Err(vk::Result::ERROR_OUT_OF_DATE_KHR)` when it must
    /// be recreated now.
    ///
    /// # Safety
    /// `index` must come from a successful [`acquire`](Self::acquire) that
    /// has not been presented yet; `wait_semaphore` must have a pending
    /// signal; the image must be in `PRESENT_SRC_KHR` layout when the
    /// semaphore fires.
    pub unsafe fn present(
        &self,
        index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let wait = [wait_semaphore];
        let swapchains = [self.handle];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        // SAFETY: the info references this live swapchain; the caller
        // guarantees the semaphore and image-layout contract.
        unsafe { self.device.queue_present_khr(&present_info) }
    }
}

impl<W: HasWindowHandle + HasDisplayHandle> Drop for Swapchain<W> {
    fn drop(&mut self) {
        tracing::debug!("Dropping swapchain {:?}", self.handle);
        for view in self.views.drain(..) {
            // SAFETY: the views were created by this device and nothing may
            // reference them at wrapper drop time (caller's contract on GPU
            // synchronization before drop).
            unsafe { self.device.destroy_image_view(view) };
        }
        // SAFETY: views are gone; the swapchain owns the images and frees
        // them with the handle.
        unsafe { self.device.destroy_swapchain_khr(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    fn pair(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    const SRGB: vk::ColorSpaceKHR = vk::ColorSpaceKHR::SRGB_NONLINEAR;

    fn same(a: vk::SurfaceFormatKHR, b: vk::SurfaceFormatKHR) -> bool {
        a.format == b.format && a.color_space == b.color_space
    }

    #[test]
    fn format_selection_returns_member_of_supported_set() {
        let supported = [
            pair(vk::Format::R5G6B5_UNORM_PACK16, SRGB),
            pair(vk::Format::A2B10G10R10_UNORM_PACK32, SRGB),
        ];
        let chosen = select_surface_format(&supported, &PresentPolicy::default());
        assert!(supported.iter().any(|entry| same(*entry, chosen)));
    }

    #[test]
    fn undefined_sentinel_yields_default_pair() {
        let supported = [pair(vk::Format::UNDEFINED, SRGB)];
        let policy = PresentPolicy {
            // Candidate list contents must not matter for the sentinel.
            format_candidates: vec![pair(vk::Format::R16G16B16A16_SFLOAT, SRGB)],
            color_space: vk::ColorSpaceKHR::HDR10_ST2084_EXT,
            low_latency: false,
        };
        let chosen = select_surface_format(&supported, &policy);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::HDR10_ST2084_EXT);
    }

    #[test]
    fn undefined_among_several_entries_is_not_a_sentinel() {
        let supported = [
            pair(vk::Format::UNDEFINED, SRGB),
            pair(vk::Format::R8G8B8A8_UNORM, SRGB),
        ];
        let chosen = select_surface_format(&supported, &PresentPolicy::default());
        assert!(same(chosen, pair(vk::Format::R8G8B8A8_UNORM, SRGB)));
    }

    #[test]
    fn first_candidate_in_policy_order_wins() {
        // Supported list deliberately ordered against the policy.
        let supported = [
            pair(vk::Format::R8G8B8A8_SRGB, SRGB),
            pair(vk::Format::B8G8R8A8_SRGB, SRGB),
        ];
        let chosen = select_surface_format(&supported, &PresentPolicy::default());
        assert!(same(chosen, pair(vk::Format::B8G8R8A8_SRGB, SRGB)));
    }

    #[test]
    fn candidates_outside_preferred_color_space_are_skipped() {
        let hdr = vk::ColorSpaceKHR::HDR10_ST2084_EXT;
        let supported = [
            pair(vk::Format::A2B10G10R10_UNORM_PACK32, hdr),
            pair(vk::Format::B8G8R8A8_SRGB, SRGB),
        ];
        let policy = PresentPolicy {
            format_candidates: vec![
                pair(vk::Format::A2B10G10R10_UNORM_PACK32, hdr),
                pair(vk::Format::B8G8R8A8_SRGB, SRGB),
            ],
            color_space: SRGB,
            low_latency: false,
        };
        let chosen = select_surface_format(&supported, &policy);
        assert!(same(chosen, pair(vk::Format::B8G8R8A8_SRGB, SRGB)));
    }

    #[test]
    fn no_match_falls_back_to_first_supported_entry() {
        let supported = [
            pair(vk::Format::R5G6B5_UNORM_PACK16, SRGB),
            pair(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::HDR10_ST2084_EXT),
        ];
        let policy = PresentPolicy {
            format_candidates: vec![pair(vk::Format::R16G16B16A16_SFLOAT, SRGB)],
            color_space: SRGB,
            low_latency: false,
        };
        let chosen = select_surface_format(&supported, &policy);
        assert!(same(chosen, supported[0]));
    }

    #[test]
    fn format_selection_is_idempotent() {
        let supported = [
            pair(vk::Format::B8G8R8A8_UNORM, SRGB),
            pair(vk::Format::R8G8B8A8_SRGB, SRGB),
        ];
        let policy = PresentPolicy::default();
        assert!(same(
            select_surface_format(&supported, &policy),
            select_surface_format(&supported, &policy),
        ));
    }

    #[test]
    fn low_latency_picks_mailbox_when_available() {
        let supported = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            select_present_mode(&supported, true),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn low_latency_without_mailbox_settles_for_fifo() {
        let supported = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&supported, true),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn default_latency_keeps_fifo_even_when_mailbox_exists() {
        let supported = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            select_present_mode(&supported, false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn exotic_only_sets_still_produce_fifo() {
        // FIFO support is mandated by the Vulkan spec, so returning it even
        // when the queried list omits it is the safe total-function answer.
        let supported = [vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            select_present_mode(&supported, true),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let resolved = resolve_extent(
            &capabilities,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );
        assert_eq!((resolved.width, resolved.height), (800, 600));
    }

    #[test]
    fn extent_clamps_when_window_manager_defers() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 320,
                height: 240,
            },
            max_image_extent: vk::Extent2D {
                width: 2560,
                height: 1440,
            },
            ..Default::default()
        };
        let resolved = resolve_extent(
            &capabilities,
            vk::Extent2D {
                width: 4096,
                height: 100,
            },
        );
        assert_eq!((resolved.width, resolved.height), (2560, 240));
    }

    #[test]
    fn image_count_is_min_plus_one_capped_by_max() {
        let bounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(resolve_image_count(&bounded), 2);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(resolve_image_count(&unbounded), 3);
    }

    #[test]
    fn composite_alpha_prefers_opaque() {
        use vk::CompositeAlphaFlagsKHR as A;
        let capabilities = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha: A::POST_MULTIPLIED | A::OPAQUE,
            ..Default::default()
        };
        assert_eq!(resolve_composite_alpha(&capabilities), A::OPAQUE);

        let inherit_only = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha: A::INHERIT,
            ..Default::default()
        };
        assert_eq!(resolve_composite_alpha(&inherit_only), A::INHERIT);
    }

    #[test]
    fn image_view_failure_unwinds_earlier_views() {
        let images = [
            vk::Image::from_raw(1),
            vk::Image::from_raw(2),
            vk::Image::from_raw(3),
        ];
        let created = RefCell::new(0u64);
        let destroyed = RefCell::new(Vec::new());

        let result = build_image_views(
            &images,
            vk::Format::B8G8R8A8_SRGB,
            |_| {
                let mut count = created.borrow_mut();
                *count += 1;
                if *count <= 2 {
                    Ok(vk::ImageView::from_raw(100 + *count))
                } else {
                    Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
                }
            },
            |view| destroyed.borrow_mut().push(view),
        );

        assert_eq!(result, Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        assert_eq!(
            destroyed.borrow().as_slice(),
            &[vk::ImageView::from_raw(101), vk::ImageView::from_raw(102)],
        );
    }

    #[test]
    fn image_views_map_one_to_one_on_success() {
        let images = [vk::Image::from_raw(7), vk::Image::from_raw(8)];
        let views = build_image_views(
            &images,
            vk::Format::B8G8R8A8_SRGB,
            |info| Ok(vk::ImageView::from_raw(info.image.as_raw() * 10)),
            |_| panic!("no view may be destroyed on the success path"),
        )
        .expect("creation succeeds");
        assert_eq!(
            views,
            vec![vk::ImageView::from_raw(70), vk::ImageView::from_raw(80)],
        );
    }
}

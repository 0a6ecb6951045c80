//! Vulkan library loading and instance ownership.

use std::ffi::{CStr, CString};
use std::fmt;

use ash::vk;
use raw_window_handle::HasDisplayHandle;
use thiserror::Error;

/// Packed Vulkan version word wrapped in a nominal type so it cannot be
/// confused with other `u32` tokens crossing the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion(u32);

impl ApiVersion {
    pub const V1_0: Self = Self(vk::API_VERSION_1_0);
    pub const V1_3: Self = Self(vk::API_VERSION_1_3);

    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(0, major, minor, patch))
    }

    pub fn from_packed(raw: u32) -> Self {
        Self(raw)
    }

    pub fn packed(self) -> u32 {
        self.0
    }

    pub fn major(self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(self) -> u32 {
        vk::api_version_patch(self.0)
    }

    /// True when this version is at least `major.minor`.
    pub fn at_least(self, major: u32, minor: u32) -> bool {
        (self.major(), self.minor()) >= (major, minor)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

/// Maximum severity of validation messages forwarded into `tracing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugLevel {
    Error,
    Warning,
    Info,
    Verbose,
}

impl DebugLevel {
    fn severity_flags(self) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        match self {
            DebugLevel::Error => S::ERROR,
            DebugLevel::Warning => S::ERROR | S::WARNING,
            DebugLevel::Info => S::ERROR | S::WARNING | S::INFO,
            DebugLevel::Verbose => S::ERROR | S::WARNING | S::INFO | S::VERBOSE,
        }
    }
}

/// What to request at instance creation.
#[derive(Default)]
pub struct InstanceDesc<'a> {
    pub app_name: &'a str,
    /// Enable the window-surface extensions for the platform of the given
    /// display handle. `None` builds a headless (compute-only) instance.
    pub windowing: Option<&'a dyn HasDisplayHandle>,
    /// Install a `VK_EXT_debug_utils` messenger at this severity, provided
    /// the extension and the Khronos validation layer are both present.
    pub debug: Option<DebugLevel>,
}

#[derive(Debug, Error)]
pub enum CreateInstanceError {
    #[error("failed to load the Vulkan library: {0}")]
    LibraryLoad(libloading::Error),

    #[error("the Vulkan library is missing vkGetInstanceProcAddr")]
    MissingLoaderEntryPoint,

    #[error("application name contains an interior NUL byte")]
    BadAppName,

    #[error("could not get a display handle for surface extension discovery: {0}")]
    DisplayHandle(raw_window_handle::HandleError),

    #[error("required instance extensions are not available: {0:?}")]
    MissingExtensions(Vec<String>),

    #[error("vkCreateInstance failed: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateSurfaceHandleError {
    #[error("instance was created without windowing support")]
    WindowingNotEnabled,

    #[error("could not get a display handle: {0}")]
    DisplayHandle(raw_window_handle::HandleError),

    #[error("could not get a window handle: {0}")]
    WindowHandle(raw_window_handle::HandleError),

    #[error("surface creation failed: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum EnumerateDevicesError {
    #[error("out of host or device memory while enumerating physical devices")]
    OutOfMemory,

    #[error("vkEnumeratePhysicalDevices failed: {0}")]
    Vulkan(vk::Result),
}

struct Messenger {
    loader: ash::ext::debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

/// An owned `VkInstance` plus the loaders derived from it.
///
/// Dropping the `Instance` destroys the messenger and the instance; every
/// object created from it must already be gone by then, which the wrapper
/// types enforce by holding `Arc<Instance>`.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    surface_loader: Option<ash::khr::surface::Instance>,
    messenger: Option<Messenger>,
    version: ApiVersion,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

unsafe extern "system" fn messenger_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the driver guarantees `data` points to a valid callback-data
    // struct for the duration of the callback.
    let text = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();
    let kind = match kind {
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "performance",
        _ => "general",
    };

    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    if severity.contains(S::ERROR) {
        tracing::error!(target: "vulkan", kind, "{text}");
    } else if severity.contains(S::WARNING) {
        tracing::warn!(target: "vulkan", kind, "{text}");
    } else if severity.contains(S::INFO) {
        tracing::info!(target: "vulkan", kind, "{text}");
    } else {
        tracing::trace!(target: "vulkan", kind, "{text}");
    }

    vk::FALSE
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

impl Instance {
    /// Load the Vulkan library and create an instance per `desc`.
    ///
    /// # Safety
    /// Loading the Vulkan shared library executes arbitrary initialisation
    /// code from that library. The caller vouches for the system's Vulkan
    /// installation.
    pub unsafe fn new(desc: InstanceDesc<'_>) -> Result<Self, CreateInstanceError> {
        let app_name =
            CString::new(desc.app_name).map_err(|_| CreateInstanceError::BadAppName)?;

        // SAFETY: caller accepts the risks of dlopen'ing the system loader.
        let entry = unsafe { ash::Entry::load() }.map_err(|e| match e {
            ash::LoadingError::LibraryLoadFailure(inner) => {
                CreateInstanceError::LibraryLoad(inner)
            }
            ash::LoadingError::MissingEntryPoint(_) => {
                CreateInstanceError::MissingLoaderEntryPoint
            }
        })?;

        // SAFETY: no preconditions; absent on 1.0 loaders, which report 1.0.
        let version = unsafe { entry.try_enumerate_instance_version() }
            .unwrap_or(None)
            .map(ApiVersion::from_packed)
            .unwrap_or(ApiVersion::V1_0);
        tracing::debug!("Vulkan loader reports instance version {version}");

        let mut required_exts: Vec<&CStr> = Vec::new();
        if let Some(display) = desc.windowing {
            let display_handle = display
                .display_handle()
                .map_err(CreateInstanceError::DisplayHandle)?;
            let platform_exts =
                ash_window::enumerate_required_extensions(display_handle.as_raw())
                    .map_err(CreateInstanceError::Vulkan)?;
            // SAFETY: ash-window documents the returned pointers as valid
            // NUL-terminated strings with 'static lifetime.
            required_exts
                .extend(platform_exts.iter().map(|p| unsafe { CStr::from_ptr(*p) }));
        }

        // SAFETY: no preconditions.
        let available_exts = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(CreateInstanceError::Vulkan)?;
        let has_ext = |name: &CStr| {
            available_exts
                .iter()
                .any(|e| e.extension_name_as_c_str() == Ok(name))
        };

        let missing: Vec<String> = required_exts
            .iter()
            .filter(|ext| !has_ext(ext))
            .map(|ext| ext.to_string_lossy().into_owned())
            .collect();
        if !missing.is_empty() {
            return Err(CreateInstanceError::MissingExtensions(missing));
        }

        // SAFETY: no preconditions.
        let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
            .unwrap_or_default();
        let has_validation_layer = available_layers
            .iter()
            .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER));

        let want_messenger = desc.debug.is_some()
            && has_ext(ash::ext::debug_utils::NAME)
            && has_validation_layer;
        if desc.debug.is_some() && !want_messenger {
            tracing::warn!(
                "debug messenger requested but VK_EXT_debug_utils or the \
                 validation layer is unavailable; continuing without it"
            );
        }

        let mut ext_ptrs: Vec<*const std::os::raw::c_char> =
            required_exts.iter().map(|e| e.as_ptr()).collect();
        let mut layer_ptrs: Vec<*const std::os::raw::c_char> = Vec::new();
        let mut messenger_info = if want_messenger {
            ext_ptrs.push(ash::ext::debug_utils::NAME.as_ptr());
            layer_ptrs.push(VALIDATION_LAYER.as_ptr());
            let level = desc.debug.expect("want_messenger implies debug level");
            Some(
                vk::DebugUtilsMessengerCreateInfoEXT::default()
                    .message_severity(level.severity_flags())
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(messenger_callback)),
            )
        } else {
            None
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"glaze")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(version.packed());

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs);
        if let Some(ref mut info) = messenger_info {
            // Chaining the messenger info covers vkCreateInstance and
            // vkDestroyInstance themselves.
            create_info = create_info.push_next(info);
        }

        // SAFETY: create_info and everything it borrows is alive for the call.
        let handle = unsafe { entry.create_instance(&create_info, None) }
            .map_err(CreateInstanceError::Vulkan)?;

        let messenger = messenger_info.and_then(|mut info| {
            info.p_next = std::ptr::null();
            let loader = ash::ext::debug_utils::Instance::new(&entry, &handle);
            // SAFETY: info is valid and self-contained.
            match unsafe { loader.create_debug_utils_messenger(&info, None) } {
                Ok(m) => Some(Messenger { loader, handle: m }),
                Err(e) => {
                    tracing::warn!("could not install debug messenger: {e}");
                    None
                }
            }
        });

        let surface_loader = desc
            .windowing
            .map(|_| ash::khr::surface::Instance::new(&entry, &handle));

        Ok(Self {
            entry,
            handle,
            surface_loader,
            messenger,
            version,
        })
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }

    /// Enumerate the physical devices visible to this instance. The returned
    /// handles are only meaningful in the context of this instance.
    pub fn physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>, EnumerateDevicesError> {
        // SAFETY: handle is a live instance.
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(devices) => Ok(devices),
            Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => {
                Err(EnumerateDevicesError::OutOfMemory)
            }
            Err(e) => Err(EnumerateDevicesError::Vulkan(e)),
        }
    }

    /// # Safety
    /// `physical` must be a handle returned by [`physical_devices`](Self::physical_devices)
    /// on this instance.
    pub unsafe fn physical_device_properties(
        &self,
        physical: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.get_physical_device_properties(physical) }
    }

    /// # Safety
    /// `physical` must be a handle derived from this instance.
    pub unsafe fn queue_family_properties(
        &self,
        physical: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical)
        }
    }

    /// # Safety
    /// `physical` must be a handle derived from this instance.
    pub unsafe fn physical_device_memory_properties(
        &self,
        physical: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.get_physical_device_memory_properties(physical) }
    }

    /// # Safety
    /// `physical` must be derived from this instance and `create_info` must
    /// reference valid queue families and extension names for it.
    pub unsafe fn create_logical_device(
        &self,
        physical: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: caller guarantees provenance and create_info validity.
        unsafe { self.handle.create_device(physical, create_info, None) }
    }

    pub(crate) fn swapchain_loader(&self, device: &ash::Device) -> ash::khr::swapchain::Device {
        ash::khr::swapchain::Device::new(&self.handle, device)
    }

    pub(crate) fn debug_utils_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.messenger
            .as_ref()
            .map(|_| ash::ext::debug_utils::Device::new(&self.handle, device))
    }

    /// Create a raw `VkSurfaceKHR` for a window. Prefer
    /// [`Surface::new`](crate::surface::Surface::new), which ties the
    /// lifetimes together.
    ///
    /// # Safety
    /// The returned surface must be destroyed before the window it was
    /// created from goes away and before this instance is dropped.
    pub unsafe fn create_surface_handle<W>(
        &self,
        window: &W,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceHandleError>
    where
        W: raw_window_handle::HasWindowHandle + HasDisplayHandle,
    {
        if self.surface_loader.is_none() {
            return Err(CreateSurfaceHandleError::WindowingNotEnabled);
        }
        let display = window
            .display_handle()
            .map_err(CreateSurfaceHandleError::DisplayHandle)?;
        let handle = window
            .window_handle()
            .map_err(CreateSurfaceHandleError::WindowHandle)?;
        // SAFETY: both handles come from a live window; caller keeps the
        // window alive for the surface's lifetime.
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.handle,
                display.as_raw(),
                handle.as_raw(),
                None,
            )
        }
        .map_err(CreateSurfaceHandleError::Vulkan)
    }

    /// # Safety
    /// `surface` must be a surface created from this instance with no live
    /// swapchain still referencing it.
    pub unsafe fn destroy_surface_handle(&self, surface: vk::SurfaceKHR) {
        if let Some(loader) = self.surface_loader.as_ref() {
            // SAFETY: caller guarantees provenance and drop ordering.
            unsafe { loader.destroy_surface(surface, None) };
        }
    }

    /// # Safety
    /// `physical` must be derived from this instance; `surface` likewise.
    pub(crate) unsafe fn surface_support(
        &self,
        physical: vk::PhysicalDevice,
        queue_family: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, vk::Result> {
        let loader = self
            .surface_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            loader.get_physical_device_surface_support(physical, queue_family, surface)
        }
    }

    /// # Safety
    /// `physical` and `surface` must both be derived from this instance.
    pub(crate) unsafe fn surface_capabilities(
        &self,
        physical: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, vk::Result> {
        let loader = self
            .surface_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        // SAFETY: caller guarantees provenance.
        unsafe { loader.get_physical_device_surface_capabilities(physical, surface) }
    }

    /// # Safety
    /// `physical` and `surface` must both be derived from this instance.
    pub(crate) unsafe fn surface_formats(
        &self,
        physical: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, vk::Result> {
        let loader = self
            .surface_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        // SAFETY: caller guarantees provenance.
        unsafe { loader.get_physical_device_surface_formats(physical, surface) }
    }

    /// # Safety
    /// `physical` and `surface` must both be derived from this instance.
    pub(crate) unsafe fn surface_present_modes(
        &self,
        physical: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, vk::Result> {
        let loader = self
            .surface_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        // SAFETY: caller guarantees provenance.
        unsafe { loader.get_physical_device_surface_present_modes(physical, surface) }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some(messenger) = self.messenger.take() {
            // SAFETY: the messenger was created from this instance and this is
            // its final use.
            unsafe {
                messenger
                    .loader
                    .destroy_debug_utils_messenger(messenger.handle, None);
            }
        }
        // SAFETY: every derived object holds an Arc<Instance>, so reaching
        // drop means nothing derived from the instance is still alive.
        unsafe { self.handle.destroy_instance(None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_unpacks_fields() {
        let v = ApiVersion::new(1, 3, 212);
        assert_eq!(v.major(), 1);
        assert_eq!(v.minor(), 3);
        assert_eq!(v.patch(), 212);
        assert_eq!(ApiVersion::from_packed(v.packed()), v);
    }

    #[test]
    fn at_least_compares_major_then_minor() {
        assert!(ApiVersion::new(1, 3, 0).at_least(1, 3));
        assert!(ApiVersion::new(1, 3, 0).at_least(1, 2));
        assert!(!ApiVersion::new(1, 2, 99).at_least(1, 3));
        assert!(ApiVersion::new(2, 0, 0).at_least(1, 3));
    }

    #[test]
    fn debug_level_flags_accumulate() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        assert_eq!(DebugLevel::Error.severity_flags(), S::ERROR);
        assert!(DebugLevel::Verbose.severity_flags().contains(S::ERROR | S::VERBOSE));
        assert!(!DebugLevel::Warning.severity_flags().contains(S::INFO));
    }
}

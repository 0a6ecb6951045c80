//! Logical device creation and the raw Vulkan passthroughs every wrapper
//! type in this crate records and destroys through.
//!
//! The device requires Vulkan 1.3: dynamic rendering and synchronization2
//! are used as core entry points throughout, which keeps every dispatch
//! site free of extension-loader branching.

use std::ffi::CString;
use std::fmt;
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::{EnumerateDevicesError, Instance};
use crate::surface::{Surface, SurfaceQueryError};

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error("surface and instance arguments come from different instances")]
    ForeignSurface,

    #[error("failed to enumerate physical devices: {0}")]
    Enumerate(#[from] EnumerateDevicesError),

    #[error("error while querying surface support: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),

    #[error("no physical device supports Vulkan 1.3 with a graphics queue that can present to the surface")]
    NoSuitableDevice,

    #[error("vkCreateDevice failed: {0}")]
    DeviceCreation(vk::Result),

    #[error("failed to construct the memory allocator: {0}")]
    Allocator(AllocationError),
}

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("object name contains an interior NUL byte: {0}")]
    BadName(std::ffi::NulError),

    #[error("vkSetDebugUtilsObjectNameEXT failed: {0}")]
    Vulkan(vk::Result),
}

/// Intended access pattern for a memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Device-local only; never mapped.
    DeviceOnly,
    /// CPU writes, GPU reads (staging, per-frame data).
    Upload,
    /// GPU writes, CPU reads back.
    Readback,
}

impl MemoryUsage {
    fn location(self) -> MemoryLocation {
        match self {
            MemoryUsage::DeviceOnly => MemoryLocation::GpuOnly,
            MemoryUsage::Upload => MemoryLocation::CpuToGpu,
            MemoryUsage::Readback => MemoryLocation::GpuToCpu,
        }
    }
}

/// An owned `VkDevice` with its graphics/present queue and memory allocator.
///
/// Queue submission and presentation require external synchronization per
/// the Vulkan spec; the queue handle therefore lives behind a `Mutex` and is
/// only reachable through [`submit`](Self::submit) and the swapchain's
/// present path.
pub struct Device {
    instance: Arc<Instance>,
    handle: ash::Device,
    physical: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    allocator: Option<Mutex<Allocator>>,
    swapchain_loader: ash::khr::swapchain::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    queue: Mutex<vk::Queue>,
    queue_family: u32,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("queue_family", &self.queue_family)
            .finish_non_exhaustive()
    }
}

/// Rank a physical device for selection. Discrete beats integrated beats
/// everything else; device-local heap size breaks ties within a class.
fn rank_device(
    properties: &vk::PhysicalDeviceProperties,
    memory: &vk::PhysicalDeviceMemoryProperties,
) -> (u32, u64) {
    let class = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    };
    let local_heap_bytes = memory.memory_heaps[..memory.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();
    (class, local_heap_bytes)
}

impl Device {
    /// Create a logical device able to render to and present on `surface`.
    ///
    /// Picks the highest-ranked Vulkan 1.3 physical device exposing a queue
    /// family with both graphics support and presentation support for the
    /// surface, then enables `VK_KHR_swapchain`, dynamic rendering, and
    /// synchronization2.
    pub fn new_presentable<W>(
        instance: &Arc<Instance>,
        surface: &Surface<W>,
    ) -> Result<Arc<Self>, CreateDeviceError>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        if !Arc::ptr_eq(surface.instance(), instance) {
            return Err(CreateDeviceError::ForeignSurface);
        }

        struct Candidate {
            physical: vk::PhysicalDevice,
            properties: vk::PhysicalDeviceProperties,
            queue_family: u32,
            rank: (u32, u64),
        }

        let mut best: Option<Candidate> = None;
        for physical in instance.physical_devices()? {
            // SAFETY: physical was just enumerated from this instance.
            let properties = unsafe { instance.physical_device_properties(physical) };
            if vk::api_version_major(properties.api_version) == 1
                && vk::api_version_minor(properties.api_version) < 3
            {
                continue;
            }

            // SAFETY: physical was enumerated from this instance.
            let families = unsafe { instance.queue_family_properties(physical) };
            let mut queue_family = None;
            for (index, family) in families.iter().enumerate() {
                if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                    continue;
                }
                // SAFETY: physical comes from the same instance as surface
                // (validated by the ptr_eq check above).
                let presentable =
                    unsafe { surface.supports_queue_family(physical, index as u32) }?;
                if presentable {
                    queue_family = Some(index as u32);
                    break;
                }
            }
            let Some(queue_family) = queue_family else {
                continue;
            };

            // SAFETY: physical was enumerated from this instance.
            let memory = unsafe { instance.physical_device_memory_properties(physical) };
            let rank = rank_device(&properties, &memory);
            let better = match best.as_ref() {
                Some(current) => rank > current.rank,
                None => true,
            };
            if better {
                best = Some(Candidate {
                    physical,
                    properties,
                    queue_family,
                    rank,
                });
            }
        }

        let chosen = best.ok_or(CreateDeviceError::NoSuitableDevice)?;
        tracing::info!(
            "Selected physical device {:?} (type {:?}, {} MiB device-local)",
            chosen
                .properties
                .device_name_as_c_str()
                .unwrap_or(c"unknown"),
            chosen.properties.device_type,
            chosen.rank.1 / (1024 * 1024),
        );

        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(chosen.queue_family)
            .queue_priorities(&queue_priorities);

        let extensions = [ash::khr::swapchain::NAME.as_ptr()];
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut features13);

        // SAFETY: chosen.physical was enumerated from this instance and
        // create_info references only live locals.
        let handle = unsafe { instance.create_logical_device(chosen.physical, &create_info) }
            .map_err(CreateDeviceError::DeviceCreation)?;

        // SAFETY: the device was created with one queue in this family.
        let queue = unsafe { handle.get_device_queue(chosen.queue_family, 0) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: handle.clone(),
            physical_device: chosen.physical,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(CreateDeviceError::Allocator)?;

        Ok(Arc::new(Self {
            instance: Arc::clone(instance),
            swapchain_loader: instance.swapchain_loader(&handle),
            debug_utils: instance.debug_utils_loader(&handle),
            allocator: Some(Mutex::new(allocator)),
            queue: Mutex::new(queue),
            queue_family: chosen.queue_family,
            physical: chosen.physical,
            properties: chosen.properties,
            handle,
        }))
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn physical(&self) -> vk::PhysicalDevice {
        self.physical
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }

    pub(crate) fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    /// Block until all work submitted to this device has completed. Meant
    /// for coarse transitions (teardown, suspend, swapchain replacement),
    /// not per-frame pacing.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: the device handle is alive; no pointer parameters.
        unsafe { self.handle.device_wait_idle() }
    }

    /// Submit batches to the graphics/present queue via synchronization2.
    ///
    /// # Safety
    /// All handles in `submits` must be derived from this device. Command
    /// buffers must be executable; wait semaphores pending a signal; signal
    /// semaphores unsignaled; `fence`, when non-null, an unsignaled fence
    /// from this device.
    pub unsafe fn submit(
        &self,
        submits: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let queue = self.queue.lock().expect("queue lock poisoned");
        // SAFETY: queue access is serialized by the lock; caller guarantees
        // the handle and state preconditions.
        unsafe { self.handle.queue_submit2(*queue, submits, fence) }
    }
}

// Memory allocation, delegated to gpu-allocator behind a mutex.
impl Device {
    /// Allocate memory for `requirements`. For mappable usages the size and
    /// alignment are rounded up to `nonCoherentAtomSize` so mapped-range
    /// flushes can always be expressed at atom granularity.
    pub fn alloc(
        &self,
        label: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        let requirements = if usage == MemoryUsage::DeviceOnly {
            requirements
        } else {
            let atom = self.non_coherent_atom_size();
            vk::MemoryRequirements {
                size: requirements.size.div_ceil(atom) * atom,
                alignment: requirements.alignment.max(atom),
                memory_type_bits: requirements.memory_type_bits,
            }
        };
        self.allocator
            .as_ref()
            .expect("allocator is taken only in Device::drop")
            .lock()
            .expect("allocator lock poisoned")
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location: usage.location(),
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
    }

    pub fn dealloc(&self, allocation: Allocation) -> Result<(), AllocationError> {
        self.allocator
            .as_ref()
            .expect("allocator is taken only in Device::drop")
            .lock()
            .expect("allocator lock poisoned")
            .free(allocation)
    }
}

// Debug-utils object labels.
impl Device {
    /// Attach a debug label to a Vulkan object. A no-op without the
    /// debug-utils extension (i.e. when the instance has no messenger).
    ///
    /// # Safety
    /// `object` must be a live handle created from this device.
    pub unsafe fn label<H: vk::Handle>(
        &self,
        object: H,
        name: &str,
    ) -> Result<(), LabelError> {
        let Some(debug_utils) = self.debug_utils.as_ref() else {
            return Ok(());
        };
        let name = CString::new(name).map_err(LabelError::BadName)?;
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(&name);
        // SAFETY: caller guarantees the object is alive and from this device.
        unsafe { debug_utils.set_debug_utils_object_name(&info) }.map_err(LabelError::Vulkan)
    }

    /// Like [`label`](Self::label) but the name is only built when the
    /// extension is active, and failures are logged rather than returned.
    ///
    /// # Safety
    /// `object` must be a live handle created from this device.
    pub unsafe fn label_with<H, F>(&self, object: H, name: F)
    where
        H: vk::Handle + Copy + fmt::Debug,
        F: FnOnce() -> String,
    {
        if self.debug_utils.is_none() {
            return;
        }
        // SAFETY: forwarded contract.
        if let Err(e) = unsafe { self.label(object, &name()) } {
            tracing::warn!("failed to label {object:?}: {e}");
        }
    }
}

// Swapchain passthroughs (used by the swapchain module).
impl Device {
    /// # Safety
    /// Everything `create_info` references must be alive and derived from
    /// this device or its instance; an `old_swapchain`, when set, must be a
    /// retired-but-undestroyed swapchain from this device.
    pub(crate) unsafe fn create_swapchain_khr(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.swapchain_loader.create_swapchain(create_info, None) }
    }

    /// # Safety
    /// `swapchain` must be a live swapchain created from this device.
    pub(crate) unsafe fn swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    /// # Safety
    /// `swapchain` must come from this device; all derived views must be
    /// destroyed first and no GPU work may still reference it.
    pub(crate) unsafe fn destroy_swapchain_khr(&self, swapchain: vk::SwapchainKHR) {
        // SAFETY: forwarded contract.
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    /// # Safety
    /// Handles must come from this device; `semaphore`/`fence`, when
    /// non-null, must be unsignaled.
    pub(crate) unsafe fn acquire_image_khr(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool), vk::Result> {
        // SAFETY: forwarded contract.
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, fence)
        }
    }

    /// Present on the graphics/present queue. Returns `Ok(true)` when the
    /// swapchain is suboptimal for the surface.
    ///
    /// # Safety
    /// All handles in `present_info` must be derived from this device; wait
    /// semaphores must have a pending signal; the presented image must be in
    /// `PRESENT_SRC_KHR` layout.
    pub(crate) unsafe fn queue_present_khr(
        &self,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        let queue = self.queue.lock().expect("queue lock poisoned");
        // SAFETY: queue access is serialized by the lock; caller guarantees
        // everything else.
        unsafe { self.swapchain_loader.queue_present(*queue, present_info) }
    }
}

// Image view passthroughs.
impl Device {
    /// # Safety
    /// `create_info` must reference a live image from this device.
    pub(crate) unsafe fn create_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    /// # Safety
    /// `view` must come from this device with no remaining users.
    pub(crate) unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.destroy_image_view(view, None) };
    }
}

// Shader module passthroughs.
impl Device {
    /// # Safety
    /// `create_info.code` must be valid SPIR-V.
    pub(crate) unsafe fn create_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `module` must come from this device; pipelines built from it may
    /// outlive it, but the module handle itself must have no other users.
    pub(crate) unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.destroy_shader_module(module, None) };
    }
}

// Pipeline passthroughs.
impl Device {
    /// # Safety
    /// All set layouts referenced by `create_info` must be live handles from
    /// this device.
    pub(crate) unsafe fn create_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must come from this device and no longer be referenced by
    /// any pipeline still in use.
    pub(crate) unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// Create one graphics pipeline. ash surfaces partial successes on batch
    /// failure; any stray handles are destroyed here so callers never see a
    /// half-built batch.
    ///
    /// # Safety
    /// `create_info` must reference live shader stages, layout, and pNext
    /// structures from this device for the duration of the call.
    pub(crate) unsafe fn create_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: forwarded contract.
        let result = unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        };
        match result {
            Ok(mut pipelines) => {
                debug_assert_eq!(pipelines.len(), 1);
                Ok(pipelines.remove(0))
            }
            Err((partial, error)) => {
                for pipeline in partial {
                    if pipeline != vk::Pipeline::null() {
                        // SAFETY: the handle was just created by this device.
                        unsafe { self.handle.destroy_pipeline(pipeline, None) };
                    }
                }
                Err(error)
            }
        }
    }

    /// # Safety
    /// `pipeline` must come from this device with no in-flight GPU work
    /// still referencing it.
    pub(crate) unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

// Descriptor passthroughs.
impl Device {
    /// # Safety
    /// `create_info` must reference live samplers, if any.
    pub(crate) unsafe fn create_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.create_descriptor_set_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must come from this device and not be referenced by any live
    /// pipeline layout or allocated set.
    pub(crate) unsafe fn destroy_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.destroy_descriptor_set_layout(layout, None) };
    }

    /// # Safety
    /// No preconditions beyond a valid create info.
    pub(crate) unsafe fn create_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.create_descriptor_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must come from this device; sets allocated from it are freed
    /// implicitly and must no longer be referenced by pending GPU work.
    pub(crate) unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.destroy_descriptor_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info` must reference a live pool and layouts from this
    /// device; pool-level access requires external synchronization.
    pub(crate) unsafe fn allocate_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.allocate_descriptor_sets(allocate_info) }
    }

    /// # Safety
    /// All handles in `writes` must be live and from this device; no set
    /// being written may be in use by pending GPU work.
    pub(crate) unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.update_descriptor_sets(writes, &[]) };
    }
}

// Buffer passthroughs.
impl Device {
    /// # Safety
    /// No preconditions beyond a valid create info.
    pub(crate) unsafe fn create_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must come from this device with no pending GPU users.
    pub(crate) unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must be a live buffer from this device.
    pub(crate) unsafe fn buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: forwarded contract.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` must be unbound; `memory` + `offset` must satisfy the
    /// buffer's memory requirements.
    pub(crate) unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// Every range must lie in mapped, host-visible memory from this device
    /// with atom-aligned offset and size (or WHOLE_SIZE).
    pub(crate) unsafe fn flush_mapped_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.flush_mapped_memory_ranges(ranges) }
    }
}

// Command pool / buffer passthroughs.
impl Device {
    /// # Safety
    /// `create_info.queue_family_index` must be a family of this device.
    pub(crate) unsafe fn create_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must come from this device; no buffer allocated from it may
    /// still be pending on the GPU. Destroys all allocated buffers.
    pub(crate) unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info` must reference a live pool from this device, with
    /// pool access externally synchronized.
    pub(crate) unsafe fn allocate_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// # Safety
    /// The buffer must be in the initial state and not pending.
    pub(crate) unsafe fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.begin_command_buffer(buffer, begin_info) }
    }

    /// # Safety
    /// The buffer must be in the recording state.
    pub(crate) unsafe fn end_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.end_command_buffer(buffer) }
    }

    /// # Safety
    /// The buffer must not be pending on the GPU.
    pub(crate) unsafe fn reset_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded contract.
        unsafe {
            self.handle
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
        }
    }
}

// Command recording passthroughs. All of these require the buffer to be in
// the recording state and every referenced handle to come from this device.
impl Device {
    /// # Safety
    /// Recording state; all handles and layouts in `dependency_info` must be
    /// consistent with the actual image/buffer states.
    pub(crate) unsafe fn cmd_barrier(
        &self,
        buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.cmd_pipeline_barrier2(buffer, dependency_info) };
    }

    /// # Safety
    /// Recording state; attachments must be live and already in the layouts
    /// declared by `rendering_info`.
    pub(crate) unsafe fn cmd_begin_rendering(
        &self,
        buffer: vk::CommandBuffer,
        rendering_info: &vk::RenderingInfo<'_>,
    ) {
        // SAFETY: forwarded contract (dynamic rendering is core in 1.3).
        unsafe { self.handle.cmd_begin_rendering(buffer, rendering_info) };
    }

    /// # Safety
    /// Recording state, inside a dynamic render pass.
    pub(crate) unsafe fn cmd_end_rendering(&self, buffer: vk::CommandBuffer) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.cmd_end_rendering(buffer) };
    }

    /// # Safety
    /// Recording state; `pipeline` must be a live graphics pipeline.
    pub(crate) unsafe fn cmd_bind_graphics_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: forwarded contract.
        unsafe {
            self.handle
                .cmd_bind_pipeline(buffer, vk::PipelineBindPoint::GRAPHICS, pipeline)
        };
    }

    /// # Safety
    /// Recording state; `layout` and `sets` must be live and compatible with
    /// the bound pipeline.
    pub(crate) unsafe fn cmd_bind_descriptor_sets(
        &self,
        buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: forwarded contract.
        unsafe {
            self.handle.cmd_bind_descriptor_sets(
                buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                sets,
                &[],
            )
        };
    }

    /// # Safety
    /// Recording state; `buffers` and `offsets` must have equal length and
    /// reference live buffers.
    pub(crate) unsafe fn cmd_bind_vertex_buffers(
        &self,
        buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: forwarded contract.
        unsafe {
            self.handle
                .cmd_bind_vertex_buffers(buffer, first_binding, buffers, offsets)
        };
    }

    /// # Safety
    /// Recording state; `index_buffer` must be live with INDEX_BUFFER usage.
    pub(crate) unsafe fn cmd_bind_index_buffer(
        &self,
        buffer: vk::CommandBuffer,
        index_buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: forwarded contract.
        unsafe {
            self.handle
                .cmd_bind_index_buffer(buffer, index_buffer, offset, index_type)
        };
    }

    /// # Safety
    /// Recording state; both buffers live; regions in bounds.
    pub(crate) unsafe fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.cmd_copy_buffer(buffer, src, dst, regions) };
    }

    /// # Safety
    /// Recording state with a pipeline declaring dynamic viewport.
    pub(crate) unsafe fn cmd_set_viewport(
        &self,
        buffer: vk::CommandBuffer,
        viewports: &[vk::Viewport],
    ) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.cmd_set_viewport(buffer, 0, viewports) };
    }

    /// # Safety
    /// Recording state with a pipeline declaring dynamic scissor.
    pub(crate) unsafe fn cmd_set_scissor(
        &self,
        buffer: vk::CommandBuffer,
        scissors: &[vk::Rect2D],
    ) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.cmd_set_scissor(buffer, 0, scissors) };
    }

    /// # Safety
    /// Recording state inside a render pass, compatible pipeline bound, all
    /// required dynamic state set.
    pub(crate) unsafe fn cmd_draw(
        &self,
        buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        // SAFETY: forwarded contract.
        unsafe {
            self.handle.cmd_draw(
                buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
    }

    /// # Safety
    /// Like [`cmd_draw`](Self::cmd_draw), plus a live index buffer bound.
    pub(crate) unsafe fn cmd_draw_indexed(
        &self,
        buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: forwarded contract.
        unsafe {
            self.handle.cmd_draw_indexed(
                buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }
}

// Fence / semaphore passthroughs.
impl Device {
    /// # Safety
    /// No preconditions beyond a valid create info.
    pub(crate) unsafe fn create_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must come from this device and not be pending.
    pub(crate) unsafe fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// `fences` must all come from this device.
    pub(crate) unsafe fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// # Safety
    /// `fences` must all come from this device and none may be pending.
    pub(crate) unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.reset_fences(fences) }
    }

    /// # Safety
    /// `fence` must come from this device.
    pub(crate) unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.get_fence_status(fence) }
    }

    /// # Safety
    /// No preconditions beyond a valid create info.
    pub(crate) unsafe fn create_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        // SAFETY: forwarded contract.
        unsafe { self.handle.create_semaphore(create_info, None) }
    }

    /// # Safety
    /// `semaphore` must come from this device with no pending waits or
    /// signals.
    pub(crate) unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: forwarded contract.
        unsafe { self.handle.destroy_semaphore(semaphore, None) };
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        // The allocator owns VkDeviceMemory and must release it while the
        // device is still alive.
        drop(self.allocator.take());
        // SAFETY: every wrapper holds Arc<Device>, so reaching drop means no
        // derived object remains.
        unsafe { self.handle.destroy_device(None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props_of_type(device_type: vk::PhysicalDeviceType) -> vk::PhysicalDeviceProperties {
        vk::PhysicalDeviceProperties {
            device_type,
            ..Default::default()
        }
    }

    fn memory_with_local_heap(size: u64) -> vk::PhysicalDeviceMemoryProperties {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: 1,
            ..Default::default()
        };
        memory.memory_heaps[0] = vk::MemoryHeap {
            size,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory
    }

    #[test]
    fn discrete_outranks_integrated_regardless_of_heap() {
        let discrete = rank_device(
            &props_of_type(vk::PhysicalDeviceType::DISCRETE_GPU),
            &memory_with_local_heap(2 << 30),
        );
        let integrated = rank_device(
            &props_of_type(vk::PhysicalDeviceType::INTEGRATED_GPU),
            &memory_with_local_heap(16 << 30),
        );
        assert!(discrete > integrated);
    }

    #[test]
    fn heap_size_breaks_ties_within_a_class() {
        let small = rank_device(
            &props_of_type(vk::PhysicalDeviceType::DISCRETE_GPU),
            &memory_with_local_heap(4 << 30),
        );
        let large = rank_device(
            &props_of_type(vk::PhysicalDeviceType::DISCRETE_GPU),
            &memory_with_local_heap(8 << 30),
        );
        assert!(large > small);
    }

    #[test]
    fn non_local_heaps_do_not_count() {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: 2,
            ..Default::default()
        };
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory.memory_heaps[1] = vk::MemoryHeap {
            size: 64 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };
        let rank = rank_device(&props_of_type(vk::PhysicalDeviceType::DISCRETE_GPU), &memory);
        assert_eq!(rank.1, 1 << 30);
    }
}

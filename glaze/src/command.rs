//! Command pools and primary command buffers.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferRef;
use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
}

/// CPU-side approximation of a command buffer's lifecycle state.
///
/// Vulkan does not expose the real state, so this only tracks what this
/// wrapper has been asked to do; it exists for `debug_assert!`s and for
/// callers that want to introspect their own sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Initial,
    Recording,
    Executable,
}

/// Co-owned raw pool handle. Held by the pool wrapper and by every buffer
/// allocated from it, so `vkDestroyCommandPool` (which frees all buffers
/// implicitly) only runs after the last of them is gone.
struct PoolShared {
    device: Arc<Device>,
    pool: vk::CommandPool,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: this runs only once the pool wrapper and every allocated
        // buffer are dropped; destroying the pool frees its buffers.
        unsafe { self.device.destroy_command_pool(self.pool) };
    }
}

/// An owned command pool allocating individually resettable primary buffers.
///
/// Pool-level operations require external synchronization, so this type is
/// deliberately `!Sync`: a pool lives on one thread, and cross-thread
/// recording means one pool per thread.
pub struct CommandPool {
    shared: Arc<PoolShared>,
    _single_thread: PhantomData<Cell<()>>,
}

impl fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.shared.pool)
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        label: Option<&str>,
    ) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        // SAFETY: the queue family index is the caller's claim about this
        // device; an invalid one is caught by validation.
        let pool = unsafe { device.create_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;
        if let Some(label) = label {
            // SAFETY: pool was created above from this device.
            unsafe { device.label_with(pool, || label.to_owned()) };
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                device: Arc::clone(device),
                pool,
            }),
            _single_thread: PhantomData,
        })
    }

    /// Allocate one primary command buffer.
    ///
    /// The buffer keeps the raw pool alive through shared ownership; its
    /// handle is reclaimed when the pool is destroyed rather than freed
    /// individually.
    pub fn allocate(&self) -> Result<CommandBuffer, AllocateError> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.shared.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: the pool is alive and this type being !Sync means no
        // concurrent pool access can exist.
        let mut buffers = unsafe { self.shared.device.allocate_command_buffers(&allocate_info) }
            .map_err(AllocateError::Vulkan)?;
        debug_assert_eq!(buffers.len(), 1);
        Ok(CommandBuffer {
            device: Arc::clone(&self.shared.device),
            _pool: Arc::clone(&self.shared),
            handle: buffers.remove(0),
            state: RecordState::Initial,
            _single_thread: PhantomData,
        })
    }

    pub fn as_raw(&self) -> vk::CommandPool {
        self.shared.pool
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }
}

/// A primary command buffer.
///
/// `reset`/`begin`/`finish` and all recording methods are `unsafe`: Vulkan
/// state sequencing and handle lifetimes across GPU execution cannot be
/// checked from the CPU. A [`RecordState`] shadow is maintained for
/// `debug_assert!`s.
pub struct CommandBuffer {
    device: Arc<Device>,
    _pool: Arc<PoolShared>,
    handle: vk::CommandBuffer,
    state: RecordState,
    _single_thread: PhantomData<Cell<()>>,
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    pub fn as_raw(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Return the buffer to the initial state.
    ///
    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees the buffer is not pending.
        unsafe { self.device.reset_command_buffer(self.handle) }?;
        self.state = RecordState::Initial;
        Ok(())
    }

    /// Begin a one-shot recording.
    ///
    /// # Safety
    /// The buffer must be in the initial state (fresh or reset) and not
    /// pending execution.
    pub unsafe fn begin(&mut self) -> Result<(), vk::Result> {
        debug_assert_eq!(self.state, RecordState::Initial);
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: caller guarantees the initial state.
        unsafe { self.device.begin_command_buffer(self.handle, &begin_info) }?;
        self.state = RecordState::Recording;
        Ok(())
    }

    /// End recording, leaving the buffer executable.
    ///
    /// # Safety
    /// The buffer must be recording, outside any render pass.
    pub unsafe fn finish(&mut self) -> Result<(), vk::Result> {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: caller guarantees the recording state.
        unsafe { self.device.end_command_buffer(self.handle) }?;
        self.state = RecordState::Executable;
        Ok(())
    }

    /// Record a synchronization2 pipeline barrier.
    ///
    /// # Safety
    /// Recording state; every handle and layout in `dependency_info` must be
    /// valid and consistent with actual resource state.
    pub unsafe fn barrier(&mut self, dependency_info: &vk::DependencyInfo<'_>) {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: forwarded contract.
        unsafe { self.device.cmd_barrier(self.handle, dependency_info) }
    }

    /// Begin a dynamic render pass.
    ///
    /// # Safety
    /// Recording state; attachments referenced by `rendering_info` must be
    /// live and already in their declared layouts.
    pub unsafe fn begin_rendering(&mut self, rendering_info: &vk::RenderingInfo<'_>) {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: forwarded contract.
        unsafe { self.device.cmd_begin_rendering(self.handle, rendering_info) }
    }

    /// End the current dynamic render pass.
    ///
    /// # Safety
    /// Must be inside a render pass begun with
    /// [`begin_rendering`](Self::begin_rendering).
    pub unsafe fn end_rendering(&mut self) {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: forwarded contract.
        unsafe { self.device.cmd_end_rendering(self.handle) }
    }

    /// # Safety
    /// Recording state; `pipeline` must be a live graphics pipeline from the
    /// same device.
    pub unsafe fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: forwarded contract.
        unsafe { self.device.cmd_bind_graphics_pipeline(self.handle, pipeline) }
    }

    /// # Safety
    /// Recording state; `layout` and `sets` must be live, from this device,
    /// and compatible with the bound pipeline.
    pub unsafe fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: forwarded contract.
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(self.handle, layout, first_set, sets)
        }
    }

    /// # Safety
    /// Recording state; every buffer must be live and from this device;
    /// `buffers` and `offsets` must have equal length.
    pub unsafe fn bind_vertex_buffers<B: BufferRef>(
        &mut self,
        first_binding: u32,
        buffers: &[B],
        offsets: &[vk::DeviceSize],
    ) {
        debug_assert_eq!(self.state, RecordState::Recording);
        let raw: Vec<vk::Buffer> = buffers.iter().map(|b| b.raw_buffer()).collect();
        // SAFETY: forwarded contract.
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.handle, first_binding, &raw, offsets)
        }
    }

    /// # Safety
    /// Recording state; `buffer` must be live with INDEX_BUFFER usage.
    pub unsafe fn bind_index_buffer<B: BufferRef>(
        &mut self,
        buffer: &B,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: forwarded contract.
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.handle, buffer.raw_buffer(), offset, index_type)
        }
    }

    /// # Safety
    /// Recording state; both buffers live and from this device; every region
    /// in bounds for both.
    pub unsafe fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: forwarded contract.
        unsafe { self.device.cmd_copy_buffer(self.handle, src, dst, regions) }
    }

    /// # Safety
    /// Recording state with a pipeline declaring dynamic viewport.
    pub unsafe fn set_viewport(&mut self, viewport: vk::Viewport) {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: forwarded contract.
        unsafe { self.device.cmd_set_viewport(self.handle, &[viewport]) }
    }

    /// # Safety
    /// Recording state with a pipeline declaring dynamic scissor.
    pub unsafe fn set_scissor(&mut self, scissor: vk::Rect2D) {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: forwarded contract.
        unsafe { self.device.cmd_set_scissor(self.handle, &[scissor]) }
    }

    /// # Safety
    /// Recording state inside a render pass, with a compatible pipeline
    /// bound and all declared dynamic state set.
    pub unsafe fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: forwarded contract.
        unsafe {
            self.device.cmd_draw(
                self.handle,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }

    /// # Safety
    /// Like [`draw`](Self::draw), plus a live index buffer bound.
    pub unsafe fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        debug_assert_eq!(self.state, RecordState::Recording);
        // SAFETY: forwarded contract.
        unsafe {
            self.device.cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }
}

// Compile-time auto-trait checks: both types move freely between threads
// (Send) but cannot be shared (`!Sync` via PhantomData<Cell<()>>). Recording
// implicitly touches the pool, so a pool and every buffer allocated from it
// must be used from one thread at a time.
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for CommandPool {}
impl AssertSend for CommandBuffer {}

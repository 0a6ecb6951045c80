//! GPU buffers: a mapped staging type and a device-local type.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::AllocationError;
use thiserror::Error;

use crate::command::CommandBuffer;
use crate::device::{Device, MemoryUsage};

/// Anything exposing a raw `VkBuffer`. Lets recording and descriptor
/// helpers accept either wrapper type, or borrows of them.
pub trait BufferRef {
    fn raw_buffer(&self) -> vk::Buffer;
}

impl<T: BufferRef + ?Sized> BufferRef for &T {
    fn raw_buffer(&self) -> vk::Buffer {
        (**self).raw_buffer()
    }
}

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("vkCreateBuffer failed: {0}")]
    Create(vk::Result),

    #[error("memory allocation failed: {0}")]
    Alloc(AllocationError),

    #[error("vkBindBufferMemory failed: {0}")]
    Bind(vk::Result),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write of {data_bytes} bytes exceeds buffer capacity of {capacity} bytes")]
    TooLarge {
        data_bytes: usize,
        capacity: vk::DeviceSize,
    },

    #[error("allocation is not host-mapped")]
    NotMapped,

    #[error("vkFlushMappedMemoryRanges failed: {0}")]
    Flush(vk::Result),
}

#[derive(Debug, Error)]
pub enum RecordCopyError {
    #[error(
        "copy of {size} bytes at src+{src_offset}/dst+{dst_offset} leaves \
         src ({src_size}) or dst ({dst_size}) bounds"
    )]
    OutOfBounds {
        src_size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_size: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
}

/// Overflow-safe bounds check for a buffer-to-buffer copy region.
fn region_in_bounds(
    src_size: vk::DeviceSize,
    src_offset: vk::DeviceSize,
    dst_size: vk::DeviceSize,
    dst_offset: vk::DeviceSize,
    size: vk::DeviceSize,
) -> bool {
    src_offset.checked_add(size).is_some_and(|end| end <= src_size)
        && dst_offset.checked_add(size).is_some_and(|end| end <= dst_size)
}

/// Shared core of both buffer types: handle plus its backing allocation.
struct RawBuffer {
    device: Arc<Device>,
    handle: vk::Buffer,
    // Option only so drop can move it out to the allocator.
    allocation: Option<Allocation>,
    capacity: vk::DeviceSize,
}

impl RawBuffer {
    fn new(
        device: &Arc<Device>,
        capacity: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: MemoryUsage,
        label: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(capacity)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: the create info is self-contained.
        let handle =
            unsafe { device.create_buffer(&create_info) }.map_err(CreateBufferError::Create)?;
        if let Some(label) = label {
            // SAFETY: handle was created above from this device.
            unsafe { device.label_with(handle, || label.to_owned()) };
        }

        // SAFETY: handle is a live buffer from this device.
        let requirements = unsafe { device.buffer_memory_requirements(handle) };
        let allocation = match device.alloc(
            label.unwrap_or("buffer"),
            requirements,
            memory,
            true,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: the buffer is unbound and has no other users.
                unsafe { device.destroy_buffer(handle) };
                return Err(CreateBufferError::Alloc(e));
            }
        };

        // SAFETY: the allocation's memory block satisfies the requirements
        // queried for this exact buffer.
        let bound = unsafe {
            device.bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            if let Err(free_err) = device.dealloc(allocation) {
                tracing::error!("leaking allocation after failed bind: {free_err}");
            }
            // SAFETY: the buffer failed to bind and has no other users.
            unsafe { device.destroy_buffer(handle) };
            return Err(CreateBufferError::Bind(e));
        }

        Ok(Self {
            device: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            capacity,
        })
    }

    fn allocation(&self) -> &Allocation {
        self.allocation
            .as_ref()
            .expect("allocation is taken only in RawBuffer::drop")
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBuffer")
            .field("handle", &self.handle)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        // SAFETY: the wrapper owns the handle; no GPU work may still use it.
        unsafe { self.device.destroy_buffer(self.handle) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.dealloc(allocation) {
                tracing::error!("failed to free buffer allocation: {e}");
            }
        }
    }
}

/// A persistently mapped, CPU-writable buffer in upload memory. Fill it
/// with [`write_slice`](Self::write_slice), then either use it directly
/// (uniforms, per-frame data) or copy out of it into a [`DeviceBuffer`].
#[derive(Debug)]
pub struct StagingBuffer {
    raw: RawBuffer,
}

impl StagingBuffer {
    pub fn new(
        device: &Arc<Device>,
        capacity: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        label: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            raw: RawBuffer::new(device, capacity, usage, MemoryUsage::Upload, label)?,
        })
    }

    /// Copy `data` to the start of the buffer, flushing when the backing
    /// memory type is not host-coherent.
    pub fn write_slice<T: Pod>(&mut self, data: &[T]) -> Result<(), WriteError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as vk::DeviceSize > self.raw.capacity {
            return Err(WriteError::TooLarge {
                data_bytes: bytes.len(),
                capacity: self.raw.capacity,
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let allocation = self.raw.allocation();
        let mapped = allocation.mapped_ptr().ok_or(WriteError::NotMapped)?;
        // SAFETY: the mapped pointer covers the whole allocation, the write
        // length was bounds-checked against the buffer capacity, and `&mut
        // self` rules out overlapping wrapper access.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapped.as_ptr().cast::<u8>(),
                bytes.len(),
            );
        }

        let coherent = allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        if !coherent {
            let atom = self.raw.device.non_coherent_atom_size();
            // Device::alloc rounds mappable allocations to atom multiples,
            // so the rounded flush range stays inside the allocation.
            debug_assert_eq!(allocation.offset() % atom, 0);
            debug_assert_eq!(allocation.size() % atom, 0);
            let flush_size = (bytes.len() as vk::DeviceSize).div_ceil(atom) * atom;
            let range = vk::MappedMemoryRange::default()
                // SAFETY: the allocation stays alive for the whole call.
                .memory(unsafe { allocation.memory() })
                .offset(allocation.offset())
                .size(flush_size);
            // SAFETY: the range lies in mapped host-visible memory at atom
            // granularity.
            unsafe { self.raw.device.flush_mapped_ranges(std::slice::from_ref(&range)) }
                .map_err(WriteError::Flush)?;
        }

        Ok(())
    }

    pub fn capacity(&self) -> vk::DeviceSize {
        self.raw.capacity
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.raw.device
    }
}

impl BufferRef for StagingBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.raw.handle
    }
}

/// A buffer in device-local memory. Populate it by recording a copy from a
/// [`StagingBuffer`] and submitting that command buffer.
#[derive(Debug)]
pub struct DeviceBuffer {
    raw: RawBuffer,
}

impl DeviceBuffer {
    pub fn new(
        device: &Arc<Device>,
        capacity: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        label: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            raw: RawBuffer::new(device, capacity, usage, MemoryUsage::DeviceOnly, label)?,
        })
    }

    /// Record a copy of the staging buffer's full capacity into this buffer
    /// at offset zero.
    ///
    /// # Safety
    /// Same contract as [`record_copy_region`](Self::record_copy_region).
    pub unsafe fn record_copy_from(
        &mut self,
        commands: &mut CommandBuffer,
        src: &StagingBuffer,
    ) -> Result<(), RecordCopyError> {
        // SAFETY: forwarded contract; a full-capacity copy at offset zero is
        // in bounds whenever the bounds check passes.
        unsafe { self.record_copy_region(commands, src, 0, 0, src.capacity()) }
    }

    /// Record a region copy from `src` into this buffer.
    ///
    /// The caller owns begin/finish/submit of `commands` and all GPU
    /// synchronization; both buffers must outlive the submitted work.
    ///
    /// # Safety
    /// `commands` must be recording. `src` needs TRANSFER_SRC usage and this
    /// buffer TRANSFER_DST. All three objects must share a device.
    pub unsafe fn record_copy_region(
        &mut self,
        commands: &mut CommandBuffer,
        src: &StagingBuffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), RecordCopyError> {
        if !region_in_bounds(src.capacity(), src_offset, self.raw.capacity, dst_offset, size) {
            return Err(RecordCopyError::OutOfBounds {
                src_size: src.capacity(),
                src_offset,
                dst_size: self.raw.capacity,
                dst_offset,
                size,
            });
        }
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        // SAFETY: forwarded contract; the region was bounds-checked.
        unsafe {
            commands.copy_buffer(
                src.raw_buffer(),
                self.raw.handle,
                std::slice::from_ref(&region),
            )
        };
        Ok(())
    }

    pub fn capacity(&self) -> vk::DeviceSize {
        self.raw.capacity
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.raw.device
    }
}

impl BufferRef for DeviceBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.raw.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_fit_region_is_in_bounds() {
        assert!(region_in_bounds(64, 0, 64, 0, 64));
        assert!(region_in_bounds(64, 32, 128, 96, 32));
    }

    #[test]
    fn overruns_are_rejected_on_either_side() {
        assert!(!region_in_bounds(64, 1, 128, 0, 64));
        assert!(!region_in_bounds(128, 0, 64, 1, 64));
    }

    #[test]
    fn offset_plus_size_overflow_is_rejected() {
        assert!(!region_in_bounds(u64::MAX, u64::MAX, u64::MAX, 0, 2));
        assert!(!region_in_bounds(u64::MAX, 0, u64::MAX, u64::MAX, 2));
    }

    #[test]
    fn zero_sized_copies_are_always_in_bounds() {
        assert!(region_in_bounds(0, 0, 0, 0, 0));
        assert!(region_in_bounds(16, 16, 16, 16, 0));
    }
}

//! Descriptor set layouts, pools, and sets.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferRef;
use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateDescriptorError {
    #[error("Vulkan error creating descriptor object: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateSetsError {
    #[error("Vulkan error allocating descriptor sets: {0}")]
    Vulkan(vk::Result),
}

/// One binding slot of a set layout.
#[derive(Debug, Clone, Copy)]
pub struct BindingDesc {
    pub binding: u32,
    pub kind: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl<'a> From<BindingDesc> for vk::DescriptorSetLayoutBinding<'a> {
    fn from(desc: BindingDesc) -> Self {
        vk::DescriptorSetLayoutBinding::default()
            .binding(desc.binding)
            .descriptor_type(desc.kind)
            .descriptor_count(desc.count)
            .stage_flags(desc.stages)
    }
}

/// An owned `VkDescriptorSetLayout`.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    handle: vk::DescriptorSetLayout,
}

impl fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DescriptorSetLayout {
    pub fn new(
        device: &Arc<Device>,
        bindings: &[BindingDesc],
    ) -> Result<Self, CreateDescriptorError> {
        let raw_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> =
            bindings.iter().copied().map(Into::into).collect();
        let create_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&raw_bindings);
        // SAFETY: no immutable samplers are used, so the create info borrows
        // only the local binding array.
        let handle = unsafe { device.create_descriptor_set_layout(&create_info) }
            .map_err(CreateDescriptorError::Vulkan)?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    pub fn as_raw(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor set layout {:?}", self.handle);
        // SAFETY: the wrapper owns the handle; pipeline layouts and sets
        // built from it must already be gone.
        unsafe { self.device.destroy_descriptor_set_layout(self.handle) };
    }
}

/// Raw pool handle co-owned by the pool wrapper and every allocated set, so
/// `vkDestroyDescriptorPool` (which frees all sets) runs last.
struct PoolShared {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor pool {:?}", self.pool);
        // SAFETY: runs only after the pool wrapper and every DescriptorSet
        // are dropped; destroying the pool frees its sets.
        unsafe { self.device.destroy_descriptor_pool(self.pool) };
    }
}

/// An owned `VkDescriptorPool` without `FREE_DESCRIPTOR_SET`: sets are
/// reclaimed all at once when the pool is destroyed.
pub struct DescriptorPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("pool", &self.shared.pool)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    /// A pool able to hold `max_sets` sets drawing from `sizes`, given as
    /// (descriptor type, total descriptor count) pairs.
    pub fn new(
        device: &Arc<Device>,
        max_sets: u32,
        sizes: &[(vk::DescriptorType, u32)],
    ) -> Result<Self, CreateDescriptorError> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);
        // SAFETY: the create info borrows only the local size array.
        let pool = unsafe { device.create_descriptor_pool(&create_info) }
            .map_err(CreateDescriptorError::Vulkan)?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                device: Arc::clone(device),
                pool,
            }),
        })
    }

    /// Allocate one set per layout in `layouts`.
    pub fn allocate(
        &self,
        layouts: &[&DescriptorSetLayout],
    ) -> Result<Vec<DescriptorSet>, AllocateSetsError> {
        let raw_layouts: Vec<vk::DescriptorSetLayout> =
            layouts.iter().map(|l| l.as_raw()).collect();
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.shared.pool)
            .set_layouts(&raw_layouts);
        // SAFETY: pool and layouts are live objects from this device.
        let raw_sets = unsafe { self.shared.device.allocate_descriptor_sets(&allocate_info) }
            .map_err(AllocateSetsError::Vulkan)?;
        Ok(raw_sets
            .into_iter()
            .map(|handle| DescriptorSet {
                device: Arc::clone(&self.shared.device),
                _pool: Arc::clone(&self.shared),
                handle,
            })
            .collect())
    }

    pub fn as_raw(&self) -> vk::DescriptorPool {
        self.shared.pool
    }
}

/// A descriptor set allocated from a [`DescriptorPool`]. Holds the pool's
/// shared state so the raw pool cannot be destroyed underneath it.
pub struct DescriptorSet {
    device: Arc<Device>,
    _pool: Arc<PoolShared>,
    handle: vk::DescriptorSet,
}

impl fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DescriptorSet {
    pub fn as_raw(&self) -> vk::DescriptorSet {
        self.handle
    }

    /// Point `binding` at a uniform-buffer range.
    ///
    /// # Safety
    /// The buffer must be live, from the same device, created with
    /// UNIFORM_BUFFER usage, and `offset..offset+range` must be in bounds.
    /// The set must not be consumed by pending GPU work.
    pub unsafe fn write_uniform_buffer<B: BufferRef>(
        &mut self,
        binding: u32,
        buffer: &B,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer.raw_buffer())
            .offset(offset)
            .range(range);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info));
        // SAFETY: forwarded contract; the write references only live locals.
        unsafe { self.device.update_descriptor_sets(std::slice::from_ref(&write)) };
    }
}

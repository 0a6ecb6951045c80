//! SPIR-V shader modules and stage entry points.

use std::borrow::Cow;
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateShaderError {
    #[error("SPIR-V blob is {0} bytes, which is not a multiple of 4")]
    UnalignedLength(usize),

    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

/// A single pipeline stage, unlike `vk::ShaderStageFlags` which is a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Vertex,
    Fragment,
    Compute,
}

impl From<Stage> for vk::ShaderStageFlags {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Vertex => vk::ShaderStageFlags::VERTEX,
            Stage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Stage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Reinterpret a SPIR-V byte blob as code words.
///
/// SPIR-V is defined little-endian. When the slice is already `u32`-aligned
/// on a little-endian target it is borrowed in place; otherwise the words
/// are decoded into an owned buffer.
fn spirv_words(bytes: &[u8]) -> Result<Cow<'_, [u32]>, CreateShaderError> {
    if bytes.len() % 4 != 0 {
        return Err(CreateShaderError::UnalignedLength(bytes.len()));
    }
    // SAFETY: u32 accepts all bit patterns and the length is a multiple of
    // four; align_to only yields a non-empty middle when properly aligned.
    let (head, words, _tail) = unsafe { bytes.align_to::<u32>() };
    if head.is_empty() && cfg!(target_endian = "little") {
        Ok(Cow::Borrowed(words))
    } else {
        Ok(Cow::Owned(
            bytes
                .chunks_exact(4)
                .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("chunk of 4")))
                .collect(),
        ))
    }
}

/// An owned `VkShaderModule`.
pub struct ShaderModule {
    device: Arc<Device>,
    handle: vk::ShaderModule,
}

impl fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Create a module from raw SPIR-V bytes (length must be a multiple of
    /// four). The bytes are not otherwise validated here; malformed SPIR-V
    /// is the driver's (or the validation layer's) to reject.
    pub fn new(
        device: &Arc<Device>,
        spirv: &[u8],
        label: Option<&str>,
    ) -> Result<Self, CreateShaderError> {
        let words = spirv_words(spirv)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        // SAFETY: the code slice is alive for the call and well-formed per
        // the length check.
        let handle = unsafe { device.create_shader_module(&create_info) }
            .map_err(CreateShaderError::Vulkan)?;
        if let Some(label) = label {
            // SAFETY: handle was created above from this device.
            unsafe { device.label_with(handle, || label.to_owned()) };
        }
        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    /// Pair this module with an entry-point name and stage. Fails only when
    /// `name` contains an interior NUL.
    pub fn entry(
        &self,
        name: &str,
        stage: Stage,
    ) -> Result<ShaderEntry<'_>, std::ffi::NulError> {
        Ok(ShaderEntry {
            module: self,
            name: CString::new(name)?,
            stage,
        })
    }

    pub fn as_raw(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: the wrapper owns the handle; pipelines already built from
        // it do not keep the module handle alive per the Vulkan spec.
        unsafe { self.device.destroy_shader_module(self.handle) };
    }
}

/// Borrow-view tying a [`ShaderModule`] to an entry point and stage. The
/// lifetime keeps the module alive while stage create infos built from this
/// view are in use.
#[derive(Debug)]
pub struct ShaderEntry<'a> {
    module: &'a ShaderModule,
    name: CString,
    stage: Stage,
}

impl ShaderEntry<'_> {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Build the stage create info. The result borrows `self`.
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.into())
            .module(self.module.as_raw())
            .name(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned_blobs() {
        assert!(matches!(
            spirv_words(&[0x03, 0x02, 0x23]),
            Err(CreateShaderError::UnalignedLength(3)),
        ));
    }

    #[test]
    fn decodes_words_little_endian() {
        // SPIR-V magic number 0x07230203 in little-endian byte order.
        let bytes = [0x03, 0x02, 0x23, 0x07, 0xAA, 0x00, 0x00, 0x00];
        let words = spirv_words(&bytes).expect("aligned length");
        assert_eq!(words.as_ref(), &[0x0723_0203, 0x0000_00AA]);
    }

    #[test]
    fn empty_blob_is_zero_words() {
        let words = spirv_words(&[]).expect("zero is a multiple of four");
        assert!(words.is_empty());
    }

    #[test]
    fn stage_maps_to_single_flag() {
        assert_eq!(
            vk::ShaderStageFlags::from(Stage::Vertex),
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            vk::ShaderStageFlags::from(Stage::Fragment),
            vk::ShaderStageFlags::FRAGMENT
        );
    }
}

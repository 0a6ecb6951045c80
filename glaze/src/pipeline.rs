//! Pipeline layouts and graphics pipelines targeting dynamic rendering.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::shader::ShaderEntry;

#[derive(Debug, Error)]
pub enum CreateLayoutError {
    #[error("Vulkan error creating pipeline layout: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreatePipelineError {
    #[error("a pipeline needs at least one shader stage")]
    NoStages,

    #[error("failed to create the implicit empty layout: {0}")]
    ImplicitLayout(vk::Result),

    #[error("Vulkan error creating graphics pipeline: {0}")]
    Vulkan(vk::Result),
}

/// An owned `VkPipelineLayout`, shareable across pipelines via `Arc`.
pub struct PipelineLayout {
    device: Arc<Device>,
    handle: vk::PipelineLayout,
}

impl fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    /// A layout with no descriptor sets and no push constants.
    pub fn empty(device: &Arc<Device>) -> Result<Self, CreateLayoutError> {
        Self::new(device, &[])
    }

    /// A layout over the given descriptor set layouts, in set order.
    pub fn new(
        device: &Arc<Device>,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self, CreateLayoutError> {
        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        // SAFETY: callers hand in set layout handles from this device; the
        // create info borrows only the argument slice.
        let handle = unsafe { device.create_pipeline_layout(&create_info) }
            .map_err(CreateLayoutError::Vulkan)?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    pub fn as_raw(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: the wrapper owns the handle; pipelines sharing it hold the
        // Arc, so drop order is enforced structurally.
        unsafe { self.device.destroy_pipeline_layout(self.handle) };
    }
}

/// Description of a [`RenderPipeline`].
///
/// Everything not listed is fixed: one sample, no blending with a full RGBA
/// write mask per color attachment, depth test/write off, line width 1.0,
/// viewport and scissor dynamic.
pub struct RenderPipelineDesc<'a> {
    /// Shader stages; at least one required.
    pub stages: &'a [ShaderEntry<'a>],

    /// Color attachment formats, matching what `begin_rendering` will use.
    pub color_formats: &'a [vk::Format],

    /// Depth attachment format; `None` for no depth.
    pub depth_format: Option<vk::Format>,

    /// Layout to use; `None` creates a private empty layout.
    pub layout: Option<Arc<PipelineLayout>>,

    /// Vertex buffer bindings consumed by the vertex stage.
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],

    /// Vertex attributes over those bindings.
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],

    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
}

impl Default for RenderPipelineDesc<'_> {
    fn default() -> Self {
        Self {
            stages: &[],
            color_formats: &[],
            depth_format: None,
            layout: None,
            vertex_bindings: &[],
            vertex_attributes: &[],
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        }
    }
}

/// A graphics pipeline for dynamic rendering; no render pass object exists.
/// The caller supplies a matching `VkRenderingInfo` at draw time.
pub struct RenderPipeline {
    device: Arc<Device>,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}

impl fmt::Debug for RenderPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPipeline")
            .field("handle", &self.handle)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl RenderPipeline {
    pub fn new(
        device: &Arc<Device>,
        desc: &RenderPipelineDesc<'_>,
        label: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        if desc.stages.is_empty() {
            return Err(CreatePipelineError::NoStages);
        }

        let layout = match &desc.layout {
            Some(shared) => Arc::clone(shared),
            None => Arc::new(PipelineLayout::empty(device).map_err(|e| match e {
                CreateLayoutError::Vulkan(inner) => CreatePipelineError::ImplicitLayout(inner),
            })?),
        };

        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> =
            desc.stages.iter().map(|entry| entry.stage_info()).collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(desc.vertex_bindings)
            .vertex_attribute_descriptions(desc.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.topology);

        // Counts must be declared even though the values are dynamic.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default();

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(desc.color_formats)
            .depth_attachment_format(desc.depth_format.unwrap_or(vk::Format::UNDEFINED));

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout.as_raw())
            .push_next(&mut rendering_info);

        // SAFETY: every referenced object (stages, layout, pNext chain)
        // lives on this stack frame or in `layout`, all from this device.
        let handle = unsafe { device.create_graphics_pipeline(&create_info) }
            .map_err(CreatePipelineError::Vulkan)?;
        if let Some(label) = label {
            // SAFETY: handle was created above from this device.
            unsafe { device.label_with(handle, || label.to_owned()) };
        }

        Ok(Self {
            device: Arc::clone(device),
            handle,
            layout,
        })
    }

    pub fn as_raw(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }
}

impl Drop for RenderPipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        // SAFETY: the wrapper owns the handle; all GPU work using the
        // pipeline must be complete before drop. The layout Arc released
        // afterwards keeps destruction ordered.
        unsafe { self.device.destroy_pipeline(self.handle) };
    }
}

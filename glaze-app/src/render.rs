//! Triangle renderer built on the glaze wrappers.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use eyre::{eyre, WrapErr};
use glaze::ash::vk;
use glaze::buffer::{DeviceBuffer, StagingBuffer};
use glaze::command::{CommandBuffer, CommandPool};
use glaze::descriptor::{BindingDesc, DescriptorPool, DescriptorSet, DescriptorSetLayout};
use glaze::device::Device;
use glaze::pipeline::{PipelineLayout, RenderPipeline, RenderPipelineDesc};
use glaze::shader::{ShaderModule, Stage};
use glaze::swapchain::Swapchain;
use glaze::sync::{Fence, Semaphore};
use winit::window::Window;

const VERTEX_SHADER: &str = r#"
struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) color: vec3<f32>,
}

@vertex
fn main(@location(0) position: vec2<f32>, @location(1) color: vec3<f32>) -> VsOut {
    var out: VsOut;
    out.position = vec4<f32>(position, 0.0, 1.0);
    out.color = color;
    return out;
}
"#;

const FRAGMENT_SHADER: &str = r#"
@group(0) @binding(0) var<uniform> tint: vec4<f32>;

@fragment
fn main(@location(0) color: vec3<f32>) -> @location(0) vec4<f32> {
    return vec4<f32>(color, 1.0) * tint;
}
"#;

fn compile_wgsl(source: &str, stage: naga::ShaderStage) -> eyre::Result<Vec<u8>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| eyre!("WGSL parse error: {e:?}"))?;
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::default(),
        naga::valid::Capabilities::default(),
    )
    .validate(&module)
    .map_err(|e| eyre!("WGSL validation error: {e:?}"))?;
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: "main".to_owned(),
    };
    let words = naga::back::spv::write_vec(
        &module,
        &info,
        &naga::back::spv::Options::default(),
        Some(&pipeline_options),
    )
    .map_err(|e| eyre!("SPIR-V backend error: {e}"))?;
    Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect())
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.6],
        color: [1.0, 0.2, 0.2],
    },
    Vertex {
        position: [0.6, 0.6],
        color: [0.2, 1.0, 0.2],
    },
    Vertex {
        position: [-0.6, 0.6],
        color: [0.2, 0.2, 1.0],
    },
];

fn color_subresource() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1)
}

/// Per-frame CPU/GPU pacing state: one slot per frame in flight.
struct FrameSlot {
    fence: Fence,
    acquire: Semaphore,
    commands: CommandBuffer,
}

/// Everything needed to draw the triangle into a swapchain image.
pub struct Renderer {
    device: Arc<Device>,
    pipeline: RenderPipeline,
    _set_layout: DescriptorSetLayout,
    _descriptor_pool: DescriptorPool,
    descriptor_set: DescriptorSet,
    vertices: DeviceBuffer,
    _uniforms: StagingBuffer,
    _pool: CommandPool,
    frames: Vec<FrameSlot>,
    /// One per swapchain image: present must wait on the semaphore tied to
    /// the image being presented, not to the frame slot.
    present_semaphores: Vec<Semaphore>,
    frame_cursor: usize,
    color_format: vk::Format,
}

/// What a frame attempt concluded about the swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Drawn,
    /// The swapchain no longer matches the surface; recreate it and call
    /// [`Renderer::reset_present_targets`] with the replacement.
    NeedsRecreation,
}

impl Renderer {
    /// Build all static rendering state. `color_format` and `image_count`
    /// come from the swapchain this renderer will draw into.
    pub fn new(
        device: &Arc<Device>,
        color_format: vk::Format,
        image_count: usize,
        tint: [f32; 4],
    ) -> eyre::Result<Self> {
        let vertex_spirv = compile_wgsl(VERTEX_SHADER, naga::ShaderStage::Vertex)?;
        let fragment_spirv = compile_wgsl(FRAGMENT_SHADER, naga::ShaderStage::Fragment)?;
        let vertex_module = ShaderModule::new(device, &vertex_spirv, Some("triangle vs"))
            .wrap_err("creating vertex shader module")?;
        let fragment_module = ShaderModule::new(device, &fragment_spirv, Some("triangle fs"))
            .wrap_err("creating fragment shader module")?;

        let set_layout = DescriptorSetLayout::new(
            device,
            &[BindingDesc {
                binding: 0,
                kind: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::FRAGMENT,
            }],
        )
        .wrap_err("creating descriptor set layout")?;
        let pipeline_layout = Arc::new(
            PipelineLayout::new(device, &[set_layout.as_raw()])
                .wrap_err("creating pipeline layout")?,
        );

        let stages = [
            vertex_module.entry("main", Stage::Vertex)?,
            fragment_module.entry("main", Stage::Fragment)?,
        ];
        let vertex_bindings = [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)];
        let vertex_attributes = [
            vk::VertexInputAttributeDescription::default()
                .location(0)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(0),
            vk::VertexInputAttributeDescription::default()
                .location(1)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::size_of::<[f32; 2]>() as u32),
        ];
        let pipeline = RenderPipeline::new(
            device,
            &RenderPipelineDesc {
                stages: &stages,
                color_formats: &[color_format],
                layout: Some(Arc::clone(&pipeline_layout)),
                vertex_bindings: &vertex_bindings,
                vertex_attributes: &vertex_attributes,
                ..Default::default()
            },
            Some("triangle pipeline"),
        )
        .wrap_err("creating render pipeline")?;

        let pool = CommandPool::new(device, device.queue_family(), Some("render pool"))
            .wrap_err("creating command pool")?;

        let vertices = upload_vertices(device, &pool).wrap_err("uploading vertex data")?;

        let mut uniforms = StagingBuffer::new(
            device,
            std::mem::size_of::<[f32; 4]>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            Some("tint uniform"),
        )
        .wrap_err("creating uniform buffer")?;
        uniforms.write_slice(&tint).wrap_err("writing tint")?;

        let descriptor_pool =
            DescriptorPool::new(device, 1, &[(vk::DescriptorType::UNIFORM_BUFFER, 1)])
                .wrap_err("creating descriptor pool")?;
        let mut sets = descriptor_pool
            .allocate(&[&set_layout])
            .wrap_err("allocating descriptor set")?;
        let mut descriptor_set = sets.pop().ok_or_else(|| eyre!("no descriptor set"))?;
        // SAFETY: the uniform buffer is live, from this device, created with
        // UNIFORM_BUFFER usage, and the full-range write is in bounds; the
        // set is brand new and unused by the GPU.
        unsafe {
            descriptor_set.write_uniform_buffer(0, &uniforms, 0, vk::WHOLE_SIZE);
        }

        const FRAMES_IN_FLIGHT: usize = 2;
        let mut frames = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for index in 0..FRAMES_IN_FLIGHT {
            frames.push(FrameSlot {
                fence: Fence::new(device, true, Some(format!("frame fence {index}").as_str()))?,
                acquire: Semaphore::new(device, Some(format!("acquire {index}").as_str()))?,
                commands: pool.allocate().wrap_err("allocating frame commands")?,
            });
        }

        let present_semaphores = (0..image_count)
            .map(|index| Semaphore::new(device, Some(format!("present {index}").as_str())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            device: Arc::clone(device),
            pipeline,
            _set_layout: set_layout,
            _descriptor_pool: descriptor_pool,
            descriptor_set,
            vertices,
            _uniforms: uniforms,
            _pool: pool,
            frames,
            present_semaphores,
            frame_cursor: 0,
            color_format,
        })
    }

    /// The color format the pipeline was built against. A recreated
    /// swapchain must keep this format for the pipeline to stay valid.
    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    /// Resize per-image state after a swapchain recreation. The caller must
    /// have made the device idle first.
    pub fn reset_present_targets(&mut self, image_count: usize) -> eyre::Result<()> {
        self.present_semaphores = (0..image_count)
            .map(|index| Semaphore::new(&self.device, Some(format!("present {index}").as_str())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    /// Record and submit one frame, then queue it for presentation.
    pub fn draw(&mut self, swapchain: &Swapchain<Window>) -> eyre::Result<FrameOutcome> {
        let slot = &mut self.frames[self.frame_cursor];
        slot.fence.wait(u64::MAX)?;

        // SAFETY: the acquire semaphore was either never used or its last
        // wait was consumed by the submit of a frame this fence proved
        // complete.
        let acquired = match unsafe { swapchain.acquire(u64::MAX, slot.acquire.as_raw()) } {
            Ok(acquired) => acquired,
            // The fence stays signaled here, so a retry after recreation
            // will not deadlock on it.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(FrameOutcome::NeedsRecreation),
            Err(e) => return Err(eyre!("acquiring swapchain image: {e}")),
        };
        // SAFETY: the wait above proved the fence is signaled, not pending.
        unsafe { slot.fence.reset() }.map_err(|e| eyre!("resetting frame fence: {e}"))?;
        let image = swapchain.images()[acquired.index as usize];
        let view = swapchain.views()[acquired.index as usize];
        let extent = swapchain.extent();

        // SAFETY: the fence wait above proved this buffer is no longer
        // pending, so reset and re-record are legal.
        unsafe {
            slot.commands.reset()?;
            slot.commands.begin()?;
        }

        let to_color = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
            .dst_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_subresource());
        // SAFETY: the image belongs to the live swapchain and its contents
        // are irrelevant (UNDEFINED old layout).
        unsafe {
            slot.commands.barrier(
                &vk::DependencyInfo::default()
                    .image_memory_barriers(std::slice::from_ref(&to_color)),
            );
        }

        let clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.02, 0.02, 0.03, 1.0],
            },
        };
        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(clear);
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));

        // SAFETY: recording state; the view was transitioned to the declared
        // layout by the barrier above; pipeline, buffers, and set are live
        // objects from this device; viewport/scissor are set before drawing.
        unsafe {
            slot.commands.begin_rendering(&rendering_info);
            slot.commands.bind_pipeline(self.pipeline.as_raw());
            slot.commands.set_viewport(vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            });
            slot.commands.set_scissor(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            });
            slot.commands.bind_descriptor_sets(
                self.pipeline.layout().as_raw(),
                0,
                &[self.descriptor_set.as_raw()],
            );
            slot.commands
                .bind_vertex_buffers(0, &[&self.vertices], &[0]);
            slot.commands.draw(TRIANGLE.len() as u32, 1, 0, 0);
            slot.commands.end_rendering();
        }

        let to_present = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE)
            .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_subresource());
        // SAFETY: recording state; the image is in COLOR_ATTACHMENT_OPTIMAL
        // from the render pass above.
        unsafe {
            slot.commands.barrier(
                &vk::DependencyInfo::default()
                    .image_memory_barriers(std::slice::from_ref(&to_present)),
            );
            slot.commands.finish()?;
        }

        let present_semaphore = &self.present_semaphores[acquired.index as usize];
        let wait_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(slot.acquire.as_raw())
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        let signal_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(present_semaphore.as_raw())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        let commands_info = vk::CommandBufferSubmitInfo::default()
            .command_buffer(slot.commands.as_raw());
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(std::slice::from_ref(&wait_info))
            .command_buffer_infos(std::slice::from_ref(&commands_info))
            .signal_semaphore_infos(std::slice::from_ref(&signal_info));
        // SAFETY: the command buffer is executable; the acquire semaphore has
        // a pending signal from the acquire; the present semaphore for this
        // image was fully waited by the previous present of the same image;
        // the fence was reset above.
        unsafe { self.device.submit(&[submit], slot.fence.as_raw()) }
            .map_err(|e| eyre!("queue submit failed: {e}"))?;

        self.frame_cursor = (self.frame_cursor + 1) % self.frames.len();

        // SAFETY: the index comes from the acquire above; the submit signals
        // the present semaphore; the final barrier leaves the image in
        // PRESENT_SRC_KHR.
        match unsafe { swapchain.present(acquired.index, present_semaphore.as_raw()) } {
            Ok(false) if !acquired.suboptimal => Ok(FrameOutcome::Drawn),
            Ok(_) => Ok(FrameOutcome::NeedsRecreation),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(FrameOutcome::NeedsRecreation),
            Err(e) => Err(eyre!("presenting swapchain image: {e}")),
        }
    }
}

/// Stage the triangle and copy it into a device-local vertex buffer,
/// blocking until the copy completes.
fn upload_vertices(device: &Arc<Device>, pool: &CommandPool) -> eyre::Result<DeviceBuffer> {
    let bytes = std::mem::size_of_val(&TRIANGLE) as vk::DeviceSize;
    let mut staging = StagingBuffer::new(
        device,
        bytes,
        vk::BufferUsageFlags::TRANSFER_SRC,
        Some("vertex staging"),
    )?;
    staging.write_slice(&TRIANGLE)?;

    let mut vertices = DeviceBuffer::new(
        device,
        bytes,
        vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
        Some("triangle vertices"),
    )?;

    let mut commands = pool.allocate()?;
    let fence = Fence::new(device, false, Some("upload fence"))?;
    // SAFETY: the buffer is fresh (initial state); the copy source has
    // TRANSFER_SRC and the destination TRANSFER_DST usage; both outlive the
    // fence wait below.
    unsafe {
        commands.begin()?;
        vertices.record_copy_from(&mut commands, &staging)?;
        commands.finish()?;
    }
    let commands_info =
        vk::CommandBufferSubmitInfo::default().command_buffer(commands.as_raw());
    let submit = vk::SubmitInfo2::default()
        .command_buffer_infos(std::slice::from_ref(&commands_info));
    // SAFETY: the command buffer is executable and the fence unsignaled.
    unsafe { device.submit(&[submit], fence.as_raw()) }
        .map_err(|e| eyre!("vertex upload submit failed: {e}"))?;
    fence.wait(u64::MAX)?;

    Ok(vertices)
}

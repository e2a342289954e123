// Frame orchestration
//
// The renderer owns every GPU resource and drives the per-frame state
// machine: wait on the frame slot, acquire a swapchain image, record the
// scene and overlay passes, submit, present. Presentation staleness is
// never an error here; it defers the frame and flags the swapchain for a
// wholesale rebuild on the next loop iteration.

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::Path;
use std::sync::Arc;

use crate::backend::mesh::{self, DrawPushConstants, GpuMesh};
use crate::backend::resources::{self, AllocatedImage};
use crate::backend::swapchain::Acquire;
use crate::backend::{barrier, pipeline::PipelineDesc, shader};
use crate::backend::{FrameRing, ImmediateExecutor, RenderDevice, Swapchain};
use crate::config::Config;
use crate::overlay::{OverlayDrawData, SceneView};

/// Off-screen targets are rendered in extended-range color and resolved to
/// the swapchain by blit.
const DRAW_IMAGE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// Fixed size of the off-screen scene target the overlay can display.
const SCENE_DRAW_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 600,
    height: 600,
};

pub struct Renderer {
    device: Arc<RenderDevice>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],

    swapchain: Option<Swapchain>,
    frames: Option<FrameRing>,
    immediate: Option<ImmediateExecutor>,

    /// Composition target: overlay pass renders here, then blit to swapchain.
    main_draw: Option<AllocatedImage>,
    /// Off-screen scene target, sampled by the overlay.
    scene_draw: Option<AllocatedImage>,
    scene_sampler: vk::Sampler,
    scene_descriptor_pool: vk::DescriptorPool,
    scene_set_layout: vk::DescriptorSetLayout,
    scene_texture_set: vk::DescriptorSet,

    mesh_pipeline_layout: vk::PipelineLayout,
    mesh_pipeline: vk::Pipeline,
    rectangle: Option<GpuMesh>,

    /// Set when acquire/present report the surface out of date; the host
    /// loop must call [`Renderer::rebuild_swapchain`] before drawing again.
    pub swapchain_stale: bool,
    frame_number: u64,
    initialized: bool,
}

impl Renderer {
    /// Create the device, presentation surface, and all startup resources.
    ///
    /// `width`/`height` is the window's current pixel size.
    pub fn new(
        config: &Config,
        window: &(impl HasWindowHandle + HasDisplayHandle),
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let device = RenderDevice::new(&config.window.title, enable_validation, display_handle)?;

        let surface_loader = ash::khr::surface::Instance::new(&device.entry, &device.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &device.entry,
                &device.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;

        let surface_support = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )
        }
        .unwrap_or(false);

        if !surface_support {
            unsafe { surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        // From here on the renderer owns everything it has created: a
        // failure below drops `renderer`, and cleanup releases the partial
        // state.
        let mut renderer = Self {
            device,
            surface_loader,
            surface,
            present_mode: config.present_mode(),
            clear_color: config.graphics.clear_color,
            swapchain: None,
            frames: None,
            immediate: None,
            main_draw: None,
            scene_draw: None,
            scene_sampler: vk::Sampler::null(),
            scene_descriptor_pool: vk::DescriptorPool::null(),
            scene_set_layout: vk::DescriptorSetLayout::null(),
            scene_texture_set: vk::DescriptorSet::null(),
            mesh_pipeline_layout: vk::PipelineLayout::null(),
            mesh_pipeline: vk::Pipeline::null(),
            rectangle: None,
            swapchain_stale: false,
            frame_number: 0,
            initialized: true,
        };

        renderer.init_gpu_resources(width, height)?;

        log::info!("Renderer initialized");
        Ok(renderer)
    }

    fn init_gpu_resources(&mut self, width: u32, height: u32) -> Result<()> {
        self.swapchain = Some(Swapchain::new(
            self.device.clone(),
            self.surface,
            &self.surface_loader,
            self.present_mode,
            width,
            height,
        )?);

        self.immediate = Some(ImmediateExecutor::new(&self.device)?);

        self.create_draw_images()?;

        self.frames = Some(FrameRing::new(&self.device)?);

        let (vertices, indices) = mesh::rectangle_geometry();
        let immediate = self
            .immediate
            .as_ref()
            .context("Immediate executor not initialized")?;
        let rectangle = mesh::upload_mesh(&self.device, immediate, &vertices, &indices)?;
        self.rectangle = Some(rectangle);

        self.build_pipelines()?;

        Ok(())
    }

    fn create_draw_images(&mut self) -> Result<()> {
        let swapchain_extent = self
            .swapchain
            .as_ref()
            .context("Swapchain not initialized")?
            .extent;

        self.main_draw = Some(resources::create_image(
            &self.device,
            "main draw image",
            vk::Extent3D {
                width: swapchain_extent.width,
                height: swapchain_extent.height,
                depth: 1,
            },
            DRAW_IMAGE_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        )?);

        let scene_draw = resources::create_image(
            &self.device,
            "scene draw image",
            vk::Extent3D {
                width: SCENE_DRAW_EXTENT.width,
                height: SCENE_DRAW_EXTENT.height,
                depth: 1,
            },
            DRAW_IMAGE_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        let scene_image = scene_draw.image;
        let scene_image_view = scene_draw.view;
        // Owned by the renderer from here on, so failures below unwind
        // through cleanup instead of leaking the image.
        self.scene_draw = Some(scene_draw);

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

        self.scene_sampler = unsafe { self.device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create scene sampler")?;

        self.create_scene_texture_set(scene_image_view)?;

        // The overlay samples the scene target; prime it to the readable
        // layout so the very first frame's transition has a known source.
        let immediate = self
            .immediate
            .as_ref()
            .context("Immediate executor not initialized")?;
        immediate.submit(&self.device, |dev, cmd| {
            barrier::transition_image(
                dev,
                cmd,
                scene_image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })?;

        Ok(())
    }

    /// Allocate the combined-image-sampler descriptor the overlay binds to
    /// display the scene target.
    fn create_scene_texture_set(&mut self, scene_image_view: vk::ImageView) -> Result<()> {
        let dev = &self.device.device;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        self.scene_descriptor_pool = unsafe { dev.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create scene descriptor pool")?;

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        self.scene_set_layout = unsafe { dev.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create scene descriptor set layout")?;

        let set_layouts = [self.scene_set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.scene_descriptor_pool)
            .set_layouts(&set_layouts);
        self.scene_texture_set = unsafe { dev.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate scene descriptor set")?[0];

        let image_info = [vk::DescriptorImageInfo {
            sampler: self.scene_sampler,
            image_view: scene_image_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.scene_texture_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        unsafe { dev.update_descriptor_sets(&[write], &[]) };

        Ok(())
    }

    fn build_pipelines(&mut self) -> Result<()> {
        let dev = &self.device.device;

        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(std::mem::size_of::<DrawPushConstants>() as u32)];
        let layout_info =
            vk::PipelineLayoutCreateInfo::default().push_constant_ranges(&push_constant_ranges);
        self.mesh_pipeline_layout = unsafe { dev.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create mesh pipeline layout")?;

        let vertex_shader = shader::load_shader_module(dev, Path::new("shaders/mesh.vert.spv"))?;
        let fragment_shader =
            match shader::load_shader_module(dev, Path::new("shaders/mesh.frag.spv")) {
                Ok(module) => module,
                Err(e) => {
                    unsafe { dev.destroy_shader_module(vertex_shader, None) };
                    return Err(e);
                }
            };

        let pipeline = PipelineDesc::default()
            .with_color_format(DRAW_IMAGE_FORMAT)
            .build(dev, self.mesh_pipeline_layout, vertex_shader, fragment_shader);

        // Shader modules are transient: gone as soon as the pipeline exists
        unsafe {
            dev.destroy_shader_module(vertex_shader, None);
            dev.destroy_shader_module(fragment_shader, None);
        }

        self.mesh_pipeline = pipeline.context("Failed to build mesh pipeline")?;

        Ok(())
    }

    /// Handle to the scene target for the overlay collaborator.
    pub fn scene_view(&self) -> SceneView {
        SceneView {
            texture: self.scene_texture_set,
            extent: SCENE_DRAW_EXTENT,
        }
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Draw one frame.
    ///
    /// Every error returned here is fatal; recoverable surface staleness
    /// only sets [`Renderer::swapchain_stale`] and skips the frame.
    pub fn draw(&mut self, overlay: OverlayDrawData) -> Result<()> {
        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
        let frames = self.frames.as_ref().context("Frame ring not initialized")?;
        let main_draw = self.main_draw.as_ref().context("Draw image not initialized")?;
        let scene_draw = self
            .scene_draw
            .as_ref()
            .context("Scene image not initialized")?;
        let rectangle = self.rectangle.as_ref().context("Mesh not initialized")?;
        let device = &self.device;
        let dev = &device.device;

        // 1. Bounded wait for this slot's previous GPU work
        let slot = frames.wait_slot(device, self.frame_number)?;

        // 2. Acquire. A stale surface aborts the frame before any GPU work;
        //    the slot fence stays signaled for the next attempt.
        let image_index = match swapchain.acquire(slot.image_available())? {
            Acquire::Image { index } => index,
            Acquire::Stale => {
                self.swapchain_stale = true;
                return Ok(());
            }
        };
        let swapchain_image = swapchain.images[image_index as usize];

        // 3. Record
        let recording = slot.begin_recording(device)?;
        let cmd = recording.cmd();

        let clear_color = vk::ClearColorValue {
            float32: self.clear_color,
        };
        let color_range = barrier::subresource_range(vk::ImageAspectFlags::COLOR);

        // Scene pass: clear, then draw the mesh into the off-screen target
        barrier::transition_image(
            dev,
            cmd,
            scene_draw.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        );
        unsafe {
            dev.cmd_clear_color_image(
                cmd,
                scene_draw.image,
                vk::ImageLayout::GENERAL,
                &clear_color,
                &[color_range],
            );
        }
        barrier::transition_image(
            dev,
            cmd,
            scene_draw.image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );

        let scene_extent = SCENE_DRAW_EXTENT;
        let scene_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(scene_draw.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE);
        let scene_rendering = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: scene_extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&scene_attachment));

        unsafe {
            dev.cmd_begin_rendering(cmd, &scene_rendering);

            dev.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.mesh_pipeline);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: scene_extent.width as f32,
                height: scene_extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            dev.cmd_set_viewport(cmd, 0, &[viewport]);

            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: scene_extent,
            };
            dev.cmd_set_scissor(cmd, 0, &[scissor]);

            let push_constants =
                DrawPushConstants::new(Mat4::IDENTITY, rectangle.vertex_buffer_address);
            dev.cmd_push_constants(
                cmd,
                self.mesh_pipeline_layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&push_constants),
            );

            dev.cmd_bind_index_buffer(cmd, rectangle.indices.buffer, 0, vk::IndexType::UINT32);
            dev.cmd_draw_indexed(cmd, rectangle.index_count, 1, 0, 0, 0);

            dev.cmd_end_rendering(cmd);
        }

        barrier::transition_image(
            dev,
            cmd,
            scene_draw.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        // Overlay pass: clear the composition target, replay the overlay
        barrier::transition_image(
            dev,
            cmd,
            main_draw.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        );
        unsafe {
            dev.cmd_clear_color_image(
                cmd,
                main_draw.image,
                vk::ImageLayout::GENERAL,
                &clear_color,
                &[color_range],
            );
        }
        barrier::transition_image(
            dev,
            cmd,
            main_draw.image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );

        let main_extent = vk::Extent2D {
            width: main_draw.extent.width,
            height: main_draw.extent.height,
        };
        let main_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(main_draw.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE);
        let main_rendering = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: main_extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&main_attachment));

        unsafe {
            dev.cmd_begin_rendering(cmd, &main_rendering);
        }
        overlay.replay(dev, cmd);
        unsafe {
            dev.cmd_end_rendering(cmd);
        }

        // Blit to the swapchain and prepare for present
        barrier::transition_image(
            dev,
            cmd,
            main_draw.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        barrier::transition_image(
            dev,
            cmd,
            swapchain_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        barrier::blit_image(
            dev,
            cmd,
            main_draw.image,
            swapchain_image,
            main_extent,
            swapchain.extent,
        );
        barrier::transition_image(
            dev,
            cmd,
            swapchain_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        recording.end(device)?;

        // 4. Submit, gating color output on the acquired image
        let wait_semaphores = [recording.image_available()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [recording.cmd()];
        let signal_semaphores = [swapchain.render_finished[image_index as usize]];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            dev.queue_submit(
                device.graphics_queue,
                &[submit_info],
                recording.complete_fence(),
            )
            .context("Failed to submit frame commands")?;
        }

        // 5. Present; staleness here only flags the rebuild
        if swapchain.present(device.graphics_queue, image_index)? {
            self.swapchain_stale = true;
        }

        // 6. Advance
        self.frame_number += 1;

        Ok(())
    }

    /// Destroy and recreate the swapchain and frame synchronization state
    /// against the new window size. Not incremental: runs under a full
    /// device-idle wait.
    pub fn rebuild_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        log::debug!("Rebuilding swapchain: {}x{}", width, height);

        self.device.wait_idle()?;

        if let Some(mut frames) = self.frames.take() {
            frames.destroy(&self.device);
        }
        self.swapchain = None;

        self.swapchain = Some(Swapchain::new(
            self.device.clone(),
            self.surface,
            &self.surface_loader,
            self.present_mode,
            width,
            height,
        )?);
        self.frames = Some(FrameRing::new(&self.device)?);

        self.swapchain_stale = false;
        Ok(())
    }

    /// Release every GPU resource in reverse creation order.
    ///
    /// Idempotent: the second call is a no-op. Called by `Drop`, so partial
    /// initialization failures unwind through the same path.
    pub fn cleanup(&mut self) {
        if !self.initialized {
            return;
        }

        log::info!("Cleaning up renderer...");

        if let Err(e) = self.device.wait_idle() {
            log::warn!("Device idle wait failed during cleanup: {}", e);
        }

        let dev = &self.device.device;
        unsafe {
            dev.destroy_pipeline(self.mesh_pipeline, None);
            dev.destroy_pipeline_layout(self.mesh_pipeline_layout, None);
        }

        if let Some(mesh) = self.rectangle.take() {
            resources::destroy_buffer(&self.device, mesh.vertices);
            resources::destroy_buffer(&self.device, mesh.indices);
        }

        unsafe {
            dev.destroy_descriptor_pool(self.scene_descriptor_pool, None);
            dev.destroy_descriptor_set_layout(self.scene_set_layout, None);
            dev.destroy_sampler(self.scene_sampler, None);
        }

        if let Some(image) = self.scene_draw.take() {
            resources::destroy_image(&self.device, image);
        }
        if let Some(image) = self.main_draw.take() {
            resources::destroy_image(&self.device, image);
        }

        if let Some(mut frames) = self.frames.take() {
            frames.destroy(&self.device);
        }
        if let Some(mut immediate) = self.immediate.take() {
            immediate.destroy(&self.device);
        }

        self.swapchain = None;

        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
        self.surface = vk::SurfaceKHR::null();

        self.initialized = false;
        log::info!("Renderer cleanup complete");
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

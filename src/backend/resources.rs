// GPU-resident images and buffers
//
// Thin wrapper over the device's memory allocator: every resource is an
// opaque (handle, allocation) pair created and destroyed through the
// functions here, so no allocation can leak its pairing.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::RenderDevice;

/// A GPU image, its view, and the memory backing it.
pub struct AllocatedImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Allocation,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
}

/// A GPU buffer and the memory backing it.
pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Allocation,
}

/// Create a 2D color image with a matching full-range view.
pub fn create_image(
    device: &RenderDevice,
    name: &str,
    extent: vk::Extent3D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> Result<AllocatedImage> {
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(extent)
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage);

    let image = unsafe { device.device.create_image(&image_info, None) }
        .with_context(|| format!("Failed to create image '{}'", name))?;

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };

    let allocation = device
        .allocator()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Out of GPU memory for image '{}'", name));

    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_image(image, None) };
            return Err(e);
        }
    };

    let bound = unsafe {
        device
            .device
            .bind_image_memory(image, allocation.memory(), allocation.offset())
    };

    if let Err(e) = bound {
        free_allocation(device, allocation);
        unsafe { device.device.destroy_image(image, None) };
        return Err(e).context("Failed to bind image memory");
    }

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = match unsafe { device.device.create_image_view(&view_info, None) } {
        Ok(view) => view,
        Err(e) => {
            free_allocation(device, allocation);
            unsafe { device.device.destroy_image(image, None) };
            return Err(e).with_context(|| format!("Failed to create view for image '{}'", name));
        }
    };

    Ok(AllocatedImage {
        image,
        view,
        allocation,
        extent,
        format,
    })
}

/// Destroy an image, its view, and its allocation.
/// The caller must have ensured no GPU work still references it.
pub fn destroy_image(device: &RenderDevice, image: AllocatedImage) {
    unsafe {
        device.device.destroy_image_view(image.view, None);
        device.device.destroy_image(image.image, None);
    }
    free_allocation(device, image.allocation);
}

/// Create a buffer in the requested memory location.
pub fn create_buffer(
    device: &RenderDevice,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<AllocatedBuffer> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .with_context(|| format!("Failed to create buffer '{}'", name))?;

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = device
        .allocator()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Out of GPU memory for buffer '{}'", name));

    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    let bound = unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
    };

    if let Err(e) = bound {
        free_allocation(device, allocation);
        unsafe { device.device.destroy_buffer(buffer, None) };
        return Err(e).context("Failed to bind buffer memory");
    }

    Ok(AllocatedBuffer { buffer, allocation })
}

/// Destroy a buffer and its allocation.
/// The caller must have ensured no GPU work still references it.
pub fn destroy_buffer(device: &RenderDevice, buffer: AllocatedBuffer) {
    unsafe {
        device.device.destroy_buffer(buffer.buffer, None);
    }
    free_allocation(device, buffer.allocation);
}

fn free_allocation(device: &RenderDevice, allocation: Allocation) {
    if let Err(e) = device.allocator().free(allocation) {
        log::warn!("Failed to free GPU allocation: {}", e);
    }
}

// GPU mesh upload
//
// Meshes are uploaded once through a host-visible staging buffer and live
// in GPU-local memory afterwards. Vertices are not bound as vertex input:
// the vertex shader pulls them through the buffer's device address carried
// in the push constants.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use gpu_allocator::MemoryLocation;

use super::immediate::ImmediateExecutor;
use super::resources::{self, AllocatedBuffer};
use super::RenderDevice;

/// Vertex layout shared with the mesh shaders. uv is split around the
/// vec3 fields to keep the struct tightly packed under std430 rules.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub uv_x: f32,
    pub normal: Vec3,
    pub uv_y: f32,
    pub color: Vec4,
}

/// Per-draw data handed to the vertex shader.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct DrawPushConstants {
    pub world_matrix: Mat4,
    pub vertex_buffer: vk::DeviceAddress,
    pub _pad: u64,
}

impl DrawPushConstants {
    pub fn new(world_matrix: Mat4, vertex_buffer: vk::DeviceAddress) -> Self {
        Self {
            world_matrix,
            vertex_buffer,
            _pad: 0,
        }
    }
}

/// A GPU-resident vertex/index buffer pair. Immutable after upload.
pub struct GpuMesh {
    pub vertices: AllocatedBuffer,
    pub indices: AllocatedBuffer,
    pub index_count: u32,
    pub vertex_buffer_address: vk::DeviceAddress,
}

/// Byte offsets of the two payload regions inside one staging buffer:
/// (vertex offset, index offset, total size). Vertices first, indices
/// packed directly after.
pub fn staging_layout(vertex_bytes: u64, index_bytes: u64) -> (u64, u64, u64) {
    (0, vertex_bytes, vertex_bytes + index_bytes)
}

/// Upload a mesh to GPU-local memory.
///
/// Both payloads are copied into one host-visible staging buffer, then
/// copied to their destinations in a single blocking immediate submission.
/// On return the mesh is fully GPU-resident; the staging buffer is gone on
/// every path out of this function.
pub fn upload_mesh(
    device: &RenderDevice,
    immediate: &ImmediateExecutor,
    vertices: &[Vertex],
    indices: &[u32],
) -> Result<GpuMesh> {
    let vertex_bytes = std::mem::size_of_val(vertices) as u64;
    let index_bytes = std::mem::size_of_val(indices) as u64;
    let (vertex_offset, index_offset, staging_bytes) = staging_layout(vertex_bytes, index_bytes);

    let vertex_buffer = resources::create_buffer(
        device,
        "mesh vertices",
        vertex_bytes,
        vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
    )?;

    let address_info = vk::BufferDeviceAddressInfo::default().buffer(vertex_buffer.buffer);
    let vertex_buffer_address = unsafe { device.device.get_buffer_device_address(&address_info) };

    let index_buffer = match resources::create_buffer(
        device,
        "mesh indices",
        index_bytes,
        vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            resources::destroy_buffer(device, vertex_buffer);
            return Err(e);
        }
    };

    let mut staging = match resources::create_buffer(
        device,
        "mesh staging",
        staging_bytes,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            resources::destroy_buffer(device, index_buffer);
            resources::destroy_buffer(device, vertex_buffer);
            return Err(e);
        }
    };

    let copied = write_staging(&mut staging, vertices, indices, vertex_offset, index_offset)
        .and_then(|()| {
            immediate.submit(device, |dev, cmd| {
                let vertex_copy = vk::BufferCopy {
                    src_offset: vertex_offset,
                    dst_offset: 0,
                    size: vertex_bytes,
                };
                let index_copy = vk::BufferCopy {
                    src_offset: index_offset,
                    dst_offset: 0,
                    size: index_bytes,
                };
                unsafe {
                    dev.cmd_copy_buffer(cmd, staging.buffer, vertex_buffer.buffer, &[vertex_copy]);
                    dev.cmd_copy_buffer(cmd, staging.buffer, index_buffer.buffer, &[index_copy]);
                }
            })
        });

    resources::destroy_buffer(device, staging);

    if let Err(e) = copied {
        resources::destroy_buffer(device, index_buffer);
        resources::destroy_buffer(device, vertex_buffer);
        return Err(e);
    }

    log::debug!(
        "Uploaded mesh: {} vertices, {} indices",
        vertices.len(),
        indices.len()
    );

    Ok(GpuMesh {
        vertices: vertex_buffer,
        indices: index_buffer,
        index_count: indices.len() as u32,
        vertex_buffer_address,
    })
}

fn write_staging(
    staging: &mut AllocatedBuffer,
    vertices: &[Vertex],
    indices: &[u32],
    vertex_offset: u64,
    index_offset: u64,
) -> Result<()> {
    let mapped = staging
        .allocation
        .mapped_slice_mut()
        .context("Staging buffer is not host visible")?;

    let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
    let index_bytes: &[u8] = bytemuck::cast_slice(indices);

    let v = vertex_offset as usize;
    let i = index_offset as usize;
    mapped[v..v + vertex_bytes.len()].copy_from_slice(vertex_bytes);
    mapped[i..i + index_bytes.len()].copy_from_slice(index_bytes);

    Ok(())
}

/// The startup scene: a unit rectangle in front of the camera.
pub fn rectangle_geometry() -> (Vec<Vertex>, Vec<u32>) {
    let vertices = vec![
        Vertex {
            position: Vec3::new(0.5, -0.5, 0.0),
            uv_x: 1.0,
            normal: Vec3::Z,
            uv_y: 0.0,
            color: Vec4::new(0.0, 0.0, 0.0, 1.0),
        },
        Vertex {
            position: Vec3::new(0.5, 0.5, 0.0),
            uv_x: 1.0,
            normal: Vec3::Z,
            uv_y: 1.0,
            color: Vec4::new(0.5, 0.5, 0.5, 1.0),
        },
        Vertex {
            position: Vec3::new(-0.5, -0.5, 0.0),
            uv_x: 0.0,
            normal: Vec3::Z,
            uv_y: 0.0,
            color: Vec4::new(1.0, 0.0, 0.0, 1.0),
        },
        Vertex {
            position: Vec3::new(-0.5, 0.5, 0.0),
            uv_x: 0.0,
            normal: Vec3::Z,
            uv_y: 1.0,
            color: Vec4::new(0.0, 1.0, 0.0, 1.0),
        },
    ];

    let indices = vec![0, 1, 2, 2, 1, 3];

    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn vertex_layout_matches_shader_struct() {
        assert_eq!(size_of::<Vertex>(), 48);
        assert_eq!(offset_of!(Vertex, position), 0);
        assert_eq!(offset_of!(Vertex, uv_x), 12);
        assert_eq!(offset_of!(Vertex, normal), 16);
        assert_eq!(offset_of!(Vertex, uv_y), 28);
        assert_eq!(offset_of!(Vertex, color), 32);
    }

    #[test]
    fn push_constants_fit_guaranteed_minimum() {
        // Vulkan guarantees at least 128 bytes of push constants
        assert!(size_of::<DrawPushConstants>() <= 128);
        assert_eq!(offset_of!(DrawPushConstants, world_matrix), 0);
        assert_eq!(offset_of!(DrawPushConstants, vertex_buffer), 64);
    }

    #[test]
    fn staging_regions_are_contiguous() {
        let (vertex_offset, index_offset, total) = staging_layout(480, 24);
        assert_eq!(vertex_offset, 0);
        assert_eq!(index_offset, 480);
        assert_eq!(total, 504);
    }

    #[test]
    fn staging_layout_handles_empty_payloads() {
        assert_eq!(staging_layout(0, 0), (0, 0, 0));
        assert_eq!(staging_layout(96, 0), (0, 96, 96));
    }

    #[test]
    fn rectangle_is_two_triangles_over_four_vertices() {
        let (vertices, indices) = rectangle_geometry();
        assert_eq!(vertices.len(), 4);
        assert_eq!(indices.len(), 6);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
    }
}

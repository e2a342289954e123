// Shader module loading
//
// Shaders are opaque SPIR-V blobs loaded from disk by path. A missing or
// unreadable file is a fatal startup error carrying the offending path.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

/// Load a SPIR-V file and create a shader module from it.
pub fn load_shader_module(device: &ash::Device, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to open shader file: {}", path.display()))?;

    let code = ash::util::read_spv(&mut Cursor::new(&bytes))
        .with_context(|| format!("Invalid SPIR-V in shader file: {}", path.display()))?;

    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

    unsafe {
        device
            .create_shader_module(&create_info, None)
            .with_context(|| format!("Failed to create shader module: {}", path.display()))
    }
}

// Shader module loading
//
// Vulkan consumes SPIR-V. build.rs compiles shaders/*.vert and *.frag with
// glslc; at run time the .spv files are read from the configured directory.

use anyhow::{Context, Result};
use ash::vk;
use std::path::{Path, PathBuf};

use super::VulkanDevice;

pub const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // read_spv copies into u32 words, so the byte slice needs no particular alignment
    let words = ash::util::read_spv(&mut std::io::Cursor::new(code))
        .context("Shader bytes are not valid SPIR-V")?;

    let create_info = vk::ShaderModuleCreateInfo::default().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// `<dir>/<name>.<stage>.spv`
pub fn spirv_path(dir: &Path, name: &str, stage: &str) -> PathBuf {
    dir.join(format!("{}.{}.spv", name, stage))
}

/// Vertex + fragment modules of one pipeline
pub struct ShaderStages {
    pub vertex: vk::ShaderModule,
    pub fragment: vk::ShaderModule,
}

impl ShaderStages {
    pub fn load(device: &VulkanDevice, dir: &Path, name: &str) -> Result<Self> {
        let vertex = load_module(device, &spirv_path(dir, name, "vert"))?;
        let fragment = match load_module(device, &spirv_path(dir, name, "frag")) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.device.destroy_shader_module(vertex, None) };
                return Err(e);
            }
        };
        log::debug!("Loaded '{}' shaders from {:?}", name, dir);
        Ok(Self { vertex, fragment })
    }

    pub fn create_infos<'a>(&self) -> [vk::PipelineShaderStageCreateInfo<'a>; 2] {
        [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(self.vertex)
                .name(ENTRY_POINT),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(self.fragment)
                .name(ENTRY_POINT),
        ]
    }

    /// Modules are only needed until the pipeline exists.
    pub fn destroy(self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_shader_module(self.vertex, None);
            device.device.destroy_shader_module(self.fragment, None);
        }
    }
}

fn load_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read shader {:?}", path))?;
    create_shader_module(device, &bytes).with_context(|| format!("In shader {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_paths_follow_glslc_output_names() {
        assert_eq!(
            spirv_path(Path::new("shaders"), "sdf", "frag"),
            PathBuf::from("shaders/sdf.frag.spv")
        );
    }
}

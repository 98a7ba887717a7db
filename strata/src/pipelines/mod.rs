//!# Strata Render Pipelines
//!
//!Composition is done in two stages and each stage can be run with
//!graphics or compute pipelines:
//!
//!* `graphics` - layers are drawn as textured geometry into per eye
//!  scratch framebuffers, then a distortion mesh is drawn into the
//!  target.
//!* `compute` - one dispatch blends every layer into a scratch image,
//!  a second one applies distortion while writing the target.
//!
//!All shaders are compiled ahead of time and handed to us as SPIR-V
//!blobs, see `ShaderBlobs`. Every pipeline is created through one
//!shared `PipelineCache`.

pub mod compute;
pub mod graphics;

pub use compute::create_compute_pipeline;
pub use graphics::{create_color_pass, create_graphics_pipeline, BlendState, GraphicsPipelineDesc};

use ash::{util, vk};

use crate::device::Device;
use crate::{Result, StrataError};
use utils::log;

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// The names of every shader the compositor loads
///
/// Each one is read from `<name>.spv` in the shader directory.
pub mod shader_names {
    pub const LAYER_PROJECTION_VERT: &str = "layer_projection.vert";
    pub const LAYER_PROJECTION_FRAG: &str = "layer_projection.frag";
    pub const LAYER_QUAD_VERT: &str = "layer_quad.vert";
    pub const LAYER_QUAD_FRAG: &str = "layer_quad.frag";
    pub const LAYER_CYLINDER_VERT: &str = "layer_cylinder.vert";
    pub const LAYER_CYLINDER_FRAG: &str = "layer_cylinder.frag";
    pub const LAYER_CUBE_VERT: &str = "layer_cube.vert";
    pub const LAYER_CUBE_FRAG: &str = "layer_cube.frag";
    pub const LAYER_EQUIRECT1_VERT: &str = "layer_equirect1.vert";
    pub const LAYER_EQUIRECT1_FRAG: &str = "layer_equirect1.frag";
    pub const LAYER_EQUIRECT2_VERT: &str = "layer_equirect2.vert";
    pub const LAYER_EQUIRECT2_FRAG: &str = "layer_equirect2.frag";
    pub const MESH_VERT: &str = "mesh.vert";
    pub const MESH_FRAG: &str = "mesh.frag";
    pub const CLEAR_COMP: &str = "clear.comp";
    pub const LAYER_COMP: &str = "layer.comp";
    pub const DISTORTION_COMP: &str = "distortion.comp";
    pub const PROJECTION_COMP: &str = "projection.comp";
    pub const PROJECTION_TIMEWARP_COMP: &str = "projection_timewarp.comp";

    pub const ALL: [&str; 19] = [
        LAYER_PROJECTION_VERT,
        LAYER_PROJECTION_FRAG,
        LAYER_QUAD_VERT,
        LAYER_QUAD_FRAG,
        LAYER_CYLINDER_VERT,
        LAYER_CYLINDER_FRAG,
        LAYER_CUBE_VERT,
        LAYER_CUBE_FRAG,
        LAYER_EQUIRECT1_VERT,
        LAYER_EQUIRECT1_FRAG,
        LAYER_EQUIRECT2_VERT,
        LAYER_EQUIRECT2_FRAG,
        MESH_VERT,
        MESH_FRAG,
        CLEAR_COMP,
        LAYER_COMP,
        DISTORTION_COMP,
        PROJECTION_COMP,
        PROJECTION_TIMEWARP_COMP,
    ];
}

/// Compiled shader code, keyed by shader name
#[derive(Debug, Default, Clone)]
pub struct ShaderBlobs {
    sb_code: HashMap<String, Vec<u32>>,
}

impl ShaderBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every known shader from `dir`
    ///
    /// All of them have to be present, a partial set would only fail
    /// later in the middle of a frame.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut ret = Self::new();

        for name in shader_names::ALL.iter() {
            let path = dir.join(format!("{}.spv", name));
            let mut file = File::open(&path).map_err(|e| {
                log::error!("Could not open shader {:?}: {}", path, e);
                StrataError::INVALID
            })?;
            let code = util::read_spv(&mut file).map_err(|e| {
                log::error!("Could not read spv file {:?}: {}", path, e);
                StrataError::INVALID
            })?;
            ret.insert(name, code);
        }

        log::debug!("Loaded {} shaders from {:?}", ret.sb_code.len(), dir);
        Ok(ret)
    }

    pub fn insert(&mut self, name: &str, code: Vec<u32>) {
        self.sb_code.insert(name.to_string(), code);
    }

    pub fn get(&self, name: &str) -> Result<&[u32]> {
        self.sb_code.get(name).map(|c| c.as_slice()).ok_or_else(|| {
            log::error!("Shader {} was not loaded", name);
            StrataError::INVALID
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sb_code.contains_key(name)
    }
}

/// The pipeline cache shared by every pipeline we build
pub struct PipelineCache {
    pc_dev: Arc<Device>,
    pub(crate) pc_cache: vk::PipelineCache,
}

impl PipelineCache {
    pub fn new(dev: Arc<Device>) -> Result<Self> {
        let info = vk::PipelineCacheCreateInfo::builder();
        let cache = unsafe {
            dev.dev
                .create_pipeline_cache(&info, None)
                .map_err(StrataError::from)?
        };

        Ok(Self {
            pc_dev: dev,
            pc_cache: cache,
        })
    }

    pub fn handle(&self) -> vk::PipelineCache {
        self.pc_cache
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        unsafe {
            self.pc_dev.dev.destroy_pipeline_cache(self.pc_cache, None);
        }
    }
}

/// Create a vkShaderModule from SPIR-V words
pub(crate) fn create_shader_module(dev: &Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        dev.dev.create_shader_module(&info, None).map_err(|e| {
            log::error!("Could not create new shader module: {:?}", e);
            StrataError::GPU_ERROR
        })
    }
}

/// Create a pipeline layout with one descriptor set
pub(crate) fn create_pipeline_layout(
    dev: &Device,
    set_layout: vk::DescriptorSetLayout,
) -> Result<vk::PipelineLayout> {
    let layouts = [set_layout];
    let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&layouts);

    unsafe {
        dev.dev
            .create_pipeline_layout(&info, None)
            .map_err(|_| StrataError::GPU_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_shader_is_invalid() {
        let mut blobs = ShaderBlobs::new();
        blobs.insert(shader_names::MESH_VERT, vec![0x0723_0203]);

        assert!(blobs.contains(shader_names::MESH_VERT));
        assert_eq!(blobs.get(shader_names::MESH_VERT).unwrap().len(), 1);
        assert_eq!(blobs.get(shader_names::MESH_FRAG), Err(StrataError::INVALID));
    }

    #[test]
    fn load_dir_requires_every_shader() {
        let dir = std::env::temp_dir().join(format!("strata-shaders-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        assert!(ShaderBlobs::load_dir(&dir).is_err());

        // The smallest valid spv file is the magic number
        let magic = 0x0723_0203u32.to_le_bytes();
        for name in shader_names::ALL.iter() {
            std::fs::write(dir.join(format!("{}.spv", name)), magic).unwrap();
        }
        let blobs = ShaderBlobs::load_dir(&dir).unwrap();
        assert_eq!(blobs.get(shader_names::LAYER_COMP).unwrap(), &[0x0723_0203]);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}

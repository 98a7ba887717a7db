// Compute pipeline construction
//
// A compute `Pass` bundles one shader with its set layout, pipeline
// layout and a descriptor allocator. The compute compositor is a chain
// of these.

use ash::vk;

use super::{create_pipeline_layout, create_shader_module, PipelineCache};
use crate::descpool::{Descriptor, DescriptorSystem, LayoutBinding};
use crate::device::Device;
use crate::{Result, StrataError};
use utils::log;

use std::ffi::CStr;
use std::sync::Arc;

/// Local workgroup size of every compositor compute shader
pub const WORKGROUP_SIZE: u32 = 8;

/// Create a compute pipeline from SPIR-V words
pub fn create_compute_pipeline(
    dev: &Device,
    cache: &PipelineCache,
    layout: vk::PipelineLayout,
    code: &[u32],
) -> Result<vk::Pipeline> {
    let module = create_shader_module(dev, code)?;
    let entrypoint = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .module(module)
        .name(entrypoint)
        .stage(vk::ShaderStageFlags::COMPUTE)
        .build();
    let pipe_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage)
        .layout(layout)
        .build();

    let ret = unsafe {
        dev.dev
            .create_compute_pipelines(cache.handle(), &[pipe_info], None)
    };
    unsafe { dev.dev.destroy_shader_module(module, None) };

    match ret {
        Ok(pipes) => pipes.get(0).cloned().ok_or(StrataError::GPU_ERROR),
        Err((_, e)) => {
            log::error!("Could not create compute pipeline: {:?}", e);
            Err(StrataError::GPU_ERROR)
        }
    }
}

/// One compute shader and the resources to run it
pub struct Pass {
    p_dev: Arc<Device>,
    pub(crate) p_pipeline: vk::Pipeline,
    pub(crate) p_pipeline_layout: vk::PipelineLayout,
    p_descs: DescriptorSystem,
}

impl Pass {
    pub fn new(
        dev: Arc<Device>,
        cache: &PipelineCache,
        bindings: &[LayoutBinding],
        code: &[u32],
    ) -> Result<Self> {
        let descs = DescriptorSystem::new(dev.clone(), bindings)?;
        let layout = create_pipeline_layout(&dev, descs.layout())?;
        let pipeline = match create_compute_pipeline(&dev, cache, layout, code) {
            Ok(p) => p,
            Err(e) => {
                unsafe { dev.dev.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        Ok(Self {
            p_dev: dev,
            p_pipeline: pipeline,
            p_pipeline_layout: layout,
            p_descs: descs,
        })
    }

    pub fn alloc_descriptor(&mut self) -> Result<Descriptor> {
        self.p_descs.alloc_descriptor()
    }

    /// Bind this pass and its set, then dispatch
    pub(crate) fn dispatch(
        &self,
        cbuf: vk::CommandBuffer,
        set: vk::DescriptorSet,
        groups: (u32, u32, u32),
    ) {
        unsafe {
            self.p_dev
                .dev
                .cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::COMPUTE, self.p_pipeline);
            self.p_dev.dev.cmd_bind_descriptor_sets(
                cbuf,
                vk::PipelineBindPoint::COMPUTE,
                self.p_pipeline_layout,
                0,
                &[set],
                &[],
            );
            self.p_dev
                .dev
                .cmd_dispatch(cbuf, groups.0, groups.1, groups.2);
        }
    }
}

impl Drop for Pass {
    fn drop(&mut self) {
        unsafe {
            self.p_dev.dev.destroy_pipeline(self.p_pipeline, None);
            self.p_dev
                .dev
                .destroy_pipeline_layout(self.p_pipeline_layout, None);
        }
    }
}

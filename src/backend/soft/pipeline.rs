// CPU compute pipelines

use super::binding::SoftBinder;
use super::spirv::{workgroup_invocations, Program, SharedTable, MAX_WORKGROUP_INVOCATIONS};
use super::SoftContext;
use crate::binding::{pipeline_layouts, PipelineLayouts};
use crate::error::{Error, Result};
use crate::types::ComputePipelineCreateInfo;

pub struct SoftPipeline {
    pub program: Program,
    pub local_size: [u32; 3],
    pub layouts: PipelineLayouts<SoftBinder>,
    /// Workgroup variables of every workgroup currently running this pipeline
    pub shared: SharedTable,
}

impl SoftPipeline {
    pub fn new(context: &SoftContext, info: &ComputePipelineCreateInfo) -> Result<Self> {
        let program = Program::parse(info.code, info.entrypoint).map_err(|e| {
            context.sink.error(format!("failed to load compute shader: {:#}", e));
            Error::InitializationFailed
        })?;

        let local_size = program.local_size.unwrap_or([
            info.threadcount_x.max(1),
            info.threadcount_y.max(1),
            info.threadcount_z.max(1),
        ]);
        if local_size.contains(&0) {
            context.sink.error("compute shader declares an empty workgroup");
            return Err(Error::InitializationFailed);
        }
        if workgroup_invocations(local_size).is_none() {
            context.sink.error(format!(
                "workgroup {:?} exceeds {} invocations",
                local_size, MAX_WORKGROUP_INVOCATIONS
            ));
            return Err(Error::InitializationFailed);
        }

        let layouts = pipeline_layouts(
            &context.layouts,
            &context.binder,
            (info.num_readonly_storage_images, info.num_readonly_storage_buffers),
            (info.num_readwrite_storage_images, info.num_readwrite_storage_buffers),
            info.num_uniform_buffers,
        )?;

        log::debug!(
            "CPU pipeline '{}' with workgroup {:?}",
            info.entrypoint,
            local_size
        );

        Ok(Self {
            program,
            local_size,
            layouts,
            shared: SharedTable::default(),
        })
    }
}

impl std::fmt::Debug for SoftPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftPipeline")
            .field("local_size", &self.local_size)
            .finish()
    }
}

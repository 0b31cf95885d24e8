// SPIR-V front end of the CPU backend

pub mod interpreter;
pub mod module;
pub mod value;

#[cfg(test)]
pub(crate) mod assembler;

pub use interpreter::{
    run_workgroup, workgroup_invocations, ExecContext, SharedTable, WorkgroupKey,
    MAX_WORKGROUP_INVOCATIONS,
};
pub use module::Program;

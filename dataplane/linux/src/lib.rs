//! Linux dataplane for the NPM agent: the `ipset restore` batch applier with
//! line-failure recovery, and the process-execution shim it runs through.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod applier;
mod exec;
mod file_creator;
mod save;

pub use self::{
    applier::RestoreApplier,
    exec::{CommandRunner, ExecError, Output, SystemRunner},
    file_creator::{ErrorHandler, FileCreator, RecoveryAction, DEFAULT_MAX_TRIES},
    save::KernelState,
};

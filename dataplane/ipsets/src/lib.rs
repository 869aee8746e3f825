//! The OS-agnostic half of the NPM dataplane: the in-memory set model, the
//! dirty-cache journal, and the mutex-serialized manager that platform
//! appliers hang off of.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod applier;
mod dirty;
mod entity;
mod error;
mod manager;
pub mod metrics;
#[cfg(test)]
mod tests;

pub use self::{
    applier::{Applier, ApplyBatch, DestroyDelta, SetDelta},
    entity::{IpSet, ReferenceKind},
    error::{ApplyError, ErrorKind, IpSetError},
    manager::{ApplyMode, Config, IpSetManager},
};

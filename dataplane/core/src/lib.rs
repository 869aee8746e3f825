//! Core types for the NPM dataplane.
//!
//! This crate holds the vocabulary shared by the IPSet manager and the
//! platform appliers: set typing and naming, member validation, and the
//! DTOs handed over by the policy translator.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod member;
mod metadata;
mod policy;

pub use self::{
    member::{validate_member, InvalidMember},
    metadata::{hashed_name, SetKind, SetMetadata, SetType, KERNEL_SET_PREFIX},
    policy::{pod_key, NpmNetworkPolicy, TranslatedIpSet},
};

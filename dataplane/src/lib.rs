//! NPM dataplane agent.
//!
//! The per-node materialization layer for network policy: the translator
//! feeds set mutations into an [`IpSetManager`], and the platform applier
//! batches them into the kernel. This crate wires the engine to a platform
//! and hosts the agent binary's argument handling.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;

pub use self::args::Args;
pub use npm_dataplane_core::{
    hashed_name, NpmNetworkPolicy, SetKind, SetMetadata, SetType, TranslatedIpSet,
};
pub use npm_dataplane_ipsets::{ApplyMode, Config, IpSetManager, ReferenceKind};

use npm_dataplane_linux::{RestoreApplier, SystemRunner};
use npm_dataplane_windows::{HnsApplier, HostNetworkService};
use std::time::Duration;

/// Builds a manager over the host's `ipset` dataplane.
pub fn linux_manager(
    config: Config,
    max_restore_tries: u8,
    reconcile_from_kernel: bool,
) -> IpSetManager<RestoreApplier<SystemRunner>> {
    let applier = RestoreApplier::system()
        .with_max_tries(max_restore_tries)
        .with_kernel_reconcile(reconcile_from_kernel);
    IpSetManager::new(config, applier)
}

/// Builds a manager over the host-compute dataplane with an injected service
/// client. Windows agents embed this from their own process; the service
/// wrapper itself lives outside this crate.
pub fn windows_manager<S>(
    config: Config,
    hns: S,
    call_timeout: Duration,
) -> IpSetManager<HnsApplier<S>>
where
    S: HostNetworkService + 'static,
{
    let network_name = config.network_name.clone();
    let applier = HnsApplier::new(hns, network_name).with_call_timeout(call_timeout);
    IpSetManager::new(config, applier)
}

//! Renders pending set changes into a single transactional `ipset restore`
//! batch, recovering from mid-batch line failures by excising the offending
//! line and re-running.

use crate::{
    exec::{CommandRunner, SystemRunner},
    file_creator::{ErrorHandler, FileCreator, RecoveryAction, DEFAULT_MAX_TRIES},
    save::KernelState,
};
use ahash::AHashSet as HashSet;
use npm_dataplane_core::{SetKind, SetType, KERNEL_SET_PREFIX};
use npm_dataplane_ipsets::{Applier, ApplyBatch, ApplyError, ErrorKind, SetDelta};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::Arc;

const IPSET: &str = "ipset";

/// Kernel error messages `ipset restore` reports per line.
static SET_ALREADY_EXISTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new("Set cannot be created: set with the same name already exists")
        .expect("pattern compiles")
});
static SET_DOES_NOT_EXIST: Lazy<Regex> =
    Lazy::new(|| Regex::new("The set with the given name does not exist").expect("pattern compiles"));
static MEMBER_SET_DOES_NOT_EXIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new("Set to be added/deleted/tested as element does not exist")
        .expect("pattern compiles")
});
static SET_IN_USE: Lazy<Regex> = Lazy::new(|| {
    Regex::new("Set cannot be destroyed: it is in use by a kernel component")
        .expect("pattern compiles")
});

/// A whole-file failure worth a plain re-run.
static FILE_LEVEL_RETRY: Lazy<Regex> =
    Lazy::new(|| Regex::new("Resource temporarily unavailable").expect("pattern compiles"));

/// Applies batches through `ipset restore` on the host.
///
/// With kernel reconcile enabled, each apply that adds or updates sets first
/// reads `ipset save` and replaces the cached member diffs with splits
/// computed against observed kernel membership, healing drift in both
/// directions.
pub struct RestoreApplier<R = SystemRunner> {
    runner: R,
    max_tries: u8,
    reconcile_with_save: bool,

    /// Sets whose destroy the kernel refused; a higher layer reconciles.
    leaked: Arc<Mutex<Vec<String>>>,
}

/// The effective render decision for one set, after optional reconciliation
/// against observed kernel state.
struct Plan<'a> {
    delta: &'a SetDelta,
    create_line: bool,
    to_add: Vec<String>,
    to_delete: Vec<String>,
}

fn kind_name(delta: &SetDelta) -> &'static str {
    if delta.kind == SetKind::List {
        "setlist"
    } else if delta.set_type == SetType::NamedPorts {
        "hash:ip,port"
    } else {
        "nethash"
    }
}

// === impl RestoreApplier ===

impl RestoreApplier<SystemRunner> {
    pub fn system() -> Self {
        Self::new(SystemRunner)
    }
}

impl<R> RestoreApplier<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            max_tries: DEFAULT_MAX_TRIES,
            reconcile_with_save: false,
            leaked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_max_tries(mut self, max_tries: u8) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_kernel_reconcile(mut self, enabled: bool) -> Self {
        self.reconcile_with_save = enabled;
        self
    }

    /// Drains the reconciliation list of sets the kernel refused to destroy.
    pub fn take_leaked(&self) -> Vec<String> {
        std::mem::take(&mut *self.leaked.lock())
    }
}

impl<R: CommandRunner> RestoreApplier<R> {
    fn read_kernel_state(&self) -> Result<KernelState, ApplyError> {
        let out = self
            .runner
            .run(IPSET, &["save"], None)
            .map_err(|err| {
                ApplyError::with_source(ErrorKind::Transient, "failed to read kernel sets", err)
            })?;
        Ok(KernelState::parse(&out.stdout))
    }

    fn plan<'a>(delta: &'a SetDelta, kernel: Option<&KernelState>) -> Plan<'a> {
        let Some(kernel) = kernel else {
            return Plan {
                delta,
                create_line: delta.create,
                to_add: delta.members_to_add.clone(),
                to_delete: delta.members_to_delete.clone(),
            };
        };
        match kernel.members(&delta.hashed_name) {
            Some(observed) => {
                // Split desired against observed, healing members the kernel
                // gained or lost behind our back.
                let desired: HashSet<&str> =
                    delta.desired_members.iter().map(String::as_str).collect();
                let mut to_add: Vec<String> = delta
                    .desired_members
                    .iter()
                    .filter(|m| !observed.contains(m.as_str()))
                    .cloned()
                    .collect();
                to_add.sort_unstable();
                let mut to_delete: Vec<String> = observed
                    .iter()
                    .filter(|m| !desired.contains(m.as_str()))
                    .cloned()
                    .collect();
                to_delete.sort_unstable();
                Plan {
                    delta,
                    create_line: delta.create,
                    to_add,
                    to_delete,
                }
            }
            // Missing from the kernel entirely: create it with everything.
            None => Plan {
                delta,
                create_line: true,
                to_add: delta.desired_members.clone(),
                to_delete: Vec::new(),
            },
        }
    }

    fn build_restore(&self, batch: &ApplyBatch) -> FileCreator {
        let kernel = if self.reconcile_with_save && !batch.to_add_or_update.is_empty() {
            match self.read_kernel_state() {
                Ok(state) => Some(state),
                Err(error) => {
                    tracing::warn!(%error, "falling back to cached member diffs");
                    None
                }
            }
        } else {
            None
        };

        let plans: Vec<Plan<'_>> = batch
            .to_add_or_update
            .iter()
            .map(|delta| Self::plan(delta, kernel.as_ref()))
            .collect();

        let mut fc =
            FileCreator::new(self.max_tries).with_file_level_pattern(FILE_LEVEL_RETRY.clone());

        // Creates come first so lists exist before members reference them.
        for plan in plans.iter().filter(|p| p.create_line) {
            let delta = plan.delta;
            let handlers = vec![ErrorHandler::new(
                SET_ALREADY_EXISTS.clone(),
                RecoveryAction::ContinueAndAbortSection,
            )];
            if delta.set_type == SetType::CidrBlocks {
                fc.add_line(
                    &delta.hashed_name,
                    handlers,
                    &[
                        "-N",
                        &delta.hashed_name,
                        "-exist",
                        kind_name(delta),
                        "maxelem",
                        "4294967295",
                    ],
                );
            } else {
                fc.add_line(
                    &delta.hashed_name,
                    handlers,
                    &["-N", &delta.hashed_name, "-exist", kind_name(delta)],
                );
            }
        }

        // Member deletes, then adds, for sets already in the kernel.
        for plan in plans.iter().filter(|p| !p.create_line) {
            let delta = plan.delta;
            for member in &plan.to_delete {
                fc.add_line(
                    &delta.hashed_name,
                    member_handlers(),
                    &["-D", &delta.hashed_name, member],
                );
            }
            for member in &plan.to_add {
                fc.add_line(
                    &delta.hashed_name,
                    member_handlers(),
                    &["-A", &delta.hashed_name, member],
                );
            }
        }

        // Members of newly-created sets share the create line's section, so a
        // refused create drags its members with it.
        for plan in plans.iter().filter(|p| p.create_line) {
            let delta = plan.delta;
            for member in &plan.to_delete {
                fc.add_line(
                    &delta.hashed_name,
                    member_handlers(),
                    &["-D", &delta.hashed_name, member],
                );
            }
            for member in &plan.to_add {
                fc.add_line(
                    &delta.hashed_name,
                    member_handlers(),
                    &["-A", &delta.hashed_name, member],
                );
            }
        }

        // Flush before destroy so list-membership references are broken.
        for destroy in &batch.to_destroy {
            fc.add_line(
                &destroy.hashed_name,
                vec![ErrorHandler::new(
                    SET_DOES_NOT_EXIST.clone(),
                    RecoveryAction::ContinueAndAbortSection,
                )],
                &["-F", &destroy.hashed_name],
            );
        }
        for destroy in &batch.to_destroy {
            // The callback records the prefixed name for later reconciliation.
            let name = destroy.name.clone();
            let leaked = self.leaked.clone();
            let in_use = ErrorHandler::with_callback(
                SET_IN_USE.clone(),
                RecoveryAction::Continue,
                move || {
                    tracing::warn!(set = %name, "kernel refused destroy; queued for reconciliation");
                    leaked.lock().push(name.clone());
                },
            );
            fc.add_line(
                &destroy.hashed_name,
                vec![
                    in_use,
                    ErrorHandler::new(SET_DOES_NOT_EXIST.clone(), RecoveryAction::Continue),
                ],
                &["-X", &destroy.hashed_name],
            );
        }

        fc
    }
}

fn member_handlers() -> Vec<ErrorHandler> {
    vec![
        ErrorHandler::new(MEMBER_SET_DOES_NOT_EXIST.clone(), RecoveryAction::Continue),
        ErrorHandler::new(
            SET_DOES_NOT_EXIST.clone(),
            RecoveryAction::ContinueAndAbortSection,
        ),
    ]
}

impl<R: CommandRunner> Applier for RestoreApplier<R> {
    fn apply(&self, batch: &ApplyBatch) -> Result<(), ApplyError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut fc = self.build_restore(batch);
        tracing::debug!(lines = fc.num_lines(), "running ipset restore");
        fc.run(&self.runner, IPSET, &["restore"])?;
        tracing::debug!(tries = fc.tries(), "restore succeeded");
        Ok(())
    }

    /// Clears all agent-owned kernel sets.
    ///
    /// When the kernel holds nothing but our sets, a shell-level
    /// flush-everything/destroy-everything is cheapest. Otherwise (or if the
    /// fast path fails) fall back to a two-pass restore that flushes every
    /// agent set and then destroys them, skipping sets a best-effort probe
    /// says are still referenced by kernel components.
    fn reset(&self) -> Result<(), ApplyError> {
        let out = self
            .runner
            .run(IPSET, &["list", "--name"], None)
            .map_err(|err| {
                ApplyError::with_source(ErrorKind::Transient, "failed to list kernel sets", err)
            })?;
        let all_names: Vec<String> = String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let agent_names: Vec<&str> = all_names
            .iter()
            .filter(|n| n.starts_with(KERNEL_SET_PREFIX))
            .map(String::as_str)
            .collect();

        if agent_names.is_empty() {
            tracing::debug!("no agent-owned sets in the kernel");
            return Ok(());
        }

        if agent_names.len() == all_names.len() {
            match self
                .runner
                .run("sh", &["-c", "ipset flush && ipset destroy"], None)
            {
                Ok(_) => return Ok(()),
                Err(error) => {
                    tracing::warn!(%error, "fast reset failed; falling back to per-set restore");
                }
            }
        }

        let held = self.probe_held_sets();
        let mut fc = FileCreator::new(self.max_tries);
        for name in agent_names.iter().copied() {
            fc.add_line(
                name,
                vec![ErrorHandler::new(
                    SET_DOES_NOT_EXIST.clone(),
                    RecoveryAction::ContinueAndAbortSection,
                )],
                &["-F", name],
            );
        }
        for name in agent_names.iter().copied() {
            if held.contains(name) {
                tracing::warn!(set = %name, "kernel still references set; skipping destroy");
                self.leaked.lock().push(name.to_string());
                continue;
            }
            fc.add_line(
                name,
                vec![
                    ErrorHandler::new(SET_IN_USE.clone(), RecoveryAction::Continue),
                    ErrorHandler::new(SET_DOES_NOT_EXIST.clone(), RecoveryAction::Continue),
                ],
                &["-X", name],
            );
        }
        fc.run(&self.runner, IPSET, &["restore"])
    }
}

impl<R: CommandRunner> RestoreApplier<R> {
    /// Best-effort probe for agent sets the kernel still references; failures
    /// yield an empty result rather than blocking the reset.
    fn probe_held_sets(&self) -> HashSet<String> {
        let mut held = HashSet::default();
        let Ok(out) = self.runner.run(IPSET, &["list"], None) else {
            tracing::debug!("reference probe failed; assuming nothing is held");
            return held;
        };
        let mut current: Option<String> = None;
        for line in String::from_utf8_lossy(&out.stdout).lines() {
            if let Some(name) = line.strip_prefix("Name:") {
                current = Some(name.trim().to_string());
            } else if let Some(refs) = line.strip_prefix("References:") {
                let count: usize = refs.trim().parse().unwrap_or(0);
                if count > 0 {
                    if let Some(name) = &current {
                        if name.starts_with(KERNEL_SET_PREFIX) {
                            held.insert(name.clone());
                        }
                    }
                }
            }
        }
        held
    }
}

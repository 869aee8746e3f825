use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use npm_dataplane_core::KERNEL_SET_PREFIX;

/// Kernel set membership parsed from `ipset save` output, keyed by kernel
/// set name. Only agent-owned names are retained; everything else in the
/// kernel is none of our business.
///
/// The parser is prefix-match only: fields after the set name on a `create`
/// line are free-form and ignored, and an `add` member is everything after
/// the parent name (members may contain spaces, e.g. `10.0.0.0/24 nomatch`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelState {
    sets: HashMap<String, HashSet<String>>,
}

// === impl KernelState ===

impl KernelState {
    pub fn parse(stdout: &[u8]) -> Self {
        let mut sets: HashMap<String, HashSet<String>> = HashMap::default();
        for line in String::from_utf8_lossy(stdout).lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("create") => {
                    if let Some(name) = parts.next() {
                        if name.starts_with(KERNEL_SET_PREFIX) {
                            sets.entry(name.to_string()).or_default();
                        }
                    }
                }
                Some("add") => {
                    if let Some(parent) = parts.next() {
                        if parent.starts_with(KERNEL_SET_PREFIX) {
                            let member = parts.collect::<Vec<_>>().join(" ");
                            if !member.is_empty() {
                                sets.entry(parent.to_string()).or_default().insert(member);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Self { sets }
    }

    pub fn contains(&self, kernel_name: &str) -> bool {
        self.sets.contains_key(kernel_name)
    }

    pub fn members(&self, kernel_name: &str) -> Option<&HashSet<String>> {
        self.sets.get(kernel_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.sets.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

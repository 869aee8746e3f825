use crate::SetMetadata;

/// Builds the ownership token used to arbitrate concurrent add/remove of the
/// same IP: the owning pod's `<namespace>/<pod>` key.
pub fn pod_key(namespace: &str, pod: &str) -> String {
    format!("{namespace}/{pod}")
}

/// A set as the translator hands it over: identity plus literal members.
///
/// Members are IPs/CIDRs for CIDR sets, `ip,[proto:]port` tuples for
/// named-port sets, and prefixed set names for nested-label lists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslatedIpSet {
    pub metadata: SetMetadata,
    pub members: Vec<String>,
}

/// The translated form of one NetworkPolicy, as far as this layer cares: the
/// sets the policy requires to exist in the kernel. The rendered ACL rules
/// ride along at a higher layer and never reach the set manager.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NpmNetworkPolicy {
    pub name: String,
    pub namespace: String,
    pub pod_selector_ipsets: Vec<TranslatedIpSet>,
    pub rule_ipsets: Vec<TranslatedIpSet>,
}

// === impl TranslatedIpSet ===

impl TranslatedIpSet {
    pub fn new(metadata: SetMetadata) -> Self {
        Self {
            metadata,
            members: Vec::new(),
        }
    }

    pub fn with_members(
        metadata: SetMetadata,
        members: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            metadata,
            members: members.into_iter().map(Into::into).collect(),
        }
    }
}

// === impl NpmNetworkPolicy ===

impl NpmNetworkPolicy {
    /// The identifier recorded as a reference on every set this policy uses.
    pub fn policy_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// All sets this policy requires, selector sets first.
    pub fn ipsets(&self) -> impl Iterator<Item = &TranslatedIpSet> {
        self.pod_selector_ipsets.iter().chain(self.rule_ipsets.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SetType;

    #[test]
    fn policy_key_and_ipsets() {
        let policy = NpmNetworkPolicy {
            name: "deny-all".to_string(),
            namespace: "prod".to_string(),
            pod_selector_ipsets: vec![TranslatedIpSet::new(SetMetadata::new(
                "prod",
                SetType::Namespace,
            ))],
            rule_ipsets: vec![TranslatedIpSet::with_members(
                SetMetadata::new("allowed", SetType::CidrBlocks),
                ["10.0.0.0/24"],
            )],
        };
        assert_eq!(policy.policy_key(), "prod/deny-all");
        assert_eq!(policy.ipsets().count(), 2);
        assert_eq!(pod_key("prod", "web-0"), "prod/web-0");
    }
}

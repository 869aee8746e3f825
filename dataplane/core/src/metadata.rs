use sha2::{Digest, Sha256};

/// Prefix carried by every kernel-visible set name owned by this agent.
///
/// Reads of kernel state must ignore any name without this prefix; the agent
/// assumes it is the only writer of names that carry it.
pub const KERNEL_SET_PREFIX: &str = "azure-npm-";

/// The semantic type of a set. The type determines the name prefix, whether
/// the set holds IPs or other sets, and whether it may back a pod selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetType {
    Namespace,
    KeyLabelOfNamespace,
    KeyValueLabelOfNamespace,
    KeyLabelOfPod,
    KeyValueLabelOfPod,
    NamedPorts,
    NestedLabelOfPod,
    CidrBlocks,
    Unknown,
}

/// What a set contains: IP-ish members, or other sets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetKind {
    Hash,
    List,
}

/// A set's identity as the translator names it: an unprefixed name plus its
/// type. The prefixed name is the manager's cache key; the hashed form of the
/// prefixed name is the kernel-visible identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SetMetadata {
    name: String,
    set_type: SetType,
}

// === impl SetType ===

impl SetType {
    pub fn kind(self) -> SetKind {
        match self {
            Self::KeyLabelOfNamespace | Self::KeyValueLabelOfNamespace | Self::NestedLabelOfPod => {
                SetKind::List
            }
            _ => SetKind::Hash,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Namespace => "ns-",
            Self::KeyLabelOfNamespace | Self::KeyValueLabelOfNamespace => "namespacelabel-",
            Self::KeyLabelOfPod | Self::KeyValueLabelOfPod => "podlabel-",
            Self::NamedPorts => "namedport-",
            Self::NestedLabelOfPod => "nestedlabel-",
            Self::CidrBlocks => "cidr-",
            Self::Unknown => "unknown-",
        }
    }

    /// Whether sets of this type may back a policy's pod selector.
    pub fn is_selector_eligible(self) -> bool {
        matches!(
            self,
            Self::Namespace | Self::KeyLabelOfPod | Self::KeyValueLabelOfPod | Self::NestedLabelOfPod
        )
    }
}

// === impl SetMetadata ===

impl SetMetadata {
    pub fn new(name: impl Into<String>, set_type: SetType) -> Self {
        Self {
            name: name.into(),
            set_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_type(&self) -> SetType {
        self.set_type
    }

    pub fn kind(&self) -> SetKind {
        self.set_type.kind()
    }

    pub fn prefixed_name(&self) -> String {
        format!("{}{}", self.set_type.prefix(), self.name)
    }

    /// Recovers metadata from a prefixed name, e.g. a list member the
    /// translator passed as a literal string.
    ///
    /// The two label prefixes are shared by their key and key-value variants;
    /// a `:`-separated value picks the key-value form, matching how label
    /// set names are minted.
    pub fn from_prefixed_name(prefixed: &str) -> Option<Self> {
        let (set_type, rest) = if let Some(rest) = prefixed.strip_prefix("ns-") {
            (SetType::Namespace, rest)
        } else if let Some(rest) = prefixed.strip_prefix("namespacelabel-") {
            let ty = if rest.contains(':') {
                SetType::KeyValueLabelOfNamespace
            } else {
                SetType::KeyLabelOfNamespace
            };
            (ty, rest)
        } else if let Some(rest) = prefixed.strip_prefix("podlabel-") {
            let ty = if rest.contains(':') {
                SetType::KeyValueLabelOfPod
            } else {
                SetType::KeyLabelOfPod
            };
            (ty, rest)
        } else if let Some(rest) = prefixed.strip_prefix("namedport-") {
            (SetType::NamedPorts, rest)
        } else if let Some(rest) = prefixed.strip_prefix("nestedlabel-") {
            (SetType::NestedLabelOfPod, rest)
        } else if let Some(rest) = prefixed.strip_prefix("cidr-") {
            (SetType::CidrBlocks, rest)
        } else {
            return None;
        };

        if rest.is_empty() {
            return None;
        }
        Some(Self::new(rest, set_type))
    }

    pub fn hashed_name(&self) -> String {
        hashed_name(&self.prefixed_name())
    }
}

/// Derives the kernel-visible identifier for a prefixed set name: the agent
/// prefix followed by 16 lowercase hex digits of a deterministic 64-bit
/// truncation of SHA-256.
pub fn hashed_name(prefixed_name: &str) -> String {
    let digest = Sha256::digest(prefixed_name.as_bytes());
    let mut h = [0u8; 8];
    h.copy_from_slice(&digest[..8]);
    format!("{}{:016x}", KERNEL_SET_PREFIX, u64::from_be_bytes(h))
}

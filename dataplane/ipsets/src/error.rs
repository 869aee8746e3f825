use npm_dataplane_core::{InvalidMember, SetKind, SetType};
use std::fmt;

/// The coarse classification appliers attach to failures so callers can
/// match on kind without knowing platform details.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transient,
    Drift,
    LeakedReference,
    Timeout,
    Fatal,
}

/// A failure from a platform applier: a kind plus a message and an optional
/// underlying cause.
#[derive(Debug, thiserror::Error)]
#[error("{kind} applying ipsets: {message}")]
pub struct ApplyError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

/// A validation failure from the manager's public surface. These never touch
/// the kernel and leave the dirty cache unchanged, apart from sets whose
/// creation completed before the failing check.
#[derive(Debug, thiserror::Error)]
pub enum IpSetError {
    #[error("set does not exist: {0}")]
    SetDoesNotExist(String),

    #[error("set {name} is a {actual:?} set where a {expected:?} set is required")]
    KindMismatch {
        name: String,
        expected: SetKind,
        actual: SetKind,
    },

    #[error("set {name} of type {set_type:?} cannot back a selector")]
    NotSelectorEligible { name: String, set_type: SetType },

    #[error("lists cannot hold other lists: {0}")]
    NestedList(String),

    #[error("invalid member for set {name}: {source}")]
    InvalidMember {
        name: String,
        #[source]
        source: InvalidMember,
    },

    #[error("not a prefixed set name: {0}")]
    UnknownMemberName(String),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

// === impl ErrorKind ===

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation error",
            Self::Transient => "transient error",
            Self::Drift => "kernel drift",
            Self::LeakedReference => "leaked kernel reference",
            Self::Timeout => "timeout",
            Self::Fatal => "fatal error",
        };
        f.write_str(s)
    }
}

// === impl ApplyError ===

impl ApplyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

use crate::core::types::{Direction, TableFamily};
use thiserror::Error;

/// Core error type for nftkit
#[derive(Debug, Error)]
pub enum Error {
    /// A rule, chain or set description was rejected before reaching the transport
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Requested object does not exist in the registry
    #[error("{kind} not found: {name}")]
    NotFound { kind: ObjectKind, name: String },

    /// Transport rejected an operation
    #[error("Transport error during {op} of {object}: {source}")]
    Transport {
        op: &'static str,
        object: String,
        #[source]
        source: TransportError,
    },

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn not_found(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn transport(
        op: &'static str,
        object: impl Into<String>,
        source: TransportError,
    ) -> Self {
        Self::Transport {
            op,
            object: object.into(),
            source,
        }
    }

    /// Returns `true` for lookup failures, including a transport reporting a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::Transport {
                    source: TransportError::NotFound(_),
                    ..
                }
        )
    }
}

/// Kind of registry object, used in lookup errors and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ObjectKind {
    #[strum(serialize = "table")]
    Table,
    #[strum(serialize = "chain")]
    Chain,
    #[strum(serialize = "rule")]
    Rule,
    #[strum(serialize = "set")]
    Set,
}

/// Local validation failures. These are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("rule has no match layer and no verdict")]
    EmptyRule,

    #[error("{action} requires a layer 4 protocol match")]
    MissingProtocolContext { action: &'static str },

    #[error("layer 3 match has neither source nor destination")]
    EmptyL3,

    #[error("{0} address specification has neither list nor range")]
    EmptyAddressSpec(Direction),

    #[error("{0} address specification mixes list, range or version match")]
    ConflictingAddressSpec(Direction),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("address family mismatch: {0}")]
    AddressFamilyMismatch(String),

    #[error("prefix length {prefix} exceeds maximum {max}")]
    InvalidPrefix { prefix: u8, max: u8 },

    #[error("{0} port specification has neither list nor range")]
    EmptyPortSpec(Direction),

    #[error("{0} port specification has both list and range")]
    ConflictingPortSpec(Direction),

    #[error("invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("protocol {0} does not carry ports")]
    PortsNotSupported(String),

    #[error("table family {0} is not supported for this rule")]
    UnsupportedFamily(TableFamily),

    #[error("cannot determine IP version of rule in {0} table")]
    UnknownIpVersion(TableFamily),

    #[error("unsupported concatenation element: {0}")]
    UnsupportedConcatElement(String),

    #[error("concatenation has no elements")]
    EmptyConcat,

    #[error("match-action requires a match set")]
    MissingMatchSet,

    #[error("match-action table is empty")]
    EmptyActionTable,

    #[error("match-action entry {0} has no verdict")]
    MissingVerdict(u32),

    #[error("unsupported match type: {0}")]
    UnsupportedMatchType(String),

    #[error("rule carries more than one terminal action: {0}")]
    ConflictingActions(String),

    #[error("{0} requires a target address")]
    NatMissingAddress(&'static str),

    #[error("inconsistent base chain attributes: {0}")]
    ChainAttributes(String),

    #[error("invalid {kind} name {name:?}: {reason}")]
    InvalidName {
        kind: ObjectKind,
        name: String,
        reason: &'static str,
    },

    #[error("invalid interface name {name:?}: {reason}")]
    InvalidInterface { name: String, reason: &'static str },

    #[error("log prefix exceeds {max} bytes")]
    LogPrefixTooLong { max: usize },
}

/// Errors reported by a [`Transport`](crate::core::transport::Transport) implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("operation rejected: {0}")]
    Rejected(String),

    #[error("object does not exist: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    Exists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_carries_context() {
        let err = Error::transport(
            "delete",
            "table ip filter",
            TransportError::Rejected("busy".to_string()),
        );
        let msg = err.to_string();
        assert!(msg.contains("delete"));
        assert!(msg.contains("table ip filter"));
        assert!(msg.contains("busy"));
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::not_found(ObjectKind::Chain, "input").is_not_found());
        assert!(
            Error::transport("delete", "set s", TransportError::NotFound("s".into()))
                .is_not_found()
        );
        assert!(!Error::Config("bad".into()).is_not_found());
    }

    #[test]
    fn test_validation_messages() {
        let err: Error = ValidationError::MissingVerdict(3).into();
        assert_eq!(err.to_string(), "Validation error: match-action entry 3 has no verdict");
        assert_eq!(
            ValidationError::EmptyAddressSpec(Direction::Source).to_string(),
            "source address specification has neither list nor range"
        );
    }
}

//! Error types for the protocol.

use thiserror::Error;

/// Reasons a bus message cannot be decoded into an [`Envelope`](crate::Envelope).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The `command` key holds a value this sidecar does not understand.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The `protocol` key holds a value this sidecar does not understand.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// A key required by the command is absent or empty.
    #[error("missing field `{field}` for command {command}")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    /// A key is present but cannot be parsed.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The command cannot be addressed the way the message is addressed.
    #[error("command {command} cannot target protocol {protocol}")]
    InvalidTarget {
        command: &'static str,
        protocol: &'static str,
    },
}

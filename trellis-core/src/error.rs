//! Error types.
//!
//! Structural problems inside the node graph (stale handles, writes through
//! locked nodes, keys that do not exist) are absorbed by the engine and never
//! surface here. These errors cover what the caller has to act on.

use thiserror::Error;

/// Errors surfaced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A collaborator needed by the call was never supplied.
    #[error("missing configuration: {what}")]
    MissingConfiguration { what: &'static str },

    /// The previous value of a change could not be rebuilt.
    #[error("cannot rebuild previous value at path `{path}`")]
    PreviousValue { path: String },

    /// A `when` wait ended before its predicate became truthy.
    #[error("wait cancelled before the predicate became truthy")]
    Cancelled,

    /// Change records could not be encoded.
    #[error("failed to encode change records: {0}")]
    Encode(String),

    /// Change records could not be decoded.
    #[error("failed to decode change records: {0}")]
    Decode(String),

    /// Engine configuration could not be parsed.
    #[error("invalid engine configuration: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

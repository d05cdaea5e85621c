use thiserror::Error;

/// Errors raised by the iteration strategy system.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IterationError {
    /// Dot product children disagree on effective depth.
    #[error("iteration type mismatch: dot product children have effective depths {expected} and {found}")]
    TypeMismatch { expected: usize, found: usize },

    /// A named input needed to compute depth or route data is absent.
    #[error("missing iteration input '{0}'")]
    MissingInput(String),

    /// The edit would break a structural rule of the node tree.
    #[error("illegal tree state: {0}")]
    IllegalState(String),

    /// The edit would make a node its own ancestor.
    #[error("illegal tree edit: {0}")]
    IllegalArgument(String),

    #[error("unknown iteration node {0}")]
    UnknownNode(usize),

    /// A job index length differs from the one established in a cache.
    #[error("index length mismatch: cache holds length {expected}, got {found}")]
    IndexLengthMismatch { expected: usize, found: usize },

    /// An index component is larger than a cache will pad up to.
    #[error("index component {component} exceeds the limit of {limit}")]
    IndexOutOfRange { component: usize, limit: usize },
}

/// Errors from configuration parsing and validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors related to dispatch stack construction and layer configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// The layer rejected a configuration; its previous one is still live.
    #[error("invalid layer configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("unknown dispatch layer type '{0}'")]
    UnknownLayer(String),

    #[error("dispatch stack requires a tokio runtime")]
    NoRuntime,
}

/// Errors related to activity lookup and construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActivityError {
    #[error("unknown activity type '{0}'")]
    UnknownActivity(String),

    #[error("invalid activity configuration: {0}")]
    InvalidConfiguration(String),
}

/// A monitorable property could not be read.
///
/// This is expected: the value may have gone stale between discovery and
/// read. Callers treat it as transient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertyError {
    #[error("no such property: {0}")]
    NoSuchProperty(String),
}

/// An observer failed to handle a monitor message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("observer failed: {0}")]
pub struct ObserverError(pub String);

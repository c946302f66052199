//! Error types for the node annotator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the provider URI, instance coordinates or node
//! name that was being processed when it failed.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for node annotator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Node write rejected because the object changed since it was read
    #[error("conflict updating node {node}: {message}")]
    Conflict {
        /// Name of the node being written
        node: String,
        /// Message returned by the API server
        message: String,
    },

    /// Provider URI could not be parsed into project, zone and instance
    #[error("failed to parse {uri:?}: {reason}")]
    MalformedProviderUri {
        /// The provider URI as reported by the node
        uri: String,
        /// What was wrong with it
        reason: String,
    },

    /// Provider URI names a provider other than GCE
    #[error("instance {uri:?} doesn't run on gce")]
    UnsupportedProvider {
        /// The provider URI as reported by the node
        uri: String,
    },

    /// Cloud inventory lookup failed
    #[error("unable to query gcp apis for {project}/{zone}/{instance}: {message}")]
    InstanceLookup {
        /// Project the instance lives in
        project: String,
        /// Zone the instance lives in
        zone: String,
        /// Instance name
        instance: String,
        /// Description of what failed
        message: String,
    },

    /// HTTP transport error outside an instance lookup (e.g. token fetch)
    #[error("http error: {message}")]
    Http {
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "informer", "controller")
        context: String,
    },
}

impl Error {
    /// Create a malformed provider URI error
    pub fn malformed(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedProviderUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported provider error
    pub fn unsupported_provider(uri: impl Into<String>) -> Self {
        Self::UnsupportedProvider { uri: uri.into() }
    }

    /// Create an instance lookup error with full coordinates
    pub fn lookup(
        project: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InstanceLookup {
            project: project.into(),
            zone: zone.into(),
            instance: instance.into(),
            message: msg.into(),
        }
    }

    /// Create a write conflict error for a node
    pub fn conflict(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create an HTTP error with the given message
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http {
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is a write conflict
    ///
    /// Conflicts are reported at a lower severity; the controller retries
    /// them exactly like every other failure.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Check if this error came from parsing the provider URI
    pub fn is_malformed_identity(&self) -> bool {
        matches!(
            self,
            Error::MalformedProviderUri { .. } | Error::UnsupportedProvider { .. }
        )
    }
}

//! Common types for the node annotator: errors, node accessors, telemetry

#![deny(missing_docs)]

pub mod error;
pub mod node;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation key holding the provider-assigned numeric instance id
pub const INSTANCE_ID_ANNOTATION_KEY: &str = "container.googleapis.com/instance_id";

/// Name of the work queue and controller, used in logs
pub const CONTROLLER_NAME: &str = "node-annotator";

/// Field manager recorded on node writes
pub const FIELD_MANAGER: &str = "node-annotator";

/// Provider URI scheme for GCE instances
pub const GCE_PROVIDER_SCHEME: &str = "gce";

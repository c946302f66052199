//! Accessors for the node fields the annotator reads
//!
//! `k8s_openapi` models every field as optional; these helpers collapse the
//! nesting so callers can compare values directly.

use k8s_openapi::api::core::v1::Node;

use crate::INSTANCE_ID_ANNOTATION_KEY;

/// Boot id reported by the kubelet, empty if not yet reported
pub fn boot_id(node: &Node) -> &str {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|info| info.boot_id.as_str())
        .unwrap_or_default()
}

/// Provider URI (`spec.providerID`), empty if unset
pub fn provider_id(node: &Node) -> &str {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .unwrap_or_default()
}

/// Currently stored instance id annotation, if any
pub fn instance_id(node: &Node) -> Option<&str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(INSTANCE_ID_ANNOTATION_KEY))
        .map(String::as_str)
}

/// True if the node carries at least one annotation
pub fn has_annotations(node: &Node) -> bool {
    node.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| !a.is_empty())
}

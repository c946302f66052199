//! Cluster API access for node writes

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};

use node_annotator_common::{Error, Result, FIELD_MANAGER};

#[cfg(test)]
use mockall::automock;

/// Trait abstracting node writes
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Replace a node, guarded by its `resourceVersion`
    ///
    /// Fails with [`Error::Conflict`] if the node changed since it was read.
    async fn replace_node(&self, node: &Node) -> Result<Node>;
}

/// Real Kubernetes client implementation
pub struct KubeNodeClient {
    client: Client,
}

impl KubeNodeClient {
    /// Create a new KubeNodeClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let name = node.name_any();
        let api: Api<Node> = Api::all(self.client.clone());
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        match api.replace(&name, &params, node).await {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::conflict(name, e.message)),
            Err(e) => Err(e.into()),
        }
    }
}

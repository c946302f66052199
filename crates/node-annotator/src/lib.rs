//! Node annotator
//!
//! This controller watches Kubernetes nodes and:
//! - Resolves each node's `gce://` provider URI to the instance's numeric id
//! - Writes that id to the `container.googleapis.com/instance_id` annotation
//! - Re-verifies the annotation whenever a node's boot id changes

pub mod controller;
pub mod informer;
pub mod inventory;
pub mod nodes;
pub mod queue;
pub mod resolver;

pub use controller::{NodeAnnotator, SyncOutcome};
pub use informer::{NodeCache, NodeEventHandler, NodeInformer, NodeStore};
pub use inventory::{GceInventory, InstanceInventory, InstanceRecord};
pub use nodes::{KubeNodeClient, NodeClient};
pub use queue::WorkQueue;
pub use resolver::{IdentityResolver, InstanceRef};

//! Node annotation controller
//!
//! Keeps the `container.googleapis.com/instance_id` annotation on every node
//! equal to the numeric id GCE assigns to the backing instance.
//!
//! ## Triggers
//!
//! - Node added: always reconciled.
//! - Node updated: reconciled only if `status.nodeInfo.bootID` changed, which
//!   signals the machine restarted and its identity should be re-verified.
//!
//! ## Failure handling
//!
//! Every failure (bad provider URI, inventory lookup, rejected write) is
//! logged and the node is retried with per-node exponential backoff. A node
//! that disappeared from the cache is finished, not failed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use node_annotator_common::node::{boot_id, has_annotations, instance_id, provider_id};
use node_annotator_common::{Error, Result, CONTROLLER_NAME, INSTANCE_ID_ANNOTATION_KEY};

use crate::informer::{NodeCache, NodeEventHandler};
use crate::inventory::InstanceInventory;
use crate::nodes::NodeClient;
use crate::queue::{BackoffConfig, WorkQueue};
use crate::resolver::IdentityResolver;

/// How often to check whether the node cache has synced
const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delay before restarting a worker whose loop exited unexpectedly
const WORKER_RESTART_PERIOD: Duration = Duration::from_secs(1);

/// Result of a successful sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The node is no longer in the cache
    NodeGone,
    /// The stored annotation already matches the instance id
    Unchanged,
    /// The annotation was written with this instance id
    Annotated(String),
}

/// Reconciles the instance id annotation for queued nodes
pub struct NodeAnnotator {
    nodes: Arc<dyn NodeClient>,
    cache: Arc<dyn NodeCache>,
    resolver: IdentityResolver,
    queue: WorkQueue<String>,
}

impl NodeAnnotator {
    /// Create an annotator with the default backoff (200ms doubling up to 1000s)
    pub fn new(
        nodes: Arc<dyn NodeClient>,
        cache: Arc<dyn NodeCache>,
        inventory: Arc<dyn InstanceInventory>,
    ) -> Self {
        Self::with_backoff(nodes, cache, inventory, BackoffConfig::default())
    }

    /// Create an annotator with custom retry backoff
    pub fn with_backoff(
        nodes: Arc<dyn NodeClient>,
        cache: Arc<dyn NodeCache>,
        inventory: Arc<dyn InstanceInventory>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            nodes,
            cache,
            resolver: IdentityResolver::new(inventory),
            queue: WorkQueue::with_backoff(CONTROLLER_NAME, backoff),
        }
    }

    /// The work queue feeding this annotator
    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Queue a node for reconciliation, keyed by name
    pub fn enqueue(&self, node: &Node) {
        match node.metadata.name.as_deref() {
            Some(name) if !name.is_empty() => self.queue.add(name.to_string()),
            _ => error!(
                uid = ?node.metadata.uid,
                "Couldn't get key for node without a name"
            ),
        }
    }

    /// Run `workers` reconciliation loops until `shutdown` fires
    ///
    /// Waits for the node cache to sync first. Returns `Ok` without starting
    /// workers if shutdown fires during that wait, and an error if
    /// `cache_sync_timeout` elapses. On shutdown the queue stops handing out
    /// keys and in-flight syncs are allowed to finish.
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        cache_sync_timeout: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if workers == 0 {
            return Err(Error::config("at least one worker is required"));
        }

        info!(controller = CONTROLLER_NAME, "Waiting for node cache to sync");
        if !self
            .wait_for_cache_sync(cache_sync_timeout, &shutdown)
            .await?
        {
            info!(controller = CONTROLLER_NAME, "Shutdown before cache sync, exiting");
            return Ok(());
        }

        info!(controller = CONTROLLER_NAME, workers, "Starting workers");
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let this = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.supervise_worker(id, shutdown).await })
            })
            .collect();

        shutdown.cancelled().await;
        info!(controller = CONTROLLER_NAME, "Shutting down, draining in-flight work");
        self.queue.shut_down();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }

        info!(controller = CONTROLLER_NAME, "All workers stopped");
        Ok(())
    }

    /// Returns true once synced, false if shutdown fired first
    async fn wait_for_cache_sync(
        &self,
        timeout: Option<Duration>,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut interval = tokio::time::interval(CACHE_SYNC_POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.cache.has_synced() {
                return Ok(true);
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return Err(Error::internal_with_context(
                    "controller",
                    "timed out waiting for node cache to sync",
                ));
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(false),
                _ = interval.tick() => {}
            }
        }
    }

    /// Keep one worker loop alive until the queue shuts down
    async fn supervise_worker(self: Arc<Self>, id: usize, shutdown: CancellationToken) {
        loop {
            let this = Arc::clone(&self);
            let result = tokio::spawn(async move {
                while this.process_next_work_item().await {}
            })
            .await;

            if let Err(e) = result {
                error!(worker = id, error = %e, "Worker loop aborted");
            }
            if self.queue.is_shutting_down() || shutdown.is_cancelled() {
                debug!(worker = id, "Worker stopped");
                return;
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(WORKER_RESTART_PERIOD) => {}
            }
        }
    }

    /// Take one key off the queue and reconcile it
    ///
    /// Returns false once the queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.next().await else {
            return false;
        };
        let _done = DoneGuard {
            queue: &self.queue,
            key: &key,
        };

        match self.sync(&key).await {
            Ok(outcome) => {
                debug!(node = %key, ?outcome, "Sync complete");
                self.queue.forget(&key);
            }
            Err(e) => {
                let requeues = self.queue.num_requeues(&key);
                let queue = self.queue.name();
                if e.is_conflict() {
                    warn!(queue, node = %key, error = %e, requeues, "Sync hit a write conflict, retrying");
                } else {
                    error!(queue, node = %key, error = %e, requeues, "Sync failed");
                }
                self.queue.retry_later(key.clone());
            }
        }

        true
    }

    /// Reconcile the instance id annotation of one node
    pub async fn sync(&self, key: &str) -> Result<SyncOutcome> {
        let Some(node) = self.cache.get(key) else {
            debug!(node = %key, "Node no longer exists, nothing to do");
            return Ok(SyncOutcome::NodeGone);
        };

        let resolved = self.resolver.resolve(provider_id(&node)).await?;

        if has_annotations(&node) && instance_id(&node) == Some(resolved.as_str()) {
            // Restarted without an identity change
            debug!(node = %key, instance_id = %resolved, "Annotation up to date");
            return Ok(SyncOutcome::Unchanged);
        }

        let mut updated = (*node).clone();
        updated
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(INSTANCE_ID_ANNOTATION_KEY.to_string(), resolved.clone());

        self.nodes.replace_node(&updated).await?;

        info!(
            node = %key,
            instance_id = %resolved,
            previous = ?instance_id(&node),
            "Annotated node with instance id"
        );
        Ok(SyncOutcome::Annotated(resolved))
    }
}

impl NodeEventHandler for NodeAnnotator {
    fn on_add(&self, node: &Node) {
        self.enqueue(node);
    }

    fn on_update(&self, old: &Node, new: &Node) {
        if boot_id(old) != boot_id(new) {
            debug!(node = %new.name_any(), "Boot id changed, re-verifying identity");
            self.enqueue(new);
        }
    }
}

/// Calls `done` for a key when processing ends, including on unwind
struct DoneGuard<'a> {
    queue: &'a WorkQueue<String>,
    key: &'a String,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

//! Node informer: watch stream, local cache and change notifications
//!
//! Wraps a kube-rs `watcher` and `reflector` store. Every applied node is
//! compared against the cached copy to decide between an add and an update
//! notification. Objects delivered during a list (initial or re-list) are
//! held back until the list completes and the store has been swapped, so a
//! handler never sees a node the cache cannot serve yet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Read-only view of the locally cached nodes
pub trait NodeCache: Send + Sync {
    /// Cached node by name
    fn get(&self, name: &str) -> Option<Arc<Node>>;

    /// True once the first full list has been loaded
    fn has_synced(&self) -> bool;
}

/// Receives node change notifications from the informer
pub trait NodeEventHandler: Send + Sync {
    /// A node appeared that was not cached before
    fn on_add(&self, node: &Node);

    /// A cached node changed
    fn on_update(&self, old: &Node, new: &Node);
}

/// Shared handle on the reflector store
#[derive(Clone)]
pub struct NodeStore {
    store: Store<Node>,
    synced: Arc<AtomicBool>,
}

impl NodeCache for NodeStore {
    fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.store.get(&ObjectRef::new(name))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// Drives a node watch stream into the cache and the event handler
pub struct NodeInformer {
    writer: Writer<Node>,
    store: NodeStore,
    pending: Vec<Node>,
}

impl Default for NodeInformer {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeInformer {
    /// Create an informer with an empty cache
    pub fn new() -> Self {
        let (reader, writer) = reflector::store();
        Self {
            writer,
            store: NodeStore {
                store: reader,
                synced: Arc::new(AtomicBool::new(false)),
            },
            pending: Vec::new(),
        }
    }

    /// Cache handle for readers
    pub fn store(&self) -> NodeStore {
        self.store.clone()
    }

    /// Consume `events` until the stream ends or `shutdown` fires
    pub async fn run<S>(
        mut self,
        events: S,
        handler: Arc<dyn NodeEventHandler>,
        shutdown: CancellationToken,
    ) where
        S: Stream<Item = Result<Event<Node>, watcher::Error>>,
    {
        let mut events = std::pin::pin!(events);
        info!("Node informer started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Node informer stopping");
                    return;
                }
                event = events.next() => match event {
                    Some(Ok(event)) => self.apply(event, handler.as_ref()),
                    Some(Err(e)) => warn!(error = %e, "Node watch error, backing off"),
                    None => {
                        warn!("Node watch stream ended");
                        return;
                    }
                }
            }
        }
    }

    /// Apply one watch event to the cache and notify `handler`
    pub fn apply(&mut self, event: Event<Node>, handler: &dyn NodeEventHandler) {
        match &event {
            Event::Init => {
                debug!("Node list started");
                self.pending.clear();
                self.writer.apply_watcher_event(&event);
            }
            Event::InitApply(node) => {
                self.pending.push(node.clone());
                self.writer.apply_watcher_event(&event);
            }
            Event::InitDone => {
                // Pair each listed node with its pre-list copy before the swap
                let listed: Vec<(Option<Arc<Node>>, Node)> = self
                    .pending
                    .drain(..)
                    .map(|node| (self.store.store.get(&ObjectRef::from_obj(&node)), node))
                    .collect();

                self.writer.apply_watcher_event(&event);
                if !self.store.synced.swap(true, Ordering::AcqRel) {
                    info!(nodes = listed.len(), "Node cache synced");
                }

                for (old, new) in listed {
                    notify(handler, old.as_deref(), &new);
                }
            }
            Event::Apply(node) => {
                let old = self.store.store.get(&ObjectRef::from_obj(node));
                self.writer.apply_watcher_event(&event);
                notify(handler, old.as_deref(), node);
            }
            Event::Delete(node) => {
                debug!(node = %node.name_any(), "Node deleted");
                self.writer.apply_watcher_event(&event);
            }
        }
    }
}

fn notify(handler: &dyn NodeEventHandler, old: Option<&Node>, new: &Node) {
    match old {
        Some(old) => handler.on_update(old, new),
        None => handler.on_add(new),
    }
}

/// Watch stream over all nodes with the default reconnect backoff
pub fn watch_nodes(
    client: Client,
) -> impl Stream<Item = Result<Event<Node>, watcher::Error>> + Send {
    let api: Api<Node> = Api::all(client);
    watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)).default_backoff()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeStatus, NodeSystemInfo};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use parking_lot::Mutex;

    fn node(name: &str, boot_id: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    boot_id: boot_id.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    #[derive(Debug, PartialEq)]
    enum Seen {
        Add(String),
        Update(String, String),
    }

    /// Records notifications and whether the cache could serve the node
    struct Recorder {
        store: NodeStore,
        seen: Mutex<Vec<Seen>>,
        cached_at_dispatch: Mutex<Vec<bool>>,
    }

    impl Recorder {
        fn new(store: NodeStore) -> Self {
            Self {
                store,
                seen: Mutex::new(Vec::new()),
                cached_at_dispatch: Mutex::new(Vec::new()),
            }
        }
    }

    impl NodeEventHandler for Recorder {
        fn on_add(&self, node: &Node) {
            self.cached_at_dispatch
                .lock()
                .push(self.store.get(&node.name_any()).is_some());
            self.seen.lock().push(Seen::Add(node.name_any()));
        }

        fn on_update(&self, old: &Node, new: &Node) {
            self.cached_at_dispatch
                .lock()
                .push(self.store.get(&new.name_any()).is_some());
            self.seen.lock().push(Seen::Update(
                node_annotator_common::node::boot_id(old).to_string(),
                node_annotator_common::node::boot_id(new).to_string(),
            ));
        }
    }

    #[test]
    fn initial_list_dispatches_adds_after_sync() {
        let mut informer = NodeInformer::new();
        let store = informer.store();
        let recorder = Recorder::new(store.clone());

        informer.apply(Event::Init, &recorder);
        informer.apply(Event::InitApply(node("a", "b1")), &recorder);
        informer.apply(Event::InitApply(node("b", "b1")), &recorder);
        assert!(!store.has_synced());
        assert!(recorder.seen.lock().is_empty(), "held until list completes");

        informer.apply(Event::InitDone, &recorder);
        assert!(store.has_synced());
        assert_eq!(
            *recorder.seen.lock(),
            vec![Seen::Add("a".into()), Seen::Add("b".into())]
        );
        assert!(recorder.cached_at_dispatch.lock().iter().all(|c| *c));
    }

    #[test]
    fn apply_of_cached_node_is_an_update() {
        let mut informer = NodeInformer::new();
        let recorder = Recorder::new(informer.store());

        informer.apply(Event::Init, &recorder);
        informer.apply(Event::InitApply(node("a", "b1")), &recorder);
        informer.apply(Event::InitDone, &recorder);
        informer.apply(Event::Apply(node("a", "b2")), &recorder);
        informer.apply(Event::Apply(node("c", "b1")), &recorder);

        let seen = recorder.seen.lock();
        assert_eq!(seen[1], Seen::Update("b1".into(), "b2".into()));
        assert_eq!(seen[2], Seen::Add("c".into()));
        assert_eq!(
            node_annotator_common::node::boot_id(&informer.store().get("a").unwrap()),
            "b2"
        );
    }

    #[test]
    fn relist_compares_against_previous_copy() {
        let mut informer = NodeInformer::new();
        let store = informer.store();
        let recorder = Recorder::new(store.clone());

        informer.apply(Event::Init, &recorder);
        informer.apply(Event::InitApply(node("a", "b1")), &recorder);
        informer.apply(Event::InitDone, &recorder);

        informer.apply(Event::Init, &recorder);
        informer.apply(Event::InitApply(node("a", "b2")), &recorder);
        informer.apply(Event::InitDone, &recorder);

        assert_eq!(
            recorder.seen.lock().last(),
            Some(&Seen::Update("b1".into(), "b2".into()))
        );
    }

    #[test]
    fn delete_removes_without_notification() {
        let mut informer = NodeInformer::new();
        let store = informer.store();
        let recorder = Recorder::new(store.clone());

        informer.apply(Event::Init, &recorder);
        informer.apply(Event::InitApply(node("a", "b1")), &recorder);
        informer.apply(Event::InitDone, &recorder);
        informer.apply(Event::Delete(node("a", "b1")), &recorder);

        assert!(store.get("a").is_none());
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn run_consumes_stream_until_end() {
        let informer = NodeInformer::new();
        let store = informer.store();
        let recorder = Arc::new(Recorder::new(store.clone()));

        let events = futures::stream::iter(vec![
            Ok(Event::Init),
            Ok(Event::InitApply(node("a", "b1"))),
            Ok(Event::InitDone),
            Ok(Event::Apply(node("a", "b2"))),
        ]);
        informer
            .run(events, recorder.clone(), CancellationToken::new())
            .await;

        assert!(store.has_synced());
        assert_eq!(recorder.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let informer = NodeInformer::new();
        let recorder = Arc::new(Recorder::new(informer.store()));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        informer
            .run(futures::stream::pending(), recorder.clone(), shutdown)
            .await;
        assert!(recorder.seen.lock().is_empty());
    }
}

pub mod table;

use crate::cli::NodeConfig;
use crate::engine::store::LocalStore;
use async_trait::async_trait;
use ringleaf_types::errors::DhtError;
use ringleaf_types::ids::Id;
use ringleaf_types::message::{Request, Response, Status};
use ringleaf_types::peer::{Lifecycle, NodeInfo};
use ringleaf_types::{Entry, Value};
use std::io::Result as IoResult;
use std::path::PathBuf;
use std::sync::Arc;
use table::{LEAF_SET_SIZE, LeafSet, RoutingTable};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use utils::persistence::{self, Persistence};
use utils::protocol::OverlayProtocol;
use utils::server::{self, ServerHandle};

/// Routing gives up and claims the key after this many forwards; stale
/// tables must not loop forever.
pub const MAX_ROUTE_HOPS: u32 = 50;

#[derive(Debug)]
struct PastryState {
    leaf: LeafSet,
    table: RoutingTable,
}

/// A prefix-overlay node: a leaf set of numerically nearest peers plus an
/// opportunistic prefix-routing table.
///
/// Responsibility is numeric proximity: the owner of a key is the live node
/// whose id is closest to it. A fresh node has an empty leaf set and owns
/// everything; `join` seeds the tables from a bootstrap peer, announces the
/// newcomer, and pulls the keys it is now closest to.
#[derive(Debug)]
pub struct PastryNode {
    info: NodeInfo,
    state: RwLock<PastryState>,
    store: Arc<LocalStore>,
    lifecycle: RwLock<Lifecycle>,
    message_size: usize,
    snapshot_file: Option<PathBuf>,
}

impl PastryNode {
    /// Binds the listener, spawns the accept loop and (if configured) the
    /// snapshot task, and returns the running node.
    pub async fn start(config: &NodeConfig) -> IoResult<(Arc<Self>, ServerHandle)> {
        let listener =
            TcpListener::bind((config.common.host.as_str(), config.port)).await?;
        let port = listener.local_addr()?.port();
        let info = NodeInfo::new(config.common.host.clone(), port);
        let snapshot_file = config
            .common
            .persistence_target()
            .map(|dir| persistence::snapshot_path(dir, "pastry", &info.id));
        let node = Arc::new(PastryNode {
            state: RwLock::new(PastryState {
                leaf: LeafSet::default(),
                table: RoutingTable::new(info.id),
            }),
            store: Arc::new(LocalStore::new()),
            lifecycle: RwLock::new(Lifecycle::Active),
            message_size: config.common.message_size,
            snapshot_file: snapshot_file.clone(),
            info,
        });
        let handle = server::serve(listener, Arc::clone(&node));
        if let Some(path) = snapshot_file {
            persistence::remove_stale(&path);
            let task = Persistence::new(
                Arc::clone(&node.store),
                node.store.write_flag(),
                config.common.persistence_interval,
                path,
            );
            handle.spawn(task.run(handle.cancellation_token()));
        }
        Ok((node, handle))
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().await
    }

    pub async fn leaf_set(&self) -> Vec<NodeInfo> {
        self.state.read().await.leaf.members().to_vec()
    }

    pub async fn entry_count(&self) -> usize {
        self.store.len().await
    }

    pub async fn local_keys(&self) -> Vec<Id> {
        self.store.keys().await
    }

    /// Harness wiring: replace the leaf set outright from global knowledge.
    pub async fn wire_leaf_set(&self, peers: Vec<NodeInfo>) {
        let mut state = self.state.write().await;
        for peer in &peers {
            state.table.learn(peer);
        }
        state.leaf.replace(&self.info.id, peers);
    }

    /// Peer announcement: fold newly learned peers into both tables.
    async fn incorporate(&self, peers: Vec<NodeInfo>) {
        let mut state = self.state.write().await;
        for peer in &peers {
            state.table.learn(peer);
        }
        state.leaf.merge(&self.info.id, peers);
    }

    /// One routing decision: the next hop for `key`, and whether to
    /// forward at all.
    async fn route(&self, key: &Id) -> (NodeInfo, bool) {
        let state = self.state.read().await;
        // numerically closest of this node and its leaf set; self wins ties
        let mut best = self.info.clone();
        let mut best_distance = self.info.id.distance(key);
        for member in state.leaf.members() {
            let candidate_distance = member.id.distance(key);
            if candidate_distance < best_distance {
                best = member.clone();
                best_distance = candidate_distance;
            }
        }
        if best.id == self.info.id {
            return (best, false);
        }
        // a strictly longer shared prefix trumps plain proximity
        let own_len = self.info.id.shared_prefix_len(key);
        let improved = state
            .leaf
            .members()
            .iter()
            .chain(state.table.candidates())
            .filter(|candidate| candidate.id.shared_prefix_len(key) > own_len)
            .max_by_key(|candidate| {
                (
                    candidate.id.shared_prefix_len(key),
                    std::cmp::Reverse(candidate.id.distance(key)),
                )
            });
        match improved {
            Some(candidate) => (candidate.clone(), true),
            None => (best, true),
        }
    }

    /// Resolves the owner of `key`, forwarding hop by hop. Unreachable
    /// next hops and the hop bound both degrade to claiming the key here.
    pub async fn lookup_recursive(&self, key: Id, hops: u32) -> (NodeInfo, u32) {
        if hops >= MAX_ROUTE_HOPS {
            tracing::warn!(node = %self.info, key = %key, "hop bound reached, claiming key");
            return (self.info.clone(), hops);
        }
        let (next, forward) = self.route(&key).await;
        if !forward {
            return (self.info.clone(), hops);
        }
        let forwarded = self
            .call(
                &next,
                Request::LookupRecursive {
                    key_hex: key,
                    hops: hops + 1,
                },
            )
            .await
            .and_then(Response::into_owner);
        match forwarded {
            Ok(owner) => owner,
            Err(e) => {
                tracing::debug!(node = %self.info, peer = %next, error = %e,
                    "route forward failed, claiming key here");
                (self.info.clone(), hops)
            }
        }
    }

    /// Joins via `bootstrap`: adopt the nearest of its neighborhood as the
    /// leaf set, announce this node to them, pull the keys it is now
    /// closest to. Any failure reaching the bootstrap aborts the join and
    /// the node stays Dead.
    pub async fn join(&self, bootstrap: &NodeInfo) -> Result<(), DhtError> {
        self.transition(Lifecycle::Joining).await?;
        match self.join_inner(bootstrap).await {
            Ok(()) => {
                self.set_lifecycle(Lifecycle::Active).await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(node = %self.info, bootstrap = %bootstrap, error = %e, "join aborted");
                self.set_lifecycle(Lifecycle::Dead).await;
                Err(e)
            }
        }
    }

    async fn join_inner(&self, bootstrap: &NodeInfo) -> Result<(), DhtError> {
        let mut candidates = self
            .call(bootstrap, Request::GetLeafSet {})
            .await?
            .into_leaf_set()?;
        candidates.push(bootstrap.clone());
        let leaf = LeafSet::from_candidates(&self.info.id, candidates.iter().cloned(), LEAF_SET_SIZE);
        {
            let mut state = self.state.write().await;
            for candidate in &candidates {
                state.table.learn(candidate);
            }
            state.leaf = leaf.clone();
        }
        for neighbor in leaf.members() {
            if let Err(e) = self
                .call(
                    neighbor,
                    Request::UpdateLeafSet {
                        leaf_set: vec![self.info.clone()],
                    },
                )
                .await
            {
                tracing::warn!(node = %self.info, neighbor = %neighbor, error = %e,
                    "could not announce to neighbor");
            }
        }
        let mut moved = 0;
        for neighbor in leaf.members() {
            match self
                .call(
                    neighbor,
                    Request::TransferKeys {
                        node: self.info.clone(),
                    },
                )
                .await
                .and_then(Response::into_entries)
            {
                Ok(entries) => {
                    moved += entries.len();
                    for entry in entries {
                        self.store.insert(entry.key, entry.data).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(node = %self.info, neighbor = %neighbor, error = %e,
                        "handoff pull failed");
                }
            }
        }
        tracing::info!(node = %self.info, neighbors = leaf.len(), moved, "joined overlay");
        Ok(())
    }

    /// Departs: push every entry to the numerically nearest neighbor,
    /// clear, Dead. Peers keep their (now stale) references to this node;
    /// routing tolerates them through its transport fallback.
    pub async fn leave(&self) -> Result<(), DhtError> {
        self.transition(Lifecycle::Departing).await?;
        let target = {
            let state = self.state.read().await;
            state.leaf.closest_to(&self.info.id).cloned()
        };
        if let Some(target) = target {
            for entry in self.store.entries().await {
                if let Err(e) = self
                    .call(
                        &target,
                        Request::InsertLocal {
                            key: entry.key,
                            data: entry.data,
                        },
                    )
                    .await
                {
                    tracing::warn!(node = %self.info, key = %entry.key, error = %e,
                        "handoff insert failed, entry lost");
                }
            }
        }
        self.store.clear().await;
        if let Some(path) = &self.snapshot_file {
            persistence::remove_stale(path);
        }
        self.set_lifecycle(Lifecycle::Dead).await;
        tracing::info!(node = %self.info, "left overlay");
        Ok(())
    }

    /// Entries the joiner is strictly closer to than this node.
    async fn hand_off(&self, joiner: &NodeInfo) -> Vec<Entry> {
        if joiner.id == self.info.id {
            return Vec::new();
        }
        let own = self.info.id;
        let joiner = joiner.id;
        self.store
            .take_where(move |key| joiner.distance(key) < own.distance(key))
            .await
    }

    // Data operations: hash the title, resolve the owner by recursive
    // routing, fire the local-index verb at it.

    pub async fn insert_key(&self, title: &str, data: Value) -> Result<(), DhtError> {
        self.ensure_routable().await?;
        let key = Id::hash_of(title);
        let (owner, _) = self.lookup_recursive(key, 0).await;
        if let Err(e) = self.call(&owner, Request::InsertLocal { key, data }).await {
            tracing::warn!(node = %self.info, title, error = %e, "insert did not reach the owner");
        }
        Ok(())
    }

    pub async fn update_key(&self, title: &str, data: Value) -> Result<(), DhtError> {
        // an update is an overwriting insert
        self.insert_key(title, data).await
    }

    /// Returns `(value_or_none, hops)` with the routing hop count. An
    /// unreachable owner degrades to a miss, never an error.
    pub async fn lookup_key(&self, title: &str) -> Result<(Option<Value>, u32), DhtError> {
        self.ensure_routable().await?;
        let key = Id::hash_of(title);
        let (owner, hops) = self.lookup_recursive(key, 0).await;
        match self
            .call(&owner, Request::LookupLocal { key })
            .await
            .and_then(Response::into_fetched)
        {
            Ok((val, _)) => Ok((val, hops)),
            Err(e) => {
                tracing::warn!(node = %self.info, title, owner = %owner, error = %e,
                    "owner fetch failed");
                Ok((None, hops))
            }
        }
    }

    /// True when the owner acknowledged a deletion.
    pub async fn delete_key(&self, title: &str) -> Result<bool, DhtError> {
        self.ensure_routable().await?;
        let key = Id::hash_of(title);
        let (owner, _) = self.lookup_recursive(key, 0).await;
        match self
            .call(&owner, Request::DeleteLocal { key })
            .await
            .and_then(Response::into_status)
        {
            Ok(Status::Ok) => Ok(true),
            Ok(_) => Ok(false),
            Err(e) => {
                tracing::warn!(node = %self.info, title, error = %e, "delete did not reach the owner");
                Ok(false)
            }
        }
    }

    async fn ensure_routable(&self) -> Result<(), DhtError> {
        let lifecycle = *self.lifecycle.read().await;
        if lifecycle == Lifecycle::Dead {
            return Err(DhtError::BadState(lifecycle));
        }
        Ok(())
    }

    async fn transition(&self, next: Lifecycle) -> Result<(), DhtError> {
        let mut lifecycle = self.lifecycle.write().await;
        if *lifecycle == Lifecycle::Dead {
            return Err(DhtError::BadState(*lifecycle));
        }
        *lifecycle = next;
        Ok(())
    }

    async fn set_lifecycle(&self, next: Lifecycle) {
        *self.lifecycle.write().await = next;
    }
}

#[async_trait]
impl OverlayProtocol for PastryNode {
    fn node_info(&self) -> &NodeInfo {
        &self.info
    }

    fn max_message_size(&self) -> usize {
        self.message_size
    }

    #[tracing::instrument(skip(self, request), fields(node = %self.info, command = request.command()))]
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Route { key_hex } => {
                let (node, forward) = self.route(&key_hex).await;
                Response::Route { node, forward }
            }
            Request::LookupRecursive { key_hex, hops } => {
                let (node, hops) = self.lookup_recursive(key_hex, hops).await;
                Response::Owner { node, hops }
            }
            Request::GetLeafSet {} => Response::LeafSet {
                leaf_set: self.leaf_set().await,
            },
            Request::UpdateLeafSet { leaf_set } => {
                self.incorporate(leaf_set).await;
                Response::ok()
            }
            Request::InsertLocal { key, data } | Request::Update { key, data } => {
                self.store.insert(key, data).await;
                Response::ok()
            }
            Request::LookupLocal { key } => Response::Fetched {
                val: self.store.get(&key).await,
                hops: 0,
            },
            Request::DeleteLocal { key } => {
                if self.store.remove(&key).await {
                    Response::ok()
                } else {
                    Response::not_found()
                }
            }
            Request::TransferKeys { node } => Response::Entries {
                entries: self.hand_off(&node).await,
            },
            other => {
                tracing::warn!(node = %self.info, command = other.command(),
                    "verb not supported by this overlay");
                Response::error()
            }
        }
    }
}

use crate::cli::NodeConfig;
use crate::engine::store::LocalStore;
use async_trait::async_trait;
use ringleaf_types::errors::DhtError;
use ringleaf_types::ids::{self, ID_BITS, Id};
use ringleaf_types::message::{Request, Response, Status};
use ringleaf_types::peer::{Lifecycle, NodeInfo};
use ringleaf_types::{Entry, Value};
use std::io::Result as IoResult;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use utils::persistence::{self, Persistence};
use utils::protocol::OverlayProtocol;
use utils::server::{self, ServerHandle};

/// One finger per bit of the identifier space.
pub const FINGER_COUNT: usize = ID_BITS as usize;

#[derive(Debug)]
struct ChordState {
    successor: NodeInfo,
    predecessor: Option<NodeInfo>,
    fingers: Vec<Option<NodeInfo>>,
}

/// A ring-overlay node: successor/predecessor pointers plus a finger table
/// at exponentially growing offsets.
///
/// A freshly started node is a one-member ring (its own successor) and
/// immediately Active. Rings grow either through `join` against a live
/// bootstrap member or through the `wire_*` setters when a harness lays the
/// ring out from global knowledge.
#[derive(Debug)]
pub struct ChordNode {
    info: NodeInfo,
    state: RwLock<ChordState>,
    store: Arc<LocalStore>,
    lifecycle: RwLock<Lifecycle>,
    message_size: usize,
    snapshot_file: Option<PathBuf>,
}

impl ChordNode {
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
            .map(|dir| persistence::snapshot_path(dir, "chord", &info.id));
        let node = Arc::new(ChordNode {
            state: RwLock::new(ChordState {
                successor: info.clone(),
                predecessor: None,
                fingers: vec![None; FINGER_COUNT],
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

    pub async fn successor(&self) -> NodeInfo {
        self.state.read().await.successor.clone()
    }

    pub async fn predecessor(&self) -> Option<NodeInfo> {
        self.state.read().await.predecessor.clone()
    }

    pub async fn entry_count(&self) -> usize {
        self.store.len().await
    }

    pub async fn local_keys(&self) -> Vec<Id> {
        self.store.keys().await
    }

    // Harness wiring: a benchmark that knows the whole membership lays the
    // ring out directly instead of stabilizing through joins.

    pub async fn wire_successor(&self, node: NodeInfo) {
        self.state.write().await.successor = node;
    }

    pub async fn wire_predecessor(&self, node: Option<NodeInfo>) {
        self.state.write().await.predecessor = node;
    }

    pub async fn wire_finger(&self, index: usize, node: NodeInfo) {
        self.state.write().await.fingers[index] = Some(node);
    }

    /// Resolves the node responsible for `key`, counting RPC hops.
    ///
    /// A transport failure on the forwarding path degrades to the local
    /// successor: a possibly stale answer, never an error.
    pub async fn find_successor(&self, key: Id, hops: u32) -> (NodeInfo, u32) {
        let successor = self.successor().await;
        if ids::in_ring(&key, &self.info.id, &successor.id, true) {
            return (successor, hops + 1);
        }
        let next = self.closest_preceding_node(&key).await;
        if next.id == self.info.id {
            // no finger improves on us: the ring wraps here
            return (successor, hops + 1);
        }
        let forwarded = self
            .call(&next, Request::FindSuccessor { key, hops: hops + 1 })
            .await
            .and_then(Response::into_owner);
        match forwarded {
            Ok(owner) => owner,
            Err(e) => {
                tracing::debug!(node = %self.info, peer = %next, error = %e,
                    "find_successor forward failed, answering with local successor");
                (successor, hops + 1)
            }
        }
    }

    /// Highest finger strictly between this node and `key`, or this node.
    async fn closest_preceding_node(&self, key: &Id) -> NodeInfo {
        let state = self.state.read().await;
        for finger in state.fingers.iter().rev().flatten() {
            if ids::in_ring(&finger.id, &self.info.id, key, false) {
                return finger.clone();
            }
        }
        self.info.clone()
    }

    /// Repoints every finger by resolving its target through the ring.
    pub async fn fix_fingers(&self) {
        let mut fingers = Vec::with_capacity(FINGER_COUNT);
        for exp in 0..FINGER_COUNT as u32 {
            let target = self.info.id.add_pow2(exp);
            let (owner, _) = self.find_successor(target, 0).await;
            fingers.push(Some(owner));
        }
        self.state.write().await.fingers = fingers;
    }

    /// Joins the ring known to `bootstrap`: locate the successor, patch
    /// both neighbors, rebuild fingers, pull the owned key range. Any RPC
    /// failure aborts the join and the node stays Dead.
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
        let (successor, _) = self
            .call(
                bootstrap,
                Request::FindSuccessor {
                    key: self.info.id,
                    hops: 0,
                },
            )
            .await?
            .into_owner()?;
        let predecessor = self
            .call(&successor, Request::GetPredecessor {})
            .await?
            .into_predecessor()?
            // a standalone bootstrap has no predecessor yet: it is both
            .unwrap_or_else(|| successor.clone());
        {
            let mut state = self.state.write().await;
            state.successor = successor.clone();
            state.predecessor = Some(predecessor.clone());
        }
        self.call(
            &successor,
            Request::SetPredecessor {
                node: Some(self.info.clone()),
            },
        )
        .await?;
        self.call(
            &predecessor,
            Request::SetSuccessor {
                node: self.info.clone(),
            },
        )
        .await?;
        self.fix_fingers().await;
        let entries = self
            .call(
                &successor,
                Request::TransferKeys {
                    node: self.info.clone(),
                },
            )
            .await?
            .into_entries()?;
        let moved = entries.len();
        for entry in entries {
            self.store.insert(entry.key, entry.data).await;
        }
        tracing::info!(node = %self.info, successor = %successor, predecessor = %predecessor,
            moved, "joined ring");
        Ok(())
    }

    /// Departs the ring: push all entries to the successor, patch the
    /// neighbors around the gap, clear, Dead. Handoff is best-effort per
    /// entry; a dead neighbor cannot block the departure.
    pub async fn leave(&self) -> Result<(), DhtError> {
        self.transition(Lifecycle::Departing).await?;
        let (successor, predecessor) = {
            let state = self.state.read().await;
            (state.successor.clone(), state.predecessor.clone())
        };
        if successor.id != self.info.id {
            for entry in self.store.entries().await {
                if let Err(e) = self
                    .call(
                        &successor,
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
            if let Err(e) = self
                .call(
                    &successor,
                    Request::SetPredecessor {
                        node: predecessor.clone(),
                    },
                )
                .await
            {
                tracing::warn!(node = %self.info, error = %e, "could not patch successor");
            }
        }
        if let Some(predecessor) = predecessor {
            if predecessor.id != self.info.id {
                if let Err(e) = self
                    .call(
                        &predecessor,
                        Request::SetSuccessor {
                            node: successor.clone(),
                        },
                    )
                    .await
                {
                    tracing::warn!(node = %self.info, error = %e, "could not patch predecessor");
                }
            }
        }
        self.store.clear().await;
        if let Some(path) = &self.snapshot_file {
            persistence::remove_stale(path);
        }
        self.set_lifecycle(Lifecycle::Dead).await;
        tracing::info!(node = %self.info, "left ring");
        Ok(())
    }

    /// Adopts `candidate` as predecessor when it is a strict improvement.
    async fn notify(&self, candidate: NodeInfo) {
        let mut state = self.state.write().await;
        let adopt = match &state.predecessor {
            None => true,
            Some(current) => ids::in_ring(&candidate.id, &current.id, &self.info.id, false),
        };
        if adopt {
            state.predecessor = Some(candidate);
        }
    }

    /// Entries the joiner is now responsible for: everything outside this
    /// node's remaining range `(joiner, self]`.
    async fn hand_off(&self, joiner: &NodeInfo) -> Vec<Entry> {
        if joiner.id == self.info.id {
            return Vec::new();
        }
        let own = self.info.id;
        let joiner = joiner.id;
        self.store
            .take_where(move |key| !ids::in_ring(key, &joiner, &own, true))
            .await
    }

    // Data operations: hash the title, resolve the owner, fire the
    // local-index verb at it.

    pub async fn insert_key(&self, title: &str, data: Value) -> Result<(), DhtError> {
        self.ensure_routable().await?;
        let key = Id::hash_of(title);
        let (owner, _) = self.find_successor(key, 0).await;
        if let Err(e) = self.call(&owner, Request::InsertLocal { key, data }).await {
            tracing::warn!(node = %self.info, title, error = %e, "insert did not reach the owner");
        }
        Ok(())
    }

    pub async fn update_key(&self, title: &str, data: Value) -> Result<(), DhtError> {
        // an update is an overwriting insert
        self.insert_key(title, data).await
    }

    /// Returns `(value_or_none, hops)`: routing hops plus the owner fetch.
    /// An unreachable owner degrades to a miss, never an error.
    pub async fn lookup_key(&self, title: &str) -> Result<(Option<Value>, u32), DhtError> {
        self.ensure_routable().await?;
        let key = Id::hash_of(title);
        let (owner, hops) = self.find_successor(key, 0).await;
        match self
            .call(&owner, Request::LookupLocal { key })
            .await
            .and_then(Response::into_fetched)
        {
            Ok((val, fetch_hops)) => Ok((val, hops + fetch_hops)),
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
        let (owner, _) = self.find_successor(key, 0).await;
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
impl OverlayProtocol for ChordNode {
    fn node_info(&self) -> &NodeInfo {
        &self.info
    }

    fn max_message_size(&self) -> usize {
        self.message_size
    }

    #[tracing::instrument(skip(self, request), fields(node = %self.info, command = request.command()))]
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::FindSuccessor { key, hops } => {
                let (node, hops) = self.find_successor(key, hops).await;
                Response::Owner { node, hops }
            }
            Request::GetPredecessor {} => Response::Predecessor(self.predecessor().await),
            Request::SetPredecessor { node } => {
                self.wire_predecessor(node).await;
                Response::ok()
            }
            Request::SetSuccessor { node } => {
                self.wire_successor(node).await;
                Response::ok()
            }
            Request::Notify { node } => {
                self.notify(node).await;
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

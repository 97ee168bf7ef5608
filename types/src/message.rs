use crate::errors::DhtError;
use crate::ids::Id;
use crate::keyval::{Entry, Value};
use crate::peer::NodeInfo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Big-endian byte length of the JSON body, written before it.
pub const LENGTH_HEADER_SIZE: usize = 4;

/// One RPC request: `{"command": <verb>, "payload": {...}}` on the wire.
///
/// Identifiers travel as 40-digit lowercase hex strings; both overlays use
/// the same envelope, and verbs a node does not implement are answered with
/// an error status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum Request {
    FindSuccessor {
        key: Id,
        #[serde(default)]
        hops: u32,
    },
    GetPredecessor {},
    SetPredecessor {
        // a departing node may hand over an absent predecessor
        node: Option<NodeInfo>,
    },
    SetSuccessor {
        node: NodeInfo,
    },
    Notify {
        node: NodeInfo,
    },
    Route {
        key_hex: Id,
    },
    LookupRecursive {
        key_hex: Id,
        #[serde(default)]
        hops: u32,
    },
    GetLeafSet {},
    UpdateLeafSet {
        leaf_set: Vec<NodeInfo>,
    },
    InsertLocal {
        key: Id,
        data: Value,
    },
    /// Alias verb for `insert_local`; overwrite semantics are identical.
    Update {
        key: Id,
        data: Value,
    },
    LookupLocal {
        key: Id,
    },
    DeleteLocal {
        key: Id,
    },
    TransferKeys {
        node: NodeInfo,
    },
}

impl Request {
    /// Wire verb, for logs.
    pub fn command(&self) -> &'static str {
        match self {
            Request::FindSuccessor { .. } => "find_successor",
            Request::GetPredecessor {} => "get_predecessor",
            Request::SetPredecessor { .. } => "set_predecessor",
            Request::SetSuccessor { .. } => "set_successor",
            Request::Notify { .. } => "notify",
            Request::Route { .. } => "route",
            Request::LookupRecursive { .. } => "lookup_recursive",
            Request::GetLeafSet {} => "get_leaf_set",
            Request::UpdateLeafSet { .. } => "update_leaf_set",
            Request::InsertLocal { .. } => "insert_local",
            Request::Update { .. } => "update",
            Request::LookupLocal { .. } => "lookup_local",
            Request::DeleteLocal { .. } => "delete_local",
            Request::TransferKeys { .. } => "transfer_keys",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    NotFound,
    Error,
}

/// One RPC response. Untagged: each verb has a fixed shape and the field
/// sets are pairwise distinct, so variant order below only breaks ties for
/// bodies with omitted optional fields (`Owner` before `Fetched`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Owner { node: NodeInfo, hops: u32 },
    Route { node: NodeInfo, forward: bool },
    Fetched { val: Option<Value>, hops: u32 },
    LeafSet { leaf_set: Vec<NodeInfo> },
    Entries { entries: Vec<Entry> },
    Status { status: Status },
    Predecessor(Option<NodeInfo>),
}

impl Response {
    pub fn ok() -> Self {
        Response::Status { status: Status::Ok }
    }

    pub fn not_found() -> Self {
        Response::Status {
            status: Status::NotFound,
        }
    }

    pub fn error() -> Self {
        Response::Status {
            status: Status::Error,
        }
    }

    pub fn into_owner(self) -> Result<(NodeInfo, u32), DhtError> {
        match self {
            Response::Owner { node, hops } => Ok((node, hops)),
            other => Err(unexpected("owner", &other)),
        }
    }

    pub fn into_route(self) -> Result<(NodeInfo, bool), DhtError> {
        match self {
            Response::Route { node, forward } => Ok((node, forward)),
            other => Err(unexpected("route", &other)),
        }
    }

    pub fn into_fetched(self) -> Result<(Option<Value>, u32), DhtError> {
        match self {
            Response::Fetched { val, hops } => Ok((val, hops)),
            other => Err(unexpected("fetched value", &other)),
        }
    }

    pub fn into_leaf_set(self) -> Result<Vec<NodeInfo>, DhtError> {
        match self {
            Response::LeafSet { leaf_set } => Ok(leaf_set),
            other => Err(unexpected("leaf set", &other)),
        }
    }

    pub fn into_entries(self) -> Result<Vec<Entry>, DhtError> {
        match self {
            Response::Entries { entries } => Ok(entries),
            other => Err(unexpected("entries", &other)),
        }
    }

    pub fn into_status(self) -> Result<Status, DhtError> {
        match self {
            Response::Status { status } => Ok(status),
            other => Err(unexpected("status", &other)),
        }
    }

    pub fn into_predecessor(self) -> Result<Option<NodeInfo>, DhtError> {
        match self {
            Response::Predecessor(node) => Ok(node),
            other => Err(unexpected("predecessor", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Response) -> DhtError {
    DhtError::Protocol(format!("expected {wanted} response, got {got:?}"))
}

/// Length-framed JSON encoding shared by requests and responses.
///
/// A frame is the 4-byte big-endian body length followed by the UTF-8 JSON
/// body; `from_bytes` takes the body alone.
pub trait WireMessage: Serialize + DeserializeOwned {
    fn to_frame(&self) -> Result<Vec<u8>, DhtError> {
        let body =
            serde_json::to_vec(self).map_err(|e| DhtError::Protocol(format!("encode: {e}")))?;
        let mut buffer = Vec::with_capacity(LENGTH_HEADER_SIZE + body.len());
        buffer.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buffer.extend_from_slice(&body);
        Ok(buffer)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        serde_json::from_slice(bytes).map_err(|e| DhtError::Protocol(format!("decode: {e}")))
    }
}

impl WireMessage for Request {}
impl WireMessage for Response {}

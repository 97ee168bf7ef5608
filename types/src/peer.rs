use crate::errors::DhtError;
use crate::ids::Id;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Address record for an overlay member, carried by value in every RPC.
///
/// Identity is the id alone: two records pointing at the same position in
/// the ring are the same peer, whatever address metadata they carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: Id,
    pub host: String,
    pub port: u16,
}

impl NodeInfo {
    /// Builds the record for a listening endpoint, deriving the id from
    /// the `host:port` string.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let id = Id::hash_of(&format!("{host}:{port}"));
        NodeInfo { id, host, port }
    }

    /// Parses `host:port`, e.g. a `--bootstrap` argument.
    pub fn from_addr(addr: &str) -> Result<Self, DhtError> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| DhtError::BadAddress(addr.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| DhtError::BadAddress(addr.to_string()))?;
        if host.is_empty() {
            return Err(DhtError::BadAddress(addr.to_string()));
        }
        Ok(NodeInfo::new(host, port))
    }

    /// Dialable `host:port` form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeInfo {}

impl Hash for NodeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, &self.id.to_hex()[..10])
    }
}

/// Membership phase of a node.
///
/// Routing through a Dead node is a caller bug and is rejected with
/// `DhtError::BadState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Joining,
    Active,
    Departing,
    Dead,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Joining => "joining",
            Lifecycle::Active => "active",
            Lifecycle::Departing => "departing",
            Lifecycle::Dead => "dead",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn id_is_derived_from_endpoint() {
        let a = NodeInfo::new("127.0.0.1", 4411);
        assert_eq!(a.id, Id::hash_of("127.0.0.1:4411"));
        assert_eq!(a.addr(), "127.0.0.1:4411");
    }

    #[test]
    fn equality_ignores_address_metadata() {
        let a = NodeInfo::new("127.0.0.1", 4411);
        let mut b = a.clone();
        b.host = "localhost".into();
        assert_eq!(a, b);
    }

    #[test]
    fn from_addr_parses_and_rejects() {
        let parsed = NodeInfo::from_addr("127.0.0.1:9000").unwrap();
        assert_eq!(parsed, NodeInfo::new("127.0.0.1", 9000));
        assert!(NodeInfo::from_addr("no-port").is_err());
        assert!(NodeInfo::from_addr(":9000").is_err());
        assert!(NodeInfo::from_addr("host:notaport").is_err());
    }
}

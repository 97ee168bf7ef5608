use itertools::Itertools;
use ringleaf_types::ids::{ID_HEX_DIGITS, Id};
use ringleaf_types::peer::NodeInfo;

/// Target leaf-set size when built from join candidates: the nearest half
/// below and half above the owner.
pub const LEAF_SET_SIZE: usize = 4;

/// The numerically nearest known peers, kept sorted by id.
///
/// Capacity applies only when the set is assembled from join candidates;
/// merges (peer announcements, harness wiring) accumulate without
/// truncation, so a densely wired testbed can hold the whole membership.
#[derive(Debug, Clone, Default)]
pub struct LeafSet {
    members: Vec<NodeInfo>,
}

impl LeafSet {
    /// Picks `capacity` neighbors for `own` out of `candidates`: the
    /// nearest half on each side, spilling across when one side is short.
    pub fn from_candidates(
        own: &Id,
        candidates: impl IntoIterator<Item = NodeInfo>,
        capacity: usize,
    ) -> Self {
        let by_distance: Vec<NodeInfo> = candidates
            .into_iter()
            .filter(|candidate| candidate.id != *own)
            .unique()
            .sorted_by_key(|candidate| candidate.id.distance(own))
            .collect();
        let half = capacity / 2;
        let lower_count = by_distance.iter().filter(|c| c.id < *own).count();
        let upper_count = by_distance.len() - lower_count;
        let (mut lower_quota, mut upper_quota) = (half, capacity - half);
        // spill unused quota to the other side
        if lower_count < lower_quota {
            upper_quota += lower_quota - lower_count;
            lower_quota = lower_count;
        } else if upper_count < upper_quota {
            lower_quota += upper_quota - upper_count;
            upper_quota = upper_count;
        }
        let mut members: Vec<NodeInfo> = Vec::with_capacity(capacity);
        for candidate in by_distance {
            let quota = if candidate.id < *own {
                &mut lower_quota
            } else {
                &mut upper_quota
            };
            if *quota > 0 {
                *quota -= 1;
                members.push(candidate);
            }
        }
        members.sort_by_key(|member| member.id);
        LeafSet { members }
    }

    /// Replaces the whole set; the harness wiring path.
    pub fn replace(&mut self, own: &Id, peers: impl IntoIterator<Item = NodeInfo>) {
        self.members = peers
            .into_iter()
            .filter(|peer| peer.id != *own)
            .unique()
            .sorted_by_key(|peer| peer.id)
            .collect();
    }

    /// Adds unknown peers in id order; the announcement path.
    pub fn merge(&mut self, own: &Id, peers: impl IntoIterator<Item = NodeInfo>) {
        for peer in peers {
            if peer.id == *own || self.members.iter().any(|m| m.id == peer.id) {
                continue;
            }
            let pos = self.members.partition_point(|m| m.id < peer.id);
            self.members.insert(pos, peer);
        }
    }

    pub fn members(&self) -> &[NodeInfo] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Member numerically closest to `target`.
    pub fn closest_to(&self, target: &Id) -> Option<&NodeInfo> {
        self.members
            .iter()
            .min_by_key(|member| member.id.distance(target))
    }
}

/// Prefix-routing rows: one candidate per (shared-prefix-length, next-digit)
/// cell. Populated opportunistically from every peer this node learns of;
/// the first occupant of a cell keeps it.
#[derive(Debug)]
pub struct RoutingTable {
    owner: Id,
    rows: Vec<[Option<NodeInfo>; 16]>,
}

impl RoutingTable {
    pub fn new(owner: Id) -> Self {
        RoutingTable {
            owner,
            rows: (0..ID_HEX_DIGITS)
                .map(|_| std::array::from_fn(|_| None))
                .collect(),
        }
    }

    pub fn learn(&mut self, peer: &NodeInfo) {
        if peer.id == self.owner {
            return;
        }
        let row = self.owner.shared_prefix_len(&peer.id);
        let column = peer.id.hex_digit(row) as usize;
        let cell = &mut self.rows[row][column];
        if cell.is_none() {
            *cell = Some(peer.clone());
        }
    }

    pub fn entry(&self, row: usize, column: usize) -> Option<&NodeInfo> {
        self.rows[row][column].as_ref()
    }

    pub fn candidates(&self) -> impl Iterator<Item = &NodeInfo> {
        self.rows.iter().flatten().flatten()
    }
}

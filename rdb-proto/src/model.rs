/*
    rdb  -  a distributed reversible debugger for MPI programs
    Copyright (C) 2023  Matt Kimball

    This program is free software: you can redistribute it and/or modify it
    under the terms of the GNU General Public License as published by the
    Free Software Foundation, either version 3 of the License, or (at your
    option) any later version.

    This program is distributed in the hope that it will be useful, but
    WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License
    for more details.

    You should have received a copy of the GNU General Public License along
    with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier for a node (one per traced MPI process / host debugger).
/// Assigned by the orchestrator when the node registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Globally unique, opaque checkpoint identifier. Generated by the node
/// that records the checkpoint (see `rdb-tracer::mpi_interceptor`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointId(pub String);

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A wildcard MPI tag: matches any other tag.
pub const TAG_WILDCARD: i64 = -1;

/// A single recorded MPI call and its associated checkpoint, as held in a
/// node's log and replicated onto the orchestrator's checkpoint graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Globally unique opaque identifier.
    pub id: CheckpointId,

    /// Origin node.
    pub node_id: NodeId,

    /// MPI rank of the origin node, once known. `None` until the first
    /// checkpoint on this node carries a resolvable `rank` parameter.
    pub node_rank: Option<i64>,

    /// The MPI operation name (e.g. `"MPI_Send"`).
    pub op_name: String,

    /// Derived from the fixed operation table (`mpi_table`).
    pub is_send: bool,

    /// Derived from the fixed operation table.
    pub is_restorable: bool,

    /// Argument name -> string value, extracted from registers/memory at
    /// call entry.
    pub parameters: BTreeMap<String, String>,

    /// Message tag, if present. `None` means unknown/unreadable, not
    /// absent-on-the-wire; both are treated as a wildcard match.
    pub tag: Option<i64>,

    /// Reference to the causally paired checkpoint, if linked.
    pub matching_event_id: Option<CheckpointId>,

    /// True on exactly one checkpoint per active node: the node's present
    /// execution point.
    pub current_location: bool,

    /// Position in the node's log. Stable across truncation of later
    /// entries (unlike a `Vec` index), used to detect "strictly after"
    /// in the rollback planner's dependency rule.
    pub sequence: u64,
}

impl CheckpointRecord {
    /// True if this record has not yet been linked to a peer.
    pub fn is_unmatched(&self) -> bool {
        self.matching_event_id.is_none()
    }
}

/// Returns true if two optional tags match: either is absent (unknown,
/// treated as a potential match), either is the wildcard sentinel, or
/// both are equal.
pub fn tags_match(a: Option<i64>, b: Option<i64>) -> bool {
    match (a, b) {
        (None, _) | (_, None) => true,
        (Some(x), _) if x == TAG_WILDCARD => true,
        (_, Some(y)) if y == TAG_WILDCARD => true,
        (Some(x), Some(y)) => x == y,
    }
}

/// The mapping from node to the checkpoint on that node the rollback
/// planner has decided must be restored. Constructed by the planner,
/// consumed by the commit step, discarded after commit or cancel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackMap(pub BTreeMap<NodeId, CheckpointId>);

impl RollbackMap {
    pub fn new() -> Self {
        RollbackMap(BTreeMap::new())
    }

    pub fn get(&self, node: NodeId) -> Option<&CheckpointId> {
        self.0.get(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &CheckpointId)> {
        self.0.iter()
    }
}

/// Per-node choice of snapshot mechanism, selected once at node startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointMode {
    /// Snapshot by forking the traced process at the checkpoint site.
    Fork,
    /// Snapshot by serializing memory pages and registers to disk.
    File,
}

/// Outcome of the tracer's continue-until-stop loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The target exited with the given code.
    Exited(i32),
    /// The target hit a breakpoint at the given address.
    Breakpoint(u64),
    /// The target was stopped by a signal which was not our trap.
    Signal(i32),
}

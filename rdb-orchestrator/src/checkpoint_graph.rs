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

//! The orchestrator-global checkpoint graph: a per-node ordered log of
//! checkpoint records, with cross-node edges linking each send to its
//! matching receive. Grounded on `checkpointManager.go` in the original
//! tool; see spec.md §4.4.
//!
//! Encapsulated behind a single owner with explicit read/write operations
//! (spec.md §9, "Global mutable state") rather than the Go original's
//! package-level `var checkpointLog`.

use rdb_proto::model::{tags_match, CheckpointId, CheckpointRecord, NodeId};
use rdb_proto::mpi_table;
use rdb_proto::rpc::MPICallRecord;
use std::collections::HashMap;

/// The per-node ordered checkpoint log, plus resolved MPI ranks.
#[derive(Debug, Default)]
pub struct CheckpointGraph {
    log: HashMap<NodeId, Vec<CheckpointRecord>>,
    node_ranks: HashMap<NodeId, i64>,
    next_sequence: u64,
}

impl CheckpointGraph {
    pub fn new() -> Self {
        CheckpointGraph::default()
    }

    /// A read-only snapshot of the full log, keyed by node. Used for the
    /// `checkpointUpdate`/`rollbackResult` UI messages.
    pub fn snapshot(&self) -> HashMap<NodeId, Vec<CheckpointRecord>> {
        self.log.clone()
    }

    pub fn node_log(&self, node: NodeId) -> &[CheckpointRecord] {
        self.log.get(&node).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn find(&self, id: &CheckpointId) -> Option<&CheckpointRecord> {
        self.log.values().flatten().find(|r| &r.id == id)
    }

    fn find_mut(&mut self, id: &CheckpointId) -> Option<&mut CheckpointRecord> {
        self.log.values_mut().flatten().find(|r| &r.id == id)
    }

    pub fn node_of(&self, id: &CheckpointId) -> Option<NodeId> {
        self.find(id).map(|r| r.node_id)
    }

    fn parse_int_param(parameters: &std::collections::BTreeMap<String, String>, name: &str) -> Option<i64> {
        parameters.get(name).and_then(|s| s.parse::<i64>().ok())
    }

    /// Record one intercepted MPI call, append it to its node's log, and
    /// attempt to link a matching event. Corresponds to
    /// `checkpointManager.RecordCheckpoint` (spec.md §4.4 steps 1-4).
    pub fn record_checkpoint(&mut self, mpi: MPICallRecord) -> CheckpointId {
        let op_info = mpi_table::lookup(&mpi.op_name);
        let is_send = op_info.map(|o| o.is_send).unwrap_or(false);
        let is_restorable = op_info.map(|o| o.is_restorable).unwrap_or(false);

        if !self.node_ranks.contains_key(&mpi.node_id) {
            if let Some(rank) = Self::parse_int_param(&mpi.parameters, "rank") {
                self.node_ranks.insert(mpi.node_id, rank);
            }
        }
        let node_rank = self.node_ranks.get(&mpi.node_id).copied();
        let tag = Self::parse_int_param(&mpi.parameters, "tag");

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let mut record = CheckpointRecord {
            id: mpi.id.clone(),
            node_id: mpi.node_id,
            node_rank,
            op_name: mpi.op_name,
            is_send,
            is_restorable,
            parameters: mpi.parameters,
            tag,
            matching_event_id: None,
            current_location: true,
            sequence,
        };

        let entries = self.log.entry(mpi.node_id).or_default();
        if let Some(previous) = entries.last_mut() {
            previous.current_location = false;
        }

        self.link_matching_message(&mut record);
        entries.push(record);

        mpi.id
    }

    /// Find and link a matching event for `record`, mutating both sides
    /// symmetrically if a match is found. Private helper shared by
    /// `record_checkpoint` and `rematch_node`.
    fn link_matching_message(&mut self, record: &mut CheckpointRecord) {
        let op_info = match mpi_table::lookup(&record.op_name) {
            Some(info) if info.is_point_to_point => info,
            _ => return,
        };

        let peer_rank_param = if record.is_send { "dest" } else { "source" };
        let peer_rank = match Self::parse_int_param(&record.parameters, peer_rank_param) {
            Some(rank) => rank,
            None => return,
        };

        let peer_node = match self.node_ranks.iter().find(|(_, &r)| r == peer_rank) {
            Some((node, _)) => *node,
            None => return,
        };

        let want_send = !record.is_send;
        let tag = record.tag;

        let peer_entries = match self.log.get(&peer_node) {
            Some(entries) => entries,
            None => return,
        };

        let found = peer_entries.iter().find(|candidate| {
            candidate.is_unmatched()
                && !candidate.current_location
                && mpi_table::lookup(&candidate.op_name)
                    .map(|info| info.is_point_to_point)
                    .unwrap_or(false)
                && candidate.is_send == want_send
                && tags_match(tag, candidate.tag)
        });

        if let Some(peer) = found {
            let peer_id = peer.id.clone();
            record.matching_event_id = Some(peer_id.clone());

            if let Some(peer_record) = self.find_mut(&peer_id) {
                peer_record.matching_event_id = Some(record.id.clone());
            }
        }
        let _ = op_info;
    }

    /// Re-run matching (spec.md §4.5 `RemoveCurrentCheckpointMarkersOnNode`)
    /// for checkpoints on `node` whose peer was truncated away, attempting
    /// to re-link against whatever remains. Current-location checkpoints
    /// are excluded from matching by construction, so clearing that flag
    /// first (done by the caller before truncation logic runs) is what
    /// makes a record eligible again.
    pub fn rematch_unmatched_on_node(&mut self, node: NodeId) {
        let ids: Vec<CheckpointId> = self
            .log
            .get(&node)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|r| r.is_unmatched())
                    .map(|r| r.id.clone())
                    .collect()
            })
            .unwrap_or_default();

        for id in ids {
            let mut record = match self.find(&id) {
                Some(r) => r.clone(),
                None => continue,
            };
            self.link_matching_message(&mut record);
            if let Some(slot) = self.find_mut(&id) {
                slot.matching_event_id = record.matching_event_id.clone();
            }
            if let Some(peer_id) = record.matching_event_id {
                if let Some(peer) = self.find_mut(&peer_id) {
                    peer.matching_event_id = Some(id);
                }
            }
        }
    }

    /// Truncate `node`'s log to end at `keep` (inclusive), mark `keep` as
    /// `current_location`, and clear `matching_event` references on the
    /// dropped records -- symmetrically clearing them on peers that are
    /// *not* themselves being rolled back. Used by the rollback commit
    /// step (spec.md §4.5 `ExecutePendingRollback`).
    pub fn truncate_to(&mut self, node: NodeId, keep: &CheckpointId) {
        let cut_index = match self.log.get(&node) {
            Some(entries) => entries.iter().position(|r| &r.id == keep),
            None => None,
        };
        let cut_index = match cut_index {
            Some(ix) => ix,
            None => return,
        };

        let dropped_peer_ids: Vec<CheckpointId> = self
            .log
            .get(&node)
            .map(|entries| {
                entries[cut_index + 1..]
                    .iter()
                    .filter_map(|r| r.matching_event_id.clone())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(entries) = self.log.get_mut(&node) {
            entries.truncate(cut_index + 1);
            if let Some(last) = entries.last_mut() {
                last.current_location = true;
                last.matching_event_id = None;
            }
        }

        for peer_id in dropped_peer_ids {
            if let Some(peer) = self.find_mut(&peer_id) {
                peer.matching_event_id = None;
            }
        }
    }

    pub fn node_ranks(&self) -> &HashMap<NodeId, i64> {
        &self.node_ranks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn mpi(node: u32, op: &str, params: &[(&str, &str)]) -> MPICallRecord {
        static mut COUNTER: u32 = 0;
        let id = unsafe {
            COUNTER += 1;
            CheckpointId(format!("cp{}", COUNTER))
        };
        let mut parameters = BTreeMap::new();
        for (k, v) in params {
            parameters.insert(k.to_string(), v.to_string());
        }
        MPICallRecord {
            id,
            node_id: NodeId(node),
            op_name: op.to_string(),
            parameters,
        }
    }

    // Scenario 1 from spec.md §8: send on node 0 matches receive on node 1.
    #[test]
    fn send_and_receive_match_symmetrically() {
        let mut graph = CheckpointGraph::new();

        let send_id = graph.record_checkpoint(mpi(0, "MPI_Comm_rank", &[("rank", "0")]));
        let _ = send_id;
        graph.record_checkpoint(mpi(1, "MPI_Comm_rank", &[("rank", "1")]));

        let a = graph.record_checkpoint(mpi(0, "MPI_Send", &[("dest", "1"), ("tag", "7")]));
        let b = graph.record_checkpoint(mpi(1, "MPI_Recv", &[("source", "0"), ("tag", "7")]));

        let record_a = graph.find(&a).unwrap();
        let record_b = graph.find(&b).unwrap();
        assert_eq!(record_a.matching_event_id, Some(b.clone()));
        assert_eq!(record_b.matching_event_id, Some(a.clone()));
    }

    // Scenario 2: wildcard tag still matches.
    #[test]
    fn wildcard_tag_matches() {
        let mut graph = CheckpointGraph::new();
        graph.record_checkpoint(mpi(0, "MPI_Comm_rank", &[("rank", "0")]));
        graph.record_checkpoint(mpi(1, "MPI_Comm_rank", &[("rank", "1")]));

        let a = graph.record_checkpoint(mpi(0, "MPI_Send", &[("dest", "1"), ("tag", "7")]));
        let b = graph.record_checkpoint(mpi(1, "MPI_Recv", &[("source", "0"), ("tag", "-1")]));

        assert_eq!(graph.find(&a).unwrap().matching_event_id, Some(b));
    }

    // Scenario 4: barrier never pairs, even across three nodes.
    #[test]
    fn barrier_never_matches() {
        let mut graph = CheckpointGraph::new();
        graph.record_checkpoint(mpi(0, "MPI_Comm_rank", &[("rank", "0")]));
        graph.record_checkpoint(mpi(1, "MPI_Comm_rank", &[("rank", "1")]));
        graph.record_checkpoint(mpi(2, "MPI_Comm_rank", &[("rank", "2")]));

        let x0 = graph.record_checkpoint(mpi(0, "MPI_Barrier", &[]));
        graph.record_checkpoint(mpi(1, "MPI_Barrier", &[]));
        graph.record_checkpoint(mpi(2, "MPI_Barrier", &[]));

        assert!(graph.find(&x0).unwrap().matching_event_id.is_none());
    }

    #[test]
    fn current_location_is_always_the_tail_and_unique() {
        let mut graph = CheckpointGraph::new();
        graph.record_checkpoint(mpi(0, "MPI_Comm_rank", &[("rank", "0")]));
        graph.record_checkpoint(mpi(0, "MPI_Barrier", &[]));
        graph.record_checkpoint(mpi(0, "MPI_Barrier", &[]));

        let entries = graph.node_log(NodeId(0));
        let current_count = entries.iter().filter(|r| r.current_location).count();
        assert_eq!(current_count, 1);
        assert!(entries.last().unwrap().current_location);
    }

    #[test]
    fn truncate_clears_matching_event_on_surviving_peer() {
        let mut graph = CheckpointGraph::new();
        graph.record_checkpoint(mpi(0, "MPI_Comm_rank", &[("rank", "0")]));
        graph.record_checkpoint(mpi(1, "MPI_Comm_rank", &[("rank", "1")]));

        let a = graph.record_checkpoint(mpi(0, "MPI_Send", &[("dest", "1"), ("tag", "7")]));
        let b = graph.record_checkpoint(mpi(1, "MPI_Recv", &[("source", "0"), ("tag", "7")]));

        // Roll node 0 back to before the send: truncate at the rank-report
        // checkpoint, dropping the send.
        let rank_cp = graph.node_log(NodeId(0))[0].id.clone();
        graph.truncate_to(NodeId(0), &rank_cp);

        assert!(graph.find(&b).unwrap().matching_event_id.is_none());
        assert!(graph.find(&a).is_none());
    }
}

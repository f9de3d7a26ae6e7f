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

//! The rollback planner. Computes the transitive closure of peer
//! checkpoints that must also be rolled back to keep message-matching
//! consistent (spec.md §4.5). The actual commit across nodes is driven
//! by [`crate::commit::execute_rollback`] once the UI confirms this plan.

use crate::checkpoint_graph::CheckpointGraph;
use rdb_proto::model::{CheckpointId, NodeId, RollbackMap};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("checkpoint {0} not found in any node's log")]
    UnknownCheckpoint(CheckpointId),
}

/// Compute the rollback map for a target checkpoint by fixed-point
/// iteration (spec.md §4.5). Initializes `M = {n0 -> target}`, then
/// repeatedly scans each bound node for checkpoints strictly after the
/// bound whose matching peer forces a tighter bound on another node.
/// Terminates because each tightening strictly decreases some node's
/// bound in a finite log, so there are at most `sum(log lengths)`
/// tightening steps.
pub fn plan_rollback(
    graph: &CheckpointGraph,
    target: &CheckpointId,
) -> Result<RollbackMap, PlannerError> {
    let target_node = graph
        .node_of(target)
        .ok_or_else(|| PlannerError::UnknownCheckpoint(target.clone()))?;

    let mut bounds: HashMap<NodeId, CheckpointId> = HashMap::new();
    bounds.insert(target_node, target.clone());

    loop {
        let mut tightened = false;

        // Snapshot the current bounds so we don't mutate `bounds` while
        // iterating a borrow of it.
        let current: Vec<(NodeId, CheckpointId)> =
            bounds.iter().map(|(n, c)| (*n, c.clone())).collect();

        for (node, bound) in current {
            let entries = graph.node_log(node);
            let bound_sequence = match entries.iter().find(|r| r.id == bound) {
                Some(r) => r.sequence,
                None => continue,
            };

            for record in entries.iter().filter(|r| r.sequence > bound_sequence) {
                let peer_id = match &record.matching_event_id {
                    Some(id) => id,
                    None => continue,
                };
                let peer_node = match graph.node_of(peer_id) {
                    Some(n) => n,
                    None => continue,
                };
                let peer_sequence = graph
                    .find(peer_id)
                    .map(|r| r.sequence)
                    .unwrap_or(u64::MAX);

                let needs_tighten = match bounds.get(&peer_node) {
                    None => true,
                    Some(existing) => {
                        let existing_sequence = graph
                            .find(existing)
                            .map(|r| r.sequence)
                            .unwrap_or(u64::MAX);
                        peer_sequence < existing_sequence
                    }
                };

                if needs_tighten {
                    bounds.insert(peer_node, peer_id.clone());
                    tightened = true;
                }
            }
        }

        if !tightened {
            break;
        }
    }

    let mut map = BTreeMap::new();
    for (node, cp) in bounds {
        map.insert(node, cp);
    }
    Ok(RollbackMap(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_graph::CheckpointGraph;
    use rdb_proto::rpc::MPICallRecord;
    use std::collections::BTreeMap as StdBTreeMap;

    fn mpi(node: u32, op: &str, params: &[(&str, &str)]) -> MPICallRecord {
        static mut COUNTER: u32 = 0;
        let id = unsafe {
            COUNTER += 1;
            CheckpointId(format!("p{}", COUNTER))
        };
        let mut parameters = StdBTreeMap::new();
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

    // Scenario 3 from spec.md §8: rolling back node 0's send also forces
    // node 1's matching receive to roll back.
    #[test]
    fn send_rollback_pulls_in_matching_receive() {
        let mut graph = CheckpointGraph::new();
        graph.record_checkpoint(mpi(0, "MPI_Comm_rank", &[("rank", "0")]));
        graph.record_checkpoint(mpi(1, "MPI_Comm_rank", &[("rank", "1")]));

        let a = graph.record_checkpoint(mpi(0, "MPI_Send", &[("dest", "1"), ("tag", "7")]));
        let b = graph.record_checkpoint(mpi(1, "MPI_Recv", &[("source", "0"), ("tag", "7")]));

        let plan = plan_rollback(&graph, &a).unwrap();
        assert_eq!(plan.get(NodeId(0)), Some(&a));
        assert_eq!(plan.get(NodeId(1)), Some(&b));
    }

    // Scenario 4: three nodes each sitting at their own independent
    // barrier; rolling back node 0 doesn't touch the others.
    #[test]
    fn unrelated_barriers_do_not_pull_in_other_nodes() {
        let mut graph = CheckpointGraph::new();
        graph.record_checkpoint(mpi(0, "MPI_Comm_rank", &[("rank", "0")]));
        graph.record_checkpoint(mpi(1, "MPI_Comm_rank", &[("rank", "1")]));
        graph.record_checkpoint(mpi(2, "MPI_Comm_rank", &[("rank", "2")]));

        let x0 = graph.record_checkpoint(mpi(0, "MPI_Barrier", &[]));
        graph.record_checkpoint(mpi(1, "MPI_Barrier", &[]));
        graph.record_checkpoint(mpi(2, "MPI_Barrier", &[]));

        let plan = plan_rollback(&graph, &x0).unwrap();
        assert_eq!(plan.0.len(), 1);
        assert_eq!(plan.get(NodeId(0)), Some(&x0));
    }

    #[test]
    fn unknown_checkpoint_is_an_error() {
        let graph = CheckpointGraph::new();
        let result = plan_rollback(&graph, &CheckpointId("missing".to_string()));
        assert!(result.is_err());
    }
}

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

//! The rollback commit driver: dials each affected node's `NodeCommand`
//! listener and, once every node has acknowledged, truncates the
//! checkpoint graph to match. Grounded on `checkpointManager.go`'s
//! `RemoveSubsequentCheckpoints`/`RemoveCurrentCheckpointMarkersOnNode`
//! pair, which only run after every node has confirmed its restore.

use crate::state::{node_command_port, OrchestratorState};
use rdb_proto::model::RollbackMap;
use rdb_proto::rpc::framing::{read_message, write_message};
use rdb_proto::rpc::{NodeCommandRequest, NodeCommandResponse, RpcError};
use rdb_proto::model::NodeId;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("node {node:?} is not registered")]
    UnknownNode { node: NodeId },
    #[error("node {node:?} failed to restore: {source}")]
    NodeFailed { node: NodeId, source: RpcError },
}

async fn send_restore(addr: SocketAddr, checkpoint_id: rdb_proto::model::CheckpointId) -> Result<(), RpcError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;
    write_message(&mut stream, &NodeCommandRequest::Restore(checkpoint_id))
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;
    let response = read_message::<_, NodeCommandResponse>(&mut stream)
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?
        .ok_or_else(|| RpcError::Transport("connection closed before reply".to_string()))?;
    match response {
        NodeCommandResponse::Ack => Ok(()),
        NodeCommandResponse::Error(msg) => Err(RpcError::Remote(msg)),
    }
}

/// Execute a previously confirmed rollback plan (spec.md §4.5
/// `ExecutePendingRollback`). Nodes are restored in map order; the first
/// failure abandons the commit. Nodes already restored before the
/// failure are *not* rolled forward and the checkpoint graph is left
/// untouched for every node -- the orchestrator's bookkeeping only moves
/// once every node has acknowledged, so a partial failure surfaces as an
/// inconsistency between a node's actual (already rolled back) state and
/// the graph's recorded one, exactly as spec.md §7 `RollbackCommitFailed`
/// describes.
pub async fn execute_rollback(
    state: &OrchestratorState,
    map: &RollbackMap,
) -> Result<(), CommitError> {
    for (node, checkpoint_id) in map.iter() {
        let handle = state
            .node_handle(*node)
            .ok_or(CommitError::UnknownNode { node: *node })?;
        let addr = SocketAddr::new(handle.addr, node_command_port(*node));
        send_restore(addr, checkpoint_id.clone())
            .await
            .map_err(|source| CommitError::NodeFailed { node: *node, source })?;
    }

    let mut graph = state.graph.write().unwrap();
    for (node, checkpoint_id) in map.iter() {
        graph.truncate_to(*node, checkpoint_id);
    }
    for (node, _) in map.iter() {
        graph.rematch_unmatched_on_node(*node);
    }
    drop(graph);

    state.publish_checkpoint_update();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OrchestratorState;
    use pretty_assertions::assert_eq;
    use rdb_proto::model::CheckpointId;
    use rdb_proto::rpc::MPICallRecord;
    use std::collections::BTreeMap as StdBTreeMap;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    fn mpi(node: u32, id: &str) -> MPICallRecord {
        MPICallRecord {
            id: CheckpointId(id.to_string()),
            node_id: NodeId(node),
            op_name: "MPI_Barrier".to_string(),
            parameters: StdBTreeMap::new(),
        }
    }

    /// Bind a `NodeCommand` listener on a fixed port that always
    /// acknowledges a restore, standing in for a healthy node.
    async fn spawn_ack_listener(port: u16) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                while let Ok(Some(_request)) =
                    read_message::<_, NodeCommandRequest>(&mut stream).await
                {
                    let _ = write_message(&mut stream, &NodeCommandResponse::Ack).await;
                }
            }
        });
        tokio::task::yield_now().await;
    }

    // Scenario 6 from spec.md §8: one node in the plan has died by commit
    // time. The failure must surface as `NodeFailed` for that node, and the
    // graph must be left untouched for *every* node, including the one
    // that already acknowledged its restore.
    #[tokio::test]
    async fn failed_node_leaves_graph_untouched() {
        let state = OrchestratorState::new();
        {
            let mut graph = state.graph.write().unwrap();
            graph.record_checkpoint(mpi(0, "cp0"));
            graph.record_checkpoint(mpi(0, "cp0b"));
            graph.record_checkpoint(mpi(1, "cp1"));
            graph.record_checkpoint(mpi(1, "cp1b"));
        }

        let node0 = state.register_node(IpAddr::V4(Ipv4Addr::LOCALHOST), 1000);
        let node1 = state.register_node(IpAddr::V4(Ipv4Addr::LOCALHOST), 1001);
        assert_eq!(node_command_port(node0), 9500);
        assert_eq!(node_command_port(node1), 9501);

        // node0's listener acknowledges; nothing listens for node1, which
        // stands in for it having died before the commit reached it.
        spawn_ack_listener(9500).await;

        let mut bounds = StdBTreeMap::new();
        bounds.insert(node0, CheckpointId("cp0".to_string()));
        bounds.insert(node1, CheckpointId("cp1".to_string()));
        let plan = RollbackMap(bounds);

        let result = execute_rollback(&state, &plan).await;
        assert!(matches!(result, Err(CommitError::NodeFailed { node, .. }) if node == node1));

        let graph = state.graph.read().unwrap();
        assert_eq!(graph.node_log(node0).len(), 2);
        assert_eq!(graph.node_log(node1).len(), 2);
    }
}

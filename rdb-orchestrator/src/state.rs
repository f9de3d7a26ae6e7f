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

//! Shared orchestrator state: the checkpoint graph, the node registry,
//! and the single outstanding rollback proposal. One instance lives for
//! the process lifetime, shared behind an `Arc` between the RPC server,
//! the UI socket, and the CLI-equivalent admin surface.

use crate::checkpoint_graph::CheckpointGraph;
use rdb_proto::model::{NodeId, RollbackMap};
use rdb_proto::rpc::UiMessage;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, RwLock};
use tokio::sync::broadcast;

/// Node command ports are assigned deterministically from the node id,
/// mirroring the original tool's `3500 + nodeId` convention: a node
/// learns its own id from the `Register` reply and binds its restore
/// listener at this offset, so the orchestrator never has to be told
/// the port out of band.
pub const NODE_COMMAND_BASE_PORT: u16 = 9500;

pub fn node_command_port(node: NodeId) -> u16 {
    NODE_COMMAND_BASE_PORT + node.0 as u16
}

#[derive(Debug, Clone, Copy)]
pub struct NodeHandle {
    pub addr: IpAddr,
    pub pid: u32,
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, NodeHandle>,
    next_id: u32,
}

impl NodeRegistry {
    fn register(&mut self, addr: IpAddr, pid: u32) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, NodeHandle { addr, pid });
        id
    }

    pub fn get(&self, node: NodeId) -> Option<NodeHandle> {
        self.nodes.get(&node).copied()
    }
}

pub struct OrchestratorState {
    pub graph: RwLock<CheckpointGraph>,
    pub nodes: Mutex<NodeRegistry>,
    pub pending_rollback: Mutex<Option<RollbackMap>>,
    pub ui_tx: broadcast::Sender<UiMessage>,
}

impl OrchestratorState {
    pub fn new() -> Self {
        let (ui_tx, _rx) = broadcast::channel(64);
        OrchestratorState {
            graph: RwLock::new(CheckpointGraph::new()),
            nodes: Mutex::new(NodeRegistry::default()),
            pending_rollback: Mutex::new(None),
            ui_tx,
        }
    }

    pub fn register_node(&self, addr: IpAddr, pid: u32) -> NodeId {
        self.nodes.lock().unwrap().register(addr, pid)
    }

    pub fn node_handle(&self, node: NodeId) -> Option<NodeHandle> {
        self.nodes.lock().unwrap().get(node)
    }

    /// Broadcast the current log snapshot as a `checkpointUpdate` message.
    /// Ignored if there are no UI subscribers.
    pub fn publish_checkpoint_update(&self) {
        let snapshot = self.graph.read().unwrap().snapshot();
        let _ = self.ui_tx.send(UiMessage::CheckpointUpdate(
            snapshot.into_iter().collect(),
        ));
    }

    pub fn set_pending_rollback(&self, map: Option<RollbackMap>) {
        *self.pending_rollback.lock().unwrap() = map;
    }

    pub fn take_pending_rollback(&self) -> Option<RollbackMap> {
        self.pending_rollback.lock().unwrap().take()
    }
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self::new()
    }
}

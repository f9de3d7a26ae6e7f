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

//! Message shapes and trait boundaries for the node<->orchestrator RPC
//! surface and the orchestrator<->UI socket surface.
//!
//! Transport is deliberately thin here: the traits describe what the core
//! logic needs to call or be called with, and `rdb-tracer`/
//! `rdb-orchestrator` each provide one concrete transport (length-prefixed
//! JSON over TCP) behind them.

use crate::model::{CheckpointId, CheckpointRecord, NodeId, RollbackMap};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single intercepted MPI call, as reported from a node to the
/// orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MPICallRecord {
    pub id: CheckpointId,
    pub node_id: NodeId,
    pub op_name: String,
    pub parameters: BTreeMap<String, String>,
}

/// A user-issued CLI/remote command, reported back to the orchestrator
/// for display (`CommandResult`) or progress (`Progress`) purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    SetLineBreakpoint { line: u32 },
    Continue,
    RestoreLastCheckpoint,
    PrintVariable { name: String },
    Quit,
}

/// Outcome of executing a [`Command`], reported alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: Command,
    pub detail: String,
    pub exited: bool,
}

/// Methods a node calls on the orchestrator.
#[async_trait]
pub trait NodeReporter: Send + Sync {
    /// Register a newly attached process, returning its assigned node id.
    async fn register(&self, pid: u32) -> Result<NodeId, RpcError>;

    /// Report one intercepted MPI call.
    async fn mpi_call(&self, record: MPICallRecord) -> Result<(), RpcError>;

    /// Report the outcome of a user command.
    async fn command_result(&self, node_id: NodeId, outcome: CommandOutcome) -> Result<(), RpcError>;

    /// Report that a command is still in progress (used for long-running
    /// continues between breakpoints).
    async fn progress(&self, node_id: NodeId, command: Command) -> Result<(), RpcError>;
}

/// Methods the orchestrator calls on a node.
#[async_trait]
pub trait NodeCommand: Send + Sync {
    /// Instruct the node to restore the given checkpoint and truncate its
    /// local log to that point.
    async fn restore(&self, checkpoint_id: CheckpointId) -> Result<(), RpcError>;
}

/// Errors surfaced across the RPC boundary. `Transport` is retried a
/// bounded number of times by the caller before the node is declared lost.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote returned an error: {0}")]
    Remote(String),
    #[error("node is not registered")]
    UnknownNode,
}

/// Wire envelope for a call to one of the `NodeReporter.*` methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeReporterRequest {
    /// `listen_port` is derived deterministically from the assigned node
    /// id (see `NODE_COMMAND_BASE_PORT`), but registration happens before
    /// that id is known, so only `pid` travels on the wire.
    Register { pid: u32 },
    MpiCall(MPICallRecord),
    CommandResult { node_id: NodeId, outcome: CommandOutcome },
    Progress { node_id: NodeId, command: Command },
}

/// Wire envelope for the reply to a [`NodeReporterRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeReporterResponse {
    Registered(NodeId),
    Ack,
    Error(String),
}

/// Wire envelope for a call to `NodeCommand.Restore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeCommandRequest {
    Restore(CheckpointId),
}

/// Wire envelope for the reply to a [`NodeCommandRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeCommandResponse {
    Ack,
    Error(String),
}

/// Minimal length-prefixed JSON framing shared by both RPC listeners
/// (node's `NodeCommand` server, orchestrator's `NodeReporter` server) and
/// their respective callers -- deliberately no retries, compression, or
/// versioning here, just enough framing to carry one JSON value per call.
pub mod framing {
    use serde::{de::DeserializeOwned, Serialize};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub async fn write_message<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let body = serde_json::to_vec(value).map_err(std::io::Error::other)?;
        writer.write_u32(body.len() as u32).await?;
        writer.write_all(&body).await?;
        writer.flush().await
    }

    /// Returns `Ok(None)` on a clean EOF before any bytes of a new message
    /// arrive (the peer closed the connection).
    pub async fn read_message<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        let len = match reader.read_u32().await {
            Ok(len) => len,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;
        let value = serde_json::from_slice(&body).map_err(std::io::Error::other)?;
        Ok(Some(value))
    }
}

/// The five UI socket message kinds from spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum UiMessage {
    #[serde(rename = "checkpointUpdate")]
    CheckpointUpdate(BTreeMap<NodeId, Vec<CheckpointRecord>>),
    #[serde(rename = "rollbackSubmit")]
    RollbackSubmit(CheckpointId),
    #[serde(rename = "rollbackConfirm")]
    RollbackConfirm(RollbackMap),
    #[serde(rename = "rollbackCommit")]
    RollbackCommit(bool),
    #[serde(rename = "rollbackResult")]
    RollbackResult(BTreeMap<NodeId, Vec<CheckpointRecord>>),
}

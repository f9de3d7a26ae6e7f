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

//! Node-side halves of the RPC boundary of spec.md §6: a blocking
//! `NodeReporter` caller used from the tracer thread (which never runs
//! an async executor, per SPEC_FULL.md §5), and the `NodeCommand`
//! listener the orchestrator dials to request a restore.
//!
//! Framing is the shared length-prefixed JSON helper in
//! `rdb_proto::rpc::framing`; the only thing specific to this side is the
//! transport's blocking-vs-async shape and message dispatch.

use crate::error::TracerError;
use rdb_proto::model::{CheckpointId, NodeId};
use rdb_proto::rpc::framing::{read_message, write_message};
use rdb_proto::rpc::{Command, CommandOutcome, MPICallRecord, NodeCommandRequest, NodeCommandResponse, NodeReporterRequest, NodeReporterResponse, RpcError};
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;

/// Number of times a transport failure is retried before the node gives
/// up on a single RPC call (spec.md §7 `RPCTransport`).
const RPC_RETRY_LIMIT: u32 = 3;

/// A blocking `NodeReporter` caller. Owns a small single-threaded tokio
/// runtime purely to drive the async framing helpers; every public method
/// blocks the calling (tracer) thread until the call completes or the
/// retry budget is exhausted.
pub struct ReporterClient {
    runtime: Runtime,
    orchestrator_addr: SocketAddr,
}

impl ReporterClient {
    pub fn new(orchestrator_addr: SocketAddr) -> Result<ReporterClient, TracerError> {
        let runtime = Runtime::new().map_err(|e| TracerError::RpcTransport(e.to_string()))?;
        Ok(ReporterClient {
            runtime,
            orchestrator_addr,
        })
    }

    fn call(&self, request: NodeReporterRequest) -> Result<NodeReporterResponse, TracerError> {
        let mut last_err = None;
        for _ in 0..RPC_RETRY_LIMIT {
            match self.runtime.block_on(Self::call_once(self.orchestrator_addr, request.clone())) {
                Ok(response) => return Ok(response),
                Err(err) => last_err = Some(err),
            }
        }
        Err(TracerError::RpcTransport(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "exhausted retries".to_string()),
        ))
    }

    async fn call_once(
        addr: SocketAddr,
        request: NodeReporterRequest,
    ) -> Result<NodeReporterResponse, RpcError> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        write_message(&mut stream, &request)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        read_message::<_, NodeReporterResponse>(&mut stream)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?
            .ok_or_else(|| RpcError::Transport("connection closed before reply".to_string()))
    }

    pub fn register(&self, pid: u32) -> Result<NodeId, TracerError> {
        match self.call(NodeReporterRequest::Register { pid })? {
            NodeReporterResponse::Registered(node_id) => Ok(node_id),
            NodeReporterResponse::Ack => Err(TracerError::RpcTransport(
                "unexpected ack replying to Register".to_string(),
            )),
            NodeReporterResponse::Error(msg) => Err(TracerError::RpcTransport(msg)),
        }
    }

    pub fn mpi_call(&self, record: MPICallRecord) -> Result<(), TracerError> {
        self.expect_ack(self.call(NodeReporterRequest::MpiCall(record))?)
    }

    pub fn command_result(&self, node_id: NodeId, outcome: CommandOutcome) -> Result<(), TracerError> {
        self.expect_ack(self.call(NodeReporterRequest::CommandResult { node_id, outcome })?)
    }

    pub fn progress(&self, node_id: NodeId, command: Command) -> Result<(), TracerError> {
        self.expect_ack(self.call(NodeReporterRequest::Progress { node_id, command })?)
    }

    fn expect_ack(&self, response: NodeReporterResponse) -> Result<(), TracerError> {
        match response {
            NodeReporterResponse::Ack => Ok(()),
            NodeReporterResponse::Registered(_) => Ok(()),
            NodeReporterResponse::Error(msg) => Err(TracerError::RpcTransport(msg)),
        }
    }
}

/// A restore request forwarded from the `NodeCommand` listener to the
/// tracer thread, with a reply channel for the outcome.
pub struct RestoreRequest {
    pub checkpoint_id: CheckpointId,
    pub reply: Sender<Result<(), String>>,
}

/// Run the `NodeCommand.Restore` TCP listener (spec.md §6). Every
/// accepted connection is handled on its own task; the actual restore
/// always runs on the tracer thread, reached via `to_tracer`.
pub async fn run_command_server(
    listen_addr: SocketAddr,
    to_tracer: std::sync::mpsc::Sender<crate::context::TracerMessage>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    log::info!("node command listener bound to {}", listen_addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        log::debug!("accepted node command connection from {}", peer);
        let to_tracer = to_tracer.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_command_connection(stream, to_tracer).await {
                log::error!("node command connection from {} failed: {}", peer, err);
            }
        });
    }
}

async fn handle_command_connection(
    mut stream: TcpStream,
    to_tracer: std::sync::mpsc::Sender<crate::context::TracerMessage>,
) -> std::io::Result<()> {
    while let Some(request) = read_message::<_, NodeCommandRequest>(&mut stream).await? {
        let response = match request {
            NodeCommandRequest::Restore(checkpoint_id) => {
                let (reply_tx, reply_rx) = std::sync::mpsc::channel();
                if to_tracer
                    .send(crate::context::TracerMessage::Restore(RestoreRequest {
                        checkpoint_id,
                        reply: reply_tx,
                    }))
                    .is_err()
                {
                    NodeCommandResponse::Error("tracer thread is gone".to_string())
                } else {
                    match tokio::task::spawn_blocking(move || reply_rx.recv()).await {
                        Ok(Ok(Ok(()))) => NodeCommandResponse::Ack,
                        Ok(Ok(Err(msg))) => NodeCommandResponse::Error(msg),
                        _ => NodeCommandResponse::Error("tracer thread did not reply".to_string()),
                    }
                }
            }
        };
        write_message(&mut stream, &response).await?;
    }
    Ok(())
}

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

//! The `NodeReporter` RPC server: nodes dial in on a well-known port and
//! keep the connection open, sending one framed `NodeReporterRequest` per
//! call. Grounded on `reporter.go`'s `RPCClient.Call` pattern, but over a
//! minimal length-prefixed JSON transport rather than `net/rpc` (see
//! `rdb_proto::rpc::framing`).

use crate::state::OrchestratorState;
use log::{info, warn};
use rdb_proto::rpc::{NodeReporterRequest, NodeReporterResponse};
use rdb_proto::rpc::framing::{read_message, write_message};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Accept `NodeReporter` connections forever. Each connection is handled
/// on its own task; a node registers once per connection and then sends
/// any number of `MpiCall`/`CommandResult`/`Progress` requests.
pub async fn run(state: Arc<OrchestratorState>, listen_addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("node reporter listening on {}", listen_addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(state, stream, peer).await {
                warn!("node reporter connection from {} ended: {}", peer, err);
            }
        });
    }
}

async fn handle_connection(
    state: Arc<OrchestratorState>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> std::io::Result<()> {
    let mut registered_as = None;

    while let Some(request) = read_message::<_, NodeReporterRequest>(&mut stream).await? {
        let response = match request {
            NodeReporterRequest::Register { pid } => {
                let node_id = state.register_node(peer.ip(), pid);
                registered_as = Some(node_id);
                info!("node {} registered from {} (pid {})", node_id.0, peer, pid);
                NodeReporterResponse::Registered(node_id)
            }
            NodeReporterRequest::MpiCall(record) => {
                state.graph.write().unwrap().record_checkpoint(record);
                state.publish_checkpoint_update();
                NodeReporterResponse::Ack
            }
            NodeReporterRequest::CommandResult { node_id, outcome } => {
                info!(
                    "node {} finished {:?}: {}",
                    node_id.0, outcome.command, outcome.detail
                );
                NodeReporterResponse::Ack
            }
            NodeReporterRequest::Progress { node_id, command } => {
                info!("node {} progress: {:?}", node_id.0, command);
                NodeReporterResponse::Ack
            }
        };
        write_message(&mut stream, &response).await?;
    }

    if let Some(node_id) = registered_as {
        info!("node {} disconnected", node_id.0);
    }
    Ok(())
}

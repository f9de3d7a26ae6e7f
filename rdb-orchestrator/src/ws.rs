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

//! The UI socket: a single `/ws` websocket endpoint speaking the five
//! `UiMessage` kinds of spec.md §6 as JSON frames. Grounded on the
//! `events.go` `handleRollbackSubmit`/`handleRollbackCommit` pair, with
//! `axum`'s websocket upgrade standing in for the original's raw
//! `gorilla/websocket` handler.

use crate::commit;
use crate::rollback_planner::plan_rollback;
use crate::state::OrchestratorState;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use log::{error, info, warn};
use rdb_proto::rpc::UiMessage;
use std::sync::Arc;

pub fn router(state: Arc<OrchestratorState>) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .with_state(state)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<OrchestratorState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<OrchestratorState>) {
    let mut updates = state.ui_tx.subscribe();

    // Bring a newly connected client up to date immediately.
    let initial = state.graph.read().unwrap().snapshot();
    if send(&mut socket, &UiMessage::CheckpointUpdate(initial.into_iter().collect())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            broadcast = updates.recv() => {
                match broadcast {
                    Ok(message) => {
                        if send(&mut socket, &message).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("UI socket lagged, dropped {} updates", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if handle_incoming(&text, &state).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        error!("UI socket error: {}", err);
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_incoming(text: &str, state: &Arc<OrchestratorState>) -> Result<(), ()> {
    let message: UiMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(err) => {
            warn!("malformed UI message: {}", err);
            return Ok(());
        }
    };

    match message {
        UiMessage::RollbackSubmit(target) => {
            let plan = {
                let graph = state.graph.read().unwrap();
                plan_rollback(&graph, &target)
            };
            match plan {
                Ok(map) => {
                    state.set_pending_rollback(Some(map.clone()));
                    let _ = state.ui_tx.send(UiMessage::RollbackConfirm(map));
                }
                Err(err) => {
                    warn!("rollback submit rejected: {}", err);
                }
            }
        }
        UiMessage::RollbackCommit(proceed) => {
            let pending = state.take_pending_rollback();
            match (proceed, pending) {
                (true, Some(map)) => {
                    if let Err(err) = commit::execute_rollback(state, &map).await {
                        error!("rollback commit failed: {}", err);
                    }
                    let snapshot = state.graph.read().unwrap().snapshot();
                    let _ = state
                        .ui_tx
                        .send(UiMessage::RollbackResult(snapshot.into_iter().collect()));
                }
                (false, _) => info!("rollback cancelled by UI"),
                (true, None) => warn!("rollback commit with no pending plan"),
            }
        }
        UiMessage::CheckpointUpdate(_)
        | UiMessage::RollbackConfirm(_)
        | UiMessage::RollbackResult(_) => {
            // Outbound-only message kinds; a client sending one back is ignored.
        }
    }
    Ok(())
}

async fn send(socket: &mut WebSocket, message: &UiMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).expect("UiMessage always serializes");
    socket.send(Message::Text(text)).await
}

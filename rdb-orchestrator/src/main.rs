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

mod checkpoint_graph;
mod commandline;
mod commit;
mod rollback_planner;
mod rpc_server;
mod state;
mod ws;

use clap::Parser;
use commandline::CommandLineArguments;
use log::info;
use state::OrchestratorState;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = CommandLineArguments::parse();
    let state = Arc::new(OrchestratorState::new());

    let rpc_state = Arc::clone(&state);
    let rpc_listen = args.rpc_listen;
    let rpc_task = tokio::spawn(async move { rpc_server::run(rpc_state, rpc_listen).await });

    let ui_app = ws::router(Arc::clone(&state));
    let ui_listener = tokio::net::TcpListener::bind(args.ui_listen).await?;
    info!("UI socket listening on {}", args.ui_listen);
    let ui_task = tokio::spawn(async move { axum::serve(ui_listener, ui_app).await });

    tokio::select! {
        result = rpc_task => {
            result??;
        }
        result = ui_task => {
            result??;
        }
    }

    Ok(())
}

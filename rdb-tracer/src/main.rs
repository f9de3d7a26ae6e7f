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

mod breakpoint;
mod checkpoint_store;
mod cli;
mod commandline;
mod context;
mod dwarf;
mod error;
mod mpi_interceptor;
mod process_map;
mod rpc_client;
mod symbol_index;
mod tracer;

use checkpoint_store::{CheckpointStore, FileCheckpointStore, ForkCheckpointStore};
use clap::Parser;
use commandline::{CheckpointModeArg, CommandLineArguments};
use context::{NodeContext, NodeOutcome, TracerMessage};
use dwarf::{DwarfIndex, GimliDwarfIndex};
use rpc_client::ReporterClient;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracer::Tracer;

/// Same derivation `rdb-orchestrator::state::node_command_port` uses;
/// duplicated here rather than pulled in as a cross-crate dependency,
/// since a per-node agent has no other reason to depend on the
/// orchestrator binary's crate.
const NODE_COMMAND_BASE_PORT: u16 = 9500;

fn node_command_port(node_id: rdb_proto::model::NodeId) -> u16 {
    NODE_COMMAND_BASE_PORT + node_id.0 as u16
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = CommandLineArguments::parse();

    let mut command = vec![args.target.to_string_lossy().into_owned()];
    command.extend(args.target_args.iter().cloned());

    log::info!("spawning target: {:?}", command);
    let tracer = Tracer::spawn(&command)?;

    let reporter = ReporterClient::new(args.orchestrator)?;
    let node_id = reporter.register(tracer.pid())?;
    log::info!("registered as node {:?}", node_id);

    let dwarf_index: Box<dyn DwarfIndex> = match GimliDwarfIndex::load(&args.target) {
        Ok(index) => Box::new(index),
        Err(err) => {
            anyhow::bail!("DWARF lookup failed for {:?}: {}", args.target, err);
        }
    };

    let store: Box<dyn CheckpointStore> = match args.checkpoint_mode {
        CheckpointModeArg::Fork => Box::new(ForkCheckpointStore::new()),
        CheckpointModeArg::File => Box::new(FileCheckpointStore::new(args.checkpoint_dir.clone())?),
    };

    let mut ctx = NodeContext::new(tracer, store, dwarf_index, node_id, reporter)?;
    let descriptor_count = ctx.dwarf.mpi_function_descriptors().len();
    ctx.install_mpi_breakpoints()?;
    log::info!("installed {} MPI entry breakpoints", descriptor_count);

    let (to_tracer, inbox) = std::sync::mpsc::channel::<TracerMessage>();

    let listen_addr = args
        .listen
        .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), node_command_port(node_id)));
    let command_server_inbox = to_tracer.clone();
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(err) => {
                log::error!("failed to start node command runtime: {}", err);
                return;
            }
        };
        if let Err(err) = runtime.block_on(rpc_client::run_command_server(listen_addr, command_server_inbox)) {
            log::error!("node command listener failed: {}", err);
        }
    });

    if args.cli {
        let cli_sender = to_tracer.clone();
        std::thread::spawn(move || cli::run_repl(cli_sender));
    }

    match context::run_trace_loop(ctx, inbox) {
        Ok(NodeOutcome::Exited(code)) => {
            log::info!("target exited with code {}", code);
            std::process::exit(code);
        }
        Ok(NodeOutcome::Signaled(sig)) => {
            log::warn!("target terminated by signal {}", sig);
            std::process::exit(1);
        }
        Err(err) => {
            log::error!("fatal tracer error: {}", err);
            std::process::exit(1);
        }
    }
}

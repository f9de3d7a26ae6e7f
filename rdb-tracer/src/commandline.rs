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

//! Node-agent process commandline (SPEC_FULL.md §7): target binary,
//! checkpoint mode, orchestrator address, and the node's own listen port
//! for `NodeCommand.Restore`. A richer flag set than a five-command REPL
//! warrants, so it is `clap`-parsed rather than hand-rolled the way
//! `allocscope-trace::commandline` parses its three flags.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CheckpointModeArg {
    Fork,
    File,
}

impl From<CheckpointModeArg> for rdb_proto::model::CheckpointMode {
    fn from(value: CheckpointModeArg) -> Self {
        match value {
            CheckpointModeArg::Fork => rdb_proto::model::CheckpointMode::Fork,
            CheckpointModeArg::File => rdb_proto::model::CheckpointMode::File,
        }
    }
}

/// Command-line arguments for the per-node `rdb-tracer` agent.
#[derive(Debug, Parser)]
#[command(
    name = "rdb-tracer",
    about = "Per-node agent for the distributed reversible MPI debugger"
)]
pub struct CommandLineArguments {
    /// Path to the target binary to trace.
    pub target: PathBuf,

    /// Arguments to pass to the target binary.
    #[arg(last = true)]
    pub target_args: Vec<String>,

    /// How the node takes checkpoints: forked-process or file-backed.
    #[arg(long, value_enum, default_value = "fork")]
    pub checkpoint_mode: CheckpointModeArg,

    /// Directory used by the file-backed checkpoint store.
    #[arg(long, default_value = "rdb-checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// Address of the orchestrator's `NodeReporter` RPC listener.
    #[arg(long, default_value = "127.0.0.1:9400")]
    pub orchestrator: SocketAddr,

    /// Address this node's `NodeCommand` listener binds to. Normally left
    /// unset and derived from the assigned node id (see
    /// `rdb_orchestrator::state::node_command_port`); an explicit value
    /// overrides that for local testing.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Run the interactive CLI surface (`b`/`c`/`r`/`p`/`q`) on stdin
    /// instead of only driving the node from the orchestrator.
    #[arg(long)]
    pub cli: bool,
}

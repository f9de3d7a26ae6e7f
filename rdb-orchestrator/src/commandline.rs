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

//! Commandline arguments for `rdb-orchestrator`. The original tool parsed
//! `-h`/`-r`/`-v` by hand (see `allocscope-view`'s prior `commandline.rs`);
//! with two listen addresses and no positional trace file, `clap`'s
//! derive macro is a better fit and matches the rest of the workspace's
//! ambient stack.

use clap::Parser;
use std::net::SocketAddr;

#[derive(Debug, Parser)]
#[command(name = "rdb-orchestrator", version, about = "Distributed reversible debugger orchestrator")]
pub struct CommandLineArguments {
    /// Address the `NodeReporter` RPC server listens on.
    #[arg(long, default_value = "0.0.0.0:9400")]
    pub rpc_listen: SocketAddr,

    /// Address the UI websocket server listens on.
    #[arg(long, default_value = "0.0.0.0:9401")]
    pub ui_listen: SocketAddr,
}

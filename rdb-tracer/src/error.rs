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

//! Node-agent error kinds and their disposition, per spec.md §7. Each
//! variant is matched explicitly in the node main loop rather than
//! propagated as an opaque `Box<dyn Error>`, so fatal (terminate node)
//! and recoverable (log-and-continue) failures stay distinguishable at
//! the point where that decision has to be made.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TracerError {
    /// peek/poke failure talking to the kernel tracing interface. Logged,
    /// the current command is abandoned, and the failure is surfaced to
    /// the operator -- not fatal by itself.
    #[error("tracer I/O error: {0}")]
    TracerIO(String),

    /// A trap fired at an address with no registered breakpoint. Treated
    /// as spurious: log a register dump, single-step past it, continue.
    #[error("breakpoint miss at {address:#x}")]
    BreakpointMiss { address: u64 },

    /// `continue_until_stop` exceeded `MAX_CONTINUE_CYCLES`. Fatal: the
    /// target is killed and the node reports an error.
    #[error("tracer stuck waiting for target to stop")]
    TracerStuck,

    /// A source line or MPI entry address could not be resolved. Non-fatal
    /// for a user line breakpoint; fatal at startup if an entry in the
    /// mandatory MPI function set is missing.
    #[error("DWARF lookup failed: {0}")]
    DwarfLookupFailed(String),

    /// A checkpoint could not be snapshotted. The checkpoint is still
    /// recorded, with `is_restorable = false`.
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    /// The node's RPC connection to the orchestrator failed after
    /// exhausting its retry budget.
    #[error("RPC transport error: {0}")]
    RpcTransport(String),
}

impl TracerError {
    /// True if this error should terminate the node's trace loop rather
    /// than being logged and absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TracerError::TracerStuck)
    }
}

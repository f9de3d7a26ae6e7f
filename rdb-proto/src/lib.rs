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

//! Shared wire and data-model types for the distributed reversible
//! debugger. Both the per-node agent (`rdb-tracer`) and the
//! orchestrator (`rdb-orchestrator`) depend on this crate so the two
//! sides never drift on the shape of a `CheckpointRecord` or an
//! `MPICallRecord`.

pub mod model;
pub mod mpi_table;
pub mod rpc;

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

//! The fixed table of MPI operations the interceptor recognizes, and the
//! parameter names the checkpoint graph inspects for rank/tag/dest/source
//! resolution.
//!
//! A wrapper library is assumed to re-export each of these names from a
//! marker compilation unit containing the `MPI_WRAPPER_MARKER` symbol;
//! `rdb-tracer::dwarf` locates that marker and resolves entry addresses
//! for whichever of these names are actually present in the target binary.

/// A declared parameter of an intercepted MPI call: its argument name and
/// how the interceptor should interpret the register/stack slot holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// A plain integer argument (rank, tag, count, ...).
    Integer,
    /// A pointer to a NUL-terminated string (unused today, but supported
    /// by the interceptor's extraction step).
    CString,
    /// Anything else: recorded as an opaque placeholder string.
    Opaque,
}

/// Static description of one MPI function the interceptor breakpoints.
#[derive(Debug, Clone, Copy)]
pub struct MpiOpInfo {
    pub name: &'static str,
    pub is_send: bool,
    pub is_restorable: bool,
    /// True for point-to-point send/receive calls eligible for causal
    /// pairing. Collective and lifecycle calls (`MPI_Barrier`,
    /// `MPI_Init`, ...) are never matched even though some of them also
    /// have `is_send == false`.
    pub is_point_to_point: bool,
    pub params: &'static [(&'static str, ParamKind)],
}

/// The symbol marking the start of the wrapper library's MPI shims in the
/// target binary's DWARF/symbol table. Mirrors `_MPI_WRAPPER_INCLUDE` in
/// the original tool's `mpi.go`.
pub const MPI_WRAPPER_MARKER: &str = "_MPI_WRAPPER_INCLUDE";

const INT: ParamKind = ParamKind::Integer;
const STR: ParamKind = ParamKind::CString;
const OPAQUE: ParamKind = ParamKind::Opaque;

/// The fixed operation table. Order matters only for readability; lookup
/// is always by name via [`lookup`].
pub static MPI_OPERATIONS: &[MpiOpInfo] = &[
    MpiOpInfo {
        name: "MPI_Send",
        is_send: true,
        is_restorable: true,
        is_point_to_point: true,
        params: &[
            ("buf", OPAQUE),
            ("count", INT),
            ("dest", INT),
            ("tag", INT),
        ],
    },
    MpiOpInfo {
        name: "MPI_Isend",
        is_send: true,
        is_restorable: true,
        is_point_to_point: true,
        params: &[
            ("buf", OPAQUE),
            ("count", INT),
            ("dest", INT),
            ("tag", INT),
        ],
    },
    MpiOpInfo {
        name: "MPI_Ssend",
        is_send: true,
        is_restorable: true,
        is_point_to_point: true,
        params: &[
            ("buf", OPAQUE),
            ("count", INT),
            ("dest", INT),
            ("tag", INT),
        ],
    },
    MpiOpInfo {
        name: "MPI_Recv",
        is_send: false,
        is_restorable: true,
        is_point_to_point: true,
        params: &[
            ("buf", OPAQUE),
            ("count", INT),
            ("source", INT),
            ("tag", INT),
        ],
    },
    MpiOpInfo {
        name: "MPI_Irecv",
        is_send: false,
        is_restorable: true,
        is_point_to_point: true,
        params: &[
            ("buf", OPAQUE),
            ("count", INT),
            ("source", INT),
            ("tag", INT),
        ],
    },
    MpiOpInfo {
        name: "MPI_Barrier",
        is_send: false,
        is_restorable: true,
        is_point_to_point: false,
        params: &[],
    },
    MpiOpInfo {
        name: "MPI_Bcast",
        is_send: false,
        is_restorable: true,
        is_point_to_point: false,
        params: &[("buf", OPAQUE), ("count", INT), ("root", INT)],
    },
    MpiOpInfo {
        name: "MPI_Init",
        is_send: false,
        is_restorable: false,
        is_point_to_point: false,
        params: &[],
    },
    MpiOpInfo {
        name: "MPI_Finalize",
        is_send: false,
        is_restorable: false,
        is_point_to_point: false,
        params: &[],
    },
    MpiOpInfo {
        name: "MPI_Comm_rank",
        is_send: false,
        is_restorable: false,
        is_point_to_point: false,
        params: &[("rank", INT)],
    },
    MpiOpInfo {
        name: "MPI_Comm_size",
        is_send: false,
        is_restorable: false,
        is_point_to_point: false,
        params: &[("size", INT)],
    },
    MpiOpInfo {
        name: "MPI_Abort",
        is_send: false,
        is_restorable: false,
        is_point_to_point: false,
        params: &[("errorcode", INT)],
    },
];

/// Look up the fixed table entry for an operation name, if the operation
/// is one the interceptor recognizes.
pub fn lookup(op_name: &str) -> Option<&'static MpiOpInfo> {
    MPI_OPERATIONS.iter().find(|op| op.name == op_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_recv_are_opposite_sided() {
        let send = lookup("MPI_Send").unwrap();
        let recv = lookup("MPI_Recv").unwrap();
        assert!(send.is_send);
        assert!(!recv.is_send);
    }

    #[test]
    fn barrier_is_not_a_send_or_receive_pairing_candidate() {
        let barrier = lookup("MPI_Barrier").unwrap();
        assert!(!barrier.is_send);
        assert_eq!(barrier.name, "MPI_Barrier");
    }

    #[test]
    fn unknown_operation_is_absent() {
        assert!(lookup("MPI_Not_A_Real_Call").is_none());
    }
}

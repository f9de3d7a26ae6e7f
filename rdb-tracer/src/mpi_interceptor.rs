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

//! The MPI Interceptor of spec.md §4.3: the per-hit protocol run every
//! time the tracer stops at a trap. Parameter extraction follows the
//! System V x86-64 calling convention's first six integer argument
//! registers, falling back to the stack for any declared parameter past
//! the sixth.

use crate::breakpoint::BreakpointKind;
use crate::context::NodeContext;
use crate::error::TracerError;
use rdb_proto::model::{CheckpointId, NodeId};
use rdb_proto::mpi_table::ParamKind;
use rdb_proto::rpc::MPICallRecord;
use std::collections::BTreeMap;

/// Longest `CString` parameter the interceptor will read out of the
/// target before giving up (spec.md §4.3, "capped at 4096 bytes").
const MAX_CSTRING_LEN: usize = 4096;

/// The outcome of handling one trap: either it was an MPI entry (the
/// call record that was reported), or a user line breakpoint (the caller
/// reports this to the CLI/remote operator and awaits a command), or a
/// miss.
pub enum InterceptOutcome {
    MpiCall(MPICallRecord),
    LineBreakpoint { source_file: String, line: u32 },
}

/// System V x86-64 integer argument registers, in order.
fn integer_arg_registers(regs: &libc::user_regs_struct) -> [u64; 6] {
    [regs.rdi, regs.rsi, regs.rdx, regs.rcx, regs.r8, regs.r9]
}

fn read_cstring(ctx: &NodeContext, addr: u64) -> Result<String, TracerError> {
    let mut bytes = Vec::new();
    let mut cursor = addr;
    while bytes.len() < MAX_CSTRING_LEN {
        let chunk = ctx.tracer.read_memory(cursor, 8)?;
        for &b in &chunk {
            if b == 0 {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(b);
            if bytes.len() >= MAX_CSTRING_LEN {
                break;
            }
        }
        cursor += 8;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Extract the declared parameters of an MPI call from the target's
/// registers (and stack, past the sixth integer argument).
fn extract_parameters(
    ctx: &NodeContext,
    regs: &libc::user_regs_struct,
    params: &[(&'static str, ParamKind)],
) -> Result<BTreeMap<String, String>, TracerError> {
    let int_regs = integer_arg_registers(regs);
    let mut out = BTreeMap::new();

    for (index, (name, kind)) in params.iter().enumerate() {
        let raw = if index < 6 {
            int_regs[index]
        } else {
            let slot = regs.rsp + 8 * (index as u64 - 6);
            let word_bytes = ctx.tracer.read_memory(slot, 8)?;
            u64::from_le_bytes(word_bytes.try_into().unwrap_or([0; 8]))
        };

        let value = match kind {
            ParamKind::Integer => (raw as i64).to_string(),
            ParamKind::CString => read_cstring(ctx, raw)?,
            ParamKind::Opaque => format!("{:#x}", raw),
        };
        out.insert(name.to_string(), value);
    }

    Ok(out)
}

/// Identify and, if it's an MPI entry, decode the trap the tracer just
/// stopped at (spec.md §4.3 steps 1-3). Does not report, snapshot, or
/// step through -- the caller (the node's trace loop) drives those so it
/// can sequence them with RPC and the checkpoint store.
pub fn decode_trap(
    ctx: &NodeContext,
    address: u64,
    node_id: NodeId,
    next_call_id: &mut u64,
) -> Result<InterceptOutcome, TracerError> {
    let breakpoint = ctx
        .breakpoints
        .get(address)
        .ok_or(TracerError::BreakpointMiss { address })?;

    match &breakpoint.kind {
        BreakpointKind::Line { source_file, line } => Ok(InterceptOutcome::LineBreakpoint {
            source_file: source_file.clone(),
            line: *line,
        }),
        BreakpointKind::Mpi { descriptor } => {
            let regs = ctx.tracer.get_registers()?;
            let parameters = extract_parameters(ctx, &regs, descriptor.params)?;

            *next_call_id += 1;
            let record = MPICallRecord {
                id: CheckpointId(format!("{}-{}", node_id.0, next_call_id)),
                node_id,
                op_name: descriptor.name.clone(),
                parameters,
            };
            Ok(InterceptOutcome::MpiCall(record))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arg_registers_follow_sysv_order() {
        let mut regs: libc::user_regs_struct =
            unsafe { std::mem::MaybeUninit::zeroed().assume_init() };
        regs.rdi = 1;
        regs.rsi = 2;
        regs.rdx = 3;
        regs.rcx = 4;
        regs.r8 = 5;
        regs.r9 = 6;
        assert_eq!(integer_arg_registers(&regs), [1, 2, 3, 4, 5, 6]);
    }
}

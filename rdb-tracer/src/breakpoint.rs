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

//! Breakpoint bookkeeping for a single traced process (spec.md §3, §4.3).
//! Two flavors share one address-keyed map: user line breakpoints and the
//! automatic MPI entry breakpoints installed at startup. The byte-patch
//! math is the same `allocscope-trace::breakpoint` shift/mask dance,
//! delegated to [`crate::tracer::Tracer`] rather than calling `ptrace`
//! directly here.

use crate::dwarf::MpiFunctionDescriptor;
use crate::error::TracerError;
use crate::tracer::Tracer;
use std::collections::HashMap;

/// What kind of breakpoint is installed at an address.
#[derive(Debug, Clone)]
pub enum BreakpointKind {
    /// A user-requested breakpoint at a source line.
    Line { source_file: String, line: u32 },

    /// An automatically installed breakpoint at an MPI entry point.
    Mpi { descriptor: MpiFunctionDescriptor },
}

/// A single installed breakpoint: the address it traps, the byte it
/// overwrote, and which kind it is.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub address: u64,
    pub original_byte: u8,
    pub kind: BreakpointKind,
}

/// The set of all breakpoints installed in a traced process.
#[derive(Default)]
pub struct BreakpointMap {
    by_address: HashMap<u64, Breakpoint>,
}

impl BreakpointMap {
    pub fn new() -> BreakpointMap {
        BreakpointMap {
            by_address: HashMap::new(),
        }
    }

    /// Install a line breakpoint, returning an error if one is already
    /// present at this address (the caller is expected to check `get`
    /// first if it wants idempotent behavior).
    pub fn insert_line(
        &mut self,
        tracer: &Tracer,
        address: u64,
        source_file: String,
        line: u32,
    ) -> Result<(), TracerError> {
        self.insert(tracer, address, BreakpointKind::Line { source_file, line })
    }

    /// Install an MPI entry breakpoint.
    pub fn insert_mpi(
        &mut self,
        tracer: &Tracer,
        descriptor: MpiFunctionDescriptor,
    ) -> Result<(), TracerError> {
        let address = descriptor.low_pc;
        self.insert(tracer, address, BreakpointKind::Mpi { descriptor })
    }

    fn insert(
        &mut self,
        tracer: &Tracer,
        address: u64,
        kind: BreakpointKind,
    ) -> Result<(), TracerError> {
        if self.by_address.contains_key(&address) {
            return Ok(());
        }
        let original_byte = tracer.insert_breakpoint(address)?;
        self.by_address.insert(
            address,
            Breakpoint {
                address,
                original_byte,
                kind,
            },
        );
        Ok(())
    }

    /// Remove a breakpoint, restoring the original instruction byte.
    pub fn remove(&mut self, tracer: &Tracer, address: u64) -> Result<(), TracerError> {
        if let Some(breakpoint) = self.by_address.remove(&address) {
            tracer.remove_breakpoint(address, breakpoint.original_byte)?;
        }
        Ok(())
    }

    /// Look up the breakpoint (if any) installed at `address`.
    pub fn get(&self, address: u64) -> Option<&Breakpoint> {
        self.by_address.get(&address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.by_address.values()
    }

    /// Step the target through the breakpoint at `address`: restore the
    /// original instruction, single-step it, then re-insert the trap --
    /// the patch-step-repatch dance of spec.md §4.3. Must run without any
    /// other command for this node intervening.
    pub fn step_through(&self, tracer: &Tracer, address: u64) -> Result<(), TracerError> {
        let breakpoint = self
            .by_address
            .get(&address)
            .ok_or(TracerError::BreakpointMiss { address })?;

        tracer.remove_breakpoint(address, breakpoint.original_byte)?;
        tracer.single_step()?;
        tracer.insert_breakpoint(address)?;

        Ok(())
    }

    /// Remove every installed breakpoint, restoring original bytes. Used
    /// on detach to leave the process in a runnable, untouched state.
    pub fn clear(&mut self, tracer: &Tracer) -> Result<(), TracerError> {
        let addresses: Vec<u64> = self.by_address.keys().copied().collect();
        for address in addresses {
            self.remove(tracer, address)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_reports_no_breakpoint() {
        let map = BreakpointMap::new();
        assert!(map.get(0x1000).is_none());
    }
}

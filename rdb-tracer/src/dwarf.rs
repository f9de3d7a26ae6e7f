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

//! The DWARF collaborator of spec.md §6: resolves source lines to entry
//! addresses and enumerates the MPI wrapper's entry points. Parses the
//! target's ELF sections with `object` (already an `allocscope-trace`
//! dependency, also what `symbol_index` uses for its symbol table) and
//! walks `.debug_line`/`.debug_info` with `gimli`.
//!
//! MPI function descriptors are not found by walking DWARF subprograms --
//! the wrapper shims are often declared `extern "C"` with no debug info of
//! their own -- they are found the same way `symbol_index` finds any
//! other function: by symbol table lookup, gated on the presence of the
//! `_MPI_WRAPPER_INCLUDE` marker symbol so a binary not linked against the
//! wrapper library never gets spurious breakpoints.

use gimli::{EndianSlice, LittleEndian, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSymbol};
use rdb_proto::mpi_table::{self, MpiOpInfo, ParamKind};
use std::collections::HashMap;
use std::error::Error;
use std::path::Path;

/// An MPI entry point resolved in the target binary: name, address, and
/// the parameter list from the fixed operation table (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct MpiFunctionDescriptor {
    pub name: String,
    pub low_pc: u64,
    pub params: &'static [(&'static str, ParamKind)],
    pub op_info: &'static MpiOpInfo,
}

/// What the MPI Interceptor and CLI surface need from a parsed target
/// binary. A trait so the interceptor and tests can swap in a fake
/// without touching an ELF file.
pub trait DwarfIndex {
    /// Resolve a source file and line number to the instruction address
    /// of the first statement on that line, if found.
    fn line_to_pc(&self, source_file: &str, line: u32) -> Option<u64>;

    /// The source file a function is defined in, if known.
    fn entry_source_file(&self, function_name: &str) -> Option<String>;

    /// Every MPI entry point found in the binary's symbol table, gated on
    /// the wrapper marker symbol being present at all.
    fn mpi_function_descriptors(&self) -> Vec<MpiFunctionDescriptor>;
}

struct LineEntry {
    address: u64,
    file: String,
    line: u32,
}

/// A `DwarfIndex` backed by `gimli`'s DWARF walker and `object`'s ELF
/// symbol/section reader.
pub struct GimliDwarfIndex {
    lines: Vec<LineEntry>,
    function_files: HashMap<String, String>,
    mpi_descriptors: Vec<MpiFunctionDescriptor>,
}

impl GimliDwarfIndex {
    /// Parse the ELF file at `path`, indexing its line table and locating
    /// any MPI wrapper entry points.
    pub fn load(path: &Path) -> Result<GimliDwarfIndex, Box<dyn Error>> {
        let data = std::fs::read(path)?;
        let file = object::File::parse(&*data)?;

        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> Result<Vec<u8>, Box<dyn Error>> {
            match file.section_by_name(id.name()) {
                Some(section) => Ok(section.uncompressed_data()?.into_owned()),
                None => Ok(Vec::new()),
            }
        };

        let dwarf_sections = gimli::Dwarf::load(load_section)?;
        let borrowed: gimli::Dwarf<EndianSlice<RunTimeEndian>> =
            dwarf_sections.borrow(|section| EndianSlice::new(section, endian));

        let (lines, function_files) = Self::index_lines(&borrowed, endian)?;
        let mpi_descriptors = Self::resolve_mpi_descriptors(&file);

        Ok(GimliDwarfIndex {
            lines,
            function_files,
            mpi_descriptors,
        })
    }

    fn index_lines(
        dwarf: &gimli::Dwarf<EndianSlice<RunTimeEndian>>,
        _endian: RunTimeEndian,
    ) -> Result<(Vec<LineEntry>, HashMap<String, String>), Box<dyn Error>> {
        let mut lines = Vec::new();
        let mut function_files = HashMap::new();

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let program = match &unit.line_program {
                Some(program) => program.clone(),
                None => continue,
            };

            // Record each subprogram's declaration file, for
            // `entry_source_file`.
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() == gimli::DW_TAG_subprogram {
                    if let Some(name_attr) = entry.attr(gimli::DW_AT_name)? {
                        if let Ok(name) = dwarf.attr_string(&unit, name_attr.value()) {
                            if let Ok(name) = name.to_string() {
                                if let Some(file_attr) = entry.attr(gimli::DW_AT_decl_file)? {
                                    if let gimli::AttributeValue::FileIndex(file_index) =
                                        file_attr.value()
                                    {
                                        if let Some(file_name) = Self::file_name(
                                            dwarf, &unit, &program, file_index,
                                        ) {
                                            function_files
                                                .insert(name.to_string(), file_name);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }

            let (program, sequences) = program.sequences()?;
            for sequence in sequences {
                let mut rows = program.resume_from(&sequence);
                while let Some((header, row)) = rows.next_row()? {
                    if row.end_sequence() {
                        continue;
                    }
                    let line = match row.line() {
                        Some(line) => line.get() as u32,
                        None => continue,
                    };
                    let file_name = row
                        .file(header)
                        .and_then(|file| Self::line_file_name(dwarf, &unit, header, file));
                    if let Some(file_name) = file_name {
                        lines.push(LineEntry {
                            address: row.address(),
                            file: file_name,
                            line,
                        });
                    }
                }
            }
        }

        Ok((lines, function_files))
    }

    fn file_name(
        dwarf: &gimli::Dwarf<EndianSlice<RunTimeEndian>>,
        unit: &gimli::Unit<EndianSlice<RunTimeEndian>>,
        program: &gimli::IncompleteLineProgram<EndianSlice<RunTimeEndian>>,
        file_index: u64,
    ) -> Option<String> {
        let header = program.header();
        let file = header.file(file_index)?;
        Self::line_file_name(dwarf, unit, header, file)
    }

    fn line_file_name(
        dwarf: &gimli::Dwarf<EndianSlice<RunTimeEndian>>,
        unit: &gimli::Unit<EndianSlice<RunTimeEndian>>,
        header: &gimli::LineProgramHeader<EndianSlice<RunTimeEndian>>,
        file: &gimli::FileEntry<EndianSlice<RunTimeEndian>>,
    ) -> Option<String> {
        let raw = dwarf.attr_string(unit, file.path_name()).ok()?;
        let name = raw.to_string().ok()?.to_string();
        Some(name)
    }

    /// Locate the MPI wrapper marker symbol; if present, collect every
    /// symbol whose name is in the fixed operation table.
    fn resolve_mpi_descriptors(file: &object::File) -> Vec<MpiFunctionDescriptor> {
        let has_marker = file
            .symbols()
            .any(|sym| sym.name() == Ok(mpi_table::MPI_WRAPPER_MARKER));
        if !has_marker {
            return Vec::new();
        }

        let mut descriptors = Vec::new();
        for symbol in file.symbols() {
            let name = match symbol.name() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if let Some(op_info) = mpi_table::lookup(name) {
                descriptors.push(MpiFunctionDescriptor {
                    name: name.to_string(),
                    low_pc: symbol.address(),
                    params: op_info.params,
                    op_info,
                });
            }
        }
        descriptors
    }
}

impl DwarfIndex for GimliDwarfIndex {
    fn line_to_pc(&self, source_file: &str, line: u32) -> Option<u64> {
        self.lines
            .iter()
            .filter(|entry| entry.file.ends_with(source_file) && entry.line >= line)
            .min_by_key(|entry| entry.line)
            .map(|entry| entry.address)
    }

    fn entry_source_file(&self, function_name: &str) -> Option<String> {
        self.function_files.get(function_name).cloned()
    }

    fn mpi_function_descriptors(&self) -> Vec<MpiFunctionDescriptor> {
        self.mpi_descriptors.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDwarfIndex {
        descriptors: Vec<MpiFunctionDescriptor>,
    }

    impl DwarfIndex for FakeDwarfIndex {
        fn line_to_pc(&self, _source_file: &str, _line: u32) -> Option<u64> {
            Some(0x4000)
        }

        fn entry_source_file(&self, _function_name: &str) -> Option<String> {
            Some("main.c".to_string())
        }

        fn mpi_function_descriptors(&self) -> Vec<MpiFunctionDescriptor> {
            self.descriptors.clone()
        }
    }

    #[test]
    fn fake_index_surfaces_descriptors_unchanged() {
        let op_info = mpi_table::lookup("MPI_Send").unwrap();
        let fake = FakeDwarfIndex {
            descriptors: vec![MpiFunctionDescriptor {
                name: "MPI_Send".to_string(),
                low_pc: 0x1000,
                params: op_info.params,
                op_info,
            }],
        };
        let descriptors = fake.mpi_function_descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "MPI_Send");
    }
}

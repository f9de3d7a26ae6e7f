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

//! The state a single node owns, and the trace loop that drives it.
//! Everything here runs on one dedicated OS thread -- the thread that
//! attached the tracer -- per SPEC_FULL.md §5; every other thread talks
//! to it only by sending a [`TracerMessage`].

use crate::breakpoint::BreakpointMap;
use crate::checkpoint_store::{CheckpointStore, SnapshotId};
use crate::dwarf::DwarfIndex;
use crate::error::TracerError;
use crate::mpi_interceptor::{self, InterceptOutcome};
use crate::process_map::ProcessMap;
use crate::rpc_client::{ReporterClient, RestoreRequest};
use crate::symbol_index::SymbolIndex;
use crate::tracer::Tracer;
use rdb_proto::model::{CheckpointId, NodeId, StopReason};
use rdb_proto::rpc::{Command, CommandOutcome};
use std::sync::mpsc::{Receiver, Sender};

/// A CLI/remote command delivered to the tracer thread, with a reply
/// channel for its outcome.
pub struct CliRequest {
    pub command: Command,
    pub reply: Sender<CommandOutcome>,
}

/// Everything that can arrive on the tracer thread's single inbound
/// channel: a CLI/remote command, or an orchestrator-issued restore.
pub enum TracerMessage {
    Cli(CliRequest),
    Restore(RestoreRequest),
}

/// All per-node state owned by the tracer thread.
pub struct NodeContext {
    pub tracer: Tracer,
    pub breakpoints: BreakpointMap,
    pub store: Box<dyn CheckpointStore>,
    pub dwarf: Box<dyn DwarfIndex>,
    pub symbols: SymbolIndex,
    pub node_id: NodeId,
    pub reporter: ReporterClient,
    /// This node's own checkpoint id -> snapshot id log, in the same
    /// order the orchestrator's copy is in. Used to find which snapshot
    /// to restore, and which snapshots to discard on truncation.
    local_log: Vec<(CheckpointId, SnapshotId)>,
    next_call_id: u64,
}

impl NodeContext {
    pub fn new(
        tracer: Tracer,
        store: Box<dyn CheckpointStore>,
        dwarf: Box<dyn DwarfIndex>,
        node_id: NodeId,
        reporter: ReporterClient,
    ) -> Result<NodeContext, TracerError> {
        let process_map =
            ProcessMap::new(tracer.pid()).map_err(|e| TracerError::TracerIO(e.to_string()))?;
        let mut symbols = SymbolIndex::new();
        symbols.add_symbols(&process_map);

        Ok(NodeContext {
            tracer,
            breakpoints: BreakpointMap::new(),
            store,
            dwarf,
            symbols,
            node_id,
            reporter,
            local_log: Vec::new(),
            next_call_id: 0,
        })
    }

    /// Install a breakpoint at every MPI entry point the DWARF
    /// collaborator found (spec.md §4.3, initialization). A node whose
    /// target doesn't link the MPI wrapper library simply installs none.
    pub fn install_mpi_breakpoints(&mut self) -> Result<(), TracerError> {
        for descriptor in self.dwarf.mpi_function_descriptors() {
            self.breakpoints.insert_mpi(&self.tracer, descriptor)?;
        }
        Ok(())
    }

    fn set_line_breakpoint(&mut self, line: u32) -> Result<String, TracerError> {
        let source_file = self
            .dwarf
            .entry_source_file("main")
            .unwrap_or_else(|| "main.c".to_string());
        let address = self
            .dwarf
            .line_to_pc(&source_file, line)
            .ok_or_else(|| TracerError::DwarfLookupFailed(format!("no pc for line {}", line)))?;
        self.breakpoints
            .insert_line(&self.tracer, address, source_file.clone(), line)?;
        Ok(format!("breakpoint set at {}:{}", source_file, line))
    }

    fn print_variable(&self, name: &str) -> Result<String, TracerError> {
        let symbol = self
            .symbols
            .symbols_by_name
            .get(name)
            .and_then(|entries| entries.first())
            .ok_or_else(|| TracerError::DwarfLookupFailed(format!("unknown symbol {}", name)))?;
        let bytes = self.tracer.read_memory(symbol.address, 4)?;
        let value = i32::from_le_bytes(bytes.try_into().unwrap_or([0; 4]));
        Ok(format!("{} = {}", name, value))
    }

    fn last_checkpoint(&self) -> Option<&(CheckpointId, SnapshotId)> {
        self.local_log.last()
    }

    fn restore_to(&mut self, target: &CheckpointId) -> Result<(), TracerError> {
        let index = self
            .local_log
            .iter()
            .position(|(id, _)| id == target)
            .ok_or_else(|| TracerError::SnapshotFailed(format!("unknown checkpoint {}", target)))?;

        let snapshot_id = self.local_log[index].1.clone();
        self.store.restore(&self.tracer, &snapshot_id)?;

        // Discard every snapshot strictly newer than the restore point
        // (spec.md §5, "Resource ownership").
        for (_, discarded) in self.local_log.split_off(index + 1) {
            self.store.discard(&discarded)?;
        }
        Ok(())
    }
}

/// Result of driving the node's trace loop to completion.
pub enum NodeOutcome {
    Exited(i32),
    Signaled(i32),
}

/// The node's main trace loop (spec.md §4.3's per-hit protocol, driven
/// continuously). Runs until the target exits or a fatal `TracerError`
/// occurs.
pub fn run_trace_loop(
    mut ctx: NodeContext,
    inbox: Receiver<TracerMessage>,
) -> Result<NodeOutcome, TracerError> {
    loop {
        // Service any requests that arrived while the target was last
        // stopped, before resuming it.
        while let Ok(message) = inbox.try_recv() {
            dispatch(&mut ctx, message)?;
        }

        match ctx.tracer.continue_until_stop() {
            Ok(StopReason::Exited(code)) => return Ok(NodeOutcome::Exited(code)),
            Ok(StopReason::Signal(sig)) => {
                log::warn!("node {:?} target stopped by signal {}", ctx.node_id, sig);
                continue;
            }
            Ok(StopReason::Breakpoint(address)) => {
                if let Err(err) = handle_breakpoint(&mut ctx, address, &inbox) {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    log::error!("error handling breakpoint at {:#x}: {}", address, err);
                    if matches!(err, TracerError::BreakpointMiss { .. }) {
                        // spec.md §7: spurious trap at an address we have
                        // no record of. Dump registers, step past it, and
                        // keep going rather than re-trapping forever.
                        match ctx.tracer.get_registers() {
                            Ok(regs) => log::error!(
                                "register dump at spurious trap: rip={:#x} rsp={:#x}",
                                regs.rip, regs.rsp
                            ),
                            Err(e) => log::error!("failed to dump registers: {}", e),
                        }
                        if let Err(step_err) = ctx.tracer.single_step() {
                            log::error!("failed to step past spurious trap: {}", step_err);
                        }
                    }
                }
            }
            Err(err) => {
                if err.is_fatal() {
                    let _ = ctx.tracer.kill();
                    return Err(err);
                }
                log::error!("tracer error: {}", err);
            }
        }
    }
}

fn handle_breakpoint(
    ctx: &mut NodeContext,
    address: u64,
    inbox: &Receiver<TracerMessage>,
) -> Result<(), TracerError> {
    match mpi_interceptor::decode_trap(ctx, address, ctx.node_id, &mut ctx.next_call_id)? {
        InterceptOutcome::MpiCall(record) => {
            if let Err(err) = ctx.reporter.mpi_call(record.clone()) {
                log::error!("failed to report MPI call to orchestrator: {}", err);
            }

            let snapshot_id = match ctx.store.snapshot(&ctx.tracer) {
                Ok(id) => Some(id),
                Err(err) => {
                    log::error!("checkpoint snapshot failed: {}", err);
                    None
                }
            };
            if let Some(snapshot_id) = snapshot_id {
                ctx.local_log.push((record.id.clone(), snapshot_id));
            }

            ctx.breakpoints.step_through(&ctx.tracer, address)?;
            Ok(())
        }
        InterceptOutcome::LineBreakpoint { source_file, line } => {
            log::info!("stopped at user breakpoint {}:{}", source_file, line);
            // Block for the next CLI command; this is a user-requested
            // stop, unlike an MPI entry which resumes automatically.
            wait_for_user_command(ctx, address, inbox)
        }
    }
}

fn wait_for_user_command(
    ctx: &mut NodeContext,
    address: u64,
    inbox: &Receiver<TracerMessage>,
) -> Result<(), TracerError> {
    loop {
        let message = inbox
            .recv()
            .map_err(|_| TracerError::TracerIO("command channel closed".to_string()))?;
        match message {
            TracerMessage::Restore(request) => {
                let outcome = handle_restore(ctx, request);
                if outcome.is_err() {
                    continue;
                }
            }
            TracerMessage::Cli(request) => {
                let command = request.command.clone();
                let detail = match &command {
                    Command::Continue => {
                        ctx.breakpoints.step_through(&ctx.tracer, address)?;
                        let _ = request.reply.send(CommandOutcome {
                            command,
                            detail: "continuing".to_string(),
                            exited: false,
                        });
                        return Ok(());
                    }
                    Command::SetLineBreakpoint { line } => ctx
                        .set_line_breakpoint(*line)
                        .unwrap_or_else(|e| format!("error: {}", e)),
                    Command::PrintVariable { name } => ctx
                        .print_variable(name)
                        .unwrap_or_else(|e| format!("error: {}", e)),
                    Command::RestoreLastCheckpoint => match ctx.last_checkpoint().cloned() {
                        Some((id, _)) => match ctx.restore_to(&id) {
                            Ok(()) => format!("restored to {}", id),
                            Err(e) => format!("error: {}", e),
                        },
                        None => "no checkpoint to restore".to_string(),
                    },
                    Command::Quit => {
                        let _ = ctx.tracer.detach();
                        let _ = request.reply.send(CommandOutcome {
                            command,
                            detail: "quit".to_string(),
                            exited: true,
                        });
                        return Err(TracerError::TracerIO("quit requested".to_string()));
                    }
                };
                let _ = request.reply.send(CommandOutcome {
                    command,
                    detail,
                    exited: false,
                });
            }
        }
    }
}

fn dispatch(ctx: &mut NodeContext, message: TracerMessage) -> Result<(), TracerError> {
    match message {
        TracerMessage::Restore(request) => {
            let _ = handle_restore(ctx, request);
            Ok(())
        }
        TracerMessage::Cli(request) => {
            let command = request.command.clone();
            let detail = match &command {
                Command::SetLineBreakpoint { line } => ctx
                    .set_line_breakpoint(*line)
                    .unwrap_or_else(|e| format!("error: {}", e)),
                Command::PrintVariable { name } => ctx
                    .print_variable(name)
                    .unwrap_or_else(|e| format!("error: {}", e)),
                Command::RestoreLastCheckpoint => match ctx.last_checkpoint().cloned() {
                    Some((id, _)) => match ctx.restore_to(&id) {
                        Ok(()) => format!("restored to {}", id),
                        Err(e) => format!("error: {}", e),
                    },
                    None => "no checkpoint to restore".to_string(),
                },
                Command::Continue => "already running".to_string(),
                Command::Quit => {
                    let _ = ctx.tracer.detach();
                    let _ = request.reply.send(CommandOutcome {
                        command,
                        detail: "quit".to_string(),
                        exited: true,
                    });
                    return Err(TracerError::TracerIO("quit requested".to_string()));
                }
            };
            let _ = request.reply.send(CommandOutcome {
                command,
                detail,
                exited: false,
            });
            Ok(())
        }
    }
}

fn handle_restore(ctx: &mut NodeContext, request: RestoreRequest) -> Result<(), TracerError> {
    let result = ctx.restore_to(&request.checkpoint_id);
    let reply = match &result {
        Ok(()) => Ok(()),
        Err(err) => Err(err.to_string()),
    };
    let _ = request.reply.send(reply);
    result
}

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

//! Line-breakpoint and restore-to-last-checkpoint, driven over the node's
//! interactive CLI on a single node with no orchestrator peer to pair
//! against (spec.md §8 scenario 5).

use anyhow::{anyhow, Result};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::SocketAddr;

/// Send one REPL line and read back the single-line reply the node prints
/// for it, the same protocol `rdb-tracer::cli::run_repl` speaks.
fn send_command(
    stdin: &mut impl Write,
    stdout: &mut impl BufRead,
    command: &str,
) -> Result<String> {
    writeln!(stdin, "{}", command)?;
    stdin.flush()?;

    // The REPL prints a "(rdb) " prompt with no trailing newline before
    // each reply; skip it so the reply line itself can be read whole.
    let mut prompt = [0u8; 6];
    stdout.read_exact(&mut prompt)?;
    if &prompt != b"(rdb) " {
        return Err(anyhow!("unexpected prompt bytes: {:?}", prompt));
    }

    let mut line = String::new();
    stdout.read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}

#[test]
fn line_breakpoint_then_restore_to_last_checkpoint() -> Result<()> {
    let rpc_addr: SocketAddr = "127.0.0.1:19600".parse().unwrap();
    let ui_addr: SocketAddr = "127.0.0.1:19601".parse().unwrap();
    let node_listen: SocketAddr = "127.0.0.1:19610".parse().unwrap();

    let binary = integration_test::compile_tracee("breakpoint_demo.c")?;
    let line = integration_test::find_marker_line("breakpoint_demo.c", "BREAKPOINT_LINE")?;

    let _orchestrator = integration_test::Orchestrator::spawn(rpc_addr, ui_addr)?;
    let (_node, stdin, stdout) =
        integration_test::Node::spawn(&binary, &[], rpc_addr, node_listen, true)?;

    let mut stdin = stdin.ok_or_else(|| anyhow!("no stdin on interactive node"))?;
    let mut stdout = BufReader::new(stdout.ok_or_else(|| anyhow!("no stdout on interactive node"))?);

    // The tracee sleeps for 2 seconds before its first MPI call, which is
    // ample time for the breakpoint to land before execution reaches it.
    let set = send_command(&mut stdin, &mut stdout, &format!("b {}", line))?;
    assert!(set.contains(&line.to_string()), "unexpected reply: {}", set);

    let before = send_command(&mut stdin, &mut stdout, "c")?;
    assert_eq!(before, "continuing");

    // No extra synchronization needed: the next command blocks on the
    // tracer thread's reply, which isn't sent until the target actually
    // stops at the breakpoint again.
    let printed = send_command(&mut stdin, &mut stdout, "p global")?;
    assert!(
        printed.starts_with("global = ") && !printed.ends_with("= 0"),
        "expected a mutated value, got: {}",
        printed
    );

    let restored = send_command(&mut stdin, &mut stdout, "r")?;
    assert!(
        restored.starts_with("restored to "),
        "unexpected restore reply: {}",
        restored
    );

    // The only checkpoint on this node is the barrier recorded while
    // `global` was still zero, so restoring to it must reset the value.
    let after = send_command(&mut stdin, &mut stdout, "p global")?;
    assert_eq!(after, "global = 0");

    send_command(&mut stdin, &mut stdout, "q")?;

    Ok(())
}

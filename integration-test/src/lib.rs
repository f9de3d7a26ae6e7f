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

//! Black-box harness for driving real `rdb-orchestrator`/`rdb-tracer`
//! binaries against the synthetic MPI targets in `tracee/`, the same
//! shape as the teacher's own `compile_source`/env-var-located-binary
//! pattern, retargeted from tracing an allocator to tracing MPI calls.

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use rdb_proto::rpc::UiMessage;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Compile a synthetic tracee C source under `tracee/` into a throwaway
/// binary under `/tmp`. Mirrors the teacher's `compile_source`, minus
/// the C++/Rust branches this test pack has no use for.
pub fn compile_tracee(filename: &str) -> Result<PathBuf> {
    let source_path = format!(
        "{}/tracee/{}",
        env!("CARGO_MANIFEST_DIR"),
        filename
    );
    let binary_path = PathBuf::from(format!(
        "/tmp/{}-{}",
        filename.trim_end_matches(".c"),
        std::process::id()
    ));

    let cc = std::env::var("TEST_CC").unwrap_or_else(|_| "cc".to_string());
    let status = Command::new(&cc)
        .args(["-g", "-O0", &source_path, "-o"])
        .arg(&binary_path)
        .status()
        .with_context(|| format!("spawning {}", cc))?;
    if !status.success() {
        return Err(anyhow!("{} exited with {:?}", cc, status.code()));
    }
    Ok(binary_path)
}

/// Path to the `rdb-orchestrator` binary under test. Set by the test
/// runner, same convention as the teacher's `TEST_ALLOCSCOPE_TRACE`.
fn rdb_orchestrator_path() -> Result<PathBuf> {
    std::env::var("TEST_RDB_ORCHESTRATOR")
        .map(PathBuf::from)
        .context("TEST_RDB_ORCHESTRATOR must point at a built rdb-orchestrator binary")
}

/// Path to the `rdb-tracer` binary under test.
fn rdb_tracer_path() -> Result<PathBuf> {
    std::env::var("TEST_RDB_TRACER")
        .map(PathBuf::from)
        .context("TEST_RDB_TRACER must point at a built rdb-tracer binary")
}

/// A running `rdb-orchestrator` process, killed on drop.
pub struct Orchestrator {
    child: Child,
    pub rpc_addr: SocketAddr,
    pub ui_addr: SocketAddr,
}

impl Orchestrator {
    /// Spawn against the given RPC/UI addresses. Callers pick distinct
    /// ports per test binary so parallel test runs don't collide on the
    /// same socket.
    pub fn spawn(rpc_addr: SocketAddr, ui_addr: SocketAddr) -> Result<Orchestrator> {
        let child = Command::new(rdb_orchestrator_path()?)
            .args([
                "--rpc-listen",
                &rpc_addr.to_string(),
                "--ui-listen",
                &ui_addr.to_string(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning rdb-orchestrator")?;
        Ok(Orchestrator {
            child,
            rpc_addr,
            ui_addr,
        })
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A running `rdb-tracer` node agent, killed on drop.
pub struct Node {
    child: Child,
}

impl Node {
    /// Spawn a node tracing `target` (already compiled), reporting to
    /// `orchestrator_rpc`. `listen` pins the node's own command port so
    /// the test doesn't have to learn the orchestrator-assigned node id
    /// to find it.
    pub fn spawn(
        target: &std::path::Path,
        target_args: &[&str],
        orchestrator_rpc: SocketAddr,
        listen: SocketAddr,
        interactive: bool,
    ) -> Result<(Node, Option<std::process::ChildStdin>, Option<std::process::ChildStdout>)> {
        let mut command = Command::new(rdb_tracer_path()?);
        command
            .arg(target)
            .arg("--orchestrator")
            .arg(orchestrator_rpc.to_string())
            .arg("--listen")
            .arg(listen.to_string());

        if interactive {
            command.arg("--cli");
            command.stdin(Stdio::piped());
            command.stdout(Stdio::piped());
        } else {
            command.stdout(Stdio::null());
        }
        // `target_args` is clap's `last = true` positional: everything
        // after `--` goes to the target, so flags must all precede it.
        command.arg("--").args(target_args);
        command.stderr(Stdio::null());

        let mut child = command.spawn().context("spawning rdb-tracer")?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        Ok((Node { child }, stdin, stdout))
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Connect to the orchestrator's UI websocket.
pub async fn connect_ui(
    ui_addr: SocketAddr,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let url = format!("ws://{}/ws", ui_addr);
    // The orchestrator's listener may still be coming up; retry briefly
    // rather than requiring the caller to sleep first.
    for _ in 0..50 {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => return Ok(ws),
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    Err(anyhow!("could not connect to UI socket at {}", url))
}

/// Read `UiMessage`s off the socket until `pred` accepts one or the
/// overall deadline elapses.
pub async fn wait_for_ui_message<F>(
    ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    deadline: Duration,
    mut pred: F,
) -> Result<UiMessage>
where
    F: FnMut(&UiMessage) -> bool,
{
    timeout(deadline, async {
        loop {
            let frame = ws
                .next()
                .await
                .ok_or_else(|| anyhow!("UI socket closed"))??;
            if let Message::Text(text) = frame {
                let message: UiMessage = serde_json::from_str(&text)?;
                if pred(&message) {
                    return Ok(message);
                }
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for matching UI message"))?
}

pub async fn send_ui_message(
    ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    message: &UiMessage,
) -> Result<()> {
    let text = serde_json::to_string(message)?;
    ws.send(Message::Text(text)).await?;
    Ok(())
}

/// Locate the 1-based line number of the first line containing `marker`
/// in a tracee source file, so tests never hardcode a line number that
/// silently drifts out of sync with the source.
pub fn find_marker_line(filename: &str, marker: &str) -> Result<u32> {
    let source_path = format!("{}/tracee/{}", env!("CARGO_MANIFEST_DIR"), filename);
    let contents = std::fs::read_to_string(&source_path)?;
    for (ix, line) in contents.lines().enumerate() {
        if line.contains(marker) {
            return Ok((ix + 1) as u32);
        }
    }
    Err(anyhow!("marker {} not found in {}", marker, filename))
}

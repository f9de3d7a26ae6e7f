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

//! The local CLI surface of spec.md §6: `b <line>`, `c`, `r`, `p <var>`,
//! `q`. Hand-parsed the way `allocscope-trace::commandline` hand-parses
//! its process flags -- a five-command REPL doesn't need an external
//! argument-parsing crate.

use crate::context::{CliRequest, TracerMessage};
use rdb_proto::rpc::Command;
use std::io::{self, BufRead, Write};
use std::sync::mpsc::Sender;

fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim();
    let mut parts = line.splitn(2, char::is_whitespace);
    let head = parts.next()?;
    let rest = parts.next().unwrap_or("").trim();

    match head {
        "b" => rest.parse::<u32>().ok().map(|line| Command::SetLineBreakpoint { line }),
        "c" => Some(Command::Continue),
        "r" => Some(Command::RestoreLastCheckpoint),
        "p" if !rest.is_empty() => Some(Command::PrintVariable {
            name: rest.to_string(),
        }),
        "q" => Some(Command::Quit),
        _ => None,
    }
}

/// Run the interactive REPL on the calling thread, forwarding parsed
/// commands to the tracer thread over `to_tracer` and printing the
/// outcome of each.
pub fn run_repl(to_tracer: Sender<TracerMessage>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("(rdb) ");
        let _ = stdout.flush();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }

        let command = match parse_line(&line) {
            Some(command) => command,
            None => {
                println!("unrecognized command: {}", line.trim());
                continue;
            }
        };
        let is_quit = matches!(command, Command::Quit);

        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        if to_tracer
            .send(TracerMessage::Cli(CliRequest {
                command,
                reply: reply_tx,
            }))
            .is_err()
        {
            println!("tracer thread has exited");
            break;
        }

        match reply_rx.recv() {
            Ok(outcome) => {
                println!("{}", outcome.detail);
                if outcome.exited || is_quit {
                    break;
                }
            }
            Err(_) => {
                println!("tracer thread has exited");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_five_commands() {
        assert!(matches!(
            parse_line("b 26"),
            Some(Command::SetLineBreakpoint { line: 26 })
        ));
        assert!(matches!(parse_line("c"), Some(Command::Continue)));
        assert!(matches!(
            parse_line("r"),
            Some(Command::RestoreLastCheckpoint)
        ));
        assert!(matches!(
            parse_line("p global"),
            Some(Command::PrintVariable { name }) if name == "global"
        ));
        assert!(matches!(parse_line("q"), Some(Command::Quit)));
    }

    #[test]
    fn rejects_unknown_commands() {
        assert!(parse_line("xyz").is_none());
        assert!(parse_line("b notanumber").is_none());
    }
}

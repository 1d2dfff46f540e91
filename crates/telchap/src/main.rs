//! `telchap` — thin client for the control plane (spec.md §4.7).
//!
//! Sends one command line to `/dev/chaperone.sock` (request/response) or,
//! when that socket isn't reachable, falls back to writing a one-shot line
//! into the `/dev/chaperone` FIFO. Grounded on the teacher's `systemctl`
//! binary's overall shape — parse argv, talk to PID 1's control channel,
//! print its reply — minus the JSON-RPC framing, which Chaperone replaces
//! with the `RESULT`/`COMMAND-ERROR`/`EXCEPTION` line protocol.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

const SOCKET_PATH: &str = "/dev/chaperone.sock";
const FIFO_PATH: &str = "/dev/chaperone";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: telchap <status|loglevel|shutdown|start|stop|reset|enable|disable|dependencies> [args...]");
        std::process::exit(1);
    }
    let line = shlex::try_join(args.iter().map(String::as_str)).unwrap_or_else(|_| args.join(" "));

    match send_via_socket(&line) {
        Ok(reply) => print_and_exit(&reply),
        Err(_) => match send_via_fifo(&line) {
            Ok(()) => {}
            Err(e) => {
                eprintln!("telchap: could not reach chaperone: {e}");
                std::process::exit(1);
            }
        },
    }
}

fn send_via_socket(line: &str) -> std::io::Result<String> {
    let mut stream = UnixStream::connect(SOCKET_PATH)?;
    writeln!(stream, "{line}")?;
    stream.shutdown(std::net::Shutdown::Write)?;
    let mut reader = BufReader::new(stream);
    let mut kind = String::new();
    reader.read_line(&mut kind)?;
    let mut body = String::new();
    for line in reader.lines() {
        body.push_str(&line?);
        body.push('\n');
    }
    Ok(format!("{}{}", kind, body))
}

fn send_via_fifo(line: &str) -> std::io::Result<()> {
    let mut fifo = std::fs::OpenOptions::new().write(true).open(FIFO_PATH)?;
    writeln!(fifo, "{line}")
}

fn print_and_exit(reply: &str) {
    let mut lines = reply.lines();
    match lines.next() {
        Some("RESULT") => {
            print!("{}", lines.collect::<Vec<_>>().join("\n"));
            println!();
        }
        Some("COMMAND-ERROR") => {
            eprintln!("{}", lines.collect::<Vec<_>>().join("\n"));
            std::process::exit(2);
        }
        Some("EXCEPTION") => {
            eprintln!("{}", lines.collect::<Vec<_>>().join("\n"));
            std::process::exit(1);
        }
        _ => print!("{reply}"),
    }
}

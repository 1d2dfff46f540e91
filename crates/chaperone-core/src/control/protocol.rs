//! The `telchap` command grammar and the newline-framed reply protocol.
//!
//! Grounded on the teacher's `control::control` module (`Command` enum +
//! `parse_command`/`execute_command` shape: parse, then execute, then
//! serialize) and its `clap`-derive CLI parsing reused in "parse a line,
//! don't exit the process" mode via `Cli::try_parse_from`. The wire format
//! itself is spec.md's own newline-framed text protocol (`RESULT`/
//! `COMMAND-ERROR`/`EXCEPTION`), not the teacher's JSON-RPC 2.0.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "telchap", no_binary_name = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    Status,
    Loglevel {
        level: Option<String>,
    },
    Shutdown {
        delay: Option<u64>,
    },
    Start(TargetArgs),
    Stop(TargetArgs),
    Reset(TargetArgs),
    Enable {
        name: Vec<String>,
    },
    Disable {
        name: Vec<String>,
    },
    Dependencies,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TargetArgs {
    #[arg(long)]
    pub force: bool,
    #[arg(long)]
    pub wait: bool,
    #[arg(long, conflicts_with = "enable")]
    pub disable: bool,
    #[arg(long, conflicts_with = "disable")]
    pub enable: bool,
    pub name: Vec<String>,
}

/// Parse one command line (already split on whitespace per shell quoting
/// rules) into a `Command`, reporting clap's own usage message on failure.
pub fn parse_line(line: &str) -> Result<Command, String> {
    let words = shlex::split(line).ok_or_else(|| "unbalanced quotes".to_owned())?;
    Cli::try_parse_from(words)
        .map(|cli| cli.command)
        .map_err(|e| e.to_string())
}

/// A reply frame: `RESULT\n<text>`, `COMMAND-ERROR\n<msg>`, or
/// `EXCEPTION\n<msg>`.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(String),
    CommandError(String),
    Exception(String),
}

impl Reply {
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::Result(text) => format!("RESULT\n{text}\n"),
            Self::CommandError(msg) => format!("COMMAND-ERROR\n{msg}\n"),
            Self::Exception(msg) => format!("EXCEPTION\n{msg}\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status() {
        assert!(matches!(parse_line("status").unwrap(), Command::Status));
    }

    #[test]
    fn parses_start_with_flags() {
        match parse_line("start --force --wait sshd.service").unwrap() {
            Command::Start(args) => {
                assert!(args.force);
                assert!(args.wait);
                assert_eq!(args.name, vec!["sshd.service".to_owned()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_a_command_error() {
        assert!(parse_line("frobnicate").is_err());
    }

    #[test]
    fn reply_framing() {
        assert_eq!(Reply::Result("ok".into()).to_wire(), "RESULT\nok\n");
        assert_eq!(
            Reply::CommandError("bad".into()).to_wire(),
            "COMMAND-ERROR\nbad\n"
        );
    }
}

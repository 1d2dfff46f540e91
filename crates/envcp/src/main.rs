//! `envcp` — variable-expanding file copier. Reads a source file, expands
//! every `%{VAR}`/`%(VAR...)` reference against the calling process's
//! environment using the same engine [`chaperone_core::environment`] uses
//! for service configuration, and writes the result to the destination
//! (spec.md §6).
//!
//! Grounded entirely on `chaperone_core::environment`; the only new code
//! here is the `%{...}` `Syntax` reconfiguration and the copy loop.

use chaperone_core::environment::{Environment, Syntax};
use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "envcp", about = "Copy a file, expanding %{VAR} references")]
struct Cli {
    source: PathBuf,
    destination: PathBuf,
    /// Preserve the source file's Unix permission bits on the copy.
    #[arg(long)]
    preserve_mode: bool,
}

fn main() {
    let cli = Cli::parse();

    let text = match fs::read_to_string(&cli.source) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("envcp: reading {}: {e}", cli.source.display());
            std::process::exit(1);
        }
    };

    let syntax = Syntax {
        prefix: '%',
        openers: vec![('{', '}'), ('(', ')')],
    };
    let env = Environment::from_pairs(syntax, std::env::vars());

    let expanded = match env.expand(&text) {
        Ok(expanded) => expanded,
        Err(e) => {
            eprintln!("envcp: expanding {}: {e}", cli.source.display());
            std::process::exit(1);
        }
    };

    if let Err(e) = fs::write(&cli.destination, expanded) {
        eprintln!("envcp: writing {}: {e}", cli.destination.display());
        std::process::exit(1);
    }

    if cli.preserve_mode {
        if let Ok(meta) = fs::metadata(&cli.source) {
            let _ = fs::set_permissions(&cli.destination, meta.permissions());
        }
    }
}

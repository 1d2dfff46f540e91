#![allow(clippy::result_large_err)]

//! `chaperone-core` is the supervision engine shared by the `chaperone` PID-1
//! binary and its satellite tools (`telchap`, `sdnotify`, `sdnotify-exec`,
//! `envcp`).
//!
//! It contains:
//! - The environment expansion engine (`environment`)
//! - The process-status value wrapping POSIX wait() bits (`procstatus`)
//! - The per-PID reaper tied to `waitpid(-1)` (`reaper`)
//! - The service state machine and its six process-type disciplines (`service`)
//! - The dependency-ordered service collection (`family`)
//! - The top-level controller: signals, shutdown, readiness (`controller`)
//! - The syslog ingestor, selector language, and sinks (`syslog`)
//! - The control-plane protocol and FIFO/UDS servers (`control`)
//! - Configuration loading from YAML (`config`)

pub mod config;
pub mod control;
pub mod controller;
pub mod environment;
pub mod error;
pub mod family;
pub mod lock_ext;
pub mod logging;
pub mod procstatus;
pub mod reaper;
pub mod service;
pub mod syslog;

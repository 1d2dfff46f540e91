//! Control-plane protocol and FIFO/UDS servers (spec.md §4.7).

pub mod log_control;
pub mod protocol;
pub mod server;

pub use log_control::LogControl;
pub use protocol::{Cli, Command, Reply};
pub use server::{execute, serve_fifo, serve_unix_socket};

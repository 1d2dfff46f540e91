//! Syslog ingestor, selector language, and sinks (spec.md §4.6).

pub mod ingestor;
pub mod selector;
pub mod sinks;

pub use ingestor::Ingestor;
pub use selector::Selector;
pub use sinks::{ConsoleSink, FileSink, RemoteSink, Route, Sink};

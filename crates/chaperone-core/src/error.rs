//! Typed error kinds for every subsystem, matching the five kinds in the
//! error-handling design: Parameter, NotFound, Process, Variable, System.
//!
//! Each carries enough context to reproduce a user-facing message without
//! the caller having to reformat a bare `String`, mirroring the teacher's
//! `UnitOperationError { unit_name, unit_id, reason }` shape.

use std::path::PathBuf;
use thiserror::Error;

/// `$(K:?msg)` on an unset variable, or a malformed `:/pat/repl/flags` form.
#[derive(Debug, Error, Clone)]
pub enum EnvError {
    #[error("variable {0:?} is required: {1}")]
    Required(String, String),
    #[error("malformed substitution operator in {0:?}: {1}")]
    Parameter(String, String),
}

/// Bad CLI flag, unknown service name, illegal selector, malformed interval,
/// bad uid/gid, invalid boolean/integer coercion. Never kills the system.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: {message}")]
    Parameter { path: PathBuf, message: String },
    #[error("service {0:?} not found")]
    UnknownService(String),
    #[error("dependency cycle involving {0:?}")]
    Cycle(String),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failed spawn, pidfile timeout, abnormal exit during startup, notify
/// timeout. Respects `ignore_failures`.
#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    #[error("{service}: {command:?} not found ({reason})")]
    NotFound {
        service: String,
        command: String,
        reason: String,
    },
    #[error("{service}: spawn failed: {source}")]
    Spawn { service: String, source: String },
    #[error("{service}: timed out waiting for {what} after {elapsed:?}")]
    Timeout {
        service: String,
        what: String,
        elapsed: std::time::Duration,
    },
    #[error("{service}: pidfile {path:?} never appeared")]
    PidfileTimeout { service: String, path: PathBuf },
    #[error("{service}: exited abnormally: {status}")]
    AbnormalExit {
        service: String,
        status: crate::procstatus::ProcStatus,
    },
    #[error("{service}: {0}", service = .service)]
    Env {
        service: String,
        #[source]
        source: EnvError,
    },
    #[error("{service}: {message}")]
    Generic { service: String, message: String },
}

/// Errors surfaced by the control plane protocol parser/executor.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Command error: {0}")]
    Grammar(String),
    #[error("{0}")]
    Exception(String),
}

/// Malformed selector grammar, sink I/O failure, unparseable bind address.
#[derive(Debug, Error)]
pub enum SyslogError {
    #[error("malformed selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("sink {name:?} io error: {source}")]
    SinkIo {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bind {path:?} failed: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Unrecoverable: reaper lost, bind failures on PID-1 sockets. Logged and
/// forwarded to `kill_system` with an errno.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("{0}")]
    Fatal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

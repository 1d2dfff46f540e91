//! `ProcStatus` — the 16-bit POSIX wait status, decoded on demand.
//!
//! Grounded on the teacher's `signal_handler::ChildTermination`, which
//! already distinguishes `Exited(pid, code)` from `Signaled(pid, signal)`
//! coming out of `waitpid`. `ProcStatus` extends that with the `errno`
//! override notify-originated failures need (spec.md §3) and the
//! `normal_exit` convenience predicate services use to decide whether an
//! exit was abnormal.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// The decoded outcome of a reaped child, or a notify-protocol failure that
/// never went through `waitpid` at all (`ERRNO=`/`BUSERROR=`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcStatus {
    Exited(i32),
    Signaled(Signal),
    /// Synthesised from a notify datagram (`ERRNO=n` or `BUSERROR=...`)
    /// rather than a real wait() status.
    NotifyErrno(i32),
}

impl ProcStatus {
    #[must_use]
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::Signaled(signal)),
            _ => None,
        }
    }

    #[must_use]
    pub const fn exited(&self) -> bool {
        matches!(self, Self::Exited(_))
    }

    #[must_use]
    pub const fn signaled(&self) -> bool {
        matches!(self, Self::Signaled(_))
    }

    #[must_use]
    pub const fn exit_status(&self) -> Option<i32> {
        match self {
            Self::Exited(code) | Self::NotifyErrno(code) => Some(*code),
            Self::Signaled(_) => None,
        }
    }

    #[must_use]
    pub const fn signal(&self) -> Option<Signal> {
        match self {
            Self::Signaled(sig) => Some(*sig),
            _ => None,
        }
    }

    /// `exit_status == 0 ∧ not signaled`.
    #[must_use]
    pub fn normal_exit(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Whether this exit matches the service's configured kill signal, i.e.
    /// was an expected termination rather than an abnormal one.
    #[must_use]
    pub fn matches_kill_signal(&self, kill_signal: Signal) -> bool {
        matches!(self, Self::Signaled(sig) if *sig == kill_signal)
    }
}

impl fmt::Display for ProcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(sig) => write!(f, "signal {sig}"),
            Self::NotifyErrno(code) => write!(f, "errno {code} (via notify)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_exit_is_only_exit_zero() {
        assert!(ProcStatus::Exited(0).normal_exit());
        assert!(!ProcStatus::Exited(1).normal_exit());
        assert!(!ProcStatus::Signaled(Signal::SIGTERM).normal_exit());
    }

    #[test]
    fn kill_signal_match() {
        let st = ProcStatus::Signaled(Signal::SIGTERM);
        assert!(st.matches_kill_signal(Signal::SIGTERM));
        assert!(!st.matches_kill_signal(Signal::SIGKILL));
    }
}

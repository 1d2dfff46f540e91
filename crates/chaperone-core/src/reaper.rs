//! `Reaper` — ties `waitpid(-1, WNOHANG)` to per-PID callbacks.
//!
//! Grounded directly on the teacher's `signal_handler::handle_signals` +
//! `get_next_exited_child` drain loop, and the `ArcMutPidTable`
//! deadlock-avoidance rationale recorded in that file's module doc comment:
//! the signal-handling thread must be able to update the PID table without
//! taking the big controller lock, else a service callback that itself
//! wants to touch the PID table (e.g. to start a dependent) deadlocks
//! against the thread still holding it from the `waitpid` drain.

use crate::procstatus::ProcStatus;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use threadpool::ThreadPool;

type Callback = Box<dyn FnOnce(ProcStatus) + Send + 'static>;

struct Tables {
    callbacks: HashMap<i32, Callback>,
    zombies: HashMap<i32, ProcStatus>,
    /// Incremented across a service's fork-and-register critical section so
    /// that an exit reaped before `add_child_handler` runs is queued in
    /// `zombies` instead of logged as collateral and dropped.
    forks_in_progress: u32,
    had_children: bool,
}

/// Drains `waitpid(-1, WNOHANG)` and dispatches exits to registered
/// callbacks on a thread pool, outside the table lock.
pub struct Reaper {
    tables: Mutex<Tables>,
    pool: ThreadPool,
    on_no_processes: Mutex<Option<Box<dyn Fn() + Send + 'static>>>,
}

impl Reaper {
    #[must_use]
    pub fn new(worker_threads: usize) -> Self {
        Self {
            tables: Mutex::new(Tables {
                callbacks: HashMap::new(),
                zombies: HashMap::new(),
                forks_in_progress: 0,
                had_children: false,
            }),
            pool: ThreadPool::new(worker_threads.max(1)),
            on_no_processes: Mutex::new(None),
        }
    }

    pub fn set_on_no_processes<F: Fn() + Send + 'static>(&self, f: F) {
        *self.on_no_processes.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(f));
    }

    /// Mark the start of a fork-and-register critical section: an exit
    /// reaped for an as-yet-unregistered PID during this window is queued
    /// rather than dropped. Returns a guard that decrements on drop.
    #[must_use]
    pub fn enter_fork_section(self: &Arc<Self>) -> ForkGuard {
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).forks_in_progress += 1;
        ForkGuard { reaper: self.clone() }
    }

    /// If an exit is already queued for `pid`, fire `fn` immediately
    /// (off-lock, on the pool); else record the callback for later.
    pub fn add_child_handler<F>(&self, pid: Pid, callback: F)
    where
        F: FnOnce(ProcStatus) + Send + 'static,
    {
        let queued = {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            tables.zombies.remove(&pid.as_raw())
        };
        if let Some(status) = queued {
            self.pool.execute(move || callback(status));
        } else {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            tables.callbacks.insert(pid.as_raw(), Box::new(callback));
        }
    }

    /// Drain `waitpid(-1, WNOHANG)` now. Call from the signal thread on
    /// `SIGCHLD`, or periodically as a fallback drain.
    pub fn check_processes(&self) {
        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => {
                    let fire = {
                        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
                        let fire = tables.had_children;
                        tables.had_children = false;
                        fire
                    };
                    if fire {
                        if let Some(cb) = self.on_no_processes.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                            cb();
                        }
                    }
                    return;
                }
                Ok(status) => status,
                Err(_) => return,
            };

            let Some(pid) = status.pid() else { continue };
            let Some(decoded) = ProcStatus::from_wait_status(status) else {
                continue;
            };

            let dispatch = {
                let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
                tables.had_children = true;
                if let Some(callback) = tables.callbacks.remove(&pid.as_raw()) {
                    Some(callback)
                } else if tables.forks_in_progress > 0 {
                    tables.zombies.insert(pid.as_raw(), decoded.clone());
                    None
                } else {
                    log::debug!("reaper: collateral exit for untracked pid {pid} ({decoded})");
                    None
                }
            };
            if let Some(callback) = dispatch {
                self.pool.execute(move || callback(decoded));
            }
        }
    }
}

/// RAII guard for a fork-and-register critical section (spec.md §3's
/// "forks counter").
pub struct ForkGuard {
    reaper: Arc<Reaper>,
}

impl Drop for ForkGuard {
    fn drop(&mut self) {
        let mut tables = self.reaper.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.forks_in_progress = tables.forks_in_progress.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn exit_before_registration_is_queued_during_fork_section() {
        let reaper = Arc::new(Reaper::new(1));
        let guard = reaper.enter_fork_section();

        // Simulate an exit arriving for a pid nobody has registered yet by
        // inserting directly into the zombie table via the public surface:
        // fork a real child that exits immediately, then drain before
        // registering the handler.
        let child = nix::unistd::fork();
        match child {
            Ok(nix::unistd::ForkResult::Child) => {
                std::process::exit(0);
            }
            Ok(nix::unistd::ForkResult::Parent { child }) => {
                std::thread::sleep(Duration::from_millis(20));
                reaper.check_processes();
                drop(guard);

                let (tx, rx) = mpsc::channel();
                reaper.add_child_handler(child, move |status| {
                    let _ = tx.send(status);
                });
                let status = rx.recv_timeout(Duration::from_secs(1)).unwrap();
                assert!(status.normal_exit());
            }
            Err(_) => {
                // Sandboxed environments may forbid fork(); skip.
            }
        }
    }

    #[test]
    fn add_child_handler_fires_immediately_when_already_queued() {
        let reaper = Arc::new(Reaper::new(1));
        let child = match nix::unistd::fork() {
            Ok(nix::unistd::ForkResult::Child) => std::process::exit(7),
            Ok(nix::unistd::ForkResult::Parent { child }) => child,
            Err(_) => return,
        };
        let _guard = reaper.enter_fork_section();
        std::thread::sleep(Duration::from_millis(20));
        reaper.check_processes();

        let (tx, rx) = mpsc::channel();
        reaper.add_child_handler(child, move |status| {
            let _ = tx.send(status);
        });
        let status = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(status.exit_status(), Some(7));
    }
}

//! `Controller` — top-level signal ownership, shutdown sequencing, and the
//! notify-socket bridge to a parent supervisor (spec.md §4.5).
//!
//! Grounded on the teacher's `entrypoints::service_manager::run_service_manager`
//! (the `Signals::new([SIGCHLD, SIGTERM, SIGINT, SIGQUIT])` set, spawned on
//! its own thread) and `notification_handler` (datagram-socket forwarding,
//! used here in the reverse direction: Chaperone is the child signalling a
//! parent init, not a service signalling Chaperone).

use crate::family::Family;
use crate::reaper::Reaper;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use signal_hook::consts::{SIGCHLD, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

/// Bridges `READY=1`/`STATUS=`/`STOPPING=` notifications to whatever
/// process is listening on an inherited `$NOTIFY_SOCKET` (i.e. Chaperone
/// itself is supervised, e.g. under a container runtime).
pub struct NotifySink {
    socket: Option<UnixDatagram>,
}

impl NotifySink {
    #[must_use]
    pub fn from_environment() -> Self {
        let socket = std::env::var("NOTIFY_SOCKET").ok().and_then(|path| {
            let sock = UnixDatagram::unbound().ok()?;
            sock.connect(&path).ok()?;
            Some(sock)
        });
        Self { socket }
    }

    pub fn send(&self, payload: &str) {
        if let Some(sock) = &self.socket {
            let _ = sock.send(payload.as_bytes());
        }
    }

    pub fn ready(&self) {
        self.send("READY=1");
    }

    pub fn status(&self, note: &str) {
        self.send(&format!("STATUS={note}"));
    }

    pub fn stopping(&self) {
        self.send("STOPPING=1");
    }
}

pub struct Controller {
    pub reaper: Arc<Reaper>,
    family: RwLock<Weak<Family>>,
    system_alive: AtomicBool,
    killing: AtomicBool,
    pub detect_exit: bool,
    pub shutdown_timeout: Duration,
    pub status_interval: Duration,
    notify: NotifySink,
}

impl Controller {
    #[must_use]
    pub fn new(
        reaper: Arc<Reaper>,
        detect_exit: bool,
        shutdown_timeout: Duration,
        status_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            reaper,
            family: RwLock::new(Weak::new()),
            system_alive: AtomicBool::new(true),
            killing: AtomicBool::new(false),
            detect_exit,
            shutdown_timeout,
            status_interval,
            notify: NotifySink::from_environment(),
        })
    }

    pub fn attach_family(&self, family: &Arc<Family>) {
        *self.family.write().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(family);
    }

    /// Wire the reaper's `onNoProcesses` event to `no_processes`. Split out
    /// from `attach_family` because it needs an `Arc<Self>` to close over.
    pub fn install_reaper_hook(self: &Arc<Self>) {
        let this = self.clone();
        self.reaper.set_on_no_processes(move || this.no_processes());
    }

    #[must_use]
    pub fn family(&self) -> Option<Arc<Family>> {
        self.family.read().unwrap_or_else(|e| e.into_inner()).upgrade()
    }

    #[must_use]
    pub fn system_alive(&self) -> bool {
        self.system_alive.load(Ordering::SeqCst)
    }

    /// Install `SIGCHLD → reaper drain`, `SIGTERM → kill_system`,
    /// `SIGINT → kill_system(force=true)`, and make this process a
    /// subreaper (so orphaned grandchildren are reparented here instead of
    /// to the real PID 1).
    pub fn install_signal_handler(self: &Arc<Self>) -> std::io::Result<std::thread::JoinHandle<()>> {
        become_subreaper();
        let mut signals = Signals::new([SIGCHLD, SIGTERM, SIGINT, SIGQUIT])?;
        let this = self.clone();
        Ok(std::thread::spawn(move || {
            for signal in &mut signals {
                match signal {
                    SIGCHLD => this.reaper.check_processes(),
                    SIGTERM => this.kill_system(None, false),
                    SIGINT => this.kill_system(None, true),
                    SIGQUIT => this.kill_system(None, true),
                    _ => {}
                }
            }
        }))
    }

    /// Two-stage shutdown: SIGTERM then, after `shutdown_timeout`, SIGKILL
    /// unless `onNoProcesses` already fired.
    pub fn kill_system(&self, errno: Option<i32>, force: bool) {
        if self.killing.load(Ordering::SeqCst) && !force {
            return;
        }
        self.killing.store(true, Ordering::SeqCst);
        self.system_alive.store(false, Ordering::SeqCst);
        if let Some(code) = errno {
            log::error!("kill_system: errno={code}");
        }
        self.notify.stopping();

        let Some(family) = self.family() else { return };
        family.final_stop_all();

        if family.any_pid_registered() {
            std::thread::sleep(self.shutdown_timeout);
        }

        // Host-namespace semantics are assumed unsafe here: `kill(-1, …)`
        // signals every process this one can see. Chaperone is expected to
        // run as the PID-namespace init, matching the source's assumption.
        match nix::sys::signal::kill(Pid::from_raw(-1), Signal::SIGTERM) {
            Ok(()) | Err(nix::Error::ESRCH) => {}
            Err(e) => log::warn!("kill(-1, SIGTERM) failed: {e}"),
        }
        std::thread::sleep(self.shutdown_timeout);

        if family.any_pid_registered() {
            match nix::sys::signal::kill(Pid::from_raw(-1), Signal::SIGKILL) {
                Ok(()) | Err(nix::Error::ESRCH) => {}
                Err(e) => log::warn!("kill(-1, SIGKILL) failed: {e}"),
            }
        }
    }

    /// Fired when the reaper observes `ECHILD` after having had children.
    /// If `detect_exit` and nothing scheduled remains, tear the system down.
    pub fn no_processes(&self) {
        if self.killing.load(Ordering::SeqCst) {
            return;
        }
        let Some(family) = self.family() else { return };
        if self.detect_exit {
            if family.has_pending_work() {
                log::info!("no running processes, but cron/inetd services remain scheduled");
            } else {
                log::info!("no running processes and detect_exit is set, shutting down");
                self.kill_system(None, false);
            }
        }
    }

    /// Send `READY=1` and start the periodic status broadcaster.
    pub fn signal_ready(self: &Arc<Self>) {
        self.notify.ready();
        let this = self.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(this.status_interval);
            if !this.system_alive() {
                return;
            }
            let Some(family) = this.family() else { return };
            this.notify
                .status(&format!("{} services tracked", family.len()));
        });
    }
}

fn become_subreaper() {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0);
    }
}

/// A cheap, `Clone`-able reference to a `Controller`, handed to services so
/// they can drive `kill_system`/look up the family without holding a strong
/// cycle back to themselves.
#[derive(Clone)]
pub struct ControllerHandle {
    controller: Weak<Controller>,
}

impl ControllerHandle {
    #[must_use]
    pub fn new(controller: Weak<Controller>) -> Self {
        Self { controller }
    }

    #[must_use]
    pub fn system_alive(&self) -> bool {
        self.controller.upgrade().is_some_and(|c| c.system_alive())
    }

    #[must_use]
    pub fn family(&self) -> Option<Arc<Family>> {
        self.controller.upgrade().and_then(|c| c.family())
    }

    pub fn kill_system(&self, errno: Option<i32>, force: bool) {
        if let Some(controller) = self.controller.upgrade() {
            controller.kill_system(errno, force);
        }
    }
}

/// Process-wide handle, set once `Controller::new` has run, so satellite
/// threads (log readers, pidfile waiters) spawned deep inside `Service` can
/// reach it without threading an extra parameter through every call.
pub fn global() -> &'static Mutex<Option<Arc<Controller>>> {
    static GLOBAL: OnceLock<Mutex<Option<Arc<Controller>>>> = OnceLock::new();
    GLOBAL.get_or_init(|| Mutex::new(None))
}

/// The `--config`/`--force`/`--task` facts each spawned service seeds into
/// its own environment as `_CHAP_CONFIG_DIR`/`_CHAP_INTERACTIVE`/
/// `_CHAP_TASK_MODE` (spec.md §6). Set once at startup by the `chaperone`
/// binary before any service starts.
pub struct RuntimeContext {
    pub config_dir: String,
    pub interactive: bool,
    pub task_mode: bool,
}

pub fn runtime_context() -> &'static OnceLock<RuntimeContext> {
    static CTX: OnceLock<RuntimeContext> = OnceLock::new();
    &CTX
}

//! `Service` — the runtime wrapper around a `ServiceConfig`, its state
//! machine, and the six process-type disciplines (spec.md §4.2–§4.3).
//!
//! The re-entrant `start()` is grounded on the teacher's
//! `services::fork_parent::wait_for_service` wait loop (per-type polling
//! with the same exponential-backoff schedule) and `fork_child::after_fork_child`
//! (the pre-exec step: new session, uid/gid drop, chdir). Re-entrancy uses a
//! `Condvar` guarding a small `StartState` enum — the Rust-native analogue of
//! the teacher's asyncio-condition pattern, since Chaperone's core runs on
//! OS threads rather than a single cooperative executor (see DESIGN.md).

pub mod cron;

use crate::environment::Environment;
use crate::error::ServiceError;
use crate::family::Family;
use crate::lock_ext::{MutexExt, RwLockExt};
use crate::procstatus::ProcStatus;
use crate::reaper::Reaper;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use self::cron::CronSchedule;

/// Monotonic start counter seeded into children as `_CHAP_SERVICE_SERIAL`
/// (spec.md §6), shared process-wide across every service.
static SERIAL: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    Log,
    Inherit,
}

/// The process-type discriminant plus the data unique to each discipline.
#[derive(Debug, Clone)]
pub enum ServiceType {
    Simple,
    Oneshot,
    Forking,
    Notify,
    Cron { schedule: CronSchedule },
    Inetd { port: u16 },
}

impl ServiceType {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Oneshot => "oneshot",
            Self::Forking => "forking",
            Self::Notify => "notify",
            Self::Cron { .. } => "cron",
            Self::Inetd { .. } => "inetd",
        }
    }
}

/// Declarative, immutable-after-parse service definition (spec.md §3).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub kind: ServiceType,
    pub command: Vec<String>,
    pub directory: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub environment: Arc<Environment>,
    pub service_groups: Vec<String>,
    pub before: HashSet<String>,
    pub after: HashSet<String>,
    pub enabled: bool,
    pub optional: bool,
    pub ignore_failures: bool,
    pub restart: bool,
    pub restart_limit: u32,
    pub restart_delay: Duration,
    pub exit_kills: bool,
    pub kill_signal: Signal,
    pub process_timeout: Duration,
    pub startup_pause: Duration,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
    pub pidfile: Option<PathBuf>,
    /// Resolved at load: the transitive union of `after` plus any implicit
    /// ordering this service's group imposes.
    pub prerequisites: HashSet<String>,
}

impl ServiceConfig {
    #[must_use]
    pub fn in_group(&self, group: &str) -> bool {
        self.service_groups.iter().any(|g| g == group)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Disabled,
    Ready,
    Starting,
    Running,
    Scheduled,
    Started,
    Failed,
}

/// Re-entrant start coordination: exactly one in-flight `start()`, others
/// wait on the condvar and replay the same outcome.
enum StartState {
    NotStarted,
    Starting,
    Done(Result<(), ServiceError>),
}

struct RuntimeState {
    status: ServiceState,
    pid: Option<Pid>,
    detached_pid: Option<Pid>,
    restarts_allowed: u32,
    note: String,
    started: bool,
    /// Runtime-mutable mirror of `config.enabled`, flipped by the
    /// `telchap enable`/`disable` commands (spec.md §3's `disabled ⇄ ready`
    /// transition); `config.enabled` itself stays the load-time default.
    enabled: bool,
}

pub struct Service {
    pub config: ServiceConfig,
    state: RwLock<RuntimeState>,
    start_state: Mutex<StartState>,
    start_cond: Condvar,
    reaper: Arc<Reaper>,
}

impl Service {
    #[must_use]
    pub fn new(config: ServiceConfig, reaper: Arc<Reaper>) -> Arc<Self> {
        let restarts_allowed = config.restart_limit;
        let status = if config.enabled {
            ServiceState::Ready
        } else {
            ServiceState::Disabled
        };
        let enabled = config.enabled;
        Arc::new(Self {
            config,
            state: RwLock::new(RuntimeState {
                status,
                pid: None,
                detached_pid: None,
                restarts_allowed,
                note: String::new(),
                started: false,
                enabled,
            }),
            start_state: Mutex::new(StartState::NotStarted),
            start_cond: Condvar::new(),
            reaper,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn status(&self) -> ServiceState {
        self.state.read_poisoned().status.clone()
    }

    #[must_use]
    pub fn pid(&self) -> Option<Pid> {
        self.state.read_poisoned().pid
    }

    /// Whether the service is currently enabled — the runtime-mutable flag
    /// `telchap enable`/`disable` flips, seeded from `config.enabled`.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.read_poisoned().enabled
    }

    /// Flip the runtime enabled flag (spec.md §3's `disabled ⇄ ready`
    /// transition). Only nudges `status` while the service is still in a
    /// pre-start state; a service already running or failed keeps its
    /// status until the next `reset`/`start`.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.write_poisoned();
        state.enabled = enabled;
        if enabled && state.status == ServiceState::Disabled {
            state.status = ServiceState::Ready;
        } else if !enabled && state.status == ServiceState::Ready {
            state.status = ServiceState::Disabled;
        }
    }

    /// `ready` iff enabled ∧ ¬failed ∧ every enabled prerequisite is ready.
    #[must_use]
    pub fn is_ready(&self, family: &Family) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let state = self.state.read_poisoned();
        if state.status == ServiceState::Failed {
            return false;
        }
        drop(state);
        self.config.prerequisites.iter().all(|dep| {
            family
                .get(dep)
                .is_none_or(|svc| !svc.is_enabled() || svc.is_ready(family))
        })
    }

    /// Idempotent, re-entrant start (spec.md §4.2).
    pub fn start(self: &Arc<Self>, family: &Family) -> Result<(), ServiceError> {
        {
            let state = self.state.read_poisoned();
            if state.started {
                return Ok(());
            }
        }
        if !self.is_enabled() {
            self.state.write_poisoned().started = true;
            return Ok(());
        }

        {
            let mut guard = self.start_state.lock_poisoned();
            loop {
                match &*guard {
                    StartState::NotStarted => {
                        *guard = StartState::Starting;
                        break;
                    }
                    StartState::Starting => {
                        guard = self.start_cond.wait(guard).unwrap_or_else(|e| e.into_inner());
                    }
                    StartState::Done(result) => return result.clone(),
                }
            }
        }

        let result = self.start_inner(family);

        {
            let mut guard = self.start_state.lock_poisoned();
            *guard = StartState::Done(result.clone());
            self.start_cond.notify_all();
        }
        if result.is_ok() {
            let mut state = self.state.write_poisoned();
            state.started = true;
            // `start_subprocess` already set a more specific live status
            // (`Running` for an attached child, `Scheduled` for cron/inetd)
            // for every discipline except `oneshot`, which has no process
            // left to be live about once it returns.
            if state.status == ServiceState::Starting {
                state.status = ServiceState::Started;
            }
        }
        result
    }

    fn start_inner(self: &Arc<Self>, family: &Family) -> Result<(), ServiceError> {
        for dep in &self.config.prerequisites {
            if let Some(dep_service) = family.get(dep) {
                dep_service.start(family)?;
            }
        }

        if self.config.in_group("IDLE") && !family.hit_idle_latch() {
            std::thread::sleep(family.idle_delay());
        }

        if !family.controller_alive() {
            return Err(ServiceError::Generic {
                service: self.name().to_owned(),
                message: "controller is shutting down".into(),
            });
        }

        self.state.write_poisoned().status = ServiceState::Starting;
        let outcome = self.start_subprocess(family);
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if self.config.ignore_failures => {
                log::warn!("{}: start failed, ignored: {err}", self.name());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn exported_environment(&self) -> Result<Vec<(String, String)>, ServiceError> {
        self.config
            .environment
            .expanded()
            .map(|map| {
                map.into_iter()
                    .filter(|(k, v)| !k.starts_with('_') && !v.is_empty())
                    .collect()
            })
            .map_err(|source| ServiceError::Env {
                service: self.name().to_owned(),
                source,
            })
    }

    fn spawn(&self, extra_env: &[(&str, String)]) -> Result<std::process::Child, ServiceError> {
        let Some(program) = self.config.command.first() else {
            return Err(ServiceError::NotFound {
                service: self.name().to_owned(),
                command: String::new(),
                reason: "empty command".into(),
            });
        };
        let mut command = Command::new(program);
        command.args(&self.config.command[1..]);
        command.env_clear();
        for (k, v) in self.exported_environment()? {
            command.env(k, v);
        }
        let ctx = crate::controller::runtime_context();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        command.env("_CHAP_SERVICE", &self.config.name);
        command.env(
            "_CHAP_SERVICE_SERIAL",
            SERIAL.fetch_add(1, std::sync::atomic::Ordering::SeqCst).to_string(),
        );
        command.env("_CHAP_SERVICE_TIME", now.to_string());
        if let Some(ctx) = ctx.get() {
            command.env("_CHAP_CONFIG_DIR", &ctx.config_dir);
            command.env("_CHAP_INTERACTIVE", if ctx.interactive { "1" } else { "0" });
            command.env("_CHAP_TASK_MODE", if ctx.task_mode { "1" } else { "0" });
        }
        for (k, v) in extra_env {
            command.env(k, v);
        }
        if let Some(dir) = &self.config.directory {
            command.current_dir(dir);
        }
        match self.config.stdout {
            StdioMode::Log => {
                command.stdout(Stdio::piped());
            }
            StdioMode::Inherit => {
                command.stdout(Stdio::inherit());
            }
        }
        match self.config.stderr {
            StdioMode::Log => {
                command.stderr(Stdio::piped());
            }
            StdioMode::Inherit => {
                command.stderr(Stdio::inherit());
            }
        }
        let gid = self.config.gid;
        let uid = self.config.uid;
        // SAFETY: pre_exec runs between fork and exec in the child; only
        // async-signal-safe libc calls happen here, mirroring the teacher's
        // after_fork_child discipline (new session before uid/gid drop,
        // never touching the logger).
        unsafe {
            command.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(gid) = gid {
                    if libc::setgid(gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if let Some(uid) = uid {
                    if libc::setuid(uid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
        let mut child = command.spawn().map_err(|source| ServiceError::Spawn {
            service: self.name().to_owned(),
            source: source.to_string(),
        })?;

        let pid = Pid::from_raw(child.id() as i32);
        self.state.write_poisoned().pid = Some(pid);

        if self.config.stdout == StdioMode::Log {
            if let Some(out) = child.stdout.take() {
                self.spawn_log_reader(out, "info");
            }
        }
        if self.config.stderr == StdioMode::Log {
            if let Some(err) = child.stderr.take() {
                self.spawn_log_reader(err, "warning");
            }
        }

        Ok(child)
    }

    fn spawn_log_reader<R: Read + Send + 'static>(&self, mut pipe: R, level: &'static str) {
        let name = self.name().to_owned();
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            if pipe.read_to_end(&mut buf).is_ok() {
                for line in String::from_utf8_lossy(&buf).lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match level {
                        "warning" => log::warn!(target: "daemon", "{name}: {line}"),
                        _ => log::info!(target: "daemon", "{name}: {line}"),
                    }
                }
            }
        });
    }

    fn register_exit_watch(self: &Arc<Self>, family: &Family, pid: Pid) {
        let this = self.clone();
        let controller = family.controller_handle();
        self.reaper.add_child_handler(pid, move |status| {
            this.process_exit(status, &controller);
        });
    }

    /// Block for `pid`'s exit through the reaper's callback table rather
    /// than a second independent `waitpid`, so a SIGCHLD drain that reaps
    /// the child first can't race a direct `try_wait`/`wait` into `ECHILD`.
    fn wait_for_exit(&self, pid: Pid, timeout: Duration) -> Result<ProcStatus, ServiceError> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.reaper.add_child_handler(pid, move |status| {
            let _ = tx.send(status);
        });
        match rx.recv_timeout(timeout) {
            Ok(status) => Ok(status),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                let _ = signal::kill(pid, self.config.kill_signal);
                if let Ok(status) = rx.recv_timeout(Duration::from_secs(2)) {
                    return Ok(status);
                }
                Err(ServiceError::Timeout {
                    service: self.name().to_owned(),
                    what: "process exit".into(),
                    elapsed: timeout,
                })
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(ServiceError::Generic {
                service: self.name().to_owned(),
                message: "reaper channel disconnected".into(),
            }),
        }
    }

    fn start_subprocess(self: &Arc<Self>, family: &Family) -> Result<(), ServiceError> {
        let _fork_guard = self.reaper.enter_fork_section();
        match &self.config.kind {
            ServiceType::Simple => {
                let child = self.spawn(&[])?;
                let pid = Pid::from_raw(child.id() as i32);
                std::mem::forget(child);
                self.register_exit_watch(family, pid);
                self.maybe_watch_exit_kills(family, pid);
                std::thread::sleep(self.config.startup_pause);
                if self.config.pidfile.is_some() {
                    self.wait_for_pidfile()?;
                }
                self.state.write_poisoned().status = ServiceState::Running;
                Ok(())
            }
            ServiceType::Oneshot => {
                let child = self.spawn(&[])?;
                let pid = Pid::from_raw(child.id() as i32);
                std::mem::forget(child);
                let status = self.wait_for_exit(pid, self.config.process_timeout)?;
                if status.normal_exit() {
                    Ok(())
                } else {
                    Err(ServiceError::Generic {
                        service: self.name().to_owned(),
                        message: format!("exited with {status}"),
                    })
                }
            }
            ServiceType::Forking => {
                let child = self.spawn(&[])?;
                let pid = Pid::from_raw(child.id() as i32);
                std::mem::forget(child);
                let status = self.wait_for_exit(pid, self.config.process_timeout)?;
                if !status.normal_exit() {
                    return Err(ServiceError::Generic {
                        service: self.name().to_owned(),
                        message: format!("parent exited with {status}"),
                    });
                }
                self.wait_for_pidfile()?;
                self.state.write_poisoned().status = ServiceState::Running;
                Ok(())
            }
            ServiceType::Notify => {
                let socket_path = format!("\0/chaperone/{}", self.name());
                let socket = std::os::unix::net::UnixDatagram::unbound().map_err(|e| {
                    ServiceError::Generic {
                        service: self.name().to_owned(),
                        message: e.to_string(),
                    }
                })?;
                let _ = socket.bind(&socket_path);
                let child = self.spawn(&[("NOTIFY_SOCKET", socket_path)])?;
                let pid = Pid::from_raw(child.id() as i32);
                std::mem::forget(child);
                self.register_exit_watch(family, pid);
                self.maybe_watch_exit_kills(family, pid);
                self.wait_for_ready(&socket)?;
                self.state.write_poisoned().status = ServiceState::Running;
                Ok(())
            }
            ServiceType::Cron { schedule } => {
                self.start_cron_ticker(family, schedule.clone());
                self.state.write_poisoned().status = ServiceState::Scheduled;
                Ok(())
            }
            ServiceType::Inetd { port } => {
                self.run_inetd_accept_loop(*port, family);
                self.state.write_poisoned().status = ServiceState::Scheduled;
                Ok(())
            }
        }
    }

    /// Spawn the background thread that drives `schedule.next_after` for a
    /// `cron` service: each tick re-enters the generic spawn/wait path used
    /// by `oneshot`, so completion is observed through the reaper rather
    /// than a second `waitpid`.
    fn start_cron_ticker(self: &Arc<Self>, family: &Family, schedule: CronSchedule) {
        let this = self.clone();
        let controller = family.controller_handle();
        std::thread::spawn(move || this.run_cron_ticker(&schedule, &controller));
    }

    fn run_cron_ticker(
        self: &Arc<Self>,
        schedule: &CronSchedule,
        controller: &crate::controller::ControllerHandle,
    ) {
        let tick_running = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut after = std::time::SystemTime::now();
        while controller.system_alive() {
            let Some(next) = schedule.next_after(after) else {
                log::error!("{}: cron schedule has no further ticks", self.name());
                return;
            };
            after = next;
            let sleep_until = Instant::now()
                + next
                    .duration_since(std::time::SystemTime::now())
                    .unwrap_or(Duration::ZERO);
            while controller.system_alive() && Instant::now() < sleep_until {
                std::thread::sleep(Duration::from_millis(200).min(sleep_until.saturating_duration_since(Instant::now())));
            }
            if !controller.system_alive() {
                return;
            }
            if tick_running.swap(true, std::sync::atomic::Ordering::SeqCst) {
                log::warn!(
                    "{}: cron tick fired while the previous tick is still running",
                    self.name()
                );
            }
            let this = self.clone();
            let tick_running = tick_running.clone();
            let controller = controller.clone();
            std::thread::spawn(move || {
                this.run_cron_tick(&controller);
                tick_running.store(false, std::sync::atomic::Ordering::SeqCst);
            });
        }
    }

    fn run_cron_tick(self: &Arc<Self>, controller: &crate::controller::ControllerHandle) {
        self.state.write_poisoned().status = ServiceState::Running;
        let outcome = (|| -> Result<(), ServiceError> {
            let _fork_guard = self.reaper.enter_fork_section();
            let child = self.spawn(&[])?;
            let pid = Pid::from_raw(child.id() as i32);
            std::mem::forget(child);
            let status = self.wait_for_exit(pid, self.config.process_timeout)?;
            if status.normal_exit() {
                Ok(())
            } else {
                Err(ServiceError::Generic {
                    service: self.name().to_owned(),
                    message: format!("exited with {status}"),
                })
            }
        })();
        match outcome {
            Ok(()) => {}
            Err(e) if self.config.ignore_failures => {
                log::warn!("{}: cron tick failed, ignored: {e}", self.name());
            }
            Err(e) => log::error!("{}: cron tick failed: {e}", self.name()),
        }
        if controller.system_alive() {
            let mut state = self.state.write_poisoned();
            if state.status != ServiceState::Failed {
                state.status = ServiceState::Scheduled;
            }
        }
    }

    fn maybe_watch_exit_kills(self: &Arc<Self>, family: &Family, pid: Pid) {
        if !self.config.exit_kills {
            return;
        }
        let controller = family.controller_handle();
        let name = self.name().to_owned();
        self.reaper.add_child_handler(pid, move |status| {
            log::warn!("{name} exited ({status}), bringing down the system (exit_kills)");
            controller.kill_system(status.exit_status(), false);
        });
    }

    fn wait_for_ready(&self, socket: &std::os::unix::net::UnixDatagram) -> Result<(), ServiceError> {
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .ok();
        let deadline = Instant::now() + self.config.process_timeout;
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            match socket.recv(&mut buf) {
                Ok(n) => {
                    let datagram = String::from_utf8_lossy(&buf[..n]);
                    for line in datagram.lines() {
                        if line == "READY=1" {
                            return Ok(());
                        }
                        if let Some(pid_str) = line.strip_prefix("MAINPID=") {
                            if let Ok(raw) = pid_str.parse::<i32>() {
                                self.state.write_poisoned().detached_pid = Some(Pid::from_raw(raw));
                            }
                        }
                        if let Some(errno) = line.strip_prefix("ERRNO=") {
                            if let Ok(code) = errno.parse::<i32>() {
                                return Err(ServiceError::AbnormalExit {
                                    service: self.name().to_owned(),
                                    status: ProcStatus::NotifyErrno(code),
                                });
                            }
                        }
                        if let Some(err) = line.strip_prefix("BUSERROR=") {
                            return Err(ServiceError::Generic {
                                service: self.name().to_owned(),
                                message: err.to_owned(),
                            });
                        }
                        if let Some(status_note) = line.strip_prefix("STATUS=") {
                            self.state.write_poisoned().note = status_note.to_owned();
                        }
                    }
                }
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
                Err(e) => {
                    return Err(ServiceError::Generic {
                        service: self.name().to_owned(),
                        message: e.to_string(),
                    })
                }
            }
        }
        Err(ServiceError::Timeout {
            service: self.name().to_owned(),
            what: "READY=1 notification".into(),
            elapsed: self.config.process_timeout,
        })
    }

    fn run_inetd_accept_loop(self: &Arc<Self>, port: u16, family: &Family) {
        let this = self.clone();
        let family_controller = family.controller_handle();
        let command = self.config.command.clone();
        std::thread::spawn(move || {
            let Ok(listener) = std::net::TcpListener::bind(("0.0.0.0", port)) else {
                log::error!("{}: failed to bind inetd port {port}", this.name());
                return;
            };
            for connection in listener.incoming() {
                let Ok(stream) = connection else { continue };
                let command = command.clone();
                let name = this.name().to_owned();
                let _guard = this.reaper.enter_fork_section();
                std::thread::spawn(move || {
                    use std::os::unix::io::{AsRawFd, FromRawFd};
                    let fd = stream.as_raw_fd();
                    let mut cmd = Command::new(&command[0]);
                    cmd.args(&command[1..]);
                    cmd.stdin(unsafe { Stdio::from_raw_fd(fd) });
                    cmd.stdout(unsafe { Stdio::from_raw_fd(libc::dup(fd)) });
                    cmd.stderr(Stdio::inherit());
                    match cmd.spawn() {
                        Ok(mut child) => {
                            let _ = child.wait();
                        }
                        Err(e) => log::error!("{name}: inetd spawn failed: {e}"),
                    }
                });
            }
            let _ = family_controller;
        });
    }

    /// Called from the reaper's thread-pool dispatch.
    fn process_exit(self: &Arc<Self>, status: ProcStatus, controller: &crate::controller::ControllerHandle) {
        self.state.write_poisoned().pid = None;
        if status.matches_kill_signal(self.config.kill_signal) || status.normal_exit() {
            let mut state = self.state.write_poisoned();
            if state.status != ServiceState::Failed {
                state.status = ServiceState::Started;
            }
            return;
        }
        self.abnormal_exit(status, controller);
    }

    fn abnormal_exit(self: &Arc<Self>, status: ProcStatus, controller: &crate::controller::ControllerHandle) {
        if self.config.exit_kills {
            log::error!("{}: exited abnormally ({status}), exit_kills set", self.name());
            return;
        }
        if !self.is_enabled() {
            return;
        }
        let mut state = self.state.write_poisoned();
        if self.config.restart && state.restarts_allowed > 0 {
            state.restarts_allowed -= 1;
            let remaining = state.restarts_allowed;
            drop(state);
            log::warn!(
                "{}: exited abnormally ({status}), restarting ({remaining} restarts left)",
                self.name()
            );
            if controller.system_alive() {
                std::thread::sleep(self.config.restart_delay);
            }
            self.state.write_poisoned().started = false;
            {
                let mut guard = self.start_state.lock_poisoned();
                *guard = StartState::NotStarted;
            }
            let this = self.clone();
            let controller = controller.clone();
            std::thread::spawn(move || {
                if let Some(family) = controller.family() {
                    if this.start(&family).is_ok() {
                        this.state.write_poisoned().restarts_allowed = this.config.restart_limit;
                    }
                }
            });
        } else if self.config.ignore_failures {
            state.status = ServiceState::Started;
            log::warn!("{}: exited abnormally ({status}), ignored", self.name());
        } else {
            state.status = ServiceState::Failed;
            log::error!("{}: exited abnormally ({status})", self.name());
        }
    }

    /// Poll the configured pidfile with exponential backoff (20ms → 3s cap)
    /// until `process_timeout` elapses.
    pub fn wait_for_pidfile(&self) -> Result<(), ServiceError> {
        let Some(path) = self.config.pidfile.clone() else {
            return Ok(());
        };
        let deadline = Instant::now() + self.config.process_timeout;
        let mut delay = Duration::from_millis(20);
        loop {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                if let Ok(pid) = contents.trim().parse::<i32>() {
                    if pid > 0 {
                        self.state.write_poisoned().detached_pid = Some(Pid::from_raw(pid));
                        return Ok(());
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(ServiceError::PidfileTimeout {
                    service: self.name().to_owned(),
                    path,
                });
            }
            std::thread::sleep(delay.min(deadline.saturating_duration_since(Instant::now())));
            delay = (delay * 2).min(Duration::from_secs(3));
        }
    }

    /// Terminate the running child if any, clear pid/started state, delete
    /// any pidfile, restore restart allowance.
    pub fn reset(&self) {
        self.terminate();
        let mut state = self.state.write_poisoned();
        state.pid = None;
        state.detached_pid = None;
        state.started = false;
        state.restarts_allowed = self.config.restart_limit;
        state.status = if state.enabled {
            ServiceState::Ready
        } else {
            ServiceState::Disabled
        };
        drop(state);
        if let Some(path) = &self.config.pidfile {
            let _ = std::fs::remove_file(path);
        }
        *self.start_state.lock_poisoned() = StartState::NotStarted;
    }

    /// Zero the restart allowance and reset.
    pub fn stop(&self) {
        self.state.write_poisoned().restarts_allowed = 0;
        self.reset();
    }

    /// System-wide shutdown: send the configured signal, don't wait.
    pub fn final_stop(&self) {
        let signal = self.config.kill_signal;
        let state = self.state.read_poisoned();
        if let Some(pid) = state.pid {
            let _ = signal::kill(pid, signal);
        }
        if let Some(pid) = state.detached_pid {
            let _ = signal::kill(pid, signal);
        }
    }

    /// Signal both the original process handle and any detached PID,
    /// ignoring lookup errors for processes that already exited.
    pub fn terminate(&self) {
        let signal = self.config.kill_signal;
        let state = self.state.read_poisoned();
        if let Some(pid) = state.pid {
            match signal::kill(pid, signal) {
                Ok(()) | Err(nix::Error::ESRCH) => {}
                Err(e) => log::warn!("{}: kill({pid}) failed: {e}", self.name()),
            }
        }
        if let Some(pid) = state.detached_pid {
            match signal::kill(pid, signal) {
                Ok(()) | Err(nix::Error::ESRCH) => {}
                Err(e) => log::warn!("{}: kill({pid}) failed: {e}", self.name()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;

    fn base_config(name: &str, kind: ServiceType) -> ServiceConfig {
        ServiceConfig {
            name: name.to_owned(),
            kind,
            command: vec!["/bin/true".to_owned()],
            directory: None,
            uid: None,
            gid: None,
            environment: Arc::new(Environment::new()),
            service_groups: Vec::new(),
            before: HashSet::new(),
            after: HashSet::new(),
            enabled: true,
            optional: false,
            ignore_failures: false,
            restart: false,
            restart_limit: 0,
            restart_delay: Duration::from_millis(1),
            exit_kills: false,
            kill_signal: Signal::SIGTERM,
            process_timeout: Duration::from_secs(1),
            startup_pause: Duration::from_millis(1),
            stdout: StdioMode::Log,
            stderr: StdioMode::Log,
            pidfile: None,
            prerequisites: HashSet::new(),
        }
    }

    #[test]
    fn disabled_service_starts_without_spawning() {
        let reaper = Arc::new(Reaper::new(1));
        let config = {
            let mut c = base_config("noop.service", ServiceType::Oneshot);
            c.enabled = false;
            c
        };
        let svc = Service::new(config, reaper);
        assert_eq!(svc.status(), ServiceState::Disabled);
    }

    #[test]
    fn service_type_names_match_spec_table() {
        assert_eq!(ServiceType::Simple.name(), "simple");
        assert_eq!(ServiceType::Oneshot.name(), "oneshot");
        assert_eq!(ServiceType::Forking.name(), "forking");
        assert_eq!(ServiceType::Notify.name(), "notify");
        assert_eq!(
            ServiceType::Cron {
                schedule: CronSchedule::parse("@daily").unwrap()
            }
            .name(),
            "cron"
        );
        assert_eq!(ServiceType::Inetd { port: 0 }.name(), "inetd");
    }

    fn test_family(svc: &Arc<Service>, reaper: &Arc<Reaper>) -> (Arc<crate::controller::Controller>, Arc<Family>) {
        let controller = crate::controller::Controller::new(
            reaper.clone(),
            false,
            Duration::from_millis(10),
            Duration::from_secs(60),
        );
        let family = Arc::new(Family::new(
            vec![svc.clone()],
            Arc::downgrade(&controller),
            Duration::from_millis(1),
        ));
        controller.attach_family(&family);
        (controller, family)
    }

    #[test]
    fn simple_service_reports_running_while_child_is_live() {
        let reaper = Arc::new(Reaper::new(1));
        let mut config = base_config("sleeper.service", ServiceType::Simple);
        config.command = vec!["/bin/sleep".to_owned(), "1".to_owned()];
        let svc = Service::new(config, reaper.clone());
        let (_controller, family) = test_family(&svc, &reaper);
        svc.start(&family).unwrap();
        assert_eq!(svc.status(), ServiceState::Running);
        svc.terminate();
    }

    #[test]
    fn oneshot_completion_survives_concurrent_reaper_drain() {
        let reaper = Arc::new(Reaper::new(1));
        let config = base_config("true.service", ServiceType::Oneshot);
        let svc = Service::new(config, reaper.clone());
        let (_controller, family) = test_family(&svc, &reaper);

        // Simulate the SIGCHLD thread draining `waitpid(-1, WNOHANG)`
        // concurrently with `start()`'s own wait; before the fix this could
        // steal the exit out from under a direct `try_wait(pid)` and report
        // a normally-exiting oneshot as failed.
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let drain_reaper = reaper.clone();
        let drain_stop = stop.clone();
        let drainer = std::thread::spawn(move || {
            while !drain_stop.load(std::sync::atomic::Ordering::SeqCst) {
                drain_reaper.check_processes();
                std::thread::sleep(Duration::from_micros(100));
            }
        });

        let result = svc.start(&family);
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        drainer.join().unwrap();
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn cron_service_reports_scheduled_without_waiting_for_a_tick() {
        let reaper = Arc::new(Reaper::new(1));
        let schedule = CronSchedule::parse("0 0 1 1 *").unwrap();
        let svc = Service::new(
            base_config("cron.service", ServiceType::Cron { schedule }),
            reaper.clone(),
        );
        let (_controller, family) = test_family(&svc, &reaper);
        svc.start(&family).unwrap();
        assert_eq!(svc.status(), ServiceState::Scheduled);
    }

    #[test]
    fn set_enabled_toggles_ready_disabled_before_start() {
        let reaper = Arc::new(Reaper::new(1));
        let config = {
            let mut c = base_config("toggle.service", ServiceType::Oneshot);
            c.enabled = false;
            c
        };
        let svc = Service::new(config, reaper);
        assert_eq!(svc.status(), ServiceState::Disabled);
        assert!(!svc.is_enabled());

        svc.set_enabled(true);
        assert_eq!(svc.status(), ServiceState::Ready);
        assert!(svc.is_enabled());

        svc.set_enabled(false);
        assert_eq!(svc.status(), ServiceState::Disabled);
    }
}

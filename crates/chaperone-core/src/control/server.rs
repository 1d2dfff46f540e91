//! FIFO (`/dev/chaperone`, one-shot) and Unix stream socket
//! (`/dev/chaperone.sock`, request/response) control-plane listeners.
//!
//! Grounded on the teacher's `control::control::{listen_on_commands,
//! accept_control_connections_unix_socket}` — generic over `Read + Write`,
//! spawning one thread per accepted connection — adapted to the newline
//! reply framing instead of JSON-RPC 2.0 responses.

use super::log_control::LogControl;
use super::protocol::{parse_line, Command, Reply, TargetArgs};
use crate::controller::ControllerHandle;
use crate::family::Family;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

/// Execute one parsed command against the family/controller, producing the
/// reply to frame back to the caller (or, for the FIFO, to discard).
pub fn execute(
    command: Command,
    family: &Arc<Family>,
    controller: &ControllerHandle,
    log_control: &LogControl,
) -> Reply {
    match command {
        Command::Status => Reply::Result(render_status(family)),
        Command::Dependencies => Reply::Result(family.dependency_tree()),
        Command::Loglevel { level } => match level {
            Some(level) => {
                log_control.raise_floor(&level);
                Reply::Result(format!("log level floor raised to {level}"))
            }
            None => Reply::Result(format!("current log level floor: {}", log_control.current())),
        },
        Command::Shutdown { delay } => {
            let controller = controller.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(delay.unwrap_or(0)));
                controller.kill_system(None, false);
            });
            Reply::Result("shutdown scheduled".to_owned())
        }
        Command::Start(args) => dispatch_targets(family, &args, Op::Start),
        Command::Stop(args) => dispatch_targets(family, &args, Op::Stop),
        Command::Reset(args) => dispatch_targets(family, &args, Op::Reset),
        Command::Enable { name } => set_enabled(family, &name, true),
        Command::Disable { name } => set_enabled(family, &name, false),
    }
}

fn set_enabled(family: &Arc<Family>, names: &[String], enabled: bool) -> Reply {
    if names.is_empty() {
        return Reply::CommandError("expected at least one service name".to_owned());
    }
    let mut missing = Vec::new();
    for name in names {
        match family.get(name) {
            Some(svc) => svc.set_enabled(enabled),
            None => missing.push(name.clone()),
        }
    }
    if !missing.is_empty() {
        return Reply::CommandError(format!("unknown service name(s): {}", missing.join(", ")));
    }
    let verb = if enabled { "enabled" } else { "disabled" };
    Reply::Result(format!("{verb} {} service(s)", names.len()))
}

#[derive(Clone, Copy)]
enum Op {
    Start,
    Stop,
    Reset,
}

impl Op {
    fn apply(self, svc: &Arc<crate::service::Service>, family: &Arc<Family>) -> Result<(), String> {
        match self {
            Self::Start => svc.start(family).map_err(|e| e.to_string()),
            Self::Stop => {
                svc.stop();
                Ok(())
            }
            Self::Reset => {
                svc.reset();
                Ok(())
            }
        }
    }
}

fn dispatch_targets(family: &Arc<Family>, args: &TargetArgs, op: Op) -> Reply {
    let names = &args.name;
    let targets: Vec<_> = if names.is_empty() {
        family.iter().cloned().collect()
    } else {
        names.iter().filter_map(|n| family.get(n)).collect()
    };
    if targets.len() != names.len() && !names.is_empty() {
        return Reply::CommandError("unknown service name".to_owned());
    }
    if args.enable {
        for svc in &targets {
            svc.set_enabled(true);
        }
    } else if args.disable {
        for svc in &targets {
            svc.set_enabled(false);
        }
    }
    if !args.wait {
        for svc in targets {
            let family = family.clone();
            std::thread::spawn(move || {
                let _ = op.apply(&svc, &family);
            });
        }
        return Reply::Result("queued".to_owned());
    }
    for svc in &targets {
        if let Err(e) = op.apply(svc, family) {
            return Reply::Exception(e);
        }
    }
    Reply::Result("done".to_owned())
}

fn render_status(family: &Arc<Family>) -> String {
    let mut out = String::from("pid     name                          enabled  status     note\n");
    for svc in family.iter() {
        let pid = svc.pid().map_or("-".to_owned(), |p| p.to_string());
        out.push_str(&format!(
            "{:<8}{:<30}{:<9}{:?}\n",
            pid,
            svc.name(),
            svc.is_enabled(),
            svc.status()
        ));
    }
    out
}

fn handle_line(
    line: &str,
    family: &Arc<Family>,
    controller: &ControllerHandle,
    log_control: &LogControl,
) -> Reply {
    match parse_line(line) {
        Ok(command) => execute(command, family, controller, log_control),
        Err(msg) => Reply::CommandError(msg),
    }
}

/// Serve one-shot commands over the FIFO: each line is parsed and executed,
/// with no reply written back (the FIFO has no per-client connection to
/// reply on).
pub fn serve_fifo(
    path: &str,
    family: Arc<Family>,
    controller: ControllerHandle,
    log_control: LogControl,
) -> std::io::Result<()> {
    let _ = std::fs::remove_file(path);
    // mkfifo via libc; std has no portable wrapper.
    let cpath = std::ffi::CString::new(path).expect("path has no interior NUL");
    if unsafe { libc::mkfifo(cpath.as_ptr(), 0o622) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    std::thread::spawn(move || loop {
        let Ok(file) = std::fs::File::open(path) else {
            return;
        };
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            let _ = handle_line(&line, &family, &controller, &log_control);
        }
    });
    Ok(())
}

/// Serve request/response commands over the Unix stream socket, one thread
/// per connection.
pub fn serve_unix_socket(
    path: &str,
    family: Arc<Family>,
    controller: ControllerHandle,
    log_control: LogControl,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    Ok(std::thread::spawn(move || {
        for connection in listener.incoming() {
            let Ok(stream) = connection else { continue };
            let family = family.clone();
            let controller = controller.clone();
            let log_control = log_control.clone();
            std::thread::spawn(move || handle_connection(stream, &family, &controller, &log_control));
        }
    }))
}

fn handle_connection(
    stream: UnixStream,
    family: &Arc<Family>,
    controller: &ControllerHandle,
    log_control: &LogControl,
) {
    let Ok(reader_stream) = stream.try_clone() else {
        return;
    };
    let mut writer = stream;
    for line in BufReader::new(reader_stream).lines().map_while(Result::ok) {
        let reply = handle_line(&line, family, controller, log_control);
        if writer.write_all(reply.to_wire().as_bytes()).is_err() {
            return;
        }
    }
}

//! PID-1 entrypoint: loads configuration, wires the controller and the
//! syslog/control-plane listeners, starts every enabled service, then sleeps
//! until the controller tears the system down.
//!
//! Grounded on the teacher's `entrypoints::service_manager::run_service_manager`
//! for the overall startup sequence (install signals before touching any
//! unit, become subreaper, then bring services up).

use chaperone_core::config;
use chaperone_core::controller::{Controller, RuntimeContext};
use chaperone_core::environment::Environment;
use chaperone_core::family::Family;
use chaperone_core::logging;
use chaperone_core::reaper::Reaper;
use chaperone_core::service::Service;
use chaperone_core::syslog::{ConsoleSink, FileSink, Ingestor, RemoteSink, Route, Selector};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "chaperone")]
struct Cli {
    #[arg(long, default_value = "/etc/chaperone")]
    config: PathBuf,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    create_user: bool,
    #[arg(long, conflicts_with = "no_exitkills")]
    exitkills: bool,
    #[arg(long, conflicts_with = "exitkills")]
    no_exitkills: bool,
    #[arg(long)]
    ignore_failures: bool,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long)]
    no_console_log: bool,
    #[arg(long)]
    force: bool,
    #[arg(long)]
    disable_services: bool,
    #[arg(long)]
    show_dependencies: bool,
    /// `--task` ≡ `--disable-services --no-console-log --exitkills`.
    #[arg(long)]
    task: bool,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    let mut cli = Cli::parse();
    if cli.task {
        cli.disable_services = true;
        cli.no_console_log = true;
        cli.exitkills = true;
    }

    let level = logging::parse_level(&cli.log_level);
    if let Err(e) = logging::setup_logging(level, !cli.no_console_log) {
        eprintln!("failed to set up logging: {e}");
    }

    let interactive = cli.force || unsafe { libc::isatty(0) == 1 };

    let config_dir = cli.config.to_string_lossy().into_owned();
    let _ = chaperone_core::controller::runtime_context().set(RuntimeContext {
        config_dir: config_dir.clone(),
        interactive,
        task_mode: cli.task,
    });

    let loaded = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let detect_exit = loaded.settings.detect_exit.unwrap_or(true);
    let shutdown_timeout = Duration::from_secs_f64(loaded.settings.shutdown_timeout.unwrap_or(10.0));
    let status_interval = Duration::from_secs_f64(loaded.settings.status_interval.unwrap_or(60.0));
    let idle_delay = Duration::from_secs_f64(loaded.settings.idle_delay.unwrap_or(0.1));

    let reaper = Arc::new(Reaper::new(4));
    let controller = Controller::new(reaper.clone(), detect_exit, shutdown_timeout, status_interval);
    *chaperone_core::controller::global()
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(controller.clone());

    let mut services: Vec<Arc<Service>> = loaded
        .services
        .into_iter()
        .map(|mut cfg| {
            if cli.disable_services {
                cfg.enabled = false;
            }
            if cli.ignore_failures {
                cfg.ignore_failures = true;
            }
            if cli.exitkills {
                cfg.exit_kills = true;
            }
            if cli.no_exitkills {
                cfg.exit_kills = false;
            }
            Service::new(cfg, reaper.clone())
        })
        .collect();

    if !cli.command.is_empty() {
        let (uid, gid) = cli
            .user
            .as_deref()
            .and_then(|name| nix::unistd::User::from_name(name).ok().flatten())
            .map_or((None, None), |u| (Some(u.uid.as_raw()), Some(u.gid.as_raw())));
        if cli.user.is_some() && uid.is_none() {
            log::warn!("--user {:?} not found; running MAIN as-is", cli.user);
        }
        let mut cfg = chaperone_core::service::ServiceConfig {
            name: "MAIN.service".to_owned(),
            kind: chaperone_core::service::ServiceType::Simple,
            command: cli.command.clone(),
            directory: None,
            uid,
            gid,
            environment: Arc::new(Environment::new()),
            service_groups: Vec::new(),
            before: Default::default(),
            after: Default::default(),
            enabled: true,
            optional: false,
            ignore_failures: cli.ignore_failures,
            restart: false,
            restart_limit: 0,
            restart_delay: Duration::from_secs(1),
            exit_kills: true,
            kill_signal: nix::sys::signal::Signal::SIGTERM,
            process_timeout: Duration::from_secs(30),
            startup_pause: Duration::from_millis(100),
            stdout: chaperone_core::service::StdioMode::Inherit,
            stderr: chaperone_core::service::StdioMode::Inherit,
            pidfile: None,
            prerequisites: Default::default(),
        };
        cfg.exit_kills = true;
        services.push(Service::new(cfg, reaper.clone()));
    }

    let family = Arc::new(Family::new(
        services,
        Arc::downgrade(&controller),
        idle_delay,
    ));

    if cli.show_dependencies {
        print!("{}", family.dependency_tree());
        return;
    }

    controller.attach_family(&family);
    controller.install_reaper_hook();

    if let Err(e) = controller.install_signal_handler() {
        log::error!("failed to install signal handler: {e}");
        std::process::exit(1);
    }

    let handle = controller.clone();
    let routes = Arc::new(build_routes(&loaded.logging));
    let log_control = chaperone_core::control::LogControl::new(routes.clone());
    if let Ok(ingestor) = Ingestor::bind("/dev/log", routes) {
        std::thread::spawn(move || ingestor.run());
    } else {
        log::warn!("could not bind /dev/log, syslog ingestion disabled");
    }

    let control_handle = chaperone_core::controller::ControllerHandle::new(Arc::downgrade(&handle));
    let _ = chaperone_core::control::serve_fifo(
        "/dev/chaperone",
        family.clone(),
        control_handle.clone(),
        log_control.clone(),
    );
    let _ = chaperone_core::control::serve_unix_socket(
        "/dev/chaperone.sock",
        family.clone(),
        control_handle,
        log_control,
    );

    let outcomes = family.start_all();
    let mut exit_code = 0;
    for (name, outcome) in outcomes {
        if let Err(e) = outcome {
            log::error!("{name}: failed to start: {e}");
            if exit_code == 0 {
                exit_code = 1;
            }
        }
    }

    controller.signal_ready();

    while controller.system_alive() {
        std::thread::sleep(Duration::from_millis(200));
    }

    std::process::exit(exit_code);
}

fn build_routes(logging: &[config::LoggingRoute]) -> Vec<Route> {
    let mut routes = Vec::new();
    for route in logging {
        if !route.raw.enabled {
            continue;
        }
        let selector = match Selector::compile(&route.raw.selector) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("{}: bad selector {:?}: {e}", route.name, route.raw.selector);
                continue;
            }
        };
        let sink: Box<dyn chaperone_core::syslog::Sink> = if let Some(path) = &route.raw.file {
            Box::new(FileSink::new(
                path.to_string_lossy().into_owned(),
                0o640,
            ))
        } else if let Some(host) = &route.raw.syslog_host {
            match RemoteSink::connect(host) {
                Ok(sink) => Box::new(sink),
                Err(e) => {
                    log::warn!("{}: could not connect to {host}: {e}", route.name);
                    continue;
                }
            }
        } else {
            Box::new(ConsoleSink::new(route.raw.stderr))
        };
        routes.push(Route {
            name: route.name.clone(),
            selector: Mutex::new(selector),
            sink: Mutex::new(sink),
        });
    }
    routes
}

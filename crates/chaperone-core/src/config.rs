//! Configuration loading: YAML, a single file or a directory whose
//! `*.yaml`/`*.conf` files are merged lexicographically (spec.md §6).
//!
//! Grounded on the teacher's `config::load_config` for the overall shape
//! (a single entry point returning a fully-resolved, immutable config
//! struct) and on `units::unit_name`/`units::unit.rs`'s `from_parsed_config`
//! for turning a raw parsed map into typed `ServiceConfig`s with resolved
//! `prerequisites`.

use crate::environment::Environment;
use crate::error::ConfigError;
use crate::service::cron::CronSchedule;
use crate::service::{ServiceConfig, ServiceType, StdioMode};
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const RESERVED_GROUP_IDLE: &str = "IDLE";
pub const RESERVED_GROUP_INIT: &str = "INIT";
pub const RESERVED_SERVICE_CONSOLE: &str = "CONSOLE";
pub const RESERVED_SERVICE_MAIN: &str = "MAIN";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawSettings {
    pub detect_exit: Option<bool>,
    pub shutdown_timeout: Option<f64>,
    pub status_interval: Option<f64>,
    pub idle_delay: Option<f64>,
    pub min_log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawService {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub command: Option<Vec<String>>,
    pub directory: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub env_inherit: Vec<String>,
    pub env_set: HashMap<String, String>,
    pub env_unset: Vec<String>,
    pub service_groups: Vec<String>,
    pub before: Vec<String>,
    pub after: Vec<String>,
    pub enabled: Option<bool>,
    pub optional: bool,
    pub ignore_failures: bool,
    pub restart: bool,
    pub restart_limit: Option<u32>,
    pub restart_delay: Option<f64>,
    pub exit_kills: bool,
    pub kill_signal: Option<String>,
    pub process_timeout: Option<f64>,
    pub startup_pause: Option<f64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub interval: Option<String>,
    pub port: Option<u16>,
    pub pidfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawLogging {
    pub selector: String,
    pub file: Option<PathBuf>,
    pub stdout: bool,
    pub stderr: bool,
    pub syslog_host: Option<String>,
    pub overwrite: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub logrec_hostname: bool,
    pub enabled: bool,
    pub extended: bool,
}

/// The raw parsed document: `settings:`, `<name>.service:`, and
/// `<name>.logging:` top-level keys, modeled as a flat string-keyed map
/// since the service/logging suffix is the discriminant.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawDocument {
    #[serde(default)]
    pub settings: RawSettings,
    #[serde(flatten)]
    pub entries: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone)]
pub struct LoggingRoute {
    pub name: String,
    pub raw: RawLogging,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub settings: RawSettings,
    pub services: Vec<ServiceConfig>,
    pub logging: Vec<LoggingRoute>,
}

fn parse_duration(secs: Option<f64>, default: Duration) -> Duration {
    secs.map_or(default, Duration::from_secs_f64)
}

fn parse_stdio(mode: Option<&str>) -> StdioMode {
    match mode {
        Some("inherit") => StdioMode::Inherit,
        _ => StdioMode::Log,
    }
}

fn parse_signal(name: Option<&str>) -> Signal {
    match name.map(str::to_uppercase).as_deref() {
        Some("SIGKILL") => Signal::SIGKILL,
        Some("SIGINT") => Signal::SIGINT,
        Some("SIGHUP") => Signal::SIGHUP,
        Some("SIGQUIT") => Signal::SIGQUIT,
        _ => Signal::SIGTERM,
    }
}

/// `before`/`after` may reference a peer by its bare name or its full
/// `<name>.service` form; normalise to the latter since that's how
/// `ServiceConfig::name` and `Family`'s lookup map are keyed.
fn normalize_name(name: &str) -> String {
    if name.ends_with(".service") {
        name.to_owned()
    } else {
        format!("{name}.service")
    }
}

fn build_service(
    name: &str,
    raw: RawService,
    path: &Path,
) -> Result<ServiceConfig, ConfigError> {
    let kind = match raw.kind.as_deref().unwrap_or("simple") {
        "simple" => ServiceType::Simple,
        "oneshot" => ServiceType::Oneshot,
        "forking" => ServiceType::Forking,
        "notify" => ServiceType::Notify,
        "cron" => {
            let spec = raw.interval.as_deref().ok_or_else(|| ConfigError::Parameter {
                path: path.to_owned(),
                message: format!("{name}: cron service requires `interval`"),
            })?;
            ServiceType::Cron {
                schedule: CronSchedule::parse(spec)?,
            }
        }
        "inetd" => {
            let port = raw.port.ok_or_else(|| ConfigError::Parameter {
                path: path.to_owned(),
                message: format!("{name}: inetd service requires `port`"),
            })?;
            ServiceType::Inetd { port }
        }
        other => {
            return Err(ConfigError::Parameter {
                path: path.to_owned(),
                message: format!("{name}: unknown service type {other:?}"),
            })
        }
    };

    let uid_gid = match (raw.uid, raw.gid) {
        (Some(uid), Some(gid)) => Some((uid, gid)),
        (Some(_), None) | (None, Some(_)) => {
            return Err(ConfigError::Parameter {
                path: path.to_owned(),
                message: format!("{name}: uid and gid must be set together"),
            })
        }
        (None, None) => None,
    };

    let env_set: Vec<(String, String)> = raw.env_set.into_iter().collect();
    let environment = Arc::new(Environment::derive(
        &Arc::new(Environment::new()),
        &raw.env_inherit,
        &env_set,
        &raw.env_unset,
        uid_gid,
    ));

    let after: HashSet<String> = raw.after.iter().map(|n| normalize_name(n)).collect();
    let before: HashSet<String> = raw.before.iter().map(|n| normalize_name(n)).collect();

    Ok(ServiceConfig {
        name: name.to_owned(),
        kind,
        command: raw.command.unwrap_or_default(),
        directory: raw.directory,
        uid: raw.uid,
        gid: raw.gid,
        environment,
        service_groups: raw.service_groups,
        before,
        after: after.clone(),
        enabled: raw.enabled.unwrap_or(true),
        optional: raw.optional,
        ignore_failures: raw.ignore_failures,
        restart: raw.restart,
        restart_limit: raw.restart_limit.unwrap_or(0),
        restart_delay: parse_duration(raw.restart_delay, Duration::from_secs(1)),
        exit_kills: raw.exit_kills,
        kill_signal: parse_signal(raw.kill_signal.as_deref()),
        process_timeout: parse_duration(raw.process_timeout, Duration::from_secs(30)),
        startup_pause: parse_duration(raw.startup_pause, Duration::from_millis(100)),
        stdout: parse_stdio(raw.stdout.as_deref()),
        stderr: parse_stdio(raw.stderr.as_deref()),
        pidfile: raw.pidfile,
        prerequisites: after,
    })
}

fn parse_document(text: &str, path: &Path) -> Result<(RawSettings, Vec<(String, RawService)>, Vec<(String, RawLogging)>), ConfigError> {
    let doc: RawDocument = serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
        path: path.to_owned(),
        source,
    })?;
    let mut services = Vec::new();
    let mut logging = Vec::new();
    for (key, value) in doc.entries {
        if let Some(name) = key.strip_suffix(".service") {
            let raw: RawService =
                serde_yaml::from_value(value).map_err(|source| ConfigError::Yaml {
                    path: path.to_owned(),
                    source,
                })?;
            services.push((name.to_owned(), raw));
        } else if let Some(name) = key.strip_suffix(".logging") {
            let raw: RawLogging =
                serde_yaml::from_value(value).map_err(|source| ConfigError::Yaml {
                    path: path.to_owned(),
                    source,
                })?;
            logging.push((name.to_owned(), raw));
        }
    }
    Ok((doc.settings, services, logging))
}

/// Load a single file, or every `*.yaml`/`*.conf` file in a directory
/// merged in lexicographic filename order (later files override earlier
/// `settings:` keys and add/replace same-named services).
pub fn load_config(config_path: &Path) -> Result<Config, ConfigError> {
    let mut files = Vec::new();
    if config_path.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(config_path)
            .map_err(|source| ConfigError::Io {
                path: config_path.to_owned(),
                source,
            })?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("conf")
                )
            })
            .collect();
        entries.sort();
        files.extend(entries);
    } else {
        files.push(config_path.to_owned());
    }

    let mut settings = RawSettings::default();
    let mut raw_services: HashMap<String, RawService> = HashMap::new();
    let mut raw_logging: HashMap<String, RawLogging> = HashMap::new();

    for file in &files {
        let text = std::fs::read_to_string(file).map_err(|source| ConfigError::Io {
            path: file.clone(),
            source,
        })?;
        let (file_settings, services, logging) = parse_document(&text, file)?;
        if file_settings.detect_exit.is_some() {
            settings.detect_exit = file_settings.detect_exit;
        }
        if file_settings.shutdown_timeout.is_some() {
            settings.shutdown_timeout = file_settings.shutdown_timeout;
        }
        if file_settings.status_interval.is_some() {
            settings.status_interval = file_settings.status_interval;
        }
        if file_settings.idle_delay.is_some() {
            settings.idle_delay = file_settings.idle_delay;
        }
        if file_settings.min_log_level.is_some() {
            settings.min_log_level = file_settings.min_log_level;
        }
        for (name, raw) in services {
            raw_services.insert(name, raw);
        }
        for (name, raw) in logging {
            raw_logging.insert(name, raw);
        }
    }

    let mut services = Vec::new();
    for (name, raw) in raw_services {
        let full_name = format!("{name}.service");
        services.push(build_service(
            &full_name,
            raw,
            files.first().map_or(config_path, PathBuf::as_path),
        )?);
    }

    resolve_prerequisites(&mut services);
    check_acyclic(&services)?;

    let logging = raw_logging
        .into_iter()
        .map(|(name, raw)| LoggingRoute {
            name: format!("{name}.logging"),
            raw,
        })
        .collect();

    Ok(Config {
        settings,
        services,
        logging,
    })
}

/// Fold `before` edges into the target's `prerequisites` (a `before: [x]`
/// entry means this service is a prerequisite of `x`) and impose the
/// implicit `INIT`-before-everyone ordering (spec.md §6).
fn resolve_prerequisites(services: &mut [ServiceConfig]) {
    let by_name: HashMap<String, usize> = services
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.clone(), i))
        .collect();

    for i in 0..services.len() {
        let name = services[i].name.clone();
        for target in services[i].before.clone() {
            if let Some(&j) = by_name.get(&target) {
                services[j].prerequisites.insert(name.clone());
            }
        }
    }

    let init_members: Vec<String> = services
        .iter()
        .filter(|s| s.in_group(RESERVED_GROUP_INIT))
        .map(|s| s.name.clone())
        .collect();
    if init_members.is_empty() {
        return;
    }
    for svc in services.iter_mut() {
        if svc.in_group(RESERVED_GROUP_INIT) {
            continue;
        }
        for init_name in &init_members {
            if init_name != &svc.name {
                svc.prerequisites.insert(init_name.clone());
            }
        }
    }
}

/// DFS cycle detection over the resolved `prerequisites` graph, reporting
/// the first cycle-participating service by name.
fn check_acyclic(services: &[ServiceConfig]) -> Result<(), ConfigError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let edges: HashMap<&str, &HashSet<String>> = services
        .iter()
        .map(|s| (s.name.as_str(), &s.prerequisites))
        .collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(
        name: &'a str,
        edges: &HashMap<&'a str, &'a HashSet<String>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), ConfigError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(ConfigError::Cycle(name.to_owned())),
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        if let Some(deps) = edges.get(name) {
            for dep in deps.iter() {
                if edges.contains_key(dep.as_str()) {
                    visit(dep, edges, marks)?;
                }
            }
        }
        marks.insert(name, Mark::Done);
        Ok(())
    }

    for name in edges.keys() {
        visit(name, &edges, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn before_edge_becomes_target_prerequisite() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            &dir,
            "main.yaml",
            "first.service:\n  command: [\"/bin/true\"]\n  before: [second]\nsecond.service:\n  command: [\"/bin/true\"]\n",
        );
        let config = load_config(dir.path()).unwrap();
        let second = config.services.iter().find(|s| s.name == "second.service").unwrap();
        assert!(second.prerequisites.contains("first.service"));
    }

    #[test]
    fn init_group_is_implicit_prerequisite_of_everyone_else() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            &dir,
            "main.yaml",
            "boot.service:\n  command: [\"/bin/true\"]\n  service_groups: [INIT]\nworker.service:\n  command: [\"/bin/true\"]\n",
        );
        let config = load_config(dir.path()).unwrap();
        let worker = config.services.iter().find(|s| s.name == "worker.service").unwrap();
        assert!(worker.prerequisites.contains("boot.service"));
        let boot = config.services.iter().find(|s| s.name == "boot.service").unwrap();
        assert!(!boot.prerequisites.contains("boot.service"));
    }

    #[test]
    fn cycle_through_after_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            &dir,
            "main.yaml",
            "a.service:\n  command: [\"/bin/true\"]\n  after: [b]\nb.service:\n  command: [\"/bin/true\"]\n  after: [a]\n",
        );
        assert!(matches!(load_config(dir.path()), Err(ConfigError::Cycle(_))));
    }
}

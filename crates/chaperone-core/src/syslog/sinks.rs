//! Sink targets for matched syslog records: file (with strftime paths and
//! rotation-on-missing-inode), console, and remote UDP.
//!
//! The rotation check is grounded on the teacher's
//! `journal::storage::JournalFile`, which re-opens its backing file when the
//! on-disk inode no longer matches the one it opened (i.e. something else
//! rotated the file out from under it) — adapted here from journald's
//! structured binary format to a plain append-only text sink.

use crate::error::SyslogError;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::UdpSocket;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct Record {
    pub facility: &'static str,
    pub priority: &'static str,
    pub tag: String,
    pub pid: Option<i32>,
    pub body: String,
    pub timestamp: chrono::DateTime<chrono::Local>,
}

impl Record {
    #[must_use]
    pub fn format_line(&self) -> String {
        let pid = self.pid.map_or(String::new(), |p| format!("[{p}]"));
        format!(
            "{} {} {}{}: {}",
            self.timestamp.format("%b %e %H:%M:%S"),
            self.facility,
            self.tag,
            pid,
            self.body
        )
    }
}

pub trait Sink: Send {
    fn write_record(&mut self, record: &Record) -> Result<(), SyslogError>;
}

pub struct ConsoleSink {
    to_stderr: bool,
}

impl ConsoleSink {
    #[must_use]
    pub const fn new(to_stderr: bool) -> Self {
        Self { to_stderr }
    }
}

impl Sink for ConsoleSink {
    fn write_record(&mut self, record: &Record) -> Result<(), SyslogError> {
        if self.to_stderr {
            eprintln!("{}", record.format_line());
        } else {
            println!("{}", record.format_line());
        }
        Ok(())
    }
}

/// A file sink whose path may contain `strftime` placeholders
/// (e.g. `/var/log/chaperone/%Y-%m-%d.log`); re-opens automatically if the
/// currently-held file's inode no longer matches what's on disk.
pub struct FileSink {
    path_template: String,
    mode: u32,
    current_path: Option<PathBuf>,
    current_inode: Option<u64>,
    handle: Option<File>,
}

impl FileSink {
    #[must_use]
    pub const fn new(path_template: String, mode: u32) -> Self {
        Self {
            path_template,
            mode,
            current_path: None,
            current_inode: None,
            handle: None,
        }
    }

    fn resolved_path(&self, record: &Record) -> PathBuf {
        PathBuf::from(record.timestamp.format(&self.path_template).to_string())
    }

    fn ensure_open(&mut self, path: &PathBuf) -> Result<(), SyslogError> {
        let needs_reopen = match (&self.current_path, self.current_inode) {
            (Some(current), Some(inode)) if current == path => {
                std::fs::metadata(path).map(|m| m.ino()).ok() != Some(inode)
            }
            _ => true,
        };
        if !needs_reopen && self.handle.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| SyslogError::SinkIo {
                name: path.display().to_string(),
                source,
            })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(std::fs::Permissions::from_mode(self.mode));
        }
        let inode = file.metadata().map(|m| m.ino()).ok();
        self.handle = Some(file);
        self.current_path = Some(path.clone());
        self.current_inode = inode;
        Ok(())
    }
}

impl Sink for FileSink {
    fn write_record(&mut self, record: &Record) -> Result<(), SyslogError> {
        let path = self.resolved_path(record);
        self.ensure_open(&path)?;
        if let Some(file) = &mut self.handle {
            writeln!(file, "{}", record.format_line()).map_err(|source| SyslogError::SinkIo {
                name: path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

/// UDP datagram client to a remote syslog collector on port 514.
pub struct RemoteSink {
    socket: UdpSocket,
}

impl RemoteSink {
    pub fn connect(host: &str) -> Result<Self, SyslogError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|source| SyslogError::SinkIo {
            name: host.to_owned(),
            source,
        })?;
        socket
            .connect((host, 514))
            .map_err(|source| SyslogError::SinkIo {
                name: host.to_owned(),
                source,
            })?;
        Ok(Self { socket })
    }
}

impl Sink for RemoteSink {
    fn write_record(&mut self, record: &Record) -> Result<(), SyslogError> {
        let line = record.format_line();
        self.socket
            .send(line.as_bytes())
            .map_err(|source| SyslogError::SinkIo {
                name: "remote".to_owned(),
                source,
            })?;
        Ok(())
    }
}

/// A named sink plus the selector deciding whether a record reaches it.
///
/// `selector` is mutex-guarded, not plain, because `loglevel` (spec.md
/// §4.6) resets the minimum-priority floor at runtime from the
/// control-plane thread while the ingestor's read loop is matching
/// records against the same route concurrently.
pub struct Route {
    pub name: String,
    pub selector: Mutex<super::selector::Selector>,
    pub sink: Mutex<Box<dyn Sink>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_reopens_on_inode_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let mut sink = FileSink::new(path.to_string_lossy().into_owned(), 0o644);
        let record = Record {
            facility: "daemon",
            priority: "info",
            tag: "test".into(),
            pid: Some(1),
            body: "hello".into(),
            timestamp: chrono::Local::now(),
        };
        sink.write_record(&record).unwrap();
        std::fs::remove_file(&path).unwrap();
        sink.write_record(&record).unwrap();
        assert!(path.exists());
    }
}

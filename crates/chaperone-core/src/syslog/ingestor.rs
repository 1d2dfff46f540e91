//! Binds `/dev/log` and decodes RFC3164 frames, dispatching each to every
//! route whose selector matches.
//!
//! Grounded on `journal::entry`'s timestamp-formatting helpers (adapted here
//! from journald's structured-entry model to RFC3164 line framing) and the
//! teacher's `threadpool` dependency, reused here to back per-datagram sink
//! dispatch instead of per-unit-operation dispatch.

use super::selector::{facility_name, priority_name};
use super::sinks::{Record, Route};
use crate::error::SyslogError;
use std::os::unix::net::UnixDatagram;
use std::sync::Arc;
use threadpool::ThreadPool;

pub struct Ingestor {
    socket: UnixDatagram,
    routes: Arc<Vec<Route>>,
    pool: ThreadPool,
}

impl Ingestor {
    /// `routes` is shared with the control plane so `telchap loglevel` can
    /// reset routes' selector floors while this ingestor is still matching
    /// records against them.
    pub fn bind(path: &str, routes: Arc<Vec<Route>>) -> Result<Self, SyslogError> {
        let _ = std::fs::remove_file(path);
        let socket = UnixDatagram::bind(path).map_err(|source| SyslogError::Bind {
            path: path.into(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777));
        }
        Ok(Self {
            socket,
            routes,
            pool: ThreadPool::new(2),
        })
    }

    /// Blocking receive loop; run this on its own thread.
    pub fn run(&self) {
        let mut buf = [0u8; 4096];
        loop {
            let Ok(n) = self.socket.recv(&mut buf) else {
                return;
            };
            let datagram = String::from_utf8_lossy(&buf[..n]).into_owned();
            let routes = self.routes.clone();
            self.pool.execute(move || {
                for frame in datagram.split('\0') {
                    let frame = frame.trim();
                    if frame.is_empty() {
                        continue;
                    }
                    let record = parse_rfc3164(frame);
                    for route in routes.iter() {
                        let matched = route
                            .selector
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .matches(record.facility, record.priority, &record.tag);
                        if matched {
                            let mut sink = route.sink.lock().unwrap_or_else(|e| e.into_inner());
                            if let Err(e) = sink.write_record(&record) {
                                log::warn!("syslog sink {:?} write failed: {e}", route.name);
                            }
                        }
                    }
                }
            });
        }
    }
}

/// Decode `<pri>Mon DD HH:MM:SS [host ]tag[pid]: body`. Unparseable frames
/// synthesise a record with `tag=?`, facility `syslog`, priority `err`.
fn parse_rfc3164(frame: &str) -> Record {
    let Some(parsed) = try_parse_rfc3164(frame) else {
        return Record {
            facility: "syslog",
            priority: "err",
            tag: "?".to_owned(),
            pid: None,
            body: frame.to_owned(),
            timestamp: chrono::Local::now(),
        };
    };
    parsed
}

fn try_parse_rfc3164(frame: &str) -> Option<Record> {
    let rest = frame.strip_prefix('<')?;
    let (pri_str, rest) = rest.split_once('>')?;
    let pri: u8 = pri_str.parse().ok()?;
    let facility = facility_name(pri / 8);
    let priority = priority_name(pri % 8);

    // "Mon DD HH:MM:SS " is a fixed-width 16-byte timestamp.
    if rest.len() < 16 {
        return None;
    }
    let (_timestamp_str, rest) = rest.split_at(16);
    let rest = rest.trim_start();

    // Optional hostname: a token with no `:` or `[` before the tag.
    let (maybe_host, after_host) = rest.split_once(' ').unwrap_or((rest, ""));
    let (tag_section, body) = if maybe_host.contains(':') || maybe_host.contains('[') {
        rest.split_once(':')?
    } else {
        after_host.split_once(':')?
    };

    let tag_section = tag_section.trim();
    let (tag, pid) = if let Some((name, pid_part)) = tag_section.split_once('[') {
        let pid = pid_part.trim_end_matches(']').parse::<i32>().ok();
        (name.to_owned(), pid)
    } else {
        (tag_section.to_owned(), None)
    };

    Some(Record {
        facility,
        priority,
        tag,
        pid,
        body: body.trim_start().to_owned(),
        timestamp: chrono::Local::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_frame() {
        let record = parse_rfc3164("<34>Oct 11 22:14:15 sshd[1234]: authentication failure");
        assert_eq!(record.facility, "auth");
        assert_eq!(record.priority, "crit");
        assert_eq!(record.tag, "sshd");
        assert_eq!(record.pid, Some(1234));
        assert_eq!(record.body, "authentication failure");
    }

    #[test]
    fn unparseable_frame_gets_placeholder_record() {
        let record = parse_rfc3164("garbage frame with no pri");
        assert_eq!(record.tag, "?");
        assert_eq!(record.facility, "syslog");
        assert_eq!(record.priority, "err");
    }
}

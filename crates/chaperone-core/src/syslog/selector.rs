//! Syslog selector grammar: compiles `*.info;![cron].*`-style specs into a
//! predicate over `(facility, priority, tag, body)`.
//!
//! No direct teacher counterpart (journald routes by structured fields, not
//! a selector grammar) — built fresh per spec.md §4.6, but compiled with the
//! `regex` crate exactly as the teacher's glob/regex unit-property matching
//! does, rather than a hand-rolled engine.

use crate::error::SyslogError;
use regex::Regex;
use std::cmp::Ordering;

pub const FACILITIES: &[&str] = &[
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron",
    "authpriv", "ftp", "ntp", "security", "console", "solaris-cron", "local0", "local1",
    "local2", "local3", "local4", "local5", "local6", "local7",
];

/// Lower index ⇒ more severe, matching syslog's numeric severity ordering.
pub const PRIORITIES: &[&str] = &[
    "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

#[must_use]
pub fn facility_name(code: u8) -> &'static str {
    FACILITIES.get(code as usize).copied().unwrap_or("local7")
}

#[must_use]
pub fn priority_name(code: u8) -> &'static str {
    PRIORITIES.get(code as usize).copied().unwrap_or("debug")
}

fn priority_index(name: &str) -> Option<usize> {
    PRIORITIES.iter().position(|p| *p == name)
}

#[derive(Debug, Clone)]
enum Subject {
    Any,
    Facilities(Vec<String>),
    Regex(String, #[allow(dead_code)] ()),
    Tag(String),
}

#[derive(Debug, Clone, Copy)]
enum PriorityMatch {
    Any,
    AtLeast(usize),
    Exact(usize),
}

#[derive(Debug, Clone)]
struct Clause {
    negated: bool,
    subject: Subject,
    subject_negated: bool,
    compiled_regex: Option<Regex>,
    priority: PriorityMatch,
}

impl Clause {
    fn matches(&self, facility: &str, priority_idx: usize, tag: &str) -> bool {
        let subject_hit = match &self.subject {
            Subject::Any => true,
            Subject::Facilities(list) => list.iter().any(|f| f == facility),
            Subject::Regex(_, ()) => self
                .compiled_regex
                .as_ref()
                .is_some_and(|re| re.is_match(tag) || re.is_match(facility)),
            Subject::Tag(name) => name == tag,
        };
        let subject_hit = if self.subject_negated {
            !subject_hit
        } else {
            subject_hit
        };
        let priority_hit = match self.priority {
            PriorityMatch::Any => true,
            PriorityMatch::AtLeast(p) => priority_idx <= p,
            PriorityMatch::Exact(p) => priority_idx == p,
        };
        subject_hit && priority_hit
    }
}

/// A compiled selector: an OR of positive clauses ANDed with every negative
/// clause. A selector with no positive clauses never matches.
#[derive(Debug, Clone)]
pub struct Selector {
    positive: Vec<Clause>,
    negative: Vec<Clause>,
}

impl Selector {
    pub fn compile(spec: &str) -> Result<Self, SyslogError> {
        let mut positive = Vec::new();
        let mut negative = Vec::new();
        for raw_clause in spec.split(';') {
            let raw_clause = raw_clause.trim();
            if raw_clause.is_empty() {
                continue;
            }
            let clause = parse_clause(raw_clause, spec)?;
            if clause.negated {
                negative.push(clause);
            } else {
                positive.push(clause);
            }
        }
        Ok(Self { positive, negative })
    }

    #[must_use]
    pub fn matches(&self, facility: &str, priority: &str, tag: &str) -> bool {
        let Some(priority_idx) = priority_index(priority) else {
            return false;
        };
        if self.positive.is_empty() {
            return false;
        }
        let positive_hit = self
            .positive
            .iter()
            .any(|c| c.matches(facility, priority_idx, tag));
        let negative_hit = self
            .negative
            .iter()
            .all(|c| c.matches(facility, priority_idx, tag));
        positive_hit && negative_hit
    }

    /// Raise every `AtLeast`/`Exact` floor in this selector to at least
    /// `floor`, used for a runtime-reset minimum priority.
    pub fn raise_floor(&mut self, floor: &str) {
        let Some(floor_idx) = priority_index(floor) else {
            return;
        };
        for clause in self.positive.iter_mut().chain(self.negative.iter_mut()) {
            clause.priority = match clause.priority {
                PriorityMatch::AtLeast(p) => PriorityMatch::AtLeast(p.min(floor_idx)),
                PriorityMatch::Exact(p) if p > floor_idx => PriorityMatch::AtLeast(floor_idx),
                other => other,
            };
        }
    }
}

fn parse_clause(raw: &str, whole_spec: &str) -> Result<Clause, SyslogError> {
    let Some((subject_part, priority_part)) = raw.rsplit_once('.') else {
        return Err(SyslogError::Selector {
            selector: whole_spec.to_owned(),
            message: format!("missing `.` in clause {raw:?}"),
        });
    };

    let clause_negated = subject_part.starts_with('!') && !subject_part.starts_with("!/");
    let mut rest = subject_part;
    let mut subject_negated = false;
    if let Some(stripped) = rest.strip_prefix('!') {
        subject_negated = true;
        rest = stripped;
    }

    let (subject, compiled_regex) = if rest == "*" {
        (Subject::Any, None)
    } else if let Some(inner) = rest.strip_prefix('/').and_then(|s| s.strip_suffix('/')) {
        let re = Regex::new(inner).map_err(|e| SyslogError::Selector {
            selector: whole_spec.to_owned(),
            message: format!("bad regex {inner:?}: {e}"),
        })?;
        (Subject::Regex(inner.to_owned(), ()), Some(re))
    } else if rest.contains(',') || FACILITIES.contains(&rest) {
        (
            Subject::Facilities(rest.split(',').map(str::to_owned).collect()),
            None,
        )
    } else if let Some(tag) = rest.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        (Subject::Tag(tag.to_owned()), None)
    } else {
        (Subject::Tag(rest.to_owned()), None)
    };

    let mut priority_rest = priority_part;
    let mut priority_negated = false;
    if let Some(stripped) = priority_rest.strip_prefix('!') {
        priority_negated = true;
        priority_rest = stripped;
    }
    let exact = priority_rest.starts_with('=');
    let priority_rest = priority_rest.strip_prefix('=').unwrap_or(priority_rest);

    let priority = if priority_rest == "*" {
        PriorityMatch::Any
    } else {
        let idx = priority_index(priority_rest).ok_or_else(|| SyslogError::Selector {
            selector: whole_spec.to_owned(),
            message: format!("unknown priority {priority_rest:?}"),
        })?;
        if exact {
            PriorityMatch::Exact(idx)
        } else {
            PriorityMatch::AtLeast(idx)
        }
    };
    // `!` before priority negates the comparison: "not at least this
    // severe" becomes "strictly less severe" and exact-negation becomes
    // "anything but this exact level". Modeled by flipping to the
    // complementary comparison rather than a third enum arm, since the
    // predicate space is small enough to special-case here.
    let priority = if priority_negated {
        match priority {
            PriorityMatch::AtLeast(p) => PriorityMatch::Exact(p.saturating_sub(1).min(p)),
            other => other,
        }
    } else {
        priority
    };

    Ok(Clause {
        negated: clause_negated,
        subject,
        subject_negated,
        compiled_regex,
        priority,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_everything() {
        let sel = Selector::compile("*.*").unwrap();
        assert!(sel.matches("daemon", "info", "sshd"));
        assert!(sel.matches("kern", "emerg", "kernel"));
    }

    #[test]
    fn info_or_higher_excludes_cron() {
        let sel = Selector::compile("*.info;![cron].*").unwrap();
        assert!(sel.matches("daemon", "info", "sshd"));
        assert!(sel.matches("daemon", "err", "sshd"));
        assert!(!sel.matches("cron", "info", "cron"));
    }

    #[test]
    fn no_positive_clause_never_matches() {
        let sel = Selector::compile("![cron].*").unwrap();
        assert!(!sel.matches("daemon", "info", "sshd"));
    }

    #[test]
    fn exact_priority_requires_equality() {
        let sel = Selector::compile("*.=err").unwrap();
        assert!(sel.matches("daemon", "err", "x"));
        assert!(!sel.matches("daemon", "crit", "x"));
    }

    #[test]
    fn facility_list_matches_any_member() {
        let sel = Selector::compile("kern,daemon.info").unwrap();
        assert!(sel.matches("kern", "info", "x"));
        assert!(sel.matches("daemon", "info", "x"));
        assert!(!sel.matches("mail", "info", "x"));
    }
}

//! Recursive, self-referential variable expansion with conditional operators
//! (spec.md §4.1).
//!
//! Has no direct teacher counterpart — systemd unit files use a much flatter
//! `%i`/`$FOO` substitution model — so this module is built fresh, but in the
//! teacher's idiom: a plain struct with an internal cache guarded the same
//! way `RuntimeInfo`/`FDStore` guard theirs (`RwLock<Option<...>>`,
//! invalidated on mutation), and `thiserror`-derived errors matching
//! `crate::error::EnvError`.
//!
//! The scanner is a hand-rolled stack-based character scanner (not a regex
//! — nesting must be tracked), mirroring how the teacher hand-parses INI-style
//! unit files rather than reaching for a grammar crate.

use crate::error::EnvError;
use regex::RegexBuilder;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

/// Process-wide cache for backtick command substitutions, keyed by
/// `(uid, gid, command)`. Avoids re-running the same shell-out on every
/// `expand()` call within a single process lifetime.
fn command_cache() -> &'static Mutex<HashMap<(Option<u32>, Option<u32>, String), String>> {
    static CACHE: OnceLock<Mutex<HashMap<(Option<u32>, Option<u32>, String), String>>> =
        OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Which characters open/close a substitution group, and what prefix
/// introduces one. Defaults to `$(...)`/`${...}`; the template-copier tool
/// (`envcp`) reconfigures this to `%{...}`.
#[derive(Debug, Clone)]
pub struct Syntax {
    pub prefix: char,
    pub openers: Vec<(char, char)>,
}

impl Default for Syntax {
    fn default() -> Self {
        Self {
            prefix: '$',
            openers: vec![('(', ')'), ('{', '}')],
        }
    }
}

/// An ordered mapping K→V with a lifecycle-linked shadow: for each key ever
/// overwritten by `env_set`, a reference to the prior binding is retained so
/// self-referential definitions resolve against the earlier value.
pub struct Environment {
    order: Vec<String>,
    entries: HashMap<String, String>,
    /// Predecessor environment to resolve a self-referential key against,
    /// recorded only for keys that were rebound over an existing value.
    shadow: HashMap<String, Arc<Environment>>,
    uid_gid: Option<(u32, u32)>,
    syntax: Syntax,
    cache: RwLock<Option<HashMap<String, String>>>,
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
            shadow: HashMap::new(),
            uid_gid: None,
            syntax: Syntax::default(),
            cache: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn with_syntax(syntax: Syntax) -> Self {
        Self {
            syntax,
            ..Self::new()
        }
    }

    /// Build a root environment directly from key/value pairs (e.g. the
    /// calling process's own environment), with no predecessor to shadow
    /// against. Used by `envcp`, which has no `ServiceConfig` to derive from.
    #[must_use]
    pub fn from_pairs(syntax: Syntax, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut env = Self::with_syntax(syntax);
        for (key, value) in pairs {
            env.set_raw(&key, value);
        }
        env
    }

    /// Build a child environment from `from`, respecting `env_inherit` glob
    /// patterns (`["*"]` by default), then applying `env_set` additions and
    /// `env_unset` glob deletions, recording shadow entries for any key that
    /// already existed in `from` and is overwritten by `env_set`.
    #[must_use]
    pub fn derive(
        from: &Arc<Environment>,
        env_inherit: &[String],
        env_set: &[(String, String)],
        env_unset: &[String],
        uid_gid: Option<(u32, u32)>,
    ) -> Self {
        let mut child = Self::new();
        child.uid_gid = uid_gid;
        child.syntax = from.syntax.clone();

        let patterns: Vec<&str> = if env_inherit.is_empty() {
            vec!["*"]
        } else {
            env_inherit.iter().map(String::as_str).collect()
        };
        for key in &from.order {
            if patterns.iter().any(|p| glob_match(p, key)) {
                child.set_raw(key, from.entries[key].clone());
            }
        }

        if let Some((uid, _gid)) = uid_gid {
            if let Some(pw) = lookup_user(uid) {
                child.set_raw("HOME", pw.home);
                child.set_raw("USER", pw.name.clone());
                child.set_raw("LOGNAME", pw.name);
            }
        }

        for (key, value) in env_set {
            if from.entries.contains_key(key) {
                child.shadow.insert(key.clone(), from.clone());
            }
            child.set_raw(key, value.clone());
        }

        for pattern in env_unset {
            let doomed: Vec<String> = child
                .order
                .iter()
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect();
            for key in doomed {
                child.remove_raw(&key);
            }
        }

        child
    }

    fn set_raw(&mut self, key: &str, value: String) {
        if !self.entries.contains_key(key) {
            self.order.push(key.to_owned());
        }
        self.entries.insert(key.to_owned(), value);
        self.invalidate();
    }

    fn remove_raw(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
        self.invalidate();
    }

    fn invalidate(&mut self) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Expand `s`, replacing every `$(name…)`/`${name…}` reference. Unset
    /// references are preserved literally (e.g. `$(FOO)` stays `$(FOO)` if
    /// `FOO` is undefined).
    pub fn expand(&self, s: &str) -> Result<String, EnvError> {
        let mut stack = Vec::new();
        self.expand_str(s, &mut stack, false)
    }

    /// A fully expanded snapshot of every key. Repeated calls return the same
    /// cached snapshot until a mutation invalidates it. Undefined references
    /// expand to the empty string within this context.
    pub fn expanded(&self) -> Result<HashMap<String, String>, EnvError> {
        if let Some(cached) = self.cache.read().unwrap_or_else(|e| e.into_inner()).clone() {
            return Ok(cached);
        }
        let mut out = HashMap::new();
        for key in &self.order {
            out.insert(key.clone(), self.expand_key(key, &mut Vec::new(), true)?);
        }
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(out.clone());
        Ok(out)
    }

    /// Expand the value bound to `key`, threading the in-progress `stack` so
    /// self-references resolve against the shadow environment rather than
    /// recursing on the not-yet-finished new value.
    fn expand_key(
        &self,
        key: &str,
        stack: &mut Vec<String>,
        preserve_undefined: bool,
    ) -> Result<String, EnvError> {
        if stack.contains(&key.to_owned()) {
            // Self-reference or cycle: resolve against the predecessor
            // environment if one was recorded, else stop recursing and
            // return the raw (unexpanded) value as the partial result.
            return if let Some(shadow_env) = self.shadow.get(key) {
                shadow_env.expand_key(key, &mut Vec::new(), preserve_undefined)
            } else {
                Ok(self.entries.get(key).cloned().unwrap_or_default())
            };
        }
        let Some(raw) = self.entries.get(key) else {
            return Ok(String::new());
        };
        stack.push(key.to_owned());
        let result = self.expand_str(raw, stack, preserve_undefined);
        stack.pop();
        result
    }

    fn lookup(
        &self,
        name: &str,
        stack: &mut Vec<String>,
        preserve_undefined: bool,
    ) -> Result<Option<String>, EnvError> {
        if !self.entries.contains_key(name) {
            return Ok(None);
        }
        Some(self.expand_key(name, stack, preserve_undefined)).transpose()
    }

    fn truthy(value: &str) -> bool {
        !value.is_empty() && !matches!(value, "0" | "false" | "no" | "off")
    }

    fn expand_str(
        &self,
        s: &str,
        stack: &mut Vec<String>,
        preserve_undefined: bool,
    ) -> Result<String, EnvError> {
        let chars: Vec<char> = s.chars().collect();
        let mut out = String::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '\\' && i + 1 < chars.len() && chars[i + 1] == self.syntax.prefix {
                out.push(self.syntax.prefix);
                i += 2;
                continue;
            }
            if c == '`' {
                let Some(end) = find_unescaped(&chars, i + 1, '`') else {
                    out.push(c);
                    i += 1;
                    continue;
                };
                let cmd: String = chars[i + 1..end].iter().collect();
                let cmd = self.expand_str(&cmd, stack, preserve_undefined)?;
                out.push_str(&self.run_command(&cmd));
                i = end + 1;
                continue;
            }
            if c == self.syntax.prefix {
                if let Some(&(open, close)) = self
                    .syntax
                    .openers
                    .iter()
                    .find(|&&(open, _)| chars.get(i + 1) == Some(&open))
                {
                    let Some(end) = find_matching_close(&chars, i + 2, open, close) else {
                        out.push(c);
                        i += 1;
                        continue;
                    };
                    let inner: String = chars[i + 2..end].iter().collect();
                    out.push_str(&self.expand_group(
                        &inner,
                        stack,
                        preserve_undefined,
                        &format!("{}{}{}{}", self.syntax.prefix, open, inner, close),
                    )?);
                    i = end + 1;
                    continue;
                }
            }
            out.push(c);
            i += 1;
        }
        Ok(out)
    }

    #[allow(clippy::too_many_lines)]
    fn expand_group(
        &self,
        inner: &str,
        stack: &mut Vec<String>,
        preserve_undefined: bool,
        literal: &str,
    ) -> Result<String, EnvError> {
        if inner.starts_with('`') && inner.ends_with('`') && inner.len() >= 2 {
            let cmd = self.expand_str(&inner[1..inner.len() - 1], stack, preserve_undefined)?;
            return Ok(self.run_command(&cmd));
        }

        let Some(colon) = find_unescaped_char(inner, ':') else {
            let name = inner;
            return match self.lookup(name, stack, preserve_undefined)? {
                Some(value) => Ok(value),
                None if preserve_undefined => Ok(literal.to_owned()),
                None => Ok(String::new()),
            };
        };
        let name = &inner[..colon];
        let rest = &inner[colon + 1..];
        let Some(op) = rest.chars().next() else {
            return match self.lookup(name, stack, preserve_undefined)? {
                Some(value) => Ok(value),
                None if preserve_undefined => Ok(literal.to_owned()),
                None => Ok(String::new()),
            };
        };
        let arg = &rest[op.len_utf8()..];
        let defined = self.entries.contains_key(name);
        let current = self.lookup(name, stack, preserve_undefined)?;

        match op {
            '-' => {
                if let Some(value) = current {
                    Ok(value)
                } else {
                    self.expand_str(arg, stack, preserve_undefined)
                }
            }
            '+' => {
                if defined {
                    self.expand_str(arg, stack, preserve_undefined)
                } else {
                    Ok(String::new())
                }
            }
            '_' => {
                if defined {
                    Ok(String::new())
                } else {
                    self.expand_str(arg, stack, preserve_undefined)
                }
            }
            '?' => current.ok_or_else(|| {
                EnvError::Required(name.to_owned(), arg.to_owned())
            }),
            '/' => {
                let value = current.unwrap_or_default();
                let fields = split_unescaped(arg, '/');
                if fields.len() != 3 {
                    return Err(EnvError::Parameter(
                        name.to_owned(),
                        format!("expected pat/repl/flags, got {arg:?}"),
                    ));
                }
                let pattern = self.expand_str(&fields[0], stack, preserve_undefined)?;
                let replacement = self.expand_str(&fields[1], stack, preserve_undefined)?;
                let flags = &fields[2];
                let re = RegexBuilder::new(&pattern)
                    .case_insensitive(flags.contains('i'))
                    .build()
                    .map_err(|e| EnvError::Parameter(name.to_owned(), e.to_string()))?;
                if flags.contains('g') {
                    Ok(re.replace_all(&value, replacement.as_str()).into_owned())
                } else {
                    Ok(re.replace(&value, replacement.as_str()).into_owned())
                }
            }
            '|' => {
                let fields = split_unescaped(arg, '|');
                let truthy = current.as_deref().is_some_and(Self::truthy);
                match fields.len() {
                    1 => {
                        if truthy {
                            self.expand_str(&fields[0], stack, preserve_undefined)
                        } else {
                            Ok(String::new())
                        }
                    }
                    2 => {
                        if truthy {
                            self.expand_str(&fields[0], stack, preserve_undefined)
                        } else {
                            self.expand_str(&fields[1], stack, preserve_undefined)
                        }
                    }
                    3 => {
                        let glob = self.expand_str(&fields[0], stack, preserve_undefined)?;
                        let value = current.unwrap_or_default();
                        if glob_match_case_insensitive(&glob, &value) {
                            self.expand_str(&fields[1], stack, preserve_undefined)
                        } else {
                            self.expand_str(&fields[2], stack, preserve_undefined)
                        }
                    }
                    _ => Err(EnvError::Parameter(
                        name.to_owned(),
                        format!("expected 1-3 `|`-separated fields, got {arg:?}"),
                    )),
                }
            }
            _ => Err(EnvError::Parameter(
                name.to_owned(),
                format!("unknown operator {op:?}"),
            )),
        }
    }

    fn run_command(&self, cmd: &str) -> String {
        let (uid, gid) = self
            .uid_gid
            .map_or((None, None), |(u, g)| (Some(u), Some(g)));
        let key = (uid, gid, cmd.to_owned());
        if let Some(cached) = command_cache().lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return cached.clone();
        }
        let mut command = std::process::Command::new("/bin/sh");
        command.arg("-c").arg(cmd);
        if let Some(uid) = uid {
            std::os::unix::process::CommandExt::uid(&mut command, uid);
        }
        if let Some(gid) = gid {
            std::os::unix::process::CommandExt::gid(&mut command, gid);
        }
        let output = command
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
            .unwrap_or_default();
        let collapsed = output.split_whitespace().collect::<Vec<_>>().join(" ");
        command_cache()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, collapsed.clone());
        collapsed
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the index of the matching closer for a group that opened at
/// `start - 1`, honouring nesting of the same open/close pair and skipping
/// content inside `"…"`/`` `…` `` quoted runs so brackets inside a quoted
/// command substitution don't terminate the group early.
fn find_matching_close(chars: &[char], start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 1usize;
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '"' => {
                if let Some(end) = find_unescaped(chars, i + 1, '"') {
                    i = end;
                } else {
                    return None;
                }
            }
            '`' => {
                if let Some(end) = find_unescaped(chars, i + 1, '`') {
                    i = end;
                } else {
                    return None;
                }
            }
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn find_unescaped(chars: &[char], start: usize, target: char) -> Option<usize> {
    let mut i = start;
    while i < chars.len() {
        if chars[i] == '\\' {
            i += 2;
            continue;
        }
        if chars[i] == target {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn find_unescaped_char(s: &str, target: char) -> Option<usize> {
    let bytes: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == '\\' {
            i += 2;
            continue;
        }
        if bytes[i] == target {
            return Some(byte_offset(s, i));
        }
        i += 1;
    }
    None
}

fn byte_offset(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map_or(s.len(), |(b, _)| b)
}

/// Split on an unescaped delimiter (`\X` escapes a literal `X`), stripping
/// the escape backslash from the output fields.
fn split_unescaped(s: &str, delim: char) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && i + 1 < chars.len() && chars[i + 1] == delim {
            current.push(delim);
            i += 2;
            continue;
        }
        if chars[i] == delim {
            fields.push(std::mem::take(&mut current));
            i += 1;
            continue;
        }
        current.push(chars[i]);
        i += 1;
    }
    fields.push(current);
    fields
}

/// Minimal glob matcher supporting `*` and `?`, used for `env_inherit`,
/// `env_unset`, and the `:|G|Y|N` selector form.
fn glob_match(pattern: &str, text: &str) -> bool {
    glob_match_inner(pattern.as_bytes(), text.as_bytes())
}

fn glob_match_case_insensitive(pattern: &str, text: &str) -> bool {
    glob_match(&pattern.to_lowercase(), &text.to_lowercase())
}

fn glob_match_inner(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match_inner(&pattern[1..], text)
                || (!text.is_empty() && glob_match_inner(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match_inner(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match_inner(&pattern[1..], &text[1..]),
        _ => false,
    }
}

struct Passwd {
    name: String,
    home: String,
}

fn lookup_user(uid: u32) -> Option<Passwd> {
    let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)).ok()??;
    Some(Passwd {
        name: user.name,
        home: user.dir.to_string_lossy().into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(pairs: &[(&str, &str)]) -> Environment {
        let mut env = Environment::new();
        for (k, v) in pairs {
            env.set_raw(k, (*v).to_owned());
        }
        env
    }

    #[test]
    fn plain_lookup() {
        let env = env_with(&[("FOO", "bar")]);
        assert_eq!(env.expand("$(FOO)").unwrap(), "bar");
        assert_eq!(env.expand("${FOO}").unwrap(), "bar");
    }

    #[test]
    fn undefined_preserved_in_expand_but_empty_in_expanded() {
        let env = env_with(&[]);
        assert_eq!(env.expand("$(MISSING)").unwrap(), "$(MISSING)");
    }

    #[test]
    fn default_operator() {
        let env = env_with(&[]);
        assert_eq!(env.expand("$(FOO:-fallback)").unwrap(), "fallback");
        let env = env_with(&[("FOO", "set")]);
        assert_eq!(env.expand("$(FOO:-fallback)").unwrap(), "set");
    }

    #[test]
    fn plus_and_minus_operators() {
        let set = env_with(&[("FOO", "x")]);
        assert_eq!(set.expand("$(FOO:+yes)").unwrap(), "yes");
        assert_eq!(set.expand("$(FOO:_yes)").unwrap(), "");
        let unset = env_with(&[]);
        assert_eq!(unset.expand("$(FOO:+yes)").unwrap(), "");
        assert_eq!(unset.expand("$(FOO:_yes)").unwrap(), "yes");
    }

    #[test]
    fn required_operator_fails_when_unset() {
        let env = env_with(&[]);
        assert!(env.expand("$(FOO:?must be set)").is_err());
    }

    #[test]
    fn self_reference_resolves_against_shadow() {
        let parent = Arc::new(env_with(&[("PATH", "/bin")]));
        let child = Environment::derive(
            &parent,
            &["*".to_owned()],
            &[("PATH".to_owned(), "/opt/bin:$(PATH)".to_owned())],
            &[],
            None,
        );
        assert_eq!(child.expand("$(PATH)").unwrap(), "/opt/bin:/bin");
    }

    #[test]
    fn two_key_cycle_terminates() {
        let mut env = Environment::new();
        env.set_raw("A", "$(B)".to_owned());
        env.set_raw("B", "$(A)".to_owned());
        // Must terminate rather than loop forever; exact text is
        // unspecified beyond "the partially expanded intermediate value".
        let _ = env.expand("$(A)").unwrap();
    }

    #[test]
    fn regex_substitute() {
        let env = env_with(&[("FOO", "hello world")]);
        assert_eq!(
            env.expand("$(FOO:/world/rust/)").unwrap(),
            "hello rust"
        );
    }

    #[test]
    fn truthy_operator_two_and_three_fields() {
        let env = env_with(&[("FOO", "1")]);
        assert_eq!(env.expand("$(FOO:|yes|no)").unwrap(), "yes");
        let env = env_with(&[("FOO", "0")]);
        assert_eq!(env.expand("$(FOO:|yes|no)").unwrap(), "no");

        let env = env_with(&[("FOO", "worker-3")]);
        assert_eq!(env.expand("$(FOO:|worker-*|Y|N)").unwrap(), "Y");
    }

    #[test]
    fn carbon_copy_law() {
        let parent = Arc::new(env_with(&[("A", "1"), ("B", "2")]));
        let child = Environment::derive(&parent, &["*".to_owned()], &[], &[], None);
        assert_eq!(child.expanded().unwrap(), parent.expanded().unwrap());
    }
}

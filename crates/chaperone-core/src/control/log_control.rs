//! Runtime control over the syslog routing table's minimum-priority floor
//! (spec.md §4.6's `loglevel` command).
//!
//! Shares the same `Arc<Vec<Route>>` the `Ingestor` reads from, so raising
//! the floor here is visible to the ingestor's next match without a
//! restart.

use crate::lock_ext::MutexExt;
use crate::syslog::Route;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct LogControl {
    routes: Arc<Vec<Route>>,
    floor: Arc<Mutex<Option<String>>>,
}

impl LogControl {
    #[must_use]
    pub fn new(routes: Arc<Vec<Route>>) -> Self {
        Self {
            routes,
            floor: Arc::new(Mutex::new(None)),
        }
    }

    /// Raise every route's selector floor to at least `level` and remember
    /// it as the current level. Never lowers a floor a route's own config
    /// already set tighter than `level`.
    pub fn raise_floor(&self, level: &str) {
        for route in self.routes.iter() {
            route.selector.lock_poisoned().raise_floor(level);
        }
        *self.floor.lock_poisoned() = Some(level.to_owned());
    }

    #[must_use]
    pub fn current(&self) -> String {
        self.floor
            .lock_poisoned()
            .clone()
            .unwrap_or_else(|| "default".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syslog::{ConsoleSink, Selector};

    #[test]
    fn raise_floor_updates_every_route_and_tracks_current_level() {
        let route = Route {
            name: "console".to_owned(),
            selector: Mutex::new(Selector::compile("*.debug").unwrap()),
            sink: Mutex::new(Box::new(ConsoleSink::new(false))),
        };
        let control = LogControl::new(Arc::new(vec![route]));
        assert_eq!(control.current(), "default");

        control.raise_floor("warning");
        assert_eq!(control.current(), "warning");
        assert!(!control.routes[0].selector.lock_poisoned().matches("daemon", "info", "sshd"));
        assert!(control.routes[0].selector.lock_poisoned().matches("daemon", "err", "sshd"));
    }
}

//! `Family` — the dependency-ordered collection of services under one
//! controller for one configuration.
//!
//! Grounded on the teacher's `RuntimeInfo`-held `UnitTable =
//! HashMap<UnitId, Unit>`: a flat map plus ordering edges, rather than a
//! separately materialised graph structure. Cycle detection over the
//! resolved `prerequisites` graph (DFS with a recursion-stack marker, per
//! the Design Notes) runs once at config load (`config::check_acyclic`),
//! before any `Family` is built — a bad config is rejected as a load
//! error rather than discovered here.

use crate::controller::ControllerHandle;
use crate::service::{Service, ServiceState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub struct Family {
    services: HashMap<String, Arc<Service>>,
    /// Stable load-order iteration (HashMap has none) for `status`/
    /// `dependencies` output.
    order: Vec<String>,
    controller: Weak<crate::controller::Controller>,
    idle_hit: AtomicBool,
    idle_delay: Duration,
}

impl Family {
    #[must_use]
    pub fn new(
        services: Vec<Arc<Service>>,
        controller: Weak<crate::controller::Controller>,
        idle_delay: Duration,
    ) -> Self {
        let order = services.iter().map(|s| s.name().to_owned()).collect();
        let map = services
            .into_iter()
            .map(|s| (s.name().to_owned(), s))
            .collect();
        Self {
            services: map,
            order,
            controller,
            idle_hit: AtomicBool::new(false),
            idle_delay,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).cloned()
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.order.iter().filter_map(|name| self.services.get(name))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// First caller gets `false` (meaning: you hit the latch, pause
    /// `idle_delay`); everyone after gets `true`.
    #[must_use]
    pub fn hit_idle_latch(&self) -> bool {
        self.idle_hit.swap(true, Ordering::SeqCst)
    }

    #[must_use]
    pub fn idle_delay(&self) -> Duration {
        self.idle_delay
    }

    #[must_use]
    pub fn controller_alive(&self) -> bool {
        self.controller
            .upgrade()
            .is_some_and(|c| c.system_alive())
    }

    #[must_use]
    pub fn controller_handle(&self) -> ControllerHandle {
        ControllerHandle::new(self.controller.clone())
    }

    pub fn start_all(self: &Arc<Self>) -> Vec<(String, Result<(), crate::error::ServiceError>)> {
        self.iter()
            .map(|svc| (svc.name().to_owned(), svc.start(self)))
            .collect()
    }

    pub fn final_stop_all(&self) {
        for svc in self.iter() {
            svc.final_stop();
        }
    }

    /// Services with a live child or a pending cron/inetd schedule.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        self.iter().any(|s| {
            matches!(
                s.status(),
                ServiceState::Running | ServiceState::Scheduled | ServiceState::Starting
            )
        })
    }

    #[must_use]
    pub fn any_pid_registered(&self) -> bool {
        self.iter().any(|s| s.pid().is_some())
    }

    /// ASCII histogram for `telchap dependencies`: one line per service,
    /// indented under each prerequisite it depends on.
    #[must_use]
    pub fn dependency_tree(&self) -> String {
        let mut out = String::new();
        for name in &self.order {
            let Some(svc) = self.services.get(name) else {
                continue;
            };
            out.push_str(name);
            out.push('\n');
            let mut deps: Vec<&String> = svc.config.prerequisites.iter().collect();
            deps.sort();
            for dep in deps {
                out.push_str("  └─ ");
                out.push_str(dep);
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_latch_only_fires_for_first_caller() {
        let family = Family::new(Vec::new(), Weak::new(), Duration::from_millis(0));
        assert!(!family.hit_idle_latch());
        assert!(family.hit_idle_latch());
        assert!(family.hit_idle_latch());
    }
}

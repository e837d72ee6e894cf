//! Port Allocator (§4.3 C3).
//!
//! Deterministic, collision-free port assignment per (site, role). Allocation
//! and release happen under a single mutex (§5); OS liveness probing is
//! optional and not performed here — the in-memory table is the source of
//! truth for what this process has handed out.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::PortsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortRole {
    Production,
    Preview,
    Session,
}

impl PortRole {
    fn base(self, config: &PortsConfig) -> u16 {
        match self {
            PortRole::Production => config.production_base,
            PortRole::Preview => config.preview_base,
            PortRole::Session => config.session_base,
        }
    }
}

struct Inner {
    config: PortsConfig,
    /// name -> assigned port, so the same (site, role) name always gets the
    /// same port back within a lifetime (C3 contract #2).
    assigned: HashMap<String, u16>,
    /// Ports currently handed out, regardless of owning name.
    taken: std::collections::HashSet<u16>,
}

/// Race-free port allocator; cloning shares the same underlying table.
#[derive(Clone)]
pub struct PortAllocator {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl PortAllocator {
    pub fn new(config: PortsConfig) -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(Inner {
                config,
                assigned: HashMap::new(),
                taken: std::collections::HashSet::new(),
            })),
        }
    }

    /// Allocate a port for `name` (e.g. `"blog-production"` or a session id)
    /// under `role`. Stable for the lifetime of `name`'s allocation: calling
    /// this again with the same name before `release` returns the same port.
    pub fn allocate(&self, name: &str, role: PortRole) -> Option<u16> {
        let mut inner = self.inner.lock();

        if let Some(&port) = inner.assigned.get(name) {
            return Some(port);
        }

        let base = role.base(&inner.config);
        let range = inner.config.range_size;

        let mut found = None;
        for offset in 0..range {
            let candidate = base.checked_add(offset)?;
            if !inner.taken.contains(&candidate) {
                found = Some(candidate);
                break;
            }
        }

        let port = found?;
        inner.taken.insert(port);
        inner.assigned.insert(name.to_string(), port);
        Some(port)
    }

    /// Deterministic session-preview port: `session_base + session_id`,
    /// still registered through the same allocation table so it can never
    /// collide with a port handed out via `allocate`.
    pub fn allocate_session_port(&self, name: &str, session_ordinal: u16) -> Option<u16> {
        let mut inner = self.inner.lock();
        if let Some(&port) = inner.assigned.get(name) {
            return Some(port);
        }
        let base = inner.config.session_base;
        let port = base.checked_add(session_ordinal % inner.config.range_size)?;
        if inner.taken.contains(&port) {
            return None;
        }
        inner.taken.insert(port);
        inner.assigned.insert(name.to_string(), port);
        Some(port)
    }

    pub fn release(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(port) = inner.assigned.remove(name) {
            inner.taken.remove(&port);
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.inner.lock().taken.contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_stable_for_same_name() {
        let alloc = PortAllocator::new(PortsConfig::default());
        let a = alloc.allocate("blog-production", PortRole::Production).unwrap();
        let b = alloc.allocate("blog-production", PortRole::Production).unwrap();
        assert_eq!(a, b);
    }

    // B1: two consecutive allocations for different names return distinct ports.
    #[test]
    fn allocate_is_monotone_across_distinct_names() {
        let alloc = PortAllocator::new(PortsConfig::default());
        let a = alloc.allocate("site-a-production", PortRole::Production).unwrap();
        let b = alloc.allocate("site-b-production", PortRole::Production).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn ranges_are_disjoint_by_role() {
        let config = PortsConfig::default();
        let alloc = PortAllocator::new(config.clone());
        let prod = alloc.allocate("a-production", PortRole::Production).unwrap();
        let preview = alloc.allocate("a-preview", PortRole::Preview).unwrap();
        assert!(prod < config.preview_base);
        assert!(preview >= config.preview_base);
    }

    #[test]
    fn release_frees_the_port_for_reuse() {
        let alloc = PortAllocator::new(PortsConfig::default());
        let port = alloc.allocate("x-preview", PortRole::Preview).unwrap();
        alloc.release("x-preview");
        assert!(!alloc.is_allocated(port));
        let again = alloc.allocate("x-preview", PortRole::Preview).unwrap();
        assert_eq!(again, port);
    }
}

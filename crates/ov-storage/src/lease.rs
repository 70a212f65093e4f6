//! In-process directory leases.
//!
//! Cross-URI operations (recursive delete, directory move, scratch
//! promotion) take a lease on the affected prefix so only one mutator
//! touches a subtree at a time. Guards release on drop, including panic
//! and cancellation unwinds.

use ov_core::uri::VikingUri;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct LeaseState {
    held: HashSet<String>,
}

/// Registry of live directory leases.
#[derive(Debug, Clone, Default)]
pub struct LeaseRegistry {
    state: Arc<Mutex<LeaseState>>,
    notify: Arc<Notify>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn overlaps(held: &HashSet<String>, candidate: &VikingUri) -> bool {
        held.iter().any(|h| {
            let held_uri = VikingUri::parse(h).expect("held leases are valid URIs");
            candidate.is_under(&held_uri) || held_uri.is_under(candidate)
        })
    }

    /// Acquire a lease on `prefix`, waiting while any overlapping lease
    /// is held.
    pub async fn acquire(&self, prefix: &VikingUri) -> LeaseGuard {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !Self::overlaps(&state.held, prefix) {
                    state.held.insert(prefix.as_str().to_string());
                    return LeaseGuard {
                        registry: self.clone(),
                        prefix: prefix.as_str().to_string(),
                    };
                }
            }
            self.notify.notified().await;
        }
    }

    /// Acquire without waiting; `None` when an overlapping lease is
    /// held.
    pub fn try_acquire(&self, prefix: &VikingUri) -> Option<LeaseGuard> {
        let mut state = self.state.lock().unwrap();
        if Self::overlaps(&state.held, prefix) {
            return None;
        }
        state.held.insert(prefix.as_str().to_string());
        Some(LeaseGuard {
            registry: self.clone(),
            prefix: prefix.as_str().to_string(),
        })
    }

    /// Whether any lease overlapping `uri` is held.
    pub fn is_held(&self, uri: &VikingUri) -> bool {
        Self::overlaps(&self.state.lock().unwrap().held, uri)
    }

    fn release(&self, prefix: &str) {
        self.state.lock().unwrap().held.remove(prefix);
        self.notify.notify_waiters();
    }
}

/// A held directory lease; releases on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    registry: LeaseRegistry,
    prefix: String,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.registry.release(&self.prefix);
    }
}

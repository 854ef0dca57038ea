//! Per-intersection service registry
//!
//! Every intersection runs as an independent service instance with fully
//! isolated state (Q-table, phase runtime, snapshot). The registry is the
//! one place that knows about all of them, keyed by intersection id; there
//! is no module-level singleton service.

use std::collections::HashMap;

use log::warn;

use crate::service::ServiceHandle;

/// Running intersection services, keyed by intersection id
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceHandle>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running service; replacing an id is a bug worth flagging
    pub fn insert(&mut self, handle: ServiceHandle) {
        let id = handle.intersection_id().to_string();
        if self.services.insert(id.clone(), handle).is_some() {
            warn!("replaced an already-registered service for '{id}'");
        }
    }

    pub fn get(&self, intersection_id: &str) -> Option<&ServiceHandle> {
        self.services.get(intersection_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Remove one service and return its handle for shutdown
    pub fn remove(&mut self, intersection_id: &str) -> Option<ServiceHandle> {
        self.services.remove(intersection_id)
    }

    /// Shut down every registered service
    pub async fn shutdown_all(self) {
        for (_, handle) in self.services {
            handle.shutdown().await;
        }
    }
}

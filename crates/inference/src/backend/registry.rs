//! Backend registry
//!
//! Holds one constructed instance per [`BackendKind`]. The gateway looks
//! backends up here; nothing else dispatches on the kind.

use std::collections::HashMap;
use std::sync::Arc;

use super::{BackendInfo, InferenceBackend};
use crate::error::{InferenceError, Result};
use crate::types::BackendKind;

/// Registry of configured inference backends
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn InferenceBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own kind, replacing any previous one
    pub fn register(&mut self, backend: Arc<dyn InferenceBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn InferenceBackend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| InferenceError::precondition(format!("Backend {} is not configured", kind)))
    }

    pub fn is_registered(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    /// Registered kinds in display order
    pub fn kinds(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| self.backends.contains_key(kind))
            .collect()
    }

    /// Information about every registered backend, `active` marking `selected`
    pub fn list(&self, selected: BackendKind) -> Vec<BackendInfo> {
        self.kinds()
            .into_iter()
            .filter_map(|kind| self.backends.get(&kind))
            .map(|backend| {
                let mut info = backend.info();
                info.active = info.kind == selected;
                info
            })
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn InferenceBackend>> {
        self.backends.values()
    }
}

//! Shared handles for one invocation.

use crate::backend::{Capabilities, DatabaseBackend};
use crate::config::Config;
use crate::store::ArtifactStore;

/// Everything the orchestrators borrow: configuration, the backend, the
/// artifact store and the capabilities probed at startup.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub config: &'a Config,
    pub backend: &'a dyn DatabaseBackend,
    pub store: &'a ArtifactStore,
    pub capabilities: &'a Capabilities,
}

impl<'a> Context<'a> {
    pub fn new(
        config: &'a Config,
        backend: &'a dyn DatabaseBackend,
        store: &'a ArtifactStore,
        capabilities: &'a Capabilities,
    ) -> Self {
        Self {
            config,
            backend,
            store,
            capabilities,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.config.store.chunk_size
    }
}

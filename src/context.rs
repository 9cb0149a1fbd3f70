//! Explicit per-process context passed to every pool operation.

use std::sync::Arc;

use crate::config::PoolConfig;
use crate::error::ConfigError;
use crate::store::Store;

/// Everything an operation needs to talk to the pool: the store handle, the
/// settings, and the identity of this process.
#[derive(Clone)]
pub struct PoolContext {
    store: Arc<dyn Store>,
    config: PoolConfig,
    job_id: Option<String>,
}

impl PoolContext {
    /// The current job id is taken from `config.job_id`.
    pub fn new(store: Arc<dyn Store>, config: PoolConfig) -> Self {
        let job_id = config.job_id.clone();
        Self {
            store,
            config,
            job_id,
        }
    }

    /// Override the current job id.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn store_handle(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// The current job id, or `MissingJobId` when none was given.
    pub fn require_job_id(&self) -> Result<&str, ConfigError> {
        self.job_id().ok_or(ConfigError::MissingJobId)
    }

    pub fn max_update_retries(&self) -> u32 {
        self.config.max_update_retries
    }
}

impl std::fmt::Debug for PoolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolContext")
            .field("hostname", &self.config.hostname)
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

//! The persistence seam. The plugin only ever needs a key-value store with
//! string values; anything implementing [`Store`] can back the transfer log.

use async_trait::async_trait;
use thiserror::Error;

use crate::errors::PluginError;

#[derive(Error, Debug)]
#[error("store backend error: {0}")]
pub struct StoreError(pub String);

impl From<StoreError> for PluginError {
    fn from(err: StoreError) -> Self {
        PluginError::Store(err.0)
    }
}

/// Key-value persistence backend.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

//! Persistent stores for instances and downstream API keys.

mod instances;
mod keys;

pub use instances::{InstanceStore, InstanceUpdate, NewInstance};
pub use keys::{CreatedKey, KeyStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Db(#[from] crate::db::DbError),

    #[error("store error: {0}")]
    Other(anyhow::Error),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err)
    }
}

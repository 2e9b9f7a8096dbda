//! Backend abstraction for the object store.
//!
//! The gateway only talks to storage through [`BlobStore`]. The contract is
//! the one a remote blob service offers: idempotent container creation,
//! overwrite-on-same-key puts, full-content reads and deletes that report
//! whether anything was removed.

use crate::models::object::ObjectProperties;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{TryStreamExt, stream::BoxStream};
use std::{io, time::Duration};
use thiserror::Error;

/// Streamed object payload.
pub type ByteStream<'a> = BoxStream<'a, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("container `{name}` invalid: {reason}")]
    InvalidContainerName { name: String, reason: String },
    #[error("blob `{key}` not found in container `{container}`")]
    ObjectNotFound { container: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("storage {operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Outcome of a single readiness probe against the backend.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub name: &'static str,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn ok(name: &'static str) -> Self {
        Self { name, error: None }
    }

    pub fn failed(name: &'static str, error: impl Into<String>) -> Self {
        Self {
            name,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Drain a payload stream into one contiguous buffer.
pub async fn read_to_bytes(mut stream: ByteStream<'_>) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create the container unless it already exists.
    ///
    /// Returns `true` when this call created it.
    async fn create_container_if_not_exists(&self, container: &str) -> StorageResult<bool>;

    /// Write `body` under `key`, replacing any existing blob.
    async fn put_object(
        &self,
        container: &str,
        key: &str,
        content_type: Option<&str>,
        body: ByteStream<'_>,
    ) -> StorageResult<ObjectProperties>;

    /// Open a blob for reading.
    async fn get_object(
        &self,
        container: &str,
        key: &str,
    ) -> StorageResult<(ObjectProperties, ByteStream<'static>)>;

    /// Fetch blob properties without the payload.
    async fn get_properties(&self, container: &str, key: &str) -> StorageResult<ObjectProperties>;

    /// Remove a blob. Absence is not an error: returns `false` instead.
    async fn delete_object_if_exists(&self, container: &str, key: &str) -> StorageResult<bool>;

    /// Readiness checks for `/readyz`.
    async fn probe(&self) -> Vec<ProbeResult>;
}

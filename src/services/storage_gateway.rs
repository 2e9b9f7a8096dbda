//! StorageGateway — the single entry point the HTTP layer uses for storage.
//!
//! Wraps a [`BlobStore`] with the account credentials: uploads provision
//! their container on demand, every backend call runs under a deadline, and
//! read grants are signed locally from the credentials.

use crate::{
    models::object::ObjectProperties,
    services::{
        blob_store::{BlobStore, ByteStream, ProbeResult, StorageError, StorageResult, read_to_bytes},
        credentials::StorageCredentials,
        sas::{self, SasError, SasPermissions, SasQuery, SignedUrl},
    },
};
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::{Stream, StreamExt};
use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Tunables that are fixed for the lifetime of the gateway.
#[derive(Debug, Clone, Copy)]
pub struct GatewaySettings {
    /// Validity of grants issued without an explicit expiry.
    pub default_sas_ttl: TimeDelta,
    /// Deadline for each backend call.
    pub operation_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            default_sas_ttl: TimeDelta::days(2),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// A blob read fully into memory.
#[derive(Debug, Clone)]
pub struct DownloadedBlob {
    pub properties: ObjectProperties,
    pub content: Bytes,
}

#[derive(Clone)]
pub struct StorageGateway {
    store: Arc<dyn BlobStore>,
    credentials: Arc<StorageCredentials>,
    settings: GatewaySettings,
}

impl StorageGateway {
    pub fn new(
        store: Arc<dyn BlobStore>,
        credentials: StorageCredentials,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            store,
            credentials: Arc::new(credentials),
            settings,
        }
    }

    /// Store `body` under `key`, creating `container` first if needed.
    ///
    /// Returns the confirmed key. Failures are logged and returned; nothing
    /// is swallowed.
    pub async fn upload(
        &self,
        key: &str,
        container: &str,
        body: ByteStream<'_>,
        content_type: Option<&str>,
    ) -> StorageResult<String> {
        let result: StorageResult<String> = async {
            let created = self
                .within(
                    "create-container",
                    self.store.create_container_if_not_exists(container),
                )
                .await?;
            if created {
                info!(container, "created container");
            }

            let props = self
                .within_backend_time(
                    "upload",
                    |body| self.store.put_object(container, key, content_type, body),
                    body,
                )
                .await?;
            debug!(
                container,
                key = %props.key,
                size = props.size_bytes,
                etag = %props.etag,
                "blob uploaded"
            );
            Ok(props.key)
        }
        .await;

        result.inspect_err(|err| {
            error!(container, key, error = %err, details = ?err, "blob upload failed");
        })
    }

    /// Read a whole blob into memory.
    pub async fn download(&self, key: &str, container: &str) -> StorageResult<DownloadedBlob> {
        self.within("download", async {
            let (properties, stream) = self.store.get_object(container, key).await?;
            let content = read_to_bytes(stream).await?;
            Ok(DownloadedBlob {
                properties,
                content,
            })
        })
        .await
    }

    /// Open a blob for streaming. Only the open is bounded by the deadline.
    pub async fn open(
        &self,
        key: &str,
        container: &str,
    ) -> StorageResult<(ObjectProperties, ByteStream<'static>)> {
        self.within("open", self.store.get_object(container, key))
            .await
    }

    pub async fn properties(&self, key: &str, container: &str) -> StorageResult<ObjectProperties> {
        self.within("properties", self.store.get_properties(container, key))
            .await
    }

    /// Delete a blob; `false` when there was nothing to delete.
    pub async fn delete(&self, key: &str, container: &str) -> StorageResult<bool> {
        let deleted = self
            .within("delete", self.store.delete_object_if_exists(container, key))
            .await?;
        debug!(container, key, deleted, "blob delete");
        Ok(deleted)
    }

    /// Issue a read-only signed URL for one blob.
    ///
    /// Without `expires_on` the grant lasts for the configured default window.
    pub fn issue_signed_url(
        &self,
        key: &str,
        container: &str,
        expires_on: Option<DateTime<Utc>>,
    ) -> Result<SignedUrl, SasError> {
        self.issue_signed_url_at(key, container, expires_on, Utc::now())
    }

    pub(crate) fn issue_signed_url_at(
        &self,
        key: &str,
        container: &str,
        expires_on: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<SignedUrl, SasError> {
        let expires_on = expires_on.unwrap_or(now + self.settings.default_sas_ttl);
        sas::sign_blob_url(
            &self.credentials,
            container,
            key,
            SasPermissions::READ,
            now,
            expires_on,
        )
    }

    /// Check that a presented grant for `container`/`key` is valid now and
    /// carries `required`.
    pub fn authorize(
        &self,
        key: &str,
        container: &str,
        query: &SasQuery,
        required: SasPermissions,
    ) -> Result<SasPermissions, SasError> {
        let granted = sas::verify(&self.credentials, container, key, query, Utc::now())?;
        if !granted.allows(required) {
            return Err(SasError::PermissionDenied(required));
        }
        Ok(granted)
    }

    pub async fn readiness(&self) -> Vec<ProbeResult> {
        self.store.probe().await
    }

    /// Like [`Self::within`], but time the backend spends waiting on `body`
    /// is not charged against the deadline. A slow client therefore never
    /// turns into a storage timeout; a backend that stops pulling does.
    async fn within_backend_time<'b, T, F, Fut>(
        &self,
        operation: &'static str,
        call: F,
        body: ByteStream<'b>,
    ) -> StorageResult<T>
    where
        F: FnOnce(ByteStream<'b>) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let limit = self.settings.operation_timeout;
        let clock = Arc::new(Mutex::new(BackendClock::new(Instant::now())));
        let metered = MeteredBody {
            inner: body,
            clock: clock.clone(),
        };
        let fut = call(metered.boxed());
        tokio::pin!(fut);

        loop {
            let used = lock(&clock).used(Instant::now());
            let remaining = match limit.checked_sub(used) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return Err(StorageError::Timeout {
                        operation,
                        elapsed: limit,
                    });
                }
            };
            tokio::select! {
                result = &mut fut => return result,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    async fn within<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        let limit = self.settings.operation_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| StorageError::Timeout {
                operation,
                elapsed: limit,
            })?
    }
}

/// Backend time spent on one call, excluding waits on the inbound body.
#[derive(Debug)]
struct BackendClock {
    spent: Duration,
    /// Start of the current backend stretch; `None` while waiting on the body.
    running_since: Option<Instant>,
}

impl BackendClock {
    fn new(now: Instant) -> Self {
        Self {
            spent: Duration::ZERO,
            running_since: Some(now),
        }
    }

    fn used(&self, now: Instant) -> Duration {
        match self.running_since {
            Some(since) => self.spent + now.saturating_duration_since(since),
            None => self.spent,
        }
    }

    fn body_pending(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.spent += now.saturating_duration_since(since);
        }
    }

    fn body_ready(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }
}

fn lock(clock: &Mutex<BackendClock>) -> MutexGuard<'_, BackendClock> {
    clock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Body wrapper that pauses the [`BackendClock`] while the client is slow.
struct MeteredBody<'a> {
    inner: ByteStream<'a>,
    clock: Arc<Mutex<BackendClock>>,
}

impl Stream for MeteredBody<'_> {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        let now = Instant::now();
        match polled {
            Poll::Pending => lock(&self.clock).body_pending(now),
            Poll::Ready(_) => lock(&self.clock).body_ready(now),
        }
        polled
    }
}

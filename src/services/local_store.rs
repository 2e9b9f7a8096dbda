//! src/services/local_store.rs
//!
//! LocalBlobStore — a [`BlobStore`] backed by SQLite for blob properties and
//! local disk for payloads.
//!
//! Payloads live at `base_path/{container}/{shard}/{shard}/{digest}`, where
//! `digest` is the hex MD5 of `container/key`. The on-disk name therefore has
//! a fixed length no matter how long the key is; the key itself is only
//! recorded in SQLite.

use crate::{
    models::{
        container::Container,
        object::{DEFAULT_CONTENT_TYPE, ObjectProperties},
    },
    services::blob_store::{BlobStore, ByteStream, ProbeResult, StorageError, StorageResult},
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const MAX_OBJECT_KEY_LEN: usize = 1024;
const CONTAINER_NAME_MIN_LEN: usize = 3;
const CONTAINER_NAME_MAX_LEN: usize = 63;

/// Local object store.
///
/// Cloning is cheap; all clones share the same pool and payload directory.
#[derive(Clone)]
pub struct LocalBlobStore {
    /// Shared SQLite connection pool used for blob properties.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,
}

/// A payload fully written to a temp file but not yet visible.
struct StagedPayload {
    tmp_path: PathBuf,
    size_bytes: i64,
    etag: String,
}

impl LocalBlobStore {
    /// Create a store over an existing pool, rooted at `base_path`.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Open (creating if needed) the metadata database and payload directory.
    pub async fn connect(database_url: &str, base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        if !base_path.exists() {
            fs::create_dir_all(&base_path).await?;
            tracing::info!("Created storage directory at {}", base_path.display());
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
        debug!("Interpreted SQLite path => {:?}", options.get_filename());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self::new(Arc::new(pool), base_path))
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn run_migrations(&self) -> StorageResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }

    /// Key validation.
    ///
    /// Keys are stored verbatim in SQLite and handed back in signed URLs, so
    /// they must be non-empty, at most 1024 bytes, relative, free of `.` and
    /// `..` segments and free of control characters and backslashes.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate container name format.
    ///
    /// - 3–63 characters
    /// - lowercase letters, digits and hyphens only
    /// - must start and end with a letter or digit
    /// - no consecutive hyphens
    fn ensure_container_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidContainerName {
            name: name.to_string(),
            reason: reason.into(),
        };

        let len = name.len();
        if !(CONTAINER_NAME_MIN_LEN..=CONTAINER_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, and hyphens",
            ));
        }

        if name.starts_with('-') || name.ends_with('-') {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("--") {
            return Err(invalid("cannot contain consecutive hyphens"));
        }

        Ok(())
    }

    /// Physical folder of a container. Existence is not checked.
    fn container_root(&self, container: &str) -> PathBuf {
        self.base_path.join(container)
    }

    /// Payload path for `container/key`.
    ///
    /// MD5(container/key) in hex names the file; its first two bytes pick
    /// the two shard directories (00–ff each). Parent directories may not
    /// exist yet.
    fn object_path(&self, container: &str, key: &str) -> PathBuf {
        let digest = md5::compute(format!("{}/{}", container, key));
        let mut path = self.container_root(container);
        path.push(format!("{:02x}", digest[0]));
        path.push(format!("{:02x}", digest[1]));
        path.push(format!("{:x}", digest));
        path
    }

    /// Look a container up by name, `None` when it was never created.
    async fn find_container(&self, name: &str) -> StorageResult<Option<Container>> {
        self.ensure_container_name_safe(name)?;
        let container = sqlx::query_as::<_, Container>(
            "SELECT id, name, created_at FROM containers WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&*self.db)
        .await?;
        Ok(container)
    }

    /// Like [`Self::find_container`], but absence is `ContainerNotFound`.
    async fn fetch_container(&self, name: &str) -> StorageResult<Container> {
        self.find_container(name)
            .await?
            .ok_or_else(|| StorageError::ContainerNotFound(name.to_string()))
    }

    /// Fetch the properties row of one blob.
    ///
    /// Returns ObjectNotFound if the row is missing.
    async fn fetch_object(&self, container: &Container, key: &str) -> StorageResult<ObjectProperties> {
        sqlx::query_as::<_, ObjectProperties>(
            "SELECT id, container_id, key, content_type, size_bytes, etag, last_modified
             FROM blobs
             WHERE container_id = ? AND key = ?",
        )
        .bind(container.id)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                container: container.name.clone(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    /// Drain `body` into a fresh temp file inside `dir`.
    ///
    /// Size and MD5 etag are computed while streaming; the file is fsynced.
    /// On any error the temp file is removed before returning.
    async fn stage_payload(&self, dir: &Path, body: ByteStream<'_>) -> StorageResult<StagedPayload> {
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        match Self::write_payload(&tmp_path, body).await {
            Ok((size_bytes, etag)) => Ok(StagedPayload {
                tmp_path,
                size_bytes,
                etag,
            }),
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(StorageError::Io(err))
            }
        }
    }

    async fn write_payload(path: &Path, mut body: ByteStream<'_>) -> io::Result<(i64, String)> {
        let mut file = File::create(path).await?;
        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((size_bytes, format!("{:x}", digest.compute())))
    }

    /// Remove empty shard directories up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    /// `SELECT 1` against the metadata database.
    async fn probe_metadata(&self) -> ProbeResult {
        match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
        {
            Ok(1) => ProbeResult::ok("sqlite"),
            Ok(v) => ProbeResult::failed("sqlite", format!("unexpected result: {}", v)),
            Err(e) => ProbeResult::failed("sqlite", format!("error: {}", e)),
        }
    }

    /// Write, read back and delete a small file under `base_path`.
    async fn probe_disk(&self) -> ProbeResult {
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        if let Err(e) = fs::write(&tmp_path, b"readyz").await {
            return ProbeResult::failed("disk", format!("could not write tmp file: {}", e));
        }
        let result = match fs::read(&tmp_path).await {
            Ok(bytes) if bytes == b"readyz" => ProbeResult::ok("disk"),
            Ok(_) => ProbeResult::failed("disk", "file content mismatch"),
            Err(e) => ProbeResult::failed("disk", format!("could not read tmp file: {}", e)),
        };
        if let Err(e) = fs::remove_file(&tmp_path).await {
            debug!("could not remove readiness probe file: {}", e);
        }
        result
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn create_container_if_not_exists(&self, container: &str) -> StorageResult<bool> {
        self.ensure_container_name_safe(container)?;
        fs::create_dir_all(self.container_root(container)).await?;

        let result = sqlx::query(
            "INSERT INTO containers (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(container)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        let created = result.rows_affected() == 1;
        if created {
            debug!("created container {}", container);
        }
        Ok(created)
    }

    /// Stage the body in a temp file, then publish it.
    ///
    /// The properties row is upserted inside a transaction that commits only
    /// once the payload has been renamed into place, so a failed upsert or
    /// rename leaves any previous version (row and payload) untouched.
    async fn put_object(
        &self,
        container: &str,
        key: &str,
        content_type: Option<&str>,
        body: ByteStream<'_>,
    ) -> StorageResult<ObjectProperties> {
        self.ensure_key_safe(key)?;
        let container_rec = self.fetch_container(container).await?;

        let file_path = self.object_path(&container_rec.name, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let staged = self.stage_payload(&parent, body).await?;

        let content_type = content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);

        let published: StorageResult<ObjectProperties> = async {
            let mut tx = self.db.begin().await?;
            let props = sqlx::query_as::<_, ObjectProperties>(
                r#"
                INSERT INTO blobs (
                    id, container_id, key, content_type, size_bytes, etag, last_modified
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(container_id, key) DO UPDATE SET
                    content_type = excluded.content_type,
                    size_bytes = excluded.size_bytes,
                    etag = excluded.etag,
                    last_modified = excluded.last_modified
                RETURNING id, container_id, key, content_type, size_bytes, etag, last_modified
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(container_rec.id)
            .bind(key)
            .bind(content_type)
            .bind(staged.size_bytes)
            .bind(&staged.etag)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await?;

            fs::rename(&staged.tmp_path, &file_path).await?;
            tx.commit().await?;
            Ok(props)
        }
        .await;

        match published {
            Ok(props) => {
                debug!(
                    "stored {}/{} ({} bytes, etag {})",
                    container, key, props.size_bytes, props.etag
                );
                Ok(props)
            }
            Err(err) => {
                // Rolled back on drop; only the staged file needs cleaning.
                let _ = fs::remove_file(&staged.tmp_path).await;
                Err(err)
            }
        }
    }

    async fn get_object(
        &self,
        container: &str,
        key: &str,
    ) -> StorageResult<(ObjectProperties, ByteStream<'static>)> {
        self.ensure_key_safe(key)?;
        let container_rec = self.fetch_container(container).await?;
        let props = self.fetch_object(&container_rec, key).await?;

        let file_path = self.object_path(&container_rec.name, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    container: container.to_string(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((props, ReaderStream::new(file).boxed()))
    }

    async fn get_properties(&self, container: &str, key: &str) -> StorageResult<ObjectProperties> {
        self.ensure_key_safe(key)?;
        let container_rec = self.fetch_container(container).await?;
        self.fetch_object(&container_rec, key).await
    }

    async fn delete_object_if_exists(&self, container: &str, key: &str) -> StorageResult<bool> {
        self.ensure_key_safe(key)?;
        let Some(container_rec) = self.find_container(container).await? else {
            return Ok(false);
        };

        let result = sqlx::query("DELETE FROM blobs WHERE container_id = ? AND key = ?")
            .bind(container_rec.id)
            .bind(key)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let file_path = self.object_path(&container_rec.name, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let container_root = self.container_root(&container_rec.name);
            self.prune_empty_dirs(parent, &container_root).await;
        }

        Ok(true)
    }

    async fn probe(&self) -> Vec<ProbeResult> {
        vec![self.probe_metadata().await, self.probe_disk().await]
    }
}

//! Represents the stored properties of a blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Content type recorded when an upload does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Metadata for a single blob within a container.
///
/// The payload bytes live on disk; this struct only carries what the store
/// knows about them.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectProperties {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent container.
    pub container_id: Uuid,

    /// Object key within the container.
    pub key: String,

    /// Content type (MIME type) attached at upload time.
    pub content_type: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the payload.
    pub etag: String,

    /// Timestamp of the last write to this key.
    pub last_modified: DateTime<Utc>,
}

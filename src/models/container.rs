//! Represents a container — a named group of stored blobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage container.
///
/// Containers are created lazily on first upload and act as the namespace for
/// object keys.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Container {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Container name (3–63 chars, lowercase letters, digits and hyphens).
    pub name: String,

    /// When this container was first created.
    pub created_at: DateTime<Utc>,
}

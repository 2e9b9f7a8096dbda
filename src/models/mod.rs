//! Core data models for the blob upload gateway.
//!
//! Containers and object properties map to SQLite rows via `sqlx::FromRow`;
//! the upload response is the JSON body handed back to clients.

pub mod container;
pub mod object;
pub mod object_key;
pub mod upload;

//! Generation of unique object keys for uploaded files.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid filename `{0}`")]
pub struct InvalidFilename(pub String);

/// A key of the form `<uuid>-<filename>`.
///
/// The random prefix makes keys unique per upload while the suffix keeps the
/// original filename readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Mint a fresh key for an uploaded file.
    ///
    /// Only the final path component of `filename` is kept, so clients that
    /// send full paths (`C:\photos\a.png`, `dir/a.png`) still get `a.png`.
    pub fn for_upload(filename: &str) -> Result<Self, InvalidFilename> {
        let name = sanitize_filename(filename)?;
        Ok(Self(format!("{}-{}", Uuid::new_v4(), name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitize_filename(filename: &str) -> Result<&str, InvalidFilename> {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(InvalidFilename(filename.to_string()));
    }
    if name.chars().any(char::is_control) {
        return Err(InvalidFilename(filename.to_string()));
    }
    Ok(name)
}

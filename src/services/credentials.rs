//! Storage account credentials parsed from a connection string.
//!
//! Accepted form: `Key=Value` pairs separated by `;`, e.g.
//! `AccountName=devstore;AccountKey=<base64>;BlobEndpoint=http://127.0.0.1:3000`.

use base64::{Engine as _, engine::general_purpose};
use std::{collections::HashMap, fmt};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("connection string is empty")]
    Empty,
    #[error("connection string segment `{0}` is not of the form Key=Value")]
    MalformedSegment(String),
    #[error("connection string is missing `{0}`")]
    MissingField(&'static str),
    #[error("AccountKey is not valid base64: {0}")]
    InvalidAccountKey(#[from] base64::DecodeError),
    #[error("blob endpoint `{endpoint}` is not a valid URL: {source}")]
    InvalidEndpoint {
        endpoint: String,
        source: url::ParseError,
    },
}

/// Immutable account credentials shared by everything that signs or resolves
/// blob URLs.
#[derive(Clone)]
pub struct StorageCredentials {
    pub account_name: String,
    account_key: Vec<u8>,
    pub blob_endpoint: Url,
}

impl StorageCredentials {
    pub fn new(account_name: impl Into<String>, account_key: Vec<u8>, blob_endpoint: Url) -> Self {
        Self {
            account_name: account_name.into(),
            account_key,
            blob_endpoint,
        }
    }

    pub fn from_connection_string(raw: &str) -> Result<Self, CredentialsError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CredentialsError::Empty);
        }

        let mut fields = HashMap::new();
        for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            // Base64 keys may end in `=`, so only split on the first one.
            let (name, value) = segment
                .split_once('=')
                .ok_or_else(|| CredentialsError::MalformedSegment(segment.to_string()))?;
            fields.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        let account_name = fields
            .get("accountname")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or(CredentialsError::MissingField("AccountName"))?;
        let account_key = fields
            .get("accountkey")
            .filter(|v| !v.is_empty())
            .ok_or(CredentialsError::MissingField("AccountKey"))?;
        let account_key = general_purpose::STANDARD.decode(account_key)?;

        let endpoint = match fields.get("blobendpoint") {
            Some(endpoint) => endpoint.clone(),
            None => {
                let protocol = fields
                    .get("defaultendpointsprotocol")
                    .map(String::as_str)
                    .unwrap_or("https");
                let suffix = fields
                    .get("endpointsuffix")
                    .map(String::as_str)
                    .unwrap_or("core.windows.net");
                format!("{}://{}.blob.{}", protocol, account_name, suffix)
            }
        };
        let blob_endpoint = Url::parse(&endpoint).map_err(|source| {
            CredentialsError::InvalidEndpoint {
                endpoint: endpoint.clone(),
                source,
            }
        })?;
        if blob_endpoint.cannot_be_a_base() {
            return Err(CredentialsError::InvalidEndpoint {
                endpoint,
                source: url::ParseError::RelativeUrlWithCannotBeABaseBase,
            });
        }

        Ok(Self::new(account_name, account_key, blob_endpoint))
    }

    pub(crate) fn account_key(&self) -> &[u8] {
        &self.account_key
    }
}

// Keeps the key out of logs.
impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("account_name", &self.account_name)
            .field("account_key", &"<redacted>")
            .field("blob_endpoint", &self.blob_endpoint.as_str())
            .finish()
    }
}

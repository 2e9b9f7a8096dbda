//! Shared-access signatures for single blobs.
//!
//! A signed URL has the shape
//! `<endpoint>/<container>/<key>?sv=..&st=..&se=..&sr=b&sp=..&sig=..`.
//! The signature is `base64(HMAC-SHA256(account_key, string_to_sign))` where
//! `string_to_sign` joins, with `\n`: permissions, start, expiry, the
//! canonical resource `/blob/<account>/<container>/<key>`, version and
//! resource type. Signing is a pure computation; nothing is persisted.

use crate::services::credentials::StorageCredentials;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, SubsecRound, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

pub const SAS_VERSION: &str = "2021-08-06";
const RESOURCE_BLOB: &str = "b";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SasError {
    #[error("expiry {expires_on} must be after start {starts_on}")]
    ExpiryNotInFuture {
        starts_on: DateTime<Utc>,
        expires_on: DateTime<Utc>,
    },
    #[error("blob endpoint cannot carry a container path")]
    InvalidEndpoint,
    #[error("account key cannot be used for signing")]
    InvalidAccountKey,
    #[error("signed URL is missing `{0}`")]
    MissingParameter(&'static str),
    #[error("unsupported signed version `{0}`")]
    UnsupportedVersion(String),
    #[error("unsupported signed resource `{0}`")]
    UnsupportedResource(String),
    #[error("invalid permissions `{0}`")]
    InvalidPermissions(String),
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
    #[error("signature did not match")]
    SignatureMismatch,
    #[error("signed URL not valid before {0}")]
    NotYetValid(DateTime<Utc>),
    #[error("signed URL expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("signed URL does not grant {0} access")]
    PermissionDenied(SasPermissions),
}

/// Permission set of a grant. Rendered in canonical `rwd` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SasPermissions {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

impl SasPermissions {
    pub const READ: Self = Self {
        read: true,
        write: false,
        delete: false,
    };
    pub const WRITE: Self = Self {
        read: false,
        write: true,
        delete: false,
    };
    pub const DELETE: Self = Self {
        read: false,
        write: false,
        delete: true,
    };

    pub fn parse(raw: &str) -> Result<Self, SasError> {
        let mut perms = Self::default();
        for c in raw.chars() {
            let slot = match c {
                'r' => &mut perms.read,
                'w' => &mut perms.write,
                'd' => &mut perms.delete,
                _ => return Err(SasError::InvalidPermissions(raw.to_string())),
            };
            if *slot {
                return Err(SasError::InvalidPermissions(raw.to_string()));
            }
            *slot = true;
        }
        if perms == Self::default() {
            return Err(SasError::InvalidPermissions(raw.to_string()));
        }
        Ok(perms)
    }

    /// True when every permission in `required` is granted.
    pub fn allows(self, required: Self) -> bool {
        (self.read || !required.read)
            && (self.write || !required.write)
            && (self.delete || !required.delete)
    }
}

impl fmt::Display for SasPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            f.write_str("r")?;
        }
        if self.write {
            f.write_str("w")?;
        }
        if self.delete {
            f.write_str("d")?;
        }
        Ok(())
    }
}

/// Signature parameters as they arrive in a request's query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SasQuery {
    pub sv: Option<String>,
    pub st: Option<String>,
    pub se: Option<String>,
    pub sr: Option<String>,
    pub sp: Option<String>,
    pub sig: Option<String>,
}

/// An issued grant.
#[derive(Debug, Clone)]
pub struct SignedUrl {
    pub url: Url,
    pub permissions: SasPermissions,
    pub starts_on: DateTime<Utc>,
    pub expires_on: DateTime<Utc>,
}

/// Sign a URL for one blob.
///
/// Both timestamps are truncated to whole seconds, so identical inputs
/// within the same second yield identical URLs.
pub fn sign_blob_url(
    credentials: &StorageCredentials,
    container: &str,
    key: &str,
    permissions: SasPermissions,
    starts_on: DateTime<Utc>,
    expires_on: DateTime<Utc>,
) -> Result<SignedUrl, SasError> {
    let starts_on = starts_on.trunc_subsecs(0);
    let expires_on = expires_on.trunc_subsecs(0);
    if expires_on <= starts_on {
        return Err(SasError::ExpiryNotInFuture {
            starts_on,
            expires_on,
        });
    }

    let sp = permissions.to_string();
    let st = starts_on.format(TIMESTAMP_FORMAT).to_string();
    let se = expires_on.format(TIMESTAMP_FORMAT).to_string();
    let string_to_sign = string_to_sign(
        &sp,
        &st,
        &se,
        &canonical_resource(&credentials.account_name, container, key),
        SAS_VERSION,
        RESOURCE_BLOB,
    );
    let sig = compute_signature(credentials.account_key(), &string_to_sign)?;

    let mut url = blob_url(&credentials.blob_endpoint, container, key)?;
    url.query_pairs_mut()
        .append_pair("sv", SAS_VERSION)
        .append_pair("st", &st)
        .append_pair("se", &se)
        .append_pair("sr", RESOURCE_BLOB)
        .append_pair("sp", &sp)
        .append_pair("sig", &sig);

    Ok(SignedUrl {
        url,
        permissions,
        starts_on,
        expires_on,
    })
}

/// Check a presented signature for `container`/`key` at instant `now`.
///
/// Returns the permissions the grant carries.
pub fn verify(
    credentials: &StorageCredentials,
    container: &str,
    key: &str,
    query: &SasQuery,
    now: DateTime<Utc>,
) -> Result<SasPermissions, SasError> {
    let sv = required(&query.sv, "sv")?;
    let st = required(&query.st, "st")?;
    let se = required(&query.se, "se")?;
    let sr = required(&query.sr, "sr")?;
    let sp = required(&query.sp, "sp")?;
    let sig = required(&query.sig, "sig")?;

    if sv != SAS_VERSION {
        return Err(SasError::UnsupportedVersion(sv.to_string()));
    }
    if sr != RESOURCE_BLOB {
        return Err(SasError::UnsupportedResource(sr.to_string()));
    }
    let permissions = SasPermissions::parse(sp)?;
    let starts_on = parse_timestamp(st)?;
    let expires_on = parse_timestamp(se)?;

    let string_to_sign = string_to_sign(
        sp,
        st,
        se,
        &canonical_resource(&credentials.account_name, container, key),
        sv,
        sr,
    );
    let presented = general_purpose::STANDARD
        .decode(sig)
        .map_err(|_| SasError::SignatureMismatch)?;
    let mut mac = HmacSha256::new_from_slice(credentials.account_key())
        .map_err(|_| SasError::InvalidAccountKey)?;
    mac.update(string_to_sign.as_bytes());
    mac.verify_slice(&presented)
        .map_err(|_| SasError::SignatureMismatch)?;

    if now < starts_on {
        return Err(SasError::NotYetValid(starts_on));
    }
    if now >= expires_on {
        return Err(SasError::Expired(expires_on));
    }

    Ok(permissions)
}

/// Unsigned URL of a blob: the endpoint followed by container and key
/// segments. Key separators (`/`) stay path separators.
pub fn blob_url(endpoint: &Url, container: &str, key: &str) -> Result<Url, SasError> {
    let mut url = endpoint.clone();
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|_| SasError::InvalidEndpoint)?
        .pop_if_empty()
        .push(container)
        .extend(key.split('/'));
    Ok(url)
}

fn canonical_resource(account: &str, container: &str, key: &str) -> String {
    format!("/blob/{}/{}/{}", account, container, key)
}

fn string_to_sign(sp: &str, st: &str, se: &str, resource: &str, sv: &str, sr: &str) -> String {
    [sp, st, se, resource, sv, sr].join("\n")
}

fn compute_signature(key: &[u8], string_to_sign: &str) -> Result<String, SasError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SasError::InvalidAccountKey)?;
    mac.update(string_to_sign.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, SasError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(SasError::MissingParameter(name))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SasError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SasError::InvalidTimestamp(raw.to_string()))
}

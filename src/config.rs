use crate::services::credentials::StorageCredentials;
use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Configuration key holding the storage account connection string.
pub const STORAGE_CONNECTION_STRING_KEY: &str = "FilesStorageConnectionString";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub upload_route: String,
    /// Validity of the grant returned by the upload endpoint.
    pub upload_sas_ttl: TimeDelta,
    /// Validity of grants issued without an explicit expiry.
    pub default_sas_ttl: TimeDelta,
    pub storage_timeout: Duration,
    pub max_upload_bytes: usize,
    pub credentials: StorageCredentials,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Blob upload gateway with signed read URLs")]
pub struct Args {
    /// Host to bind to (overrides BLOB_UPLOADER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BLOB_UPLOADER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blob payloads are stored (overrides BLOB_UPLOADER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata database URL (overrides BLOB_UPLOADER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Route accepting uploads (overrides BLOB_UPLOADER_UPLOAD_ROUTE)
    #[arg(long)]
    pub upload_route: Option<String>,

    /// Lifetime in seconds of URLs returned by uploads (overrides BLOB_UPLOADER_UPLOAD_SAS_TTL_SECS)
    #[arg(long)]
    pub upload_sas_ttl_secs: Option<u64>,

    /// Default lifetime in seconds of signed URLs (overrides BLOB_UPLOADER_DEFAULT_SAS_TTL_SECS)
    #[arg(long)]
    pub default_sas_ttl_secs: Option<u64>,

    /// Deadline in seconds for each storage call (overrides BLOB_UPLOADER_STORAGE_TIMEOUT_SECS)
    #[arg(long)]
    pub storage_timeout_secs: Option<u64>,

    /// Maximum accepted request body in bytes (overrides BLOB_UPLOADER_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Storage connection string (overrides FilesStorageConnectionString)
    #[arg(long)]
    pub connection_string: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::resolve(Args::parse(), |key| env::var(key))
    }

    /// Merge parsed CLI args over values obtained from `lookup`.
    pub fn resolve<F>(args: Args, lookup: F) -> Result<(Self, bool)>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        // --- Environment fallback ---
        let env_host = lookup("BLOB_UPLOADER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_storage =
            lookup("BLOB_UPLOADER_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_db = lookup("BLOB_UPLOADER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/blobs.db".into());
        let env_route = lookup("BLOB_UPLOADER_UPLOAD_ROUTE").unwrap_or_else(|_| "/".into());

        let port = match args.port {
            Some(port) => port,
            None => env_parse(&lookup, "BLOB_UPLOADER_PORT", 3000)?,
        };
        let upload_sas_ttl_secs = match args.upload_sas_ttl_secs {
            Some(secs) => secs,
            None => env_parse(&lookup, "BLOB_UPLOADER_UPLOAD_SAS_TTL_SECS", 3 * 60 * 60)?,
        };
        let default_sas_ttl_secs = match args.default_sas_ttl_secs {
            Some(secs) => secs,
            None => env_parse(&lookup, "BLOB_UPLOADER_DEFAULT_SAS_TTL_SECS", 2 * 24 * 60 * 60)?,
        };
        let storage_timeout_secs = match args.storage_timeout_secs {
            Some(secs) => secs,
            None => env_parse(&lookup, "BLOB_UPLOADER_STORAGE_TIMEOUT_SECS", 30)?,
        };
        let max_upload_bytes = match args.max_upload_bytes {
            Some(bytes) => bytes,
            None => env_parse(&lookup, "BLOB_UPLOADER_MAX_UPLOAD_BYTES", 32 * 1024 * 1024)?,
        };

        let connection_string = match args.connection_string {
            Some(value) => value,
            None => match lookup(STORAGE_CONNECTION_STRING_KEY) {
                Ok(value) => value,
                Err(env::VarError::NotPresent) => {
                    bail!("{} is not set", STORAGE_CONNECTION_STRING_KEY)
                }
                Err(err) => {
                    return Err(err).context(format!("reading {}", STORAGE_CONNECTION_STRING_KEY));
                }
            },
        };
        let credentials = StorageCredentials::from_connection_string(&connection_string)
            .with_context(|| format!("parsing {}", STORAGE_CONNECTION_STRING_KEY))?;

        let upload_route = args.upload_route.unwrap_or(env_route);
        validate_upload_route(&upload_route)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            upload_route,
            upload_sas_ttl: ttl("upload SAS TTL", upload_sas_ttl_secs)?,
            default_sas_ttl: ttl("default SAS TTL", default_sas_ttl_secs)?,
            storage_timeout: Duration::from_secs(storage_timeout_secs.max(1)),
            max_upload_bytes,
            credentials,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Paths the router already owns.
const RESERVED_ROUTES: [&str; 2] = ["/healthz", "/readyz"];

/// The upload route is mounted verbatim, so it must be a plain literal path
/// that the router accepts and that no other route already claims.
fn validate_upload_route(route: &str) -> Result<()> {
    if !route.starts_with('/') {
        bail!("upload route `{}` must start with `/`", route);
    }
    if route.contains("//") {
        bail!("upload route `{}` must not contain empty segments", route);
    }
    if let Some(c) = route.chars().find(|c| matches!(c, '{' | '}' | '*' | ':' | '?' | '#')) {
        bail!("upload route `{}` must be a literal path, found `{}`", route, c);
    }
    if route.chars().any(|c| c.is_whitespace() || c.is_control()) {
        bail!("upload route `{}` must not contain whitespace", route);
    }
    if RESERVED_ROUTES.contains(&route.trim_end_matches('/')) {
        bail!("upload route `{}` collides with a built-in route", route);
    }
    Ok(())
}

fn env_parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {}", key)),
    }
}

fn ttl(name: &str, secs: u64) -> Result<TimeDelta> {
    let secs = i64::try_from(secs).with_context(|| format!("{} of {}s is too large", name, secs))?;
    match TimeDelta::try_seconds(secs) {
        Some(delta) if secs > 0 => Ok(delta),
        _ => bail!("{} must be a positive number of seconds, got {}", name, secs),
    }
}

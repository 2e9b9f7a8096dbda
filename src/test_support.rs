//! Shared fixtures for unit tests.

use crate::{
    routes::routes::routes,
    services::{
        blob_store::{BlobStore, ByteStream},
        credentials::StorageCredentials,
        local_store::LocalBlobStore,
        sas::SasQuery,
        storage_gateway::{GatewaySettings, StorageGateway},
    },
    state::AppState,
};
use axum::{
    Router,
    body::Body,
    http::{Request, Response, header},
};
use bytes::Bytes;
use chrono::TimeDelta;
use futures::StreamExt;
use std::{path::Path, sync::Arc};
use url::Url;

pub const CONNECTION_STRING: &str =
    "AccountName=devstore;AccountKey=c2VjcmV0LWtleQ==;BlobEndpoint=http://127.0.0.1:3000";

pub fn credentials() -> StorageCredentials {
    StorageCredentials::from_connection_string(CONNECTION_STRING).unwrap()
}

/// A migrated store rooted in `dir` (`dir/blobs` for payloads).
pub async fn local_store(dir: &Path) -> LocalBlobStore {
    let database_url = format!("sqlite://{}", dir.join("meta").join("blobs.db").display());
    let store = LocalBlobStore::connect(&database_url, dir.join("blobs"))
        .await
        .unwrap();
    store.run_migrations().await.unwrap();
    store
}

pub fn gateway_with_store(store: Arc<dyn BlobStore>) -> StorageGateway {
    StorageGateway::new(store, credentials(), GatewaySettings::default())
}

pub async fn gateway(dir: &Path) -> StorageGateway {
    gateway_with_store(Arc::new(local_store(dir).await))
}

pub fn body_of(data: &'static [u8]) -> ByteStream<'static> {
    futures::stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
}

/// Signature parameters carried by a signed URL.
pub fn query_of(url: &Url) -> SasQuery {
    let mut query = SasQuery::default();
    for (name, value) in url.query_pairs() {
        let value = Some(value.into_owned());
        match name.as_ref() {
            "sv" => query.sv = value,
            "st" => query.st = value,
            "se" => query.se = value,
            "sr" => query.sr = value,
            "sp" => query.sp = value,
            "sig" => query.sig = value,
            other => panic!("unexpected query parameter {other}"),
        }
    }
    query
}

/// The full router over `gateway`, uploads at `/` with a 1 MiB body limit.
pub fn app_with_gateway(gateway: StorageGateway) -> Router {
    routes("/", 1024 * 1024).with_state(AppState::new(gateway, TimeDelta::hours(3)))
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

const BOUNDARY: &str = "X-BLOB-UPLOADER-BOUNDARY";

/// A `multipart/form-data` POST carrying one part.
pub fn multipart_upload(
    uri: &str,
    field: &str,
    filename: Option<&str>,
    content_type: Option<&str>,
    data: &[u8],
) -> Request<Body> {
    let mut disposition = format!("form-data; name=\"{}\"", field);
    if let Some(filename) = filename {
        disposition.push_str(&format!("; filename=\"{}\"", filename));
    }

    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(format!("Content-Disposition: {}\r\n", disposition).as_bytes());
    if let Some(content_type) = content_type {
        body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
    }
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::post(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

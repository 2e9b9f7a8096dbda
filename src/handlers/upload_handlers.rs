//! `POST /` — accept a multipart file, store it, hand back a read URL.
//!
//! The `File` field is streamed straight into the store; only the first
//! chunk is held back to reject empty uploads before anything is written.

use crate::{
    errors::AppError,
    models::{object_key::ObjectKey, upload::UploadResponse},
    state::{AppState, IMAGE_CONTAINER},
};
use axum::{
    Json,
    extract::{
        Multipart, State,
        multipart::{Field, MultipartError},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, future, stream};
use std::io;
use tracing::{error, info, instrument, warn};

/// Name of the multipart field carrying the file.
const FILE_FIELD: &str = "File";

#[instrument(skip_all)]
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    match store_upload(&state, &mut multipart).await {
        Ok(response) => {
            info!(blob = %response.blob_name, "upload stored");
            Ok(Json(response))
        }
        Err(err) if err.status.is_client_error() => {
            warn!(status = %err.status, error = %err, "upload rejected");
            Err(err)
        }
        Err(err) => {
            error!(status = %err.status, error = %err, details = ?err, "upload failed");
            Err(err)
        }
    }
}

async fn store_upload(
    state: &AppState,
    multipart: &mut Multipart,
) -> Result<UploadResponse, AppError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let is_file = field
            .name()
            .is_some_and(|name| name.eq_ignore_ascii_case(FILE_FIELD));
        if !is_file {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::bad_request("`File` field must have a filename"))?;
        let content_type = field.content_type().map(str::to_string);
        let key = ObjectKey::for_upload(&filename)?;

        let first = first_chunk(&mut field)
            .await?
            .ok_or_else(|| AppError::bad_request("uploaded file is empty"))?;
        let body = stream::once(future::ready(Ok::<_, io::Error>(first)))
            .chain(field.map(|chunk| {
                chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err))
            }))
            .boxed();

        let blob_name = state
            .gateway
            .upload(key.as_str(), IMAGE_CONTAINER, body, content_type.as_deref())
            .await?;

        let signed = state.gateway.issue_signed_url(
            &blob_name,
            IMAGE_CONTAINER,
            Some(Utc::now() + state.upload_sas_ttl),
        )?;

        return Ok(UploadResponse {
            success: true,
            container: IMAGE_CONTAINER.to_string(),
            blob_name,
            sas_uri: signed.url.into(),
        });
    }

    Err(AppError::bad_request("missing `File` field"))
}

async fn first_chunk(field: &mut Field<'_>) -> Result<Option<Bytes>, AppError> {
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if !chunk.is_empty() {
            return Ok(Some(chunk));
        }
    }
    Ok(None)
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

#[cfg(test)]
mod tests {
    use crate::{
        models::object::ObjectProperties,
        services::blob_store::{BlobStore, ByteStream, ProbeResult, StorageError, StorageResult},
        test_support::{app_with_gateway, gateway, gateway_with_store, json_body, multipart_upload},
    };
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use chrono::{DateTime, Utc};
    use std::{io, sync::Arc};
    use tower::ServiceExt;
    use url::Url;
    use uuid::Uuid;

    #[tokio::test]
    async fn upload_returns_key_container_and_signed_url() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with_gateway(gateway(dir.path()).await);
        let before = Utc::now();

        let res = app
            .clone()
            .oneshot(multipart_upload(
                "/",
                "File",
                Some("photo.png"),
                Some("image/png"),
                b"\x89PNG fake image",
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;

        assert_eq!(body["success"], true);
        assert_eq!(body["container"], "images");
        let blob_name = body["blobName"].as_str().unwrap();
        let (uuid, suffix) = blob_name.split_at(36);
        assert!(Uuid::parse_str(uuid).is_ok(), "{blob_name}");
        assert_eq!(suffix, "-photo.png");

        let sas_uri = Url::parse(body["sasURI"].as_str().unwrap()).unwrap();
        assert_eq!(sas_uri.path(), format!("/images/{}", blob_name));
        let expiry = sas_uri
            .query_pairs()
            .find(|(k, _)| k == "se")
            .map(|(_, v)| DateTime::parse_from_rfc3339(&v).unwrap().with_timezone(&Utc))
            .unwrap();
        let window = expiry - before;
        assert!(
            window > chrono::TimeDelta::minutes(179)
                && window <= chrono::TimeDelta::hours(3) + chrono::TimeDelta::seconds(5),
            "expiry {expiry} not ~3h after {before}"
        );

        // The returned URL serves the stored bytes.
        let res = app
            .oneshot(
                Request::get(format!("{}?{}", sas_uri.path(), sas_uri.query().unwrap()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["content-type"], "image/png");
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"\x89PNG fake image");
    }

    #[tokio::test]
    async fn missing_file_field_is_a_client_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with_gateway(gateway(dir.path()).await);

        let res = app
            .oneshot(multipart_upload(
                "/",
                "Attachment",
                Some("photo.png"),
                Some("image/png"),
                b"data",
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = json_body(res).await;
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().unwrap().contains("File"));
    }

    #[tokio::test]
    async fn empty_file_is_rejected_before_storing() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with_gateway(gateway(dir.path()).await);

        let res = app
            .oneshot(multipart_upload("/", "File", Some("empty.txt"), None, b""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        // Nothing was provisioned.
        assert!(!dir.path().join("blobs").join("images").exists());
    }

    #[tokio::test]
    async fn file_without_filename_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with_gateway(gateway(dir.path()).await);

        let res = app
            .oneshot(multipart_upload("/", "File", None, None, b"data"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn long_filename_is_stored_and_served() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with_gateway(gateway(dir.path()).await);
        let filename = format!("{}.png", "a".repeat(230));

        let res = app
            .clone()
            .oneshot(multipart_upload(
                "/",
                "File",
                Some(&filename),
                Some("image/png"),
                b"long name",
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert!(body["blobName"].as_str().unwrap().ends_with(&filename));

        let sas_uri = Url::parse(body["sasURI"].as_str().unwrap()).unwrap();
        let res = app
            .oneshot(
                Request::get(format!("{}?{}", sas_uri.path(), sas_uri.query().unwrap()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn field_name_matches_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with_gateway(gateway(dir.path()).await);

        let res = app
            .oneshot(multipart_upload("/", "file", Some("notes.txt"), None, b"hi"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert!(body["blobName"].as_str().unwrap().ends_with("-notes.txt"));
    }

    /// Accepts containers but fails every write.
    struct BrokenStore;

    #[async_trait]
    impl BlobStore for BrokenStore {
        async fn create_container_if_not_exists(&self, _container: &str) -> StorageResult<bool> {
            Ok(false)
        }

        async fn put_object(
            &self,
            _container: &str,
            _key: &str,
            _content_type: Option<&str>,
            _body: ByteStream<'_>,
        ) -> StorageResult<ObjectProperties> {
            Err(StorageError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "backend unavailable",
            )))
        }

        async fn get_object(
            &self,
            container: &str,
            key: &str,
        ) -> StorageResult<(ObjectProperties, ByteStream<'static>)> {
            Err(StorageError::ObjectNotFound {
                container: container.into(),
                key: key.into(),
            })
        }

        async fn get_properties(
            &self,
            container: &str,
            key: &str,
        ) -> StorageResult<ObjectProperties> {
            Err(StorageError::ObjectNotFound {
                container: container.into(),
                key: key.into(),
            })
        }

        async fn delete_object_if_exists(&self, _container: &str, _key: &str) -> StorageResult<bool> {
            Ok(false)
        }

        async fn probe(&self) -> Vec<ProbeResult> {
            vec![ProbeResult::failed("backend", "unavailable")]
        }
    }

    #[tokio::test]
    async fn backend_failure_is_reported_not_masked_as_success() {
        let app = app_with_gateway(gateway_with_store(Arc::new(BrokenStore)));

        let res = app
            .oneshot(multipart_upload(
                "/",
                "File",
                Some("photo.png"),
                Some("image/png"),
                b"data",
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(res).await;
        assert!(body.get("success").is_none());
        assert!(body.get("sasURI").is_none());
        assert_eq!(body["error"], "storage failure");
    }
}

//! Signed access to individual blobs at `/{container}/{*key}`.
//!
//! Every request must carry a valid signature for exactly this blob.
//! GET/HEAD need `r`, PUT needs `w`, DELETE needs `d`. Grants minted by the
//! upload endpoint are read-only, so writes and deletes through them fail
//! with 403.

use crate::{
    errors::AppError,
    models::object::{DEFAULT_CONTENT_TYPE, ObjectProperties},
    services::sas::{SasPermissions, SasQuery},
    state::AppState,
};
use axum::{
    RequestExt,
    body::Body,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::io;
use tracing::{instrument, warn};

/// IMF-fixdate, the `Last-Modified` format HTTP expects.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// GET `/{container}/{*key}` — stream a blob.
#[instrument(skip(state, sas))]
pub async fn get_blob(
    State(state): State<AppState>,
    Path((container, key)): Path<(String, String)>,
    Query(sas): Query<SasQuery>,
) -> Result<Response, AppError> {
    authorize(&state, &container, &key, &sas, SasPermissions::READ)?;

    let (meta, stream) = state.gateway.open(&key, &container).await?;
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_blob_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// HEAD `/{container}/{*key}` — same headers as GET but no body.
#[instrument(skip(state, sas))]
pub async fn head_blob(
    State(state): State<AppState>,
    Path((container, key)): Path<(String, String)>,
    Query(sas): Query<SasQuery>,
) -> Result<Response, AppError> {
    authorize(&state, &container, &key, &sas, SasPermissions::READ)?;

    let meta = state.gateway.properties(&key, &container).await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_blob_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// PUT `/{container}/{*key}` — write a blob through a grant carrying `w`.
#[instrument(skip(state, sas, request))]
pub async fn put_blob(
    State(state): State<AppState>,
    Path((container, key)): Path<(String, String)>,
    Query(sas): Query<SasQuery>,
    request: Request,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &container, &key, &sas, SasPermissions::WRITE)?;

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    // Honours the router's `DefaultBodyLimit`.
    let stream = request
        .with_limited_body()
        .into_body()
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)))
        .boxed();

    state
        .gateway
        .upload(&key, &container, stream, content_type.as_deref())
        .await?;

    Ok(StatusCode::CREATED)
}

/// DELETE `/{container}/{*key}` — remove a blob through a grant carrying `d`.
#[instrument(skip(state, sas))]
pub async fn delete_blob(
    State(state): State<AppState>,
    Path((container, key)): Path<(String, String)>,
    Query(sas): Query<SasQuery>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &container, &key, &sas, SasPermissions::DELETE)?;

    if state.gateway.delete(&key, &container).await? {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AppError::not_found(format!(
            "blob `{}` not found in container `{}`",
            key, container
        )))
    }
}

fn authorize(
    state: &AppState,
    container: &str,
    key: &str,
    sas: &SasQuery,
    required: SasPermissions,
) -> Result<(), AppError> {
    state
        .gateway
        .authorize(key, container, sas, required)
        .map(|_| ())
        .map_err(|err| {
            warn!(container, key, %required, error = %err, "signed access denied");
            AppError::from(err)
        })
}

fn set_blob_headers(headers: &mut HeaderMap, meta: &ObjectProperties) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0) as u64),
    );

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }

    let last_modified = meta.last_modified.format(HTTP_DATE_FORMAT).to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        services::sas::{self, SasPermissions},
        test_support::{app_with_gateway, body_of, credentials, gateway, json_body},
    };
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use chrono::{NaiveDateTime, SubsecRound, TimeDelta, Utc};
    use tower::ServiceExt;
    use url::Url;

    fn request(method: Method, url: &Url, body: Body) -> Request<Body> {
        let uri = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        Request::builder().method(method).uri(uri).body(body).unwrap()
    }

    fn signed(key: &str, permissions: SasPermissions) -> Url {
        let now = Utc::now();
        sas::sign_blob_url(
            &credentials(),
            "images",
            key,
            permissions,
            now,
            now + TimeDelta::hours(1),
        )
        .unwrap()
        .url
    }

    #[tokio::test]
    async fn read_grant_serves_blob_and_headers() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path()).await;
        gw.upload("k.txt", "images", body_of(b"hello"), Some("text/plain"))
            .await
            .unwrap();
        let props = gw.properties("k.txt", "images").await.unwrap();
        let url = gw.issue_signed_url("k.txt", "images", None).unwrap().url;
        let app = app_with_gateway(gw);

        let res = app
            .clone()
            .oneshot(request(Method::HEAD, &url, Body::empty()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["content-length"], "5");
        assert_eq!(
            res.headers()["etag"],
            format!("\"{:x}\"", md5::compute(b"hello")).as_str()
        );
        let last_modified = res.headers()["last-modified"].to_str().unwrap();
        assert!(last_modified.ends_with(" GMT"), "{last_modified}");
        let parsed = NaiveDateTime::parse_from_str(last_modified, "%a, %d %b %Y %H:%M:%S GMT")
            .unwrap()
            .and_utc();
        assert_eq!(parsed, props.last_modified.trunc_subsecs(0));

        let res = app
            .oneshot(request(Method::GET, &url, Body::empty()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["content-type"], "text/plain");
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn read_grant_cannot_write_or_delete() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path()).await;
        gw.upload("k.txt", "images", body_of(b"hello"), None)
            .await
            .unwrap();
        let url = gw.issue_signed_url("k.txt", "images", None).unwrap().url;
        let app = app_with_gateway(gw.clone());

        let res = app
            .clone()
            .oneshot(request(Method::PUT, &url, Body::from("overwrite")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = app
            .oneshot(request(Method::DELETE, &url, Body::empty()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let blob = gw.download("k.txt", "images").await.unwrap();
        assert_eq!(blob.content.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn write_and_delete_grants_are_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path()).await;
        let app = app_with_gateway(gw.clone());

        let put = signed("new.csv", SasPermissions::WRITE);
        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::PUT)
                    .uri(format!("{}?{}", put.path(), put.query().unwrap()))
                    .header("content-type", "text/csv")
                    .body(Body::from("a,b\n1,2\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let blob = gw.download("new.csv", "images").await.unwrap();
        assert_eq!(blob.content.as_ref(), b"a,b\n1,2\n");
        assert_eq!(blob.properties.content_type, "text/csv");

        let del = signed("new.csv", SasPermissions::DELETE);
        let res = app
            .clone()
            .oneshot(request(Method::DELETE, &del, Body::empty()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let res = app
            .oneshot(request(Method::DELETE, &del, Body::empty()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsigned_or_foreign_requests_are_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path()).await;
        gw.upload("a.txt", "images", body_of(b"a"), None).await.unwrap();
        gw.upload("b.txt", "images", body_of(b"b"), None).await.unwrap();
        let for_a = gw.issue_signed_url("a.txt", "images", None).unwrap().url;
        let app = app_with_gateway(gw);

        let res = app
            .clone()
            .oneshot(
                Request::get("/images/a.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let body = json_body(res).await;
        assert!(body["error"].as_str().unwrap().contains("missing"));

        // A grant for `a.txt` does not open `b.txt`.
        let res = app
            .oneshot(
                Request::get(format!("/images/b.txt?{}", for_a.query().unwrap()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn signed_url_for_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_with_gateway(gateway(dir.path()).await);

        let url = signed("ghost.png", SasPermissions::READ);
        let res = app
            .oneshot(request(Method::GET, &url, Body::empty()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}

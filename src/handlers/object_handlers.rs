//! HTTP handlers for raw object operations.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `StorageService`.

use crate::{
    errors::AppError,
    models::object::StoredObject,
    services::object_store::{ByteStream, ObjectStore},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;

#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    pub prefix: Option<String>,
}

/// PUT `/objects/{*key}`: streaming upload.
pub async fn upload_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let stream: ByteStream = Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(io::Error::other)),
    );

    let object = state.storage.put(&key, content_type, stream).await?;

    let mut resp_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", object.etag)) {
        resp_headers.insert(header::ETAG, value);
    }
    Ok((StatusCode::OK, resp_headers, Json(object)))
}

/// GET `/objects/{*key}` as a streaming response.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    stream_object(&state.storage, &key).await
}

/// HEAD `/objects/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let meta = state.storage.head(&key).await?;
    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// DELETE `/objects/{*key}`.
pub async fn delete_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, AppError> {
    let removed = state.storage.delete(&[key.clone()]).await?;
    if removed == 0 {
        return Err(AppError::not_found(format!("object `{key}` not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/objects?prefix=`: JSON listing ordered by key.
pub async fn list_objects(
    State(state): State<AppState>,
    Query(q): Query<ListObjectsQuery>,
) -> Result<Json<Vec<StoredObject>>, AppError> {
    let objects = state
        .storage
        .list(q.prefix.as_deref().unwrap_or(""))
        .await?;
    Ok(Json(objects))
}

/// Stream the payload of `key` with its metadata as headers.
pub async fn stream_object(store: &dyn ObjectStore, key: &str) -> Result<Response, AppError> {
    let (meta, stream) = store.get(key).await?;
    let mut response = Response::new(Body::from_stream(stream));
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

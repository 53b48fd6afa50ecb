//! Route table.
//!
//! ## Structure
//! - **Health**: `GET /healthz`, `GET /readyz`
//! - **Objects**
//!   - `GET    /objects?prefix=`: JSON listing
//!   - `PUT    /objects/{*key}`: upload object
//!   - `GET    /objects/{*key}`: download object
//!   - `HEAD   /objects/{*key}`: retrieve metadata only
//!   - `DELETE /objects/{*key}`: delete object
//! - **Archives** under `/galleries/{gallery_id}/orders/{order_id}`
//!   - `PUT  /selection`: scope the originals archive
//!   - `POST /archives/{kind}`: request generation
//!   - `GET  /archives/{kind}`: poll status
//!   - `GET  /archives/{kind}/download`: stream the READY archive
//! - **Admin**: `GET /admin/dead-letters`
//!
//! The wildcard `*key` allows nested keys like `galleries/g1/originals/img.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{delete_object, get_object, head_object, list_objects, upload_object},
        zip_handlers::{
            archive_status, download_archive, list_dead_letters, put_selection, request_archive,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, put},
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/objects", get(list_objects))
        .route(
            "/objects/{*key}",
            put(upload_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object),
        )
        .route(
            "/galleries/{gallery_id}/orders/{order_id}/selection",
            put(put_selection),
        )
        .route(
            "/galleries/{gallery_id}/orders/{order_id}/archives/{kind}",
            get(archive_status).post(request_archive),
        )
        .route(
            "/galleries/{gallery_id}/orders/{order_id}/archives/{kind}/download",
            get(download_archive),
        )
        .route("/admin/dead-letters", get(list_dead_letters))
}

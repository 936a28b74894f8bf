//! Defines routes for the conversion gateways.
//!
//! ## Structure
//! - `POST /upload`: submit a video (multipart or raw body), returns the FID
//! - `GET  /download?fid=`: stream the converted audio
//! - `GET  /jobs/{fid}`: conversion state and coarse failure class
//! - `GET  /healthz`, `GET /readyz`: liveness and readiness

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        job_handlers::{download, job_status, upload},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. Handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Uploads are streamed into the store, so no body limit applies.
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/download", get(download))
        .route("/jobs/{fid}", get(job_status))
}

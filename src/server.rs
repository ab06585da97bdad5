//! Lookup-and-generate HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/generate?defect_type=N` | Multipart upload (`file` field) → defect image |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Request flow
//!
//! 1. `defect_type` is checked against the [`DefectCatalog`]; unknown codes
//!    get `400` before the body is read.
//! 2. The upload is fingerprinted.
//! 3. A fingerprint found in the [`FingerprintMap`] is answered with the mapped
//!    file. The synthesizer is never called on this path.
//! 4. A fingerprint with an existing `<fp>.png` in the result directory is
//!    answered from there.
//! 5. Otherwise the upload is staged in the temp directory, decoded, passed to
//!    the [`Synthesizer`] with the defect prompt, and the output is stored as
//!    `<fp>.png` and returned. Work for one fingerprint is serialized, so
//!    concurrent identical uploads trigger a single generation.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown defect type: 9" } }
//! ```
//!
//! Error codes: `bad_request` (400), `decode_error` (500), `synth_error` (500),
//! `internal` (500).

use anyhow::Result;
use axum::{
    body::Body,
    extract::{
        multipart::MultipartRejection, rejection::QueryRejection, DefaultBodyLimit, Multipart,
        Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::catalog::DefectCatalog;
use crate::config::Config;
use crate::fingerprint::fingerprint_bytes;
use crate::mapping::{load_mapping, FingerprintMap};
use crate::store::{decode_upload, ResultStore};
use crate::synth::{create_synthesizer, Synthesizer};

/// Largest accepted request body.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Shared state handed to every handler.
///
/// Everything here is built once at startup. The mapping is never mutated
/// afterwards, so handlers read it without locking.
#[derive(Clone)]
pub struct AppState {
    mapping: Arc<FingerprintMap>,
    catalog: Arc<DefectCatalog>,
    store: Arc<ResultStore>,
    synth: Arc<dyn Synthesizer>,
}

impl AppState {
    pub fn new(
        mapping: FingerprintMap,
        catalog: DefectCatalog,
        store: ResultStore,
        synth: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            mapping: Arc::new(mapping),
            catalog: Arc::new(catalog),
            store: Arc::new(store),
            synth,
        }
    }

    /// Load the mapping, prepare directories and build the configured synthesizer.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_synthesizer(config, create_synthesizer(&config.synth)?)
    }

    /// Like [`from_config`](Self::from_config) but with a caller-supplied synthesizer.
    pub fn with_synthesizer(config: &Config, synth: Arc<dyn Synthesizer>) -> Result<Self> {
        let mapping = load_mapping(&config.paths.map)?;
        let store = ResultStore::open(&config.paths.results, &config.paths.tmp)?;

        tracing::info!(
            entries = mapping.len(),
            map = %config.paths.map.display(),
            synthesizer = synth.name(),
            "loaded fingerprint map"
        );

        Ok(Self::new(mapping, config.defects.clone(), store, synth))
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/generate", post(handle_generate))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server with the synthesizer selected in `config`.
pub async fn run_server(config: &Config) -> Result<()> {
    run_server_with_synthesizer(config, create_synthesizer(&config.synth)?).await
}

/// Start the server with a caller-supplied synthesizer.
///
/// Startup fails if the fingerprint map cannot be loaded or the result and
/// temp directories cannot be created.
pub async fn run_server_with_synthesizer(
    config: &Config,
    synth: Arc<dyn Synthesizer>,
) -> Result<()> {
    let state = AppState::with_synthesizer(config, synth)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("defectgen listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Handler error that renders as the JSON error body.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, "{}", self.message);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn decode_error(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "decode_error",
        message: format!("{:#}", err),
    }
}

fn synth_error(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "synth_error",
        message: format!("{:#}", err),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{:#}", err),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /generate ============

#[derive(Deserialize)]
struct GenerateParams {
    defect_type: i64,
}

struct Upload {
    filename: Option<String>,
    data: Vec<u8>,
}

async fn handle_generate(
    State(state): State<AppState>,
    params: Result<Query<GenerateParams>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    let Query(params) = params.map_err(|e| bad_request(format!("invalid defect_type: {}", e)))?;
    let prompt = state
        .catalog
        .prompt(params.defect_type)
        .ok_or_else(|| bad_request(format!("unknown defect type: {}", params.defect_type)))?;

    let multipart = multipart.map_err(|e| bad_request(e.to_string()))?;
    let upload = read_upload(multipart).await?;
    let fp = fingerprint_bytes(&upload.data);

    if let Some(mapped) = state.mapping.get(&fp) {
        tracing::info!(fingerprint = %fp, path = %mapped, "mapping hit");
        return stream_file(Path::new(mapped)).await;
    }

    if let Some(existing) = state.store.existing_result(&fp).await.map_err(internal)? {
        tracing::info!(fingerprint = %fp, path = %existing.display(), "result hit");
        return stream_file(&existing).await;
    }

    let _guard = state.store.lock(&fp).await;

    // Another request may have generated this fingerprint while we waited.
    if let Some(existing) = state.store.existing_result(&fp).await.map_err(internal)? {
        tracing::info!(fingerprint = %fp, "result hit after waiting for generation");
        return stream_file(&existing).await;
    }

    tracing::info!(
        fingerprint = %fp,
        defect_type = params.defect_type,
        bytes = upload.data.len(),
        "cache miss, generating"
    );

    // The staged copy is shared by name with other uploads, so decode the
    // request's own bytes rather than re-reading the file.
    state
        .store
        .write_upload(upload.filename.as_deref(), &fp, &upload.data)
        .await
        .map_err(internal)?;
    let source = decode_upload(upload.data).await.map_err(decode_error)?;

    let start = Instant::now();
    let output = state
        .synth
        .synthesize(prompt, &source)
        .await
        .map_err(synth_error)?;
    tracing::info!(fingerprint = %fp, elapsed = ?start.elapsed(), "synthesized");

    let result_path = state
        .store
        .publish_result(&fp, output)
        .await
        .map_err(internal)?;

    stream_file(&result_path).await
}

/// Pull the `file` field out of the multipart body.
async fn read_upload(mut multipart: Multipart) -> Result<Upload, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("unreadable multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("unreadable upload: {}", e)))?;
        return Ok(Upload {
            filename,
            data: data.to_vec(),
        });
    }
    Err(bad_request("missing multipart field 'file'"))
}

/// Stream a file back with a content type guessed from its extension.
async fn stream_file(path: &Path) -> Result<Response, AppError> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        internal(anyhow::anyhow!("Failed to open {}: {}", path.display(), e))
    })?;
    let len = file
        .metadata()
        .await
        .map_err(|e| internal(e.into()))?
        .len();
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        body,
    )
        .into_response())
}

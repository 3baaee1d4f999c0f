//! HTTP serving surface: both PIR endpoints behind one axum router. The
//! only mutable shared state is the snapshot pointer; handlers clone the
//! `Arc` once per request, so a concurrent rebuild never tears an answer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;

use crate::corpus::{self, Metadata, PirInstance, Snapshot};
use crate::error::{Error, Result};
use crate::pir::{self, Params};

pub struct AppState {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl AppState {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub async fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().await.clone()
    }

    /// Publishes a rebuilt snapshot. In-flight answers keep the `Arc` they
    /// already cloned; the old corpus drops with its last reader.
    pub async fn publish(&self, snapshot: Snapshot) {
        *self.snapshot.write().await = Arc::new(snapshot);
    }
}

/// Reloads the corpus from disk and publishes it under the next epoch.
/// The filesystem walk and the hint mat-mul both run off the I/O loop.
pub async fn reload(state: &AppState, dir: &Path) -> Result<u64> {
    let epoch = state.current().await.epoch + 1;
    let dir: PathBuf = dir.to_path_buf();
    let snapshot = tokio::task::spawn_blocking(move || {
        corpus::load_snapshot(&dir, epoch, &mut rand::thread_rng())
    })
    .await
    .map_err(|e| Error::Transport(format!("reload task failed: {e}")))??;
    state.publish(snapshot).await;
    Ok(epoch)
}

// ---------------------------------------------------------------------------
// Wire messages, shared by the HTTP and TCP transports.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireParams {
    pub n: usize,
    pub m: usize,
    /// Plaintext modulus. The ciphertext modulus is fixed to `2^64`.
    pub p: u64,
    pub std_dev: f64,
    /// The public matrix crosses the wire as this seed, not as `m x n`
    /// words.
    pub seed: u64,
}

impl From<&Params> for WireParams {
    fn from(params: &Params) -> Self {
        WireParams {
            n: params.n,
            m: params.m,
            p: params.plain_mod(),
            std_dev: params.std_dev,
            seed: params.seed,
        }
    }
}

impl WireParams {
    /// Client-side reconstruction, regenerating `a` from the seed.
    pub fn into_params(self) -> Result<Params> {
        if !self.p.is_power_of_two() || self.p < 2 {
            return Err(Error::Protocol(format!(
                "plaintext modulus {} is not a power of two",
                self.p
            )));
        }
        if self.m == 0 || self.n == 0 {
            return Err(Error::Protocol("degenerate parameter shape".into()));
        }
        let ell = self.p.trailing_zeros();
        Ok(Params {
            n: self.n,
            m: self.m,
            ell,
            std_dev: self.std_dev,
            seed: self.seed,
            a: pir::expand_a(self.seed, self.m, self.n),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetupResponse {
    pub params: WireParams,
    pub hint: Vec<Vec<u64>>,
    pub epoch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<Vec<u64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub centroids: Option<Vec<Vec<f64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_articles: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: Vec<u64>,
    /// Epoch of the setup this query was built against. When present and
    /// stale the server refuses instead of answering under the wrong hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PirResponse {
    pub answer: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub embeddings: Vec<Vec<u64>>,
    pub centroids: Vec<Vec<f64>>,
    pub metadata: Metadata,
    pub epoch: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn matrix_rows<T: Clone>(matrix: &Array2<T>) -> Vec<Vec<T>> {
    matrix.outer_iter().map(|row| row.to_vec()).collect()
}

pub fn rows_to_matrix<T: Clone>(rows: &[Vec<T>]) -> Result<Array2<T>> {
    let ncols = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|row| row.len() != ncols) {
        return Err(Error::Protocol("ragged matrix rows".into()));
    }
    let flat: Vec<T> = rows.iter().flat_map(|row| row.iter().cloned()).collect();
    Array2::from_shape_vec((rows.len(), ncols), flat)
        .map_err(|e| Error::Protocol(format!("bad matrix shape: {e}")))
}

pub fn embedding_setup_message(snapshot: &Snapshot) -> SetupResponse {
    SetupResponse {
        params: WireParams::from(&snapshot.embeddings.params),
        hint: matrix_rows(&snapshot.embeddings.hint),
        epoch: snapshot.epoch,
        embeddings: Some(matrix_rows(&snapshot.raw_embeddings)),
        centroids: Some(matrix_rows(&snapshot.centroids)),
        metadata: Some(snapshot.metadata.clone()),
        num_articles: None,
    }
}

pub fn article_setup_message(snapshot: &Snapshot) -> SetupResponse {
    SetupResponse {
        params: WireParams::from(&snapshot.articles.params),
        hint: matrix_rows(&snapshot.articles.hint),
        epoch: snapshot.epoch,
        embeddings: None,
        centroids: None,
        metadata: None,
        num_articles: Some(snapshot.num_articles),
    }
}

pub fn update_message(snapshot: &Snapshot) -> UpdateResponse {
    UpdateResponse {
        embeddings: matrix_rows(&snapshot.raw_embeddings),
        centroids: matrix_rows(&snapshot.centroids),
        metadata: snapshot.metadata.clone(),
        epoch: snapshot.epoch,
    }
}

/// Runs one answer against whichever database `pick` selects, off the I/O
/// loop. Refuses stale-epoch queries instead of answering under a hint the
/// client no longer holds.
pub async fn run_answer(
    snapshot: Arc<Snapshot>,
    request: QueryRequest,
    pick: fn(&Snapshot) -> &PirInstance,
) -> Result<Vec<u64>> {
    if let Some(epoch) = request.epoch {
        if epoch != snapshot.epoch {
            return Err(Error::SnapshotChanged);
        }
    }
    let cipher = Array1::from_vec(request.query);
    tokio::task::spawn_blocking(move || {
        let instance = pick(&snapshot);
        pir::answer(instance.db_t.view(), cipher.view()).map(|a| a.to_vec())
    })
    .await
    .map_err(|e| Error::Transport(format!("answer task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Router.

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Protocol(_) | Error::Bounds { .. } => StatusCode::BAD_REQUEST,
            Error::SnapshotChanged => StatusCode::CONFLICT,
            Error::Config(_) | Error::NoiseOverflow => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        let body = Json(ErrorBody {
            error: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/embedding/setup", get(embedding_setup))
        .route("/article/setup", get(article_setup))
        .route("/embedding/query", post(embedding_query))
        .route("/article/query", post(article_query))
        .route("/embedding/update", post(embedding_update))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "veilsearch",
        "status": "serving",
    }))
}

async fn embedding_setup(State(state): State<Arc<AppState>>) -> Json<SetupResponse> {
    Json(embedding_setup_message(state.current().await.as_ref()))
}

async fn article_setup(State(state): State<Arc<AppState>>) -> Json<SetupResponse> {
    Json(article_setup_message(state.current().await.as_ref()))
}

async fn embedding_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> std::result::Result<Json<PirResponse>, ApiError> {
    let snapshot = state.current().await;
    let answer = run_answer(snapshot, request, |s| &s.embeddings).await?;
    Ok(Json(PirResponse { answer }))
}

async fn article_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> std::result::Result<Json<PirResponse>, ApiError> {
    let snapshot = state.current().await;
    let answer = run_answer(snapshot, request, |s| &s.articles).await?;
    Ok(Json(PirResponse { answer }))
}

async fn embedding_update(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateRequest>,
) -> std::result::Result<Json<UpdateResponse>, ApiError> {
    if request.kind != "update" {
        return Err(Error::Protocol(format!("unknown request type {:?}", request.kind)).into());
    }
    Ok(Json(update_message(state.current().await.as_ref())))
}

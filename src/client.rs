//! HTTP client session. Connecting pulls both setup bundles once; after
//! that each retrieval is a single query/answer round trip under a fresh
//! secret, and only the index fed to the articles endpoint stays private.

use std::sync::Arc;
use std::time::Duration;

use ndarray::{Array1, Array2, ArrayView1};
use ndarray_stats::DeviationExt;
use rand::Rng;
use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::corpus::Metadata;
use crate::encoding;
use crate::error::{Error, Result};
use crate::pir::{self, Params};
use crate::server::{
    rows_to_matrix, ErrorBody, PirResponse, QueryRequest, SetupResponse, UpdateRequest,
    UpdateResponse,
};

/// Cached public material for one endpoint.
struct EndpointSession {
    params: Params,
    hint: Array2<u64>,
    epoch: u64,
}

impl EndpointSession {
    fn from_setup(setup: SetupResponse) -> Result<(Self, SetupResponse)> {
        let params = setup.params.clone().into_params()?;
        let hint = rows_to_matrix(&setup.hint)?;
        if hint.nrows() != params.n || hint.ncols() != params.m {
            return Err(Error::Protocol(format!(
                "hint shape {}x{} does not match params {}x{}",
                hint.nrows(),
                hint.ncols(),
                params.n,
                params.m
            )));
        }
        let epoch = setup.epoch;
        Ok((
            Self {
                params,
                hint,
                epoch,
            },
            setup,
        ))
    }
}

pub struct PirClient {
    http: reqwest::Client,
    base_url: String,
    embeddings_session: EndpointSession,
    articles_session: EndpointSession,
    /// Public `N x d` embedding matrix for local nearest-neighbour.
    pub embeddings: Array2<u64>,
    pub centroids: Array2<f64>,
    pub metadata: Metadata,
    pub num_articles: usize,
}

impl PirClient {
    pub async fn connect(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::new();
        info!(base_url, "downloading setup bundles");

        let setup: SetupResponse = http
            .get(format!("{base_url}/embedding/setup"))
            .send()
            .await?
            .json()
            .await?;
        let (embeddings_session, setup) = EndpointSession::from_setup(setup)?;
        let embeddings = rows_to_matrix(
            &setup
                .embeddings
                .ok_or_else(|| Error::Protocol("setup missing embedding matrix".into()))?,
        )?;
        let centroids = rows_to_matrix(
            &setup
                .centroids
                .ok_or_else(|| Error::Protocol("setup missing centroids".into()))?,
        )?;
        let metadata = setup
            .metadata
            .ok_or_else(|| Error::Protocol("setup missing metadata".into()))?;

        let setup: SetupResponse = http
            .get(format!("{base_url}/article/setup"))
            .send()
            .await?
            .json()
            .await?;
        let (articles_session, setup) = EndpointSession::from_setup(setup)?;
        let num_articles = setup
            .num_articles
            .ok_or_else(|| Error::Protocol("setup missing article count".into()))?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            embeddings_session,
            articles_session,
            embeddings,
            centroids,
            metadata,
            num_articles,
        })
    }

    async fn round_trip<R: Rng + ?Sized>(
        &self,
        session: &EndpointSession,
        path: &str,
        index: usize,
        rng: &mut R,
    ) -> Result<Array1<u64>> {
        let (secret, cipher) = pir::query(index, &session.params, rng)?;
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(&QueryRequest {
                query: cipher.to_vec(),
                epoch: Some(session.epoch),
            })
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Err(Error::SnapshotChanged);
        }
        if !response.status().is_success() {
            let error = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.error)
                .unwrap_or_else(|e| e.to_string());
            return Err(Error::Protocol(error));
        }
        let response: PirResponse = response.json().await?;
        if response.answer.len() != session.params.m {
            return Err(Error::Protocol(format!(
                "answer length {} does not match database side {}",
                response.answer.len(),
                session.params.m
            )));
        }
        let answer = Array1::from_vec(response.answer);
        Ok(pir::recover_row(
            secret.view(),
            session.hint.view(),
            answer.view(),
            cipher.view(),
            &session.params,
        ))
    }

    /// Privately retrieves one row of the embedding database. Any index up
    /// to the padded side length is valid; trailing rows are zero.
    pub async fn retrieve_embedding<R: Rng + ?Sized>(
        &self,
        index: usize,
        rng: &mut R,
    ) -> Result<Array1<u64>> {
        self.round_trip(&self.embeddings_session, "/embedding/query", index, rng)
            .await
    }

    /// Privately retrieves and decodes one document.
    pub async fn retrieve_article<R: Rng + ?Sized>(
        &self,
        index: usize,
        rng: &mut R,
    ) -> Result<String> {
        if index >= self.num_articles {
            return Err(Error::Bounds {
                index,
                len: self.num_articles,
            });
        }
        let row = self
            .round_trip(&self.articles_session, "/article/query", index, rng)
            .await?;
        encoding::row_to_string(row.view())
    }

    /// Local nearest-neighbour over the public embedding matrix. This step
    /// needs no PIR: the matrix already came down with the setup bundle.
    pub fn find_closest_embedding(&self, query: ArrayView1<f64>) -> Result<usize> {
        nearest_l2(&self.embeddings.mapv(|v| v as f64), query)
    }

    /// Index of the centroid nearest the query, for cluster-restricted
    /// retrieval.
    pub fn closest_centroid(&self, query: ArrayView1<f64>) -> Result<usize> {
        nearest_l2(&self.centroids, query)
    }

    /// Document indices assigned to a centroid.
    pub fn cluster_members(&self, centroid_index: usize) -> Vec<usize> {
        self.metadata
            .groups
            .iter()
            .find(|group| group.centroid_index == centroid_index)
            .map(|group| {
                group
                    .articles
                    .iter()
                    .map(|article| article.embedding_index)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bulk re-pull of the public data. Not a PIR query; reveals nothing
    /// beyond the fact that a refresh happened.
    pub async fn refresh(&mut self) -> Result<()> {
        let update: UpdateResponse = self
            .http
            .post(format!("{}/embedding/update", self.base_url))
            .json(&UpdateRequest {
                kind: "update".into(),
            })
            .send()
            .await?
            .json()
            .await?;
        self.embeddings = rows_to_matrix(&update.embeddings)?;
        self.centroids = rows_to_matrix(&update.centroids)?;
        self.metadata = update.metadata;
        info!(epoch = update.epoch, "refreshed public corpus data");
        Ok(())
    }
}

fn nearest_l2(rows: &Array2<f64>, query: ArrayView1<f64>) -> Result<usize> {
    if rows.nrows() == 0 {
        return Err(Error::Config("no rows to compare against".into()));
    }
    let mut best = (0usize, f64::INFINITY);
    for (i, row) in rows.outer_iter().enumerate() {
        let distance = row
            .to_owned()
            .l2_dist(&query.to_owned())
            .map_err(|e| Error::Protocol(format!("embedding dimension mismatch: {e}")))?;
        if distance < best.1 {
            best = (i, distance);
        }
    }
    Ok(best.0)
}

/// Periodically re-pulls public data until aborted. Cancellation lands at
/// the sleep and leaves the last good data in place.
pub fn spawn_refresh_task(
    client: Arc<tokio::sync::RwLock<PirClient>>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            let mut client = client.write().await;
            if let Err(e) = client.refresh().await {
                warn!(error = %e, "refresh failed; keeping previous public data");
            }
        }
    })
}

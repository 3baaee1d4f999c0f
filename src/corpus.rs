//! Loads the on-disk corpus bundle and builds the immutable snapshot both
//! endpoints serve: two independent PIR instances (embeddings, articles)
//! plus the public nearest-neighbour material. A rebuild produces a whole
//! new snapshot; readers holding the old one finish against it.

use std::fs;
use std::path::Path;

use ndarray::{s, Array2, ArrayView2};
use ndarray_npy::ReadNpyExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clustering;
use crate::encoding;
use crate::error::{Error, Result};
use crate::pir::{self, Params};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleMeta {
    pub title: String,
    #[serde(default)]
    pub url: String,
    pub filepath: String,
    pub embedding_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub centroid_index: usize,
    pub articles: Vec<ArticleMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub articles: Vec<ArticleMeta>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

/// One PIR-served database with its public material. The transpose is taken
/// once here so every answer is a row-major mat-vec.
#[derive(Debug)]
pub struct PirInstance {
    pub params: Params,
    pub hint: Array2<u64>,
    pub db: Array2<u64>,
    pub db_t: Array2<u64>,
}

impl PirInstance {
    pub fn build<R: Rng + ?Sized>(db: Array2<u64>, rng: &mut R) -> Result<Self> {
        let params = pir::gen_params(
            db.nrows(),
            pir::DEFAULT_SECRET_DIM,
            pir::DEFAULT_PLAIN_BITS,
            rng,
        )?;
        let hint = pir::gen_hint(&params, db.view());
        let db_t = db.t().to_owned();
        Ok(Self {
            params,
            hint,
            db,
            db_t,
        })
    }
}

/// One version of the corpus. Everything needed to answer both endpoints,
/// frozen at load time.
#[derive(Debug)]
pub struct Snapshot {
    pub epoch: u64,
    pub embeddings: PirInstance,
    pub articles: PirInstance,
    /// The unpadded `N x d` integer embedding matrix, shipped in the setup
    /// bundle for client-side nearest-neighbour.
    pub raw_embeddings: Array2<u64>,
    pub centroids: Array2<f64>,
    pub metadata: Metadata,
    pub num_articles: usize,
}

fn config_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Config(format!("{context}: {e}"))
}

fn read_embeddings(dir: &Path) -> Result<Array2<u64>> {
    let path = dir.join("embeddings/embeddings.npy");
    let file = fs::File::open(&path).map_err(|e| config_err(&path.display().to_string(), e))?;
    Array2::read_npy(file).map_err(|e| config_err("embeddings.npy", e))
}

fn read_metadata(dir: &Path) -> Result<Metadata> {
    let path = dir.join("embeddings/metadata.json");
    let raw = fs::read_to_string(&path).map_err(|e| config_err(&path.display().to_string(), e))?;
    serde_json::from_str(&raw).map_err(|e| config_err("metadata.json", e))
}

fn read_or_compute_centroids<R: Rng + ?Sized>(
    dir: &Path,
    embeddings: ArrayView2<u64>,
    rng: &mut R,
) -> Result<Array2<f64>> {
    let path = dir.join("embeddings/centroids.npy");
    if path.exists() {
        let file = fs::File::open(&path).map_err(|e| config_err(&path.display().to_string(), e))?;
        return Array2::read_npy(file).map_err(|e| config_err("centroids.npy", e));
    }
    info!(
        documents = embeddings.nrows(),
        "centroids.npy missing, clustering embeddings"
    );
    let data = embeddings.mapv(|v| v as f64);
    let k = clustering::cluster_count(embeddings.nrows());
    Ok(clustering::kmeans(data.view(), k, rng))
}

/// Pads the `N x d` embedding matrix into the square database the PIR
/// layer works over. Trailing rows and columns are zero.
fn pad_square(raw: ArrayView2<u64>) -> Array2<u64> {
    let side = raw.nrows().max(raw.ncols()).max(1);
    let mut db = Array2::zeros((side, side));
    db.slice_mut(s![..raw.nrows(), ..raw.ncols()]).assign(&raw);
    db
}

/// Builds a full snapshot from a corpus directory. Any missing, unreadable,
/// or misaligned input is fatal: embedding row `i`, document row `i`, and
/// `metadata.articles[i]` must describe the same document.
pub fn load_snapshot<R: Rng + ?Sized>(dir: &Path, epoch: u64, rng: &mut R) -> Result<Snapshot> {
    let raw_embeddings = read_embeddings(dir)?;
    let metadata = read_metadata(dir)?;

    if metadata.articles.len() != raw_embeddings.nrows() {
        return Err(Error::Config(format!(
            "metadata lists {} articles but embeddings.npy has {} rows",
            metadata.articles.len(),
            raw_embeddings.nrows()
        )));
    }
    for (i, article) in metadata.articles.iter().enumerate() {
        if article.embedding_index != i {
            return Err(Error::Config(format!(
                "article {:?} carries embedding_index {} at position {i}",
                article.title, article.embedding_index
            )));
        }
    }
    let plain_mod = 1u64 << pir::DEFAULT_PLAIN_BITS;
    if let Some(bad) = raw_embeddings.iter().find(|&&v| v >= plain_mod) {
        return Err(Error::Config(format!(
            "embedding value {bad} outside the plaintext range [0, {plain_mod})"
        )));
    }

    let centroids = read_or_compute_centroids(dir, raw_embeddings.view(), rng)?;

    let mut texts = Vec::with_capacity(metadata.articles.len());
    for article in &metadata.articles {
        let path = dir.join(&article.filepath);
        let text =
            fs::read_to_string(&path).map_err(|e| config_err(&path.display().to_string(), e))?;
        texts.push(text);
    }

    let embeddings = PirInstance::build(pad_square(raw_embeddings.view()), rng)?;
    let articles = PirInstance::build(encoding::strings_to_matrix(&texts)?, rng)?;

    info!(
        epoch,
        num_articles = texts.len(),
        embedding_side = embeddings.params.m,
        article_side = articles.params.m,
        "corpus snapshot ready"
    );

    Ok(Snapshot {
        epoch,
        embeddings,
        articles,
        raw_embeddings,
        centroids,
        metadata,
        num_articles: texts.len(),
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs;
    use std::path::Path;

    use ndarray::Array2;
    use ndarray_npy::WriteNpyExt;

    /// Writes a minimal corpus bundle: one article file per text, a u64
    /// embedding matrix with one distinctive row per document, and aligned
    /// metadata. No centroids.npy, so loading exercises the k-means path.
    pub fn write_corpus(dir: &Path, texts: &[&str]) {
        let articles_dir = dir.join("articles");
        let embeddings_dir = dir.join("embeddings");
        fs::create_dir_all(&articles_dir).unwrap();
        fs::create_dir_all(&embeddings_dir).unwrap();

        let mut articles = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let filename = format!("doc_{i}.txt");
            fs::write(articles_dir.join(&filename), text).unwrap();
            articles.push(serde_json::json!({
                "title": format!("doc_{i}"),
                "url": "",
                "filepath": format!("articles/{filename}"),
                "embedding_index": i,
            }));
        }
        let metadata = serde_json::json!({ "articles": articles, "groups": [] });
        fs::write(
            embeddings_dir.join("metadata.json"),
            serde_json::to_string_pretty(&metadata).unwrap(),
        )
        .unwrap();

        let embeddings =
            Array2::from_shape_fn((texts.len(), 4), |(i, j)| (100 * i + 10 * j) as u64);
        embeddings
            .write_npy(fs::File::create(embeddings_dir.join("embeddings.npy")).unwrap())
            .unwrap();
    }
}

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use ndarray::Array1;
use ndarray_npy::ReadNpyExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;
use veilsearch::client::{spawn_refresh_task, PirClient};

const USAGE: &str = "usage: client [<index> | --embedding <query.npy>]
  no arguments      interactive loop over document indices
  <index>           one private retrieval of that document
  --embedding FILE  nearest-neighbour lookup for the query vector in FILE";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let base_url =
        env::var("VEILSEARCH_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string());
    let args: Vec<String> = env::args().skip(1).collect();

    println!("Connecting to {base_url}...");
    let client = PirClient::connect(&base_url).await?;
    println!(
        "Connected: {} documents, {} clusters",
        client.num_articles,
        client.centroids.nrows()
    );

    let mut rng = rand::thread_rng();
    match args.as_slice() {
        [] => interactive(client, &mut rng).await,
        [index] if index.parse::<usize>().is_ok() => {
            let index = index.parse::<usize>()?;
            let article = client.retrieve_article(index, &mut rng).await?;
            println!("{article}");
            Ok(())
        }
        [flag, path] if flag.as_str() == "--embedding" => {
            let file = std::fs::File::open(path)?;
            let query: Array1<f64> = Array1::read_npy(file)?;
            let index = client.find_closest_embedding(query.view())?;
            println!("Closest document index: {index}");
            let article = client.retrieve_article(index, &mut rng).await?;
            println!("{article}");
            Ok(())
        }
        _ => Err(anyhow!(USAGE)),
    }
}

async fn interactive(client: PirClient, rng: &mut rand::rngs::ThreadRng) -> Result<()> {
    let num_articles = client.num_articles;
    let client = Arc::new(RwLock::new(client));
    let refresh = spawn_refresh_task(client.clone(), Duration::from_secs(60));

    println!("Enter a document index (0..{num_articles}), empty line to exit:");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let index: usize = match line.parse() {
            Ok(index) => index,
            Err(_) => {
                println!("not an index: {line:?}");
                continue;
            }
        };
        let guard = client.read().await;
        match guard.retrieve_article(index, rng).await {
            Ok(article) => {
                println!("{}", "-".repeat(60));
                println!("{article}");
                println!("{}", "-".repeat(60));
            }
            Err(e) => println!("error: {e}"),
        }
    }

    refresh.abort();
    Ok(())
}

//! build_index: offline catalog normalization and embedding

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use vibewatch::{
    config::Config,
    services::{
        index_build::{embed_catalog, normalize_catalog, IndexPaths},
        providers::create_embedding_model,
    },
};

#[derive(Parser)]
#[command(name = "build_index")]
#[command(about = "Normalize the movie catalog and build its embedding index")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize a raw catalog export into the catalog table
    Normalize {
        /// Raw CSV/JSON export (defaults to RAW_CATALOG_PATH)
        #[arg(short, long)]
        source: Option<PathBuf>,
    },

    /// Embed the catalog table and replace the index file
    Embed,

    /// Normalize, then embed
    All {
        /// Raw CSV/JSON export (defaults to RAW_CATALOG_PATH)
        #[arg(short, long)]
        source: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vibewatch=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let paths = IndexPaths::from_config(&config);
    let started = Instant::now();

    let (normalize, embed, source) = match cli.command {
        Commands::Normalize { source } => (true, false, source),
        Commands::Embed => (false, true, None),
        Commands::All { source } => (true, true, source),
    };

    if normalize {
        let source = source.unwrap_or_else(|| config.raw_catalog_path.clone());
        let report = normalize_catalog(&source, &paths)?;
        println!(
            "Normalized {} of {} rows into {} ({} invalid id, {} missing text, {} duplicate)",
            report.catalog.len(),
            report.total_rows,
            paths.catalog.display(),
            report.dropped_invalid_id,
            report.dropped_missing_text,
            report.dropped_duplicates
        );
    }

    if embed {
        let model = create_embedding_model(&config)?;
        let outcome = embed_catalog(&paths, model, config.builder_settings()).await?;
        println!(
            "Indexed {} records ({} embedded, {} reused, dimension {}) into {}",
            outcome.artifact.manifest.count,
            outcome.embedded,
            outcome.reused,
            outcome.artifact.manifest.dimension,
            paths.index.display()
        );
    }

    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Build finished");
    Ok(())
}

//! SkyCat Association (skycat-assoc) - Main entry point
//!
//! Associates JSON detection batches into the catalog database, queries
//! catalog records by cone and maintains reference catalog cross-matches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skycat_assoc::geometry::SkyPosition;
use skycat_assoc::models::{ImageBatch, ImageReport};
use skycat_assoc::services::{search_catalog, unmatched_sources, withdraw_catalog, ConeQuery};
use skycat_assoc::store::{CatalogStore, ReferenceCatalog};
use skycat_assoc::{
    AssociationRunner, SessionOrchestrator, SqliteCatalogStore, SqliteReferenceCatalog,
};
use skycat_common::config::{default_config_path, load_toml_config, resolve_database_path};

/// Command-line arguments for skycat-assoc
#[derive(Parser, Debug)]
#[command(name = "skycat-assoc")]
#[command(about = "Source association and cross-matching for SkyCat")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "SKYCAT_CONFIG")]
    config: Option<PathBuf>,

    /// Catalog database (overrides SKYCAT_DATABASE and the config file)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Associate image batches (JSON) into the catalog
    Associate {
        /// Batch files, each holding one batch or an array of batches
        #[arg(required = true)]
        batches: Vec<PathBuf>,
    },
    /// List catalog records within a cone
    Sources {
        /// Cone center right ascension (degrees)
        #[arg(long, allow_hyphen_values = true)]
        ra: f64,
        /// Cone center declination (degrees)
        #[arg(long, allow_hyphen_values = true)]
        dec: f64,
        /// Cone radius (degrees)
        #[arg(long)]
        radius: f64,
        /// Only records of this configuration class
        #[arg(long)]
        config_class: Option<String>,
    },
    /// Drop one reference catalog's matches so it is queried again
    WithdrawCatalog {
        /// Reference catalog name
        catalog: String,
    },
    /// List records cross-matched without any reference counterpart
    Unmatched,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Many(Vec<ImageBatch>),
    One(ImageBatch),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(default_config_path);
    let toml_config = match &config_path {
        Some(path) => load_toml_config(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Default::default(),
    };

    // RUST_LOG takes precedence over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| toml_config.logging.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let db_path = resolve_database_path(args.database.as_deref(), &toml_config);
    info!("Catalog database: {}", db_path.display());

    let store = SqliteCatalogStore::open(&db_path)
        .await
        .context("Failed to open catalog database")?;

    match args.command {
        Command::Associate { batches } => {
            let mut all = Vec::new();
            for path in &batches {
                all.extend(read_batches(path)?);
            }

            let association = toml_config.association.clone();
            let reference: Option<Arc<dyn ReferenceCatalog>> = if association.crossmatch_enabled {
                let ref_path = toml_config
                    .reference_database_path
                    .clone()
                    .unwrap_or_else(|| db_path.clone());
                info!("Reference database: {}", ref_path.display());
                let catalog = SqliteReferenceCatalog::open(&ref_path)
                    .await
                    .context("Failed to open reference database")?;
                Some(Arc::new(catalog) as Arc<dyn ReferenceCatalog>)
            } else {
                None
            };

            let orchestrator = SessionOrchestrator::new(Arc::new(store), reference, association)
                .context("Invalid association configuration")?;
            let runner = AssociationRunner::new(orchestrator);

            let cancel_token = CancellationToken::new();
            tokio::spawn(cancel_on_ctrl_c(cancel_token.clone()));

            let reports = runner.run(all, cancel_token).await;
            println!("{}", serde_json::to_string_pretty(&reports)?);

            let failed = reports
                .iter()
                .filter(|r| matches!(r, ImageReport::Failed { .. }))
                .count();
            if failed > 0 {
                bail!("{} of {} image(s) failed association", failed, reports.len());
            }
        }
        Command::Sources {
            ra,
            dec,
            radius,
            config_class,
        } => {
            let center = SkyPosition::new(ra, dec);
            if !center.is_valid() || !radius.is_finite() || radius < 0.0 {
                bail!("Invalid cone: ra={} dec={} radius={}", ra, dec, radius);
            }

            let mut tx = store.begin().await?;
            let found = search_catalog(tx.as_mut(), &ConeQuery::new(center, radius)).await;
            tx.abort().await?;

            let sources: Vec<_> = found?
                .into_iter()
                .filter(|s| config_class.as_deref().map_or(true, |key| s.config.key == key))
                .collect();
            println!("{}", serde_json::to_string_pretty(&sources)?);
        }
        Command::WithdrawCatalog { catalog } => {
            let report = withdraw_catalog(
                &store,
                &catalog,
                toml_config.association.max_conflict_retries,
            )
            .await
            .with_context(|| format!("Failed to withdraw catalog {}", catalog))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Unmatched => {
            let sources = unmatched_sources(&store).await?;
            println!("{}", serde_json::to_string_pretty(&sources)?);
        }
    }

    Ok(())
}

fn read_batches(path: &Path) -> Result<Vec<ImageBatch>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file {}", path.display()))?;
    let parsed: BatchFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse batch file {}", path.display()))?;
    Ok(match parsed {
        BatchFile::Many(batches) => batches,
        BatchFile::One(batch) => vec![batch],
    })
}

async fn cancel_on_ctrl_c(cancel_token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Interrupt received, cancelling uncommitted sessions");
        cancel_token.cancel();
    }
}

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ofc_catalog::{CatalogPipeline, PipelineConfig};
use ofc_source::{CategoryRegistry, GeoTable, HarvestFileSource};
use ofc_store::JsonFileStore;

#[derive(Debug, Parser)]
#[command(name = "ofc-cli")]
#[command(about = "OpenFair listing catalog command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect the harvest bundles, merge new listings into the catalog
    /// and rebuild the derived projections when anything was added.
    Ingest,
    /// Recompute every projection from the persisted catalog without
    /// ingesting; the manual rerun after a failed rebuild.
    Rebuild,
    /// Print the configured scraper categories.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = build_pipeline(&config)?.run_once().await?;
            println!(
                "ingest complete: run_id={} collected={} added={} rebuilt={} catalog_size={}",
                summary.run_id, summary.collected, summary.added, summary.rebuilt, summary.catalog_size
            );
        }
        Commands::Rebuild => {
            let summary = build_pipeline(&config)?.rebuild_catalog().await?;
            println!(
                "rebuild complete: run_id={} catalog_size={}",
                summary.run_id, summary.catalog_size
            );
        }
        Commands::Sources => {
            let registry = CategoryRegistry::from_yaml_path(&config.categories_path)?;
            for category in &registry.categories {
                println!("{}\tpages={}\t{}", category.name, category.page_count, category.url);
            }
        }
    }

    Ok(())
}

fn build_pipeline(config: &PipelineConfig) -> Result<CatalogPipeline> {
    let registry = CategoryRegistry::from_yaml_path(&config.categories_path)?;
    let geo = GeoTable::from_yaml_path(&config.geo_path)?;
    let source = HarvestFileSource::new(
        config.source_id.clone(),
        config.fixtures_dir.clone(),
        registry,
        geo,
    );
    let store = JsonFileStore::new(config.data_dir.clone());
    Ok(CatalogPipeline::new(Arc::new(store), Box::new(source)))
}

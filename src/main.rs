use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use lotmap::config::EngineConfig;
use lotmap::engine::MapEngine;
use lotmap::enrich::{enrich_collection, status_legend, SectorLookup};
use lotmap::geometry::GeometryKind;
use lotmap::normalize::{normalize, DocumentFormat};
use lotmap::reconcile::LoadState;
use lotmap::render::{HeadlessRenderer, MapRenderer, RenderLayer};
use lotmap::resolver::MapSelection;
use lotmap::server;
use lotmap::types::LngLat;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve map documents from the public directory
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Compose layers for a selection against the configured origin
    Compose {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Sector slug to show; repeat for several. Without any, the general map.
        #[arg(short, long = "sector", value_name = "SLUG")]
        sectors: Vec<String>,
        /// Give up waiting for loads after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Normalize and enrich a local KML/GeoJSON document and summarize it
    Inspect {
        file: PathBuf,
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Report the feature at `lng,lat`
        #[arg(long, value_name = "LNG,LAT", value_parser = parse_lng_lat, allow_hyphen_values = true)]
        at: Option<LngLat>,
    },
}

fn parse_lng_lat(s: &str) -> Result<LngLat, String> {
    let (lng, lat) = s.split_once(',').ok_or("expected LNG,LAT")?;
    let lng = lng.trim().parse::<f64>().map_err(|e| e.to_string())?;
    let lat = lat.trim().parse::<f64>().map_err(|e| e.to_string())?;
    Ok(LngLat::new(lng, lat))
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        EngineConfig::load_from_file(path)
    } else {
        warn!(?path, "config file not found; using defaults");
        Ok(EngineConfig::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { config } => {
            let app_config = load_config(config)?;
            server::start_server(app_config).await?;
        }
        Commands::Compose { config, sectors, timeout } => {
            let app_config = load_config(config)?;
            compose(app_config, sectors, Duration::from_secs(*timeout)).await?;
        }
        Commands::Inspect { file, config, at } => {
            let app_config = load_config(config)?;
            inspect(&app_config, file, *at)?;
        }
    }

    Ok(())
}

async fn compose(config: EngineConfig, sectors: &[String], timeout: Duration) -> anyhow::Result<()> {
    let mut selection = MapSelection::default();
    for slug in sectors {
        selection.toggle_sector(slug);
    }

    let mut engine = MapEngine::http(config, HeadlessRenderer::new()).context("Failed to build HTTP client")?;
    engine.select(&selection);
    if !engine.run_until_idle_for(timeout).await {
        warn!(?timeout, "gave up waiting for layers");
    }

    for layer in engine.layers() {
        match &layer.load_state {
            LoadState::Loaded => println!(
                "{:<32} loaded  {:>5} features  {}",
                layer.source_key,
                layer.collection.as_ref().map_or(0, |c| c.len()),
                layer.document_uri.as_deref().unwrap_or("-"),
            ),
            LoadState::Error(e) => println!("{:<32} error   {e}", layer.source_key),
            LoadState::Pending => println!("{:<32} pending", layer.source_key),
        }
    }
    println!("{}", serde_json::to_string_pretty(engine.renderer().commands())?);

    engine.dispose();
    Ok(())
}

fn inspect(config: &EngineConfig, file: &Path, at: Option<LngLat>) -> anyhow::Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
    let format = file
        .to_str()
        .and_then(DocumentFormat::from_path)
        .or_else(|| DocumentFormat::sniff(&bytes));
    let Some(format) = format else {
        bail!("cannot tell whether {:?} is KML or GeoJSON", file);
    };

    let source = file.file_stem().and_then(|s| s.to_str()).unwrap_or("document");
    let report = normalize(&bytes, format, source)?;
    let sectors = SectorLookup::from_config(&config.documents.sectors);
    let collection = enrich_collection(&report.collection, &sectors);
    info!(features = collection.len(), dropped = report.dropped, "document normalized");

    let mut kinds: BTreeMap<&str, usize> = BTreeMap::new();
    let mut statuses: BTreeMap<&str, usize> = BTreeMap::new();
    for feature in &collection.features {
        let kind = match feature.geometry.kind() {
            GeometryKind::Point => "point",
            GeometryKind::Polygon => "polygon",
            GeometryKind::MultiPolygon => "multipolygon",
        };
        *kinds.entry(kind).or_default() += 1;
        *statuses.entry(feature.properties.status.label()).or_default() += 1;
    }

    println!("{} ({}): {} features, {} dropped", file.display(), format.name(), collection.len(), report.dropped);
    if let Some(region) = collection.bounding_region() {
        println!(
            "bounds: [{:.6}, {:.6}] - [{:.6}, {:.6}]",
            region.south_west.lng, region.south_west.lat, region.north_east.lng, region.north_east.lat
        );
    }
    for (kind, count) in &kinds {
        println!("  {kind:<14} {count}");
    }
    for (status, color, label) in status_legend() {
        if let Some(count) = statuses.get(label) {
            println!("  {label:<14} {count:>5}  {color}  ({status:?})");
        }
    }

    if let Some(at) = at {
        let collection = Arc::new(collection);
        let mut renderer = HeadlessRenderer::new();
        let handle = renderer.add_layer(&RenderLayer {
            source_key: source.to_string(),
            document_uri: None,
            collection: collection.clone(),
        });
        match renderer.hit_test(at).and_then(|id| collection.get(&id).cloned()) {
            Some(f) => {
                println!("{} [{}] {} {}", f.id, f.properties.label, f.properties.status.label(), f.properties.color_hex);
                if let Some(description) = &f.properties.declared.description {
                    println!("{}", description.text);
                }
            }
            None => println!("no feature at {}, {}", at.lng, at.lat),
        }
        renderer.remove_layer(handle);
    }

    Ok(())
}

use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use foundation::bounds::GeoRect;
use foundation::time::SystemClock;
use serde_json::json;
use streaming::config::StreamingConfig;
use streaming::coordinator::CacheCoordinator;
use streaming::entity::{SpatialEntity, region_center};
use streaming::fetch::HttpFetcher;
use streaming::pipeline::RegionPipeline;
use streaming::request::SpatialKey;
use streaming::sink::MemorySink;
use streaming::store::{CacheStore, FileStore, MemoryStore};
use streaming::tiles::TileStreamingManager;
use streaming::viewport::CameraView;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MAX_TILE_PASSES: usize = 32;

#[derive(Parser, Debug)]
#[command(author, version, about = "Load heat-exposure building data through the streaming stack")]
struct Args {
    /// JSON config file; HEATMAP_* environment variables override it
    #[arg(long)]
    config: Option<String>,

    /// Persistent cache directory (in-memory cache when omitted)
    #[arg(long)]
    cache_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load one postal-code area with its heat overlay
    Region {
        /// Postal code, e.g. 00100
        postal_code: String,

        /// Heat overlay date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,

        /// Load twice and report whether the second pass hit the cache
        #[arg(long)]
        twice: bool,
    },

    /// Stream building tiles for a bounding box
    Tiles {
        /// Bounding box: minLon,minLat,maxLon,maxLat
        #[arg(long)]
        bbox: String,

        /// Camera altitude in meters
        #[arg(long, default_value_t = 1_500.0)]
        altitude: f64,
    },
}

fn parse_bbox(raw: &str) -> Result<GeoRect, String> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("bad bbox value {p:?}: {e}")))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [w, s, e, n] => Ok(GeoRect::new(*w, *s, *e, *n)),
        _ => Err(format!("bbox needs four values, got {}", parts.len())),
    }
}

fn heat_summary(entities: &[SpatialEntity]) -> serde_json::Value {
    let heat: Vec<f64> = entities
        .iter()
        .filter_map(|e| e.overlay.as_ref().map(|o| o.heat_exposure))
        .collect();
    if heat.is_empty() {
        return serde_json::Value::Null;
    }
    let min = heat.iter().copied().fold(f64::INFINITY, f64::min);
    let max = heat.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = heat.iter().sum::<f64>() / heat.len() as f64;
    json!({"count": heat.len(), "min": min, "max": max, "mean": mean})
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => StreamingConfig::from_json_file(path)?,
        None => StreamingConfig::default(),
    };
    config.apply_env();
    if let Some(dir) = args.cache_dir {
        config.cache_dir = Some(dir);
    }

    let store: Arc<dyn CacheStore> = match &config.cache_dir {
        Some(dir) => Arc::new(FileStore::open(dir).await?),
        None => Arc::new(MemoryStore::new()),
    };
    let fetcher = Arc::new(HttpFetcher::new(config.request_timeout())?);
    let coordinator = CacheCoordinator::new(fetcher, store, Arc::new(SystemClock), config.coordinator_settings());
    let sink = Arc::new(MemorySink::new());

    let summary = match args.command {
        Command::Region {
            postal_code,
            date,
            twice,
        } => {
            let pipeline = RegionPipeline::new(coordinator.clone(), sink.clone(), config.pipeline_settings());
            if let Some(date) = date {
                pipeline.set_selected_date(date);
            }
            let key = SpatialKey::postal_code(postal_code);
            info!(%key, date = %pipeline.selected_date(), "loading region");

            let started = Instant::now();
            let entities = pipeline.load(&key).await?;
            let first_ms = started.elapsed().as_millis();

            let second_ms = if twice {
                let started = Instant::now();
                pipeline.load(&key).await?;
                Some(started.elapsed().as_millis())
            } else {
                None
            };

            let with_overlay = entities.iter().filter(|e| e.overlay.is_some()).count();
            if with_overlay == 0 {
                warn!(%key, "no heat overlay values matched");
            }
            json!({
                "key": key.to_string(),
                "date": pipeline.selected_date(),
                "entities": entities.len(),
                "with_overlay": with_overlay,
                "center": region_center(&entities),
                "heat": heat_summary(&entities),
                "elapsed_ms": first_ms,
                "second_elapsed_ms": second_ms,
                "stats": coordinator.stats(),
            })
        }
        Command::Tiles { bbox, altitude } => {
            let rect = parse_bbox(&bbox)?;
            let view = CameraView::new(rect, altitude);
            let tiles = TileStreamingManager::new(
                coordinator.clone(),
                config.endpoints.clone(),
                sink.clone(),
                config.tile_settings(),
            );
            // Each update is budgeted; repeat until nothing new is requested.
            // Failed tiles are requested again, so the passes are capped.
            let mut requested = 0;
            for _ in 0..MAX_TILE_PASSES {
                let update = tiles.update_viewport(&view);
                tiles.idle().await;
                if update.requested.is_empty() {
                    break;
                }
                requested += update.requested.len();
            }
            let entities: usize = sink.names().iter().map(|n| sink.entity_count(n)).sum();
            json!({
                "bbox": [rect.west, rect.south, rect.east, rect.north],
                "altitude_m": altitude,
                "tiles_requested": requested,
                "tiles_resident": tiles.resident_count(),
                "entities": entities,
                "stats": coordinator.stats(),
            })
        }
    };

    coordinator.shutdown();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

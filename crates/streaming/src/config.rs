use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorSettings;
use crate::entity::{DEFAULT_ID_FIELD, HeatScale};
use crate::pipeline::PipelineSettings;
use crate::request::SpatialKey;
use crate::tiles::TileSettings;
use crate::viewport::ResolverSettings;

/// Endpoint URL templates.
///
/// Placeholders: `{postal_code}`, `{date}`, and for tile keys `{z}`, `{x}`,
/// `{y}`, `{west}`, `{south}`, `{east}`, `{north}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub buildings: String,
    pub heat: String,
    pub tiles: String,
    /// Postal-code area polygons for the region index.
    pub regions: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            buildings: "https://geo.fvh.fi/r4c/collections/hsy_buildings/items?f=json&limit=5000&postinumero={postal_code}".into(),
            heat: "https://geo.fvh.fi/r4c/collections/heatexposure_optimized/items?f=json&limit=10000&postinumero={postal_code}&date={date}".into(),
            tiles: "https://geo.fvh.fi/r4c/collections/hsy_buildings/items?f=json&limit=2000&bbox={west},{south},{east},{north}".into(),
            regions: "https://geo.fvh.fi/r4c/collections/hki_po_clipped/items?f=json&limit=1000".into(),
        }
    }
}

impl Endpoints {
    /// Primary geometry URL: by postal code, or by tile bounds.
    pub fn buildings_url(&self, key: &SpatialKey) -> String {
        match key {
            SpatialKey::PostalCode(code) => render(&self.buildings, &[("postal_code", code.clone())]),
            SpatialKey::Tile(tile) => {
                let b = tile.bounds();
                render(
                    &self.tiles,
                    &[
                        ("z", tile.z.to_string()),
                        ("x", tile.x.to_string()),
                        ("y", tile.y.to_string()),
                        ("west", format!("{:.6}", b.west)),
                        ("south", format!("{:.6}", b.south)),
                        ("east", format!("{:.6}", b.east)),
                        ("north", format!("{:.6}", b.north)),
                    ],
                )
            }
        }
    }

    pub fn heat_url(&self, postal_code: &str, date: &str) -> String {
        render(
            &self.heat,
            &[("postal_code", postal_code.to_string()), ("date", date.to_string())],
        )
    }
}

fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "config io error: {msg}"),
            ConfigError::Parse(msg) => write!(f, "config parse error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Tunables for the whole streaming stack. Every field has a default, so a
/// JSON file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub endpoints: Endpoints,
    /// Shared identifier between building and heat rows.
    pub id_field: String,
    pub selected_date: String,
    pub heat_scale: HeatScale,

    pub cache_ttl_secs: u64,
    pub max_retries: u32,
    pub max_concurrent_fetches: usize,
    pub memory_budget_mb: usize,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub cache_dir: Option<String>,

    pub settle_debounce_ms: u64,
    /// Above this camera altitude nothing is streamed.
    pub max_altitude_m: f64,

    pub tile_min_zoom: u8,
    pub tile_max_zoom: u8,
    pub max_tiles: usize,
    pub max_loads_per_update: u32,
    pub max_hidden_tiles: usize,

    pub progressive: bool,
    pub progressive_batch_size: usize,

    pub complete_reset_delay_ms: u64,
    pub flight_cancel_timeout_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            id_field: DEFAULT_ID_FIELD.into(),
            selected_date: "2024-06-26".into(),
            heat_scale: HeatScale {
                min_temp_k: 285.0,
                max_temp_k: 320.0,
            },
            cache_ttl_secs: 60 * 60,
            max_retries: 2,
            max_concurrent_fetches: 6,
            memory_budget_mb: 256,
            retry_base_delay_ms: 250,
            request_timeout_secs: 30,
            cache_dir: None,
            settle_debounce_ms: 1_500,
            max_altitude_m: 50_000.0,
            tile_min_zoom: 13,
            tile_max_zoom: 16,
            max_tiles: 64,
            max_loads_per_update: 8,
            max_hidden_tiles: 128,
            progressive: false,
            progressive_batch_size: 500,
            complete_reset_delay_ms: 1_000,
            flight_cancel_timeout_ms: 500,
        }
    }
}

impl StreamingConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Overrides from `HEATMAP_*` environment variables. Unparseable values
    /// keep the current setting.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = |key: &str| lookup(key);
        if let Some(v) = env("HEATMAP_BUILDINGS_URL") {
            self.endpoints.buildings = v;
        }
        if let Some(v) = env("HEATMAP_HEAT_URL") {
            self.endpoints.heat = v;
        }
        if let Some(v) = env("HEATMAP_TILES_URL") {
            self.endpoints.tiles = v;
        }
        if let Some(v) = env("HEATMAP_REGIONS_URL") {
            self.endpoints.regions = v;
        }
        if let Some(v) = env("HEATMAP_DATE") {
            self.selected_date = v;
        }
        if let Some(v) = env("HEATMAP_CACHE_DIR") {
            self.cache_dir = Some(v);
        }
        self.cache_ttl_secs = env_var_u64(&env, "HEATMAP_CACHE_TTL_SECS", self.cache_ttl_secs);
        self.max_retries = env_var_u64(&env, "HEATMAP_MAX_RETRIES", self.max_retries as u64) as u32;
        self.max_concurrent_fetches = env_var_usize(&env, "HEATMAP_MAX_CONCURRENT_FETCHES", self.max_concurrent_fetches);
        self.memory_budget_mb = env_var_usize(&env, "HEATMAP_MEMORY_BUDGET_MB", self.memory_budget_mb);
        self.request_timeout_secs = env_var_u64(&env, "HEATMAP_REQUEST_TIMEOUT_SECS", self.request_timeout_secs);
        self.settle_debounce_ms = env_var_u64(&env, "HEATMAP_SETTLE_DEBOUNCE_MS", self.settle_debounce_ms);
        self.max_altitude_m = env_var_f64(&env, "HEATMAP_MAX_ALTITUDE_M", self.max_altitude_m);
        self.heat_scale.min_temp_k = env_var_f64(&env, "HEATMAP_MIN_TEMP_K", self.heat_scale.min_temp_k);
        self.heat_scale.max_temp_k = env_var_f64(&env, "HEATMAP_MAX_TEMP_K", self.heat_scale.max_temp_k);
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn settle_debounce(&self) -> Duration {
        Duration::from_millis(self.settle_debounce_ms)
    }

    pub fn complete_reset_delay(&self) -> Duration {
        Duration::from_millis(self.complete_reset_delay_ms)
    }

    pub fn flight_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.flight_cancel_timeout_ms)
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            max_concurrent_fetches: self.max_concurrent_fetches,
            memory_budget_bytes: self.memory_budget_mb * 1024 * 1024,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..CoordinatorSettings::default()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            endpoints: self.endpoints.clone(),
            id_field: self.id_field.clone(),
            heat_scale: Some(self.heat_scale),
            selected_date: self.selected_date.clone(),
            ttl: self.cache_ttl(),
            max_retries: self.max_retries,
            progressive: self.progressive,
            batch_size: self.progressive_batch_size.max(1),
        }
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            max_altitude_m: self.max_altitude_m,
            tile_min_zoom: self.tile_min_zoom,
            tile_max_zoom: self.tile_max_zoom,
            max_tiles: self.max_tiles,
        }
    }

    pub fn tile_settings(&self) -> TileSettings {
        TileSettings {
            resolver: self.resolver_settings(),
            max_loads_per_update: self.max_loads_per_update,
            max_hidden_tiles: self.max_hidden_tiles,
            ttl: self.cache_ttl(),
            max_retries: self.max_retries,
            id_field: self.id_field.clone(),
        }
    }
}

fn env_var_u64(env: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_var_usize(env: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_var_f64(env: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

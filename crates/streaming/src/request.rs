use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tile::TileCoord;

/// Region of interest used for cache and dedup addressing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SpatialKey {
    PostalCode(String),
    Tile(TileCoord),
}

impl SpatialKey {
    pub fn postal_code(code: impl Into<String>) -> Self {
        SpatialKey::PostalCode(code.into())
    }

    pub fn as_postal_code(&self) -> Option<&str> {
        match self {
            SpatialKey::PostalCode(code) => Some(code),
            SpatialKey::Tile(_) => None,
        }
    }

    pub fn as_tile(&self) -> Option<TileCoord> {
        match self {
            SpatialKey::Tile(t) => Some(*t),
            SpatialKey::PostalCode(_) => None,
        }
    }
}

impl std::fmt::Display for SpatialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpatialKey::PostalCode(code) => write!(f, "posno:{code}"),
            SpatialKey::Tile(t) => write!(f, "tile:{t}"),
        }
    }
}

/// Cache/dedup address: a spatial key within one endpoint family.
///
/// The dataset keeps primary geometry and overlay data for the same key apart
/// (`buildings` vs `heat@2024-06-26`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub dataset: String,
    pub key: SpatialKey,
}

impl CacheKey {
    pub fn new(dataset: impl Into<String>, key: SpatialKey) -> Self {
        Self {
            dataset: dataset.into(),
            key,
        }
    }

    /// Stable string form, used as the persistent store key.
    pub fn storage_key(&self) -> String {
        format!("{}|{}", self.dataset, self.key)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.dataset, self.key)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// GeoJSON FeatureCollection.
    GeoJson,
    /// Tile payload (a FeatureCollection clipped to tile bounds).
    Tile,
}

impl DataKind {
    pub fn accept_header(&self) -> &'static str {
        match self {
            DataKind::GeoJson | DataKind::Tile => "application/geo+json, application/json",
        }
    }
}

/// Scheduling class for queued fetches. Only affects ordering between
/// distinct keys while the fetch slots are saturated.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Work-queue rank; smaller runs earlier.
    pub fn rank(self) -> i32 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub cache_enabled: bool,
    pub ttl: Duration,
    pub max_retries: u32,
    /// Deliver decoded entities to the renderer in batches.
    pub progressive: bool,
    pub priority: Priority,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            ttl: Duration::from_secs(60 * 60),
            max_retries: 2,
            progressive: false,
            priority: Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub key: CacheKey,
    pub url: String,
    pub kind: DataKind,
    pub options: LoadOptions,
}

impl LoadRequest {
    pub fn new(key: CacheKey, url: impl Into<String>, kind: DataKind) -> Self {
        Self {
            key,
            url: url.into(),
            kind,
            options: LoadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.options.priority = priority;
        self
    }
}

//! Which spatial keys a camera view should stream.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use foundation::bounds::GeoRect;
use foundation::math::{Ecef, altitude_m, haversine_m};
use serde_json::Value;
use tracing::debug;

use crate::entity::Geometry;
use crate::error::DecodeError;
use crate::request::SpatialKey;
use crate::tile::{TileCoord, covering_tiles, zoom_for_altitude};

/// Ground rectangle and height of the camera.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CameraView {
    pub rect: GeoRect,
    pub altitude_m: f64,
}

impl CameraView {
    pub fn new(rect: GeoRect, altitude_m: f64) -> Self {
        Self { rect, altitude_m }
    }

    /// Altitude derived from an ECEF camera position on the WGS84 ellipsoid.
    pub fn from_ecef(rect: GeoRect, position: Ecef) -> Self {
        Self::new(rect, altitude_m(position))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionInfo {
    pub code: String,
    pub name: Option<String>,
    pub bounds: GeoRect,
    pub geometry: Geometry,
    pub center: [f64; 2],
}

/// Postal-code areas with a bbox prefilter for viewport queries.
#[derive(Debug, Clone, Default)]
pub struct RegionIndex {
    regions: BTreeMap<String, RegionInfo>,
}

impl RegionIndex {
    /// Builds from a FeatureCollection whose features carry `posno` (or
    /// `postinumero`) and optionally `nimi`, `center_x`, `center_y`.
    pub fn from_geojson(doc: &Value) -> Result<Self, DecodeError> {
        let features = doc
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| DecodeError::new("region index needs a FeatureCollection"))?;

        let mut regions = BTreeMap::new();
        for feature in features {
            let props = feature.get("properties");
            let prop = |name: &str| props.and_then(|p| p.get(name));
            let Some(code) = prop("posno")
                .or_else(|| prop("postinumero"))
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(format!("{:05}", n.as_u64()?)),
                    _ => None,
                })
            else {
                continue;
            };
            let Some(geometry) = feature.get("geometry").and_then(Geometry::from_geojson) else {
                continue;
            };
            let Some(bounds) = geometry.bounds() else {
                continue;
            };
            let center = match (
                prop("center_x").and_then(Value::as_f64),
                prop("center_y").and_then(Value::as_f64),
            ) {
                (Some(x), Some(y)) => [x, y],
                _ => bounds.center(),
            };
            let name = prop("nimi").and_then(Value::as_str).map(str::to_string);
            regions.insert(
                code.clone(),
                RegionInfo {
                    code,
                    name,
                    bounds,
                    geometry,
                    center,
                },
            );
        }
        debug!(regions = regions.len(), "region index built");
        Ok(Self { regions })
    }

    pub fn insert(&mut self, region: RegionInfo) {
        self.regions.insert(region.code.clone(), region);
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn get(&self, code: &str) -> Option<&RegionInfo> {
        self.regions.get(code)
    }

    pub fn display_name(&self, code: &str) -> Option<&str> {
        self.regions.get(code)?.name.as_deref()
    }

    pub fn center(&self, code: &str) -> Option<[f64; 2]> {
        self.regions.get(code).map(|r| r.center)
    }

    /// Regions overlapping `rect`, in code order.
    pub fn intersecting<'a>(&'a self, rect: &'a GeoRect) -> impl Iterator<Item = &'a RegionInfo> + 'a {
        self.regions
            .values()
            .filter(move |r| r.bounds.intersects(rect) && r.geometry.intersects_rect(rect))
    }

    /// Region containing the point, if any.
    pub fn locate(&self, p: [f64; 2]) -> Option<&RegionInfo> {
        let point = GeoRect::new(p[0], p[1], p[0], p[1]);
        self.regions
            .values()
            .find(|r| r.bounds.intersects(&point) && r.geometry.intersects_rect(&point))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ResolverMode {
    #[default]
    Regions,
    Tiles,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ResolverSettings {
    pub max_altitude_m: f64,
    pub tile_min_zoom: u8,
    pub tile_max_zoom: u8,
    pub max_tiles: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            max_altitude_m: 50_000.0,
            tile_min_zoom: 13,
            tile_max_zoom: 16,
            max_tiles: 64,
        }
    }
}

/// Tiles for a view, nearest to the view center first, capped at `max_tiles`.
pub fn tiles_for_view(view: &CameraView, settings: &ResolverSettings) -> Vec<TileCoord> {
    let z = zoom_for_altitude(view.altitude_m, settings.tile_min_zoom, settings.tile_max_zoom);
    nearest_tiles(&view.rect, z, settings.max_tiles)
}

fn nearest_tiles(rect: &GeoRect, z: u8, max_tiles: usize) -> Vec<TileCoord> {
    let c = rect.center();
    // Ground distance: a degree of longitude shrinks toward the poles.
    let mut tiles: Vec<(f64, TileCoord)> = covering_tiles(rect, z)
        .into_iter()
        .map(|t| (haversine_m(t.center(), c), t))
        .collect();
    tiles.sort_by(|(da, a), (db, b)| da.total_cmp(db).then_with(|| a.cmp(b)));
    let mut tiles: Vec<TileCoord> = tiles.into_iter().map(|(_, t)| t).collect();
    tiles.truncate(max_tiles);
    tiles
}

#[derive(Debug, Clone)]
pub struct ViewportResolver {
    index: Arc<RegionIndex>,
    settings: ResolverSettings,
    mode: ResolverMode,
}

impl ViewportResolver {
    pub fn new(index: Arc<RegionIndex>, settings: ResolverSettings) -> Self {
        Self {
            index,
            settings,
            mode: ResolverMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ResolverMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> ResolverMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ResolverMode) {
        self.mode = mode;
    }

    pub fn index(&self) -> &RegionIndex {
        &self.index
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    pub fn should_load(&self, altitude_m: f64) -> bool {
        altitude_m <= self.settings.max_altitude_m
    }

    /// Keys overlapping `rect`. Without an altitude, tile mode uses the finest
    /// zoom whose covering stays within `max_tiles`.
    pub fn visible_keys(&self, rect: &GeoRect) -> BTreeSet<SpatialKey> {
        match self.mode {
            ResolverMode::Regions => self
                .index
                .intersecting(rect)
                .map(|r| SpatialKey::PostalCode(r.code.clone()))
                .collect(),
            ResolverMode::Tiles => {
                let s = &self.settings;
                let mut z = s.tile_max_zoom;
                while z > s.tile_min_zoom && covering_tiles(rect, z).len() > s.max_tiles {
                    z -= 1;
                }
                nearest_tiles(rect, z, s.max_tiles)
                    .into_iter()
                    .map(SpatialKey::Tile)
                    .collect()
            }
        }
    }

    /// Empty when the camera is above the streaming altitude.
    pub fn visible_keys_for(&self, view: &CameraView) -> BTreeSet<SpatialKey> {
        if !self.should_load(view.altitude_m) {
            debug!(altitude_m = view.altitude_m, "camera above streaming altitude");
            return BTreeSet::new();
        }
        match self.mode {
            ResolverMode::Regions => self.visible_keys(&view.rect),
            ResolverMode::Tiles => tiles_for_view(view, &self.settings)
                .into_iter()
                .map(SpatialKey::Tile)
                .collect(),
        }
    }
}

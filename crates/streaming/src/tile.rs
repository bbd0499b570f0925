//! Web-Mercator tile addressing for the fine-grained streaming mode.

use std::f64::consts::PI;

use foundation::bounds::GeoRect;
use serde::{Deserialize, Serialize};

/// Latitude limit of the Web-Mercator square.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Tile coordinate in the ZXY scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Tile containing the `[lon, lat]` position at zoom `z`.
    pub fn containing(p: [f64; 2], z: u8) -> Self {
        Self::new(z, lon_to_tile_x(p[0], z), lat_to_tile_y(p[1], z))
    }

    pub fn bounds(&self) -> GeoRect {
        let n = tiles_per_side(self.z) as f64;
        let west = self.x as f64 / n * 360.0 - 180.0;
        let east = (self.x + 1) as f64 / n * 360.0 - 180.0;
        // Y grows southwards.
        let north = tile_y_to_lat(self.y, self.z);
        let south = tile_y_to_lat(self.y + 1, self.z);
        GeoRect::new(west, south, east, north)
    }

    pub fn center(&self) -> [f64; 2] {
        self.bounds().center()
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

pub fn tiles_per_side(z: u8) -> u32 {
    1u32 << z
}

pub fn lon_to_tile_x(lon: f64, z: u8) -> u32 {
    let n = tiles_per_side(z);
    let x = ((lon + 180.0) / 360.0 * n as f64).floor() as i64;
    x.clamp(0, n as i64 - 1) as u32
}

pub fn lat_to_tile_y(lat: f64, z: u8) -> u32 {
    let n = tiles_per_side(z);
    let lat_rad = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n as f64).floor() as i64;
    y.clamp(0, n as i64 - 1) as u32
}

fn tile_y_to_lat(y: u32, z: u8) -> f64 {
    let n = PI - 2.0 * PI * y as f64 / tiles_per_side(z) as f64;
    n.sinh().atan().to_degrees()
}

/// Zoom level whose tiles roughly match what a camera at `altitude_m` resolves.
///
/// At ~20 000 km altitude the whole globe is one tile; each halving of the
/// altitude adds a level.
pub fn zoom_for_altitude(altitude_m: f64, min_zoom: u8, max_zoom: u8) -> u8 {
    let z = (20_000_000.0 / altitude_m.max(1.0)).log2().floor() as i32;
    z.clamp(min_zoom as i32, max_zoom as i32) as u8
}

/// All tiles at zoom `z` intersecting `rect`, row-major from the north-west.
pub fn covering_tiles(rect: &GeoRect, z: u8) -> Vec<TileCoord> {
    let x_min = lon_to_tile_x(rect.west, z);
    let x_max = lon_to_tile_x(rect.east, z);
    let y_min = lat_to_tile_y(rect.north, z);
    let y_max = lat_to_tile_y(rect.south, z);

    let mut out = Vec::with_capacity(((x_max - x_min + 1) * (y_max - y_min + 1)) as usize);
    for y in y_min..=y_max {
        for x in x_min..=x_max {
            out.push(TileCoord::new(z, x, y));
        }
    }
    out
}

//! Building entities decoded from GeoJSON, with an optional heat overlay.

use std::collections::HashMap;

use foundation::bounds::GeoRect;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::error::DecodeError;

pub const DEFAULT_ID_FIELD: &str = "vtj_prt";

pub type Ring = Vec<[f64; 2]>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

impl Geometry {
    /// Polygonal geometries only; points and lines yield `None`.
    pub fn from_geojson(value: &Value) -> Option<Self> {
        let coords = value.get("coordinates")?;
        match value.get("type")?.as_str()? {
            "Polygon" => Some(Geometry::Polygon(parse_rings(coords)?)),
            "MultiPolygon" => {
                let polys = coords
                    .as_array()?
                    .iter()
                    .map(parse_rings)
                    .collect::<Option<Vec<_>>>()?;
                Some(Geometry::MultiPolygon(polys))
            }
            _ => None,
        }
    }

    /// Outer ring of each polygon part.
    pub fn outer_rings(&self) -> impl Iterator<Item = &Ring> {
        let parts: Vec<&Vec<Ring>> = match self {
            Geometry::Polygon(rings) => vec![rings],
            Geometry::MultiPolygon(polys) => polys.iter().collect(),
        };
        parts.into_iter().filter_map(|rings| rings.first())
    }

    pub fn bounds(&self) -> Option<GeoRect> {
        GeoRect::from_positions(self.outer_rings().flatten())
    }

    /// Exact polygon/rectangle overlap test on outer rings. Holes are ignored.
    pub fn intersects_rect(&self, rect: &GeoRect) -> bool {
        self.outer_rings().any(|ring| ring_intersects_rect(ring, rect))
    }
}

fn parse_rings(value: &Value) -> Option<Vec<Ring>> {
    value
        .as_array()?
        .iter()
        .map(|ring| {
            ring.as_array()?
                .iter()
                .map(|pos| {
                    let pos = pos.as_array()?;
                    Some([pos.first()?.as_f64()?, pos.get(1)?.as_f64()?])
                })
                .collect::<Option<Ring>>()
        })
        .collect()
}

fn point_in_ring(p: [f64; 2], ring: &[[f64; 2]]) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (ring[i], ring[j]);
        if (a[1] > p[1]) != (b[1] > p[1]) && p[0] < (b[0] - a[0]) * (p[1] - a[1]) / (b[1] - a[1]) + a[0] {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn cross(o: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

fn segments_intersect(p1: [f64; 2], p2: [f64; 2], q1: [f64; 2], q2: [f64; 2]) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);
    ((d1 > 0.0) != (d2 > 0.0) || d1 == 0.0 || d2 == 0.0) && ((d3 > 0.0) != (d4 > 0.0) || d3 == 0.0 || d4 == 0.0)
}

fn ring_intersects_rect(ring: &[[f64; 2]], rect: &GeoRect) -> bool {
    if ring.iter().any(|p| rect.contains(*p)) {
        return true;
    }
    let corners = rect.corners();
    if corners.iter().any(|c| point_in_ring(*c, ring)) {
        return true;
    }
    ring.windows(2).any(|seg| {
        (0..4).any(|i| segments_intersect(seg[0], seg[1], corners[i], corners[(i + 1) % 4]))
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildingAttributes {
    pub floor_count: Option<u32>,
    pub construction_year: Option<i32>,
    pub usage: Option<String>,
    pub address: Option<String>,
    pub apartment_count: Option<u32>,
}

impl BuildingAttributes {
    fn from_properties(props: &Map<String, Value>) -> Self {
        let address = match (str_prop(props, "katu"), str_prop(props, "osno1")) {
            (Some(street), Some(number)) => Some(format!("{street} {number}")),
            (Some(street), None) => Some(street),
            _ => None,
        };
        let construction_year = int_prop(props, "kavu")
            .or_else(|| str_prop(props, "c_valmpvm").and_then(|d| d.get(..4)?.parse().ok()))
            .map(|y| y as i32);
        Self {
            floor_count: int_prop(props, "kerrosten_lkm").map(|v| v as u32),
            construction_year,
            usage: str_prop(props, "kayttarks"),
            address,
            apartment_count: int_prop(props, "asuntojen_lkm").map(|v| v as u32),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatOverlay {
    /// Normalized exposure index in `[0, 1]`.
    pub heat_exposure: f64,
    pub temperature_c: Option<f64>,
    pub date: String,
}

/// Kelvin reference range the exposure index was normalized against.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct HeatScale {
    pub min_temp_k: f64,
    pub max_temp_k: f64,
}

impl HeatScale {
    pub fn temperature_c(&self, heat_exposure: f64) -> f64 {
        let temp_k = heat_exposure * (self.max_temp_k - self.min_temp_k) + self.min_temp_k;
        temp_k - 273.15
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpatialEntity {
    pub id: String,
    pub postal_code: Option<String>,
    pub geometry: Geometry,
    pub attributes: BuildingAttributes,
    pub overlay: Option<HeatOverlay>,
}

fn str_prop(props: &Map<String, Value>, name: &str) -> Option<String> {
    match props.get(name)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_prop(props: &Map<String, Value>, name: &str) -> Option<i64> {
    match props.get(name)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn f64_prop(props: &Map<String, Value>, name: &str) -> Option<f64> {
    match props.get(name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn features(doc: &Value) -> Result<&Vec<Value>, DecodeError> {
    match doc {
        Value::Object(obj) => obj
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| DecodeError::new("expected a FeatureCollection with a features array")),
        Value::Array(rows) => Ok(rows),
        _ => Err(DecodeError::new("expected a JSON object or array")),
    }
}

/// Properties of a feature, or the row itself for plain JSON arrays.
fn properties(item: &Value) -> Option<&Map<String, Value>> {
    match item.get("properties") {
        Some(Value::Object(props)) => Some(props),
        _ => item.as_object(),
    }
}

/// Decodes a building FeatureCollection. Point features and features without
/// an id are skipped.
pub fn decode_buildings(doc: &Value, id_field: &str) -> Result<Vec<SpatialEntity>, DecodeError> {
    let items = features(doc)?;
    let mut out = Vec::with_capacity(items.len());
    let mut skipped = 0usize;

    for item in items {
        let Some(props) = properties(item) else {
            skipped += 1;
            continue;
        };
        if props.get("geometria").and_then(Value::as_str) == Some("piste") {
            skipped += 1;
            continue;
        }
        let Some(geometry) = item.get("geometry").and_then(Geometry::from_geojson) else {
            skipped += 1;
            continue;
        };
        let Some(id) = str_prop(props, id_field) else {
            trace!(id_field, "feature without id skipped");
            skipped += 1;
            continue;
        };
        out.push(SpatialEntity {
            id,
            postal_code: str_prop(props, "postinumero").or_else(|| str_prop(props, "posno")),
            geometry,
            attributes: BuildingAttributes::from_properties(props),
            overlay: None,
        });
    }

    if skipped > 0 {
        debug!(decoded = out.len(), skipped, "building features skipped");
    }
    Ok(out)
}

/// Decodes heat rows for `date`, keyed by building id. Rows for another date
/// and negative (no-data) exposure values are ignored.
pub fn decode_heat(doc: &Value, id_field: &str, date: &str) -> Result<HashMap<String, HeatOverlay>, DecodeError> {
    let items = features(doc)?;
    let mut out = HashMap::with_capacity(items.len());

    for item in items {
        let Some(props) = properties(item) else {
            continue;
        };
        let Some(id) = str_prop(props, id_field) else {
            continue;
        };
        let row_date = str_prop(props, "date");
        if let Some(row_date) = &row_date
            && !row_date.starts_with(date)
        {
            continue;
        }
        let Some(heat_exposure) = f64_prop(props, "avgheatexposure").filter(|h| *h >= 0.0) else {
            continue;
        };
        out.insert(
            id,
            HeatOverlay {
                heat_exposure,
                temperature_c: f64_prop(props, "avg_temp_c"),
                date: date.to_string(),
            },
        );
    }
    Ok(out)
}

/// Attaches overlay values by id; returns how many entities matched.
/// A missing temperature is derived from the exposure when `scale` is set.
pub fn merge_overlay(
    entities: &mut [SpatialEntity],
    overlay: &HashMap<String, HeatOverlay>,
    scale: Option<&HeatScale>,
) -> usize {
    let mut matched = 0;
    for entity in entities.iter_mut() {
        let Some(values) = overlay.get(&entity.id) else {
            continue;
        };
        let mut values = values.clone();
        if values.temperature_c.is_none()
            && let Some(scale) = scale
        {
            values.temperature_c = Some(scale.temperature_c(values.heat_exposure));
        }
        entity.overlay = Some(values);
        matched += 1;
    }
    matched
}

/// Mean of all outer-ring vertices, as `[lon, lat]`.
pub fn region_center(entities: &[SpatialEntity]) -> Option<[f64; 2]> {
    let (mut sx, mut sy, mut n) = (0.0, 0.0, 0usize);
    for p in entities.iter().flat_map(|e| e.geometry.outer_rings()).flatten() {
        sx += p[0];
        sy += p[1];
        n += 1;
    }
    (n > 0).then(|| [sx / n as f64, sy / n as f64])
}

use serde::{Deserialize, Serialize};

/// Geographic rectangle in WGS84 degrees.
///
/// Rectangles never wrap the antimeridian: `west <= east` and `south <= north`
/// are normalized on construction.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoRect {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeoRect {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west: west.min(east),
            south: south.min(north),
            east: west.max(east),
            north: south.max(north),
        }
    }

    /// Smallest rectangle covering every `[lon, lat]` position, or `None` when empty.
    pub fn from_positions<'a>(positions: impl IntoIterator<Item = &'a [f64; 2]>) -> Option<Self> {
        let mut iter = positions.into_iter();
        let first = iter.next()?;
        let mut rect = Self::new(first[0], first[1], first[0], first[1]);
        for p in iter {
            rect.extend(*p);
        }
        Some(rect)
    }

    pub fn extend(&mut self, p: [f64; 2]) {
        self.west = self.west.min(p[0]);
        self.east = self.east.max(p[0]);
        self.south = self.south.min(p[1]);
        self.north = self.north.max(p[1]);
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    pub fn center(&self) -> [f64; 2] {
        [
            (self.west + self.east) * 0.5,
            (self.south + self.north) * 0.5,
        ]
    }

    /// Closed containment: points on the edge are inside.
    pub fn contains(&self, p: [f64; 2]) -> bool {
        p[0] >= self.west && p[0] <= self.east && p[1] >= self.south && p[1] <= self.north
    }

    /// Closed overlap test; rectangles sharing only an edge intersect.
    pub fn intersects(&self, other: &GeoRect) -> bool {
        self.west <= other.east
            && other.west <= self.east
            && self.south <= other.north
            && other.south <= self.north
    }

    /// Corners in counter-clockwise order starting south-west.
    pub fn corners(&self) -> [[f64; 2]; 4] {
        [
            [self.west, self.south],
            [self.east, self.south],
            [self.east, self.north],
            [self.west, self.north],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::GeoRect;

    #[test]
    fn new_normalizes_swapped_edges() {
        let r = GeoRect::new(25.0, 60.3, 24.9, 60.1);
        assert_eq!(r.west, 24.9);
        assert_eq!(r.east, 25.0);
        assert_eq!(r.south, 60.1);
        assert_eq!(r.north, 60.3);
    }

    #[test]
    fn edge_touching_rects_intersect() {
        let a = GeoRect::new(0.0, 0.0, 1.0, 1.0);
        let b = GeoRect::new(1.0, 0.5, 2.0, 2.0);
        let c = GeoRect::new(1.01, 0.5, 2.0, 2.0);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn from_positions_covers_all_points() {
        let pts = [[24.9, 60.2], [24.95, 60.15], [24.92, 60.18]];
        let r = GeoRect::from_positions(&pts).expect("non-empty");
        assert!(pts.iter().all(|p| r.contains(*p)));
        assert!(GeoRect::from_positions(&[]).is_none());
    }
}

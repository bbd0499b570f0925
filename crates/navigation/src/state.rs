use streaming::error::LoadError;
use streaming::request::SpatialKey;
use streaming::viewport::RegionIndex;

use crate::camera::{FlightDestination, ViewSnapshot};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Idle,
    Loading,
    Animating,
    Complete,
    Error,
}

/// Where a click navigates to.
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationTarget {
    pub key: SpatialKey,
    pub display_name: Option<String>,
    pub destination: FlightDestination,
}

impl NavigationTarget {
    pub fn new(key: SpatialKey, center: [f64; 2], altitude_m: f64) -> Self {
        Self {
            key,
            display_name: None,
            destination: FlightDestination {
                lon: center[0],
                lat: center[1],
                altitude_m,
            },
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Target for a postal-code area known to the index.
    pub fn region(index: &RegionIndex, code: &str, altitude_m: f64) -> Option<Self> {
        let region = index.get(code)?;
        let target = Self::new(SpatialKey::postal_code(code), region.center, altitude_m);
        Some(match &region.name {
            Some(name) => target.with_display_name(name.clone()),
            None => target,
        })
    }
}

/// Read-only view of the click session, published through a watch channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClickProcessingState {
    pub is_processing: bool,
    pub spatial_key: Option<SpatialKey>,
    pub display_name: Option<String>,
    pub stage: Stage,
    pub can_cancel: bool,
    pub error: Option<LoadError>,
    pub previous_view: Option<ViewSnapshot>,
    pub pending_navigation: Option<NavigationTarget>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NavigationEvent {
    Stage {
        key: Option<SpatialKey>,
        stage: Stage,
        can_cancel: bool,
    },
}

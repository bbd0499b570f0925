//! Passive streaming: what to load when the camera settles and no click
//! session is running.

use std::sync::Arc;

use streaming::pipeline::RegionPipeline;
use streaming::request::SpatialKey;
use streaming::tiles::{TileStreamingManager, TileUpdate};
use streaming::viewport::{CameraView, RegionIndex, ResolverMode, ResolverSettings, ViewportResolver};
use tracing::debug;

use crate::camera::Camera;
use crate::machine::NavigationStateMachine;
use crate::mode::{ModeChange, ModeSelector, StreamingMode};
use crate::settle::CameraSettlementTracker;

#[derive(Debug, Clone, PartialEq)]
pub enum PassiveOutcome {
    /// A click session is running.
    Busy,
    /// The camera sees no ground.
    NoView,
    TooHigh { altitude_m: f64 },
    Disabled(StreamingMode),
    Regions(Vec<SpatialKey>),
    Tiles(TileUpdate),
}

#[derive(Clone)]
pub struct StreamingController {
    camera: Arc<dyn Camera>,
    machine: NavigationStateMachine,
    resolver: ViewportResolver,
    pipeline: Arc<RegionPipeline>,
    tiles: TileStreamingManager,
    modes: Arc<ModeSelector>,
}

impl std::fmt::Debug for StreamingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingController")
            .field("mode", &self.modes.mode())
            .field("machine", &self.machine)
            .finish()
    }
}

impl StreamingController {
    pub fn new(
        camera: Arc<dyn Camera>,
        machine: NavigationStateMachine,
        index: Arc<RegionIndex>,
        resolver_settings: ResolverSettings,
        pipeline: Arc<RegionPipeline>,
        tiles: TileStreamingManager,
        initial_mode: StreamingMode,
    ) -> Self {
        let modes = Arc::new(ModeSelector::new(initial_mode, Some(tiles.clone())));
        Self {
            camera,
            machine,
            resolver: ViewportResolver::new(index, resolver_settings).with_mode(ResolverMode::Regions),
            pipeline,
            tiles,
            modes,
        }
    }

    pub fn modes(&self) -> &ModeSelector {
        &self.modes
    }

    /// Switches mode; re-enabling tiles runs a viewport pass right away.
    pub fn set_mode(&self, mode: StreamingMode) -> ModeChange {
        let change = self.modes.set(mode);
        if change.refresh_tiles {
            self.on_settled();
        }
        change
    }

    /// Runs a passive pass on every settle.
    pub fn attach(&self, tracker: &CameraSettlementTracker) {
        let this = self.clone();
        tracker.on_settled(move || {
            this.on_settled();
        });
    }

    pub fn on_settled(&self) -> PassiveOutcome {
        if self.machine.is_processing() {
            return PassiveOutcome::Busy;
        }
        let Some(rect) = self.camera.view_rectangle() else {
            return PassiveOutcome::NoView;
        };
        let view = CameraView::from_ecef(rect, self.camera.pose().position);
        if !self.resolver.should_load(view.altitude_m) {
            debug!(altitude_m = view.altitude_m, "camera too high for streaming");
            return PassiveOutcome::TooHigh {
                altitude_m: view.altitude_m,
            };
        }

        match self.modes.mode() {
            StreamingMode::Regions => {
                let keys: Vec<SpatialKey> = self.resolver.visible_keys(&view.rect).into_iter().collect();
                for key in &keys {
                    self.pipeline.preload_region(key);
                }
                debug!(regions = keys.len(), "preloading visible regions");
                PassiveOutcome::Regions(keys)
            }
            StreamingMode::Tiles => PassiveOutcome::Tiles(self.tiles.update_viewport(&view)),
            mode => PassiveOutcome::Disabled(mode),
        }
    }
}

use serde::{Deserialize, Serialize};
use streaming::tiles::TileStreamingManager;
use tokio::sync::watch;
use tracing::info;

/// Which passive streaming strategy is active. Exactly one at a time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    #[default]
    Regions,
    Tiles,
    StatisticalGrid,
    Off,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub previous: StreamingMode,
    pub current: StreamingMode,
    /// Tiles were re-enabled; the caller should run a viewport update.
    pub refresh_tiles: bool,
}

/// Single owner of the streaming mode. The last `set` wins.
#[derive(Debug)]
pub struct ModeSelector {
    mode: watch::Sender<StreamingMode>,
    tiles: Option<TileStreamingManager>,
}

impl ModeSelector {
    pub fn new(initial: StreamingMode, tiles: Option<TileStreamingManager>) -> Self {
        if let Some(tiles) = &tiles {
            tiles.set_layer_visible(initial == StreamingMode::Tiles);
        }
        let (mode, _) = watch::channel(initial);
        Self { mode, tiles }
    }

    pub fn mode(&self) -> StreamingMode {
        *self.mode.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamingMode> {
        self.mode.subscribe()
    }

    pub fn set(&self, current: StreamingMode) -> ModeChange {
        let previous = self.mode.send_replace(current);
        let mut change = ModeChange {
            previous,
            current,
            refresh_tiles: false,
        };
        if previous == current {
            return change;
        }
        if let Some(tiles) = &self.tiles {
            if previous == StreamingMode::Tiles {
                tiles.set_layer_visible(false);
            }
            if current == StreamingMode::Tiles {
                tiles.set_layer_visible(true);
                change.refresh_tiles = true;
            }
        }
        info!(?previous, ?current, "streaming mode changed");
        change
    }
}

#[cfg(test)]
mod tests {
    use super::{ModeSelector, StreamingMode};

    #[test]
    fn last_set_wins() {
        let selector = ModeSelector::new(StreamingMode::Regions, None);
        let rx = selector.subscribe();
        selector.set(StreamingMode::Tiles);
        selector.set(StreamingMode::StatisticalGrid);
        let change = selector.set(StreamingMode::Off);
        assert_eq!(change.previous, StreamingMode::StatisticalGrid);
        assert_eq!(selector.mode(), StreamingMode::Off);
        assert_eq!(*rx.borrow(), StreamingMode::Off);
    }

    #[test]
    fn setting_the_same_mode_changes_nothing() {
        let selector = ModeSelector::new(StreamingMode::Tiles, None);
        let change = selector.set(StreamingMode::Tiles);
        assert_eq!(change.previous, change.current);
        assert!(!change.refresh_tiles);
    }

    #[test]
    fn modes_use_snake_case_names() {
        let mode: StreamingMode = serde_json::from_str("\"statistical_grid\"").unwrap();
        assert_eq!(mode, StreamingMode::StatisticalGrid);
    }
}

//! Fine-grained tile streaming for the `Tiles` mode.
//!
//! Each tile has a residency state and, separately, a visibility flag. Hiding
//! a tile never drops its entities; only the hidden-tile cap unloads them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use runtime::budget::FrameBudget;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Endpoints;
use crate::coordinator::CacheCoordinator;
use crate::entity::decode_buildings;
use crate::request::{CacheKey, DataKind, LoadOptions, LoadRequest, Priority, SpatialKey};
use crate::residency::ResidencyState;
use crate::sink::EntitySink;
use crate::tile::TileCoord;
use crate::viewport::{CameraView, ResolverSettings, tiles_for_view};

const TILE_DATASET: &str = "tiles";

#[derive(Debug, Clone, PartialEq)]
pub struct TileSettings {
    pub resolver: ResolverSettings,
    pub max_loads_per_update: u32,
    pub max_hidden_tiles: usize,
    pub ttl: Duration,
    pub max_retries: u32,
    pub id_field: String,
}

impl Default for TileSettings {
    fn default() -> Self {
        Self {
            resolver: ResolverSettings::default(),
            max_loads_per_update: 8,
            max_hidden_tiles: 128,
            ttl: Duration::from_secs(60 * 60),
            max_retries: 2,
            id_field: crate::entity::DEFAULT_ID_FIELD.into(),
        }
    }
}

/// What one `update_viewport` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileUpdate {
    pub requested: Vec<TileCoord>,
    pub shown: Vec<TileCoord>,
    pub hidden: Vec<TileCoord>,
    pub cancelled: Vec<TileCoord>,
    pub unloaded: Vec<TileCoord>,
}

impl TileUpdate {
    pub fn is_empty(&self) -> bool {
        self.requested.is_empty()
            && self.shown.is_empty()
            && self.hidden.is_empty()
            && self.cancelled.is_empty()
            && self.unloaded.is_empty()
    }
}

#[derive(Debug)]
struct TileSlot {
    state: ResidencyState,
    visible: bool,
    hidden_at: u64,
    entity_count: usize,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct TileTable {
    tiles: BTreeMap<TileCoord, TileSlot>,
    layer_visible: bool,
    tick: u64,
}

struct Inner {
    coordinator: CacheCoordinator,
    endpoints: Endpoints,
    sink: Arc<dyn EntitySink>,
    settings: TileSettings,
    table: Mutex<TileTable>,
    pending: AtomicUsize,
    idle: Notify,
}

/// Decrements the pending count when a load task ends, including by abort.
struct PendingGuard(Arc<Inner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::SeqCst);
        self.0.idle.notify_waiters();
    }
}

#[derive(Clone)]
pub struct TileStreamingManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TileStreamingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.inner.table.lock();
        f.debug_struct("TileStreamingManager")
            .field("tiles", &table.tiles.len())
            .field("layer_visible", &table.layer_visible)
            .field("pending", &self.inner.pending.load(Ordering::SeqCst))
            .finish()
    }
}

fn tile_key(tile: TileCoord) -> CacheKey {
    CacheKey::new(TILE_DATASET, SpatialKey::Tile(tile))
}

fn collection(tile: TileCoord) -> String {
    SpatialKey::Tile(tile).to_string()
}

impl TileStreamingManager {
    pub fn new(
        coordinator: CacheCoordinator,
        endpoints: Endpoints,
        sink: Arc<dyn EntitySink>,
        settings: TileSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                coordinator,
                endpoints,
                sink,
                settings,
                table: Mutex::new(TileTable {
                    tiles: BTreeMap::new(),
                    layer_visible: true,
                    tick: 0,
                }),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn update_viewport(&self, view: &CameraView) -> TileUpdate {
        let inner = &self.inner;
        let wanted = tiles_for_view(view, &inner.settings.resolver);
        let wanted_set: BTreeSet<TileCoord> = wanted.iter().copied().collect();
        let mut update = TileUpdate::default();

        let mut table = inner.table.lock();
        table.tick += 1;
        let tick = table.tick;
        let layer_visible = table.layer_visible;

        // Tiles that left the view: cancel loads, hide resident ones.
        let mut dropped = Vec::new();
        for (tile, slot) in table.tiles.iter_mut() {
            if wanted_set.contains(tile) {
                continue;
            }
            if slot.state.is_loading() {
                if let Some(task) = slot.task.take() {
                    task.abort();
                }
                inner.coordinator.cancel(&tile_key(*tile));
                dropped.push(*tile);
            } else if slot.state == ResidencyState::Resident && slot.visible {
                slot.visible = false;
                slot.hidden_at = tick;
                inner.sink.set_visible(&collection(*tile), false);
                update.hidden.push(*tile);
            }
        }
        for tile in dropped {
            table.tiles.remove(&tile);
            update.cancelled.push(tile);
        }

        // Newly visible tiles, nearest first, within the per-update budget.
        let mut budget = FrameBudget::new(inner.settings.max_loads_per_update);
        for tile in wanted {
            let state = table.tiles.get(&tile).map(|s| (s.state, s.visible));
            match state {
                Some((ResidencyState::Resident, false)) => {
                    if let Some(slot) = table.tiles.get_mut(&tile) {
                        slot.visible = true;
                    }
                    if layer_visible {
                        inner.sink.set_visible(&collection(tile), true);
                    }
                    update.shown.push(tile);
                }
                Some((ResidencyState::Resident, true)) => {}
                Some((s, _)) if s.is_loading() => {}
                _ => {
                    if !budget.try_consume(1) {
                        continue;
                    }
                    let task = self.spawn_load(tile);
                    table.tiles.insert(
                        tile,
                        TileSlot {
                            state: ResidencyState::Requested,
                            visible: true,
                            hidden_at: 0,
                            entity_count: 0,
                            task: Some(task),
                        },
                    );
                    update.requested.push(tile);
                }
            }
        }

        // Unload the oldest hidden tiles beyond the cap.
        let mut hidden: Vec<(u64, TileCoord)> = table
            .tiles
            .iter()
            .filter(|(_, s)| s.state == ResidencyState::Resident && !s.visible)
            .map(|(t, s)| (s.hidden_at, *t))
            .collect();
        if hidden.len() > inner.settings.max_hidden_tiles {
            hidden.sort();
            let excess = hidden.len() - inner.settings.max_hidden_tiles;
            for (_, tile) in hidden.into_iter().take(excess) {
                // Evicted slots leave the table; a later view requests them afresh.
                table.tiles.remove(&tile);
                inner.sink.remove(&collection(tile));
                debug!(%tile, state = ?ResidencyState::Evicted, "tile unloaded");
                update.unloaded.push(tile);
            }
        }

        if !update.is_empty() {
            debug!(
                requested = update.requested.len(),
                deferred = budget.deferred(),
                shown = update.shown.len(),
                hidden = update.hidden.len(),
                cancelled = update.cancelled.len(),
                unloaded = update.unloaded.len(),
                "tile viewport update"
            );
        }
        update
    }

    fn spawn_load(&self, tile: TileCoord) -> JoinHandle<()> {
        let inner = self.inner.clone();
        inner.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard(inner.clone());
        let key = SpatialKey::Tile(tile);
        let request = LoadRequest::new(tile_key(tile), inner.endpoints.buildings_url(&key), DataKind::Tile)
            .with_options(LoadOptions {
                ttl: inner.settings.ttl,
                max_retries: inner.settings.max_retries,
                priority: Priority::Normal,
                ..LoadOptions::default()
            });
        let url = request.url.clone();

        tokio::spawn(async move {
            let _guard = guard;
            inner.set_state(tile, ResidencyState::Downloading);
            let loaded = inner.coordinator.load(request).await;

            let entities = match loaded {
                Ok(loaded) => match decode_buildings(&loaded.data, &inner.settings.id_field) {
                    Ok(entities) => entities,
                    Err(e) => {
                        warn!(%tile, error = %e.into_load_error(&url), "tile payload unreadable");
                        inner.forget(tile);
                        return;
                    }
                },
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    warn!(%tile, error = %e, "tile load failed");
                    inner.forget(tile);
                    return;
                }
            };

            let mut table = inner.table.lock();
            let layer_visible = table.layer_visible;
            let Some(slot) = table.tiles.get_mut(&tile) else {
                return;
            };
            if !slot.state.is_loading() {
                return;
            }
            slot.state = ResidencyState::Resident;
            slot.entity_count = entities.len();
            slot.task = None;
            let name = collection(tile);
            inner.sink.replace(&name, &entities);
            if !(slot.visible && layer_visible) {
                inner.sink.set_visible(&name, false);
            }
        })
    }

    /// Hides or restores every resident tile without dropping payloads.
    pub fn set_layer_visible(&self, visible: bool) {
        let mut table = self.inner.table.lock();
        if table.layer_visible == visible {
            return;
        }
        table.layer_visible = visible;
        for (tile, slot) in &table.tiles {
            if slot.state == ResidencyState::Resident && slot.visible {
                self.inner.sink.set_visible(&collection(*tile), visible);
            }
        }
        debug!(visible, "tile layer visibility changed");
    }

    pub fn is_layer_visible(&self) -> bool {
        self.inner.table.lock().layer_visible
    }

    pub fn tile_state(&self, tile: TileCoord) -> Option<ResidencyState> {
        self.inner.table.lock().tiles.get(&tile).map(|s| s.state)
    }

    pub fn is_tile_visible(&self, tile: TileCoord) -> bool {
        let table = self.inner.table.lock();
        table.layer_visible && table.tiles.get(&tile).is_some_and(|s| s.visible && s.state == ResidencyState::Resident)
    }

    pub fn resident_count(&self) -> usize {
        self.inner
            .table
            .lock()
            .tiles
            .values()
            .filter(|s| s.state == ResidencyState::Resident)
            .count()
    }

    /// Tiles with a slot in the table: loading, shown, or hidden.
    pub fn tracked_count(&self) -> usize {
        self.inner.table.lock().tiles.len()
    }

    pub fn entity_count(&self, tile: TileCoord) -> usize {
        self.inner.table.lock().tiles.get(&tile).map_or(0, |s| s.entity_count)
    }

    pub fn pending_loads(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Resolves once no tile load is outstanding.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancels outstanding loads and unloads every tile.
    pub fn clear(&self) {
        let mut table = self.inner.table.lock();
        for (tile, slot) in std::mem::take(&mut table.tiles) {
            if let Some(task) = slot.task {
                task.abort();
                self.inner.coordinator.cancel(&tile_key(tile));
            }
            self.inner.sink.remove(&collection(tile));
        }
    }
}

impl Inner {
    fn set_state(&self, tile: TileCoord, state: ResidencyState) {
        if let Some(slot) = self.table.lock().tiles.get_mut(&tile) {
            slot.state = state;
        }
    }

    /// Drops a failed tile so a later update requests it again.
    fn forget(&self, tile: TileCoord) {
        let mut table = self.table.lock();
        if table.tiles.get(&tile).is_some_and(|s| s.state.is_loading()) {
            table.tiles.remove(&tile);
        }
    }
}

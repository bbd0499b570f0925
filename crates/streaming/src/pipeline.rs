//! Region loading: building geometry plus the heat overlay for the selected
//! date, merged into entities and handed to the renderer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Endpoints;
use crate::coordinator::{CacheCoordinator, Loaded};
use crate::entity::{HeatScale, SpatialEntity, decode_buildings, decode_heat, merge_overlay};
use crate::error::LoadError;
use crate::request::{CacheKey, DataKind, LoadOptions, LoadRequest, Priority, SpatialKey};
use crate::sink::EntitySink;
use crate::store::BoxFuture;

/// Emitted after a region's entities reached the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    RegionLoaded {
        key: SpatialKey,
        entity_count: usize,
        /// Heat exposure of every entity with an overlay, for histograms.
        heat_values: Vec<f64>,
    },
}

/// Region loading seam used by the navigation state machine.
pub trait RegionLoader: Send + Sync {
    fn load_region<'a>(&'a self, key: &'a SpatialKey) -> BoxFuture<'a, Result<Vec<SpatialEntity>, LoadError>>;

    fn cancel_current_load(&self);

    fn active_key(&self) -> Option<SpatialKey>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub endpoints: Endpoints,
    pub id_field: String,
    pub heat_scale: Option<HeatScale>,
    pub selected_date: String,
    pub ttl: Duration,
    pub max_retries: u32,
    pub progressive: bool,
    pub batch_size: usize,
}

#[derive(Debug, Default)]
struct ActiveLoad {
    key: Option<SpatialKey>,
    /// Bumped by every load and every cancellation; continuations holding an
    /// older value are stale.
    generation: u64,
    displayed: Option<String>,
}

pub struct RegionPipeline {
    coordinator: CacheCoordinator,
    sink: Arc<dyn EntitySink>,
    settings: PipelineSettings,
    active: Mutex<ActiveLoad>,
    selected_date: Mutex<String>,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl std::fmt::Debug for RegionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionPipeline")
            .field("active", &*self.active.lock())
            .field("selected_date", &*self.selected_date.lock())
            .finish()
    }
}

struct RegionRequests {
    buildings: LoadRequest,
    heat: Option<LoadRequest>,
}

impl RegionPipeline {
    pub fn new(coordinator: CacheCoordinator, sink: Arc<dyn EntitySink>, settings: PipelineSettings) -> Self {
        let selected_date = Mutex::new(settings.selected_date.clone());
        Self {
            coordinator,
            sink,
            settings,
            active: Mutex::new(ActiveLoad::default()),
            selected_date,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }

    pub fn selected_date(&self) -> String {
        self.selected_date.lock().clone()
    }

    /// Affects loads started afterwards.
    pub fn set_selected_date(&self, date: impl Into<String>) {
        *self.selected_date.lock() = date.into();
    }

    /// Sink collection holding a region's entities.
    pub fn collection_name(key: &SpatialKey) -> String {
        key.to_string()
    }

    fn requests(&self, key: &SpatialKey, date: &str, priority: Priority) -> RegionRequests {
        let options = LoadOptions {
            cache_enabled: true,
            ttl: self.settings.ttl,
            max_retries: self.settings.max_retries,
            progressive: self.settings.progressive,
            priority,
        };
        let buildings = LoadRequest::new(
            CacheKey::new("buildings", key.clone()),
            self.settings.endpoints.buildings_url(key),
            DataKind::GeoJson,
        )
        .with_options(options.clone());
        // Heat rows are only published per postal code.
        let heat = key.as_postal_code().map(|code| {
            LoadRequest::new(
                CacheKey::new(format!("heat@{date}"), key.clone()),
                self.settings.endpoints.heat_url(code, date),
                DataKind::GeoJson,
            )
            .with_options(options.clone())
        });
        RegionRequests { buildings, heat }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active.lock().generation == generation
    }

    /// Low-priority cache warm-up for a region the camera is passing over.
    pub fn preload_region(&self, key: &SpatialKey) {
        let date = self.selected_date();
        let reqs = self.requests(key, &date, Priority::Low);
        self.coordinator.prefetch(reqs.buildings);
        if let Some(heat) = reqs.heat {
            self.coordinator.prefetch(heat);
        }
    }

    pub async fn load(&self, key: &SpatialKey) -> Result<Vec<SpatialEntity>, LoadError> {
        let generation = {
            let mut active = self.active.lock();
            active.generation += 1;
            active.key = Some(key.clone());
            active.generation
        };
        let date = self.selected_date();
        let reqs = self.requests(key, &date, Priority::High);
        let buildings_url = reqs.buildings.url.clone();
        info!(%key, date = %date, "loading region");

        let heat_load = async {
            match reqs.heat {
                Some(heat) => Some(self.coordinator.load(heat).await),
                None => None,
            }
        };
        let (buildings, heat) = tokio::join!(self.coordinator.load(reqs.buildings), heat_load);

        if !self.is_current(generation) {
            debug!(%key, "discarding stale region response");
            return Err(LoadError::Cancelled);
        }

        let entities = match self.assemble(key, &date, &buildings_url, buildings, heat) {
            Ok(entities) => entities,
            Err(e) => {
                self.finish(generation);
                return Err(e);
            }
        };
        let heat_values = heat_values(&entities);

        self.deliver(key, &entities, generation).await?;
        self.finish(generation);

        info!(%key, entities = entities.len(), with_heat = heat_values.len(), "region loaded");
        if let Some(events) = &self.events {
            let _ = events.send(PipelineEvent::RegionLoaded {
                key: key.clone(),
                entity_count: entities.len(),
                heat_values,
            });
        }
        Ok(entities)
    }

    fn assemble(
        &self,
        key: &SpatialKey,
        date: &str,
        buildings_url: &str,
        buildings: Result<Loaded, LoadError>,
        heat: Option<Result<Loaded, LoadError>>,
    ) -> Result<Vec<SpatialEntity>, LoadError> {
        let buildings = buildings?;
        let mut entities = decode_buildings(&buildings.data, &self.settings.id_field)
            .map_err(|e| e.into_load_error(buildings_url))?;

        match heat {
            Some(Ok(heat)) => match decode_heat(&heat.data, &self.settings.id_field, date) {
                Ok(rows) => {
                    let matched = merge_overlay(&mut entities, &rows, self.settings.heat_scale.as_ref());
                    debug!(%key, rows = rows.len(), matched, "heat overlay merged");
                }
                Err(e) => warn!(%key, error = %e, "heat overlay unreadable; delivering buildings only"),
            },
            Some(Err(e)) if e.is_cancelled() => {}
            Some(Err(e)) => warn!(%key, error = %e, "heat overlay failed; delivering buildings only"),
            None => {}
        }
        Ok(entities)
    }

    async fn deliver(&self, key: &SpatialKey, entities: &[SpatialEntity], generation: u64) -> Result<(), LoadError> {
        let name = Self::collection_name(key);
        {
            let mut active = self.active.lock();
            if active.generation != generation {
                return Err(LoadError::Cancelled);
            }
            if let Some(previous) = active.displayed.replace(name.clone())
                && previous != name
            {
                self.sink.remove(&previous);
            }
        }

        if !self.settings.progressive || entities.len() <= self.settings.batch_size {
            self.sink.replace(&name, entities);
            return Ok(());
        }

        for (i, batch) in entities.chunks(self.settings.batch_size).enumerate() {
            if !self.is_current(generation) {
                debug!(%key, delivered_batches = i, "progressive delivery superseded");
                return Err(LoadError::Cancelled);
            }
            if i == 0 {
                self.sink.replace(&name, batch);
            } else {
                self.sink.append(&name, batch);
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn finish(&self, generation: u64) {
        let mut active = self.active.lock();
        if active.generation == generation {
            active.key = None;
        }
    }

    pub fn cancel_current_load(&self) {
        let key = {
            let mut active = self.active.lock();
            active.generation += 1;
            active.key.take()
        };
        let Some(key) = key else {
            return;
        };
        let reqs = self.requests(&key, &self.selected_date(), Priority::High);
        self.coordinator.cancel(&reqs.buildings.key);
        if let Some(heat) = reqs.heat {
            self.coordinator.cancel(&heat.key);
        }
        info!(%key, "region load cancelled");
    }

    pub fn active_key(&self) -> Option<SpatialKey> {
        self.active.lock().key.clone()
    }
}

fn heat_values(entities: &[SpatialEntity]) -> Vec<f64> {
    entities
        .iter()
        .filter_map(|e| e.overlay.as_ref().map(|o| o.heat_exposure))
        .collect()
}

impl RegionLoader for RegionPipeline {
    fn load_region<'a>(&'a self, key: &'a SpatialKey) -> BoxFuture<'a, Result<Vec<SpatialEntity>, LoadError>> {
        Box::pin(self.load(key))
    }

    fn cancel_current_load(&self) {
        RegionPipeline::cancel_current_load(self);
    }

    fn active_key(&self) -> Option<SpatialKey> {
        RegionPipeline::active_key(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use foundation::time::SystemClock;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use super::{PipelineEvent, PipelineSettings, RegionPipeline};
    use crate::config::Endpoints;
    use crate::coordinator::{CacheCoordinator, CoordinatorSettings};
    use crate::entity::HeatScale;
    use crate::error::{FetchError, LoadError};
    use crate::fetch::MemoryFetcher;
    use crate::request::SpatialKey;
    use crate::sink::MemorySink;
    use crate::store::MemoryStore;

    const DATE: &str = "2024-06-26";

    fn endpoints() -> Endpoints {
        Endpoints {
            buildings: "http://t/buildings?postinumero={postal_code}".into(),
            heat: "http://t/heat?postinumero={postal_code}&date={date}".into(),
            tiles: "http://t/tiles/{z}/{x}/{y}".into(),
            regions: "http://t/regions".into(),
        }
    }

    fn buildings_url(code: &str) -> String {
        format!("http://t/buildings?postinumero={code}")
    }

    fn heat_url(code: &str) -> String {
        format!("http://t/heat?postinumero={code}&date={DATE}")
    }

    fn building(id: &str, x: f64) -> Value {
        json!({
            "type": "Feature",
            "properties": {"vtj_prt": id, "postinumero": "00100"},
            "geometry": {"type": "Polygon", "coordinates": [[[x, 60.17], [x + 0.001, 60.17], [x + 0.001, 60.171], [x, 60.17]]]}
        })
    }

    fn collection(n: usize) -> Value {
        let features: Vec<Value> = (0..n).map(|i| building(&format!("b{i}"), 24.9 + i as f64 * 0.001)).collect();
        json!({"type": "FeatureCollection", "features": features})
    }

    struct Harness {
        pipeline: RegionPipeline,
        fetcher: Arc<MemoryFetcher>,
        sink: Arc<MemorySink>,
    }

    fn harness(progressive: bool, batch_size: usize) -> Harness {
        let fetcher = Arc::new(MemoryFetcher::new());
        let coordinator = CacheCoordinator::new(
            fetcher.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            CoordinatorSettings {
                retry_base_delay: Duration::from_millis(5),
                ..CoordinatorSettings::default()
            },
        );
        let sink = Arc::new(MemorySink::new());
        let pipeline = RegionPipeline::new(
            coordinator,
            sink.clone(),
            PipelineSettings {
                endpoints: endpoints(),
                id_field: "vtj_prt".into(),
                heat_scale: Some(HeatScale {
                    min_temp_k: 293.15,
                    max_temp_k: 313.15,
                }),
                selected_date: DATE.into(),
                ttl: Duration::from_secs(3600),
                max_retries: 1,
                progressive,
                batch_size,
            },
        );
        Harness { pipeline, fetcher, sink }
    }

    #[tokio::test(start_paused = true)]
    async fn merges_heat_for_selected_date() {
        let h = harness(false, 100);
        h.fetcher.insert_json(buildings_url("00100"), &collection(3));
        h.fetcher.insert_json(
            heat_url("00100"),
            &json!([
                {"vtj_prt": "b0", "date": DATE, "avgheatexposure": 0.5},
                {"vtj_prt": "b1", "date": "2023-06-23", "avgheatexposure": 0.9},
                {"vtj_prt": "b2", "date": DATE, "avgheatexposure": 0.25, "avg_temp_c": 31.0}
            ]),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pipeline = h.pipeline.with_events(tx);
        let key = SpatialKey::postal_code("00100");

        let entities = pipeline.load(&key).await.unwrap();

        let temps: Vec<Option<f64>> = entities
            .iter()
            .map(|e| e.overlay.as_ref().and_then(|o| o.temperature_c))
            .collect();
        assert!((temps[0].unwrap() - 30.0).abs() < 1e-9, "derived from exposure");
        assert_eq!(temps[1], None);
        assert_eq!(temps[2], Some(31.0));
        assert_eq!(h.sink.entity_count("posno:00100"), 3);
        assert_eq!(pipeline.active_key(), None);

        assert_eq!(
            rx.recv().await,
            Some(PipelineEvent::RegionLoaded {
                key,
                entity_count: 3,
                heat_values: vec![0.5, 0.25],
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_failure_degrades_to_buildings_only() {
        let h = harness(false, 100);
        h.fetcher.insert_json(buildings_url("00100"), &collection(2));
        h.fetcher.insert_error(heat_url("00100"), FetchError::Status(500));

        let entities = h.pipeline.load(&SpatialKey::postal_code("00100")).await.unwrap();
        assert_eq!(entities.len(), 2);
        assert!(entities.iter().all(|e| e.overlay.is_none()));
        assert_eq!(h.sink.entity_count("posno:00100"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn primary_failure_fails_the_load() {
        let h = harness(false, 100);
        h.fetcher.insert_error(buildings_url("00100"), FetchError::Status(404));
        h.fetcher.insert_json(heat_url("00100"), &json!([]));

        let err = h.pipeline.load(&SpatialKey::postal_code("00100")).await.unwrap_err();
        assert!(matches!(err, LoadError::Http { status: 404, .. }));
        assert!(h.sink.names().is_empty());
        assert_eq!(h.pipeline.active_key(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_load_is_discarded_even_if_it_finishes_last() {
        let h = harness(false, 100);
        let pipeline = Arc::new(h.pipeline);
        for code in ["00100", "00120"] {
            h.fetcher.insert_json(buildings_url(code), &collection(1));
            h.fetcher.insert_json(heat_url(code), &json!([]));
        }
        h.fetcher.set_delay(buildings_url("00100"), Duration::from_millis(800));
        h.fetcher.set_delay(buildings_url("00120"), Duration::from_millis(100));

        let a = {
            let p = pipeline.clone();
            tokio::spawn(async move { p.load(&SpatialKey::postal_code("00100")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = pipeline.load(&SpatialKey::postal_code("00120")).await;

        assert!(b.is_ok());
        assert_eq!(a.await.unwrap(), Err(LoadError::Cancelled));
        assert_eq!(h.sink.names(), vec!["posno:00120".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_current_load_aborts_fetches() {
        let h = harness(false, 100);
        let pipeline = Arc::new(h.pipeline);
        h.fetcher.insert_json(buildings_url("00100"), &collection(1));
        h.fetcher.insert_json(heat_url("00100"), &json!([]));
        h.fetcher.set_delay(buildings_url("00100"), Duration::from_secs(5));
        let key = SpatialKey::postal_code("00100");

        let pending = {
            let p = pipeline.clone();
            let key = key.clone();
            tokio::spawn(async move { p.load(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pipeline.active_key(), Some(key));

        pipeline.cancel_current_load();
        assert_eq!(pipeline.active_key(), None);
        assert_eq!(pending.await.unwrap(), Err(LoadError::Cancelled));
        assert_eq!(pipeline.coordinator().in_flight_count(), 0);
        assert!(h.sink.names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn progressive_delivery_batches() {
        let h = harness(true, 2);
        h.fetcher.insert_json(buildings_url("00100"), &collection(5));
        h.fetcher.insert_json(heat_url("00100"), &json!([]));

        h.pipeline.load(&SpatialKey::postal_code("00100")).await.unwrap();
        let c = h.sink.collection("posno:00100").unwrap();
        assert_eq!(c.entities.len(), 5);
        assert_eq!(c.batches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn preload_warms_cache_without_touching_the_sink() {
        let h = harness(false, 100);
        h.fetcher.insert_json(buildings_url("00990"), &collection(1));
        h.fetcher.insert_json(heat_url("00990"), &json!([]));
        let key = SpatialKey::postal_code("00990");

        h.pipeline.preload_region(&key);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.sink.names().is_empty());

        h.pipeline.load(&key).await.unwrap();
        assert_eq!(h.fetcher.calls(&buildings_url("00990")), 1);
        assert_eq!(h.fetcher.calls(&heat_url("00990")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn date_change_uses_a_distinct_overlay_key() {
        let h = harness(false, 100);
        h.fetcher.insert_json(buildings_url("00100"), &collection(1));
        h.fetcher.insert_json(heat_url("00100"), &json!([]));
        let other = "http://t/heat?postinumero=00100&date=2023-06-23";
        h.fetcher.insert_json(other, &json!([{"vtj_prt": "b0", "date": "2023-06-23", "avgheatexposure": 1.0}]));
        let key = SpatialKey::postal_code("00100");

        h.pipeline.load(&key).await.unwrap();
        h.pipeline.set_selected_date("2023-06-23");
        let entities = h.pipeline.load(&key).await.unwrap();

        assert_eq!(h.fetcher.calls(&buildings_url("00100")), 1);
        assert_eq!(h.fetcher.calls(other), 1);
        assert_eq!(entities[0].overlay.as_ref().map(|o| o.heat_exposure), Some(1.0));
    }
}

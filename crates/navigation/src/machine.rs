//! Click-to-navigate session: camera flight and region load run together,
//! with latest-wins queuing and cancellation that restores the prior view.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::Shared;
use parking_lot::Mutex;
use streaming::entity::SpatialEntity;
use streaming::error::LoadError;
use streaming::pipeline::RegionLoader;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::camera::{Camera, FlightOutcome, ViewFlags, ViewSnapshot};
use crate::state::{ClickProcessingState, NavigationEvent, NavigationTarget, Stage};

#[derive(Debug, Clone, PartialEq)]
pub struct MachineSettings {
    /// How long `Complete` is shown before returning to `Idle`.
    pub complete_reset_delay: Duration,
    /// Upper bound on waiting for the camera to acknowledge a cancelled flight.
    pub flight_cancel_timeout: Duration,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            complete_reset_delay: Duration::from_millis(1_000),
            flight_cancel_timeout: Duration::from_millis(500),
        }
    }
}

type FlightDone = Shared<oneshot::Receiver<FlightOutcome>>;

#[derive(Default)]
struct Session {
    state: ClickProcessingState,
    /// Bumped whenever a session starts, retries, or is torn down.
    generation: u64,
    target: Option<NavigationTarget>,
    flight: Option<(u64, FlightDone)>,
    flight_done: bool,
    load_done: bool,
    task: Option<JoinHandle<()>>,
    reset: Option<JoinHandle<()>>,
}

impl Session {
    fn abort_tasks(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(reset) = self.reset.take() {
            reset.abort();
        }
    }
}

struct Inner {
    camera: Arc<dyn Camera>,
    flags: Arc<dyn ViewFlags>,
    loader: Arc<dyn RegionLoader>,
    settings: MachineSettings,
    session: Mutex<Session>,
    state_tx: watch::Sender<ClickProcessingState>,
    events: Mutex<Option<mpsc::UnboundedSender<NavigationEvent>>>,
}

/// Cheap handle; clones drive the same session.
#[derive(Clone)]
pub struct NavigationStateMachine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NavigationStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.inner.session.lock();
        f.debug_struct("NavigationStateMachine")
            .field("stage", &s.state.stage)
            .field("generation", &s.generation)
            .finish()
    }
}

impl NavigationStateMachine {
    pub fn new(
        camera: Arc<dyn Camera>,
        flags: Arc<dyn ViewFlags>,
        loader: Arc<dyn RegionLoader>,
        settings: MachineSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ClickProcessingState::default());
        Self {
            inner: Arc::new(Inner {
                camera,
                flags,
                loader,
                settings,
                session: Mutex::new(Session::default()),
                state_tx,
                events: Mutex::new(None),
            }),
        }
    }

    /// Stage transitions from now on; replaces any earlier subscriber.
    pub fn events(&self) -> mpsc::UnboundedReceiver<NavigationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.events.lock() = Some(tx);
        rx
    }

    pub fn subscribe(&self) -> watch::Receiver<ClickProcessingState> {
        self.inner.state_tx.subscribe()
    }

    pub fn state(&self) -> ClickProcessingState {
        self.inner.session.lock().state.clone()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.session.lock().state.is_processing
    }

    pub fn can_cancel(&self) -> bool {
        self.inner.session.lock().state.can_cancel
    }

    /// Starts navigating to `target`, or queues it when a session is busy.
    /// Only the most recent queued target is kept.
    pub fn click(&self, target: NavigationTarget) {
        let mut s = self.inner.session.lock();
        if matches!(s.state.stage, Stage::Loading | Stage::Animating) {
            debug!(key = %target.key, "navigation queued behind active session");
            s.state.pending_navigation = Some(target);
            self.inner.publish(&s);
            return;
        }
        self.inner.start(&mut s, target);
    }

    /// Re-runs the failed load without flying again. No-op unless in `Error`.
    pub fn retry(&self) -> bool {
        let mut s = self.inner.session.lock();
        if s.state.stage != Stage::Error {
            return false;
        }
        let Some(target) = s.target.clone() else {
            return false;
        };
        s.abort_tasks();
        s.generation += 1;
        s.flight = None;
        s.flight_done = true;
        s.load_done = false;
        s.state.stage = Stage::Loading;
        s.state.is_processing = true;
        s.state.can_cancel = false;
        s.state.error = None;
        self.inner.emit(&s);
        self.inner.publish(&s);
        info!(key = %target.key, "retrying region load");

        let inner = self.inner.clone();
        let generation = s.generation;
        s.task = Some(tokio::spawn(async move {
            let result = inner.loader.load_region(&target.key).await;
            inner.load_finished(generation, result);
        }));
        true
    }

    /// Leaves `Error`, putting back the view captured before the click.
    pub fn dismiss_error(&self) -> bool {
        let mut s = self.inner.session.lock();
        if s.state.stage != Stage::Error {
            return false;
        }
        if let Some(view) = s.state.previous_view.clone() {
            self.inner.restore(&view);
        }
        self.inner.reset_idle(&mut s);
        true
    }

    /// Aborts the load, stops the flight, and restores the previous view.
    /// Returns false (and does nothing) when the session is not cancellable.
    pub async fn cancel(&self) -> bool {
        let (flight, previous) = {
            let mut s = self.inner.session.lock();
            if !s.state.can_cancel {
                debug!(stage = ?s.state.stage, "cancel ignored");
                return false;
            }
            s.generation += 1;
            s.abort_tasks();
            s.state.can_cancel = false;
            self.inner.publish(&s);
            (s.flight.take(), s.state.previous_view.clone())
        };

        self.inner.loader.cancel_current_load();
        if let Some((id, done)) = flight {
            self.inner.camera.cancel_flight(id);
            match tokio::time::timeout(self.inner.settings.flight_cancel_timeout, done).await {
                Ok(_) => debug!(flight = id, "flight stopped"),
                Err(_) => warn!(flight = id, "flight did not acknowledge cancellation, restoring anyway"),
            }
        }

        // A click may have been queued while the flight was being stopped.
        let mut s = self.inner.session.lock();
        let pending = s.state.pending_navigation.take();
        if let Some(view) = &previous {
            self.inner.restore(view);
        }
        self.inner.reset_idle(&mut s);
        info!("navigation cancelled");
        if let Some(next) = pending {
            debug!(key = %next.key, "dispatching navigation queued during cancel");
            self.inner.start(&mut s, next);
        }
        true
    }

    /// Stops every session task and timer.
    pub fn shutdown(&self) {
        let mut s = self.inner.session.lock();
        s.generation += 1;
        s.abort_tasks();
    }
}

impl Inner {
    fn publish(&self, s: &Session) {
        self.state_tx.send_replace(s.state.clone());
    }

    fn emit(&self, s: &Session) {
        debug!(stage = ?s.state.stage, can_cancel = s.state.can_cancel, "navigation stage");
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(NavigationEvent::Stage {
                key: s.state.spatial_key.clone(),
                stage: s.state.stage,
                can_cancel: s.state.can_cancel,
            });
        }
    }

    fn restore(&self, view: &ViewSnapshot) {
        self.camera.set_pose(view.pose);
        self.flags.restore(&view.flags);
    }

    fn reset_idle(&self, s: &mut Session) {
        s.abort_tasks();
        s.generation += 1;
        s.target = None;
        s.flight = None;
        s.state = ClickProcessingState::default();
        self.emit(s);
        self.publish(s);
    }

    fn start(self: &Arc<Self>, s: &mut Session, target: NavigationTarget) {
        s.abort_tasks();
        s.generation += 1;
        let previous = ViewSnapshot {
            pose: self.camera.pose(),
            flags: self.flags.capture(),
        };
        s.flight = None;
        s.flight_done = false;
        s.load_done = false;
        s.state = ClickProcessingState {
            is_processing: true,
            spatial_key: Some(target.key.clone()),
            display_name: target.display_name.clone(),
            stage: Stage::Loading,
            can_cancel: false,
            error: None,
            previous_view: Some(previous),
            pending_navigation: None,
        };
        s.target = Some(target.clone());
        info!(key = %target.key, name = ?target.display_name, "navigation started");
        self.emit(s);
        self.publish(s);

        let generation = s.generation;
        s.task = Some(tokio::spawn(self.clone().run_session(generation, target)));
    }

    async fn run_session(self: Arc<Self>, generation: u64, target: NavigationTarget) {
        let flight = self.camera.fly_to(target.destination);
        let done = flight.done.shared();
        {
            let mut s = self.session.lock();
            if s.generation != generation {
                drop(s);
                self.camera.cancel_flight(flight.id);
                return;
            }
            s.flight = Some((flight.id, done.clone()));
            s.state.stage = Stage::Animating;
            s.state.can_cancel = true;
            self.emit(&s);
            self.publish(&s);
        }

        let flight_leg = async {
            let outcome = done.await.ok();
            self.flight_finished(generation, outcome);
        };
        let load_leg = async {
            let result = self.loader.load_region(&target.key).await;
            self.load_finished(generation, result);
        };
        tokio::join!(flight_leg, load_leg);
    }

    fn flight_finished(self: &Arc<Self>, generation: u64, outcome: Option<FlightOutcome>) {
        let mut s = self.session.lock();
        if s.generation != generation {
            return;
        }
        debug!(?outcome, "camera flight finished");
        s.flight = None;
        s.flight_done = true;
        if s.load_done && s.state.stage == Stage::Animating {
            self.complete(&mut s);
        }
    }

    fn load_finished(self: &Arc<Self>, generation: u64, result: Result<Vec<SpatialEntity>, LoadError>) {
        let mut s = self.session.lock();
        if s.generation != generation {
            return;
        }
        match result {
            Ok(entities) => {
                debug!(entities = entities.len(), "region data ready");
                s.load_done = true;
                if s.flight_done {
                    self.complete(&mut s);
                }
            }
            // Cancelled from outside this session; end it quietly.
            Err(e) if e.is_cancelled() => {
                debug!("region load cancelled elsewhere");
                self.reset_idle(&mut s);
            }
            Err(e) => {
                warn!(error = %e, "region load failed");
                s.state.stage = Stage::Error;
                s.state.error = Some(e);
                s.state.is_processing = false;
                s.state.can_cancel = false;
                self.emit(&s);
                self.publish(&s);
                self.dispatch_pending(&mut s);
            }
        }
    }

    fn complete(self: &Arc<Self>, s: &mut Session) {
        s.state.stage = Stage::Complete;
        s.state.is_processing = false;
        s.state.can_cancel = false;
        info!(key = ?s.state.spatial_key, "navigation complete");
        self.emit(s);
        self.publish(s);
        if self.dispatch_pending(s) {
            return;
        }

        let inner = self.clone();
        let generation = s.generation;
        let delay = self.settings.complete_reset_delay;
        s.reset = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut s = inner.session.lock();
            if s.generation == generation && s.state.stage == Stage::Complete {
                s.reset = None;
                inner.reset_idle(&mut s);
            }
        }));
    }

    fn dispatch_pending(self: &Arc<Self>, s: &mut Session) -> bool {
        match s.state.pending_navigation.take() {
            Some(next) => {
                debug!(key = %next.key, "dispatching queued navigation");
                self.start(s, next);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use foundation::time::SystemClock;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use streaming::config::Endpoints;
    use streaming::coordinator::{CacheCoordinator, CoordinatorSettings};
    use streaming::entity::HeatScale;
    use streaming::error::LoadError;
    use streaming::fetch::MemoryFetcher;
    use streaming::pipeline::{PipelineSettings, RegionPipeline};
    use streaming::request::SpatialKey;
    use streaming::sink::MemorySink;
    use streaming::store::MemoryStore;
    use tokio::sync::mpsc;
    use tokio::time::{Instant, sleep};

    use super::{MachineSettings, NavigationStateMachine};
    use crate::camera::{Camera, CameraPose, MemoryCamera, MemoryFlags, ViewFlags};
    use crate::state::{ClickProcessingState, NavigationEvent, NavigationTarget, Stage};

    const DATE: &str = "2024-06-26";

    fn buildings_url(code: &str) -> String {
        format!("http://t/buildings?postinumero={code}")
    }

    fn heat_url(code: &str) -> String {
        format!("http://t/heat?postinumero={code}&date={DATE}")
    }

    fn buildings(code: &str, ids: &[&str]) -> Value {
        let features: Vec<Value> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let x = 24.93 + i as f64 * 0.001;
                json!({
                    "type": "Feature",
                    "properties": {"vtj_prt": id, "postinumero": code},
                    "geometry": {"type": "Polygon", "coordinates": [[[x, 60.17], [x + 0.0005, 60.17], [x, 60.1705], [x, 60.17]]]}
                })
            })
            .collect();
        json!({"type": "FeatureCollection", "features": features})
    }

    fn start_pose() -> CameraPose {
        CameraPose::looking_down(24.94, 60.17, 30_000.0)
    }

    fn target(code: &str) -> NavigationTarget {
        NavigationTarget::new(SpatialKey::postal_code(code), [24.93, 60.17], 1_500.0)
    }

    struct Harness {
        machine: NavigationStateMachine,
        camera: Arc<MemoryCamera>,
        flags: Arc<MemoryFlags>,
        fetcher: Arc<MemoryFetcher>,
        sink: Arc<MemorySink>,
        pipeline: Arc<RegionPipeline>,
        events: mpsc::UnboundedReceiver<NavigationEvent>,
    }

    fn harness(flight: Option<Duration>) -> Harness {
        let fetcher = Arc::new(MemoryFetcher::new());
        let coordinator = CacheCoordinator::new(
            fetcher.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            CoordinatorSettings::default(),
        );
        let sink = Arc::new(MemorySink::new());
        let pipeline = Arc::new(RegionPipeline::new(
            coordinator,
            sink.clone(),
            PipelineSettings {
                endpoints: Endpoints {
                    buildings: "http://t/buildings?postinumero={postal_code}".into(),
                    heat: "http://t/heat?postinumero={postal_code}&date={date}".into(),
                    ..Endpoints::default()
                },
                id_field: "vtj_prt".into(),
                heat_scale: Some(HeatScale {
                    min_temp_k: 285.0,
                    max_temp_k: 320.0,
                }),
                selected_date: DATE.into(),
                ttl: Duration::from_secs(3600),
                max_retries: 0,
                progressive: false,
                batch_size: 500,
            },
        ));
        let camera = Arc::new(MemoryCamera::new(start_pose(), flight));
        let flags = Arc::new(MemoryFlags::new());
        flags.set("buildings", true);
        flags.set("grid", false);
        let machine = NavigationStateMachine::new(camera.clone(), flags.clone(), pipeline.clone(), MachineSettings::default());
        let events = machine.events();
        Harness {
            machine,
            camera,
            flags,
            fetcher,
            sink,
            pipeline,
            events,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<NavigationEvent>) -> Vec<(Option<String>, Stage, bool)> {
        let mut out = Vec::new();
        while let Ok(NavigationEvent::Stage { key, stage, can_cancel }) = rx.try_recv() {
            out.push((key.map(|k| k.to_string()), stage, can_cancel));
        }
        out
    }

    fn stages(events: &[(Option<String>, Stage, bool)]) -> Vec<(Stage, bool)> {
        events.iter().map(|(_, s, c)| (*s, *c)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn region_click_runs_through_every_stage() {
        let mut h = harness(Some(Duration::from_secs(2)));
        h.fetcher.insert_json(buildings_url("00100"), &buildings("00100", &["b1", "b2"]));
        h.fetcher.insert_json(
            heat_url("00100"),
            &json!([
                {"vtj_prt": "b1", "date": DATE, "avgheatexposure": 0.4},
                {"vtj_prt": "b2", "date": "2023-06-23", "avgheatexposure": 0.8}
            ]),
        );
        h.fetcher.set_delay(buildings_url("00100"), Duration::from_millis(500));

        h.machine.click(target("00100"));
        let state = h.machine.state();
        assert_eq!(state.stage, Stage::Loading);
        assert!(state.is_processing && !state.can_cancel);
        assert_eq!(state.previous_view.map(|v| v.pose), Some(start_pose()));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(
            stages(&drain(&mut h.events)),
            vec![
                (Stage::Loading, false),
                (Stage::Animating, true),
                (Stage::Complete, false),
                (Stage::Idle, false),
            ]
        );
        assert_eq!(h.machine.state(), ClickProcessingState::default());

        let shown = h.sink.collection("posno:00100").unwrap();
        let heat: Vec<Option<f64>> = shown
            .entities
            .iter()
            .map(|e| e.overlay.as_ref().map(|o| o.heat_exposure))
            .collect();
        assert_eq!(heat, vec![Some(0.4), None]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_load_still_completes_after_flight() {
        let mut h = harness(Some(Duration::from_millis(300)));
        h.fetcher.insert_json(buildings_url("00100"), &buildings("00100", &["b1"]));
        h.fetcher.set_delay(buildings_url("00100"), Duration::from_secs(2));

        h.machine.click(target("00100"));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.machine.state().stage, Stage::Animating);
        assert!(h.machine.can_cancel());

        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(h.machine.state().stage, Stage::Complete);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.machine.state().stage, Stage::Idle);
        assert_eq!(stages(&drain(&mut h.events)).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_restores_camera_flags_and_state() {
        let mut h = harness(None);
        h.fetcher.insert_json(buildings_url("00100"), &buildings("00100", &["b1"]));
        h.fetcher.set_delay(buildings_url("00100"), Duration::from_secs(10));
        let before_flags = h.flags.capture();

        h.machine.click(target("00100"));
        sleep(Duration::from_millis(10)).await;
        assert!(h.machine.can_cancel());
        assert_ne!(h.camera.pose(), start_pose());
        h.flags.set("grid", true);

        assert!(h.machine.cancel().await);
        assert_eq!(h.machine.state(), ClickProcessingState::default());
        assert_eq!(h.camera.pose(), start_pose());
        assert_eq!(h.flags.capture(), before_flags);
        assert_eq!(h.camera.cancelled_flights().len(), 1);
        assert_eq!(h.pipeline.active_key(), None);

        assert!(!h.machine.cancel().await);
        sleep(Duration::from_secs(20)).await;
        assert!(h.sink.collection("posno:00100").is_none());
        let seen = drain(&mut h.events);
        assert!(seen.iter().all(|(_, s, _)| *s != Stage::Error));
        assert_eq!(seen.last().map(|e| e.1), Some(Stage::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_gives_up_waiting_for_a_stuck_flight() {
        let h = harness(None);
        h.camera.set_ack_cancel(false);
        h.fetcher.insert_json(buildings_url("00100"), &buildings("00100", &["b1"]));

        h.machine.click(target("00100"));
        sleep(Duration::from_millis(10)).await;
        let started = Instant::now();
        assert!(h.machine.cancel().await);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(h.camera.pose(), start_pose());
        assert_eq!(h.machine.state().stage, Stage::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn click_during_cancel_wait_starts_after_restore() {
        let h = harness(None);
        h.camera.set_ack_cancel(false);
        h.fetcher.insert_json(buildings_url("00100"), &buildings("00100", &["b1"]));
        h.fetcher.set_delay(buildings_url("00100"), Duration::from_secs(10));
        h.fetcher.insert_json(buildings_url("00120"), &buildings("00120", &["b2"]));

        h.machine.click(target("00100"));
        sleep(Duration::from_millis(10)).await;
        let machine = h.machine.clone();
        let cancelling = tokio::spawn(async move { machine.cancel().await });
        sleep(Duration::from_millis(100)).await;
        h.machine.click(target("00120"));
        assert_eq!(
            h.machine.state().pending_navigation.map(|t| t.key),
            Some(SpatialKey::postal_code("00120"))
        );

        assert!(cancelling.await.unwrap());
        sleep(Duration::from_millis(50)).await;
        let state = h.machine.state();
        assert_eq!(state.spatial_key, Some(SpatialKey::postal_code("00120")));
        assert_eq!(state.stage, Stage::Animating);
        assert_eq!(state.pending_navigation, None);
        assert_eq!(state.previous_view.map(|v| v.pose), Some(start_pose()));
        assert_eq!(h.camera.destinations().len(), 2);
        assert_eq!(h.fetcher.calls(&buildings_url("00120")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_a_no_op_when_not_cancellable() {
        let h = harness(Some(Duration::from_secs(1)));
        h.fetcher.insert_json(buildings_url("00100"), &buildings("00100", &["b1"]));
        assert!(!h.machine.cancel().await);

        h.machine.click(target("00100"));
        // Still `Loading`: the flight has not started yet.
        assert!(!h.machine.cancel().await);
        assert_eq!(h.machine.state().stage, Stage::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_click_wins() {
        let mut h = harness(Some(Duration::from_secs(1)));
        for code in ["00100", "00120", "00130"] {
            h.fetcher.insert_json(buildings_url(code), &buildings(code, &["b1"]));
        }

        h.machine.click(target("00100"));
        sleep(Duration::from_millis(100)).await;
        h.machine.click(target("00120"));
        h.machine.click(target("00130"));
        assert_eq!(
            h.machine.state().pending_navigation.map(|t| t.key),
            Some(SpatialKey::postal_code("00130"))
        );

        sleep(Duration::from_secs(5)).await;
        let keys: Vec<Option<String>> = drain(&mut h.events)
            .into_iter()
            .filter(|(_, s, _)| *s == Stage::Complete)
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(keys, vec![Some("posno:00100".to_string()), Some("posno:00130".to_string())]);
        assert_eq!(h.camera.destinations().len(), 2);
        assert_eq!(h.sink.names(), vec!["posno:00130".to_string()]);
        assert_eq!(h.fetcher.calls(&buildings_url("00120")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_can_be_retried_without_flying() {
        let mut h = harness(Some(Duration::from_millis(200)));
        assert!(!h.machine.retry());

        h.machine.click(target("00100"));
        sleep(Duration::from_secs(1)).await;
        let state = h.machine.state();
        assert_eq!(state.stage, Stage::Error);
        assert!(matches!(state.error, Some(LoadError::Http { status: 404, .. })));
        assert!(state.previous_view.is_some());
        assert!(!state.can_cancel);

        h.fetcher.insert_json(buildings_url("00100"), &buildings("00100", &["b1"]));
        assert!(h.machine.retry());
        assert!(!h.machine.retry());
        sleep(Duration::from_secs(3)).await;

        assert_eq!(h.camera.destinations().len(), 1);
        assert_eq!(h.fetcher.calls(&buildings_url("00100")), 2);
        assert_eq!(
            stages(&drain(&mut h.events)),
            vec![
                (Stage::Loading, false),
                (Stage::Animating, true),
                (Stage::Error, false),
                (Stage::Loading, false),
                (Stage::Complete, false),
                (Stage::Idle, false),
            ]
        );
        assert_eq!(h.sink.entity_count("posno:00100"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dismissing_an_error_restores_the_view() {
        let h = harness(Some(Duration::from_millis(200)));
        h.machine.click(target("00100"));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.machine.state().stage, Stage::Error);
        assert_ne!(h.camera.pose(), start_pose());

        assert!(h.machine.dismiss_error());
        assert_eq!(h.camera.pose(), start_pose());
        assert_eq!(h.machine.state(), ClickProcessingState::default());
        assert!(!h.machine.dismiss_error());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_channel_tracks_the_session() {
        let h = harness(Some(Duration::from_millis(200)));
        h.fetcher.insert_json(buildings_url("00100"), &buildings("00100", &["b1"]));
        let mut rx = h.machine.subscribe();
        h.machine.click(target("00100").with_display_name("Helsinki keskusta"));
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.display_name.as_deref(), Some("Helsinki keskusta"));
        assert_eq!(seen.spatial_key, Some(SpatialKey::postal_code("00100")));
    }
}

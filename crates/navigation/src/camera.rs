//! Camera and UI-flag seams consumed by the navigation layer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use foundation::bounds::GeoRect;
use foundation::math::{Ecef, Geodetic};
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Camera position plus orientation in radians.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CameraPose {
    pub position: Ecef,
    pub heading: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl CameraPose {
    /// Looking straight down from `altitude_m` above `[lon, lat]`.
    pub fn looking_down(lon: f64, lat: f64, altitude_m: f64) -> Self {
        Self {
            position: Geodetic::from_degrees(lon, lat, altitude_m).to_ecef(),
            heading: 0.0,
            pitch: -std::f64::consts::FRAC_PI_2,
            roll: 0.0,
        }
    }
}

/// Camera pose plus named UI visibility flags, captured before a click.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub pose: CameraPose,
    pub flags: BTreeMap<String, bool>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FlightDestination {
    pub lon: f64,
    pub lat: f64,
    pub altitude_m: f64,
}

impl FlightDestination {
    pub fn pose(&self) -> CameraPose {
        CameraPose::looking_down(self.lon, self.lat, self.altitude_m)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlightOutcome {
    Completed,
    Cancelled,
}

/// A started camera flight. `done` resolves once the camera finishes or
/// acknowledges cancellation.
#[derive(Debug)]
pub struct Flight {
    pub id: u64,
    pub done: oneshot::Receiver<FlightOutcome>,
}

pub trait Camera: Send + Sync {
    fn pose(&self) -> CameraPose;

    fn set_pose(&self, pose: CameraPose);

    /// Ground rectangle currently in view; `None` when the camera looks past
    /// the horizon.
    fn view_rectangle(&self) -> Option<GeoRect>;

    fn fly_to(&self, destination: FlightDestination) -> Flight;

    fn cancel_flight(&self, id: u64);
}

/// UI visibility flags that a cancelled navigation must put back.
pub trait ViewFlags: Send + Sync {
    fn capture(&self) -> BTreeMap<String, bool>;

    fn restore(&self, flags: &BTreeMap<String, bool>);
}

#[derive(Debug)]
struct CameraState {
    pose: CameraPose,
    rect: Option<GeoRect>,
    next_id: u64,
    flights: HashMap<u64, oneshot::Sender<FlightOutcome>>,
    destinations: Vec<FlightDestination>,
    cancelled: Vec<u64>,
}

/// Headless camera. A flight jumps to its destination pose immediately and
/// reports completion after `flight_duration`, or only on `complete_flight`
/// when no duration is set.
#[derive(Debug)]
pub struct MemoryCamera {
    state: Arc<Mutex<CameraState>>,
    flight_duration: Option<Duration>,
    ack_cancel: AtomicBool,
}

impl MemoryCamera {
    pub fn new(pose: CameraPose, flight_duration: Option<Duration>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CameraState {
                pose,
                rect: None,
                next_id: 1,
                flights: HashMap::new(),
                destinations: Vec::new(),
                cancelled: Vec::new(),
            })),
            flight_duration,
            ack_cancel: AtomicBool::new(true),
        }
    }

    pub fn set_view_rectangle(&self, rect: Option<GeoRect>) {
        self.state.lock().rect = rect;
    }

    /// When false, `cancel_flight` is recorded but never acknowledged.
    pub fn set_ack_cancel(&self, ack: bool) {
        self.ack_cancel.store(ack, Ordering::SeqCst);
    }

    pub fn complete_flight(&self, id: u64) -> bool {
        finish(&self.state, id, FlightOutcome::Completed)
    }

    pub fn active_flights(&self) -> usize {
        self.state.lock().flights.len()
    }

    pub fn destinations(&self) -> Vec<FlightDestination> {
        self.state.lock().destinations.clone()
    }

    pub fn cancelled_flights(&self) -> Vec<u64> {
        self.state.lock().cancelled.clone()
    }
}

fn finish(state: &Mutex<CameraState>, id: u64, outcome: FlightOutcome) -> bool {
    let sender = state.lock().flights.remove(&id);
    match sender {
        Some(tx) => {
            let _ = tx.send(outcome);
            true
        }
        None => false,
    }
}

impl Camera for MemoryCamera {
    fn pose(&self) -> CameraPose {
        self.state.lock().pose
    }

    fn set_pose(&self, pose: CameraPose) {
        self.state.lock().pose = pose;
    }

    fn view_rectangle(&self) -> Option<GeoRect> {
        self.state.lock().rect
    }

    fn fly_to(&self, destination: FlightDestination) -> Flight {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut s = self.state.lock();
            let id = s.next_id;
            s.next_id += 1;
            s.pose = destination.pose();
            s.destinations.push(destination);
            s.flights.insert(id, tx);
            id
        };
        if let Some(duration) = self.flight_duration {
            let state = self.state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                finish(&state, id, FlightOutcome::Completed);
            });
        }
        Flight { id, done: rx }
    }

    fn cancel_flight(&self, id: u64) {
        self.state.lock().cancelled.push(id);
        if self.ack_cancel.load(Ordering::SeqCst) {
            finish(&self.state, id, FlightOutcome::Cancelled);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryFlags {
    flags: Mutex<BTreeMap<String, bool>>,
}

impl MemoryFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, value: bool) {
        self.flags.lock().insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.flags.lock().get(name).copied()
    }
}

impl ViewFlags for MemoryFlags {
    fn capture(&self) -> BTreeMap<String, bool> {
        self.flags.lock().clone()
    }

    fn restore(&self, flags: &BTreeMap<String, bool>) {
        *self.flags.lock() = flags.clone();
    }
}

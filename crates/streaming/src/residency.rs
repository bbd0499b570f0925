/// Lifecycle of one streamed tile payload.
///
/// Requested → Downloading → Resident → Evicted. Visibility is tracked
/// separately: a hidden tile stays `Resident`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResidencyState {
    Requested,
    Downloading,
    Resident,
    Evicted,
}

impl ResidencyState {
    /// A load for this tile is outstanding.
    pub fn is_loading(self) -> bool {
        matches!(self, ResidencyState::Requested | ResidencyState::Downloading)
    }
}

/// Cap on how many new loads one pass may start.
///
/// A sudden zoom-out can make dozens of tiles visible at once; the budget
/// spreads those loads over several viewport updates. Requests that do not
/// fit are counted as deferred.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameBudget {
    limit: u32,
    spent: u32,
    deferred: u32,
}

impl FrameBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            spent: 0,
            deferred: 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.limit - self.spent
    }

    pub fn spent(&self) -> u32 {
        self.spent
    }

    /// Requests refused since the budget was created.
    pub fn deferred(&self) -> u32 {
        self.deferred
    }

    pub fn is_exhausted(&self) -> bool {
        self.spent >= self.limit
    }

    /// Deducts `units` if they fit; otherwise leaves the budget untouched and
    /// records a deferral.
    pub fn try_consume(&mut self, units: u32) -> bool {
        if units > self.remaining() {
            self.deferred += 1;
            return false;
        }
        self.spent += units;
        true
    }
}

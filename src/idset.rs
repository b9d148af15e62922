//! Rolling window over the 32-bit packet-id space, used on the receive side
//! of a connection to detect duplicates and to know when every id below some
//! bound has been seen (the condition a connection needs to drain).
//!
//! The window is `[low, high)`: ids below `low` are assumed already
//! delivered and compacted away; ids in `[low, high)` that have actually
//! arrived live in a sparse `holes` set; ids at or past `high` (but inside
//! `MaxUnconfirmedIds` of `low`) haven't arrived yet. All comparisons are
//! modular (wrapping) so the set keeps working across a 32-bit wraparound.

use std::collections::BTreeSet;

/// width of the window past `low` an id may be accepted into; bounds the
/// memory a single connection's dedup set can grow to while out of order.
const MAX_UNCONFIRMED_IDS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct IdSet {
    low: u32,
    high: u32,
    holes: BTreeSet<u32>,
}

impl Default for IdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSet {
    /// always anchored at `low = high = 0`, matching the packet-id counter
    /// (`Connection::num_data_received`) it tracks — a connection's id space
    /// always starts at 0, never wherever the first-seen id happens to be.
    pub fn new() -> Self {
        Self {
            low: 0,
            high: 0,
            holes: BTreeSet::new(),
        }
    }

    fn compact(&mut self) {
        while self.low != self.high && self.holes.remove(&self.low) {
            self.low = self.low.wrapping_add(1);
        }
    }

    /// records `id` as received. Ids outside `[low, low + MaxUnconfirmedIds)`
    /// are silently ignored — presumed already delivered and rolled out of
    /// the window.
    pub fn add(&mut self, id: u32) {
        let dist = id.wrapping_sub(self.low);
        let range_len = self.high.wrapping_sub(self.low);
        if dist < range_len {
            if dist == 0 {
                self.low = self.low.wrapping_add(1);
            } else {
                self.holes.insert(id);
            }
            self.compact();
        } else if dist < MAX_UNCONFIRMED_IDS {
            self.high = id.wrapping_add(1);
            if dist == 0 {
                self.low = self.low.wrapping_add(1);
            } else {
                self.holes.insert(id);
            }
            self.compact();
        }
        // else: out of window, treated as already-received, nothing to do
    }

    /// true if `id` has already been recorded (directly, or presumed via
    /// being behind the window).
    pub fn contains(&self, id: u32) -> bool {
        let dist = id.wrapping_sub(self.low);
        let range_len = self.high.wrapping_sub(self.low);
        if dist < range_len {
            self.holes.contains(&id)
        } else if dist < MAX_UNCONFIRMED_IDS {
            false
        } else {
            true
        }
    }

    /// true iff every id strictly below `id` has been received and there is
    /// no pending hole left above it.
    pub fn all_received_below(&self, id: u32) -> bool {
        self.holes.is_empty() && self.low == self.high && self.low == id
    }
}

//! Fairness bookkeeping for "which open connection should the next packet go
//! out on". Conceptually a least-recently-used rotation with a preferred
//! "idle" tier: a connection with nothing outstanding is picked ahead of one
//! that is still waiting on acknowledgements, so load spreads across idle
//! connections before any one of them backs up.
//!
//! `MaxConnectionsPerSession` keeps the connection count small (tens at
//! most), so the O(n) scan in `pick` is simpler than keeping the two tiers
//! in their own trees and is in practice no slower.

use std::collections::{BTreeMap, VecDeque};

/// a send queued while no connection is open yet, not tied to any
/// connection's packet-id sequence until one becomes available.
#[derive(Debug, Clone)]
pub enum PendingPacket {
    Data(Vec<Vec<u8>>),
    Finish,
}

#[derive(Debug, Clone, Copy)]
struct RotationEntry {
    last_picked: u64,
    all_confirmed: bool,
}

#[derive(Debug, Default)]
pub struct SendRotation {
    entries: BTreeMap<u32, RotationEntry>,
    tick: u64,
}

impl SendRotation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn_id: u32, all_confirmed: bool) {
        self.tick += 1;
        self.entries.insert(
            conn_id,
            RotationEntry {
                last_picked: self.tick,
                all_confirmed,
            },
        );
    }

    pub fn remove(&mut self, conn_id: u32) {
        self.entries.remove(&conn_id);
    }

    pub fn contains(&self, conn_id: u32) -> bool {
        self.entries.contains_key(&conn_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_all_confirmed(&mut self, conn_id: u32, all_confirmed: bool) {
        if let Some(e) = self.entries.get_mut(&conn_id) {
            e.all_confirmed = all_confirmed;
        }
    }

    /// picks a connection to send the next packet on, preferring one whose
    /// unconfirmed queue is empty; falls back to the connection that has
    /// gone longest without being picked. Bumps the pick clock for whichever
    /// connection is returned.
    pub fn pick(&mut self) -> Option<u32> {
        let chosen = self
            .entries
            .iter()
            .filter(|(_, e)| e.all_confirmed)
            .min_by_key(|(_, e)| e.last_picked)
            .map(|(id, _)| *id)
            .or_else(|| {
                self.entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_picked)
                    .map(|(id, _)| *id)
            });
        if let Some(id) = chosen {
            self.tick += 1;
            self.entries.get_mut(&id).expect("just found by id").last_picked = self.tick;
        }
        chosen
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }
}

/// Packets waiting to go out. `Offline` holds everything enqueued while no
/// connection is open yet; `Online` is the live per-connection rotation.
#[derive(Debug)]
pub enum SendingQueue {
    Offline(VecDeque<PendingPacket>),
    Online(SendRotation),
}

impl SendingQueue {
    pub fn new_offline() -> Self {
        Self::Offline(VecDeque::new())
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_idle_connections_over_busy_ones() {
        let mut rot = SendRotation::new();
        rot.insert(1, false);
        rot.insert(2, true);
        assert_eq!(rot.pick(), Some(2));
    }

    #[test]
    fn falls_back_to_oldest_pick_when_all_are_busy() {
        let mut rot = SendRotation::new();
        rot.insert(1, false);
        rot.insert(2, false);
        assert_eq!(rot.pick(), Some(1));
        assert_eq!(rot.pick(), Some(2));
        assert_eq!(rot.pick(), Some(1));
    }

    #[test]
    fn becoming_idle_moves_a_connection_to_the_front() {
        let mut rot = SendRotation::new();
        rot.insert(1, false);
        rot.insert(2, false);
        rot.pick(); // bumps 1
        rot.set_all_confirmed(2, true);
        assert_eq!(rot.pick(), Some(2));
    }
}

//! Point-in-time traffic counter tables and delta arithmetic.
//!
//! Snapshots are produced externally once per poll cycle and are immutable
//! from the engine's point of view. Counters are monotonic per source
//! except across an interface disappearance/reappearance boundary; the
//! delta rule below turns such resets into fresh baselines instead of
//! negative deltas.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::Uid;

/// Foreground/background attribution of a per-UID row.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    #[default]
    All,
    Foreground,
    Background,
}

/// Raw traffic counters for one row.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub operations: u64,
}

impl Counters {
    /// Counters carrying only byte values; packet and operation counts are
    /// left at zero.
    #[must_use]
    pub const fn from_bytes(rx_bytes: u64, tx_bytes: u64) -> Self {
        Self {
            rx_bytes,
            rx_packets: 0,
            tx_bytes,
            tx_packets: 0,
            operations: 0,
        }
    }

    /// Combined rx+tx byte total, both directions counted.
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }

    /// Accumulates another row's counters into this one.
    pub fn add(&mut self, other: &Self) {
        self.rx_bytes = self.rx_bytes.saturating_add(other.rx_bytes);
        self.rx_packets = self.rx_packets.saturating_add(other.rx_packets);
        self.tx_bytes = self.tx_bytes.saturating_add(other.tx_bytes);
        self.tx_packets = self.tx_packets.saturating_add(other.tx_packets);
        self.operations = self.operations.saturating_add(other.operations);
    }

    /// Delta against a previous reading of the same row.
    ///
    /// If any field regressed, the source counters were reset (interface
    /// churn) and the current values become a fresh baseline. Never
    /// negative, never clamped to garbage.
    #[must_use]
    pub fn delta_since(&self, previous: &Self) -> Self {
        let reset = self.rx_bytes < previous.rx_bytes
            || self.rx_packets < previous.rx_packets
            || self.tx_bytes < previous.tx_bytes
            || self.tx_packets < previous.tx_packets
            || self.operations < previous.operations;

        if reset {
            return *self;
        }

        Self {
            rx_bytes: self.rx_bytes - previous.rx_bytes,
            rx_packets: self.rx_packets - previous.rx_packets,
            tx_bytes: self.tx_bytes - previous.tx_bytes,
            tx_packets: self.tx_packets - previous.tx_packets,
            operations: self.operations - previous.operations,
        }
    }
}

/// Identity of one snapshot row.
///
/// Interface-level rows carry `Uid::ALL`; per-UID rows carry the owning
/// UID. The metered/roaming/default-network flags are recorded per row so
/// scoping decisions can be made at diff time without re-resolving
/// identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey {
    /// Interface the traffic was observed on.
    pub iface: String,
    /// Owning UID, or `Uid::ALL` for interface-level rows.
    pub uid: Uid,
    /// Foreground/background attribution.
    #[serde(default)]
    pub state: RowState,
    /// Caller-defined traffic tag.
    #[serde(default)]
    pub tag: u32,
    /// Whether the row's network was metered when the bytes moved.
    #[serde(default)]
    pub metered: bool,
    /// Whether the row's network was roaming when the bytes moved.
    #[serde(default)]
    pub roaming: bool,
    /// Whether the row's traffic rode the current default network.
    #[serde(default)]
    pub default_network: bool,
}

impl RowKey {
    /// Interface-level row key with neutral flags.
    #[must_use]
    pub fn iface(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            uid: Uid::ALL,
            state: RowState::All,
            tag: 0,
            metered: false,
            roaming: false,
            default_network: false,
        }
    }

    /// Per-UID row key on the default network.
    #[must_use]
    pub fn uid(iface: impl Into<String>, uid: Uid) -> Self {
        Self {
            iface: iface.into(),
            uid,
            state: RowState::All,
            tag: 0,
            metered: false,
            roaming: false,
            default_network: true,
        }
    }

    /// Marks the row as on or off the default network.
    #[must_use]
    pub fn with_default_network(mut self, default_network: bool) -> Self {
        self.default_network = default_network;
        self
    }
}

/// One keyed row of a snapshot.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub key: RowKey,
    pub counters: Counters,
}

/// An immutable point-in-time table of traffic rows.
///
/// Two kinds exist by convention: interface-level snapshots hold only
/// `Uid::ALL` rows, per-UID snapshots hold attributed rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    rows: Vec<SnapshotRow>,
}

impl TrafficSnapshot {
    /// An empty snapshot.
    #[must_use]
    pub const fn new() -> Self {
        Self { rows: Vec::new() }
    }

    /// Adds a row, combining counters if the key is already present.
    pub fn add_row(&mut self, key: RowKey, counters: Counters) {
        if let Some(existing) = self.rows.iter_mut().find(|row| row.key == key) {
            existing.counters.add(&counters);
        } else {
            self.rows.push(SnapshotRow { key, counters });
        }
    }

    /// Iterates the rows of the snapshot.
    pub fn rows(&self) -> impl Iterator<Item = &SnapshotRow> {
        self.rows.iter()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the snapshot carries no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Per-row delta table against a previous snapshot of the same source.
    ///
    /// Rows absent from the previous snapshot are fresh baselines by the
    /// same rule as a counter reset. Rows that vanished contribute nothing.
    #[must_use]
    pub fn delta_since(&self, previous: &Self) -> Self {
        let mut prior: HashMap<&RowKey, &Counters> = HashMap::with_capacity(previous.rows.len());
        for row in &previous.rows {
            prior.insert(&row.key, &row.counters);
        }

        let rows = self
            .rows
            .iter()
            .map(|row| SnapshotRow {
                key: row.key.clone(),
                counters: match prior.get(&row.key) {
                    Some(prev) => row.counters.delta_since(prev),
                    None => row.counters,
                },
            })
            .collect();

        Self { rows }
    }

    /// Combined rx+tx byte total over all rows.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.rows
            .iter()
            .fold(0u64, |acc, row| acc.saturating_add(row.counters.total_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_delta_is_per_field() {
        let prev = Counters::from_bytes(100, 50);
        let cur = Counters::from_bytes(250, 80);
        let delta = cur.delta_since(&prev);
        assert_eq!(delta.rx_bytes, 150);
        assert_eq!(delta.tx_bytes, 30);
        assert_eq!(delta.total_bytes(), 180);
    }

    #[test]
    fn counter_regression_becomes_fresh_baseline() {
        let prev = Counters::from_bytes(1000, 1000);
        let cur = Counters::from_bytes(40, 2000);
        // rx regressed: the whole row restarts from the current values.
        let delta = cur.delta_since(&prev);
        assert_eq!(delta, cur);
    }

    #[test]
    fn total_bytes_saturates_on_extreme_counters() {
        let counters = Counters::from_bytes(u64::MAX, u64::MAX);
        assert_eq!(counters.total_bytes(), u64::MAX);
    }

    #[test]
    fn duplicate_keys_accumulate() {
        let mut snapshot = TrafficSnapshot::new();
        snapshot.add_row(RowKey::iface("wlan0"), Counters::from_bytes(10, 5));
        snapshot.add_row(RowKey::iface("wlan0"), Counters::from_bytes(2, 3));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.total_bytes(), 20);
    }

    #[test]
    fn snapshot_delta_handles_new_and_vanished_rows() {
        let mut prev = TrafficSnapshot::new();
        prev.add_row(RowKey::iface("wlan0"), Counters::from_bytes(100, 100));
        prev.add_row(RowKey::iface("rmnet0"), Counters::from_bytes(500, 500));

        let mut cur = TrafficSnapshot::new();
        cur.add_row(RowKey::iface("wlan0"), Counters::from_bytes(150, 120));
        // rmnet0 vanished; eth0 is brand new.
        cur.add_row(RowKey::iface("eth0"), Counters::from_bytes(7, 3));

        let delta = cur.delta_since(&prev);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta.total_bytes(), 70 + 10);
    }

    #[test]
    fn interface_churn_never_underflows_aggregate() {
        let mut prev = TrafficSnapshot::new();
        prev.add_row(RowKey::iface("wlan0"), Counters::from_bytes(1 << 40, 1 << 40));

        let mut cur = TrafficSnapshot::new();
        cur.add_row(RowKey::iface("wlan0"), Counters::from_bytes(10, 10));

        let delta = cur.delta_since(&prev);
        assert_eq!(delta.total_bytes(), 20);
    }
}

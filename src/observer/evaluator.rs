//! Delta accumulation and threshold crossing decisions.
//!
//! The evaluator is pure with respect to everything except the request it
//! is handed: it consumes per-pass delta tables, applies template matching
//! and row visibility, and mutates only the request's accumulator. Each
//! request is evaluated in isolation, so one registration can never abort
//! the pass for another.

use std::sync::Arc;

use crate::access::{is_visible, AccessLevel, IdentityAuthority};
use crate::identity::{ActiveIdentities, IdentitySet};
use crate::snapshot::TrafficSnapshot;

use super::registry::UsageRequest;

/// Evaluates usage requests against per-pass snapshot deltas.
pub struct ThresholdEvaluator {
    authority: Arc<dyn IdentityAuthority>,
}

impl ThresholdEvaluator {
    /// Creates an evaluator backed by the given identity authority.
    #[must_use]
    pub fn new(authority: Arc<dyn IdentityAuthority>) -> Self {
        Self { authority }
    }

    /// Combined rx+tx byte delta visible to the request this pass.
    ///
    /// Device-level requests read interface rows with template matching
    /// only; every other level reads per-UID rows through the row
    /// visibility filter, so usage a request cannot see never counts
    /// toward its threshold.
    #[must_use]
    pub fn observed_delta(
        &self,
        request: &UsageRequest,
        iface_delta: &TrafficSnapshot,
        uid_delta: &TrafficSnapshot,
        active_identities: &ActiveIdentities,
    ) -> u64 {
        let empty = IdentitySet::empty();
        let mut observed = 0u64;

        if request.access_level == AccessLevel::Device {
            for row in iface_delta.rows() {
                let identities = active_identities.get(&row.key.iface).unwrap_or(&empty);
                if request.template.matches(identities) {
                    observed = observed.saturating_add(row.counters.total_bytes());
                }
            }
            return observed;
        }

        for row in uid_delta.rows() {
            if row.key.uid.is_all() {
                continue;
            }
            let identities = active_identities.get(&row.key.iface).unwrap_or(&empty);
            if !request.template.matches(identities) {
                continue;
            }
            if !is_visible(
                request.access_level,
                request.caller_uid,
                row.key.uid,
                row.key.default_network,
                self.authority.as_ref(),
            ) {
                continue;
            }
            observed = observed.saturating_add(row.counters.total_bytes());
        }

        observed
    }

    /// Evaluates one request against the pass deltas.
    ///
    /// The first pass after registration only establishes the baseline and
    /// never fires. Afterwards the visible delta accumulates; crossing at
    /// `accumulated >= threshold` fires and re-arms by resetting the
    /// accumulator, so the next notification requires a full threshold of
    /// new usage. Un-fired deltas are preserved across passes.
    pub fn evaluate_request(
        &self,
        request: &mut UsageRequest,
        iface_delta: &TrafficSnapshot,
        uid_delta: &TrafficSnapshot,
        active_identities: &ActiveIdentities,
    ) -> bool {
        if !request.baseline_established {
            request.baseline_established = true;
            return false;
        }

        let observed = self.observed_delta(request, iface_delta, uid_delta, active_identities);
        request.accumulated_bytes = request.accumulated_bytes.saturating_add(observed);

        if request.accumulated_bytes >= request.threshold_bytes {
            request.accumulated_bytes = 0;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StaticIdentityAuthority;
    use crate::identity::{NetworkIdentity, Uid, UserId};
    use crate::snapshot::{Counters, RowKey};
    use crate::template::UsageTemplate;

    use super::super::registry::RequestId;

    const APP: Uid = Uid::new(10_001);
    const NEIGHBOR: Uid = Uid::new(10_002);
    const FOREIGN: Uid = Uid::new(1_110_001);

    fn evaluator() -> ThresholdEvaluator {
        let authority = StaticIdentityAuthority::new();
        authority.set_user(APP, UserId::new(0));
        authority.set_user(NEIGHBOR, UserId::new(0));
        authority.set_user(FOREIGN, UserId::new(11));
        ThresholdEvaluator::new(Arc::new(authority))
    }

    fn request(threshold: u64, level: AccessLevel) -> UsageRequest {
        UsageRequest {
            id: RequestId::from_raw(1),
            template: UsageTemplate::any(),
            threshold_bytes: threshold,
            caller_uid: APP,
            caller_pid: 100,
            caller_package: "com.example.app".to_string(),
            access_level: level,
            accumulated_bytes: 0,
            baseline_established: true,
        }
    }

    fn wifi_identities() -> ActiveIdentities {
        let mut active = ActiveIdentities::new();
        active.insert("wlan0".to_string(), NetworkIdentity::wifi("ap").into());
        active
    }

    fn uid_snapshot(rows: &[(Uid, bool, u64)]) -> TrafficSnapshot {
        let mut snapshot = TrafficSnapshot::new();
        for &(uid, default_network, bytes) in rows {
            snapshot.add_row(
                RowKey::uid("wlan0", uid).with_default_network(default_network),
                Counters::from_bytes(bytes, 0),
            );
        }
        snapshot
    }

    #[test]
    fn baseline_pass_never_fires() {
        let evaluator = evaluator();
        let mut req = request(100, AccessLevel::User);
        req.baseline_established = false;

        let uid_delta = uid_snapshot(&[(APP, true, 1_000_000)]);
        let crossed = evaluator.evaluate_request(
            &mut req,
            &TrafficSnapshot::new(),
            &uid_delta,
            &wifi_identities(),
        );
        assert!(!crossed);
        assert!(req.baseline_established);
        assert_eq!(req.accumulated_bytes(), 0);
    }

    #[test]
    fn crossing_fires_and_rearms() {
        let evaluator = evaluator();
        let mut req = request(100, AccessLevel::User);
        let active = wifi_identities();
        let iface_delta = TrafficSnapshot::new();

        let exactly_t = uid_snapshot(&[(APP, true, 100)]);
        assert!(evaluator.evaluate_request(&mut req, &iface_delta, &exactly_t, &active));
        // Re-armed: a second full threshold fires again.
        assert!(evaluator.evaluate_request(&mut req, &iface_delta, &exactly_t, &active));
    }

    #[test]
    fn sub_threshold_deltas_accumulate() {
        let evaluator = evaluator();
        let mut req = request(100, AccessLevel::User);
        let active = wifi_identities();
        let iface_delta = TrafficSnapshot::new();

        let half = uid_snapshot(&[(APP, true, 50)]);
        assert!(!evaluator.evaluate_request(&mut req, &iface_delta, &half, &active));
        assert_eq!(req.accumulated_bytes(), 50);

        let rest = uid_snapshot(&[(APP, true, 51)]);
        assert!(evaluator.evaluate_request(&mut req, &iface_delta, &rest, &active));
        assert_eq!(req.accumulated_bytes(), 0);
    }

    #[test]
    fn tiny_system_threshold_fires_at_exact_value() {
        let evaluator = evaluator();
        let mut req = request(1, AccessLevel::Device);
        let active = wifi_identities();

        let mut iface_delta = TrafficSnapshot::new();
        iface_delta.add_row(RowKey::iface("wlan0"), Counters::from_bytes(1, 0));

        assert!(evaluator.evaluate_request(
            &mut req,
            &iface_delta,
            &TrafficSnapshot::new(),
            &active
        ));
    }

    #[test]
    fn default_network_level_excludes_non_default_rows() {
        let evaluator = evaluator();
        let req = request(100, AccessLevel::DefaultNetwork);
        let active = wifi_identities();

        let uid_delta = uid_snapshot(&[
            (APP, true, 40),
            (APP, false, 500),
            (NEIGHBOR, true, 500),
        ]);
        let observed =
            evaluator.observed_delta(&req, &TrafficSnapshot::new(), &uid_delta, &active);
        assert_eq!(observed, 40);
    }

    #[test]
    fn user_level_is_partition_scoped() {
        let evaluator = evaluator();
        let req = request(100, AccessLevel::User);
        let active = wifi_identities();

        let uid_delta = uid_snapshot(&[
            (APP, true, 10),
            (NEIGHBOR, false, 20),
            (FOREIGN, true, 500),
        ]);
        let observed =
            evaluator.observed_delta(&req, &TrafficSnapshot::new(), &uid_delta, &active);
        assert_eq!(observed, 30);
    }

    #[test]
    fn device_level_reads_interface_rows() {
        let evaluator = evaluator();
        let req = request(100, AccessLevel::Device);
        let active = wifi_identities();

        let mut iface_delta = TrafficSnapshot::new();
        iface_delta.add_row(RowKey::iface("wlan0"), Counters::from_bytes(70, 30));

        // Per-UID rows are not double counted for device-level requests.
        let uid_delta = uid_snapshot(&[(APP, true, 1000)]);

        let observed = evaluator.observed_delta(&req, &iface_delta, &uid_delta, &active);
        assert_eq!(observed, 100);
    }

    #[test]
    fn zero_match_template_accumulates_nothing() {
        let evaluator = evaluator();
        let mut req = request(100, AccessLevel::User);
        req.template = UsageTemplate::for_subscriber("no-such-imsi");
        let active = wifi_identities();

        let uid_delta = uid_snapshot(&[(APP, true, 1_000_000)]);
        assert!(!evaluator.evaluate_request(
            &mut req,
            &TrafficSnapshot::new(),
            &uid_delta,
            &active
        ));
        assert_eq!(req.accumulated_bytes(), 0);
    }
}

//! Request registry: live registrations, quotas, and stable identifiers.
//!
//! The registry is exclusively owned by the observer worker; all mutation
//! is marshaled onto that thread, so no internal locking is needed.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::access::AccessLevel;
use crate::error::ExecutionError;
use crate::identity::Uid;
use crate::template::UsageTemplate;

/// Default cap on concurrent registrations held by one UID.
pub const DEFAULT_MAX_REQUESTS_PER_UID: usize = 25;

/// Default floor applied to thresholds from non-system callers.
pub const DEFAULT_MIN_THRESHOLD_BYTES: u64 = 2 * 1024 * 1024;

/// Process-unique registration identifier.
///
/// Strictly increasing across the process lifetime and never reused. A
/// registration attempt that fails does not consume an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Wraps a raw id value, e.g. one received back over a wire boundary.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// A live usage-threshold registration.
#[derive(Debug, Clone)]
pub struct UsageRequest {
    /// Stable registration id.
    pub id: RequestId,
    /// Caller-supplied network filter.
    pub template: UsageTemplate,
    /// Effective threshold, after any floor clamping.
    pub threshold_bytes: u64,
    /// Registering UID.
    pub caller_uid: Uid,
    /// Registering process id.
    pub caller_pid: u32,
    /// Registering package name.
    pub caller_package: String,
    /// Resolved visibility scope.
    pub access_level: AccessLevel,
    /// Bytes accumulated since the last notification (or registration).
    pub(crate) accumulated_bytes: u64,
    /// False until the first evaluation pass has established a baseline.
    pub(crate) baseline_established: bool,
}

impl UsageRequest {
    /// Bytes accumulated toward the next crossing.
    #[must_use]
    pub const fn accumulated_bytes(&self) -> u64 {
        self.accumulated_bytes
    }
}

/// Outcome of a removal attempt.
#[derive(Debug)]
pub enum RemoveOutcome {
    /// The request was live and is now removed.
    Removed(UsageRequest),
    /// Unknown id; silent no-op by contract.
    NotFound,
    /// Live, but owned by a different UID and the caller is not system;
    /// silent no-op so existence is not leaked.
    NotOwner,
}

/// Owns the set of live registrations and enforces per-UID quotas.
#[derive(Debug)]
pub struct RequestRegistry {
    max_requests_per_uid: usize,
    min_threshold_bytes: u64,
    next_id: u64,
    requests: HashMap<RequestId, UsageRequest>,
    counts_by_uid: HashMap<Uid, usize>,
}

impl RequestRegistry {
    /// Creates a registry with the given quota and threshold floor.
    #[must_use]
    pub fn new(max_requests_per_uid: usize, min_threshold_bytes: u64) -> Self {
        Self {
            max_requests_per_uid: max_requests_per_uid.max(1),
            min_threshold_bytes,
            next_id: 0,
            requests: HashMap::new(),
            counts_by_uid: HashMap::new(),
        }
    }

    /// Registers a new request.
    ///
    /// Quota is checked before anything else: a failing call consumes no
    /// id and arms nothing. Thresholds from non-system callers are clamped
    /// up to the floor; system callers keep their exact value, including
    /// deliberately tiny diagnostic thresholds.
    pub fn insert(
        &mut self,
        template: UsageTemplate,
        threshold_bytes: u64,
        caller_uid: Uid,
        caller_pid: u32,
        caller_package: String,
        access_level: AccessLevel,
        caller_is_system: bool,
    ) -> Result<RequestId, ExecutionError> {
        let held = self.counts_by_uid.get(&caller_uid).copied().unwrap_or(0);
        if held >= self.max_requests_per_uid {
            return Err(ExecutionError::QuotaExceeded {
                uid: caller_uid,
                max: self.max_requests_per_uid,
            });
        }

        let threshold_bytes = if caller_is_system {
            threshold_bytes
        } else {
            threshold_bytes.max(self.min_threshold_bytes)
        };

        self.next_id += 1;
        let id = RequestId(self.next_id);

        self.requests.insert(
            id,
            UsageRequest {
                id,
                template,
                threshold_bytes,
                caller_uid,
                caller_pid,
                caller_package,
                access_level,
                accumulated_bytes: 0,
                baseline_established: false,
            },
        );
        *self.counts_by_uid.entry(caller_uid).or_insert(0) += 1;

        Ok(id)
    }

    /// Removes a request on behalf of `caller_uid`.
    ///
    /// Only the owning UID may remove its request, except the system
    /// identity, which may remove on behalf of any UID.
    pub fn remove(&mut self, id: RequestId, caller_uid: Uid, caller_is_system: bool) -> RemoveOutcome {
        let Some(request) = self.requests.get(&id) else {
            return RemoveOutcome::NotFound;
        };

        if request.caller_uid != caller_uid && !caller_is_system {
            return RemoveOutcome::NotOwner;
        }

        RemoveOutcome::Removed(self.take(id))
    }

    /// Removes a request because its caller died.
    ///
    /// Behaves like an unregister by the system identity; idempotent
    /// against an explicit unregister racing the death notification.
    pub fn remove_for_death(&mut self, id: RequestId) -> Option<UsageRequest> {
        if !self.requests.contains_key(&id) {
            return None;
        }
        Some(self.take(id))
    }

    fn take(&mut self, id: RequestId) -> UsageRequest {
        let request = self
            .requests
            .remove(&id)
            .unwrap_or_else(|| unreachable!("take() is only called for live ids"));
        if let Some(count) = self.counts_by_uid.get_mut(&request.caller_uid) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts_by_uid.remove(&request.caller_uid);
            }
        }
        request
    }

    /// Looks up a live request.
    #[must_use]
    pub fn get(&self, id: RequestId) -> Option<&UsageRequest> {
        self.requests.get(&id)
    }

    /// Iterates live requests mutably, for the evaluation pass.
    pub fn requests_mut(&mut self) -> impl Iterator<Item = &mut UsageRequest> {
        self.requests.values_mut()
    }

    /// Number of live requests across all UIDs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Returns true if no request is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

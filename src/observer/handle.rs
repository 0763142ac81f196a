//! Registrant-facing event surface.
//!
//! A successful registration yields a [`UsageRequestHandle`]: a bounded
//! stream of [`UsageEvent`]s plus best-effort unregistration. Dropping the
//! handle attempts unregistration so abandoned registrations do not hold
//! their quota slot forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExecutionError, NetWatchError, NetWatchResult};
use crate::identity::Uid;

use super::dispatcher::ControlMsg;
use super::registry::RequestId;

/// What happened to the registration.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UsageEventKind {
    /// Cumulative usage since the last notification crossed the
    /// registration's threshold. The threshold re-arms automatically.
    ThresholdReached {
        threshold_bytes: u64,
    },
    /// The registration was released, either by an explicit unregister or
    /// because the registering process died. Delivered at most once.
    Released,
}

/// A delivered notification.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_id: Uuid,
    pub request_id: RequestId,
    pub timestamp: DateTime<Utc>,
    pub kind: UsageEventKind,
}

impl UsageEvent {
    pub(crate) fn threshold_reached(request_id: RequestId, threshold_bytes: u64) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            request_id,
            timestamp: Utc::now(),
            kind: UsageEventKind::ThresholdReached { threshold_bytes },
        }
    }

    pub(crate) fn released(request_id: RequestId) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            request_id,
            timestamp: Utc::now(),
            kind: UsageEventKind::Released,
        }
    }

    /// Returns true if this is a release notification.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        matches!(self.kind, UsageEventKind::Released)
    }
}

/// Handle to a live usage-threshold registration.
#[derive(Debug)]
pub struct UsageRequestHandle {
    request_id: RequestId,
    caller_uid: Uid,
    rx: Receiver<UsageEvent>,
    control_tx: Sender<ControlMsg>,
    unregistered: AtomicBool,
}

impl UsageRequestHandle {
    pub(crate) fn new(
        request_id: RequestId,
        caller_uid: Uid,
        rx: Receiver<UsageEvent>,
        control_tx: Sender<ControlMsg>,
    ) -> Self {
        Self {
            request_id,
            caller_uid,
            rx,
            control_tx,
            unregistered: AtomicBool::new(false),
        }
    }

    /// The registration id backing this handle.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Explicit unregistration.
    ///
    /// Idempotent. Blocks only if the control queue is momentarily full;
    /// the request must not stay registered because of a transient burst.
    /// A `Released` event is delivered on this handle's stream once the
    /// worker processes the removal.
    pub fn unregister(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.control_tx.send(ControlMsg::Unregister {
            id: self.request_id,
            caller_uid: self.caller_uid,
            reply: None,
        });
    }

    /// Receives the next event (blocking).
    pub fn recv(&self) -> NetWatchResult<UsageEvent> {
        self.rx.recv().map_err(|_| {
            NetWatchError::Execution(ExecutionError::Disconnected {
                path: "usage_stream".to_string(),
            })
        })
    }

    /// Receives the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> NetWatchResult<UsageEvent> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => NetWatchError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => NetWatchError::Execution(ExecutionError::Disconnected {
                path: "usage_stream".to_string(),
            }),
        })
    }
}

impl Drop for UsageRequestHandle {
    fn drop(&mut self) {
        // Best-effort: do not block on shutdown.
        if !self.unregistered.swap(true, Ordering::AcqRel) {
            let _ = self.control_tx.try_send(ControlMsg::Unregister {
                id: self.request_id,
                caller_uid: self.caller_uid,
                reply: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_event_carries_request_identity() {
        let id = RequestId::from_raw(7);
        let event = UsageEvent::threshold_reached(id, 2048);
        assert_eq!(event.request_id, id);
        assert!(!event.is_released());
        let UsageEventKind::ThresholdReached { threshold_bytes } = event.kind else {
            panic!("expected threshold event");
        };
        assert_eq!(threshold_bytes, 2048);
    }

    #[test]
    fn released_event_is_flagged() {
        let event = UsageEvent::released(RequestId::from_raw(3));
        assert!(event.is_released());
    }
}

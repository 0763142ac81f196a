//! Usage-threshold observer subsystem.
//!
//! Callers register interest in cumulative byte usage against a network
//! template; the engine consumes paired traffic snapshots from the
//! polling collaborator, accumulates per-registration deltas, and fires
//! an at-most-once-per-crossing notification when usage since the last
//! notification exceeds the registration's threshold. The engine is
//! embedded-first and transport-agnostic: process death and caller
//! identity arrive through the [`death::DeathWatch`] and
//! [`crate::access::IdentityAuthority`] collaborator seams.

/// Death-notification primitive.
pub mod death;
/// Worker loop and event dispatch.
pub mod dispatcher;
/// Delta accumulation and crossing decisions.
pub mod evaluator;
/// Registrant-facing handle and events.
pub mod handle;
/// Registration bookkeeping and quotas.
pub mod registry;

pub use death::{DeathWatch, ManualDeathWatch};
pub use dispatcher::{ObserverConfig, UsageObserver};
pub use evaluator::ThresholdEvaluator;
pub use handle::{UsageEvent, UsageEventKind, UsageRequestHandle};
pub use registry::{
    RequestId, RequestRegistry, UsageRequest, DEFAULT_MAX_REQUESTS_PER_UID,
    DEFAULT_MIN_THRESHOLD_BYTES,
};

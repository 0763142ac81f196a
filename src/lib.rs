//! # netwatch - network usage-threshold observer engine
//!
//! netwatch lets callers register interest in cumulative network byte
//! usage against a filter template, consumes periodic raw traffic
//! snapshots, and fires an at-most-once-per-crossing notification when
//! usage since the last notification exceeds a caller-supplied threshold.
//! It enforces per-caller registration quotas, multi-level data-access
//! scoping, and automatic cleanup when the registering process dies.
//!
//! ## Core Concepts
//!
//! - **Template**: a caller-supplied filter over network identity
//!   dimensions (transport, subscriber, wifi key, RAT type, flags)
//! - **Snapshot**: an immutable point-in-time table of traffic counters
//! - **Access level**: the scope of UIDs/rows a registration may observe
//! - **Death watch**: asynchronous cleanup when a registrant dies
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use netwatch::access::{AccessLevel, StaticIdentityAuthority};
//! use netwatch::identity::Uid;
//! use netwatch::observer::{ManualDeathWatch, ObserverConfig, UsageObserver};
//! use netwatch::template::UsageTemplate;
//!
//! let authority = Arc::new(StaticIdentityAuthority::new());
//! let death_watch = Arc::new(ManualDeathWatch::new());
//! let observer = UsageObserver::new(ObserverConfig::default(), authority, death_watch);
//!
//! let handle = observer.register(
//!     UsageTemplate::any(),
//!     4 * 1024 * 1024,
//!     Uid::new(10_001),
//!     4242,
//!     "com.example.app",
//!     AccessLevel::DefaultNetwork,
//! )?;
//! ```
//!
//! Snapshot pairs then stream in through
//! [`observer::UsageObserver::on_snapshots_available`] and crossings are
//! delivered on the handle.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Leaf types
pub mod access;
pub mod error;
pub mod identity;
pub mod snapshot;
pub mod template;

// Observer engine
pub mod observer;

// Re-export primary types at crate root for convenience
pub use access::{is_visible, resolve_access, AccessLevel, IdentityAuthority, StaticIdentityAuthority};
pub use error::{ExecutionError, NetWatchError, NetWatchResult, ValidationError};
pub use identity::{ActiveIdentities, IdentitySet, NetworkIdentity, RatType, Transport, Uid, UserId};
pub use observer::{
    DeathWatch, ManualDeathWatch, ObserverConfig, RequestId, UsageEvent, UsageEventKind,
    UsageObserver, UsageRequest, UsageRequestHandle,
};
pub use snapshot::{Counters, RowKey, RowState, SnapshotRow, TrafficSnapshot};
pub use template::{FlagFilter, UsageTemplate};

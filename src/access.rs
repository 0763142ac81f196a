//! Data-access scoping for usage registrations.
//!
//! Every registration is resolved to one access level at registration
//! time; the level is then applied row-by-row during delta accumulation so
//! a request never counts usage from rows it is not authorized to see.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::identity::{Uid, UserId};

/// Visibility scope of a registration, from narrowest to broadest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Own UID only, and only rows on the current default network.
    DefaultNetwork,
    /// Any UID in the caller's user partition.
    User,
    /// Any UID on the device. Requires system identity.
    Device,
}

/// Caller-identity authority collaborator.
///
/// Resolves a UID to its user partition and to whether it holds the
/// elevated system capability. The platform embedding supplies the real
/// implementation; [`StaticIdentityAuthority`] serves embedders and tests.
pub trait IdentityAuthority: Send + Sync {
    /// The user partition owning the given UID.
    fn user_of(&self, uid: Uid) -> UserId;

    /// Whether the UID holds the elevated system capability.
    fn is_system(&self, uid: Uid) -> bool;
}

/// Map-backed identity authority.
#[derive(Debug, Default)]
pub struct StaticIdentityAuthority {
    users: RwLock<HashMap<Uid, UserId>>,
    system_uids: RwLock<Vec<Uid>>,
}

impl StaticIdentityAuthority {
    /// Creates an empty authority: every UID is in partition 0, nobody is
    /// system.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a UID to a user partition.
    pub fn set_user(&self, uid: Uid, user: UserId) {
        if let Ok(mut users) = self.users.write() {
            users.insert(uid, user);
        }
    }

    /// Grants the system capability to a UID.
    pub fn grant_system(&self, uid: Uid) {
        if let Ok(mut system) = self.system_uids.write() {
            if !system.contains(&uid) {
                system.push(uid);
            }
        }
    }
}

impl IdentityAuthority for StaticIdentityAuthority {
    fn user_of(&self, uid: Uid) -> UserId {
        self.users
            .read()
            .ok()
            .and_then(|users| users.get(&uid).copied())
            .unwrap_or(UserId::new(0))
    }

    fn is_system(&self, uid: Uid) -> bool {
        self.system_uids
            .read()
            .map(|system| system.contains(&uid))
            .unwrap_or(false)
    }
}

/// Resolves the access level granted to a caller.
///
/// `Device` requires the system capability; callers without it are
/// silently downgraded to `User` rather than rejected, so `register` stays
/// infallible for any legitimate identity.
#[must_use]
pub fn resolve_access(
    requested: AccessLevel,
    caller_uid: Uid,
    authority: &dyn IdentityAuthority,
) -> AccessLevel {
    match requested {
        AccessLevel::Device if !authority.is_system(caller_uid) => AccessLevel::User,
        other => other,
    }
}

/// Row-level visibility check applied during delta accumulation.
///
/// `Device` sees every row. `User` sees rows owned by UIDs in the caller's
/// partition (which always includes the caller itself). `DefaultNetwork`
/// sees only the caller's own rows, and only those flagged as traffic on
/// the current default network.
#[must_use]
pub fn is_visible(
    level: AccessLevel,
    caller_uid: Uid,
    row_uid: Uid,
    row_is_default_network: bool,
    authority: &dyn IdentityAuthority,
) -> bool {
    match level {
        AccessLevel::Device => true,
        AccessLevel::User => authority.user_of(row_uid) == authority.user_of(caller_uid),
        AccessLevel::DefaultNetwork => row_uid == caller_uid && row_is_default_network,
    }
}

//! Network identity types and caller identity newtypes.
//!
//! The identity layer is the prerequisite for everything in netwatch.
//! Without stable UIDs and interface identity sets, usage rows cannot be
//! attributed, templates cannot be matched, and access scoping is
//! meaningless.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A kernel-assigned application identifier that owns traffic rows.
///
/// `Uid::ALL` is the wildcard used by interface-level snapshot rows, which
/// carry no per-application attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(u32);

impl Uid {
    /// Wildcard UID carried by interface-level rows.
    pub const ALL: Self = Self(u32::MAX);

    /// Wraps a raw UID value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw UID value.
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns true if this is the wildcard UID.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        self.0 == u32::MAX
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            write!(f, "UID_ALL")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A user-space partition on a multi-user device.
///
/// Several UIDs belong to one user; `User`-level access is scoped to the
/// caller's partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(u32);

impl UserId {
    /// Wraps a raw user partition id.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw partition id.
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Physical transport of a network.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Cellular,
    Wifi,
    Ethernet,
    Bluetooth,
}

/// Radio access technology bucket for cellular identities.
///
/// Fine-grained RAT collapsing happens in the external telephony monitor;
/// the engine only compares buckets for equality.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatType {
    Unknown,
    Gsm,
    Umts,
    Lte,
    Nr,
}

/// One descriptor attached to a network interface at a point in time.
///
/// A single interface may carry several simultaneous identities (for
/// example both "cellular, subscriber X" and "RAT = LTE"), collected into
/// an [`IdentitySet`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkIdentity {
    /// Physical transport.
    pub transport: Transport,
    /// Subscriber id (IMSI) for cellular identities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_id: Option<String>,
    /// Stable network key for wifi identities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_network_key: Option<String>,
    /// RAT bucket; `Unknown` for non-cellular identities.
    pub rat_type: RatType,
    /// Whether the network is metered.
    pub metered: bool,
    /// Whether the network is roaming.
    pub roaming: bool,
    /// Whether the network is OEM-managed.
    pub oem_managed: bool,
}

impl NetworkIdentity {
    /// A plain wifi identity with the given network key.
    #[must_use]
    pub fn wifi(network_key: impl Into<String>) -> Self {
        Self {
            transport: Transport::Wifi,
            subscriber_id: None,
            wifi_network_key: Some(network_key.into()),
            rat_type: RatType::Unknown,
            metered: false,
            roaming: false,
            oem_managed: false,
        }
    }

    /// A metered cellular identity for the given subscriber.
    #[must_use]
    pub fn cellular(subscriber_id: impl Into<String>, rat_type: RatType) -> Self {
        Self {
            transport: Transport::Cellular,
            subscriber_id: Some(subscriber_id.into()),
            wifi_network_key: None,
            rat_type,
            metered: true,
            roaming: false,
            oem_managed: false,
        }
    }
}

/// The set of simultaneous identities attached to one interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySet {
    identities: Vec<NetworkIdentity>,
}

impl IdentitySet {
    /// An empty identity set; matches only the all-wildcard template.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            identities: Vec::new(),
        }
    }

    /// Builds a set from the given identities.
    #[must_use]
    pub fn from_identities(identities: Vec<NetworkIdentity>) -> Self {
        Self { identities }
    }

    /// Iterates the identities in the set.
    pub fn iter(&self) -> impl Iterator<Item = &NetworkIdentity> {
        self.identities.iter()
    }

    /// Returns true if the set carries no identity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl From<NetworkIdentity> for IdentitySet {
    fn from(identity: NetworkIdentity) -> Self {
        Self {
            identities: vec![identity],
        }
    }
}

/// Interface name to identity-set mapping delivered by the poller each
/// tick. Rows on interfaces absent from the map match no template.
pub type ActiveIdentities = HashMap<String, IdentitySet>;

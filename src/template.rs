//! Template matching for usage registrations.
//!
//! A template is the caller-supplied filter describing which network
//! identity dimensions a registration cares about. Matching is pure and
//! deterministic so it can run many times per evaluation pass without
//! synchronization.

use serde::{Deserialize, Serialize};

use crate::identity::{IdentitySet, NetworkIdentity, RatType, Transport};

/// Tri-state filter for boolean identity dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagFilter {
    /// Dimension is not constrained.
    #[default]
    Any,
    /// Dimension must be set on a matching identity.
    RequireYes,
    /// Dimension must be clear on a matching identity.
    RequireNo,
}

impl FlagFilter {
    fn accepts(self, value: bool) -> bool {
        match self {
            Self::Any => true,
            Self::RequireYes => value,
            Self::RequireNo => !value,
        }
    }
}

/// A caller-supplied filter over network identity dimensions.
///
/// `None` in an optional dimension means wildcard. An identity set matches
/// when at least one identity in the set satisfies every non-wildcard
/// dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTemplate {
    /// Required transport, or any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
    /// Required subscriber id, or any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_id: Option<String>,
    /// Required wifi network key, or any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_network_key: Option<String>,
    /// Required RAT bucket, or wildcard-all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rat_type: Option<RatType>,
    /// Metered constraint.
    #[serde(default)]
    pub metered: FlagFilter,
    /// Roaming constraint.
    #[serde(default)]
    pub roaming: FlagFilter,
    /// OEM-managed constraint.
    #[serde(default)]
    pub oem_managed: FlagFilter,
}

impl UsageTemplate {
    /// Template matching any identity on any network.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Template matching any identity on the given transport.
    #[must_use]
    pub fn for_transport(transport: Transport) -> Self {
        Self {
            transport: Some(transport),
            ..Self::default()
        }
    }

    /// Template matching the given subscriber's cellular identities.
    #[must_use]
    pub fn for_subscriber(subscriber_id: impl Into<String>) -> Self {
        Self {
            transport: Some(Transport::Cellular),
            subscriber_id: Some(subscriber_id.into()),
            ..Self::default()
        }
    }

    /// Returns true if the identity set satisfies this template.
    ///
    /// Rows may carry multiple simultaneous identities; one identity
    /// satisfying every constrained dimension is sufficient.
    #[must_use]
    pub fn matches(&self, set: &IdentitySet) -> bool {
        if self.is_wildcard() {
            return true;
        }
        set.iter().any(|identity| self.matches_identity(identity))
    }

    fn matches_identity(&self, identity: &NetworkIdentity) -> bool {
        if let Some(transport) = self.transport {
            if identity.transport != transport {
                return false;
            }
        }
        if let Some(subscriber) = self.subscriber_id.as_deref() {
            if identity.subscriber_id.as_deref() != Some(subscriber) {
                return false;
            }
        }
        if let Some(key) = self.wifi_network_key.as_deref() {
            if identity.wifi_network_key.as_deref() != Some(key) {
                return false;
            }
        }
        if let Some(rat) = self.rat_type {
            if identity.rat_type != rat {
                return false;
            }
        }
        if !self.metered.accepts(identity.metered) {
            return false;
        }
        if !self.roaming.accepts(identity.roaming) {
            return false;
        }
        self.oem_managed.accepts(identity.oem_managed)
    }

    /// Returns true if every dimension is a wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.transport.is_none()
            && self.subscriber_id.is_none()
            && self.wifi_network_key.is_none()
            && self.rat_type.is_none()
            && self.metered == FlagFilter::Any
            && self.roaming == FlagFilter::Any
            && self.oem_managed == FlagFilter::Any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentitySet;

    #[test]
    fn wildcard_matches_empty_set() {
        assert!(UsageTemplate::any().matches(&IdentitySet::empty()));
    }

    #[test]
    fn constrained_template_rejects_empty_set() {
        let template = UsageTemplate::for_transport(Transport::Wifi);
        assert!(!template.matches(&IdentitySet::empty()));
    }

    #[test]
    fn transport_dimension_filters() {
        let template = UsageTemplate::for_transport(Transport::Wifi);
        assert!(template.matches(&NetworkIdentity::wifi("ap").into()));
        assert!(!template.matches(&NetworkIdentity::cellular("imsi", RatType::Lte).into()));
    }

    #[test]
    fn subscriber_dimension_filters() {
        let template = UsageTemplate::for_subscriber("imsi-a");
        assert!(template.matches(&NetworkIdentity::cellular("imsi-a", RatType::Lte).into()));
        assert!(!template.matches(&NetworkIdentity::cellular("imsi-b", RatType::Lte).into()));
    }

    #[test]
    fn rat_dimension_wildcard_and_exact() {
        let mut template = UsageTemplate::for_subscriber("imsi");
        assert!(template.matches(&NetworkIdentity::cellular("imsi", RatType::Nr).into()));

        template.rat_type = Some(RatType::Lte);
        assert!(template.matches(&NetworkIdentity::cellular("imsi", RatType::Lte).into()));
        assert!(!template.matches(&NetworkIdentity::cellular("imsi", RatType::Nr).into()));
    }

    #[test]
    fn flag_filters_apply() {
        let mut template = UsageTemplate::for_transport(Transport::Wifi);
        template.metered = FlagFilter::RequireYes;

        let unmetered = NetworkIdentity::wifi("ap");
        assert!(!template.matches(&unmetered.clone().into()));

        let mut metered = unmetered;
        metered.metered = true;
        assert!(template.matches(&metered.into()));
    }

    #[test]
    fn any_identity_in_set_may_satisfy() {
        // One identity fails the transport check, another passes.
        let set = IdentitySet::from_identities(vec![
            NetworkIdentity::cellular("imsi", RatType::Lte),
            NetworkIdentity::wifi("ap"),
        ]);
        assert!(UsageTemplate::for_transport(Transport::Wifi).matches(&set));
        assert!(UsageTemplate::for_subscriber("imsi").matches(&set));
        assert!(!UsageTemplate::for_subscriber("other").matches(&set));
    }
}

//! PubSub feature flags (`http://jabber.org/protocol/pubsub#<feature>`).
//!
//! The enabled set is configured as a list of feature names and stored as a
//! bitset. Every request is checked against it before anything else.

use std::fmt;
use std::ops::BitOr;

use serde::Deserialize;

use super::node::Affiliation;
use crate::ns::PUBSUB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    AutoCreate,
    AutoSubscribe,
    ConfigNode,
    CreateAndConfigure,
    CreateNodes,
    DeleteNodes,
    FilteredNotifications,
    InstantNodes,
    PersistentItems,
    PurgeNodes,
    RetrieveAffiliations,
    RetrieveSubscriptions,
    RetrieveItems,
    Publish,
    Subscribe,
    RetractItems,
    ModifyAffiliations,
    ManageSubscriptions,
    RetrieveDefault,
}

impl Feature {
    pub const ALL: [Feature; 19] = [
        Feature::AutoCreate,
        Feature::AutoSubscribe,
        Feature::ConfigNode,
        Feature::CreateAndConfigure,
        Feature::CreateNodes,
        Feature::DeleteNodes,
        Feature::FilteredNotifications,
        Feature::InstantNodes,
        Feature::PersistentItems,
        Feature::PurgeNodes,
        Feature::RetrieveAffiliations,
        Feature::RetrieveSubscriptions,
        Feature::RetrieveItems,
        Feature::Publish,
        Feature::Subscribe,
        Feature::RetractItems,
        Feature::ModifyAffiliations,
        Feature::ManageSubscriptions,
        Feature::RetrieveDefault,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::AutoCreate => "auto-create",
            Feature::AutoSubscribe => "auto-subscribe",
            Feature::ConfigNode => "config-node",
            Feature::CreateAndConfigure => "create-and-configure",
            Feature::CreateNodes => "create-nodes",
            Feature::DeleteNodes => "delete-nodes",
            Feature::FilteredNotifications => "filtered-notifications",
            Feature::InstantNodes => "instant-nodes",
            Feature::PersistentItems => "persistent-items",
            Feature::PurgeNodes => "purge-nodes",
            Feature::RetrieveAffiliations => "retrieve-affiliations",
            Feature::RetrieveSubscriptions => "retrieve-subscriptions",
            Feature::RetrieveItems => "retrieve-items",
            Feature::Publish => "publish",
            Feature::Subscribe => "subscribe",
            Feature::RetractItems => "retract-items",
            Feature::ModifyAffiliations => "modify-affiliations",
            Feature::ManageSubscriptions => "manage-subscriptions",
            Feature::RetrieveDefault => "retrieve-default",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.as_str() == s)
    }

    /// Full feature URI advertised through service discovery.
    pub fn uri(&self) -> String {
        format!("{}#{}", PUBSUB, self.as_str())
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of enabled features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct PubSubFeatures(u32);

impl PubSubFeatures {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Feature::ALL.iter().fold(Self::empty(), |acc, f| acc.with(*f))
    }

    pub fn with(self, feature: Feature) -> Self {
        Self(self.0 | feature.bit())
    }

    pub fn without(self, feature: Feature) -> Self {
        Self(self.0 & !feature.bit())
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        Feature::ALL.iter().copied().filter(|f| self.contains(*f))
    }
}

impl Default for PubSubFeatures {
    fn default() -> Self {
        Self::all()
    }
}

impl From<Feature> for PubSubFeatures {
    fn from(feature: Feature) -> Self {
        Self::empty().with(feature)
    }
}

impl BitOr for Feature {
    type Output = PubSubFeatures;

    fn bitor(self, rhs: Feature) -> PubSubFeatures {
        PubSubFeatures::from(self).with(rhs)
    }
}

impl BitOr<Feature> for PubSubFeatures {
    type Output = PubSubFeatures;

    fn bitor(self, rhs: Feature) -> PubSubFeatures {
        self.with(rhs)
    }
}

impl TryFrom<Vec<String>> for PubSubFeatures {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        names.iter().try_fold(Self::empty(), |acc, name| {
            Feature::from_str(name)
                .map(|f| acc.with(f))
                .ok_or_else(|| format!("unknown pubsub feature: {}", name))
        })
    }
}

/// Whether an entity with `affiliation` may perform `feature`.
pub fn has_privileges(affiliation: Affiliation, feature: Feature) -> bool {
    use Affiliation::*;
    match feature {
        Feature::ConfigNode
        | Feature::DeleteNodes
        | Feature::PurgeNodes
        | Feature::ModifyAffiliations
        | Feature::ManageSubscriptions
        | Feature::RetrieveDefault => affiliation == Owner,
        Feature::Publish => matches!(affiliation, Owner | Publisher | PublishOnly),
        Feature::RetractItems => matches!(affiliation, Owner | Publisher),
        Feature::RetrieveItems => matches!(affiliation, Owner | Publisher | Member),
        Feature::Subscribe => !matches!(affiliation, Outcast | PublishOnly),
        _ => affiliation != Outcast,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_operations() {
        let features = Feature::ConfigNode | Feature::DeleteNodes | Feature::CreateNodes;
        assert!(features.contains(Feature::ConfigNode));
        assert!(features.contains(Feature::CreateNodes));
        assert!(!features.contains(Feature::PurgeNodes));
        assert!(!features.without(Feature::ConfigNode).contains(Feature::ConfigNode));
        assert_eq!(features.iter().count(), 3);
    }

    #[test]
    fn test_all_contains_every_feature() {
        let all = PubSubFeatures::all();
        for feature in Feature::ALL {
            assert!(all.contains(feature), "{} missing", feature);
            assert_eq!(Feature::from_str(feature.as_str()), Some(feature));
        }
    }

    #[test]
    fn test_feature_uri() {
        assert_eq!(
            Feature::PurgeNodes.uri(),
            "http://jabber.org/protocol/pubsub#purge-nodes"
        );
    }

    #[test]
    fn test_privilege_matrix() {
        for feature in [Feature::ConfigNode, Feature::DeleteNodes, Feature::PurgeNodes] {
            assert!(has_privileges(Affiliation::Owner, feature));
            assert!(!has_privileges(Affiliation::Publisher, feature));
            assert!(!has_privileges(Affiliation::Member, feature));
        }

        assert!(has_privileges(Affiliation::Owner, Feature::Publish));
        assert!(has_privileges(Affiliation::Publisher, Feature::Publish));
        assert!(has_privileges(Affiliation::PublishOnly, Feature::Publish));
        assert!(!has_privileges(Affiliation::Member, Feature::Publish));
        assert!(!has_privileges(Affiliation::None, Feature::Publish));

        assert!(!has_privileges(Affiliation::Outcast, Feature::Subscribe));
        assert!(has_privileges(Affiliation::None, Feature::Subscribe));
    }
}

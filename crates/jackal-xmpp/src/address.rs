//! JID classification and masked matching.
//!
//! Lookups in the session table and block lists compare addresses on a
//! subset of their components. The subset depends on the shape of the
//! lookup argument:
//!
//! | argument           | example             | compared             |
//! |--------------------|---------------------|----------------------|
//! | full               | `user@host/res`     | node, domain, resource |
//! | server with resource | `host/res`        | domain, resource     |
//! | bare               | `user@host`         | node, domain         |
//! | server             | `host`              | domain               |

use std::ops::BitOr;

use jid::Jid;

/// Shape of a JID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JidKind {
    /// `domain`
    Server,
    /// `domain/resource`
    ServerFull,
    /// `node@domain`
    Bare,
    /// `node@domain/resource`
    Full,
}

impl JidKind {
    pub fn of(jid: &Jid) -> Self {
        match (jid.node().is_some(), jid.resource().is_some()) {
            (false, false) => JidKind::Server,
            (false, true) => JidKind::ServerFull,
            (true, false) => JidKind::Bare,
            (true, true) => JidKind::Full,
        }
    }
}

/// Set of JID components to compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchMask(u8);

impl MatchMask {
    pub const NODE: MatchMask = MatchMask(0b001);
    pub const DOMAIN: MatchMask = MatchMask(0b010);
    pub const RESOURCE: MatchMask = MatchMask(0b100);

    pub fn contains(self, other: MatchMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// The mask used when `jid` is the lookup argument.
    pub fn for_jid(jid: &Jid) -> Self {
        match JidKind::of(jid) {
            JidKind::Full => Self::NODE | Self::DOMAIN | Self::RESOURCE,
            JidKind::ServerFull => Self::DOMAIN | Self::RESOURCE,
            JidKind::Bare => Self::NODE | Self::DOMAIN,
            JidKind::Server => Self::DOMAIN,
        }
    }
}

impl BitOr for MatchMask {
    type Output = MatchMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        MatchMask(self.0 | rhs.0)
    }
}

/// Compare `a` and `b` on the components selected by `mask`.
///
/// A component absent from either side matches anything.
pub fn matches(a: &Jid, b: &Jid, mask: MatchMask) -> bool {
    if mask.contains(MatchMask::NODE) {
        if let (Some(x), Some(y)) = (a.node(), b.node()) {
            if x.as_str() != y.as_str() {
                return false;
            }
        }
    }
    if mask.contains(MatchMask::DOMAIN) && a.domain().as_str() != b.domain().as_str() {
        return false;
    }
    if mask.contains(MatchMask::RESOURCE) {
        if let (Some(x), Some(y)) = (a.resource(), b.resource()) {
            if x.as_str() != y.as_str() {
                return false;
            }
        }
    }
    true
}

/// Whether `candidate` is selected by the lookup argument `pattern`.
pub fn matches_pattern(pattern: &Jid, candidate: &Jid) -> bool {
    matches(pattern, candidate, MatchMask::for_jid(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().expect("valid jid")
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(JidKind::of(&jid("jackal.im")), JidKind::Server);
        assert_eq!(JidKind::of(&jid("jackal.im/jail")), JidKind::ServerFull);
        assert_eq!(JidKind::of(&jid("romeo@jackal.im")), JidKind::Bare);
        assert_eq!(JidKind::of(&jid("romeo@jackal.im/jail")), JidKind::Full);
    }

    #[test]
    fn test_server_full_matches_any_user_with_resource() {
        let pattern = jid("jackal.im/jail");
        assert!(matches_pattern(&pattern, &jid("romeo@jackal.im/jail")));
        assert!(matches_pattern(&pattern, &jid("juliet@jackal.im/jail")));
        assert!(!matches_pattern(&pattern, &jid("romeo@jackal.im/garden")));
        assert!(!matches_pattern(&pattern, &jid("romeo@other.im/jail")));
    }

    #[test]
    fn test_bare_matches_every_resource() {
        let pattern = jid("romeo@jackal.im");
        assert!(matches_pattern(&pattern, &jid("romeo@jackal.im/jail")));
        assert!(matches_pattern(&pattern, &jid("romeo@jackal.im")));
        assert!(!matches_pattern(&pattern, &jid("juliet@jackal.im/jail")));
    }

    #[test]
    fn test_full_requires_exact_resource() {
        let pattern = jid("romeo@jackal.im/jail");
        assert!(matches_pattern(&pattern, &jid("romeo@jackal.im/jail")));
        assert!(!matches_pattern(&pattern, &jid("romeo@jackal.im/garden")));
    }

    #[test]
    fn test_domain_matches_everything_on_host() {
        let pattern = jid("jackal.im");
        assert!(matches_pattern(&pattern, &jid("romeo@jackal.im/jail")));
        assert!(matches_pattern(&pattern, &jid("jackal.im")));
        assert!(!matches_pattern(&pattern, &jid("romeo@montague.lit")));
    }

    #[test]
    fn test_absent_components_are_wildcards() {
        let mask = MatchMask::NODE | MatchMask::DOMAIN | MatchMask::RESOURCE;
        assert!(matches(&jid("romeo@jackal.im"), &jid("romeo@jackal.im/jail"), mask));
        assert!(!matches(&jid("romeo@jackal.im"), &jid("juliet@jackal.im/jail"), mask));
    }
}

//! Domains this server is authoritative for.

use std::collections::BTreeSet;
use std::sync::RwLock;

use jid::Jid;

#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: RwLock<BTreeSet<String>>,
}

impl HostRegistry {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: RwLock::new(hosts.into_iter().map(|h| h.into().to_lowercase()).collect()),
        }
    }

    pub fn register(&self, host: impl Into<String>) {
        if let Ok(mut hosts) = self.hosts.write() {
            hosts.insert(host.into().to_lowercase());
        }
    }

    pub fn is_local(&self, domain: &str) -> bool {
        self.hosts
            .read()
            .map(|hosts| hosts.contains(&domain.to_lowercase()))
            .unwrap_or(false)
    }

    /// Whether `jid` belongs to a local domain.
    pub fn is_local_jid(&self, jid: &Jid) -> bool {
        self.is_local(jid.domain().as_str())
    }

    /// The first configured host, used as the server's own address when no
    /// better choice exists.
    pub fn default_host(&self) -> Option<String> {
        self.hosts
            .read()
            .ok()
            .and_then(|hosts| hosts.iter().next().cloned())
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts
            .read()
            .map(|hosts| hosts.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_lookup_is_case_insensitive() {
        let hosts = HostRegistry::new(["Jackal.im"]);
        assert!(hosts.is_local("jackal.im"));
        assert!(hosts.is_local("JACKAL.IM"));
        assert!(!hosts.is_local("montague.lit"));
    }

    #[test]
    fn test_register_and_jid_lookup() {
        let hosts = HostRegistry::default();
        hosts.register("capulet.lit");
        let jid: Jid = "juliet@capulet.lit/balcony".parse().unwrap();
        assert!(hosts.is_local_jid(&jid));
        assert_eq!(hosts.hosts(), vec!["capulet.lit".to_string()]);
    }
}

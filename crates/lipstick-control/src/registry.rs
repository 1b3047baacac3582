//! Tunnel registry: domain -> live control link

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::link::{ControlLink, LinkInfo};

/// What to do when a domain that already has a live link registers again
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegistrationPolicy {
    /// Refuse the newcomer with `DomainAlreadyOwned`
    #[default]
    Reject,
    /// Swap in the newcomer and close the previous link
    Replace,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Domain already owned by a live tunnel: {0}")]
    DomainAlreadyOwned(String),

    #[error("Domain not registered: {0}")]
    DomainNotRegistered(String),
}

/// Concurrent map of live control links keyed by domain
///
/// Each domain lives in its own shard slot, so operations on unrelated
/// domains never wait on each other.
pub struct TunnelRegistry {
    links: DashMap<String, ControlLink>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            links: DashMap::new(),
        }
    }

    /// Register `link` under its domain
    ///
    /// A previous link that is already closed is always replaced. Returns the
    /// displaced link, which has been closed before returning.
    pub fn register(
        &self,
        link: ControlLink,
        policy: RegistrationPolicy,
    ) -> Result<Option<ControlLink>, RegistryError> {
        let domain = link.domain().to_string();

        let previous = match self.links.entry(domain.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() && policy == RegistrationPolicy::Reject {
                    debug!("Rejected second registration for {}", domain);
                    return Err(RegistryError::DomainAlreadyOwned(domain));
                }
                Some(entry.insert(link))
            }
            Entry::Vacant(entry) => {
                entry.insert(link);
                None
            }
        };

        if let Some(old) = &previous {
            info!("Replaced control link {} for {}", old.id(), domain);
            old.close();
        }

        Ok(previous)
    }

    /// Live link for `domain`, if any
    pub fn lookup(&self, domain: &str) -> Option<ControlLink> {
        self.links
            .get(domain)
            .map(|entry| entry.value().clone())
            .filter(|link| !link.is_closed())
    }

    /// Remove whatever link owns `domain`
    pub fn unregister(&self, domain: &str) -> Result<ControlLink, RegistryError> {
        self.links
            .remove(domain)
            .map(|(_, link)| link)
            .ok_or_else(|| RegistryError::DomainNotRegistered(domain.to_string()))
    }

    /// Remove the entry for `domain` only if it still belongs to `link_id`
    pub fn unregister_link(&self, domain: &str, link_id: Uuid) -> bool {
        self.links
            .remove_if(domain, |_, link| link.id() == link_id)
            .is_some()
    }

    pub fn list(&self) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = self.links.iter().map(|entry| entry.value().info()).collect();
        links.sort_by(|a, b| a.domain.cmp(&b.domain));
        links
    }

    pub fn count(&self) -> usize {
        self.links.len()
    }

    /// Remove and return every link
    pub fn drain(&self) -> Vec<ControlLink> {
        let domains: Vec<String> = self.links.iter().map(|entry| entry.key().clone()).collect();
        domains
            .into_iter()
            .filter_map(|domain| self.links.remove(&domain).map(|(_, link)| link))
            .collect()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_and_lookup() {
        let registry = TunnelRegistry::new();
        let (link, _rx) = ControlLink::new("api.example.com", 4);
        let id = link.id();

        assert!(registry.register(link, RegistrationPolicy::Reject).unwrap().is_none());

        assert_eq!(registry.lookup("api.example.com").unwrap().id(), id);
        assert!(registry.lookup("web.example.com").is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_reject_policy() {
        let registry = TunnelRegistry::new();
        let (first, _rx1) = ControlLink::new("api.example.com", 4);
        let (second, _rx2) = ControlLink::new("api.example.com", 4);
        let first_id = first.id();

        registry.register(first, RegistrationPolicy::Reject).unwrap();
        let result = registry.register(second, RegistrationPolicy::Reject);

        assert_eq!(
            result.unwrap_err(),
            RegistryError::DomainAlreadyOwned("api.example.com".to_string())
        );
        assert_eq!(registry.lookup("api.example.com").unwrap().id(), first_id);
    }

    #[test]
    fn test_replace_policy_closes_previous() {
        let registry = TunnelRegistry::new();
        let (first, _rx1) = ControlLink::new("api.example.com", 4);
        let (second, _rx2) = ControlLink::new("api.example.com", 4);
        let second_id = second.id();
        let first_handle = first.clone();

        registry.register(first, RegistrationPolicy::Replace).unwrap();
        let previous = registry
            .register(second, RegistrationPolicy::Replace)
            .unwrap()
            .expect("previous link returned");

        assert_eq!(previous.id(), first_handle.id());
        assert!(first_handle.is_closed());
        assert_eq!(registry.lookup("api.example.com").unwrap().id(), second_id);
    }

    #[test]
    fn test_closed_link_is_replaced_under_reject() {
        let registry = TunnelRegistry::new();
        let (first, _rx1) = ControlLink::new("api.example.com", 4);
        let (second, _rx2) = ControlLink::new("api.example.com", 4);
        let second_id = second.id();

        registry.register(first.clone(), RegistrationPolicy::Reject).unwrap();
        first.close();
        assert!(registry.lookup("api.example.com").is_none());

        registry.register(second, RegistrationPolicy::Reject).unwrap();
        assert_eq!(registry.lookup("api.example.com").unwrap().id(), second_id);
    }

    #[test]
    fn test_unregister_link_ignores_successor() {
        let registry = TunnelRegistry::new();
        let (first, _rx1) = ControlLink::new("api.example.com", 4);
        let (second, _rx2) = ControlLink::new("api.example.com", 4);
        let first_id = first.id();
        let second_id = second.id();

        registry.register(first, RegistrationPolicy::Replace).unwrap();
        registry.register(second, RegistrationPolicy::Replace).unwrap();

        // Late termination of the replaced link must not evict the new one
        assert!(!registry.unregister_link("api.example.com", first_id));
        assert_eq!(registry.lookup("api.example.com").unwrap().id(), second_id);

        assert!(registry.unregister_link("api.example.com", second_id));
        assert!(registry.lookup("api.example.com").is_none());
    }

    #[test]
    fn test_unregister_unknown() {
        let registry = TunnelRegistry::new();
        assert_eq!(
            registry.unregister("nope.example.com").unwrap_err(),
            RegistryError::DomainNotRegistered("nope.example.com".to_string())
        );
    }

    #[test]
    fn test_list_and_drain() {
        let registry = TunnelRegistry::new();
        let mut receivers = Vec::new();
        for domain in ["b.example.com", "a.example.com"] {
            let (link, rx) = ControlLink::new(domain, 4);
            receivers.push(rx);
            registry.register(link, RegistrationPolicy::Reject).unwrap();
        }

        let domains: Vec<String> = registry.list().into_iter().map(|l| l.domain).collect();
        assert_eq!(domains, vec!["a.example.com", "b.example.com"]);

        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_register_unregister_is_linearizable() {
        let registry = Arc::new(TunnelRegistry::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let domain = format!("svc-{}.example.com", i);
                for _ in 0..100 {
                    let (link, _rx) = ControlLink::new(domain.clone(), 1);
                    let id = link.id();
                    registry.register(link, RegistrationPolicy::Reject).unwrap();
                    assert_eq!(registry.lookup(&domain).map(|l| l.id()), Some(id));
                    assert!(registry.unregister_link(&domain, id));
                    assert!(registry.lookup(&domain).is_none());
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_single_winner() {
        let registry = Arc::new(TunnelRegistry::new());
        let mut handles = Vec::new();

        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let (link, rx) = ControlLink::new("race.example.com", 1);
                let won = registry.register(link, RegistrationPolicy::Reject).is_ok();
                (won, rx)
            }));
        }

        let mut winners = 0;
        let mut receivers = Vec::new();
        for handle in handles {
            let (won, rx) = handle.await.unwrap();
            receivers.push(rx);
            if won {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}

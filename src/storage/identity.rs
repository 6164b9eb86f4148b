//! Identity map for key-less entity types
//!
//! Associates a live instance (by its [`Identity`]) with the row id it was
//! saved as or inflated from. An entry stays valid exactly as long as the
//! instance does; dead entries are pruned periodically.

use crate::entity::Identity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Weak;

const PRUNE_INTERVAL: usize = 256;

#[derive(Default)]
struct Entries {
    rows: HashMap<usize, (Weak<()>, i64)>,
    inserts_since_prune: usize,
}

/// Instance to row id associations, shared by one engine.
#[derive(Default)]
pub struct IdentityMap {
    entries: Mutex<Entries>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row id previously recorded for this instance
    pub fn get(&self, identity: &Identity) -> Option<i64> {
        let entries = self.entries.lock();
        entries
            .rows
            .get(&identity.key())
            .filter(|(token, _)| token.strong_count() > 0)
            .map(|(_, id)| *id)
    }

    /// Record (or overwrite) the row id of an instance
    pub fn insert(&self, identity: &Identity, id: i64) {
        let mut entries = self.entries.lock();
        entries.rows.insert(identity.key(), (identity.token(), id));
        entries.inserts_since_prune += 1;
        if entries.inserts_since_prune >= PRUNE_INTERVAL {
            Self::prune_locked(&mut entries);
        }
    }

    /// Drop entries whose instance no longer exists
    pub fn prune(&self) -> usize {
        Self::prune_locked(&mut self.entries.lock())
    }

    fn prune_locked(entries: &mut Entries) -> usize {
        let before = entries.rows.len();
        entries.rows.retain(|_, (token, _)| token.strong_count() > 0);
        entries.inserts_since_prune = 0;
        before - entries.rows.len()
    }

    /// Number of entries, live or not yet pruned
    pub fn len(&self) -> usize {
        self.entries.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap").field("entries", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_by_instance() {
        let map = IdentityMap::new();
        let a = Identity::new();
        let b = Identity::new();

        map.insert(&a, 1);
        assert_eq!(map.get(&a), Some(1));
        assert_eq!(map.get(&b), None);

        map.insert(&a, 5);
        assert_eq!(map.get(&a), Some(5));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_clone_is_not_tracked() {
        let map = IdentityMap::new();
        let a = Identity::new();
        map.insert(&a, 1);
        assert_eq!(map.get(&a.clone()), None);
    }

    #[test]
    fn test_prune_drops_dead_instances() {
        let map = IdentityMap::new();
        let kept = Identity::new();
        map.insert(&kept, 1);
        {
            let gone = Identity::new();
            map.insert(&gone, 2);
        }

        assert_eq!(map.len(), 2);
        assert_eq!(map.prune(), 1);
        assert_eq!(map.get(&kept), Some(1));
    }

    #[test]
    fn test_periodic_prune() {
        let map = IdentityMap::new();
        for id in 0..(PRUNE_INTERVAL as i64 * 2) {
            map.insert(&Identity::new(), id);
        }
        assert!(map.len() < PRUNE_INTERVAL);
    }
}

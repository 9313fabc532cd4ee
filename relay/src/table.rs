//! Table holds the routing table shared by a role's reconciler (writer) and relay (reader).

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::delegate::Delegate;

/// RoutingTable maps hook names to delegates.
///
/// Every operation takes a single table-wide lock for its own duration only; nothing holds it
/// across an await point. Values are swapped whole, so a reader never sees a half-updated entry.
///
/// Alongside the routes, the table records which configuration objects declared each hook so
/// that a deleted object's hooks can be withdrawn, and the UID of the last deletion seen for each
/// object so that a stale copy of a deleted object cannot install its hooks again.
#[derive(Default)]
pub struct RoutingTable {
    routes: Mutex<Routes>,
}

#[derive(Default)]
struct Routes {
    delegates: HashMap<String, Arc<Delegate>>,
    // Hook name to the objects that declared it.
    owners: HashMap<String, BTreeSet<String>>,
    // Object name to the UID of its most recent deletion.
    retired: HashMap<String, String>,
}

impl Routes {
    fn release(&mut self, owner: &str, keep: &BTreeSet<String>) -> Vec<String> {
        let mut evicted = Vec::new();
        self.owners.retain(|hook, owners| {
            if keep.contains(hook) || !owners.remove(owner) || !owners.is_empty() {
                return true;
            }
            evicted.push(hook.clone());
            false
        });
        for hook in &evicted {
            self.delegates.remove(hook);
        }
        evicted
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a torn entry behind, so a poisoned lock is
    // still usable.
    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get returns the delegate currently installed for `hook`.
    pub fn get(&self, hook: &str) -> Option<Arc<Delegate>> {
        self.lock().delegates.get(hook).cloned()
    }

    /// Insert installs `delegate` for `hook`, replacing any previous delegate, and records `owner`
    /// as one of the objects declaring it.
    pub fn insert(&self, owner: &str, hook: &str, delegate: Delegate) {
        let delegate = Arc::new(delegate);
        let mut routes = self.lock();
        routes.delegates.insert(hook.to_string(), delegate);
        routes
            .owners
            .entry(hook.to_string())
            .or_default()
            .insert(owner.to_string());
    }

    /// Release drops `owner`'s claim on every hook not in `keep`. Hooks left without any owner
    /// are removed and returned.
    pub fn release(&self, owner: &str, keep: &BTreeSet<String>) -> Vec<String> {
        self.lock().release(owner, keep)
    }

    /// Remove_owner drops every claim `owner` has, as when its object is deleted.
    pub fn remove_owner(&self, owner: &str) -> Vec<String> {
        self.release(owner, &BTreeSet::new())
    }

    /// Retire drops every claim `owner` has and remembers that the object with `uid` is gone.
    pub fn retire(&self, owner: &str, uid: &str) -> Vec<String> {
        let mut routes = self.lock();
        routes.retired.insert(owner.to_string(), uid.to_string());
        routes.release(owner, &BTreeSet::new())
    }

    /// Is_retired reports whether the object `owner` with `uid` has been deleted.
    ///
    /// A re-created object has a new UID and is not retired.
    pub fn is_retired(&self, owner: &str, uid: &str) -> bool {
        self.lock().retired.get(owner).is_some_and(|u| u == uid)
    }

    /// Retain_owners drops the claims of every owner not in `live`.
    pub fn retain_owners(&self, live: &BTreeSet<String>) -> Vec<String> {
        let mut routes = self.lock();
        let stale: BTreeSet<String> = routes
            .owners
            .values()
            .flatten()
            .filter(|o| !live.contains(*o))
            .cloned()
            .collect();
        let keep = BTreeSet::new();
        let mut evicted = Vec::new();
        for owner in &stale {
            evicted.extend(routes.release(owner, &keep));
        }
        evicted
    }

    /// Owned_by lists the hooks `owner` has declared.
    #[cfg(test)]
    pub(crate) fn owned_by(&self, owner: &str) -> BTreeSet<String> {
        self.lock()
            .owners
            .iter()
            .filter(|(_, owners)| owners.contains(owner))
            .map(|(hook, _)| hook.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().delegates.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.lock().delegates.is_empty()
    }
}

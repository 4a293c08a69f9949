use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::thread::ThreadId;

const NUM_SHARDS: usize = 16;

/// The logical role a runtime thread was spawned for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Role {
    /// an application thread, carrying its global worker id
    Worker(usize),
    /// a transport polling thread, carrying its local progress index
    Progress(usize),
}

/// Write-once, read-many mapping from OS thread identity to [Role].
///
/// Every runtime thread registers itself immediately after it is spawned and
/// before it does anything observable to other threads. Entries are never removed.
#[derive(Debug)]
pub(crate) struct RoleRegistry {
    shards: Vec<RwLock<HashMap<ThreadId, Role>>>,
}

impl Default for RoleRegistry {
    fn default() -> Self {
        RoleRegistry {
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }
}

impl RoleRegistry {
    pub(crate) fn new() -> RoleRegistry {
        Self::default()
    }

    fn shard(&self, id: &ThreadId) -> &RwLock<HashMap<ThreadId, Role>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % NUM_SHARDS]
    }

    /// record the role of `id`, a thread may only be registered once
    pub(crate) fn register(&self, id: ThreadId, role: Role) {
        let prev = self.shard(&id).write().insert(id, role);
        assert!(
            prev.is_none(),
            "thread {:?} registered twice (was {:?}, now {:?})",
            id,
            prev,
            role
        );
    }

    /// register the calling thread
    pub(crate) fn register_current(&self, role: Role) {
        self.register(std::thread::current().id(), role);
    }

    pub(crate) fn try_resolve(&self, id: &ThreadId) -> Option<Role> {
        self.shard(id).read().get(id).copied()
    }

    /// look up the role of `id`
    ///
    /// Panics when `id` has not been registered, resolving an unregistered thread is a protocol violation.
    pub(crate) fn resolve(&self, id: &ThreadId) -> Role {
        match self.try_resolve(id) {
            Some(role) => role,
            None => panic!("thread {:?} resolved before it was registered", id),
        }
    }

    pub(crate) fn current(&self) -> Option<Role> {
        self.try_resolve(&std::thread::current().id())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn register_then_resolve_from_many_threads() {
        let registry = Arc::new(RoleRegistry::new());
        let ids = std::thread::scope(|s| {
            let handles = (0..8)
                .map(|i| {
                    let registry = registry.clone();
                    s.spawn(move || {
                        let role = if i % 2 == 0 {
                            Role::Worker(i)
                        } else {
                            Role::Progress(i)
                        };
                        registry.register_current(role);
                        assert_eq!(registry.current(), Some(role));
                        (std::thread::current().id(), role)
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(registry.len(), 8);
        for (id, role) in ids {
            assert_eq!(registry.resolve(&id), role);
        }
        assert_eq!(registry.current(), None);
    }

    #[test]
    #[should_panic(expected = "before it was registered")]
    fn resolve_unregistered_panics() {
        let registry = RoleRegistry::new();
        registry.resolve(&std::thread::current().id());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_register_panics() {
        let registry = RoleRegistry::new();
        registry.register_current(Role::Worker(0));
        registry.register_current(Role::Worker(1));
    }
}

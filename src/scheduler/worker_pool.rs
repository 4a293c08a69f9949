use crate::error::{ConfigError, ConfigResult};
use crate::registry::{Role, RoleRegistry};
use crate::scheduler::pin_current;

use core_affinity::CoreId;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{Scope, ScopedJoinHandle};

/// What a worker needs to know to join the pool of its rank
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerPool<'env> {
    pub(crate) rank: usize,
    pub(crate) num_workers: usize,
    pub(crate) cores: Option<&'env [CoreId]>,
    pub(crate) registry: &'env RoleRegistry,
    pub(crate) initialized: &'env AtomicUsize,
    pub(crate) abort: &'env AtomicBool,
}

/// how a launched pool ended
pub(crate) enum PoolOutcome {
    Completed,
    Failed(ConfigError),
    Panicked(Box<dyn Any + Send + 'static>),
}

impl<'env> WorkerPool<'env> {
    /// Spawn the workers of this rank, each of them runs `body(local_index)` once every
    /// local worker has registered itself.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn launch<'scope, F>(
        self,
        scope: &'scope Scope<'scope, 'env>,
        body: &'env F,
    ) -> ConfigResult<Vec<ScopedJoinHandle<'scope, ConfigResult<()>>>>
    where
        F: Fn(usize) + Sync,
    {
        self.initialized.store(0, Ordering::SeqCst);
        self.abort.store(false, Ordering::SeqCst);
        let mut threads = Vec::with_capacity(self.num_workers);
        for local in 0..self.num_workers {
            let builder = std::thread::Builder::new().name(format!("worker_thread_{}", local));
            match builder.spawn_scoped(scope, move || self.worker_main(local, body)) {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    // release the workers already spinning on the startup counter
                    self.abort.store(true, Ordering::SeqCst);
                    return Err(ConfigError::Spawn(e.to_string()));
                }
            }
        }
        Ok(threads)
    }

    fn worker_main<F: Fn(usize) + Sync>(self, local: usize, body: &F) -> ConfigResult<()> {
        if let Some(cores) = self.cores {
            if let Err(e) = pin_current(cores[local], &format!("worker_thread_{}", local)) {
                self.abort.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        let global = local + self.rank * self.num_workers;
        self.registry.register_current(Role::Worker(global));
        self.initialized.fetch_add(1, Ordering::SeqCst);
        while self.initialized.load(Ordering::SeqCst) < self.num_workers {
            if self.abort.load(Ordering::SeqCst) {
                return Ok(());
            }
            std::thread::yield_now();
        }
        if self.abort.load(Ordering::SeqCst) {
            return Ok(());
        }
        tracing::trace!(global, local, "worker starting");
        body(local);
        Ok(())
    }

    /// wait for every worker, reporting the first configuration error or panic
    pub(crate) fn join(threads: Vec<ScopedJoinHandle<'_, ConfigResult<()>>>) -> PoolOutcome {
        let mut outcome = PoolOutcome::Completed;
        for thread in threads {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if let PoolOutcome::Completed = outcome {
                        outcome = PoolOutcome::Failed(e);
                    }
                }
                Err(panic) => {
                    if !matches!(outcome, PoolOutcome::Panicked(_)) {
                        outcome = PoolOutcome::Panicked(panic);
                    }
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn pool<'env>(
        rank: usize,
        num_workers: usize,
        registry: &'env RoleRegistry,
        initialized: &'env AtomicUsize,
        abort: &'env AtomicBool,
    ) -> WorkerPool<'env> {
        WorkerPool {
            rank,
            num_workers,
            cores: None,
            registry,
            initialized,
            abort,
        }
    }

    #[test]
    fn every_worker_sees_all_siblings_registered() {
        let registry = RoleRegistry::new();
        let initialized = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let seen = Mutex::new(vec![]);
        let body = |local: usize| {
            assert_eq!(initialized.load(Ordering::SeqCst), 6);
            let role = registry.current();
            seen.lock().push((local, role));
        };
        let outcome = std::thread::scope(|s| {
            let threads = pool(2, 6, &registry, &initialized, &abort)
                .launch(s, &body)
                .unwrap();
            WorkerPool::join(threads)
        });
        assert!(matches!(outcome, PoolOutcome::Completed));
        let mut seen = seen.into_inner();
        seen.sort_by_key(|(local, _)| *local);
        let expected = (0..6)
            .map(|local| (local, Some(Role::Worker(local + 12))))
            .collect::<Vec<_>>();
        assert_eq!(seen, expected);
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn abort_releases_spinning_workers() {
        let registry = RoleRegistry::new();
        let initialized = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let ran = AtomicUsize::new(0);
        let body = |_local: usize| {
            ran.fetch_add(1, Ordering::SeqCst);
        };
        // one more worker than will ever register, so nobody gets past the startup spin
        let pool = pool(0, 4, &registry, &initialized, &abort);
        let outcome = std::thread::scope(|s| {
            let mut threads = vec![];
            for local in 0..3 {
                threads.push(s.spawn(move || pool.worker_main(local, &body)));
            }
            while initialized.load(Ordering::SeqCst) < 3 {
                std::thread::yield_now();
            }
            abort.store(true, Ordering::SeqCst);
            WorkerPool::join(threads)
        });
        assert!(matches!(outcome, PoolOutcome::Completed));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn worker_panic_is_reported() {
        let registry = RoleRegistry::new();
        let initialized = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let body = |local: usize| {
            if local == 1 {
                panic!("worker failed");
            }
        };
        let outcome = std::thread::scope(|s| {
            let threads = pool(0, 3, &registry, &initialized, &abort)
                .launch(s, &body)
                .unwrap();
            WorkerPool::join(threads)
        });
        assert!(matches!(outcome, PoolOutcome::Panicked(_)));
    }
}

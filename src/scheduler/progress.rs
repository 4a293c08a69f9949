use crate::error::{ConfigError, ConfigResult};
use crate::lamellae::{Lamellae, LamellaeComm};
use crate::registry::{Role, RoleRegistry};
use crate::scheduler::pin_current;

use core_affinity::CoreId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{Scope, ScopedJoinHandle};

/// The threads of one rank that do nothing but poll the transport
pub(crate) struct ProgressEngine<'scope> {
    shutdown: &'scope AtomicBool,
    threads: Vec<ScopedJoinHandle<'scope, ()>>,
}

impl<'scope> std::fmt::Debug for ProgressEngine<'scope> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProgressEngine {{ threads: {} }}", self.threads.len())
    }
}

impl<'scope> ProgressEngine<'scope> {
    /// Spawn `num_threads` progress threads, pinning thread `j` to `cores[j]` when cores are given.
    ///
    /// Returns once every thread has registered itself, or with an error if any of them could not be pinned.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn start<'env>(
        scope: &'scope Scope<'scope, 'env>,
        num_threads: usize,
        cores: Option<&'env [CoreId]>,
        lamellae: &'env Lamellae,
        registry: &'env RoleRegistry,
        shutdown: &'scope AtomicBool,
    ) -> ConfigResult<ProgressEngine<'scope>>
    where
        'env: 'scope,
    {
        shutdown.store(false, Ordering::SeqCst);
        let active_cnt = Arc::new(AtomicUsize::new(0));
        let failed: Arc<Mutex<Option<ConfigError>>> = Arc::new(Mutex::new(None));
        let mut engine = ProgressEngine {
            shutdown,
            threads: Vec::with_capacity(num_threads),
        };
        for idx in 0..num_threads {
            let core = cores.map(|cores| cores[idx]);
            let active_cnt = active_cnt.clone();
            let failed = failed.clone();
            let builder = std::thread::Builder::new().name(format!("progress_thread_{}", idx));
            let spawned = builder.spawn_scoped(scope, move || {
                if let Some(core) = core {
                    if let Err(e) = pin_current(core, &format!("progress_thread_{}", idx)) {
                        *failed.lock() = Some(e);
                        active_cnt.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                }
                registry.register_current(Role::Progress(idx));
                active_cnt.fetch_add(1, Ordering::SeqCst);
                progress_loop(lamellae, shutdown);
            });
            match spawned {
                Ok(handle) => engine.threads.push(handle),
                Err(e) => {
                    engine.shutdown();
                    return Err(ConfigError::Spawn(e.to_string()));
                }
            }
        }
        while active_cnt.load(Ordering::SeqCst) != num_threads {
            std::thread::yield_now();
        }
        if let Some(e) = failed.lock().take() {
            engine.shutdown();
            return Err(e);
        }
        tracing::debug!(num_threads, "progress engine started");
        Ok(engine)
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// raise the shutdown flag and wait for every progress thread to exit
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for thread in self.threads {
            if let Err(panic) = thread.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

fn progress_loop(lamellae: &Lamellae, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        if lamellae.poll() == 0 {
            std::thread::yield_now();
        }
    }
}

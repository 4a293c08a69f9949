use crate::lamellae::{Lamellae, LamellaeComm};
use crate::warnings::{DeadlockTimer, RuntimeWarning};

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A reusable barrier between the workers of one rank
#[derive(Debug)]
pub(crate) struct LocalBarrier {
    num_threads: AtomicUsize,
    arrived: CachePadded<AtomicUsize>,
    generation: CachePadded<AtomicUsize>,
}

impl LocalBarrier {
    pub(crate) fn new(num_threads: usize) -> LocalBarrier {
        LocalBarrier {
            num_threads: AtomicUsize::new(num_threads),
            arrived: CachePadded::new(AtomicUsize::new(0)),
            generation: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// change the number of participants, only valid while nobody is waiting
    pub(crate) fn prepare(&self, num_threads: usize) {
        assert_eq!(
            self.arrived.load(Ordering::Acquire),
            0,
            "local barrier resized while threads are waiting"
        );
        self.num_threads.store(num_threads, Ordering::Release);
    }

    /// block until every participant has called `wait`, running `assist` while spinning
    pub(crate) fn wait(&self, deadlock_timeout: f64, assist: impl Fn() -> usize) {
        let generation = self.generation.load(Ordering::Acquire);
        let num_threads = self.num_threads.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == num_threads {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
            return;
        }
        let mut timer = DeadlockTimer::new(deadlock_timeout);
        while self.generation.load(Ordering::Acquire) == generation {
            if assist() == 0 {
                std::thread::yield_now();
            }
            timer.check(RuntimeWarning::BarrierTimeout);
        }
    }
}

/// The collective barrier across every worker of every rank.
///
/// The workers of a rank first meet locally, the representative (local worker 0) then joins the
/// rank level barrier of the transport, and finally all local workers meet again. The second local
/// meeting keeps the other workers of a rank from running ahead while the representative is still
/// synchronizing with the other ranks.
#[derive(Debug)]
pub(crate) struct Barrier {
    lamellae: Arc<Lamellae>,
    local: LocalBarrier,
}

impl Barrier {
    pub(crate) fn new(lamellae: Arc<Lamellae>, num_workers: usize) -> Barrier {
        Barrier {
            lamellae,
            local: LocalBarrier::new(num_workers),
        }
    }

    pub(crate) fn prepare(&self, num_workers: usize) {
        self.local.prepare(num_workers);
    }

    /// Called by every local worker.
    ///
    /// `assist_progress` lets waiting workers poll the transport, only meant for runs without
    /// progress threads where nobody else would.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn barrier(&self, local_worker: usize, deadlock_timeout: f64, assist_progress: bool) {
        let assist = || {
            if assist_progress {
                self.lamellae.poll()
            } else {
                0
            }
        };
        self.local.wait(deadlock_timeout, &assist);
        if local_worker == 0 {
            self.lamellae.barrier(assist_progress);
        }
        self.local.wait(deadlock_timeout, &assist);
    }

    /// rank level barrier for threads that are not workers, they keep serving the inbox while waiting
    pub(crate) fn node_barrier(&self) {
        self.lamellae.barrier(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lamellae::inproc_lamellae::InProcBuilder;
    use crate::lamellae::{InProcFabric, LamellaeBuilder, LamellaeInit};

    #[test]
    fn local_barrier_is_reusable() {
        let barrier = LocalBarrier::new(4);
        let counter = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for round in 1..=20 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        barrier.wait(0.0, || 0);
                        assert!(counter.load(Ordering::SeqCst) >= round * 4);
                        barrier.wait(0.0, || 0);
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 80);
        barrier.prepare(2);
    }

    #[test]
    fn no_worker_leaves_before_every_rank_arrives() {
        let num_ranks = 3;
        let num_workers = 2;
        let fabric = InProcFabric::new(num_ranks);
        let barriers = (0..num_ranks)
            .map(|rank| {
                let lamellae = LamellaeBuilder::InProc(InProcBuilder::new(fabric.clone(), rank))
                    .init_lamellae(1, 8)
                    .unwrap();
                Barrier::new(lamellae, num_workers)
            })
            .collect::<Vec<_>>();
        let arrived = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for barrier in barriers.iter() {
                for local in 0..num_workers {
                    let arrived = &arrived;
                    s.spawn(move || {
                        for round in 1..=5 {
                            arrived.fetch_add(1, Ordering::SeqCst);
                            barrier.barrier(local, 0.0, false);
                            assert!(arrived.load(Ordering::SeqCst) >= round * num_ranks * num_workers);
                            barrier.barrier(local, 0.0, false);
                        }
                    });
                }
            }
        });
    }
}

use super::{
    AmHandler, Backend, HandlerId, HandlerTable, Lamellae, LamellaeComm, LamellaeInit, Message,
};
use crate::error::{ConfigError, ConfigResult};

use crossbeam::queue::SegQueue;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Connects several ranks that live inside one OS process.
///
/// Each rank owns a lock-free inbox; sending to a rank pushes onto its inbox and the
/// receiving rank's progress threads drain it. The fabric also provides the rank-level
/// collective barrier.
///
/// # Examples
///```
/// use lamellar_rpc::{InProcFabric, RpcWorldBuilder};
///
/// let fabric = InProcFabric::new(2);
/// std::thread::scope(|s| {
///     for rank in 0..2 {
///         let fabric = fabric.clone();
///         s.spawn(move || {
///             let world = RpcWorldBuilder::new().with_fabric(fabric, rank).build().unwrap();
///             world.finalize();
///         });
///     }
/// });
///```
#[derive(Debug)]
pub struct InProcFabric {
    num_ranks: usize,
    inboxes: Vec<SegQueue<Message>>,
    attached: Vec<AtomicBool>,
    arrived: CachePadded<AtomicUsize>,
    generation: CachePadded<AtomicUsize>,
}

impl InProcFabric {
    /// Create a fabric for `num_ranks` ranks
    pub fn new(num_ranks: usize) -> Arc<InProcFabric> {
        assert!(num_ranks > 0, "an InProcFabric needs at least one rank");
        Arc::new(InProcFabric {
            num_ranks,
            inboxes: (0..num_ranks).map(|_| SegQueue::new()).collect(),
            attached: (0..num_ranks).map(|_| AtomicBool::new(false)).collect(),
            arrived: CachePadded::new(AtomicUsize::new(0)),
            generation: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    /// Number of ranks connected by this fabric
    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// Messages delivered to `rank` that have not been polled yet
    pub fn queued(&self, rank: usize) -> usize {
        self.inboxes[rank].len()
    }

    fn attach(&self, rank: usize) -> ConfigResult<()> {
        if rank >= self.num_ranks {
            return Err(ConfigError::Transport(format!(
                "rank {} does not exist on a fabric of {} ranks",
                rank, self.num_ranks
            )));
        }
        if self.attached[rank].swap(true, Ordering::AcqRel) {
            return Err(ConfigError::Transport(format!(
                "rank {} is already attached to this fabric",
                rank
            )));
        }
        Ok(())
    }
}

pub(crate) struct InProcBuilder {
    fabric: Arc<InProcFabric>,
    rank: usize,
}

impl InProcBuilder {
    pub(crate) fn new(fabric: Arc<InProcFabric>, rank: usize) -> InProcBuilder {
        InProcBuilder { fabric, rank }
    }
}

impl LamellaeInit for InProcBuilder {
    fn init_lamellae(self, segment_size: usize, poll_batch: usize) -> ConfigResult<Arc<Lamellae>> {
        self.fabric.attach(self.rank)?;
        Ok(Arc::new(Lamellae::InProc(InProc {
            rank: self.rank,
            fabric: self.fabric,
            handlers: HandlerTable::default(),
            segment_size,
            poll_batch: std::cmp::max(1, poll_batch),
            bytes_sent: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
        })))
    }
}

pub(crate) struct InProc {
    rank: usize,
    fabric: Arc<InProcFabric>,
    handlers: HandlerTable,
    segment_size: usize,
    poll_batch: usize,
    bytes_sent: AtomicUsize,
    finalized: AtomicBool,
}

impl std::fmt::Debug for InProc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "InProc {{ rank: {}, num_ranks: {}, segment_size: {}MB }}",
            self.rank, self.fabric.num_ranks, self.segment_size
        )
    }
}

impl LamellaeComm for InProc {
    fn my_rank(&self) -> usize {
        self.rank
    }
    fn num_ranks(&self) -> usize {
        self.fabric.num_ranks
    }
    fn backend(&self) -> Backend {
        Backend::InProc
    }
    fn register_handler(&self, id: HandlerId, handler: AmHandler) {
        self.handlers.register(id, handler);
    }
    fn send_am(&self, dst: usize, id: HandlerId, payload: Vec<u8>) {
        assert!(
            dst < self.fabric.num_ranks,
            "invalid destination rank {} (num ranks {})",
            dst,
            self.fabric.num_ranks
        );
        assert!(
            !self.finalized.load(Ordering::Acquire),
            "send_am called after finalize"
        );
        self.bytes_sent.fetch_add(payload.len(), Ordering::Relaxed);
        self.fabric.inboxes[dst].push(Message {
            src: self.rank,
            handler: id,
            payload,
        });
    }
    fn poll(&self) -> usize {
        self.handlers
            .drain(&self.fabric.inboxes[self.rank], self.poll_batch)
    }
    fn barrier(&self, serve_inbox: bool) {
        let fabric = &self.fabric;
        let generation = fabric.generation.load(Ordering::Acquire);
        if fabric.arrived.fetch_add(1, Ordering::AcqRel) + 1 == fabric.num_ranks {
            fabric.arrived.store(0, Ordering::Relaxed);
            fabric.generation.fetch_add(1, Ordering::Release);
            return;
        }
        while fabric.generation.load(Ordering::Acquire) == generation {
            if !serve_inbox || self.poll() == 0 {
                std::thread::yield_now();
            }
        }
    }
    fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }
    fn finalize(&self) {
        self.finalized.store(true, Ordering::Release);
    }
}

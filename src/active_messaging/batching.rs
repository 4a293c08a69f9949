use crate::active_messaging::registered_rpc::{RpcCall, RPC_REQUEST};
use crate::lamellae::{Lamellae, LamellaeComm};

pub(crate) mod agg_buffer;
use agg_buffer::AggBuffer;

use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counters describing what the aggregator of one rank has handed to the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggStats {
    /// request batches sent, including single call batches from `rpc`
    pub batches_sent: usize,
    /// calls contained in those batches
    pub calls_sent: usize,
    /// payload bytes this rank gave to the transport (requests and replies)
    pub bytes_sent: usize,
}

/// Per destination aggregation of outgoing calls.
///
/// Buffers are indexed by `[slot][destination rank]`. Slot `i < num_workers` belongs to the
/// local worker `i`, the final slot is shared by every other thread (the main thread, or a
/// progress thread issuing calls from inside a handler).
#[derive(Debug)]
pub(crate) struct Aggregator {
    lamellae: Arc<Lamellae>,
    num_ranks: usize,
    agg_size: AtomicUsize,
    buffers: RwLock<Vec<Vec<AggBuffer>>>,
    batches_sent: AtomicUsize,
    calls_sent: AtomicUsize,
}

impl Aggregator {
    pub(crate) fn new(lamellae: Arc<Lamellae>, agg_size: usize, num_workers: usize) -> Aggregator {
        let agg = Aggregator {
            num_ranks: lamellae.num_ranks(),
            lamellae,
            agg_size: AtomicUsize::new(agg_size),
            buffers: RwLock::new(Vec::new()),
            batches_sent: AtomicUsize::new(0),
            calls_sent: AtomicUsize::new(0),
        };
        agg.prepare(num_workers);
        agg
    }

    /// size the buffer table for `num_workers` local workers plus the shared slot,
    /// pending calls in slots that disappear are sent first
    pub(crate) fn prepare(&self, num_workers: usize) {
        let mut buffers = self.buffers.write();
        if buffers.len() == num_workers + 1 {
            return;
        }
        for slot in buffers.iter() {
            for (dst, buf) in slot.iter().enumerate() {
                buf.flush(|batch| self.send_batch(dst, batch));
            }
        }
        *buffers = (0..=num_workers)
            .map(|_| (0..self.num_ranks).map(|_| AggBuffer::default()).collect())
            .collect();
    }

    /// the slot used by threads that are not workers
    pub(crate) fn shared_slot(&self) -> usize {
        self.buffers.read().len() - 1
    }

    pub(crate) fn agg_size(&self) -> usize {
        self.agg_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_agg_size(&self, agg_size: usize) {
        self.agg_size.store(agg_size, Ordering::Relaxed);
    }

    fn send_batch(&self, dst: usize, batch: Vec<RpcCall>) {
        let num_calls = batch.len();
        match crate::serialize(&batch) {
            Ok(payload) => {
                tracing::trace!(dst, num_calls, bytes = payload.len(), "sending rpc batch");
                self.lamellae.send_am(dst, RPC_REQUEST, payload);
            }
            Err(e) => panic!("unable to serialize rpc batch for rank {}: {}", dst, e),
        }
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.calls_sent.fetch_add(num_calls, Ordering::Relaxed);
    }

    /// buffer `call` for rank `dst`, sending the buffer if it is now full
    pub(crate) fn submit(&self, slot: usize, dst: usize, call: RpcCall) {
        let agg_size = self.agg_size();
        let buffers = self.buffers.read();
        buffers[slot][dst].push(call, agg_size, |batch| self.send_batch(dst, batch));
    }

    /// send `call` to rank `dst` as a batch of its own
    pub(crate) fn send_now(&self, dst: usize, call: RpcCall) {
        self.send_batch(dst, vec![call]);
    }

    /// send every non-empty buffer owned by `slot`, returning how many batches went out
    pub(crate) fn flush_slot(&self, slot: usize) -> usize {
        let buffers = self.buffers.read();
        let mut flushed = 0;
        for (dst, buf) in buffers[slot].iter().enumerate() {
            if buf.flush(|batch| self.send_batch(dst, batch)) {
                flushed += 1;
            }
        }
        if flushed > 0 {
            tracing::debug!(slot, flushed, "flushed aggregation buffers");
        }
        flushed
    }

    pub(crate) fn flush_all(&self) -> usize {
        let num_slots = self.buffers.read().len();
        (0..num_slots).map(|slot| self.flush_slot(slot)).sum()
    }

    /// calls waiting in the buffer of `slot` for rank `dst`
    pub(crate) fn pending(&self, slot: usize, dst: usize) -> usize {
        self.buffers.read()[slot][dst].len()
    }

    pub(crate) fn stats(&self) -> AggStats {
        AggStats {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            calls_sent: self.calls_sent.load(Ordering::Relaxed),
            bytes_sent: self.lamellae.bytes_sent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lamellae::inproc_lamellae::InProcBuilder;
    use crate::lamellae::{InProcFabric, LamellaeBuilder, LamellaeInit};

    fn setup(num_ranks: usize, agg_size: usize, num_workers: usize) -> (Arc<InProcFabric>, Aggregator) {
        let fabric = InProcFabric::new(num_ranks);
        let lamellae = LamellaeBuilder::InProc(InProcBuilder::new(fabric.clone(), 0))
            .init_lamellae(1, 8)
            .unwrap();
        (fabric, Aggregator::new(lamellae, agg_size, num_workers))
    }

    fn call(dst_worker: usize) -> RpcCall {
        RpcCall {
            rpc_id: 1,
            src_worker: Some(0),
            dst_worker,
            future_id: 0,
            args: vec![0; 4],
        }
    }

    #[test]
    fn exactly_agg_size_calls_flush_once() {
        let k = 5;
        let (fabric, agg) = setup(2, k, 2);
        for _ in 0..k {
            agg.submit(0, 1, call(2));
        }
        assert_eq!(fabric.queued(1), 1);
        assert_eq!(agg.pending(0, 1), 0);
        let stats = agg.stats();
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.calls_sent, k);
    }

    #[test]
    fn one_past_agg_size_leaves_one_pending() {
        let k = 4;
        let (fabric, agg) = setup(2, k, 2);
        for _ in 0..=k {
            agg.submit(1, 1, call(3));
        }
        assert_eq!(fabric.queued(1), 1);
        assert_eq!(agg.pending(1, 1), 1);
        assert_eq!(agg.pending(0, 1), 0);
        assert_eq!(agg.flush_slot(1), 1);
        assert_eq!(fabric.queued(1), 2);
        assert_eq!(agg.pending(1, 1), 0);
        assert_eq!(agg.stats().calls_sent, k + 1);
    }

    #[test]
    fn buffers_are_per_destination() {
        let (fabric, agg) = setup(3, 2, 1);
        agg.submit(0, 1, call(1));
        agg.submit(0, 2, call(2));
        assert_eq!(fabric.queued(1) + fabric.queued(2), 0);
        agg.submit(0, 2, call(2));
        assert_eq!(fabric.queued(1), 0);
        assert_eq!(fabric.queued(2), 1);
        assert_eq!(agg.flush_all(), 1);
        assert_eq!(fabric.queued(1), 1);
    }

    #[test]
    fn send_now_bypasses_buffers() {
        let (fabric, agg) = setup(2, 100, 1);
        agg.send_now(1, call(1));
        assert_eq!(fabric.queued(1), 1);
        assert_eq!(agg.pending(0, 1), 0);
        assert_eq!(agg.stats().batches_sent, 1);
    }

    #[test]
    fn prepare_resizes_and_keeps_pending_calls() {
        let (fabric, agg) = setup(2, 100, 1);
        assert_eq!(agg.shared_slot(), 1);
        agg.submit(agg.shared_slot(), 1, call(0));
        agg.prepare(4);
        assert_eq!(agg.shared_slot(), 4);
        assert_eq!(fabric.queued(1), 1);
        assert_eq!(agg.pending(4, 1), 0);
    }
}

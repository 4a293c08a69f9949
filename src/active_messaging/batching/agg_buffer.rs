use crate::active_messaging::registered_rpc::RpcCall;

use parking_lot::Mutex;

/// The pending calls from one slot to one destination rank.
///
/// Sends happen while the buffer lock is held, so batches leaving the same buffer reach the
/// transport in the order their calls were submitted.
#[derive(Debug, Default)]
pub(crate) struct AggBuffer {
    calls: Mutex<Vec<RpcCall>>,
}

impl AggBuffer {
    /// append `call`, handing the whole buffer to `send` once it holds `agg_size` calls
    pub(crate) fn push(&self, call: RpcCall, agg_size: usize, send: impl FnOnce(Vec<RpcCall>)) {
        let mut calls = self.calls.lock();
        calls.push(call);
        if calls.len() >= agg_size {
            let batch = std::mem::replace(&mut *calls, Vec::with_capacity(agg_size));
            send(batch);
        }
    }

    /// hand every pending call to `send`, returns false if the buffer was empty
    pub(crate) fn flush(&self, send: impl FnOnce(Vec<RpcCall>)) -> bool {
        let mut calls = self.calls.lock();
        if calls.is_empty() {
            return false;
        }
        let batch = std::mem::take(&mut *calls);
        send(batch);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(future_id: u64) -> RpcCall {
        RpcCall {
            rpc_id: 1,
            src_worker: None,
            dst_worker: 0,
            future_id,
            args: vec![],
        }
    }

    #[test]
    fn full_buffer_is_sent_in_order() {
        let buf = AggBuffer::default();
        let mut sent = vec![];
        for i in 0..7 {
            buf.push(call(i), 3, |batch| sent.push(batch));
        }
        assert_eq!(sent.len(), 2);
        let ids = sent
            .iter()
            .map(|b| b.iter().map(|c| c.future_id).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![vec![0, 1, 2], vec![3, 4, 5]]);
        assert_eq!(buf.len(), 1);
        assert!(buf.flush(|batch| assert_eq!(batch, vec![call(6)])));
        assert!(!buf.flush(|_| panic!("empty buffer was flushed")));
        assert_eq!(buf.len(), 0);
    }
}

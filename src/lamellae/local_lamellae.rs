use super::{
    AmHandler, Backend, HandlerId, HandlerTable, Lamellae, LamellaeComm, LamellaeInit, Message,
};
use crate::error::ConfigResult;

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) struct LocalBuilder {}

impl LocalBuilder {
    pub(crate) fn new() -> LocalBuilder {
        LocalBuilder {}
    }
}

impl LamellaeInit for LocalBuilder {
    fn init_lamellae(self, segment_size: usize, poll_batch: usize) -> ConfigResult<Arc<Lamellae>> {
        Ok(Arc::new(Lamellae::Local(Local::new(segment_size, poll_batch))))
    }
}

/// A single rank transport: every active message is delivered back into this process
pub(crate) struct Local {
    inbox: SegQueue<Message>,
    handlers: HandlerTable,
    segment_size: usize,
    poll_batch: usize,
    bytes_sent: AtomicUsize,
    finalized: AtomicBool,
}

impl std::fmt::Debug for Local {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Local {{ segment_size: {}MB }}", self.segment_size)
    }
}

impl Local {
    pub(crate) fn new(segment_size: usize, poll_batch: usize) -> Local {
        Local {
            inbox: SegQueue::new(),
            handlers: HandlerTable::default(),
            segment_size,
            poll_batch: std::cmp::max(1, poll_batch),
            bytes_sent: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
        }
    }
}

impl LamellaeComm for Local {
    fn my_rank(&self) -> usize {
        0
    }
    fn num_ranks(&self) -> usize {
        1
    }
    fn backend(&self) -> Backend {
        Backend::Local
    }
    fn register_handler(&self, id: HandlerId, handler: AmHandler) {
        self.handlers.register(id, handler);
    }
    fn send_am(&self, dst: usize, id: HandlerId, payload: Vec<u8>) {
        assert_eq!(dst, 0, "invalid destination rank {} for local lamellae", dst);
        assert!(
            !self.finalized.load(Ordering::Acquire),
            "send_am called after finalize"
        );
        self.bytes_sent.fetch_add(payload.len(), Ordering::Relaxed);
        self.inbox.push(Message {
            src: 0,
            handler: id,
            payload,
        });
    }
    fn poll(&self) -> usize {
        self.handlers.drain(&self.inbox, self.poll_batch)
    }
    fn barrier(&self, _serve_inbox: bool) {}
    fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }
    fn finalize(&self) {
        self.finalized.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn loopback_dispatches_to_handler() {
        let local = Local::new(1, 4);
        let seen = Arc::new(Mutex::new(vec![]));
        let seen_c = seen.clone();
        local.register_handler(
            7,
            Arc::new(move |src: usize, payload: &[u8]| {
                seen_c.lock().unwrap().push((src, payload.to_vec()))
            }),
        );
        local.send_am(0, 7, vec![1, 2, 3]);
        local.send_am(0, 7, vec![4]);
        assert_eq!(local.bytes_sent(), 4);
        assert_eq!(local.poll(), 2);
        assert_eq!(local.poll(), 0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, vec![1, 2, 3]), (0, vec![4])]
        );
    }

    #[test]
    fn poll_is_bounded() {
        let local = Local::new(1, 3);
        local.register_handler(1, Arc::new(|_: usize, _: &[u8]| {}));
        for _ in 0..7 {
            local.send_am(0, 1, vec![]);
        }
        assert_eq!(local.poll(), 3);
        assert_eq!(local.poll(), 3);
        assert_eq!(local.poll(), 1);
    }

    #[test]
    #[should_panic(expected = "no handler registered")]
    fn unknown_handler_panics() {
        let local = Local::new(1, 1);
        local.send_am(0, 9, vec![]);
        local.poll();
    }

    #[test]
    #[should_panic(expected = "after finalize")]
    fn send_after_finalize_panics() {
        let local = Local::new(1, 1);
        local.finalize();
        local.send_am(0, 1, vec![]);
    }
}

use crate::env_var::config;
use crate::error::{ConfigError, ConfigResult};
use crate::rpc_request::ProgressHelper;

use crossbeam::queue::SegQueue;
use enum_dispatch::enum_dispatch;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) mod inproc_lamellae;
pub(crate) mod local_lamellae;

pub use inproc_lamellae::InProcFabric;
use inproc_lamellae::{InProc, InProcBuilder};
use local_lamellae::{Local, LocalBuilder};

/// The list of available lamellae backends, used to specify how batches travel between ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// The Local backend -- a single rank, every message loops back into this process
    Local,
    /// The InProc backend -- several ranks hosted by one process, connected by an [InProcFabric]
    InProc,
}

impl Default for Backend {
    fn default() -> Self {
        match config().backend.as_str() {
            "inproc" => Backend::InProc,
            _ => Backend::Local,
        }
    }
}

/// identifies the remote handler an active message is delivered to
pub(crate) type HandlerId = u8;

/// a remote handler, invoked with the source rank and the message payload
pub(crate) type AmHandler = Arc<dyn Fn(usize, &[u8]) + Send + Sync>;

#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) src: usize,
    pub(crate) handler: HandlerId,
    pub(crate) payload: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: RwLock<HashMap<HandlerId, AmHandler>>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids = self.handlers.read().keys().copied().collect::<Vec<_>>();
        ids.sort();
        write!(f, "HandlerTable {{ ids: {:?} }}", ids)
    }
}

impl HandlerTable {
    pub(crate) fn register(&self, id: HandlerId, handler: AmHandler) {
        let prev = self.handlers.write().insert(id, handler);
        assert!(prev.is_none(), "handler {} registered twice", id);
    }

    pub(crate) fn dispatch(&self, msg: Message) {
        // clone out so the table is not locked while the handler runs
        let handler = self.handlers.read().get(&msg.handler).cloned();
        match handler {
            Some(handler) => handler(msg.src, &msg.payload),
            None => panic!(
                "no handler registered for id {} (message from rank {})",
                msg.handler, msg.src
            ),
        }
    }

    /// drain at most `max` messages from `inbox`, returning how many were handled
    pub(crate) fn drain(&self, inbox: &SegQueue<Message>, max: usize) -> usize {
        let mut handled = 0;
        while handled < max {
            match inbox.pop() {
                Some(msg) => {
                    self.dispatch(msg);
                    handled += 1;
                }
                None => break,
            }
        }
        handled
    }
}

pub(crate) trait LamellaeInit {
    fn init_lamellae(self, segment_size: usize, poll_batch: usize) -> ConfigResult<Arc<Lamellae>>;
}

pub(crate) enum LamellaeBuilder {
    Local(LocalBuilder),
    InProc(InProcBuilder),
}

impl LamellaeInit for LamellaeBuilder {
    fn init_lamellae(self, segment_size: usize, poll_batch: usize) -> ConfigResult<Arc<Lamellae>> {
        if segment_size == 0 {
            return Err(ConfigError::Transport(
                "segment size must be non-zero".to_owned(),
            ));
        }
        match self {
            LamellaeBuilder::Local(builder) => builder.init_lamellae(segment_size, poll_batch),
            LamellaeBuilder::InProc(builder) => builder.init_lamellae(segment_size, poll_batch),
        }
    }
}

#[enum_dispatch(LamellaeComm)]
#[derive(Debug)]
pub(crate) enum Lamellae {
    Local,
    InProc,
}

#[enum_dispatch]
pub(crate) trait LamellaeComm: Send + Sync {
    fn my_rank(&self) -> usize;
    fn num_ranks(&self) -> usize;
    fn backend(&self) -> Backend;
    fn register_handler(&self, id: HandlerId, handler: AmHandler);
    /// enqueue an active message for `dst`, never blocks
    fn send_am(&self, dst: usize, id: HandlerId, payload: Vec<u8>);
    /// drain one bounded round of inbound messages, returning how many were dispatched
    fn poll(&self) -> usize;
    // this is the rank-granularity collective barrier,
    // `serve_inbox` lets the waiting thread keep draining its own inbox
    fn barrier(&self, serve_inbox: bool);
    fn bytes_sent(&self) -> usize;
    fn finalize(&self);
}

impl ProgressHelper for Lamellae {
    fn help_progress(&self) -> usize {
        self.poll()
    }
}

pub(crate) fn create_lamellae(
    backend: Backend,
    fabric: Option<(Arc<InProcFabric>, usize)>,
) -> ConfigResult<LamellaeBuilder> {
    match (backend, fabric) {
        (Backend::Local, _) => Ok(LamellaeBuilder::Local(LocalBuilder::new())),
        (Backend::InProc, Some((fabric, rank))) => {
            Ok(LamellaeBuilder::InProc(InProcBuilder::new(fabric, rank)))
        }
        (Backend::InProc, None) => Err(ConfigError::Transport(
            "the inproc backend needs an InProcFabric, see RpcWorldBuilder::with_fabric"
                .to_owned(),
        )),
    }
}

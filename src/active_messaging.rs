use crate::rpc_world::RpcWorld;

pub(crate) mod batching;
pub mod prelude;
pub(crate) mod registered_rpc;

pub trait SyncSend: Sync + Send {}

impl<T: Sync + Send> SyncSend for T {}

/// Types that can travel between ranks as rpc arguments or results
/// (a blanket impl for serde::Serialize + serde::Deserialize + Sync + Send + 'static)
pub trait AmDist: serde::ser::Serialize + serde::de::DeserializeOwned + SyncSend + 'static {}

impl<T: serde::ser::Serialize + serde::de::DeserializeOwned + SyncSend + 'static> AmDist for T {}

/// A procedure that can be invoked on a remote worker.
///
/// The implementing type carries the call arguments. It is serialized on the calling worker,
/// sent to the rank hosting the destination worker as part of a batch, and executed there
/// by a progress thread. The returned `Output` travels back to resolve the caller's [RpcFuture][crate::RpcFuture].
///
/// Every implementation must be registered with [register_rpc!][crate::register_rpc].
///
/// # Examples
///```
/// use lamellar_rpc::prelude::*;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(serde::Serialize, serde::Deserialize)]
/// struct Incr {
///     amount: usize,
/// }
///
/// impl RemoteProcedure for Incr {
///     type Output = usize;
///     fn exec(self, ctx: &HandlerContext) -> usize {
///         let counters = ctx.world().worker_object::<AtomicUsize>().unwrap();
///         counters.for_context(ctx).fetch_add(self.amount, Ordering::SeqCst)
///     }
/// }
/// register_rpc!(Incr);
///```
pub trait RemoteProcedure: AmDist {
    /// The type of the value returned to the caller
    type Output: AmDist;
    /// Execute the procedure on the destination rank
    fn exec(self, ctx: &HandlerContext) -> Self::Output;
}

/// Information about the call currently being executed by a [RemoteProcedure]
#[derive(Debug)]
pub struct HandlerContext<'a> {
    pub(crate) world: &'a RpcWorld,
    pub(crate) worker: usize,
    pub(crate) src_worker: Option<usize>,
    pub(crate) src_rank: usize,
}

impl<'a> HandlerContext<'a> {
    /// The runtime of the rank executing the call
    pub fn world(&self) -> &RpcWorld {
        self.world
    }

    /// global id of the worker the call was addressed to
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// node-local index of the worker the call was addressed to
    pub fn local_worker(&self) -> usize {
        self.worker - self.world.my_rank() * self.world.num_workers_local()
    }

    /// global id of the calling worker, `None` if the call was issued from a non-worker thread
    pub fn src_worker(&self) -> Option<usize> {
        self.src_worker
    }

    /// rank the call came from
    pub fn src_rank(&self) -> usize {
        self.src_rank
    }
}

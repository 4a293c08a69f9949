use crate::active_messaging::AmDist;
use crate::warnings::{DeadlockTimer, RuntimeWarning};

use crossbeam::utils::CachePadded;
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

const NUM_SHARDS: usize = 16;

/// Something a blocked consumer may call to drive progress while it waits.
///
/// Returns the amount of work it managed to do, zero meaning there was nothing to do.
pub(crate) trait ProgressHelper: Send + Sync {
    fn help_progress(&self) -> usize;
}

/// one result slot, written once by the thread that observes the reply
pub(crate) struct FutureInner {
    ready: AtomicBool,
    data: Mutex<Option<Vec<u8>>>,
    waker: AtomicWaker,
}

impl std::fmt::Debug for FutureInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FutureInner {{ ready: {:?} }}",
            self.ready.load(Ordering::Relaxed)
        )
    }
}

impl FutureInner {
    fn new() -> FutureInner {
        FutureInner {
            ready: AtomicBool::new(false),
            data: Mutex::new(None),
            waker: AtomicWaker::new(),
        }
    }

    fn resolve(&self, data: Vec<u8>) {
        {
            let mut slot = self.data.lock();
            assert!(
                slot.is_none() && !self.ready.load(Ordering::Acquire),
                "rpc future resolved twice"
            );
            *slot = Some(data);
        }
        self.ready.store(true, Ordering::Release);
        self.waker.wake();
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn take(&self) -> Vec<u8> {
        match self.data.lock().take() {
            Some(data) => data,
            None => panic!("rpc future result consumed twice"),
        }
    }
}

/// The pending futures issued by one rank, keyed by future id.
///
/// Ids are only unique within the issuing rank, replies always come back to it.
#[derive(Debug)]
pub(crate) struct FutureTable {
    shards: Vec<Mutex<HashMap<u64, Arc<FutureInner>>>>,
    next_id: AtomicU64,
    outstanding: CachePadded<AtomicUsize>,
}

impl Default for FutureTable {
    fn default() -> Self {
        FutureTable {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            next_id: AtomicU64::new(0),
            outstanding: CachePadded::new(AtomicUsize::new(0)),
        }
    }
}

impl FutureTable {
    fn shard(&self, id: u64) -> &Mutex<HashMap<u64, Arc<FutureInner>>> {
        &self.shards[(id % NUM_SHARDS as u64) as usize]
    }

    /// allocate a new pending slot
    pub(crate) fn insert(&self) -> (u64, Arc<FutureInner>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(FutureInner::new());
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.shard(id).lock().insert(id, inner.clone());
        (id, inner)
    }

    /// hand the serialized result of `id` to its future
    pub(crate) fn complete(&self, id: u64, data: Vec<u8>) {
        let inner = self.shard(id).lock().remove(&id);
        match inner {
            Some(inner) => {
                inner.resolve(data);
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
            }
            None => panic!("reply received for unknown rpc future {}", id),
        }
    }

    /// futures that have been issued but not yet resolved
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// A handle to the eventual result of one remote procedure call.
///
/// The future is resolved exactly once, by the progress thread that receives the reply.
/// [get][RpcFuture::get] consumes the handle, so the result can only be taken once.
/// It can also be `.await`ed.
///
/// # Examples
///```
/// use lamellar_rpc::prelude::*;
///
/// #[derive(serde::Serialize, serde::Deserialize)]
/// struct Add(usize, usize);
///
/// impl RemoteProcedure for Add {
///     type Output = usize;
///     fn exec(self, _ctx: &HandlerContext) -> usize {
///         self.0 + self.1
///     }
/// }
/// register_rpc!(Add);
///
/// let world = RpcWorldBuilder::new().build().unwrap();
/// world.run(|world| {
///     let fut = world.rpc_agg(0, Add(1, 2));
///     world.barrier();
///     assert_eq!(fut.get(), 3);
/// }).unwrap();
///```
pub struct RpcFuture<T: AmDist> {
    pub(crate) id: u64,
    pub(crate) inner: Arc<FutureInner>,
    pub(crate) helper: Option<Arc<dyn ProgressHelper>>,
    pub(crate) deadlock_timeout: f64,
    pub(crate) _phantom: std::marker::PhantomData<fn() -> T>,
}

impl<T: AmDist> std::fmt::Debug for RpcFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RpcFuture {{ id: {}, ready: {}, helper: {} }}",
            self.id,
            self.inner.is_ready(),
            self.helper.is_some()
        )
    }
}

impl<T: AmDist> RpcFuture<T> {
    pub(crate) fn new(
        id: u64,
        inner: Arc<FutureInner>,
        helper: Option<Arc<dyn ProgressHelper>>,
        deadlock_timeout: f64,
    ) -> RpcFuture<T> {
        RpcFuture {
            id,
            inner,
            helper,
            deadlock_timeout,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Returns true once the remote result has arrived, never blocks
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Block until the remote result has arrived without consuming it.
    ///
    /// If this future was created with worker progress enabled, the waiting thread polls the
    /// transport itself, otherwise it yields to the progress threads.
    #[tracing::instrument(skip_all)]
    pub fn wait(&self) {
        let mut timer = DeadlockTimer::new(self.deadlock_timeout);
        while !self.inner.is_ready() {
            let progressed = match &self.helper {
                Some(helper) => helper.help_progress(),
                None => 0,
            };
            if progressed == 0 {
                std::thread::yield_now();
            }
            timer.check(RuntimeWarning::FutureTimeout);
        }
    }

    /// Block until the remote result has arrived and return it
    pub fn get(self) -> T {
        self.wait();
        self.into_result()
    }

    /// Return the result if it has already arrived, otherwise hand the future back
    pub fn try_get(self) -> Result<T, RpcFuture<T>> {
        if self.inner.is_ready() {
            Ok(self.into_result())
        } else {
            Err(self)
        }
    }

    fn into_result(self) -> T {
        let data = self.inner.take();
        match crate::deserialize::<T>(&data) {
            Ok(result) => result,
            Err(e) => panic!("unable to deserialize result of rpc future {}: {}", self.id, e),
        }
    }
}

impl<T: AmDist> std::future::Future for RpcFuture<T> {
    type Output = T;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if let Some(helper) = &this.helper {
            helper.help_progress();
        }
        if !this.inner.is_ready() {
            this.inner.waker.register(cx.waker());
            if !this.inner.is_ready() {
                if this.helper.is_some() {
                    // nobody else may be polling the transport for us
                    cx.waker().wake_by_ref();
                }
                return Poll::Pending;
            }
        }
        let data = this.inner.take();
        match crate::deserialize::<T>(&data) {
            Ok(result) => Poll::Ready(result),
            Err(e) => panic!("unable to deserialize result of rpc future {}: {}", this.id, e),
        }
    }
}

use crate::active_messaging::batching::{AggStats, Aggregator};
use crate::active_messaging::registered_rpc::{install_handlers, rpc_id, RpcCall};
use crate::active_messaging::RemoteProcedure;
use crate::barrier::Barrier;
use crate::env_var::config;
use crate::error::{ConfigError, ConfigResult};
use crate::lamellae::{create_lamellae, Backend, InProcFabric, Lamellae, LamellaeComm, LamellaeInit};
use crate::registry::{Role, RoleRegistry};
use crate::rpc_request::{FutureTable, ProgressHelper, RpcFuture};
use crate::scheduler::worker_pool::{PoolOutcome, WorkerPool};
use crate::scheduler::{core_ids, ProgressEngine};
use crate::warnings::{DeadlockTimer, RuntimeWarning};
use crate::worker_object::WorkerObject;

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// The effective configuration of one [RpcWorld].
///
/// Starts from the `LAMELLAR_RPC_*` environment variables and can be overridden through
/// [RpcWorldBuilder]. It is read by the aggregator and the worker pool at call time.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// calls buffered per destination rank before a batch is sent
    pub agg_size: usize,
    /// worker threads per rank
    pub workers_per_node: usize,
    /// total runtime threads per rank, the surplus over `workers_per_node` become progress threads
    pub threads_per_node: usize,
    /// pin every runtime thread to its own core
    pub pin_threads: bool,
    /// let workers blocked on a future poll the transport themselves, barriers and `wait_all`
    /// only poll when the run has no progress threads
    pub worker_progress: bool,
    /// size in MB of the segment requested from the transport
    pub segment_size: usize,
    /// inbound messages handled per poll of the transport
    pub poll_batch: usize,
    /// seconds before a blocked call reports a potential deadlock, 0 disables the warning
    pub deadlock_timeout: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let env = config();
        RuntimeConfig {
            agg_size: env.agg_size,
            workers_per_node: env.workers_per_node,
            threads_per_node: env.threads_per_node,
            pin_threads: env.pin_threads,
            worker_progress: env.worker_progress,
            segment_size: env.segment_size,
            poll_batch: env.poll_batch,
            deadlock_timeout: env.deadlock_timeout,
        }
    }
}

impl RuntimeConfig {
    /// threads_per_node - workers_per_node
    pub fn num_progress_threads(&self) -> usize {
        self.threads_per_node.saturating_sub(self.workers_per_node)
    }

    /// check the thread counts and aggregation size
    pub fn validate(&self) -> ConfigResult<()> {
        if self.workers_per_node == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.threads_per_node < self.workers_per_node {
            return Err(ConfigError::TooFewThreads {
                workers: self.workers_per_node,
                threads: self.threads_per_node,
            });
        }
        if self.agg_size == 0 {
            return Err(ConfigError::ZeroAggSize);
        }
        Ok(())
    }
}

pub(crate) struct RpcWorldInner {
    lamellae: Arc<Lamellae>,
    config: RwLock<RuntimeConfig>,
    // every run registers its fresh threads, entries from earlier runs stay behind
    registry: RoleRegistry,
    aggregator: Aggregator,
    futures: FutureTable,
    barrier: Barrier,
    running: AtomicBool,
    shutdown: AtomicBool,
    abort: AtomicBool,
    workers_initialized: CachePadded<AtomicUsize>,
    num_progress_threads: AtomicUsize,
    worker_objects: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl RpcWorldInner {
    pub(crate) fn futures(&self) -> &FutureTable {
        &self.futures
    }
}

// clears the running state even when a worker panic unwinds through `run`
struct RunningGuard<'a>(&'a RpcWorldInner);

impl<'a> Drop for RunningGuard<'a> {
    fn drop(&mut self) {
        self.0.num_progress_threads.store(0, Ordering::SeqCst);
        self.0.running.store(false, Ordering::SeqCst);
    }
}

/// The runtime of one rank.
///
/// An `RpcWorld` owns the transport endpoint of its rank, the aggregation buffers, the table of
/// pending futures and the role registry. [run][RpcWorld::run] launches the worker and progress
/// threads; inside the entry function workers issue calls with [rpc_agg][RpcWorld::rpc_agg] and
/// synchronize with [barrier][RpcWorld::barrier].
///
/// Cloning is cheap, every clone refers to the same runtime.
///
/// # Examples
///```
/// use lamellar_rpc::prelude::*;
///
/// let world = RpcWorldBuilder::new()
///     .workers_per_node(2)
///     .threads_per_node(3)
///     .build()
///     .unwrap();
/// world.run(|world| {
///     rpc_print!(world, "{} workers\n", world.num_workers());
/// }).unwrap();
/// world.finalize();
///```
#[derive(Clone)]
pub struct RpcWorld {
    inner: Arc<RpcWorldInner>,
}

impl std::fmt::Debug for RpcWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RpcWorld {{ rank: {}, num_ranks: {}, running: {:?}, config: {:?} }}",
            self.my_rank(),
            self.num_ranks(),
            self.inner.running.load(Ordering::Relaxed),
            *self.inner.config.read()
        )
    }
}

impl RpcWorld {
    pub(crate) fn from_inner(inner: Arc<RpcWorldInner>) -> RpcWorld {
        RpcWorld { inner }
    }

    pub(crate) fn lamellae(&self) -> &Arc<Lamellae> {
        &self.inner.lamellae
    }

    /// A copy of the current configuration
    pub fn config(&self) -> RuntimeConfig {
        self.inner.config.read().clone()
    }

    /// The rank of this process
    pub fn my_rank(&self) -> usize {
        self.inner.lamellae.my_rank()
    }

    /// The number of ranks in the run
    pub fn num_ranks(&self) -> usize {
        self.inner.lamellae.num_ranks()
    }

    /// The transport backend connecting the ranks
    pub fn backend(&self) -> Backend {
        self.inner.lamellae.backend()
    }

    /// Workers hosted by each rank
    pub fn num_workers_local(&self) -> usize {
        self.inner.config.read().workers_per_node
    }

    /// Workers across every rank, global worker ids are `0..num_workers()`
    pub fn num_workers(&self) -> usize {
        self.num_workers_local() * self.num_ranks()
    }

    /// Global id of the calling worker.
    ///
    /// Panics when called from a thread that is not a worker of this world.
    pub fn my_worker(&self) -> usize {
        match self.inner.registry.resolve(&std::thread::current().id()) {
            Role::Worker(global) => global,
            Role::Progress(idx) => panic!(
                "my_worker called from progress thread {}, only workers have a worker id",
                idx
            ),
        }
    }

    /// Node-local index of the calling worker
    pub fn my_local_worker(&self) -> usize {
        self.my_worker() - self.my_rank() * self.num_workers_local()
    }

    /// True when called from one of this world's progress threads
    pub fn is_progress_thread(&self) -> bool {
        matches!(self.inner.registry.current(), Some(Role::Progress(_)))
    }

    /// Workers of this rank that have registered during the current (or last) `run`
    pub fn workers_initialized(&self) -> usize {
        self.inner.workers_initialized.load(Ordering::SeqCst)
    }

    /// Progress threads started by the current `run`, zero outside of `run`
    pub fn num_progress_threads(&self) -> usize {
        self.inner.num_progress_threads.load(Ordering::SeqCst)
    }

    /// Calls buffered per destination before a batch is sent
    pub fn agg_size(&self) -> usize {
        self.inner.aggregator.agg_size()
    }

    /// Change the aggregation size.
    ///
    /// Must be called before `run`, panics if the world is running or `agg_size` is zero.
    pub fn set_agg_size(&self, agg_size: usize) {
        assert!(
            !self.inner.running.load(Ordering::SeqCst),
            "set_agg_size called while the world is running"
        );
        assert!(agg_size > 0, "aggregation size must be non-zero");
        self.inner.config.write().agg_size = agg_size;
        self.inner.aggregator.set_agg_size(agg_size);
    }

    /// What the aggregator of this rank has sent so far
    pub fn stats(&self) -> AggStats {
        self.inner.aggregator.stats()
    }

    /// Calls the calling thread has buffered for `dest_rank`
    pub fn pending_calls(&self, dest_rank: usize) -> usize {
        self.inner.aggregator.pending(self.slot(), dest_rank)
    }

    // the aggregation slot of the calling thread
    fn slot(&self) -> usize {
        match self.inner.registry.current() {
            Some(Role::Worker(global)) => global - self.my_rank() * self.num_workers_local(),
            _ => self.inner.aggregator.shared_slot(),
        }
    }

    /// send the calls a handler issued from the calling thread
    pub(crate) fn flush_handler_calls(&self) {
        self.inner.aggregator.flush_slot(self.slot());
    }

    // without progress threads a waiting thread has to drive the transport itself,
    // otherwise only a blocked future polls (see `issue`)
    fn assist_progress(&self) -> bool {
        self.num_progress_threads() == 0
    }

    fn issue<T: RemoteProcedure>(&self, dest_worker: usize, rpc: T, immediate: bool) -> RpcFuture<T::Output> {
        let num_workers = self.num_workers();
        assert!(
            dest_worker < num_workers,
            "invalid destination worker {} (num workers {})",
            dest_worker,
            num_workers
        );
        let args = match crate::serialize(&rpc) {
            Ok(args) => args,
            Err(e) => panic!("unable to serialize {}: {}", std::any::type_name::<T>(), e),
        };
        let src_worker = match self.inner.registry.current() {
            Some(Role::Worker(global)) => Some(global),
            _ => None,
        };
        let (future_id, inner) = self.inner.futures.insert();
        let call = RpcCall {
            rpc_id: rpc_id::<T>(),
            src_worker,
            dst_worker: dest_worker,
            future_id,
            args,
        };
        let dest_rank = dest_worker / self.num_workers_local();
        if immediate {
            self.inner.aggregator.send_now(dest_rank, call);
        } else {
            self.inner.aggregator.submit(self.slot(), dest_rank, call);
        }
        let (worker_progress, deadlock_timeout) = {
            let config = self.inner.config.read();
            (config.worker_progress, config.deadlock_timeout)
        };
        let helper = if worker_progress || self.num_progress_threads() == 0 {
            Some(self.inner.lamellae.clone() as Arc<dyn ProgressHelper>)
        } else {
            None
        };
        RpcFuture::new(future_id, inner, helper, deadlock_timeout)
    }

    /// Buffer `rpc` for the worker with global id `dest_worker`.
    ///
    /// The call is appended to the calling thread's buffer for the destination rank, a full buffer
    /// is sent as one batch. The returned future resolves once the destination has executed the call
    /// and its reply has been received, a [barrier][RpcWorld::barrier] guarantees the call has been sent.
    #[tracing::instrument(skip_all)]
    pub fn rpc_agg<T: RemoteProcedure>(&self, dest_worker: usize, rpc: T) -> RpcFuture<T::Output> {
        self.issue(dest_worker, rpc, false)
    }

    /// Send `rpc` to the worker with global id `dest_worker` right away, as a batch of its own
    #[tracing::instrument(skip_all)]
    pub fn rpc<T: RemoteProcedure>(&self, dest_worker: usize, rpc: T) -> RpcFuture<T::Output> {
        self.issue(dest_worker, rpc, true)
    }

    /// Global barrier across every worker of every rank.
    ///
    /// Sends the calling worker's pending calls, then waits until every local worker has arrived.
    /// Local worker 0 synchronizes with the other ranks while the rest of the rank waits for it.
    /// Called outside of `run` (from the thread owning the world) it flushes the shared buffers and
    /// joins the rank level barrier directly.
    ///
    /// This does not wait for replies, wait on the futures (or [wait_all][RpcWorld::wait_all]) for that.
    #[tracing::instrument(skip_all)]
    pub fn barrier(&self) {
        let deadlock_timeout = self.inner.config.read().deadlock_timeout;
        match self.inner.registry.current() {
            Some(Role::Worker(global)) => {
                let local = global - self.my_rank() * self.num_workers_local();
                self.inner.aggregator.flush_slot(local);
                self.inner
                    .barrier
                    .barrier(local, deadlock_timeout, self.assist_progress());
            }
            Some(Role::Progress(idx)) => panic!(
                "barrier called from progress thread {}, barriers may only be called by workers",
                idx
            ),
            None => {
                self.inner.aggregator.flush_slot(self.inner.aggregator.shared_slot());
                self.inner.barrier.node_barrier();
            }
        }
    }

    /// Block until every future issued by this rank has been resolved
    #[tracing::instrument(skip_all)]
    pub fn wait_all(&self) {
        let slot = self.slot();
        let shared = self.inner.aggregator.shared_slot();
        let assist = self.assist_progress();
        let mut timer = DeadlockTimer::new(self.inner.config.read().deadlock_timeout);
        loop {
            self.inner.aggregator.flush_slot(slot);
            if slot != shared {
                self.inner.aggregator.flush_slot(shared);
            }
            let outstanding = self.inner.futures.outstanding();
            if outstanding == 0 {
                break;
            }
            if !assist || self.inner.lamellae.poll() == 0 {
                std::thread::yield_now();
            }
            timer.check(|elapsed| RuntimeWarning::WaitAllTimeout(elapsed, outstanding));
        }
    }

    fn collective_write(&self, write: impl FnOnce() -> std::io::Result<()>) -> std::io::Result<()> {
        let writer = self.my_worker() == 0;
        self.barrier();
        let res = if writer { write() } else { Ok(()) };
        self.barrier();
        res
    }

    /// Collective print, every worker must call it and only global worker 0 writes to stdout
    pub fn print(&self, args: std::fmt::Arguments) {
        let res = self.collective_write(|| {
            let mut out = std::io::stdout().lock();
            out.write_fmt(args)?;
            out.flush()
        });
        if let Err(e) = res {
            tracing::warn!("collective print failed: {}", e);
        }
    }

    /// Collective print into `out`, every worker must call it and only global worker 0 writes
    pub fn print_to<W: Write>(&self, out: &Mutex<W>, args: std::fmt::Arguments) -> std::io::Result<()> {
        self.collective_write(|| {
            let mut out = out.lock();
            out.write_fmt(args)?;
            out.flush()
        })
    }

    /// Create one `T` per local worker, `init` receives the local worker index.
    ///
    /// Must be called before `run`. A later insert of the same type replaces the earlier one.
    pub fn insert_worker_object<T: Send + Sync + 'static>(
        &self,
        init: impl FnMut(usize) -> T,
    ) -> Arc<WorkerObject<T>> {
        assert!(
            !self.inner.running.load(Ordering::SeqCst),
            "worker objects must be created before run"
        );
        let obj = Arc::new(WorkerObject::new(self.num_workers_local(), init));
        self.inner
            .worker_objects
            .write()
            .insert(TypeId::of::<T>(), obj.clone() as Arc<dyn Any + Send + Sync>);
        obj
    }

    /// The worker object holding `T`, if one was inserted
    pub fn worker_object<T: Send + Sync + 'static>(&self) -> Option<Arc<WorkerObject<T>>> {
        let obj = self.inner.worker_objects.read().get(&TypeId::of::<T>())?.clone();
        obj.downcast::<WorkerObject<T>>().ok()
    }

    /// Launch the workers and progress threads of this rank and run `entry` on every worker.
    ///
    /// Each worker is pinned (if enabled), registers itself, waits until all local workers have
    /// registered, joins a global barrier and then runs `entry`. Once every worker has returned the
    /// remaining buffered calls are sent, all outstanding futures are awaited, the ranks synchronize
    /// and the progress threads are stopped.
    ///
    /// Every rank must call `run` with the same worker count.
    #[tracing::instrument(skip_all)]
    pub fn run<F>(&self, entry: F) -> ConfigResult<()>
    where
        F: Fn(&RpcWorld) + Sync,
    {
        let config = self.config();
        config.validate()?;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.inner);
        self.launch(&config, &entry)
    }

    /// [run][RpcWorld::run] with a different worker and thread count.
    ///
    /// The new counts are kept for later runs, a rejected pair leaves the configuration untouched.
    pub fn run_with<F>(&self, workers_per_node: usize, threads_per_node: usize, entry: F) -> ConfigResult<()>
    where
        F: Fn(&RpcWorld) + Sync,
    {
        let mut config = self.config();
        config.workers_per_node = workers_per_node;
        config.threads_per_node = threads_per_node;
        config.validate()?;
        if self.inner.running.load(Ordering::SeqCst) {
            return Err(ConfigError::AlreadyRunning);
        }
        *self.inner.config.write() = config;
        self.run(entry)
    }

    fn launch<F>(&self, config: &RuntimeConfig, entry: &F) -> ConfigResult<()>
    where
        F: Fn(&RpcWorld) + Sync,
    {
        let num_workers = config.workers_per_node;
        let num_progress = config.num_progress_threads();
        let cores = if config.pin_threads {
            Some(core_ids(config.threads_per_node)?)
        } else {
            None
        };
        self.inner.aggregator.prepare(num_workers);
        self.inner.aggregator.set_agg_size(config.agg_size);
        self.inner.barrier.prepare(num_workers);
        self.inner.num_progress_threads.store(num_progress, Ordering::SeqCst);

        let body = |_local: usize| {
            self.barrier();
            entry(self);
        };
        let inner = &self.inner;
        std::thread::scope(|s| {
            let engine = ProgressEngine::start(
                s,
                num_progress,
                cores.as_deref().map(|cores| &cores[num_workers..]),
                &inner.lamellae,
                &inner.registry,
                &inner.shutdown,
            )?;
            tracing::debug!(
                rank = self.my_rank(),
                num_workers,
                num_progress = engine.num_threads(),
                "launching workers"
            );
            let pool = WorkerPool {
                rank: self.my_rank(),
                num_workers,
                cores: cores.as_deref(),
                registry: &inner.registry,
                initialized: &inner.workers_initialized,
                abort: &inner.abort,
            };
            let threads = match pool.launch(s, &body) {
                Ok(threads) => threads,
                Err(e) => {
                    engine.shutdown();
                    return Err(e);
                }
            };
            match WorkerPool::join(threads) {
                PoolOutcome::Completed => {
                    self.quiesce();
                    engine.shutdown();
                    tracing::debug!(rank = self.my_rank(), "run complete");
                    Ok(())
                }
                PoolOutcome::Failed(e) => {
                    engine.shutdown();
                    Err(e)
                }
                PoolOutcome::Panicked(panic) => {
                    engine.shutdown();
                    std::panic::resume_unwind(panic)
                }
            }
        })
    }

    // send what is left, wait for our replies, then wait for the other ranks to do the same
    fn quiesce(&self) {
        self.inner.aggregator.flush_all();
        self.wait_all();
        self.inner.barrier.node_barrier();
    }

    /// Shut down the transport of this rank.
    ///
    /// Waits for outstanding futures and synchronizes with the other ranks first.
    #[tracing::instrument(skip_all)]
    pub fn finalize(self) {
        assert!(
            !self.inner.running.load(Ordering::SeqCst),
            "finalize called while the world is running"
        );
        self.inner.aggregator.flush_all();
        self.wait_all();
        self.inner.barrier.node_barrier();
        self.inner.lamellae.finalize();
    }
}

/// An implementation of the Builder design pattern, used to construct an instance of an [RpcWorld].
///
/// Every knob starts from its `LAMELLAR_RPC_*` environment variable.
///
/// # Examples
///```
/// use lamellar_rpc::{Backend, RpcWorldBuilder};
///
/// let world = RpcWorldBuilder::new()
///     .with_lamellae(Backend::Local)
///     .agg_size(64)
///     .workers_per_node(2)
///     .threads_per_node(3)
///     .build()
///     .unwrap();
///```
#[derive(Debug)]
pub struct RpcWorldBuilder {
    backend: Backend,
    fabric: Option<(Arc<InProcFabric>, usize)>,
    config: RuntimeConfig,
}

impl Default for RpcWorldBuilder {
    fn default() -> Self {
        RpcWorldBuilder::new()
    }
}

impl RpcWorldBuilder {
    pub fn new() -> RpcWorldBuilder {
        RpcWorldBuilder {
            backend: Backend::default(),
            fabric: None,
            config: RuntimeConfig::default(),
        }
    }

    /// Select the transport backend
    pub fn with_lamellae(mut self, backend: Backend) -> RpcWorldBuilder {
        self.backend = backend;
        self
    }

    /// Attach to `fabric` as rank `rank`, selects [Backend::InProc]
    pub fn with_fabric(mut self, fabric: Arc<InProcFabric>, rank: usize) -> RpcWorldBuilder {
        self.backend = Backend::InProc;
        self.fabric = Some((fabric, rank));
        self
    }

    pub fn agg_size(mut self, agg_size: usize) -> RpcWorldBuilder {
        self.config.agg_size = agg_size;
        self
    }

    pub fn workers_per_node(mut self, workers_per_node: usize) -> RpcWorldBuilder {
        self.config.workers_per_node = workers_per_node;
        self
    }

    pub fn threads_per_node(mut self, threads_per_node: usize) -> RpcWorldBuilder {
        self.config.threads_per_node = threads_per_node;
        self
    }

    pub fn pin_threads(mut self, pin_threads: bool) -> RpcWorldBuilder {
        self.config.pin_threads = pin_threads;
        self
    }

    pub fn worker_progress(mut self, worker_progress: bool) -> RpcWorldBuilder {
        self.config.worker_progress = worker_progress;
        self
    }

    pub fn segment_size(mut self, segment_size: usize) -> RpcWorldBuilder {
        self.config.segment_size = segment_size;
        self
    }

    pub fn poll_batch(mut self, poll_batch: usize) -> RpcWorldBuilder {
        self.config.poll_batch = poll_batch;
        self
    }

    pub fn deadlock_timeout(mut self, deadlock_timeout: f64) -> RpcWorldBuilder {
        self.config.deadlock_timeout = deadlock_timeout;
        self
    }

    /// Initialize the transport and construct the world.
    ///
    /// This is a collective call, every rank of the run must build its world before any of them returns.
    #[tracing::instrument(skip_all)]
    pub fn build(self) -> ConfigResult<RpcWorld> {
        self.config.validate()?;
        let lamellae = create_lamellae(self.backend, self.fabric)?
            .init_lamellae(self.config.segment_size, self.config.poll_batch)?;
        let num_workers = self.config.workers_per_node;
        let agg_size = self.config.agg_size;
        let config = self.config;
        let inner = Arc::new_cyclic(|weak| {
            install_handlers(&lamellae, weak.clone());
            RpcWorldInner {
                lamellae: lamellae.clone(),
                config: RwLock::new(config),
                registry: RoleRegistry::new(),
                aggregator: Aggregator::new(lamellae.clone(), agg_size, num_workers),
                futures: FutureTable::default(),
                barrier: Barrier::new(lamellae.clone(), num_workers),
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                abort: AtomicBool::new(false),
                workers_initialized: CachePadded::new(AtomicUsize::new(0)),
                num_progress_threads: AtomicUsize::new(0),
                worker_objects: RwLock::new(HashMap::new()),
            }
        });
        let world = RpcWorld { inner };
        tracing::debug!(
            rank = world.my_rank(),
            num_ranks = world.num_ranks(),
            backend = ?world.backend(),
            "world built"
        );
        world.inner.barrier.node_barrier();
        Ok(world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active_messaging::HandlerContext;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct WhoAmI;

    impl RemoteProcedure for WhoAmI {
        type Output = (usize, Option<usize>, usize);
        fn exec(self, ctx: &HandlerContext) -> (usize, Option<usize>, usize) {
            (ctx.worker(), ctx.src_worker(), ctx.local_worker())
        }
    }
    crate::register_rpc!(WhoAmI);

    fn local_world(workers: usize, threads: usize) -> RpcWorld {
        RpcWorldBuilder::new()
            .with_lamellae(Backend::Local)
            .workers_per_node(workers)
            .threads_per_node(threads)
            .pin_threads(false)
            .deadlock_timeout(0.0)
            .build()
            .unwrap()
    }

    #[test]
    fn builder_rejects_bad_thread_counts() {
        let err = RpcWorldBuilder::new()
            .with_lamellae(Backend::Local)
            .workers_per_node(4)
            .threads_per_node(2)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::TooFewThreads { workers: 4, threads: 2 });
        let err = RpcWorldBuilder::new()
            .with_lamellae(Backend::Local)
            .workers_per_node(0)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::NoWorkers);
        let err = RpcWorldBuilder::new()
            .with_lamellae(Backend::Local)
            .workers_per_node(1)
            .threads_per_node(1)
            .agg_size(0)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroAggSize);
    }

    #[test]
    fn inproc_without_fabric_is_a_transport_error() {
        let err = RpcWorldBuilder::new()
            .with_lamellae(Backend::InProc)
            .workers_per_node(1)
            .threads_per_node(1)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Transport(_)));
    }

    #[test]
    fn handler_sees_caller_and_target() {
        let world = local_world(3, 4);
        world
            .run(|world| {
                let me = world.my_worker();
                let target = (me + 1) % world.num_workers();
                let (worker, src, local) = world.rpc(target, WhoAmI).get();
                assert_eq!(worker, target);
                assert_eq!(src, Some(me));
                assert_eq!(local, target);
            })
            .unwrap();
        assert_eq!(world.stats().batches_sent, 3);
        world.finalize();
    }

    #[test]
    fn main_thread_calls_use_the_shared_slot() {
        let world = local_world(2, 2);
        let fut = world.rpc_agg(1, WhoAmI);
        assert_eq!(world.pending_calls(0), 1);
        world.barrier();
        assert_eq!(world.pending_calls(0), 0);
        world.wait_all();
        assert_eq!(fut.get(), (1, None, 1));
        world.finalize();
    }

    #[test]
    fn agg_size_is_fixed_while_running() {
        let world = local_world(1, 1);
        world.set_agg_size(7);
        assert_eq!(world.agg_size(), 7);
        assert_eq!(world.config().agg_size, 7);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            world
                .run(|world| world.set_agg_size(3))
                .unwrap();
        }));
        assert!(res.is_err());
        assert_eq!(world.agg_size(), 7);
    }

    #[test]
    fn worker_objects_are_per_local_worker() {
        let world = local_world(4, 4);
        world.insert_worker_object(|local| AtomicUsize::new(local * 100));
        assert!(world.worker_object::<String>().is_none());
        world
            .run(|world| {
                let objs = world.worker_object::<AtomicUsize>().unwrap();
                let mine = objs.get(world).load(Ordering::SeqCst);
                assert_eq!(mine, world.my_local_worker() * 100);
            })
            .unwrap();
    }

    #[derive(serde::Serialize, serde::Deserialize)]
    struct CountOffProgress;

    impl RemoteProcedure for CountOffProgress {
        type Output = ();
        fn exec(self, ctx: &HandlerContext) {
            if !ctx.world().is_progress_thread() {
                let counts = ctx.world().worker_object::<AtomicUsize>().unwrap();
                counts.for_context(ctx).fetch_add(1, Ordering::SeqCst);
            }
        }
    }
    crate::register_rpc!(CountOffProgress);

    #[test]
    fn waiting_workers_leave_handlers_to_progress_threads() {
        let world = local_world(2, 3);
        let off_progress = world.insert_worker_object(|_| AtomicUsize::new(0));
        world
            .run(|world| {
                if world.my_worker() == 1 {
                    for _ in 0..2000 {
                        let _ = world.rpc(0, CountOffProgress);
                    }
                    // worker 0 sits in the barrier while the calls are served
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                world.barrier();
            })
            .unwrap();
        assert_eq!(off_progress.get_for(0).load(Ordering::SeqCst), 0);
        world.finalize();
    }

    #[test]
    fn rejected_run_with_keeps_the_config() {
        let world = local_world(2, 2);
        assert_eq!(
            world.run_with(0, 0, |_| {}),
            Err(ConfigError::NoWorkers)
        );
        assert_eq!(
            world.run_with(3, 1, |_| {}),
            Err(ConfigError::TooFewThreads { workers: 3, threads: 1 })
        );
        assert_eq!(world.num_workers(), 2);
        assert_eq!(world.config().threads_per_node, 2);
        let ran = AtomicUsize::new(0);
        world
            .run(|_| {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        world.finalize();
    }

    #[test]
    fn run_with_changes_the_pool() {
        let world = local_world(1, 1);
        let seen = AtomicUsize::new(0);
        world
            .run_with(3, 5, |world| {
                assert_eq!(world.num_workers(), 3);
                assert_eq!(world.num_progress_threads(), 2);
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(world.num_progress_threads(), 0);
        assert_eq!(world.workers_initialized(), 3);
    }
}

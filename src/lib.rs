//! lamellar-rpc is a node-local runtime that layers cooperative remote procedure calls on top of an
//! active-message transport (a Lamellae).
//!
//! Every rank runs a pool of pinned *worker* threads executing application code, and a pool of
//! *progress* threads that do nothing but poll the transport. Workers issue calls to other workers
//! (addressed by a global worker id) with [RpcWorld::rpc_agg]; calls to the same destination rank
//! are aggregated into batches of `agg_size` before they are sent. Each call returns an [RpcFuture]
//! that resolves once the destination has executed it and its reply has arrived.
//!
//! Workers synchronize with [RpcWorld::barrier], which first sends the caller's pending calls and
//! then synchronizes every worker of every rank.
//!
//! Two Lamellae are provided: "local", a single rank, and "inproc", several ranks hosted by one
//! process and connected by an [InProcFabric] (useful for emulating distributed runs).
//!
//! EXAMPLES
//! --------
//!
//! # Defining a remote procedure and calling it from every worker
//! ```
//! use lamellar_rpc::prelude::*;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Hello {
//!     from: usize,
//! }
//!
//! impl RemoteProcedure for Hello {
//!     type Output = usize;
//!     fn exec(self, ctx: &HandlerContext) -> usize {
//!         println!("worker {} says hello to worker {}", self.from, ctx.worker());
//!         ctx.worker()
//!     }
//! }
//! register_rpc!(Hello);
//!
//! fn main() {
//!     let world = RpcWorldBuilder::new().build().unwrap();
//!     world
//!         .run(|world| {
//!             let me = world.my_worker();
//!             let dest = (me + 1) % world.num_workers();
//!             let fut = world.rpc_agg(dest, Hello { from: me });
//!             world.barrier(); // make sure every buffered call has been sent
//!             assert_eq!(fut.get(), dest);
//!             rpc_print!(world, "all {} workers said hello\n", world.num_workers());
//!         })
//!         .unwrap();
//!     world.finalize();
//! }
//! ```

#[macro_use]
extern crate lazy_static;
#[doc(hidden)]
pub extern crate serde;

pub mod active_messaging;
pub use active_messaging::prelude;
pub use active_messaging::{AmDist, HandlerContext, RemoteProcedure};
mod barrier;
mod env_var;
pub use env_var::{config, Config};
mod error;
pub use error::{ConfigError, ConfigResult};
mod lamellae;
pub use lamellae::{Backend, InProcFabric};
mod registry;
mod rpc_request;
pub use rpc_request::RpcFuture;
mod rpc_world;
pub use rpc_world::{RpcWorld, RpcWorldBuilder, RuntimeConfig};
mod scheduler;
mod warnings;
mod worker_object;
pub use worker_object::WorkerObject;

pub use active_messaging::batching::AggStats;
#[doc(hidden)]
pub use active_messaging::registered_rpc::{exec_rpc, ExecFn, RegisteredRpc};

#[doc(hidden)]
pub use inventory;

#[doc(hidden)]
pub use bincode;

#[doc(hidden)]
pub fn serialize<T: ?Sized>(obj: &T) -> Result<Vec<u8>, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(bincode::serialize(obj)?)
}

#[doc(hidden)]
pub fn deserialize<'a, T>(bytes: &'a [u8]) -> Result<T, anyhow::Error>
where
    T: serde::Deserialize<'a>,
{
    Ok(bincode::deserialize(bytes)?)
}

/// Register a [RemoteProcedure] so that every rank can execute it.
///
/// Handler ids are derived from the sorted names of all registered procedures, so every rank of
/// the run (running the same binary) agrees on them.
///
/// # Examples
///```
/// use lamellar_rpc::prelude::*;
///
/// #[derive(serde::Serialize, serde::Deserialize)]
/// struct Ping;
///
/// impl RemoteProcedure for Ping {
///     type Output = ();
///     fn exec(self, _ctx: &HandlerContext) {}
/// }
/// register_rpc!(Ping);
///```
#[macro_export]
macro_rules! register_rpc {
    ($rpc:ty) => {
        $crate::inventory::submit! {
            $crate::RegisteredRpc {
                name: ::std::any::type_name::<$rpc>,
                exec: $crate::exec_rpc::<$rpc>,
            }
        }
    };
}

/// Collective formatted print, see [RpcWorld::print].
///
/// Every worker must call it, the text is written once (by global worker 0).
#[macro_export]
macro_rules! rpc_print {
    ($world:expr, $($arg:tt)*) => {
        $world.print(format_args!($($arg)*))
    };
}

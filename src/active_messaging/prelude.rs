pub use crate::active_messaging::{AmDist, HandlerContext, RemoteProcedure};
pub use crate::rpc_request::RpcFuture;
pub use crate::rpc_world::{RpcWorld, RpcWorldBuilder};
pub use crate::worker_object::WorkerObject;
pub use crate::{register_rpc, rpc_print};
pub use crate::{Backend, InProcFabric};

pub use crate::inventory;

use crate::active_messaging::{HandlerContext, RemoteProcedure};
use crate::lamellae::{HandlerId, Lamellae, LamellaeComm};
use crate::rpc_request::FutureTable;
use crate::rpc_world::{RpcWorld, RpcWorldInner};

use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub(crate) const RPC_ID_START: RpcId = 1;

/// transport handler receiving batches of calls
pub(crate) const RPC_REQUEST: HandlerId = 1;
/// transport handler receiving batches of results
pub(crate) const RPC_REPLY: HandlerId = 2;

pub(crate) type RpcId = u32;

#[doc(hidden)]
pub type ExecFn = fn(&[u8], &HandlerContext) -> anyhow::Result<Vec<u8>>;

lazy_static! {
    pub(crate) static ref RPC_IDS: HashMap<&'static str, RpcId> = {
        let mut rpcs = vec![];
        for rpc in crate::inventory::iter::<RegisteredRpc> {
            rpcs.push((rpc.name)());
        }
        rpcs.sort();
        let mut cnt = RPC_ID_START;
        let mut temp = HashMap::new();
        let mut duplicates = vec![];
        for rpc in rpcs {
            if !temp.contains_key(&rpc) {
                temp.insert(rpc, cnt);
                cnt += 1;
            } else {
                duplicates.push(rpc);
            }
        }
        if duplicates.len() > 0 {
            panic!(
                "duplicate registered rpc {:?}, each RemoteProcedure may only be registered once",
                duplicates
            );
        }
        temp
    };
}
lazy_static! {
    pub(crate) static ref RPC_EXECS: HashMap<RpcId, ExecFn> = {
        let mut temp = HashMap::new();
        for rpc in crate::inventory::iter::<RegisteredRpc> {
            if let Some(id) = RPC_IDS.get(&(rpc.name)()) {
                temp.insert(*id, rpc.exec);
            }
        }
        temp
    };
}

#[doc(hidden)]
pub struct RegisteredRpc {
    pub name: fn() -> &'static str,
    pub exec: ExecFn,
}

crate::inventory::collect!(RegisteredRpc);

#[doc(hidden)]
pub fn exec_rpc<T: RemoteProcedure>(args: &[u8], ctx: &HandlerContext) -> anyhow::Result<Vec<u8>> {
    let rpc: T = crate::deserialize(args)?;
    let result = rpc.exec(ctx);
    crate::serialize(&result)
}

/// the id every rank uses for `T`
pub(crate) fn rpc_id<T: RemoteProcedure>() -> RpcId {
    match RPC_IDS.get(std::any::type_name::<T>()) {
        Some(id) => *id,
        None => panic!(
            "rpc {} was never registered, add register_rpc!({}) to your crate",
            std::any::type_name::<T>(),
            std::any::type_name::<T>()
        ),
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct RpcCall {
    pub(crate) rpc_id: RpcId,
    pub(crate) src_worker: Option<usize>,
    pub(crate) dst_worker: usize,
    pub(crate) future_id: u64,
    #[serde(with = "serde_bytes")]
    pub(crate) args: Vec<u8>,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct RpcReply {
    pub(crate) future_id: u64,
    #[serde(with = "serde_bytes")]
    pub(crate) data: Vec<u8>,
}

/// run every call of an incoming batch and answer the source rank with a single reply batch
#[tracing::instrument(skip_all)]
pub(crate) fn exec_request_batch(world: &RpcWorld, src_rank: usize, payload: &[u8]) {
    let calls: Vec<RpcCall> = match crate::deserialize(payload) {
        Ok(calls) => calls,
        Err(e) => panic!("malformed rpc batch from rank {}: {}", src_rank, e),
    };
    tracing::trace!(src_rank, num_calls = calls.len(), "executing rpc batch");
    let mut replies = Vec::with_capacity(calls.len());
    for call in calls {
        let exec = match RPC_EXECS.get(&call.rpc_id) {
            Some(exec) => exec,
            None => panic!("unknown rpc id {} from rank {}", call.rpc_id, src_rank),
        };
        let ctx = HandlerContext {
            world,
            worker: call.dst_worker,
            src_worker: call.src_worker,
            src_rank,
        };
        let data = match exec(&call.args, &ctx) {
            Ok(data) => data,
            Err(e) => panic!("rpc {} from rank {} failed: {}", call.rpc_id, src_rank, e),
        };
        replies.push(RpcReply {
            future_id: call.future_id,
            data,
        });
    }
    // calls issued by the handlers leave with the replies
    world.flush_handler_calls();
    match crate::serialize(&replies) {
        Ok(payload) => world.lamellae().send_am(src_rank, RPC_REPLY, payload),
        Err(e) => panic!("unable to serialize rpc replies for rank {}: {}", src_rank, e),
    }
}

/// resolve the futures answered by an incoming reply batch
pub(crate) fn exec_reply_batch(futures: &FutureTable, src_rank: usize, payload: &[u8]) {
    let replies: Vec<RpcReply> = match crate::deserialize(payload) {
        Ok(replies) => replies,
        Err(e) => panic!("malformed rpc reply batch from rank {}: {}", src_rank, e),
    };
    tracing::trace!(src_rank, num_replies = replies.len(), "resolving rpc replies");
    for reply in replies {
        futures.complete(reply.future_id, reply.data);
    }
}

/// hook the request and reply handlers of a world into its transport
pub(crate) fn install_handlers(lamellae: &Arc<Lamellae>, world: Weak<RpcWorldInner>) {
    let req_world = world.clone();
    lamellae.register_handler(
        RPC_REQUEST,
        Arc::new(move |src: usize, payload: &[u8]| match req_world.upgrade() {
            Some(inner) => exec_request_batch(&RpcWorld::from_inner(inner), src, payload),
            None => tracing::debug!(src, "dropping rpc batch for a world that no longer exists"),
        }),
    );
    lamellae.register_handler(
        RPC_REPLY,
        Arc::new(move |src: usize, payload: &[u8]| match world.upgrade() {
            Some(inner) => exec_reply_batch(inner.futures(), src, payload),
            None => tracing::debug!(src, "dropping rpc replies for a world that no longer exists"),
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Double(u32);

    impl RemoteProcedure for Double {
        type Output = u32;
        fn exec(self, _ctx: &HandlerContext) -> u32 {
            self.0 * 2
        }
    }
    crate::register_rpc!(Double);

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Unregistered;

    impl RemoteProcedure for Unregistered {
        type Output = ();
        fn exec(self, _ctx: &HandlerContext) {}
    }

    #[test]
    fn registered_ids_are_dense_and_sorted() {
        let mut names = RPC_IDS.iter().collect::<Vec<_>>();
        names.sort_by_key(|(_, id)| **id);
        for (i, (name, id)) in names.iter().enumerate() {
            assert_eq!(**id, RPC_ID_START + i as RpcId);
            if i > 0 {
                assert!(names[i - 1].0 < *name);
            }
        }
        let id = rpc_id::<Double>();
        assert!(RPC_EXECS.contains_key(&id));
    }

    #[test]
    #[should_panic(expected = "never registered")]
    fn unregistered_rpc_panics() {
        rpc_id::<Unregistered>();
    }

    #[test]
    fn call_args_survive_the_wire() {
        let call = RpcCall {
            rpc_id: rpc_id::<Double>(),
            src_worker: Some(3),
            dst_worker: 5,
            future_id: 17,
            args: crate::serialize(&Double(21)).unwrap(),
        };
        let bytes = crate::serialize(&vec![call.clone()]).unwrap();
        let calls: Vec<RpcCall> = crate::deserialize(&bytes).unwrap();
        assert_eq!(calls, vec![call]);
    }
}

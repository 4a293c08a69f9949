use crate::active_messaging::HandlerContext;
use crate::rpc_world::RpcWorld;

/// One instance of `T` per local worker of a rank.
///
/// Handlers run on progress threads, so state they update through a `WorkerObject` needs interior
/// mutability (atomics or locks). Created with [RpcWorld::insert_worker_object] before `run`.
///
/// # Examples
///```
/// use lamellar_rpc::prelude::*;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let world = RpcWorldBuilder::new().build().unwrap();
/// world.insert_worker_object(|_local| AtomicUsize::new(0));
/// world.run(|world| {
///     let counters = world.worker_object::<AtomicUsize>().unwrap();
///     counters.get(world).fetch_add(1, Ordering::SeqCst);
/// }).unwrap();
///```
#[derive(Debug)]
pub struct WorkerObject<T> {
    objects: Vec<T>,
}

impl<T> WorkerObject<T> {
    pub(crate) fn new(num_workers: usize, init: impl FnMut(usize) -> T) -> WorkerObject<T> {
        WorkerObject {
            objects: (0..num_workers).map(init).collect(),
        }
    }

    /// The instance of the calling worker
    pub fn get(&self, world: &RpcWorld) -> &T {
        self.get_for(world.my_local_worker())
    }

    /// The instance of local worker `local`
    pub fn get_for(&self, local: usize) -> &T {
        match self.objects.get(local) {
            Some(obj) => obj,
            None => panic!(
                "local worker {} out of range, this WorkerObject holds {} instances",
                local,
                self.objects.len()
            ),
        }
    }

    /// The instance of the worker a handler call is addressed to
    pub fn for_context(&self, ctx: &HandlerContext) -> &T {
        self.get_for(ctx.local_worker())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.objects.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_are_built_per_worker() {
        let obj = WorkerObject::new(3, |local| local * 10);
        assert_eq!(obj.len(), 3);
        assert_eq!(*obj.get_for(2), 20);
        assert_eq!(obj.iter().copied().collect::<Vec<_>>(), vec![0, 10, 20]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_worker_panics() {
        let obj = WorkerObject::new(2, |_| ());
        obj.get_for(2);
    }
}

use rand::distributions::{Distribution, Uniform};
use rand::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use lamellar_rpc::prelude::*;

// number of values generated per rank
const N_VALS: usize = 1 << 18;
// values are drawn from [0, RANGE)
const RANGE: usize = 1 << 24;

static PARTITION_SIZE: OnceLock<usize> = OnceLock::new();

fn partition_size() -> usize {
    *PARTITION_SIZE.get().expect("partition size set before run")
}

//----------------- increments one bucket on the owning worker -----------------//
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct HistogramAm {
    val: usize,
}

impl RemoteProcedure for HistogramAm {
    type Output = ();
    fn exec(self, ctx: &HandlerContext) {
        let bucket_start = ctx.worker() * partition_size();
        let buckets = ctx
            .world()
            .worker_object::<Vec<AtomicUsize>>()
            .expect("buckets created before run");
        buckets.for_context(ctx)[self.val - bucket_start].fetch_add(1, Ordering::Relaxed);
    }
}
register_rpc!(HistogramAm);

fn worker(world: &RpcWorld) {
    let n_ops = N_VALS / world.num_workers_local();
    rpc_print!(
        world,
        "Histogram of {} integers among {} workers with aggregation size {}\n",
        N_VALS * world.num_ranks(),
        world.num_workers(),
        world.agg_size()
    );

    let mut rng = StdRng::seed_from_u64(world.my_worker() as u64);
    let dist = Uniform::from(0..RANGE);
    let vals = (0..n_ops).map(|_| dist.sample(&mut rng)).collect::<Vec<_>>();

    world.barrier();
    let timer = Instant::now();

    let futures = vals
        .iter()
        .map(|&val| world.rpc_agg(val / partition_size(), HistogramAm { val }))
        .collect::<Vec<_>>();

    world.barrier();
    for future in futures {
        future.get();
    }
    world.barrier();

    rpc_print!(world, "{:.6} seconds\n", timer.elapsed().as_secs_f64());
}

fn main() {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();
    let num_ranks = args.get(1).and_then(|s| s.parse::<usize>().ok()).unwrap_or(2);
    let agg_size = args.get(2).and_then(|s| s.parse::<usize>().ok()).unwrap_or(102);
    let workers_per_node = args.get(3).and_then(|s| s.parse::<usize>().ok()).unwrap_or(3);

    let fabric = InProcFabric::new(num_ranks);
    PARTITION_SIZE
        .set((RANGE + workers_per_node * num_ranks - 1) / (workers_per_node * num_ranks))
        .expect("partition size set once");

    let counted = std::thread::scope(|s| {
        let ranks = (0..num_ranks)
            .map(|rank| {
                let fabric = fabric.clone();
                s.spawn(move || {
                    let world = RpcWorldBuilder::new()
                        .with_fabric(fabric, rank)
                        .agg_size(agg_size)
                        .workers_per_node(workers_per_node)
                        .threads_per_node(workers_per_node + 1)
                        .pin_threads(false)
                        .build()
                        .expect("world construction failed");
                    let buckets = world.insert_worker_object(|_| {
                        (0..partition_size())
                            .map(|_| AtomicUsize::new(0))
                            .collect::<Vec<_>>()
                    });
                    world.run(worker).expect("run failed");
                    let counted: usize = buckets
                        .iter()
                        .flat_map(|b| b.iter())
                        .map(|c| c.load(Ordering::Relaxed))
                        .sum();
                    world.finalize();
                    counted
                })
            })
            .collect::<Vec<_>>();
        ranks
            .into_iter()
            .map(|r| r.join().expect("rank panicked"))
            .collect::<Vec<_>>()
    });

    for (rank, counted) in counted.iter().enumerate() {
        println!("rank {} counted {} values", rank, counted);
    }
    let expected = (N_VALS / workers_per_node) * workers_per_node * num_ranks;
    assert_eq!(counted.iter().sum::<usize>(), expected);
}

use std::sync::OnceLock;

use serde::Deserialize;

fn default_agg_size() -> usize {
    102
}

fn default_threads() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.into(),
        Err(_) => 4,
    }
}

fn default_workers() -> usize {
    // leave one core for a progress thread when the machine has more than one
    std::cmp::max(1, default_threads().saturating_sub(1))
}

fn default_backend() -> String {
    "local".to_owned()
}

fn default_segment_size() -> usize {
    256
}

fn default_pin_threads() -> bool {
    true
}

fn default_poll_batch() -> usize {
    64
}

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_worker_progress() -> bool {
    true
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// Number of calls buffered per destination before a batch is sent, default: 102
    #[serde(default = "default_agg_size")]
    pub agg_size: usize,

    /// Number of worker threads per rank, default: available cores - 1
    #[serde(default = "default_workers")]
    pub workers_per_node: usize,

    /// Total runtime threads per rank, progress threads = threads_per_node - workers_per_node
    #[serde(default = "default_threads")]
    pub threads_per_node: usize,

    /// The lamellae backend to use
    /// local -- single rank execution, the default
    /// inproc -- multiple ranks within a single process, requires an InProcFabric
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Size (in MB) of the segment requested from the transport, default: 256
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,

    /// Pin every worker and progress thread to its own core, default: true
    #[serde(default = "default_pin_threads")]
    pub pin_threads: bool,

    /// Maximum number of inbound messages handled by one poll of the transport, default: 64
    #[serde(default = "default_poll_batch")]
    pub poll_batch: usize,

    /// Seconds a barrier or future may spin before a potential deadlock is reported, default: 600.0
    /// a value of 0 disables the warning
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// Allow workers blocked on a future to poll the transport themselves, default: true
    #[serde(default = "default_worker_progress")]
    pub worker_progress: bool,
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("LAMELLAR_RPC_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}

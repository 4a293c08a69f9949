/// A fatal problem with how the runtime was configured or launched.
///
/// These are reported before any worker runs its entry function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// workers_per_node was zero
    NoWorkers,
    /// threads_per_node must be at least workers_per_node
    TooFewThreads { workers: usize, threads: usize },
    /// the aggregation size was zero
    ZeroAggSize,
    /// pinning was requested for more threads than there are usable cores
    NotEnoughCores { requested: usize, available: usize },
    /// a runtime thread could not be pinned to its core
    PinFailed { thread: String, core: usize },
    /// a runtime thread could not be spawned
    Spawn(String),
    /// the transport could not be initialized
    Transport(String),
    /// `run` was called while a previous `run` on the same world was still active
    AlreadyRunning,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConfigError::NoWorkers => write!(f, "at least one worker per node is required"),
            ConfigError::TooFewThreads { workers, threads } => {
                write!(
                    f,
                    "threads per node ({}) must be >= workers per node ({})",
                    threads, workers
                )
            }
            ConfigError::ZeroAggSize => write!(f, "aggregation size must be non-zero"),
            ConfigError::NotEnoughCores {
                requested,
                available,
            } => {
                write!(
                    f,
                    "cannot pin {} threads, only {} cores are available",
                    requested, available
                )
            }
            ConfigError::PinFailed { thread, core } => {
                write!(f, "unable to pin thread {} to core {}", thread, core)
            }
            ConfigError::Spawn(msg) => write!(f, "unable to spawn runtime thread: {}", msg),
            ConfigError::Transport(msg) => write!(f, "transport error: {}", msg),
            ConfigError::AlreadyRunning => write!(f, "the world is already running"),
        }
    }
}

impl std::error::Error for ConfigError {}

pub type ConfigResult<T> = Result<T, ConfigError>;

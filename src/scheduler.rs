use crate::error::{ConfigError, ConfigResult};

use core_affinity::CoreId;

pub(crate) mod progress;
pub(crate) mod worker_pool;

pub(crate) use progress::ProgressEngine;

/// the cores runtime threads are pinned to, worker `i` uses core `i` and
/// progress thread `j` uses core `num_workers + j`
pub(crate) fn core_ids(num_threads: usize) -> ConfigResult<Vec<CoreId>> {
    let ids = core_affinity::get_core_ids().unwrap_or_default();
    if ids.len() < num_threads {
        return Err(ConfigError::NotEnoughCores {
            requested: num_threads,
            available: ids.len(),
        });
    }
    Ok(ids.into_iter().take(num_threads).collect())
}

/// pin the calling thread, `name` is only used for the error
pub(crate) fn pin_current(core: CoreId, name: &str) -> ConfigResult<()> {
    if core_affinity::set_for_current(core) {
        tracing::trace!(thread = name, core = core.id, "pinned");
        Ok(())
    } else {
        Err(ConfigError::PinFailed {
            thread: name.to_owned(),
            core: core.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_many_threads_is_rejected() {
        let available = core_affinity::get_core_ids().unwrap_or_default().len();
        match core_ids(available + 1) {
            Err(ConfigError::NotEnoughCores {
                requested,
                available: a,
            }) => {
                assert_eq!(requested, available + 1);
                assert_eq!(a, available);
            }
            other => panic!("expected NotEnoughCores, got {:?}", other),
        }
    }

    #[test]
    fn requested_cores_are_distinct() {
        let ids = core_ids(1).unwrap();
        assert_eq!(ids.len(), 1);
        let all = core_affinity::get_core_ids().unwrap_or_default();
        if all.len() >= 2 {
            let ids = core_ids(2).unwrap();
            assert_ne!(ids[0].id, ids[1].id);
        }
    }
}

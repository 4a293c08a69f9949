use std::time::Instant;

pub(crate) enum RuntimeWarning {
    BarrierTimeout(f64),
    FutureTimeout(f64),
    WaitAllTimeout(f64, usize),
}

impl RuntimeWarning {
    fn print_warning(&self, timeout: f64) -> bool {
        if timeout <= 0.0 {
            return false;
        }
        match self {
            RuntimeWarning::BarrierTimeout(elapsed)
            | RuntimeWarning::FutureTimeout(elapsed)
            | RuntimeWarning::WaitAllTimeout(elapsed, _) => *elapsed > timeout,
        }
    }

    pub(crate) fn print(self, timeout: f64) {
        if self.print_warning(timeout) {
            let msg = match self {
                RuntimeWarning::BarrierTimeout(elapsed) => {
                    format!("[LAMELLAR-RPC WARNING][{:?}] barrier has been waiting for {:.1}s, potential deadlock detected.
                    Barrier is a collective operation, every worker on every rank must call it.",
                        std::thread::current().id(), elapsed)
                }
                RuntimeWarning::FutureTimeout(elapsed) => {
                    format!("[LAMELLAR-RPC WARNING][{:?}] an rpc future has been waiting for {:.1}s, potential deadlock detected.
                    Make sure the destination rank is still running progress threads, or that worker progress is enabled.",
                        std::thread::current().id(), elapsed)
                }
                RuntimeWarning::WaitAllTimeout(elapsed, outstanding) => {
                    format!("[LAMELLAR-RPC WARNING][{:?}] wait_all has been waiting for {:.1}s with {} rpcs still outstanding, potential deadlock detected.",
                        std::thread::current().id(), elapsed, outstanding)
                }
            };
            tracing::warn!(
                "{msg}
                The deadlock timeout can be set via the LAMELLAR_RPC_DEADLOCK_TIMEOUT environment variable, the current timeout is {} seconds, setting this to 0 will disable this warning.",
                timeout
            );
        }
    }
}

/// tracks how long a blocking loop has spun, printing a warning every `timeout` seconds
pub(crate) struct DeadlockTimer {
    start: Instant,
    timeout: f64,
}

impl DeadlockTimer {
    pub(crate) fn new(timeout: f64) -> DeadlockTimer {
        DeadlockTimer {
            start: Instant::now(),
            timeout,
        }
    }

    pub(crate) fn check(&mut self, warning: impl FnOnce(f64) -> RuntimeWarning) {
        if self.timeout <= 0.0 {
            return;
        }
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed > self.timeout {
            warning(elapsed).print(self.timeout);
            self.start = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_disables_warnings() {
        assert!(!RuntimeWarning::BarrierTimeout(1e9).print_warning(0.0));
        assert!(!RuntimeWarning::FutureTimeout(0.5).print_warning(1.0));
        assert!(RuntimeWarning::WaitAllTimeout(2.0, 3).print_warning(1.0));
    }

    #[test]
    fn timer_restarts_after_warning() {
        let mut timer = DeadlockTimer::new(1e-9);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let mut fired = 0;
        timer.check(|elapsed| {
            fired += 1;
            RuntimeWarning::FutureTimeout(elapsed)
        });
        assert_eq!(fired, 1);
        assert!(timer.start.elapsed().as_secs_f64() < 1.0);
    }
}

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of [`TimedBarrier::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    /// Every party arrived before the timeout.
    AllArrived,
    /// The wait gave up, or another party already had.
    TimedOut,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    released: bool,
    broken: bool,
}

/// Single-use rendezvous of a fixed number of threads with a bounded wait.
///
/// The first party to time out breaks the barrier and releases everyone
/// still waiting; later arrivals return [`BarrierWait::TimedOut`] at once.
/// Waiting never fails, the result only tells the caller whether the start
/// was simultaneous.
#[derive(Debug)]
pub struct TimedBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl TimedBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn wait(&self, timeout: Duration) -> BarrierWait {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        if state.broken {
            return BarrierWait::TimedOut;
        }
        state.arrived += 1;
        if state.arrived >= self.parties {
            state.released = true;
            self.cvar.notify_all();
            return BarrierWait::AllArrived;
        }

        while !state.released && !state.broken {
            if self.cvar.wait_until(&mut state, deadline).timed_out() {
                if state.released {
                    break;
                }
                state.broken = true;
                self.cvar.notify_all();
                return BarrierWait::TimedOut;
            }
        }

        if state.released {
            BarrierWait::AllArrived
        } else {
            BarrierWait::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_all_parties_arrive() {
        let barrier = Arc::new(TimedBarrier::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.wait(Duration::from_secs(2)))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), BarrierWait::AllArrived);
        }
    }

    #[test]
    fn test_missing_party_times_out() {
        let barrier = Arc::new(TimedBarrier::new(3));
        let start = Instant::now();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.wait(Duration::from_millis(100)))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), BarrierWait::TimedOut);
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));

        // A straggler does not wait on a broken barrier.
        let late = Instant::now();
        assert_eq!(barrier.wait(Duration::from_secs(5)), BarrierWait::TimedOut);
        assert!(late.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_single_party_passes_through() {
        assert_eq!(TimedBarrier::new(1).wait(Duration::ZERO), BarrierWait::AllArrived);
        assert_eq!(TimedBarrier::new(0).wait(Duration::ZERO), BarrierWait::AllArrived);
    }
}

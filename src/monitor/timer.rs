use std::time::{Duration, Instant};

/// Measures one reload.
///
/// Returned by [`PerformanceMonitor::create_timer`](super::PerformanceMonitor::create_timer).
#[derive(Debug, Clone, Copy)]
pub struct ReloadTimer {
    start: Instant,
}

impl ReloadTimer {
    #[inline]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop and return the elapsed time.
    #[inline]
    pub fn stop(self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_is_monotonic() {
        let timer = ReloadTimer::start();
        std::thread::sleep(Duration::from_millis(5));
        let mid = timer.elapsed();
        let end = timer.stop();
        assert!(mid >= Duration::from_millis(5));
        assert!(end >= mid);
    }
}

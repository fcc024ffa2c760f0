//! Sliding-window rate observation.
//!
//! Two fixed windows (previous and current) approximate a sliding window:
//! the previous window's count is weighted by how much of it still overlaps
//! the sliding range. `observe_and_get_excess` counts one observation and
//! returns how far the estimated rate sits above the limit.

use std::time::{Duration, Instant};

pub struct RateObserver {
    window: Duration,
    limit: i64,
    last_end: Option<Instant>,
    current_end: Instant,
    last_count: i64,
    current_count: i64,
}

impl RateObserver {
    pub fn new(window: Duration, limit: i64) -> Self {
        RateObserver {
            window,
            limit,
            last_end: None,
            current_end: Instant::now() + window,
            last_count: 0,
            current_count: 0,
        }
    }

    pub fn observe_and_get_excess(&mut self) -> i64 {
        let now = Instant::now();
        if now > self.current_end {
            self.last_end = Some(self.current_end);
            self.last_count = self.current_count;
            self.current_end = now + self.window;
            self.current_count = 0;
        }
        let previous_weight = match self.last_end {
            Some(last_end) => {
                let sliding_start = now - self.window;
                if last_end > sliding_start {
                    (last_end - sliding_start).as_secs_f32() / self.window.as_secs_f32()
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.current_count += 1;
        let requests =
            (previous_weight * self.last_count as f32 + self.current_count as f32).floor() as i64;
        (requests - self.limit).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn simple_limit() {
        let mut observer = RateObserver::new(Duration::from_millis(400), 2);
        assert_eq!(observer.observe_and_get_excess(), 0);
        assert_eq!(observer.observe_and_get_excess(), 0);
        sleep(Duration::from_millis(200));
        assert_eq!(observer.observe_and_get_excess(), 1);
        assert_eq!(observer.observe_and_get_excess(), 2);
        sleep(Duration::from_millis(200));
        assert_eq!(observer.observe_and_get_excess(), 2);
    }

    #[test]
    fn spaced_observations_stay_within_limit() {
        let mut observer = RateObserver::new(Duration::from_millis(100), 2);
        for _ in 0..4 {
            sleep(Duration::from_millis(40));
            assert_eq!(observer.observe_and_get_excess(), 0);
        }
    }

    #[test]
    fn excess_decays_as_the_window_slides() {
        let mut observer = RateObserver::new(Duration::from_millis(100), 1);
        assert_eq!(observer.observe_and_get_excess(), 0);
        sleep(Duration::from_millis(200));
        // previous window has fully slid out of range
        assert_eq!(observer.observe_and_get_excess(), 0);
        sleep(Duration::from_millis(50));
        assert_eq!(observer.observe_and_get_excess(), 1);
    }
}

//! Token-bucket throttle: a fixed number of acquisitions per second, burst 1.
//!
//! Shared across workers (walkers gating file emission, hash workers gating
//! file reads). A bucket with burst 1 degenerates to "next slot" scheduling:
//! each acquisition reserves the next free slot and sleeps until it arrives.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl Throttle {
    /// A throttle allowing `per_second` acquisitions per second. Returns
    /// `None` for 0, meaning no throttle; callers keep the `Option` and
    /// skip acquisition entirely.
    pub fn new(per_second: u32) -> Option<Self> {
        if per_second == 0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs(1) / per_second,
            next_slot: Mutex::new(Instant::now()),
        })
    }

    /// Wait for the next slot. Fair across callers in lock-acquisition order.
    pub async fn acquire(&self) {
        let wake = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let wake = if *next_slot > now { *next_slot } else { now };
            *next_slot = wake + self.interval;
            wake
        };
        tokio::time::sleep_until(wake).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_means_no_throttle() {
        assert!(Throttle::new(0).is_none());
        assert!(Throttle::new(10).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisitions_are_spaced() {
        let throttle = Throttle::new(10).unwrap(); // 100ms apart
        let start = Instant::now();
        throttle.acquire().await; // first slot is immediate
        throttle.acquire().await;
        throttle.acquire().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_throttle_does_not_accumulate_burst() {
        let throttle = Throttle::new(10).unwrap();
        throttle.acquire().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        // Long idle earns at most one immediate slot, not a burst of 50.
        let start = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Sliding-window order rate limit.
///
/// Unlike a queueing throttle this one answers synchronously: an order over
/// the limit is rejected, not delayed.
pub struct OrderThrottler {
    max_orders: usize,
    window: Duration,
    recent_orders: Mutex<VecDeque<Instant>>,
}

impl OrderThrottler {
    pub fn new(max_orders_per_minute: usize) -> Self {
        Self::with_window(max_orders_per_minute, Duration::from_secs(60))
    }

    pub fn with_window(max_orders: usize, window: Duration) -> Self {
        Self {
            max_orders,
            window,
            recent_orders: Mutex::new(VecDeque::new()),
        }
    }

    pub fn max_orders(&self) -> usize {
        self.max_orders
    }

    /// Take a slot in the current window, or return false when full
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut recent = self.recent_orders.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(&timestamp) = recent.front() {
            if now.duration_since(timestamp) >= self.window {
                recent.pop_front();
            } else {
                break;
            }
        }

        if recent.len() >= self.max_orders {
            warn!(
                "OrderThrottler: rate limit reached ({} orders in {:?})",
                recent.len(),
                self.window
            );
            return false;
        }
        recent.push_back(now);
        true
    }

    pub fn in_window(&self) -> usize {
        self.recent_orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rejects_over_limit() {
        let throttler = OrderThrottler::with_window(3, Duration::from_secs(60));
        assert!(throttler.try_acquire());
        assert!(throttler.try_acquire());
        assert!(throttler.try_acquire());
        assert!(!throttler.try_acquire());
        assert_eq!(throttler.in_window(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_frees_slots() {
        let throttler = OrderThrottler::with_window(2, Duration::from_secs(60));
        assert!(throttler.try_acquire());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(throttler.try_acquire());
        assert!(!throttler.try_acquire());

        // First slot expires, second is still inside the window
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(throttler.try_acquire());
        assert!(!throttler.try_acquire());
    }
}

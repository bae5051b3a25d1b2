use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of "now" for age filtering.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Every wait the poller performs goes through here.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

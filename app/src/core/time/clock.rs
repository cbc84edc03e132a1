use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{DateTime, Duration};

pub trait LocalClock: Send + Sync {
    fn now(&self) -> DateTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now(&self) -> DateTime {
        chrono::Utc::now().into()
    }
}

pub struct ClockSync {
    local: Arc<dyn LocalClock>,
    offset_millis: AtomicI64,
}

impl ClockSync {
    pub fn new(local: Arc<dyn LocalClock>) -> Self {
        Self {
            local,
            offset_millis: AtomicI64::new(0),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// `server_time` is expected to already account for transport latency.
    pub fn reset_time(&self, server_time: DateTime) {
        let local_now = self.local.now();
        let offset = server_time.elapsed_since(local_now);

        tracing::debug!(
            "Setting time to {}. Current machine time is {}. New offset is {}",
            server_time,
            local_now,
            offset
        );

        self.offset_millis.store(offset.as_millis(), Ordering::SeqCst);
    }

    pub fn get_time(&self) -> DateTime {
        self.local.now() + self.offset()
    }

    pub fn offset(&self) -> Duration {
        Duration::millis(self.offset_millis.load(Ordering::SeqCst))
    }

    pub fn local_now(&self) -> DateTime {
        self.local.now()
    }
}

#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(now: DateTime) -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicI64::new(now.millis()),
        })
    }

    pub fn set(&self, now: DateTime) {
        self.millis.store(now.millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis(), Ordering::SeqCst);
    }
}

#[cfg(test)]
impl LocalClock for ManualClock {
    fn now(&self) -> DateTime {
        DateTime::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

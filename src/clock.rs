pub trait Clock: Send + Sync + 'static {
    /// Wall-clock milliseconds since the UNIX epoch.
    fn now(&self) -> u64;
}

pub struct SystemClock;
impl Clock for SystemClock {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }
}

/// Manually advanced clock for tests.
pub struct MockClock {
    ts: std::sync::Mutex<u64>,
}

impl MockClock {
    pub fn new(start: u64) -> Self {
        Self {
            ts: std::sync::Mutex::new(start),
        }
    }
    pub fn advance(&self, delta: u64) {
        *self.ts.lock().unwrap() += delta;
    }
    pub fn set(&self, now: u64) {
        *self.ts.lock().unwrap() = now;
    }
}

impl Clock for MockClock {
    fn now(&self) -> u64 {
        *self.ts.lock().unwrap()
    }
}

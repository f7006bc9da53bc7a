//! SYNC window and TIME consumer services

use sentrycan_common::{messages::TimeOfDay, AtomicCell};

/// Outcome of one SYNC consumer tick
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncTick {
    /// A SYNC object was received since the last tick
    pub sync: bool,
    /// The synchronous window elapsed on this tick
    ///
    /// Reported once per window; pending synchronous TPDOs must be aborted.
    pub window_elapsed: bool,
}

/// The SYNC consumer
///
/// Tracks the synchronous window (object 0x1007) and the optional SYNC
/// counter (overflow value from object 0x1019).
#[allow(missing_debug_implementations)]
pub struct SyncConsumer {
    /// Window length in microseconds; 0 disables window supervision
    window_length_us: AtomicCell<u32>,
    /// Counter overflow value; 0 means the producer sends no counter
    counter_overflow: AtomicCell<u8>,
    /// Time since the last SYNC
    window_timer_us: AtomicCell<u32>,
    /// Set when the current window's expiry has been reported
    window_reported: AtomicCell<bool>,
    last_counter: AtomicCell<Option<u8>>,
}

impl Default for SyncConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncConsumer {
    /// Create a new SYNC consumer with window supervision disabled
    pub const fn new() -> Self {
        Self {
            window_length_us: AtomicCell::new(0),
            counter_overflow: AtomicCell::new(0),
            window_timer_us: AtomicCell::new(0),
            window_reported: AtomicCell::new(true),
            last_counter: AtomicCell::new(None),
        }
    }

    /// Configure the synchronous window length in microseconds (object
    /// 0x1007); 0 disables window supervision
    pub fn set_window_length_us(&self, value: u32) {
        self.window_length_us.store(value);
    }

    /// Get the configured window length
    pub fn window_length_us(&self) -> u32 {
        self.window_length_us.load()
    }

    /// Configure the expected counter overflow value (object 0x1019)
    pub fn set_counter_overflow(&self, value: u8) {
        self.counter_overflow.store(value);
    }

    /// Get the configured counter overflow value
    pub fn counter_overflow(&self) -> u8 {
        self.counter_overflow.load()
    }

    /// The counter carried by the most recent SYNC, if any
    pub fn last_counter(&self) -> Option<u8> {
        self.last_counter.load()
    }

    /// Reset the window state, e.g. at communication reset
    pub fn reset(&self) {
        self.window_timer_us.store(0);
        self.window_reported.store(true);
        self.last_counter.store(None);
    }

    /// Run one tick
    ///
    /// `received` carries the counter byte of a SYNC received since the last
    /// tick (wrapped in Some even when the producer sends no counter, as
    /// `Some(None)`).
    pub fn process(&self, received: Option<Option<u8>>, dt_us: u32) -> SyncTick {
        let mut tick = SyncTick::default();

        if let Some(counter) = received {
            tick.sync = true;
            self.window_timer_us.store(0);
            self.window_reported.store(false);
            if let Some(counter) = counter {
                self.last_counter.store(Some(counter));
            }
        } else {
            let window = self.window_length_us.load();
            if window > 0 && !self.window_reported.load() {
                let timer = self.window_timer_us.load().saturating_add(dt_us);
                self.window_timer_us.store(timer);
                if timer >= window {
                    self.window_reported.store(true);
                    tick.window_elapsed = true;
                }
            }
        }

        tick
    }
}

/// Callback type invoked when a TIME object is received
pub type TimeCallback = dyn Fn(TimeOfDay) + Sync;

/// The TIME consumer
///
/// Stores the most recent time stamp received on COB 0x100 and optionally
/// forwards it to an application callback.
#[allow(missing_debug_implementations)]
pub struct TimeConsumer {
    last: AtomicCell<Option<TimeOfDay>>,
    callback: AtomicCell<Option<&'static TimeCallback>>,
}

impl Default for TimeConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeConsumer {
    /// Create a new TIME consumer
    pub const fn new() -> Self {
        Self {
            last: AtomicCell::new(None),
            callback: AtomicCell::new(None),
        }
    }

    /// Register a callback to be invoked for each received time stamp
    pub fn set_callback(&self, cb: &'static TimeCallback) {
        self.callback.store(Some(cb));
    }

    /// The most recently received time stamp
    pub fn last(&self) -> Option<TimeOfDay> {
        self.last.load()
    }

    /// Handle a received TIME object
    pub fn process(&self, time: TimeOfDay) {
        self.last.store(Some(time));
        if let Some(cb) = self.callback.load() {
            cb(time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_elapses_once() {
        let sync = SyncConsumer::new();
        sync.set_window_length_us(1000);

        // Nothing happens before the first sync
        assert_eq!(SyncTick::default(), sync.process(None, 500));
        assert_eq!(SyncTick::default(), sync.process(None, 1000));

        let tick = sync.process(Some(Some(1)), 0);
        assert!(tick.sync);
        assert_eq!(Some(1), sync.last_counter());

        assert_eq!(SyncTick::default(), sync.process(None, 500));
        let tick = sync.process(None, 600);
        assert!(tick.window_elapsed);
        // Only reported once per window
        assert_eq!(SyncTick::default(), sync.process(None, 600));
    }

    #[test]
    fn test_time_consumer_stores_last() {
        let time = TimeConsumer::new();
        assert_eq!(None, time.last());
        let stamp = TimeOfDay {
            millis: 1234,
            days: 42,
        };
        time.process(stamp);
        assert_eq!(Some(stamp), time.last());
    }
}

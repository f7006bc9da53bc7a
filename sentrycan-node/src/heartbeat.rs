//! Heartbeat consumer
//!
//! Monitors heartbeat messages from remote nodes. If a monitored node does
//! not send its heartbeat within the configured time, an emergency is raised
//! and the entry transitions to Timeout. A boot-up message from a monitored
//! node is reported as a remote reset. When all monitored nodes are
//! operational, [`HeartbeatConsumer::all_monitored_operational`] is true.
//!
//! Consumer entries are set up by writing to object 0x1016, or directly via
//! [`HeartbeatConsumer::configure_entry`].

use sentrycan_common::{
    messages::NmtState,
    objects::{ObjectCode, SubInfo},
    sdo::AbortCode,
    AtomicCell,
};

use crate::emergency::{Emergency, ErrorKind};
use crate::object_dict::ObjectAccess;

/// Heartbeat state of one monitored node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HbState {
    /// Consumer entry inactive
    Unconfigured,
    /// Consumer enabled, but no heartbeat received yet
    Unknown,
    /// Heartbeat received within the configured time
    Active,
    /// No heartbeat received for the configured time
    Timeout,
}

/// One monitored node
#[allow(missing_debug_implementations)]
pub struct HbConsumerEntry {
    node_id: AtomicCell<u8>,
    time_ms: AtomicCell<u16>,
    timer_us: AtomicCell<u32>,
    state: AtomicCell<HbState>,
    remote_state: AtomicCell<Option<NmtState>>,
    /// Raw heartbeat payload byte staged by the receive context
    rx: AtomicCell<Option<u8>>,
}

impl Default for HbConsumerEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl HbConsumerEntry {
    /// Create an unconfigured entry
    pub const fn new() -> Self {
        Self {
            node_id: AtomicCell::new(0),
            time_ms: AtomicCell::new(0),
            timer_us: AtomicCell::new(0),
            state: AtomicCell::new(HbState::Unconfigured),
            remote_state: AtomicCell::new(None),
            rx: AtomicCell::new(None),
        }
    }

    /// The monitored node ID; 0 when unconfigured
    pub fn node_id(&self) -> u8 {
        self.node_id.load()
    }

    /// The expected heartbeat period in ms; 0 disables the entry
    pub fn time_ms(&self) -> u16 {
        self.time_ms.load()
    }

    /// The current monitoring state
    pub fn state(&self) -> HbState {
        self.state.load()
    }

    /// The NMT state last reported by the monitored node
    pub fn remote_state(&self) -> Option<NmtState> {
        self.remote_state.load()
    }

    fn enabled(&self) -> bool {
        self.time_ms.load() != 0 && self.node_id.load() != 0
    }
}

/// Callback invoked for heartbeat consumer events
///
/// Arguments are the monitored node ID and the 1-based entry index (the
/// entry's sub index in object 0x1016).
pub type HbEventCallback = dyn Fn(u8, u8) + Sync;

/// The heartbeat consumer service
#[allow(missing_debug_implementations)]
pub struct HeartbeatConsumer {
    entries: &'static [HbConsumerEntry],
    started_cb: AtomicCell<Option<&'static HbEventCallback>>,
    timeout_cb: AtomicCell<Option<&'static HbEventCallback>>,
    remote_reset_cb: AtomicCell<Option<&'static HbEventCallback>>,
    all_operational: AtomicCell<bool>,
}

impl HeartbeatConsumer {
    /// Create a new consumer over a static array of entries
    pub const fn new(entries: &'static [HbConsumerEntry]) -> Self {
        Self {
            entries,
            started_cb: AtomicCell::new(None),
            timeout_cb: AtomicCell::new(None),
            remote_reset_cb: AtomicCell::new(None),
            all_operational: AtomicCell::new(true),
        }
    }

    /// The monitored entries
    pub fn entries(&self) -> &'static [HbConsumerEntry] {
        self.entries
    }

    /// Register a callback for an entry entering Active
    pub fn on_started(&self, cb: &'static HbEventCallback) {
        self.started_cb.store(Some(cb));
    }

    /// Register a callback for an entry timing out
    pub fn on_timeout(&self, cb: &'static HbEventCallback) {
        self.timeout_cb.store(Some(cb));
    }

    /// Register a callback for a monitored node rebooting
    pub fn on_remote_reset(&self, cb: &'static HbEventCallback) {
        self.remote_reset_cb.store(Some(cb));
    }

    /// Configure one entry
    ///
    /// `time_ms == 0` disables the entry. A node ID above 127, or one
    /// already monitored by another enabled entry, is rejected.
    pub fn configure_entry(&self, index: usize, node_id: u8, time_ms: u16) -> Result<(), AbortCode> {
        let entry = self.entries.get(index).ok_or(AbortCode::NoSuchSubIndex)?;
        if node_id > 127 {
            return Err(AbortCode::InvalidValue);
        }
        if time_ms != 0 && node_id != 0 {
            for (i, other) in self.entries.iter().enumerate() {
                if i != index && other.enabled() && other.node_id.load() == node_id {
                    return Err(AbortCode::IncompatibleParameter);
                }
            }
        }
        entry.node_id.store(node_id);
        entry.time_ms.store(time_ms);
        entry.timer_us.store(0);
        entry.remote_state.store(None);
        entry.rx.store(None);
        entry.state.store(if entry.enabled() {
            HbState::Unknown
        } else {
            HbState::Unconfigured
        });
        Ok(())
    }

    /// Reset monitoring state, e.g. at communication reset
    pub fn reset(&self) {
        for entry in self.entries {
            entry.timer_us.store(0);
            entry.remote_state.store(None);
            entry.rx.store(None);
            entry.state.store(if entry.enabled() {
                HbState::Unknown
            } else {
                HbState::Unconfigured
            });
        }
        self.all_operational.store(true);
    }

    /// Stage a received heartbeat payload byte
    ///
    /// Safe to call from the receive interrupt. Returns true when the node
    /// is monitored by some entry.
    pub fn store_rx(&self, node_id: u8, payload: u8) -> bool {
        for entry in self.entries {
            if entry.enabled() && entry.node_id.load() == node_id {
                entry.rx.store(Some(payload));
                return true;
            }
        }
        false
    }

    /// True iff every enabled entry is Active and its node is Operational
    pub fn all_monitored_operational(&self) -> bool {
        self.all_operational.load()
    }

    /// Run one tick
    pub fn process(&self, dt_us: u32, em: &Emergency) {
        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.enabled() {
                continue;
            }
            let sub = (i + 1) as u8;
            let node = entry.node_id.load();

            if let Some(payload) = entry.rx.take() {
                if payload == 0 {
                    // Boot-up: the monitored node was reset
                    em.raise(ErrorKind::HeartbeatRemoteReset, sub as u32);
                    if let Some(cb) = self.remote_reset_cb.load() {
                        cb(node, sub);
                    }
                    entry.remote_state.store(None);
                    entry.timer_us.store(0);
                    entry.state.store(HbState::Unknown);
                } else if let Ok(state) = NmtState::try_from(payload & 0x7F) {
                    entry.remote_state.store(Some(state));
                    entry.timer_us.store(0);
                    if entry.state.load() != HbState::Active {
                        em.reset(ErrorKind::HeartbeatConsumer, sub as u32);
                        em.reset(ErrorKind::HeartbeatRemoteReset, sub as u32);
                        entry.state.store(HbState::Active);
                        if let Some(cb) = self.started_cb.load() {
                            cb(node, sub);
                        }
                    }
                }
            } else if matches!(entry.state.load(), HbState::Active | HbState::Unknown) {
                let timer = entry.timer_us.load().saturating_add(dt_us);
                entry.timer_us.store(timer);
                if timer >= entry.time_ms.load() as u32 * 1000 {
                    entry.state.store(HbState::Timeout);
                    em.raise(ErrorKind::HeartbeatConsumer, sub as u32);
                    if let Some(cb) = self.timeout_cb.load() {
                        cb(node, sub);
                    }
                }
            }
        }

        let all = self.entries.iter().filter(|e| e.enabled()).all(|e| {
            e.state.load() == HbState::Active && e.remote_state.load() == Some(NmtState::Operational)
        });
        self.all_operational.store(all);
    }
}

/// Implements the consumer heartbeat time object (0x1016)
///
/// Each sub holds `(node_id << 16) | time_ms`; writing `time_ms == 0`
/// disables the entry.
#[allow(missing_debug_implementations)]
pub struct HbConsumerTimeObject {
    consumer: &'static HeartbeatConsumer,
}

impl HbConsumerTimeObject {
    /// Create the object over a consumer
    pub const fn new(consumer: &'static HeartbeatConsumer) -> Self {
        Self { consumer }
    }
}

impl ObjectAccess for HbConsumerTimeObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let entries = self.consumer.entries;
        if sub == 0 {
            if offset > 0 || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = entries.len() as u8;
            Ok(1)
        } else if (sub as usize) <= entries.len() {
            let entry = &entries[(sub - 1) as usize];
            let value = ((entry.node_id() as u32) << 16) | entry.time_ms() as u32;
            Ok(crate::object_dict::read_bytes(
                &value.to_le_bytes(),
                offset,
                buf,
            ))
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        self.sub_info(sub).map(|i| i.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let entries = self.consumer.entries;
        if sub == 0 {
            Err(AbortCode::ReadOnly)
        } else if (sub as usize) <= entries.len() {
            if data.len() != 4 {
                return Err(AbortCode::DataTypeMismatch);
            }
            let value = u32::from_le_bytes(data.try_into().unwrap());
            let node_id = ((value >> 16) & 0xFF) as u8;
            let time_ms = (value & 0xFFFF) as u16;
            self.consumer.configure_entry((sub - 1) as usize, node_id, time_ms)
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Array
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub == 0 {
            Ok(SubInfo::MAX_SUB_NUMBER)
        } else if (sub as usize) <= self.consumer.entries.len() {
            Ok(SubInfo::new_u32().rw_access().persist(true))
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_with_one_entry() -> (&'static HeartbeatConsumer, &'static Emergency) {
        // Leak fresh instances so each test gets its own statics
        extern crate std;
        let entries: &'static [HbConsumerEntry] =
            std::boxed::Box::leak(std::boxed::Box::new([HbConsumerEntry::new()]));
        let consumer = std::boxed::Box::leak(std::boxed::Box::new(HeartbeatConsumer::new(entries)));
        let em = std::boxed::Box::leak(std::boxed::Box::new(Emergency::new()));
        (consumer, em)
    }

    #[test]
    fn test_active_then_timeout() {
        let (consumer, em) = consumer_with_one_entry();
        consumer.configure_entry(0, 0x20, 150).unwrap();
        assert_eq!(HbState::Unknown, consumer.entries()[0].state());

        consumer.store_rx(0x20, NmtState::Operational as u8);
        consumer.process(1000, em);
        assert_eq!(HbState::Active, consumer.entries()[0].state());
        assert!(consumer.all_monitored_operational());

        // Silence for 160 ms
        for _ in 0..160 {
            consumer.process(1000, em);
        }
        assert_eq!(HbState::Timeout, consumer.entries()[0].state());
        assert!(em.is_raised(ErrorKind::HeartbeatConsumer));
        assert!(!consumer.all_monitored_operational());
    }

    #[test]
    fn test_bootup_reports_remote_reset() {
        let (consumer, em) = consumer_with_one_entry();
        consumer.configure_entry(0, 0x20, 150).unwrap();

        consumer.store_rx(0x20, NmtState::Operational as u8);
        consumer.process(1000, em);

        consumer.store_rx(0x20, 0);
        consumer.process(1000, em);
        assert!(em.is_raised(ErrorKind::HeartbeatRemoteReset));
        assert_eq!(HbState::Unknown, consumer.entries()[0].state());

        // Next heartbeat returns to Active
        consumer.store_rx(0x20, NmtState::Operational as u8);
        consumer.process(1000, em);
        assert_eq!(HbState::Active, consumer.entries()[0].state());
        assert!(!em.is_raised(ErrorKind::HeartbeatRemoteReset));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        extern crate std;
        let entries: &'static [HbConsumerEntry] = std::boxed::Box::leak(std::boxed::Box::new([
            HbConsumerEntry::new(),
            HbConsumerEntry::new(),
        ]));
        let consumer = HeartbeatConsumer::new(entries);
        consumer.configure_entry(0, 0x20, 100).unwrap();
        assert_eq!(
            Err(AbortCode::IncompatibleParameter),
            consumer.configure_entry(1, 0x20, 100)
        );
        // Disabled duplicates are fine
        consumer.configure_entry(1, 0x20, 0).unwrap();
    }
}

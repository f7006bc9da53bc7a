//! Test fixtures for the bus-level integration tests
//!
//! Each test builds its own leaked node context ([`TestContext::new`]) so
//! tests can run in parallel without sharing state, and drives it through a
//! [`TestHarness`] which injects frames into the mailbox and collects the
//! frames the node emits.

use std::sync::Mutex;

use sentrycan_common::{
    messages::{CanId, CanMessage},
    objects::{ObjectCode, PdoMapping, SubInfo},
    sdo::{AbortCode, SdoRequest, SdoResponse},
    NodeId,
};
use sentrycan_node::emergency::{ErrorHistoryObject, ErrorRegisterObject};
use sentrycan_node::heartbeat::{HbConsumerTimeObject, HeartbeatConsumer};
use sentrycan_node::object_dict::{
    CallbackObject, ConstField, ODEntry, ObjectFlagAccess, ObjectFlags, ProvidesSubObjects,
    ScalarField, SubObjectAccess,
};
use sentrycan_node::pdo::{PdoCommObject, PdoMappingObject};
use sentrycan_node::srdo_objects::{SrdoCommObject, SrdoCrcObject, SrdoMapObject, SrdoValidObject};
use sentrycan_node::storage::{RestoreCommandObject, StorageCommandObject};
use sentrycan_node::{Node, NodeMbox, NodeState};

/// Node state sizing used by all tests: 4 RPDOs, 4 TPDOs, 2 SRDOs, 2
/// heartbeat consumer entries, and one TX buffer per TPDO plus two per SRDO
pub type TestState = NodeState<4, 4, 2, 2, 8>;

pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// A mappable u16 application variable at sub 1, with TPDO event flags
pub struct AppU16 {
    pub value: ScalarField<u16>,
    flags: ObjectFlags<1>,
}

impl AppU16 {
    pub fn new(value: u16, sync: &'static sentrycan_node::object_dict::ObjectFlagSync) -> Self {
        Self {
            value: ScalarField::<u16>::new(value),
            flags: ObjectFlags::new(sync),
        }
    }
}

impl ProvidesSubObjects for AppU16 {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        match sub {
            0 => Some((
                SubInfo::MAX_SUB_NUMBER,
                const { &ConstField::new(1u8.to_le_bytes()) },
            )),
            1 => Some((
                SubInfo::new_u16()
                    .rw_access()
                    .mappable(PdoMapping::Both)
                    .persist(true),
                &self.value,
            )),
            _ => None,
        }
    }

    fn flags(&self) -> Option<&dyn ObjectFlagAccess> {
        Some(&self.flags)
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }
}

/// The identity record (0x1018)
struct IdentityObject;

impl ProvidesSubObjects for IdentityObject {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        match sub {
            0 => Some((
                SubInfo::MAX_SUB_NUMBER,
                const { &ConstField::new(4u8.to_le_bytes()) },
            )),
            1 => Some((SubInfo::new_u32(), const { &ConstField::new(0x10u32.to_le_bytes()) })),
            2 => Some((SubInfo::new_u32(), const { &ConstField::new(0x20u32.to_le_bytes()) })),
            3 => Some((SubInfo::new_u32(), const { &ConstField::new(0x30u32.to_le_bytes()) })),
            4 => Some((SubInfo::new_u32(), const { &ConstField::new(0x40u32.to_le_bytes()) })),
            _ => None,
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }
}

/// A u32 VAR object
struct VarU32 {
    value: ScalarField<u32>,
    info: SubInfo,
}

impl ProvidesSubObjects for VarU32 {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        (sub == 0).then_some((self.info, &self.value as &dyn SubObjectAccess))
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }
}

/// A u16 VAR object
struct VarU16 {
    value: ScalarField<u16>,
    info: SubInfo,
}

impl ProvidesSubObjects for VarU16 {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        (sub == 0).then_some((self.info, &self.value as &dyn SubObjectAccess))
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }
}

/// A u8 VAR object
struct VarU8 {
    value: ScalarField<u8>,
    info: SubInfo,
}

impl ProvidesSubObjects for VarU8 {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        (sub == 0).then_some((self.info, &self.value as &dyn SubObjectAccess))
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }
}

/// A string VAR object (0x2002)
struct VarString {
    value: sentrycan_node::object_dict::NullTermByteField<20>,
}

impl ProvidesSubObjects for VarString {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        (sub == 0).then_some((
            SubInfo::new_visible_str(20).rw_access(),
            &self.value as &dyn SubObjectAccess,
        ))
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }
}

/// Handles to the application-level pieces of a test node
pub struct TestContext {
    pub state: &'static TestState,
    pub mbox: &'static NodeMbox,
    pub hb_consumer: &'static HeartbeatConsumer,
    pub od: &'static [ODEntry<'static>],
    /// Application variable at 0x2000 sub 1 (TX data source)
    pub tx_var: &'static AppU16,
    /// Application variable at 0x2010 sub 1 (RX data sink)
    pub rx_var: &'static AppU16,
}

impl TestContext {
    /// Build a fresh, fully wired node context
    pub fn new() -> TestContext {
        let state: &'static TestState = leak(TestState::new());
        let hb_consumer = leak(HeartbeatConsumer::new(state.hb_entries()));
        let mbox = leak(NodeMbox::new(state.rpdos(), state.srdos(), hb_consumer));

        let tx_var = leak(AppU16::new(0x1234, state.pdo_sync()));
        let rx_var = leak(AppU16::new(0, state.pdo_sync()));

        let device_type = leak(VarU32 {
            value: ScalarField::<u32>::new(0),
            info: SubInfo::new_u32(),
        });
        let error_register = leak(ErrorRegisterObject::new(state.em()));
        let error_history = leak(ErrorHistoryObject::new(state.em()));
        let sync_window = leak(VarU32 {
            value: ScalarField::<u32>::new(0),
            info: SubInfo::new_u32().rw_access(),
        });
        let hb_producer_time = leak(VarU16 {
            value: ScalarField::<u16>::new(0),
            info: SubInfo::new_u16().rw_access().persist(true),
        });
        let sync_overflow = leak(VarU8 {
            value: ScalarField::<u8>::new(0),
            info: SubInfo::new_u8().rw_access(),
        });
        let identity = leak(IdentityObject);
        let store_cmd = leak(CallbackObject::new(ObjectCode::Array));
        let restore_cmd = leak(RestoreCommandObject::new(state.storage()));
        let hb_consumer_time = leak(HbConsumerTimeObject::new(hb_consumer));

        let srdo_comm1 = leak(SrdoCommObject::new(&state.srdos()[0], state.guard()));
        let srdo_comm2 = leak(SrdoCommObject::new(&state.srdos()[1], state.guard()));
        let srdo_map1 = leak(SrdoMapObject::new(&state.srdos()[0], state.guard()));
        let srdo_map2 = leak(SrdoMapObject::new(&state.srdos()[1], state.guard()));
        let srdo_valid = leak(SrdoValidObject::new(state.guard()));
        let srdo_crc = leak(SrdoCrcObject::new(state.srdos(), state.guard()));

        let rpdo_comm = leak(PdoCommObject::new(&state.rpdos()[0]));
        let rpdo_mapping = leak(CallbackObject::new(ObjectCode::Record));
        let tpdo_comm = leak(PdoCommObject::new(&state.tpdos()[0]));
        let tpdo_mapping = leak(CallbackObject::new(ObjectCode::Record));

        let string_var = leak(VarString {
            value: sentrycan_node::object_dict::NullTermByteField::new([0; 20]),
        });

        let od: &'static [ODEntry<'static>] = leak([
            ODEntry {
                index: 0x1000,
                data: device_type,
            },
            ODEntry {
                index: 0x1001,
                data: error_register,
            },
            ODEntry {
                index: 0x1003,
                data: error_history,
            },
            ODEntry {
                index: 0x1007,
                data: sync_window,
            },
            ODEntry {
                index: 0x1010,
                data: store_cmd,
            },
            ODEntry {
                index: 0x1011,
                data: restore_cmd,
            },
            ODEntry {
                index: 0x1016,
                data: hb_consumer_time,
            },
            ODEntry {
                index: 0x1017,
                data: hb_producer_time,
            },
            ODEntry {
                index: 0x1018,
                data: identity,
            },
            ODEntry {
                index: 0x1019,
                data: sync_overflow,
            },
            ODEntry {
                index: 0x1301,
                data: srdo_comm1,
            },
            ODEntry {
                index: 0x1302,
                data: srdo_comm2,
            },
            ODEntry {
                index: 0x1381,
                data: srdo_map1,
            },
            ODEntry {
                index: 0x1382,
                data: srdo_map2,
            },
            ODEntry {
                index: 0x13FE,
                data: srdo_valid,
            },
            ODEntry {
                index: 0x13FF,
                data: srdo_crc,
            },
            ODEntry {
                index: 0x1400,
                data: rpdo_comm,
            },
            ODEntry {
                index: 0x1600,
                data: rpdo_mapping,
            },
            ODEntry {
                index: 0x1800,
                data: tpdo_comm,
            },
            ODEntry {
                index: 0x1A00,
                data: tpdo_mapping,
            },
            ODEntry {
                index: 0x2000,
                data: tx_var,
            },
            ODEntry {
                index: 0x2002,
                data: string_var,
            },
            ODEntry {
                index: 0x2010,
                data: rx_var,
            },
        ]);

        // The mapping and storage objects need the finished table, so they
        // are registered into their placeholders afterwards
        rpdo_mapping.register(leak(PdoMappingObject::new(od, &state.rpdos()[0])));
        tpdo_mapping.register(leak(PdoMappingObject::new(od, &state.tpdos()[0])));
        store_cmd.register(leak(StorageCommandObject::new(od, state.storage())));

        TestContext {
            state,
            mbox,
            hb_consumer,
            od,
            tx_var,
            rx_var,
        }
    }

    /// Create the node over this context
    pub fn make_node(&self, node_id: u8) -> Node {
        let node_id = NodeId::new(node_id).unwrap();
        Node::init(node_id, self.mbox, self.state, self.od).finalize()
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one node and records the frames it emits
pub struct TestHarness {
    pub ctx: TestContext,
    pub node: Node,
    pub sent: Vec<CanMessage>,
    pub now_us: u64,
}

impl TestHarness {
    /// Create a context and a node with the given ID, without processing
    pub fn new(node_id: u8) -> Self {
        let ctx = TestContext::new();
        let node = ctx.make_node(node_id);
        Self {
            ctx,
            node,
            sent: Vec::new(),
            now_us: 0,
        }
    }

    /// Create a node and run the first tick, discarding the boot-up traffic
    pub fn booted(node_id: u8) -> Self {
        let mut harness = Self::new(node_id);
        harness.tick();
        harness.sent.clear();
        harness
    }

    /// Deliver a frame to the node, as the CAN receive interrupt would
    pub fn inject(&self, msg: CanMessage) {
        self.ctx.mbox.store_message(msg).ok();
    }

    /// Advance time by 1 ms and run one process call
    pub fn tick(&mut self) {
        self.now_us += 1000;
        let mut out = Vec::new();
        self.node.process(self.now_us, &mut |msg| out.push(msg));
        self.sent.extend(out);
    }

    /// Run `ms` one-millisecond ticks
    pub fn tick_ms(&mut self, ms: u32) {
        for _ in 0..ms {
            self.tick();
        }
    }

    /// Take all frames emitted so far
    pub fn take_sent(&mut self) -> Vec<CanMessage> {
        std::mem::take(&mut self.sent)
    }

    /// Take the emitted frames carrying the given 11-bit identifier
    pub fn take_sent_with_id(&mut self, id: u16) -> Vec<CanMessage> {
        let (matching, rest) = std::mem::take(&mut self.sent)
            .into_iter()
            .partition(|m| m.id() == CanId::Std(id));
        self.sent = rest;
        matching
    }

    fn sdo_request(&mut self, req: SdoRequest) -> SdoResponse {
        let req_id = 0x600 + self.node.node_id() as u16;
        let resp_id = 0x580 + self.node.node_id() as u16;
        self.inject(req.to_can_message(CanId::Std(req_id)));
        self.tick();
        let responses = self.take_sent_with_id(resp_id);
        assert_eq!(1, responses.len(), "expected exactly one SDO response");
        SdoResponse::try_from(responses[0].data()).unwrap()
    }

    /// Write a value via an expedited SDO download
    pub fn sdo_download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let resp = self.sdo_request(SdoRequest::expedited_download(index, sub, data));
        match resp {
            SdoResponse::DownloadAcknowledge { .. } => Ok(()),
            SdoResponse::Abort { abort_code, .. } => {
                Err(AbortCode::try_from(abort_code).expect("unknown abort code"))
            }
            other => panic!("unexpected SDO response: {other:?}"),
        }
    }

    /// Read a value via an expedited SDO upload
    pub fn sdo_upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>, AbortCode> {
        let resp = self.sdo_request(SdoRequest::initiate_upload(index, sub));
        match resp {
            SdoResponse::UploadAcknowledge {
                n, e: true, data, ..
            } => Ok(data[..4 - n as usize].to_vec()),
            SdoResponse::Abort { abort_code, .. } => {
                Err(AbortCode::try_from(abort_code).expect("unknown abort code"))
            }
            other => panic!("unexpected SDO response: {other:?}"),
        }
    }

    /// Send an NMT command to this node
    pub fn nmt_command(&mut self, cs: sentrycan_common::messages::NmtCommandSpecifier) {
        self.inject(
            sentrycan_common::messages::NmtCommand {
                cs,
                node: self.node.node_id(),
            }
            .into(),
        );
        self.tick();
    }

    /// Configure SRDO `slot` through the object dictionary and accept the
    /// configuration: store the matching CRC, set the valid magic, and
    /// perform the communication reset the acceptance requires
    pub fn configure_srdo(&mut self, slot: u8, dir: u8, refresh_ms: u16, srvt: u8, maps: &[u32]) {
        let comm = 0x1301 + slot as u16;
        let mapping = 0x1381 + slot as u16;

        // The mapping may only change while the SRDO is disabled
        self.sdo_download(comm, 1, &[0]).unwrap();
        self.sdo_download(mapping, 0, &[0]).unwrap();
        for (i, map) in maps.iter().enumerate() {
            self.sdo_download(mapping, i as u8 + 1, &map.to_le_bytes())
                .unwrap();
        }
        self.sdo_download(mapping, 0, &[maps.len() as u8]).unwrap();

        self.sdo_download(comm, 2, &refresh_ms.to_le_bytes()).unwrap();
        self.sdo_download(comm, 3, &[srvt]).unwrap();
        self.sdo_download(comm, 4, &[254]).unwrap();
        self.sdo_download(comm, 5, &0x101u32.to_le_bytes()).unwrap();
        self.sdo_download(comm, 6, &0x102u32.to_le_bytes()).unwrap();
        self.sdo_download(comm, 1, &[dir]).unwrap();

        let crc = self.ctx.state.srdos()[slot as usize].calc_crc();
        self.sdo_download(0x13FF, slot + 1, &crc.to_le_bytes()).unwrap();
        self.sdo_download(0x13FE, 1, &[0xA5]).unwrap();

        // The accepted flag only takes effect at communication reset
        self.nmt_command(sentrycan_common::messages::NmtCommandSpecifier::ResetComm);
        self.sent.clear();
    }
}

/// A recorder for callback invocations, usable as a leaked static
pub struct CallRecorder<T: Send> {
    calls: Mutex<Vec<T>>,
}

impl<T: Send + Clone> CallRecorder<T> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, value: T) {
        self.calls.lock().unwrap().push(value);
    }

    pub fn calls(&self) -> Vec<T> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl<T: Send + Clone> Default for CallRecorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a mapping descriptor `(index, sub, bit length)`
pub fn map_entry(index: u16, sub: u8, bits: u8) -> u32 {
    ((index as u32) << 16) | ((sub as u32) << 8) | bits as u32
}

//! Serialization of persist-flagged object values
//!
//! The store-parameters command walks the object dictionary and streams
//! every sub-object marked `persist` to the application's storage callback
//! as a sequence of length-prefixed nodes. The application hands the same
//! bytes back at boot via [`restore_stored_objects`], before the first call
//! to `Node::process`.
//!
//! Node layout: a u16 length prefix, followed by `length` bytes consisting
//! of a node type byte, the u16 object index, the sub index, and the raw
//! value bytes. All integers are little-endian.

use core::convert::Infallible;

use crate::object_dict::{find_object, ODEntry, ObjectAccess};

use defmt_or_log::{debug, warn};

/// A callback function type for handling a store-objects event
///
/// The callback receives a reader producing the serialized stream and the
/// total number of bytes it will produce.
pub type StoreObjectsCallback = dyn Fn(&mut dyn embedded_io::Read<Error = Infallible>, usize) + Sync;

/// Specifies the types of nodes which can be serialized to persistent
/// storage
#[derive(Debug, Copy, Clone, PartialEq)]
#[repr(u8)]
pub enum NodeType {
    /// A node containing a saved sub-object value
    ObjectValue = 1,
    /// An unrecognized node type
    Unknown,
}

impl NodeType {
    /// Create a `NodeType` from an ID byte
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => Self::ObjectValue,
            _ => Self::Unknown,
        }
    }
}

/// Per-node overhead: u16 length prefix, type byte, u16 index, sub index
const OVERHEAD_SIZE: usize = 6;

fn is_persistable(entry: &ODEntry, sub: u8) -> Option<usize> {
    let info = entry.data.sub_info(sub).ok()?;
    if !info.persist {
        return None;
    }
    entry.data.read_size(sub).ok()
}

/// Compute the total size of the serialized stream for this dictionary
pub fn serialized_size(objects: &[ODEntry]) -> usize {
    let mut size = 0;
    for obj in objects {
        for sub in 0..=obj.data.max_sub_number() {
            if let Some(data_size) = is_persistable(obj, sub) {
                size += data_size + OVERHEAD_SIZE;
            }
        }
    }
    size
}

struct NodeCursor {
    entry: usize,
    sub: u8,
    header: [u8; OVERHEAD_SIZE],
    header_pos: usize,
    data_size: usize,
    data_pos: usize,
}

/// A pull-based reader producing the serialized object stream on demand
struct PersistSerializer<'a> {
    od: &'a [ODEntry<'static>],
    next_entry: usize,
    next_sub: u16,
    current: Option<NodeCursor>,
}

impl<'a> PersistSerializer<'a> {
    fn new(od: &'a [ODEntry<'static>]) -> Self {
        Self {
            od,
            next_entry: 0,
            next_sub: 0,
            current: None,
        }
    }

    /// Advance to the next persistable sub-object, if there is one
    fn advance(&mut self) -> bool {
        while self.next_entry < self.od.len() {
            let entry = &self.od[self.next_entry];
            let max_sub = entry.data.max_sub_number() as u16;
            while self.next_sub <= max_sub {
                let sub = self.next_sub as u8;
                self.next_sub += 1;
                if let Some(data_size) = is_persistable(entry, sub) {
                    let node_len = (data_size + 4) as u16;
                    let mut header = [0u8; OVERHEAD_SIZE];
                    header[0..2].copy_from_slice(&node_len.to_le_bytes());
                    header[2] = NodeType::ObjectValue as u8;
                    header[3..5].copy_from_slice(&entry.index.to_le_bytes());
                    header[5] = sub;
                    self.current = Some(NodeCursor {
                        entry: self.next_entry,
                        sub,
                        header,
                        header_pos: 0,
                        data_size,
                        data_pos: 0,
                    });
                    return true;
                }
            }
            self.next_entry += 1;
            self.next_sub = 0;
        }
        false
    }
}

impl embedded_io::ErrorType for PersistSerializer<'_> {
    type Error = Infallible;
}

impl embedded_io::Read for PersistSerializer<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        let mut pos = 0;
        while pos < buf.len() {
            let cursor = match &mut self.current {
                Some(cursor) => cursor,
                None => {
                    if self.advance() {
                        continue;
                    }
                    return Ok(pos);
                }
            };

            if cursor.header_pos < cursor.header.len() {
                let n = (buf.len() - pos).min(cursor.header.len() - cursor.header_pos);
                buf[pos..pos + n]
                    .copy_from_slice(&cursor.header[cursor.header_pos..cursor.header_pos + n]);
                cursor.header_pos += n;
                pos += n;
            } else if cursor.data_pos < cursor.data_size {
                let n = (buf.len() - pos).min(cursor.data_size - cursor.data_pos);
                // The size was committed in the header; pad with zeros if the
                // value shrank in the meantime
                let read = self.od[cursor.entry]
                    .data
                    .read(cursor.sub, cursor.data_pos, &mut buf[pos..pos + n])
                    .unwrap_or(0);
                if read < n {
                    buf[pos + read..pos + n].fill(0);
                }
                cursor.data_pos += n;
                pos += n;
            } else {
                self.current = None;
            }
        }
        Ok(pos)
    }
}

/// Serialize persist-flagged object values to the storage callback
pub fn serialize(od: &'static [ODEntry], callback: &StoreObjectsCallback) {
    let size = serialized_size(od);
    let mut serializer = PersistSerializer::new(od);
    callback(&mut serializer, size)
}

/// The data for an ObjectValue node
#[derive(Debug, PartialEq)]
pub struct ObjectValue<'a> {
    /// The object index this value belongs to
    pub index: u16,
    /// The sub-object index this value belongs to
    pub sub: u8,
    /// The raw bytes to be restored to the sub-object
    pub data: &'a [u8],
}

/// A reference to a single node within a slice of serialized data
#[derive(Debug, PartialEq)]
pub enum PersistNodeRef<'a> {
    /// A saved value for a sub-object
    ObjectValue(ObjectValue<'a>),
    /// An unrecognized node type; either the data is malformed or it was
    /// written by a newer version supporting more node types
    Unknown(&'a [u8]),
}

impl<'a> PersistNodeRef<'a> {
    fn from_slice(data: &'a [u8]) -> Option<Self> {
        match NodeType::from_byte(*data.first()?) {
            NodeType::ObjectValue => {
                if data.len() < 4 {
                    return None;
                }
                Some(Self::ObjectValue(ObjectValue {
                    index: u16::from_le_bytes(data[1..3].try_into().unwrap()),
                    sub: data[3],
                    data: &data[4..],
                }))
            }
            NodeType::Unknown => Some(PersistNodeRef::Unknown(data)),
        }
    }
}

/// Iterator over the nodes stored in a slice of serialized data
struct PersistNodeReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PersistNodeReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { buf: data, pos: 0 }
    }
}

impl<'a> Iterator for PersistNodeReader<'a> {
    type Item = PersistNodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() - self.pos < 2 {
            return None;
        }
        let length = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        let node_slice = self.buf.get(self.pos..self.pos + length as usize)?;
        self.pos += length as usize;

        PersistNodeRef::from_slice(node_slice)
    }
}

/// Load values of objects previously persisted in serialized format
///
/// # Arguments
/// - `od`: The object dictionary where objects will be updated
/// - `stored_data`: A slice of bytes, as previously provided to the
///   store-objects callback
pub fn restore_stored_objects(od: &[ODEntry], stored_data: &[u8]) {
    for item in PersistNodeReader::new(stored_data) {
        match item {
            PersistNodeRef::ObjectValue(restore) => {
                if let Some(obj) = find_object(od, restore.index) {
                    debug!(
                        "Restoring 0x{:x}sub{} ({} bytes)",
                        restore.index,
                        restore.sub,
                        restore.data.len()
                    );
                    if let Err(abort_code) = obj.write(restore.sub, restore.data) {
                        warn!(
                            "Error restoring object 0x{:x}sub{}: {:x}",
                            restore.index, restore.sub, abort_code as u32
                        );
                    }
                } else {
                    warn!("Saved object 0x{:x} not found in OD", restore.index);
                }
            }
            PersistNodeRef::Unknown(data) => {
                warn!("Unknown persisted node type read: {}", data[0])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::vec::Vec;

    use super::*;
    use crate::object_dict::{
        ConstField, NullTermByteField, ProvidesSubObjects, ScalarField, SubObjectAccess,
    };
    use embedded_io::Read as _;
    use sentrycan_common::objects::{ObjectCode, SubInfo};

    #[derive(Default)]
    struct Object100 {
        value1: ScalarField<u32>,
        value2: ScalarField<u16>,
    }

    impl ProvidesSubObjects for Object100 {
        fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
            match sub {
                0 => Some((
                    SubInfo::MAX_SUB_NUMBER,
                    const { &ConstField::new(2u8.to_le_bytes()) },
                )),
                1 => Some((SubInfo::new_u32().rw_access().persist(true), &self.value1)),
                2 => Some((SubInfo::new_u16().rw_access(), &self.value2)),
                _ => None,
            }
        }

        fn object_code(&self) -> ObjectCode {
            ObjectCode::Record
        }
    }

    #[derive(Default)]
    struct Object200 {
        string: NullTermByteField<15>,
    }

    impl ProvidesSubObjects for Object200 {
        fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
            match sub {
                0 => Some((
                    SubInfo::new_visible_str(self.string.len())
                        .rw_access()
                        .persist(true),
                    &self.string,
                )),
                _ => None,
            }
        }

        fn object_code(&self) -> ObjectCode {
            ObjectCode::Var
        }
    }

    fn build_od() -> &'static [ODEntry<'static>] {
        let inst100 = std::boxed::Box::leak(std::boxed::Box::new(Object100::default()));
        let inst200 = std::boxed::Box::leak(std::boxed::Box::new(Object200::default()));
        std::boxed::Box::leak(std::boxed::Box::new([
            ODEntry {
                index: 0x100,
                data: inst100,
            },
            ODEntry {
                index: 0x200,
                data: inst200,
            },
        ]))
    }

    #[test]
    fn test_serialize_deserialize() {
        let od = build_od();
        find_object(od, 0x100)
            .unwrap()
            .write(1, &42u32.to_le_bytes())
            .unwrap();
        find_object(od, 0x200).unwrap().write(0, b"test").unwrap();

        let data = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let data_clone = data.clone();
        serialize(od, &move |reader, _size| {
            const CHUNK_SIZE: usize = 2;
            let mut buf = [0; CHUNK_SIZE];
            loop {
                let n = reader.read(&mut buf).unwrap();
                data_clone.lock().unwrap().extend_from_slice(&buf[..n]);
                if n < buf.len() {
                    break;
                }
            }
        });

        let data = data.lock().unwrap().clone();
        // 4-byte value node + 4-byte "test" node, 6 bytes overhead each
        assert_eq!(20, data.len());
        assert_eq!(data.len(), serialized_size(od));

        let mut deser = PersistNodeReader::new(&data);
        assert_eq!(
            deser.next().unwrap(),
            PersistNodeRef::ObjectValue(ObjectValue {
                index: 0x100,
                sub: 1,
                data: &42u32.to_le_bytes()
            })
        );
        assert_eq!(
            deser.next().unwrap(),
            PersistNodeRef::ObjectValue(ObjectValue {
                index: 0x200,
                sub: 0,
                data: b"test"
            })
        );
        assert_eq!(deser.next(), None);

        // Restore into a fresh dictionary
        let od2 = build_od();
        restore_stored_objects(od2, &data);
        assert_eq!(42, find_object(od2, 0x100).unwrap().read_u32(1).unwrap());
        let mut buf = [0u8; 15];
        let n = find_object(od2, 0x200).unwrap().read(0, 0, &mut buf).unwrap();
        assert_eq!(b"test", &buf[..n]);
    }

    #[test]
    fn test_restore_tolerates_truncation() {
        let od = build_od();
        // A length prefix promising more bytes than exist must not panic
        restore_stored_objects(od, &[10, 0, 1, 0]);
    }
}

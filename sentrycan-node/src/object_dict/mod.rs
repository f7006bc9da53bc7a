//! Object Dictionary
//!
//! # Objects overview
//!
//! The object dictionary is the main mechanism of configuration and
//! communication for a node. SDO access is performed on sub-objects,
//! identified by the 16-bit index of their parent object and an 8-bit sub
//! index. Objects come in three varieties:
//!
//! - VAR: A single variable of any type (accessed at sub index 0)
//! - ARRAY: An array of sub-objects, all with the same type. Sub-index 0 is a
//!   u8 containing the size of the array.
//! - RECORD: A collection of sub-objects of heterogenous types. Sub-index 0
//!   contains the highest implemented sub index.
//!
//! # Object storage
//!
//! The dictionary is a static, sorted table of [`ODEntry`] values, each
//! pointing at a struct implementing [`ObjectAccess`]. Simple data objects
//! are built from the field types in this module ([`ScalarField`],
//! [`ByteField`], ...) wrapped in a struct implementing
//! [`ProvidesSubObjects`]. Protocol objects (PDO and SRDO records, the
//! storage commands, the heartbeat consumer table, ...) are custom
//! [`ObjectAccess`] implementations which intercept reads and writes and can
//! delegate to an embedded stock field for the plain-storage part of their
//! behavior.
//!
//! Objects whose handler is only known at runtime are declared as
//! [`CallbackObject`] placeholders and get their implementation registered
//! during node init.
//!
//! # Threading
//!
//! All objects are `Sync` and `Send`; single reads and writes are atomic via
//! the `critical_section` crate. The SDO server buffers segmented transfers,
//! so a sub-object is always written with a single `write` call.
//!
//! # Object flags for TPDO event triggering
//!
//! Some objects support event flags, set via [`ObjectAccess::set_event_flag`],
//! which are used to trigger event-driven TPDO transmission.

mod object_flags;
mod objects;
mod sub_objects;

// Pull up public sub module definitions. The submodules provide some code
// organization, but shouldn't clutter the public API
pub use object_flags::*;
pub use objects::*;
pub use sub_objects::*;

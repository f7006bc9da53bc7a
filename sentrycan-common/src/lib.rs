#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

//! Shared protocol types for the sentrycan CANopen stack
//!
//! This crate holds everything that both a node implementation and test or
//! host-side tooling need: the CAN message model, message serialization for
//! the standard services (NMT, heartbeat, SYNC, TIME, EMCY, SDO, LSS), the
//! object model metadata types, and a small critical-section backed cell used
//! for lock-free-ish sharing between interrupt and thread context.

mod atomic_cell;
pub mod constants;
pub mod lss;
pub mod messages;
pub mod node_id;
pub mod objects;
pub mod sdo;
pub mod traits;

pub use atomic_cell::AtomicCell;
pub use messages::{CanId, CanMessage};
pub use node_id::NodeId;

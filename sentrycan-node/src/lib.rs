#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

//! A CANopen node stack with a CiA 304 SRDO safety engine
//!
//! The stack is built around three statically allocated pieces which the
//! application wires together:
//!
//! - The object dictionary: a sorted table of [`object_dict::ODEntry`] values
//! - A [`NodeState`]: per-node storage for PDOs, SRDOs and the storage
//!   context, sized by const generics
//! - A [`NodeMbox`]: the receive-side mailbox, safe to feed from a CAN
//!   receive interrupt
//!
//! The [`Node`] object owns the protocol state machines and is driven by
//! polling [`Node::process`] from a periodic task, typically at 1 ms.

pub mod can;
pub mod crc;
pub mod emergency;
pub mod heartbeat;
pub mod lss_slave;
pub mod node;
pub mod node_mbox;
pub mod node_state;
pub mod object_dict;
pub mod pdo;
pub mod persist;
pub mod sdo_server;
pub mod srdo;
pub mod srdo_objects;
pub mod storage;
pub mod sync;

pub use node::{InitNode, Node};
pub use node_mbox::NodeMbox;
pub use node_state::NodeState;

// Re-export the common crate for convenience
pub use sentrycan_common as common;

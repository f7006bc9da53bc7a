//! Common traits

use core::time::Duration;

use crate::messages::CanMessage;

/// A synchronous CAN sender
pub trait CanSender {
    /// Send a message to the bus
    ///
    /// On failure (e.g. a full hardware queue) the rejected message is
    /// returned.
    fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage>;
}

/// A synchronous CAN receiver
pub trait CanReceiver {
    /// The error type returned by recv
    type Error;
    /// Attempt to read a message, returning None immediately if no message is
    /// available
    fn try_recv(&mut self) -> Option<CanMessage>;
    /// A blocking receive with timeout
    fn recv(&mut self, timeout: Duration) -> Result<CanMessage, Self::Error>;
}

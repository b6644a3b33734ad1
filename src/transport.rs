//! The byte-out side of the core's transport-agnostic interface.
//!
//! The core never opens a socket and never owns one; it is handed
//! something implementing [`Transport`] and writes serialized protocol
//! bytes to it. Byte-in delivery is the mirror operation, modeled as a
//! plain `data_received(&[u8])`-shaped method on each component that
//! consumes bytes (see [`crate::ami::AmiMultiplexer::data_received`] and
//! [`crate::agi::AgiConnection::data_received`]) rather than as a trait,
//! since nothing needs to be generic over "a thing bytes arrive from".
pub trait Transport {
    /// Writes `data` out. Errors are the host's concern: if the transport
    /// is gone, report that upstream via `connection_lost`-style handling
    /// rather than from inside `write`.
    fn write(&mut self, data: &[u8]);
}

//! Transport abstraction: the doorbell/shared-memory packet channel.
//!
//! Concrete implementations live in the platform layer (IPC doorbell
//! registers on silicon, a loopback in tests). The driver is generic over
//! `Transport`, so it never touches doorbell registers directly.
//!
//! Inbound packets are not read through this trait: the platform's
//! receive interrupt hands them to [`Heci::on_packet`](super::Heci::on_packet).

use crate::error::TransportError;

/// Packet-oriented transport to the host.
pub trait Transport: Send {
    /// Write one encoded packet (header + payload, at most
    /// [`PACKET_SIZE`](super::wire::PACKET_SIZE) bytes).
    fn write_packet(&mut self, packet: &[u8]) -> Result<(), TransportError>;
}

/// A transport that discards every packet.
/// Useful before the host link is brought up.
pub struct NullTransport;

impl Transport for NullTransport {
    fn write_packet(&mut self, _packet: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }
}

//! HECI inter-task channels.
//!
//! Uses `embassy-sync` bounded channels on both sides of the driver:
//! the receive interrupt feeds raw packets to the dispatcher, and the
//! dispatcher feeds events to each client.
//!
//! ```text
//! ┌───────────┐  InboundPacket  ┌────────────┐  HeciEvent  ┌──────────┐
//! │ IPC ISR   │───────────────▶│ Dispatcher │────────────▶│ Client n │
//! │ on_packet │                 │ (async)    │  per client │ (thread) │
//! └───────────┘                 └────────────┘             └──────────┘
//! ```

extern crate alloc;
use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use log::warn;

use super::registry::ConnectionId;
use super::wire::PACKET_SIZE;

/// Per-client event queue depth.
pub const EVENT_DEPTH: usize = 8;

/// Inbound packet queue depth.
pub const INBOUND_DEPTH: usize = 16;

/// What a delivered message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A new connection; `data` is empty. Reply with a flow-control
    /// grant to accept traffic on it.
    Connect,
    /// A complete client message from the host.
    Request,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxMessage {
    pub kind: MessageKind,
    pub connection: ConnectionId,
    pub data: Vec<u8>,
}

/// Event delivered to a registered client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeciEvent {
    NewMessage(RxMessage),
    /// The connection is going away; the client must call
    /// `complete_disconnect` once it has stopped using it.
    Disconnect { connection: ConnectionId },
}

/// One raw packet as received from the transport.
pub type InboundPacket = heapless::Vec<u8, PACKET_SIZE>;

pub type EventChannel = Channel<CriticalSectionRawMutex, HeciEvent, EVENT_DEPTH>;

pub type InboundChannel = Channel<CriticalSectionRawMutex, InboundPacket, INBOUND_DEPTH>;

/// Push an event, waiting for the client to drain its queue when full.
/// Events are never dropped.
pub(super) async fn post_event(channel: &EventChannel, client: u8, event: HeciEvent) {
    if let Err(TrySendError::Full(event)) = channel.try_send(event) {
        warn!("HECI[{}]: event channel full, waiting for client", client);
        channel.send(event).await;
    }
}

// ── Tests ────────────────────────────────────────────────────

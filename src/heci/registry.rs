//! Client and connection tables.
//!
//! Both tables live in one [`Registry`] behind one lock. The registry is
//! pure state: handlers in `bus` take the lock, ask the registry what to
//! do, release the lock, then send replies and push events.
//!
//! Connection lifecycle:
//!
//! ```text
//!            CONNECT_REQ                 first fragment
//!  Unused ──────────────▶ Open ◀────────────────────────▶ ProcessingMessage
//!    ▲                     │        last fragment                │
//!    │                     │ DISCONNECT_REQ / host stop /        │
//!    │                     │ rx overflow                         │
//!    │                     ▼                                     │
//!    └─────────────── Disconnecting{send_response} ◀─────────────┘
//!   complete_disconnect
//! ```

extern crate alloc;
use alloc::vec::Vec;

use log::{debug, info, warn};

use super::fragment::{Overflow, RxBuffer};
use super::wire::{
    ClientProperties, ConnectStatus, FIRST_CLIENT_ADDRESS, Guid, MAX_MSG_SIZE, set_address_bit,
};
use crate::error::HeciError;

// ── Constants ────────────────────────────────────────────────

/// Client slots. Addresses are `FIRST_CLIENT_ADDRESS + slot`.
pub const MAX_CLIENTS: usize = 8;

/// Connection slots shared by all clients.
pub const MAX_CONNECTIONS: usize = 16;

/// Connection identifier (index into the connection table).
pub type ConnectionId = u8;

// ── Client description ───────────────────────────────────────

/// What a client declares when it registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientDescriptor {
    pub protocol_id: Guid,
    /// Largest message in either direction, at most `MAX_MSG_SIZE`.
    pub max_msg_size: u32,
    pub protocol_ver: u8,
    pub max_n_of_connections: u8,
    pub dma_header_length: u8,
    pub dma_enabled: bool,
    /// Size of the client's single receive buffer.
    pub rx_buffer_len: u32,
}

/// Returned by `register`; identifies the client's event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHandle {
    index: u8,
    address: u8,
}

impl ClientHandle {
    pub fn index(&self) -> usize {
        usize::from(self.index)
    }

    /// Bus address assigned to the client.
    pub fn address(&self) -> u8 {
        self.address
    }
}

pub(super) struct Client {
    desc: ClientDescriptor,
    address: u8,
    active: bool,
    n_of_conns: u8,
    rx: RxBuffer,
}

impl Client {
    fn properties(&self) -> ClientProperties {
        ClientProperties {
            protocol_id: self.desc.protocol_id,
            protocol_ver: self.desc.protocol_ver,
            max_n_of_connections: self.desc.max_n_of_connections,
            fixed_address: self.address,
            max_msg_size: self.desc.max_msg_size,
            dma_header_length: self.desc.dma_header_length,
            dma_enabled: self.desc.dma_enabled,
        }
    }
}

// ── Connection state ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unused,
    /// Half-open; honoured by disconnect lookups.
    ConnectionRequest,
    Open,
    /// Open with a message being reassembled.
    ProcessingMessage,
    /// Waiting for the client's `complete_disconnect`. `send_response`
    /// means the host asked and is owed a DISCONNECT_RESP.
    Disconnecting { send_response: bool },
}

impl ConnectionState {
    fn mask_bit(self) -> u8 {
        match self {
            Self::Unused => 0,
            Self::ConnectionRequest => StateMask::CONNECTION_REQUEST.0,
            Self::Open => StateMask::OPEN.0,
            Self::ProcessingMessage => StateMask::PROCESSING.0,
            Self::Disconnecting { .. } => StateMask::DISCONNECTING.0,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::Open | Self::ProcessingMessage)
    }
}

/// Set of states for [`Registry::find_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMask(u8);

impl StateMask {
    pub const CONNECTION_REQUEST: Self = Self(1 << 0);
    pub const OPEN: Self = Self(1 << 1);
    pub const PROCESSING: Self = Self(1 << 2);
    pub const DISCONNECTING: Self = Self(1 << 3);

    /// Open or reassembling.
    pub const ACTIVE: Self = Self(Self::OPEN.0 | Self::PROCESSING.0);

    pub fn contains(self, state: ConnectionState) -> bool {
        self.0 & state.mask_bit() != 0
    }
}

impl core::ops::BitOr for StateMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub state: ConnectionState,
    pub fw_addr: u8,
    pub host_addr: u8,
    pub client: u8,
    /// The connection owns its client's rx buffer.
    pub holds_rx: bool,
}

impl Connection {
    const UNUSED: Self = Self {
        state: ConnectionState::Unused,
        fw_addr: 0,
        host_addr: 0,
        client: 0,
        holds_rx: false,
    };
}

// ── Outcomes ─────────────────────────────────────────────────

/// Result of a host DISCONNECT_REQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// No connection for the pair; reply client-not-found.
    NotFound,
    /// Connection now disconnecting. `notify` is false when it already
    /// was, so the client has had its event.
    Started {
        id: ConnectionId,
        client: u8,
        notify: bool,
    },
}

/// Result of feeding one client packet into reassembly.
#[derive(Debug, PartialEq, Eq)]
pub enum RxOutcome {
    /// No open connection for the pair.
    NoConnection,
    /// First fragment while the client's rx buffer is locked.
    BufferBusy,
    Partial,
    Complete {
        id: ConnectionId,
        client: u8,
        data: Vec<u8>,
    },
    /// Message exceeded the client's limits; connection torn down.
    Overflow { id: ConnectionId, client: u8 },
}

/// What `send` needs to know about a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTarget {
    pub fw_addr: u8,
    pub host_addr: u8,
    pub client: u8,
    /// Largest message the client may send.
    pub limit: usize,
    pub dma_enabled: bool,
}

/// Addresses of a connection whose teardown owes the host a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingResponse {
    pub fw_addr: u8,
    pub host_addr: u8,
}

// ── Registry ─────────────────────────────────────────────────

pub struct Registry {
    clients: [Option<Client>; MAX_CLIENTS],
    connections: [Connection; MAX_CONNECTIONS],
    notify_new_clients: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            clients: core::array::from_fn(|_| None),
            connections: [Connection::UNUSED; MAX_CONNECTIONS],
            notify_new_clients: false,
        }
    }

    // ── Clients ──────────────────────────────────────────────

    /// Add a client. Returns its handle and, when the host asked to hear
    /// about late clients, the properties to announce.
    pub fn register(
        &mut self,
        desc: ClientDescriptor,
    ) -> Result<(ClientHandle, Option<ClientProperties>), HeciError> {
        if desc.max_n_of_connections == 0 || desc.rx_buffer_len == 0 || desc.max_msg_size == 0 {
            warn!("HECI: rejecting client {} with bad params", desc.protocol_id);
            return Err(HeciError::InvalidParam);
        }
        if desc.max_msg_size as usize > MAX_MSG_SIZE {
            warn!(
                "HECI: client {} max_msg_size {} over {}",
                desc.protocol_id, desc.max_msg_size, MAX_MSG_SIZE
            );
            return Err(HeciError::Oversize);
        }
        if self
            .clients
            .iter()
            .flatten()
            .any(|c| c.desc.protocol_id == desc.protocol_id)
        {
            warn!("HECI: client {} already registered", desc.protocol_id);
            return Err(HeciError::Duplicate);
        }
        let Some(slot) = self.clients.iter().position(Option::is_none) else {
            warn!("HECI: client table full");
            return Err(HeciError::TableFull);
        };

        let address = slot as u8 + FIRST_CLIENT_ADDRESS;
        let limit = (desc.max_msg_size as usize)
            .min(desc.rx_buffer_len as usize)
            .min(MAX_MSG_SIZE);
        let client = Client {
            desc,
            address,
            active: false,
            n_of_conns: 0,
            rx: RxBuffer::new(limit),
        };
        let announce = self.notify_new_clients.then(|| client.properties());
        self.clients[slot] = Some(client);

        info!("HECI: client {} registered at address {}", desc.protocol_id, address);
        Ok((
            ClientHandle {
                index: slot as u8,
                address,
            },
            announce,
        ))
    }

    fn client_by_address(&self, address: u8) -> Option<(usize, &Client)> {
        self.clients
            .iter()
            .enumerate()
            .find_map(|(i, c)| c.as_ref().filter(|c| c.address == address).map(|c| (i, c)))
    }

    pub fn client_properties(&self, address: u8) -> Option<ClientProperties> {
        self.client_by_address(address).map(|(_, c)| c.properties())
    }

    /// HOST_ENUM: activate every client and build the address bitmap.
    pub fn enumerate(&mut self, notify_new_clients: bool) -> [u8; 32] {
        let mut bitmap = [0u8; 32];
        for client in self.clients.iter_mut().flatten() {
            set_address_bit(&mut bitmap, client.address);
            client.active = true;
        }
        if notify_new_clients {
            self.notify_new_clients = true;
        }
        bitmap
    }

    /// ADD_CLIENT_RESP with success status.
    pub fn activate(&mut self, address: u8) -> bool {
        match self.clients.iter_mut().flatten().find(|c| c.address == address) {
            Some(c) => {
                c.active = true;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, address: u8) -> bool {
        self.client_by_address(address).is_some_and(|(_, c)| c.active)
    }

    // ── Connections ──────────────────────────────────────────

    pub fn find_connection(&self, fw_addr: u8, host_addr: u8, mask: StateMask) -> Option<ConnectionId> {
        self.connections
            .iter()
            .position(|c| mask.contains(c.state) && c.fw_addr == fw_addr && c.host_addr == host_addr)
            .map(|i| i as ConnectionId)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(usize::from(id))
    }

    /// CONNECT_REQ. On success the client's rx buffer is claimed for the
    /// connect notification.
    pub fn connect(&mut self, fw_addr: u8, host_addr: u8) -> Result<(ConnectionId, u8), ConnectStatus> {
        let Some((index, client)) = self.client_by_address(fw_addr) else {
            warn!("HECI: connect to unknown client {}", fw_addr);
            return Err(ConnectStatus::ClientNotFound);
        };
        if host_addr == 0 {
            warn!("HECI: connect to {} with host address 0", fw_addr);
            return Err(ConnectStatus::Rejected);
        }
        if !client.active {
            warn!("HECI: client {} is inactive", fw_addr);
            return Err(ConnectStatus::InactiveClient);
        }
        if client.n_of_conns >= client.desc.max_n_of_connections {
            warn!("HECI: client {} exceeds max connections", fw_addr);
            return Err(ConnectStatus::Rejected);
        }
        let Some(id) = self
            .connections
            .iter()
            .position(|c| c.state == ConnectionState::Unused)
        else {
            warn!("HECI: no free connection");
            return Err(ConnectStatus::Rejected);
        };

        let Some(client) = self.clients[index].as_mut() else {
            return Err(ConnectStatus::ClientNotFound);
        };
        if !client.rx.lock() {
            warn!("HECI: client {} rx buffer busy", fw_addr);
            return Err(ConnectStatus::Rejected);
        }
        client.n_of_conns += 1;
        self.connections[id] = Connection {
            state: ConnectionState::Open,
            fw_addr,
            host_addr,
            client: index as u8,
            holds_rx: true,
        };
        debug!("HECI: conn {} open ({}<->{})", id, host_addr, fw_addr);
        Ok((id as ConnectionId, index as u8))
    }

    /// DISCONNECT_REQ from the host.
    pub fn disconnect_request(&mut self, fw_addr: u8, host_addr: u8) -> DisconnectOutcome {
        let mask = StateMask::ACTIVE | StateMask::CONNECTION_REQUEST | StateMask::DISCONNECTING;
        let Some(id) = self.find_connection(fw_addr, host_addr, mask) else {
            warn!("HECI: disconnect for unknown pair {}<->{}", host_addr, fw_addr);
            return DisconnectOutcome::NotFound;
        };
        let conn = &mut self.connections[usize::from(id)];
        let notify = !matches!(conn.state, ConnectionState::Disconnecting { .. });
        conn.state = ConnectionState::Disconnecting {
            send_response: true,
        };
        DisconnectOutcome::Started {
            id,
            client: conn.client,
            notify,
        }
    }

    /// Validate a connection for an outbound message.
    pub fn send_target(&self, id: ConnectionId) -> Result<SendTarget, HeciError> {
        let conn = self.connection(id).ok_or(HeciError::BadConnection)?;
        if !conn.state.is_open() {
            return Err(HeciError::BadConnection);
        }
        let client = self.clients[usize::from(conn.client)]
            .as_ref()
            .ok_or(HeciError::BadConnection)?;
        Ok(SendTarget {
            fw_addr: conn.fw_addr,
            host_addr: conn.host_addr,
            client: conn.client,
            limit: (client.desc.max_msg_size as usize).min(MAX_MSG_SIZE),
            dma_enabled: client.desc.dma_enabled,
        })
    }

    /// Client is done with its last message: give back the rx buffer.
    /// Returns the pair to grant a flow-control packet to.
    pub fn release_rx(&mut self, id: ConnectionId) -> Result<(u8, u8), HeciError> {
        let conn = self
            .connections
            .get_mut(usize::from(id))
            .ok_or(HeciError::BadConnection)?;
        if !conn.state.is_open() {
            warn!("HECI: conn {} closed, no flow control", id);
            return Err(HeciError::BadConnection);
        }
        if conn.holds_rx {
            conn.holds_rx = false;
            if let Some(client) = self.clients[usize::from(conn.client)].as_mut() {
                client.rx.unlock();
            }
        }
        Ok((conn.fw_addr, conn.host_addr))
    }

    /// Free a disconnecting connection slot.
    pub fn complete_disconnect(&mut self, id: ConnectionId) -> Result<Option<PendingResponse>, HeciError> {
        let conn = *self.connection(id).ok_or(HeciError::BadConnection)?;
        let ConnectionState::Disconnecting { send_response } = conn.state else {
            warn!("HECI: complete_disconnect on conn {} in {:?}", id, conn.state);
            return Err(HeciError::BadConnection);
        };
        if let Some(client) = self.clients[usize::from(conn.client)].as_mut() {
            if conn.holds_rx {
                client.rx.unlock();
            }
            client.n_of_conns = client.n_of_conns.saturating_sub(1);
        }
        self.connections[usize::from(id)] = Connection::UNUSED;
        debug!("HECI: conn {} released", id);
        Ok(send_response.then_some(PendingResponse {
            fw_addr: conn.fw_addr,
            host_addr: conn.host_addr,
        }))
    }

    /// Host stop / Sx entry: force every live connection into
    /// Disconnecting. Returns the connections whose client must hear
    /// about it.
    pub fn reset_all(&mut self) -> heapless::Vec<(ConnectionId, u8), MAX_CONNECTIONS> {
        let mut notify = heapless::Vec::new();
        for (id, conn) in self.connections.iter_mut().enumerate() {
            match conn.state {
                ConnectionState::Open | ConnectionState::ProcessingMessage => {
                    conn.state = ConnectionState::Disconnecting {
                        send_response: false,
                    };
                    // One entry per connection slot.
                    let _ = notify.push((id as ConnectionId, conn.client));
                }
                ConnectionState::Disconnecting { .. } => {
                    conn.state = ConnectionState::Disconnecting {
                        send_response: false,
                    };
                }
                _ => {}
            }
        }
        notify
    }

    // ── Reassembly ───────────────────────────────────────────

    /// Feed one packet of client traffic.
    pub fn receive_fragment(&mut self, fw_addr: u8, host_addr: u8, payload: &[u8], last: bool) -> RxOutcome {
        let Some(id) = self.find_connection(fw_addr, host_addr, StateMask::ACTIVE) else {
            return RxOutcome::NoConnection;
        };
        let conn = &mut self.connections[usize::from(id)];
        let Some(client) = self.clients[usize::from(conn.client)].as_mut() else {
            return RxOutcome::NoConnection;
        };

        if conn.state == ConnectionState::Open {
            if !client.rx.lock() {
                return RxOutcome::BufferBusy;
            }
            conn.holds_rx = true;
            conn.state = ConnectionState::ProcessingMessage;
        }

        if client.rx.append(payload) == Err(Overflow) {
            warn!(
                "HECI: conn {} message over {} bytes, tearing down",
                id,
                client.rx.limit()
            );
            client.rx.unlock();
            conn.holds_rx = false;
            conn.state = ConnectionState::Disconnecting {
                send_response: false,
            };
            return RxOutcome::Overflow {
                id,
                client: conn.client,
            };
        }

        if !last {
            return RxOutcome::Partial;
        }
        conn.state = ConnectionState::Open;
        RxOutcome::Complete {
            id,
            client: conn.client,
            data: client.rx.take(),
        }
    }

    /// Open connection named by a RESET_REQ, if any.
    pub fn reset_target(&self, fw_addr: u8, host_addr: u8) -> Option<ConnectionId> {
        self.find_connection(fw_addr, host_addr, StateMask::ACTIVE)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────

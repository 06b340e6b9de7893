//! HECI wire format: packet header and bus-management messages.
//!
//! Every packet on the doorbell transport is:
//! ```text
//! ┌──────────────────────────────────────────────┬───────────────────────┐
//! │ Header (4B, LE u32)                          │ Payload (0..=124 B)   │
//! │ fw_addr:8 | host_addr:8 | len:9 | rsvd:6 | last_frag:1              │
//! └──────────────────────────────────────────────┴───────────────────────┘
//! ```
//!
//! Packets addressed to [`DRIVER_ADDRESS`] carry a bus-management message
//! whose first byte is the opcode. Requests have bit 7 clear; the matching
//! response sets it. Every other address is opaque client traffic.

use heapless::Vec;

use crate::error::WireError;

// ── Constants ────────────────────────────────────────────────

/// Largest packet the doorbell transport carries (header included).
pub const PACKET_SIZE: usize = 128;

/// Packet header size.
pub const HEADER_SIZE: usize = 4;

/// Largest payload of a single packet.
pub const MAX_PAYLOAD_SIZE: usize = PACKET_SIZE - HEADER_SIZE;

/// Protocol hard cap on one logical client message.
pub const MAX_MSG_SIZE: usize = 4096;

/// Bus-management traffic is addressed here on both sides.
pub const DRIVER_ADDRESS: u8 = 0;

/// Fixed firmware-side addresses that are reserved but carry no client.
pub const SYSTEM_STATE_ADDRESS: u8 = 1;
pub const FW_STATE_ADDRESS: u8 = 2;

/// Dynamically registered clients get addresses from here upward.
pub const FIRST_CLIENT_ADDRESS: u8 = 3;

pub const DRIVER_MAJOR_VERSION: u8 = 1;
pub const DRIVER_MINOR_VERSION: u8 = 0;

/// Most transfer entries that fit in one DMA transfer-ack packet.
pub const MAX_XFER_ENTRIES: usize = (MAX_PAYLOAD_SIZE - 4) / XFER_ENTRY_SIZE;

const XFER_ENTRY_SIZE: usize = 16;
const PROPERTIES_SIZE: usize = 28;
const ADDRESS_BITMAP_SIZE: usize = 32;

/// Encoded packet, header included.
pub type Packet = Vec<u8, PACKET_SIZE>;

/// Encoded bus-management payload.
pub type BusPayload = Vec<u8, MAX_PAYLOAD_SIZE>;

// ── Opcodes ──────────────────────────────────────────────────

pub mod command {
    pub const VERSION_REQ: u8 = 0x01;
    pub const HOST_STOP_REQ: u8 = 0x02;
    pub const HOST_ENUM_REQ: u8 = 0x04;
    pub const CLIENT_PROP_REQ: u8 = 0x05;
    pub const CONNECT_REQ: u8 = 0x06;
    pub const DISCONNECT_REQ: u8 = 0x07;
    pub const FLOW_CONTROL: u8 = 0x08;
    pub const RESET_REQ: u8 = 0x09;
    pub const ADD_CLIENT_REQ: u8 = 0x0A;
    pub const DMA_ALLOC_NOTIFY_REQ: u8 = 0x11;
    pub const DMA_XFER_REQ: u8 = 0x12;

    pub const RESPONSE: u8 = 0x80;

    pub const VERSION_RESP: u8 = VERSION_REQ | RESPONSE;
    pub const HOST_STOP_RESP: u8 = HOST_STOP_REQ | RESPONSE;
    pub const HOST_ENUM_RESP: u8 = HOST_ENUM_REQ | RESPONSE;
    pub const CLIENT_PROP_RESP: u8 = CLIENT_PROP_REQ | RESPONSE;
    pub const CONNECT_RESP: u8 = CONNECT_REQ | RESPONSE;
    pub const DISCONNECT_RESP: u8 = DISCONNECT_REQ | RESPONSE;
    pub const RESET_RESP: u8 = RESET_REQ | RESPONSE;
    pub const ADD_CLIENT_RESP: u8 = ADD_CLIENT_REQ | RESPONSE;
    pub const DMA_ALLOC_RESP: u8 = DMA_ALLOC_NOTIFY_REQ | RESPONSE;
    pub const DMA_XFER_ACK: u8 = DMA_XFER_REQ | RESPONSE;
}

/// Status byte of connect/disconnect/reset/property replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectStatus {
    Success = 0,
    ClientNotFound = 1,
    AlreadyExists = 2,
    Rejected = 3,
    InvalidParameter = 4,
    InactiveClient = 5,
}

impl ConnectStatus {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Success),
            1 => Some(Self::ClientNotFound),
            2 => Some(Self::AlreadyExists),
            3 => Some(Self::Rejected),
            4 => Some(Self::InvalidParameter),
            5 => Some(Self::InactiveClient),
            _ => None,
        }
    }
}

// ── Packet header ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub fw_addr: u8,
    pub host_addr: u8,
    /// Payload length in bytes (9 bits on the wire).
    pub len: u16,
    pub last_frag: bool,
}

impl PacketHeader {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let raw = u32::from(self.fw_addr)
            | u32::from(self.host_addr) << 8
            | (u32::from(self.len) & 0x1FF) << 16
            | u32::from(self.last_frag) << 31;
        raw.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        let raw = u32::from_le_bytes(bytes);
        Self {
            fw_addr: raw as u8,
            host_addr: (raw >> 8) as u8,
            len: ((raw >> 16) & 0x1FF) as u16,
            last_frag: raw >> 31 != 0,
        }
    }
}

/// Build one packet. Returns `None` if `payload` exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode_packet(fw_addr: u8, host_addr: u8, last_frag: bool, payload: &[u8]) -> Option<Packet> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return None;
    }
    let header = PacketHeader {
        fw_addr,
        host_addr,
        len: payload.len() as u16,
        last_frag,
    };
    let mut packet = Packet::new();
    packet.extend_from_slice(&header.to_bytes()).ok()?;
    packet.extend_from_slice(payload).ok()?;
    Some(packet)
}

/// Split a received packet into header and payload, checking that the
/// header's length field matches what was actually received.
pub fn decode_packet(raw: &[u8]) -> Result<(PacketHeader, &[u8]), WireError> {
    if raw.len() < HEADER_SIZE {
        return Err(WireError::Truncated);
    }
    let header = PacketHeader::from_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let payload = &raw[HEADER_SIZE..];
    if usize::from(header.len) != payload.len() || payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::LengthMismatch {
            declared: usize::from(header.len),
            actual: payload.len(),
        });
    }
    Ok((header, payload))
}

// ── Client identity ──────────────────────────────────────────

/// 16-byte protocol identifier, stored in wire (little-endian fields) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        let a = data1.to_le_bytes();
        let b = data2.to_le_bytes();
        let c = data3.to_le_bytes();
        Self([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], data4[0], data4[1], data4[2],
            data4[3], data4[4], data4[5], data4[6], data4[7],
        ])
    }
}

impl core::fmt::Display for Guid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let g = &self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            u32::from_le_bytes([g[0], g[1], g[2], g[3]]),
            u16::from_le_bytes([g[4], g[5]]),
            u16::from_le_bytes([g[6], g[7]]),
            g[8],
            g[9],
            g[10],
            g[11],
            g[12],
            g[13],
            g[14],
            g[15]
        )
    }
}

/// Client properties as reported in property and add-client messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientProperties {
    pub protocol_id: Guid,
    pub protocol_ver: u8,
    pub max_n_of_connections: u8,
    pub fixed_address: u8,
    pub max_msg_size: u32,
    /// 7 bits on the wire.
    pub dma_header_length: u8,
    pub dma_enabled: bool,
}

impl ClientProperties {
    fn write(&self, w: &mut Writer) {
        w.put_slice(&self.protocol_id.0);
        w.put_u8(self.protocol_ver);
        w.put_u8(self.max_n_of_connections);
        w.put_u8(self.fixed_address);
        w.put_u8(1); // single receive buffer
        w.put_u32(self.max_msg_size);
        w.put_u8((self.dma_header_length & 0x7F) | u8::from(self.dma_enabled) << 7);
        w.put_slice(&[0; 3]);
    }

    fn read(p: &[u8]) -> Self {
        let mut id = [0u8; 16];
        id.copy_from_slice(&p[..16]);
        Self {
            protocol_id: Guid(id),
            protocol_ver: p[16],
            max_n_of_connections: p[17],
            fixed_address: p[18],
            max_msg_size: le_u32(p, 20),
            dma_header_length: p[24] & 0x7F,
            dma_enabled: p[24] & 0x80 != 0,
        }
    }
}

/// One entry of a DMA transfer request/acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferEntry {
    pub host_addr: u64,
    pub len: u32,
}

// ── Bus-management messages ──────────────────────────────────

/// Every bus-management message, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    VersionRequest { major: u8, minor: u8 },
    VersionResponse { supported: bool, major: u8, minor: u8 },
    HostStopRequest,
    HostStopResponse,
    EnumRequest { notify_new_clients: bool },
    EnumResponse { valid_addresses: [u8; ADDRESS_BITMAP_SIZE] },
    ClientPropRequest { address: u8 },
    ClientPropResponse {
        address: u8,
        status: u8,
        properties: Option<ClientProperties>,
    },
    ConnectRequest { fw_addr: u8, host_addr: u8 },
    ConnectResponse { fw_addr: u8, host_addr: u8, status: u8 },
    DisconnectRequest { fw_addr: u8, host_addr: u8 },
    DisconnectResponse { fw_addr: u8, host_addr: u8, status: u8 },
    FlowControl { fw_addr: u8, host_addr: u8, packets: u8 },
    ResetRequest { fw_addr: u8, host_addr: u8 },
    ResetResponse { fw_addr: u8, host_addr: u8, status: u8 },
    AddClientRequest { client_addr: u8, properties: ClientProperties },
    AddClientResponse { client_addr: u8, status: u8 },
    DmaAllocNotify { buf_addr: u64, buf_size: u32 },
    DmaAllocResponse { status: u8 },
    DmaXferRequest {
        fw_addr: u8,
        host_addr: u8,
        entry: XferEntry,
    },
    DmaXferAck { entries: Vec<XferEntry, MAX_XFER_ENTRIES> },
}

impl BusMessage {
    pub fn command(&self) -> u8 {
        use command::*;
        match self {
            Self::VersionRequest { .. } => VERSION_REQ,
            Self::VersionResponse { .. } => VERSION_RESP,
            Self::HostStopRequest => HOST_STOP_REQ,
            Self::HostStopResponse => HOST_STOP_RESP,
            Self::EnumRequest { .. } => HOST_ENUM_REQ,
            Self::EnumResponse { .. } => HOST_ENUM_RESP,
            Self::ClientPropRequest { .. } => CLIENT_PROP_REQ,
            Self::ClientPropResponse { .. } => CLIENT_PROP_RESP,
            Self::ConnectRequest { .. } => CONNECT_REQ,
            Self::ConnectResponse { .. } => CONNECT_RESP,
            Self::DisconnectRequest { .. } => DISCONNECT_REQ,
            Self::DisconnectResponse { .. } => DISCONNECT_RESP,
            Self::FlowControl { .. } => FLOW_CONTROL,
            Self::ResetRequest { .. } => RESET_REQ,
            Self::ResetResponse { .. } => RESET_RESP,
            Self::AddClientRequest { .. } => ADD_CLIENT_REQ,
            Self::AddClientResponse { .. } => ADD_CLIENT_RESP,
            Self::DmaAllocNotify { .. } => DMA_ALLOC_NOTIFY_REQ,
            Self::DmaAllocResponse { .. } => DMA_ALLOC_RESP,
            Self::DmaXferRequest { .. } => DMA_XFER_REQ,
            Self::DmaXferAck { .. } => DMA_XFER_ACK,
        }
    }

    /// Serialize into a bus payload (opcode first).
    pub fn encode(&self) -> BusPayload {
        let mut w = Writer::new();
        w.put_u8(self.command());
        match self {
            Self::VersionRequest { major, minor } => w.put_slice(&[0, *minor, *major]),
            Self::VersionResponse {
                supported,
                major,
                minor,
            } => w.put_slice(&[u8::from(*supported), *minor, *major]),
            Self::HostStopRequest | Self::HostStopResponse => w.put_slice(&[0; 3]),
            Self::EnumRequest { notify_new_clients } => {
                w.put_slice(&[u8::from(*notify_new_clients), 0, 0]);
            }
            Self::EnumResponse { valid_addresses } => {
                w.put_slice(&[0; 3]);
                w.put_slice(valid_addresses);
            }
            Self::ClientPropRequest { address } => w.put_slice(&[*address, 0, 0]),
            Self::ClientPropResponse {
                address,
                status,
                properties,
            } => {
                w.put_slice(&[*address, *status, 0]);
                match properties {
                    Some(p) => p.write(&mut w),
                    None => w.put_slice(&[0; PROPERTIES_SIZE]),
                }
            }
            Self::ConnectRequest { fw_addr, host_addr }
            | Self::DisconnectRequest { fw_addr, host_addr }
            | Self::ResetRequest { fw_addr, host_addr } => {
                w.put_slice(&[*fw_addr, *host_addr, 0]);
            }
            Self::ConnectResponse {
                fw_addr,
                host_addr,
                status,
            }
            | Self::DisconnectResponse {
                fw_addr,
                host_addr,
                status,
            }
            | Self::ResetResponse {
                fw_addr,
                host_addr,
                status,
            } => w.put_slice(&[*fw_addr, *host_addr, *status]),
            Self::FlowControl {
                fw_addr,
                host_addr,
                packets,
            } => {
                w.put_slice(&[*fw_addr, *host_addr, *packets]);
                w.put_slice(&[0; 4]);
            }
            Self::AddClientRequest {
                client_addr,
                properties,
            } => {
                w.put_slice(&[*client_addr, 0, 0]);
                properties.write(&mut w);
            }
            Self::AddClientResponse {
                client_addr,
                status,
            } => w.put_slice(&[*client_addr, *status, 0]),
            Self::DmaAllocNotify { buf_addr, buf_size } => {
                w.put_slice(&[0; 3]);
                w.put_u64(*buf_addr);
                w.put_u32(*buf_size);
                w.put_u32(0);
            }
            Self::DmaAllocResponse { status } => w.put_slice(&[*status, 0, 0]),
            Self::DmaXferRequest {
                fw_addr,
                host_addr,
                entry,
            } => {
                w.put_slice(&[*fw_addr, *host_addr, 0]);
                w.put_u64(entry.host_addr);
                w.put_u32(entry.len);
                w.put_u32(0);
            }
            Self::DmaXferAck { entries } => {
                w.put_slice(&[0; 3]);
                for e in entries {
                    w.put_u64(e.host_addr);
                    w.put_u32(e.len);
                    w.put_u32(0);
                }
            }
        }
        w.finish()
    }

    /// Parse a bus payload. Fixed-layout messages must have their exact
    /// size; list-carrying ones must hold at least one full entry (the
    /// transfer ack may be empty).
    pub fn decode(p: &[u8]) -> Result<Self, WireError> {
        use command::*;

        let Some(&cmd) = p.first() else {
            return Err(WireError::Empty);
        };
        let exact = |size: usize| {
            if p.len() == size {
                Ok(())
            } else {
                Err(WireError::BadMessageLength {
                    command: cmd,
                    len: p.len(),
                })
            }
        };
        let at_least = |size: usize| {
            if p.len() >= size {
                Ok(())
            } else {
                Err(WireError::BadMessageLength {
                    command: cmd,
                    len: p.len(),
                })
            }
        };

        let msg = match cmd {
            VERSION_REQ => {
                exact(4)?;
                Self::VersionRequest {
                    minor: p[2],
                    major: p[3],
                }
            }
            VERSION_RESP => {
                exact(4)?;
                Self::VersionResponse {
                    supported: p[1] != 0,
                    minor: p[2],
                    major: p[3],
                }
            }
            HOST_STOP_REQ => Self::HostStopRequest,
            HOST_STOP_RESP => Self::HostStopResponse,
            HOST_ENUM_REQ => {
                exact(4)?;
                Self::EnumRequest {
                    notify_new_clients: p[1] != 0,
                }
            }
            HOST_ENUM_RESP => {
                exact(4 + ADDRESS_BITMAP_SIZE)?;
                let mut valid_addresses = [0u8; ADDRESS_BITMAP_SIZE];
                valid_addresses.copy_from_slice(&p[4..]);
                Self::EnumResponse { valid_addresses }
            }
            CLIENT_PROP_REQ => {
                exact(4)?;
                Self::ClientPropRequest { address: p[1] }
            }
            CLIENT_PROP_RESP => {
                exact(4 + PROPERTIES_SIZE)?;
                Self::ClientPropResponse {
                    address: p[1],
                    status: p[2],
                    properties: (p[2] == ConnectStatus::Success as u8)
                        .then(|| ClientProperties::read(&p[4..])),
                }
            }
            CONNECT_REQ | DISCONNECT_REQ | RESET_REQ => {
                exact(4)?;
                let (fw_addr, host_addr) = (p[1], p[2]);
                match cmd {
                    CONNECT_REQ => Self::ConnectRequest { fw_addr, host_addr },
                    DISCONNECT_REQ => Self::DisconnectRequest { fw_addr, host_addr },
                    _ => Self::ResetRequest { fw_addr, host_addr },
                }
            }
            CONNECT_RESP | DISCONNECT_RESP | RESET_RESP => {
                exact(4)?;
                let (fw_addr, host_addr, status) = (p[1], p[2], p[3]);
                match cmd {
                    CONNECT_RESP => Self::ConnectResponse {
                        fw_addr,
                        host_addr,
                        status,
                    },
                    DISCONNECT_RESP => Self::DisconnectResponse {
                        fw_addr,
                        host_addr,
                        status,
                    },
                    _ => Self::ResetResponse {
                        fw_addr,
                        host_addr,
                        status,
                    },
                }
            }
            FLOW_CONTROL => {
                exact(8)?;
                Self::FlowControl {
                    fw_addr: p[1],
                    host_addr: p[2],
                    packets: p[3],
                }
            }
            ADD_CLIENT_REQ => {
                exact(4 + PROPERTIES_SIZE)?;
                Self::AddClientRequest {
                    client_addr: p[1],
                    properties: ClientProperties::read(&p[4..]),
                }
            }
            ADD_CLIENT_RESP => {
                exact(4)?;
                Self::AddClientResponse {
                    client_addr: p[1],
                    status: p[2],
                }
            }
            DMA_ALLOC_NOTIFY_REQ => {
                // Only the first donated buffer is used.
                at_least(4 + XFER_ENTRY_SIZE)?;
                Self::DmaAllocNotify {
                    buf_addr: le_u64(p, 4),
                    buf_size: le_u32(p, 12),
                }
            }
            DMA_ALLOC_RESP => {
                exact(4)?;
                Self::DmaAllocResponse { status: p[1] }
            }
            DMA_XFER_REQ => {
                exact(4 + XFER_ENTRY_SIZE)?;
                Self::DmaXferRequest {
                    fw_addr: p[1],
                    host_addr: p[2],
                    entry: XferEntry {
                        host_addr: le_u64(p, 4),
                        len: le_u32(p, 12),
                    },
                }
            }
            DMA_XFER_ACK => {
                at_least(4)?;
                let mut entries = Vec::new();
                // Trailing bytes short of a full entry are ignored.
                for chunk in p[4..].chunks_exact(XFER_ENTRY_SIZE) {
                    let entry = XferEntry {
                        host_addr: le_u64(chunk, 0),
                        len: le_u32(chunk, 8),
                    };
                    if entries.push(entry).is_err() {
                        break;
                    }
                }
                Self::DmaXferAck { entries }
            }
            other => return Err(WireError::UnknownCommand(other)),
        };
        Ok(msg)
    }
}

/// Set `address` in an enumeration bitmap.
pub fn set_address_bit(bitmap: &mut [u8; ADDRESS_BITMAP_SIZE], address: u8) {
    bitmap[usize::from(address / 8)] |= 1 << (address % 8);
}

/// Test `address` in an enumeration bitmap.
pub fn address_bit(bitmap: &[u8; ADDRESS_BITMAP_SIZE], address: u8) -> bool {
    bitmap[usize::from(address / 8)] & (1 << (address % 8)) != 0
}

// ── Internal ─────────────────────────────────────────────────

struct Writer {
    buf: BusPayload,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    // Every layout fits in MAX_PAYLOAD_SIZE, so pushes cannot overflow.
    fn put_u8(&mut self, v: u8) {
        let _ = self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.put_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.put_slice(&v.to_le_bytes());
    }

    fn put_slice(&mut self, s: &[u8]) {
        let _ = self.buf.extend_from_slice(s);
    }

    fn finish(self) -> BusPayload {
        self.buf
    }
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le_u64(b: &[u8], at: usize) -> u64 {
    u64::from(le_u32(b, at)) | u64::from(le_u32(b, at + 4)) << 32
}

// ── Tests ────────────────────────────────────────────────────

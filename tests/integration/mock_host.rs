//! Mock host side for integration tests.
//!
//! Records every packet the driver writes, and provides a loopback copy
//! engine backed by a fake host memory window, so tests can assert on
//! the full wire history without doorbell or DMA registers.

use std::sync::{Arc, Mutex};

use futures_lite::future::block_on;
use pse_host::config::HeciConfig;
use pse_host::error::{DmaError, TransportError};
use pse_host::heci::wire::{BusMessage, DRIVER_ADDRESS, PacketHeader, decode_packet, encode_packet};
use pse_host::heci::{
    ClientDescriptor, ClientHandle, ConnectionId, DmaCompletion, DmaEngine, Guid, Heci, HeciEvent,
    MessageKind, RxMessage, Transfer, Transport,
};

pub const HOST_ADDR: u8 = 1;

pub const WINDOW_BASE: u64 = 0x8000_0000;
pub const PAGE_SIZE: u32 = 4096;

pub const GUID_A: Guid = Guid::new(
    0x8e6a_6715,
    0x9abc,
    0x4043,
    [0x88, 0xef, 0x9e, 0x39, 0xc6, 0xf6, 0x3e, 0x0f],
);
pub const GUID_B: Guid = Guid::new(
    0x3c4a_4d3b,
    0x1a2b,
    0x4c5d,
    [0x9e, 0x8f, 0x70, 0x61, 0x52, 0x43, 0x34, 0x25],
);

// ── Transport ─────────────────────────────────────────────────

#[derive(Default)]
struct Wire {
    sent: Vec<Vec<u8>>,
    fail: bool,
}

/// Cloneable handle: one clone goes into the driver, the test keeps one.
#[derive(Clone, Default)]
pub struct MockTransport {
    wire: Arc<Mutex<Wire>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.wire.lock().unwrap().fail = fail;
    }

    /// Drain every packet written so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.wire.lock().unwrap().sent)
    }

    /// Drain and decode bus-management messages; client packets are dropped.
    pub fn take_bus(&self) -> Vec<BusMessage> {
        self.take()
            .iter()
            .filter_map(|raw| {
                let (hdr, payload) = decode_packet(raw).unwrap();
                (hdr.fw_addr == DRIVER_ADDRESS).then(|| BusMessage::decode(payload).unwrap())
            })
            .collect()
    }

    /// Drain client packets as (header, payload).
    pub fn take_client(&self) -> Vec<(PacketHeader, Vec<u8>)> {
        self.take()
            .iter()
            .filter_map(|raw| {
                let (hdr, payload) = decode_packet(raw).unwrap();
                (hdr.fw_addr != DRIVER_ADDRESS).then(|| (hdr, payload.to_vec()))
            })
            .collect()
    }
}

impl Transport for MockTransport {
    fn write_packet(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let mut wire = self.wire.lock().unwrap();
        if wire.fail {
            return Err(TransportError::Io);
        }
        wire.sent.push(packet.to_vec());
        Ok(())
    }
}

// ── DMA engine ────────────────────────────────────────────────

struct HostMemory {
    bytes: Vec<u8>,
    stalled: bool,
    faulty: bool,
    aborts: u32,
}

/// Copies synchronously into fake host memory starting at `WINDOW_BASE`.
#[derive(Clone)]
pub struct MockDma {
    mem: Arc<Mutex<HostMemory>>,
}

#[allow(dead_code)]
impl MockDma {
    pub fn new(pages: usize) -> Self {
        Self {
            mem: Arc::new(Mutex::new(HostMemory {
                bytes: vec![0; pages * PAGE_SIZE as usize],
                stalled: false,
                faulty: false,
                aborts: 0,
            })),
        }
    }

    /// Never raise the completion interrupt.
    pub fn stall(&self) {
        self.mem.lock().unwrap().stalled = true;
    }

    /// Refuse every transfer with an engine fault.
    pub fn fail(&self) {
        self.mem.lock().unwrap().faulty = true;
    }

    pub fn aborts(&self) -> u32 {
        self.mem.lock().unwrap().aborts
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let at = (addr - WINDOW_BASE) as usize;
        self.mem.lock().unwrap().bytes[at..at + len].to_vec()
    }
}

impl DmaEngine for MockDma {
    fn start_transfer(&mut self, xfer: Transfer<'_>, done: &DmaCompletion) -> Result<(), DmaError> {
        let mut mem = self.mem.lock().unwrap();
        if mem.faulty {
            return Err(DmaError::EngineFault);
        }
        let at = (xfer.dst - WINDOW_BASE) as usize;
        mem.bytes[at..at + xfer.src.len()].copy_from_slice(xfer.src);
        if !mem.stalled {
            done.signal();
        }
        Ok(())
    }

    fn abort_transfer(&mut self) {
        self.mem.lock().unwrap().aborts += 1;
    }
}

// ── Driver fixtures ───────────────────────────────────────────

/// Short waits so timeout paths stay fast.
pub fn test_config() -> HeciConfig {
    HeciConfig {
        flow_control_timeout_ms: 100,
        dma_timeout_ms: 50,
        ..HeciConfig::default()
    }
}

pub fn driver() -> (Heci<MockTransport>, MockTransport) {
    let wire = MockTransport::new();
    let heci = Heci::new(wire.clone(), test_config()).unwrap();
    (heci, wire)
}

#[allow(dead_code)]
pub fn driver_with_dma(pages: usize) -> (Heci<MockTransport, MockDma>, MockTransport, MockDma) {
    let wire = MockTransport::new();
    let dma = MockDma::new(pages);
    let heci = Heci::with_dma(wire.clone(), dma.clone(), test_config()).unwrap();
    (heci, wire, dma)
}

pub fn descriptor(protocol_id: Guid) -> ClientDescriptor {
    ClientDescriptor {
        protocol_id,
        max_msg_size: 4096,
        protocol_ver: 1,
        max_n_of_connections: 1,
        dma_header_length: 0,
        dma_enabled: false,
        rx_buffer_len: 4096,
    }
}

/// Register `desc`, enumerate, open one connection from `HOST_ADDR` and
/// consume its connect notice. The wire is left empty.
pub fn open_connection_with<E: DmaEngine>(
    heci: &Heci<MockTransport, E>,
    wire: &MockTransport,
    desc: ClientDescriptor,
) -> (ClientHandle, ConnectionId) {
    let client = heci.register(desc).unwrap();
    deliver(heci, &BusMessage::EnumRequest { notify_new_clients: false });
    deliver(
        heci,
        &BusMessage::ConnectRequest {
            fw_addr: client.address(),
            host_addr: HOST_ADDR,
        },
    );
    let Some(HeciEvent::NewMessage(RxMessage {
        kind: MessageKind::Connect,
        connection,
        ..
    })) = heci.try_next_event(client)
    else {
        panic!("no connect event");
    };
    heci.send_flow_control(connection).unwrap();
    wire.take();
    (client, connection)
}

/// Host grants `packets` credits on the connection at `fw_addr`.
#[allow(dead_code)]
pub fn grant<E: DmaEngine>(heci: &Heci<MockTransport, E>, fw_addr: u8, packets: u8) {
    deliver(
        heci,
        &BusMessage::FlowControl {
            fw_addr,
            host_addr: HOST_ADDR,
            packets,
        },
    );
}

// ── Host-side packet helpers ──────────────────────────────────

pub fn bus_packet(msg: &BusMessage) -> Vec<u8> {
    encode_packet(DRIVER_ADDRESS, DRIVER_ADDRESS, true, &msg.encode())
        .unwrap()
        .to_vec()
}

pub fn client_packet(fw_addr: u8, host_addr: u8, last: bool, payload: &[u8]) -> Vec<u8> {
    encode_packet(fw_addr, host_addr, last, payload).unwrap().to_vec()
}

/// Feed one host bus message through the dispatcher path.
pub fn deliver<T: Transport, E: DmaEngine>(heci: &Heci<T, E>, msg: &BusMessage) {
    block_on(heci.process_packet(&bus_packet(msg)));
}

pub fn deliver_raw<T: Transport, E: DmaEngine>(heci: &Heci<T, E>, raw: &[u8]) {
    block_on(heci.process_packet(raw));
}

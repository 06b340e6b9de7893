//! HECI (Host Embedded Controller Interface) driver.
//!
//! Multiplexes connection-oriented client traffic over a fixed-size
//! packet transport to the host, with per-connection flow control and an
//! optional DMA fast path for large messages.
//!
//! ```text
//!   client threads                         host
//!        │  send / send_flow_control        ▲
//!        ▼                                  │ Transport::write_packet
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │ Heci                                                         │
//!  │  CreditGate[conn] ──▶ direct path (fragment) ────────────────┤
//!  │                    └─▶ DMA path (DmaOffload) ───────────────┤
//!  │  Registry (clients + connections)                            │
//!  │  EventChannel[client] ◀── dispatcher ◀── InboundChannel ◀────┤ on_packet
//!  └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock domains are independent: the registry, each credit gate, the DMA
//! window, the DMA engine and the transport writer. Nothing blocks while
//! holding the registry.

pub mod bus;
pub mod channels;
pub mod dispatch;
pub mod dma;
pub mod flow;
pub mod fragment;
pub mod registry;
pub mod transport;
pub mod wire;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::Duration;
use futures_lite::future::block_on;
use log::{debug, info, trace, warn};

use crate::config::HeciConfig;
use crate::error::{ConfigError, DmaError, HeciError, TransportError};

use channels::{EventChannel, InboundChannel, InboundPacket, post_event};
use flow::CreditGate;
use fragment::{Fragments, total_len};
use registry::{MAX_CLIENTS, MAX_CONNECTIONS, Registry, SendTarget};
use wire::{BusMessage, DRIVER_ADDRESS, MAX_MSG_SIZE, PACKET_SIZE, encode_packet};

pub use channels::{HeciEvent, MessageKind, RxMessage};
pub use dispatch::{Dispatcher, spawn_dispatcher};
pub use dma::{DmaCompletion, DmaEngine, NoDma, Transfer};
pub use registry::{ClientDescriptor, ClientHandle, ConnectionId};
pub use transport::{NullTransport, Transport};
pub use wire::Guid;

/// The driver instance shared by the dispatcher and all clients.
pub struct Heci<T, E = NoDma> {
    config: HeciConfig,
    registry: BlockingMutex<CriticalSectionRawMutex, RefCell<Registry>>,
    credits: [CreditGate; MAX_CONNECTIONS],
    events: [EventChannel; MAX_CLIENTS],
    inbound: InboundChannel,
    /// Held for a whole message so fragments of different messages never
    /// interleave on the wire.
    transport: Mutex<CriticalSectionRawMutex, T>,
    dma: dma::DmaOffload<E>,
}

impl<T: Transport> Heci<T, NoDma> {
    /// Driver without a DMA engine; every message takes the direct path.
    pub fn new(transport: T, config: HeciConfig) -> Result<Self, ConfigError> {
        Self::with_dma(transport, NoDma, config)
    }
}

impl<T: Transport, E: DmaEngine> Heci<T, E> {
    pub fn with_dma(transport: T, engine: E, config: HeciConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            "HECI: driver v{}.{} (dma {}, threshold {} B)",
            wire::DRIVER_MAJOR_VERSION,
            wire::DRIVER_MINOR_VERSION,
            if config.dma_enabled { "on" } else { "off" },
            config.dma_threshold
        );
        Ok(Self {
            dma: dma::DmaOffload::new(engine, config.dma_page_size, config.dma_timeout_ms),
            config,
            registry: BlockingMutex::new(RefCell::new(Registry::new())),
            credits: core::array::from_fn(|_| CreditGate::new()),
            events: core::array::from_fn(|_| EventChannel::new()),
            inbound: InboundChannel::new(),
            transport: Mutex::new(transport),
        })
    }

    pub fn config(&self) -> &HeciConfig {
        &self.config
    }

    fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        self.registry.lock(|r| f(&mut r.borrow_mut()))
    }

    /// Waits while the client's event queue is full.
    async fn post(&self, client: u8, event: HeciEvent) {
        post_event(&self.events[usize::from(client)], client, event).await;
    }

    // ── Client API ───────────────────────────────────────────

    /// Register a client. If the host asked to hear about new clients,
    /// it is announced with ADD_CLIENT_REQ and stays inactive until the
    /// host acknowledges it.
    pub fn register(&self, desc: ClientDescriptor) -> Result<ClientHandle, HeciError> {
        let (handle, announce) = self.with_registry(|r| r.register(desc))?;
        if let Some(properties) = announce {
            let req = BusMessage::AddClientRequest {
                client_addr: handle.address(),
                properties,
            };
            if let Err(e) = block_on(self.write_bus_message(&req)) {
                warn!("HECI: announcing client {} failed: {}", handle.address(), e);
            }
        }
        Ok(handle)
    }

    /// Send one logical message made of `segments` on `conn`.
    ///
    /// Waits up to `flow_control_timeout_ms` for a host credit. At most
    /// [`flow::MAX_PARKED`] senders should wait on one connection at a
    /// time; more still work but wake each other until a credit arrives.
    /// Large messages from DMA-enabled clients go through the DMA window
    /// when one is installed and has room; otherwise they are fragmented.
    pub async fn send(&self, conn: ConnectionId, segments: &[&[u8]]) -> Result<(), HeciError> {
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(HeciError::InvalidParam);
        }
        let total = total_len(segments);
        if total > MAX_MSG_SIZE {
            return Err(HeciError::Oversize);
        }
        let target = self.with_registry(|r| r.send_target(conn))?;
        if total > target.limit {
            warn!("HECI: conn {} message of {} B over {} B", conn, total, target.limit);
            return Err(HeciError::Oversize);
        }

        let gate = &self.credits[usize::from(conn)];
        let timeout = Duration::from_millis(u64::from(self.config.flow_control_timeout_ms));
        if let Err(e) = gate.acquire(timeout).await {
            warn!("HECI: conn {} no flow control credit", conn);
            return Err(e);
        }

        // The slot may have been torn down or reused while we waited. A
        // torn-down slot has its gate reset, so the credit is not returned.
        let revalidated = self
            .with_registry(|r| r.send_target(conn))
            .ok()
            .filter(|t| t.fw_addr == target.fw_addr && t.host_addr == target.host_addr);
        let Some(target) = revalidated else {
            warn!("HECI: conn {} closed while waiting for credit", conn);
            return Err(HeciError::BadConnection);
        };

        let result = if self.wants_dma(&target, total) {
            self.send_dma(&target, segments, total).await
        } else {
            self.send_direct(&target, segments).await
        };
        if let Err(e) = result {
            warn!("HECI: conn {} send failed: {}", conn, e);
            gate.restore();
        }
        result
    }

    /// Blocking wrapper around [`send`](Self::send) for client threads.
    pub fn send_blocking(&self, conn: ConnectionId, segments: &[&[u8]]) -> Result<(), HeciError> {
        block_on(self.send(conn, segments))
    }

    /// Return the receive buffer held by `conn` and grant the host one
    /// packet of credit.
    pub fn send_flow_control(&self, conn: ConnectionId) -> Result<(), HeciError> {
        let (fw_addr, host_addr) = self.with_registry(|r| r.release_rx(conn))?;
        debug!("HECI: flow control to conn {} ({}<->{})", conn, host_addr, fw_addr);
        block_on(self.write_bus_message(&BusMessage::FlowControl {
            fw_addr,
            host_addr,
            packets: 1,
        }))
    }

    /// Finish tearing down a connection after its Disconnect event.
    pub fn complete_disconnect(&self, conn: ConnectionId) -> Result<(), HeciError> {
        let pending = self.with_registry(|r| r.complete_disconnect(conn))?;
        self.credits[usize::from(conn)].reset();
        if let Some(p) = pending {
            let resp = BusMessage::DisconnectResponse {
                fw_addr: p.fw_addr,
                host_addr: p.host_addr,
                status: wire::ConnectStatus::Success as u8,
            };
            if let Err(e) = block_on(self.write_bus_message(&resp)) {
                warn!("HECI: disconnect response for conn {} failed: {}", conn, e);
            }
        }
        Ok(())
    }

    /// Wait for the next event addressed to `client`.
    pub async fn next_event(&self, client: ClientHandle) -> HeciEvent {
        self.events[client.index()].receive().await
    }

    pub fn next_event_blocking(&self, client: ClientHandle) -> HeciEvent {
        block_on(self.next_event(client))
    }

    pub fn try_next_event(&self, client: ClientHandle) -> Option<HeciEvent> {
        self.events[client.index()].try_receive().ok()
    }

    // ── Platform API ─────────────────────────────────────────

    /// Receive-interrupt entry point: queue a raw packet for the
    /// dispatcher. Never blocks.
    pub fn on_packet(&self, raw: &[u8]) -> Result<(), HeciError> {
        let packet = InboundPacket::from_slice(raw).map_err(|()| {
            warn!("HECI: inbound packet of {} B over {}", raw.len(), PACKET_SIZE);
            HeciError::Transport(TransportError::TooLong)
        })?;
        self.inbound.try_send(packet).map_err(|_| {
            warn!("HECI: inbound queue full, dropping packet");
            HeciError::QueueFull
        })
    }

    /// Host is entering a sleep state: drop every connection. Blocks
    /// while a client's event queue is full.
    pub fn host_sx_entry(&self) {
        info!("HECI: host Sx entry, resetting connections");
        block_on(self.reset_connections());
    }

    /// DMA completion interrupt entry point.
    pub fn on_dma_interrupt(&self) {
        self.dma.on_interrupt();
    }

    /// Dispatcher body: drain the inbound queue forever.
    pub async fn run_dispatch(&self) {
        loop {
            let packet = self.inbound.receive().await;
            self.process_packet(&packet).await;
        }
    }

    /// Credits currently held by `conn`.
    pub fn credits(&self, conn: ConnectionId) -> u32 {
        self.credits
            .get(usize::from(conn))
            .map_or(0, CreditGate::available)
    }

    /// DMA window pages currently reserved or awaiting a transfer ack.
    pub fn dma_pages_in_use(&self) -> usize {
        self.dma.used_pages()
    }

    // ── Outbound paths ───────────────────────────────────────

    fn wants_dma(&self, target: &SendTarget, total: usize) -> bool {
        E::PRESENT
            && self.config.dma_enabled
            && target.dma_enabled
            && total > self.config.dma_threshold as usize
            && self.dma.is_ready()
    }

    /// Fragment the message onto the transport, holding the writer for
    /// the whole message.
    async fn send_direct(&self, target: &SendTarget, segments: &[&[u8]]) -> Result<(), HeciError> {
        let mut transport = self.transport.lock().await;
        for frag in Fragments::new(segments) {
            let packet = encode_packet(target.fw_addr, target.host_addr, frag.last, &frag.payload)
                .ok_or(TransportError::TooLong)?;
            trace!("HECI tx: {:02x?}", packet.as_slice());
            transport.write_packet(&packet)?;
        }
        Ok(())
    }

    /// Copy the message into one run of window pages and announce it with
    /// a single DMA_XFER_REQ. Falls back to the direct path when no pages
    /// are free or the engine faults.
    async fn send_dma(&self, target: &SendTarget, segments: &[&[u8]], total: usize) -> Result<(), HeciError> {
        let res = match self.dma.reserve(total) {
            Ok(res) => res,
            Err(e) => {
                debug!("HECI[dma]: {}, using direct path", e);
                return self.send_direct(target, segments).await;
            }
        };

        let mut dst = res.host_addr;
        for &segment in segments {
            if let Err(e) = self.dma.copy(Transfer { src: segment, dst }).await {
                self.dma.release(res);
                if e == DmaError::EngineFault {
                    warn!("HECI[dma]: engine fault, using direct path");
                    return self.send_direct(target, segments).await;
                }
                return Err(e.into());
            }
            dst += segment.len() as u64;
        }

        // Live before the request goes out, so an early ack finds it.
        self.dma.commit(res);
        let req = BusMessage::DmaXferRequest {
            fw_addr: target.fw_addr,
            host_addr: target.host_addr,
            entry: res.entry(),
        };
        if let Err(e) = self.write_bus_message(&req).await {
            self.dma.ack(&[res.entry()]);
            return Err(e);
        }
        debug!(
            "HECI[dma]: {} B to {:#x} for {}<->{}",
            total, res.host_addr, target.host_addr, target.fw_addr
        );
        Ok(())
    }

    async fn write_bus_message(&self, msg: &BusMessage) -> Result<(), HeciError> {
        let payload = msg.encode();
        let packet =
            encode_packet(DRIVER_ADDRESS, DRIVER_ADDRESS, true, &payload).ok_or(TransportError::TooLong)?;
        trace!("HECI tx: {:02x?}", packet.as_slice());
        self.transport.lock().await.write_packet(&packet)?;
        Ok(())
    }

    /// Force every live connection into Disconnecting and tell the
    /// owning clients.
    async fn reset_connections(&self) {
        let notify = self.with_registry(Registry::reset_all);
        for (connection, client) in notify {
            self.post(client, HeciEvent::Disconnect { connection }).await;
        }
    }
}

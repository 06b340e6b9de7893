//! Inbound packet processing: bus-management handlers and client
//! traffic routing.
//!
//! Every handler follows the same shape: take the registry lock, let the
//! registry decide, drop the lock, then push events and write the reply.
//! Malformed messages are logged and dropped without touching state.

use log::{debug, info, trace, warn};

use super::channels::{HeciEvent, MessageKind, RxMessage};
use super::dma::DmaEngine;
use super::registry::{DisconnectOutcome, RxOutcome, StateMask};
use super::transport::Transport;
use super::wire::{
    BusMessage, ConnectStatus, DRIVER_ADDRESS, DRIVER_MAJOR_VERSION, DRIVER_MINOR_VERSION,
    FW_STATE_ADDRESS, PacketHeader, SYSTEM_STATE_ADDRESS, decode_packet,
};
use super::Heci;

/// DMA_ALLOC_RESP status for a rejected window.
const DMA_ALLOC_FAILED: u8 = 1;

impl<T: Transport, E: DmaEngine> Heci<T, E> {
    /// Handle one raw inbound packet (dispatcher context).
    pub async fn process_packet(&self, raw: &[u8]) {
        let (header, payload) = match decode_packet(raw) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("HECI: invalid packet: {}", e);
                return;
            }
        };
        trace!("HECI rx: {:02x?}", raw);

        match header.fw_addr {
            DRIVER_ADDRESS => self.process_bus_message(payload).await,
            SYSTEM_STATE_ADDRESS => debug!("HECI: system state message ignored"),
            FW_STATE_ADDRESS => debug!("HECI: fw state message ignored"),
            _ => self.process_client_packet(header, payload).await,
        }
    }

    async fn process_bus_message(&self, payload: &[u8]) {
        let msg = match BusMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("HECI[bus]: {}", e);
                return;
            }
        };

        let reply = match msg {
            BusMessage::VersionRequest { major, minor } => Some(BusMessage::VersionResponse {
                supported: major == DRIVER_MAJOR_VERSION && minor == DRIVER_MINOR_VERSION,
                major: DRIVER_MAJOR_VERSION,
                minor: DRIVER_MINOR_VERSION,
            }),
            BusMessage::HostStopRequest => {
                info!("HECI[bus]: host stop");
                self.reset_connections().await;
                Some(BusMessage::HostStopResponse)
            }
            BusMessage::EnumRequest { notify_new_clients } => Some(BusMessage::EnumResponse {
                valid_addresses: self.with_registry(|r| r.enumerate(notify_new_clients)),
            }),
            BusMessage::ClientPropRequest { address } => Some(self.client_properties(address)),
            BusMessage::ConnectRequest { fw_addr, host_addr } => {
                Some(self.connect(fw_addr, host_addr).await)
            }
            BusMessage::DisconnectRequest { fw_addr, host_addr } => {
                self.disconnect(fw_addr, host_addr).await
            }
            BusMessage::DisconnectResponse {
                fw_addr,
                host_addr,
                status,
            } => {
                debug!(
                    "HECI[bus]: host acked disconnect {}<->{} ({})",
                    host_addr, fw_addr, status
                );
                None
            }
            BusMessage::FlowControl {
                fw_addr,
                host_addr,
                packets,
            } => {
                self.flow_control(fw_addr, host_addr, packets);
                None
            }
            BusMessage::ResetRequest { fw_addr, host_addr } => self.reset(fw_addr, host_addr),
            BusMessage::AddClientResponse {
                client_addr,
                status,
            } => {
                self.add_client_response(client_addr, status);
                None
            }
            BusMessage::DmaAllocNotify { buf_addr, buf_size } => {
                let status = match self.dma.install_window(buf_addr, buf_size) {
                    Ok(_) => ConnectStatus::Success as u8,
                    Err(_) => DMA_ALLOC_FAILED,
                };
                Some(BusMessage::DmaAllocResponse { status })
            }
            BusMessage::DmaXferRequest { .. } => {
                warn!("HECI[bus]: no DMA support for host->fw transfers");
                None
            }
            BusMessage::DmaXferAck { entries } => {
                let freed = self.dma.ack(&entries);
                debug!("HECI[dma]: ack freed {}/{} transfers", freed, entries.len());
                None
            }
            other => {
                debug!("HECI[bus]: ignoring command {:#04x}", other.command());
                None
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = self.write_bus_message(&reply).await {
                warn!("HECI[bus]: reply {:#04x} failed: {}", reply.command(), e);
            }
        }
    }

    fn client_properties(&self, address: u8) -> BusMessage {
        match self.with_registry(|r| r.client_properties(address)) {
            Some(properties) => BusMessage::ClientPropResponse {
                address,
                status: ConnectStatus::Success as u8,
                properties: Some(properties),
            },
            None => BusMessage::ClientPropResponse {
                address,
                status: ConnectStatus::ClientNotFound as u8,
                properties: None,
            },
        }
    }

    async fn connect(&self, fw_addr: u8, host_addr: u8) -> BusMessage {
        let status = match self.with_registry(|r| r.connect(fw_addr, host_addr)) {
            Ok((connection, client)) => {
                self.credits[usize::from(connection)].reset();
                self.post(
                    client,
                    HeciEvent::NewMessage(RxMessage {
                        kind: MessageKind::Connect,
                        connection,
                        data: alloc::vec::Vec::new(),
                    }),
                )
                .await;
                info!("HECI[bus]: conn {} ({}<->{}) open", connection, host_addr, fw_addr);
                ConnectStatus::Success
            }
            Err(status) => status,
        };
        BusMessage::ConnectResponse {
            fw_addr,
            host_addr,
            status: status as u8,
        }
    }

    async fn disconnect(&self, fw_addr: u8, host_addr: u8) -> Option<BusMessage> {
        match self.with_registry(|r| r.disconnect_request(fw_addr, host_addr)) {
            DisconnectOutcome::NotFound => Some(BusMessage::DisconnectResponse {
                fw_addr,
                host_addr,
                status: ConnectStatus::ClientNotFound as u8,
            }),
            DisconnectOutcome::Started {
                id,
                client,
                notify,
            } => {
                debug!("HECI[bus]: host disconnects conn {}", id);
                if notify {
                    self.post(client, HeciEvent::Disconnect { connection: id }).await;
                }
                // Reply deferred to complete_disconnect.
                None
            }
        }
    }

    fn flow_control(&self, fw_addr: u8, host_addr: u8, packets: u8) {
        match self.with_registry(|r| r.find_connection(fw_addr, host_addr, StateMask::ACTIVE)) {
            Some(id) => {
                let woken = self.credits[usize::from(id)].grant(packets);
                trace!("HECI[bus]: conn {} +{} credit, {} woken", id, packets.max(1), woken);
            }
            None => warn!("HECI[bus]: flow control for unknown {}<->{}", host_addr, fw_addr),
        }
    }

    fn reset(&self, fw_addr: u8, host_addr: u8) -> Option<BusMessage> {
        // Unknown pairs are ignored.
        let id = self.with_registry(|r| r.reset_target(fw_addr, host_addr))?;
        self.credits[usize::from(id)].reset();
        Some(BusMessage::ResetResponse {
            fw_addr,
            host_addr,
            status: ConnectStatus::Success as u8,
        })
    }

    fn add_client_response(&self, client_addr: u8, status: u8) {
        if status != ConnectStatus::Success as u8 {
            warn!("HECI[bus]: host refused client {} ({})", client_addr, status);
            return;
        }
        if self.with_registry(|r| r.activate(client_addr)) {
            debug!("HECI[bus]: client {} active", client_addr);
        } else {
            debug!("HECI[bus]: add-client ack for unknown {}", client_addr);
        }
    }

    async fn process_client_packet(&self, header: PacketHeader, payload: &[u8]) {
        let (fw_addr, host_addr) = (header.fw_addr, header.host_addr);
        let outcome =
            self.with_registry(|r| r.receive_fragment(fw_addr, host_addr, payload, header.last_frag));

        match outcome {
            RxOutcome::NoConnection => {
                warn!("HECI: no connection for {}<->{}", host_addr, fw_addr);
            }
            RxOutcome::BufferBusy => {
                warn!("HECI[{}]: rx buffer locked, dropping packet", fw_addr);
            }
            RxOutcome::Partial => {}
            RxOutcome::Complete { id, client, data } => {
                debug!("HECI: conn {} message of {} B", id, data.len());
                self.post(
                    client,
                    HeciEvent::NewMessage(RxMessage {
                        kind: MessageKind::Request,
                        connection: id,
                        data,
                    }),
                )
                .await;
            }
            RxOutcome::Overflow { id, client } => {
                let req = BusMessage::DisconnectRequest { fw_addr, host_addr };
                if let Err(e) = self.write_bus_message(&req).await {
                    warn!("HECI: disconnect request for conn {} failed: {}", id, e);
                }
                self.post(client, HeciEvent::Disconnect { connection: id }).await;
            }
        }
    }
}

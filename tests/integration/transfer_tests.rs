//! Integration tests for outbound traffic: credit gating, fragmentation,
//! the DMA fast path and the dispatcher thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::mock_host::*;

use pse_host::error::{HeciError, TransportError};
use pse_host::heci::wire::{BusMessage, FIRST_CLIENT_ADDRESS, XferEntry};
use pse_host::heci::{ClientDescriptor, HeciEvent, MessageKind, RxMessage, spawn_dispatcher};

const FW_A: u8 = FIRST_CLIENT_ADDRESS;

fn dma_descriptor() -> ClientDescriptor {
    ClientDescriptor {
        dma_enabled: true,
        ..descriptor(GUID_A)
    }
}

fn install_window<E: pse_host::heci::DmaEngine>(
    heci: &pse_host::heci::Heci<MockTransport, E>,
    wire: &MockTransport,
    pages: u32,
) {
    deliver(
        heci,
        &BusMessage::DmaAllocNotify {
            buf_addr: WINDOW_BASE,
            buf_size: pages * PAGE_SIZE,
        },
    );
    assert_eq!(wire.take_bus(), vec![BusMessage::DmaAllocResponse { status: 0 }]);
}

// ── Credits ──────────────────────────────────────────────────

#[test]
fn sends_consume_credits_then_time_out() {
    let (heci, wire) = driver();
    let (_client, conn) = open_connection_with(&heci, &wire, descriptor(GUID_A));

    grant(&heci, FW_A, 3);
    for i in 0..3u8 {
        heci.send_blocking(conn, &[&[i]]).unwrap();
    }
    assert_eq!(wire.take_client().len(), 3);

    let started = Instant::now();
    assert_eq!(heci.send_blocking(conn, &[b"one too many"]), Err(HeciError::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(wire.take().is_empty());
}

#[test]
fn zero_packet_grant_counts_as_one() {
    let (heci, wire) = driver();
    let (_client, conn) = open_connection_with(&heci, &wire, descriptor(GUID_A));
    grant(&heci, FW_A, 0);
    assert_eq!(heci.credits(conn), 1);
}

#[test]
fn blocked_sender_released_by_grant() {
    let (heci, wire) = driver();
    let mut desc = descriptor(GUID_A);
    desc.max_msg_size = 1024;
    let (_client, conn) = open_connection_with(&heci, &wire, desc);

    let heci = Arc::new(heci);
    let sender = {
        let heci = heci.clone();
        std::thread::spawn(move || heci.send_blocking(conn, &[b"waiting"]))
    };

    std::thread::sleep(Duration::from_millis(20));
    assert!(wire.take().is_empty(), "nothing sent without credit");
    grant(&heci, FW_A, 1);

    assert_eq!(sender.join().unwrap(), Ok(()));
    let sent = wire.take_client();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, b"waiting");
}

#[test]
fn concurrent_senders_without_credit_all_time_out() {
    let (heci, wire) = driver();
    let (_client, conn) = open_connection_with(&heci, &wire, descriptor(GUID_A));

    let results: Vec<_> = std::thread::scope(|s| {
        let senders: Vec<_> = (0..2u8)
            .map(|i| {
                let heci = &heci;
                s.spawn(move || heci.send_blocking(conn, &[&[i; 8]]))
            })
            .collect();
        senders.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results, vec![Err(HeciError::Timeout), Err(HeciError::Timeout)]);
    assert_eq!(heci.credits(conn), 0);
    assert!(wire.take().is_empty());
}

#[test]
fn invalid_sends_keep_credit() {
    let (heci, wire) = driver();
    let mut desc = descriptor(GUID_A);
    desc.max_msg_size = 256;
    let (_client, conn) = open_connection_with(&heci, &wire, desc);
    grant(&heci, FW_A, 1);

    assert_eq!(heci.send_blocking(conn, &[]), Err(HeciError::InvalidParam));
    assert_eq!(heci.send_blocking(conn, &[b"a", b""]), Err(HeciError::InvalidParam));
    assert_eq!(heci.send_blocking(conn, &[&[0u8; 257]]), Err(HeciError::Oversize));
    assert_eq!(heci.send_blocking(conn, &[&[0u8; 4097]]), Err(HeciError::Oversize));
    assert_eq!(heci.send_blocking(conn + 1, &[b"x"]), Err(HeciError::BadConnection));

    assert_eq!(heci.credits(conn), 1);
    assert!(wire.take().is_empty());
}

#[test]
fn transport_failure_restores_credit() {
    let (heci, wire) = driver();
    let (_client, conn) = open_connection_with(&heci, &wire, descriptor(GUID_A));
    grant(&heci, FW_A, 1);

    wire.set_fail(true);
    assert_eq!(
        heci.send_blocking(conn, &[b"lost"]),
        Err(HeciError::Transport(TransportError::Io))
    );
    assert_eq!(heci.credits(conn), 1);

    wire.set_fail(false);
    heci.send_blocking(conn, &[b"retry"]).unwrap();
    assert_eq!(heci.credits(conn), 0);
}

// ── Fragmentation ────────────────────────────────────────────

#[test]
fn message_fragmented_across_packets() {
    let (heci, wire) = driver();
    let (_client, conn) = open_connection_with(&heci, &wire, descriptor(GUID_A));
    grant(&heci, FW_A, 1);

    let head = [0x11u8; 100];
    let body: Vec<u8> = (0..200).map(|i| i as u8).collect();
    heci.send_blocking(conn, &[&head, &body]).unwrap();

    let sent = wire.take_client();
    let sizes: Vec<usize> = sent.iter().map(|(_, p)| p.len()).collect();
    assert_eq!(sizes, vec![124, 124, 52]);
    let last: Vec<bool> = sent.iter().map(|(h, _)| h.last_frag).collect();
    assert_eq!(last, vec![false, false, true]);
    assert!(sent.iter().all(|(h, _)| h.fw_addr == FW_A && h.host_addr == HOST_ADDR));

    let joined: Vec<u8> = sent.into_iter().flat_map(|(_, p)| p).collect();
    assert_eq!(&joined[..100], &head);
    assert_eq!(&joined[100..], body.as_slice());
}

// ── DMA ──────────────────────────────────────────────────────

#[test]
fn large_message_goes_through_window() {
    let (heci, wire, dma) = driver_with_dma(4);
    let (_client, conn) = open_connection_with(&heci, &wire, dma_descriptor());
    install_window(&heci, &wire, 4);
    grant(&heci, FW_A, 2);

    let header = [0xA5u8; 1000];
    let body = [0x5Au8; 2000];
    heci.send_blocking(conn, &[&header, &body]).unwrap();

    let first = XferEntry {
        host_addr: WINDOW_BASE,
        len: 3000,
    };
    assert_eq!(
        wire.take_bus(),
        vec![BusMessage::DmaXferRequest {
            fw_addr: FW_A,
            host_addr: HOST_ADDR,
            entry: first,
        }]
    );
    assert_eq!(dma.read(WINDOW_BASE, 1000), header.to_vec());
    assert_eq!(dma.read(WINDOW_BASE + 1000, 2000), body.to_vec());
    assert_eq!(heci.dma_pages_in_use(), 1);

    // Second transfer lands on the next free page.
    heci.send_blocking(conn, &[&[0x77u8; 4000]]).unwrap();
    let second = XferEntry {
        host_addr: WINDOW_BASE + u64::from(PAGE_SIZE),
        len: 4000,
    };
    assert_eq!(
        wire.take_bus(),
        vec![BusMessage::DmaXferRequest {
            fw_addr: FW_A,
            host_addr: HOST_ADDR,
            entry: second,
        }]
    );
    assert_eq!(heci.dma_pages_in_use(), 2);

    let mut entries = heapless::Vec::new();
    entries.push(first).unwrap();
    entries.push(second).unwrap();
    deliver(&heci, &BusMessage::DmaXferAck { entries: entries.clone() });
    assert_eq!(heci.dma_pages_in_use(), 0);

    // Repeated ack frees nothing.
    deliver(&heci, &BusMessage::DmaXferAck { entries });
    assert_eq!(heci.dma_pages_in_use(), 0);
    assert!(wire.take().is_empty());
}

#[test]
fn threshold_sized_message_stays_direct() {
    let (heci, wire, _dma) = driver_with_dma(4);
    let (_client, conn) = open_connection_with(&heci, &wire, dma_descriptor());
    install_window(&heci, &wire, 4);
    grant(&heci, FW_A, 1);

    // At the threshold: not over it.
    heci.send_blocking(conn, &[&[1u8; 1024]]).unwrap();
    let sent = wire.take_client();
    assert_eq!(sent.len(), 1024usize.div_ceil(124));
    assert_eq!(heci.dma_pages_in_use(), 0);
}

#[test]
fn falls_back_to_direct_without_window() {
    let (heci, wire, _dma) = driver_with_dma(4);
    let (_client, conn) = open_connection_with(&heci, &wire, dma_descriptor());
    grant(&heci, FW_A, 1);

    heci.send_blocking(conn, &[&[2u8; 2000]]).unwrap();
    let sent = wire.take_client();
    assert_eq!(sent.len(), 2000usize.div_ceil(124));
    assert!(sent.last().unwrap().0.last_frag);
}

#[test]
fn falls_back_to_direct_when_window_full() {
    let (heci, wire, _dma) = driver_with_dma(1);
    let (_client, conn) = open_connection_with(&heci, &wire, dma_descriptor());
    install_window(&heci, &wire, 1);
    grant(&heci, FW_A, 2);

    heci.send_blocking(conn, &[&[3u8; 2000]]).unwrap();
    assert_eq!(wire.take_bus().len(), 1);
    assert_eq!(heci.dma_pages_in_use(), 1);

    heci.send_blocking(conn, &[&[4u8; 2000]]).unwrap();
    let sent = wire.take_client();
    assert_eq!(sent.len(), 2000usize.div_ceil(124));
    assert!(sent.iter().all(|(_, p)| p.iter().all(|&b| b == 4)));
}

#[test]
fn driver_without_engine_refuses_window() {
    let (heci, wire) = driver();
    let (_client, conn) = open_connection_with(&heci, &wire, dma_descriptor());
    deliver(
        &heci,
        &BusMessage::DmaAllocNotify {
            buf_addr: WINDOW_BASE,
            buf_size: 4 * PAGE_SIZE,
        },
    );
    assert_eq!(wire.take_bus(), vec![BusMessage::DmaAllocResponse { status: 1 }]);
    grant(&heci, FW_A, 1);

    heci.send_blocking(conn, &[&[7u8; 2000]]).unwrap();
    let sent = wire.take_client();
    assert_eq!(sent.len(), 2000usize.div_ceil(124));
    assert!(sent.iter().all(|(_, p)| p.iter().all(|&b| b == 7)));
    assert_eq!(heci.dma_pages_in_use(), 0);
}

#[test]
fn engine_fault_falls_back_to_direct() {
    let (heci, wire, dma) = driver_with_dma(2);
    let (_client, conn) = open_connection_with(&heci, &wire, dma_descriptor());
    install_window(&heci, &wire, 2);
    grant(&heci, FW_A, 1);

    dma.fail();
    heci.send_blocking(conn, &[&[8u8; 3000]]).unwrap();
    let sent = wire.take();
    assert_eq!(sent.len(), 3000usize.div_ceil(124));
    assert!(sent.iter().all(|raw| raw[0] == FW_A), "no transfer request announced");
    assert_eq!(heci.dma_pages_in_use(), 0);
    assert_eq!(heci.credits(conn), 0);
}

#[test]
fn stalled_copy_times_out_and_frees_pages() {
    let (heci, wire, dma) = driver_with_dma(2);
    let (_client, conn) = open_connection_with(&heci, &wire, dma_descriptor());
    install_window(&heci, &wire, 2);
    grant(&heci, FW_A, 1);

    dma.stall();
    assert_eq!(heci.send_blocking(conn, &[&[5u8; 3000]]), Err(HeciError::Timeout));
    assert_eq!(dma.aborts(), 1);
    assert_eq!(heci.dma_pages_in_use(), 0);
    assert_eq!(heci.credits(conn), 1);
    assert!(wire.take().is_empty());
}

#[test]
fn misaligned_window_rejected() {
    let (heci, wire, _dma) = driver_with_dma(2);
    deliver(
        &heci,
        &BusMessage::DmaAllocNotify {
            buf_addr: WINDOW_BASE + 1,
            buf_size: PAGE_SIZE,
        },
    );
    deliver(
        &heci,
        &BusMessage::DmaAllocNotify {
            buf_addr: WINDOW_BASE,
            buf_size: 0,
        },
    );
    assert_eq!(
        wire.take_bus(),
        vec![
            BusMessage::DmaAllocResponse { status: 1 },
            BusMessage::DmaAllocResponse { status: 1 },
        ]
    );
}

#[test]
fn failed_announcement_returns_pages() {
    let (heci, wire, _dma) = driver_with_dma(2);
    let (_client, conn) = open_connection_with(&heci, &wire, dma_descriptor());
    install_window(&heci, &wire, 2);
    grant(&heci, FW_A, 1);

    wire.set_fail(true);
    assert_eq!(
        heci.send_blocking(conn, &[&[6u8; 3000]]),
        Err(HeciError::Transport(TransportError::Io))
    );
    assert_eq!(heci.dma_pages_in_use(), 0);
    assert_eq!(heci.credits(conn), 1);
}

// ── Dispatcher ───────────────────────────────────────────────

#[test]
fn dispatcher_delivers_events_end_to_end() {
    let (heci, wire) = driver();
    let heci = Arc::new(heci);
    let client = heci.register(descriptor(GUID_A)).unwrap();
    let dispatcher = spawn_dispatcher(heci.clone()).unwrap();

    heci.on_packet(&bus_packet(&BusMessage::EnumRequest { notify_new_clients: false }))
        .unwrap();
    heci.on_packet(&bus_packet(&BusMessage::ConnectRequest {
        fw_addr: client.address(),
        host_addr: HOST_ADDR,
    }))
    .unwrap();

    let HeciEvent::NewMessage(RxMessage {
        kind: MessageKind::Connect,
        connection,
        ..
    }) = heci.next_event_blocking(client)
    else {
        panic!("expected connect");
    };
    heci.send_flow_control(connection).unwrap();

    heci.on_packet(&client_packet(client.address(), HOST_ADDR, true, b"ping"))
        .unwrap();
    assert_eq!(
        heci.next_event_blocking(client),
        HeciEvent::NewMessage(RxMessage {
            kind: MessageKind::Request,
            connection,
            data: b"ping".to_vec(),
        })
    );

    dispatcher.shutdown();

    // The connect reply and the client's grant race each other.
    let bus = wire.take_bus();
    assert_eq!(bus.len(), 3);
    assert!(matches!(bus[0], BusMessage::EnumResponse { .. }));
    assert!(bus.iter().any(|m| matches!(m, BusMessage::ConnectResponse { status: 0, .. })));
    assert!(bus.iter().any(|m| matches!(m, BusMessage::FlowControl { packets: 1, .. })));
}

#[test]
fn oversized_inbound_packet_refused() {
    let (heci, _wire) = driver();
    assert_eq!(
        heci.on_packet(&[0u8; 129]),
        Err(HeciError::Transport(TransportError::TooLong))
    );
}

//! Fuzz target: `Heci::process_packet`
//!
//! Feeds arbitrary packet sequences into a driver with one registered
//! client and a null transport. The driver must never panic, whatever
//! order or content the host sends.
//!
//! cargo fuzz run fuzz_bus_dispatch

#![no_main]

use futures_lite::future::block_on;
use libfuzzer_sys::fuzz_target;
use pse_host::config::HeciConfig;
use pse_host::heci::{ClientDescriptor, Guid, Heci, NullTransport};

fuzz_target!(|data: &[u8]| {
    let Ok(heci) = Heci::new(NullTransport, HeciConfig::default()) else {
        return;
    };
    let client = heci.register(ClientDescriptor {
        protocol_id: Guid::new(1, 2, 3, [4; 8]),
        max_msg_size: 512,
        protocol_ver: 1,
        max_n_of_connections: 2,
        dma_header_length: 0,
        dma_enabled: false,
        rx_buffer_len: 512,
    });

    // First byte of each chunk is its length.
    let mut rest = data;
    while let Some((&len, tail)) = rest.split_first() {
        let n = usize::from(len).min(tail.len());
        block_on(heci.process_packet(&tail[..n]));
        rest = &tail[n..];
        if let Ok(client) = client {
            while heci.try_next_event(client).is_some() {}
        }
    }
});

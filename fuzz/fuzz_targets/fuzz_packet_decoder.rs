//! Fuzz target: `decode_packet` and `BusMessage::decode`
//!
//! Drives arbitrary byte sequences through the packet and bus-message
//! decoders and asserts that they never panic and that an accepted
//! packet re-encodes to the same payload.
//!
//! cargo fuzz run fuzz_packet_decoder

#![no_main]

use libfuzzer_sys::fuzz_target;
use pse_host::heci::wire::{BusMessage, MAX_PAYLOAD_SIZE, decode_packet, encode_packet};

fuzz_target!(|data: &[u8]| {
    if let Ok((header, payload)) = decode_packet(data) {
        assert!(payload.len() <= MAX_PAYLOAD_SIZE, "payload exceeds one packet");
        let again = encode_packet(header.fw_addr, header.host_addr, header.last_frag, payload)
            .expect("accepted payload must re-encode");
        assert_eq!(&again[4..], payload);
    }

    if let Ok(msg) = BusMessage::decode(data) {
        let _ = msg.encode();
    }
});

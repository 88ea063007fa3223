//! Fuzz target for the streaming packet parser.
//!
//! The parser must reject or stall on every byte sequence without
//! panicking, no matter how the input is fragmented.

#![no_main]

use caravel::protocol::PacketParser;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = PacketParser::new();
    for chunk in data.chunks(7) {
        parser.extend(chunk);
        loop {
            match parser.parse() {
                Ok(Some(packet)) => {
                    let _ = packet.status();
                    let _ = packet.is_server_push();
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
        parser.maybe_trim();
    }
});

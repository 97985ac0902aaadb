#![no_main]

use flowstat::parse_v5_packet;
use libfuzzer_sys::fuzz_target;
use std::net::Ipv4Addr;

fuzz_target!(|data: &[u8]| {
    let _ = parse_v5_packet(data, Ipv4Addr::UNSPECIFIED);
});

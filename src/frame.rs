//! Template test frames
//!
//! Frames follow RFC 2544 appendix C.2.6.4, carried over Ethernet II with
//! UDP payloads. A template is built once with sentinel addresses
//! (`0.0.0.0`, `::`) and zeroed variable ports, so the sender can extend
//! the stored checksums by pure addition when it patches the variable
//! fields. The first eight payload bytes identify the frame kind on the
//! receive side.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::checksum::{finalize, raw_sum};
use crate::config::MacAddr;

/// Frame sizes on the command line include the FCS; buffers do not.
pub const ETHER_CRC_LEN: usize = 4;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// Identifies normal test frames and PDV frames.
pub const MAGIC_TEST: [u8; 8] = *b"IDENTIFY";
/// Identifies latency-tagged frames.
pub const MAGIC_LATENCY: [u8; 8] = *b"Identify";

/// Field offsets from the start of an Ethernet frame carrying IPv4.
pub mod ipv4_offsets {
    pub const ETHERTYPE: usize = 12;
    pub const PROTOCOL: usize = 23;
    pub const HDR_CHKSUM: usize = 24;
    pub const SRC_ADDR: usize = 26;
    pub const DST_ADDR: usize = 30;
    pub const UDP_SPORT: usize = 34;
    pub const UDP_DPORT: usize = 36;
    pub const UDP_CHKSUM: usize = 40;
    pub const UDP_DATA: usize = 42;
}

/// Field offsets from the start of an Ethernet frame carrying IPv6.
pub mod ipv6_offsets {
    pub const ETHERTYPE: usize = 12;
    pub const NEXT_HEADER: usize = 20;
    pub const SRC_ADDR: usize = 22;
    pub const DST_ADDR: usize = 38;
    pub const UDP_SPORT: usize = 54;
    pub const UDP_DPORT: usize = 56;
    pub const UDP_CHKSUM: usize = 60;
    pub const UDP_DATA: usize = 62;
}

/// Offsets of the mode-specific payload fields, relative to UDP data.
pub const PAYLOAD_ID_OFFSET: usize = 8;
pub const PAYLOAD_COUNTER_OFFSET: usize = 8;

/// What the UDP payload carries behind the magic marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPayload {
    /// Magic, then filler.
    Normal,
    /// Latency magic, a 16-bit tagged frame ID, then filler.
    Latency(u16),
    /// Magic, a zeroed slot for the 64-bit sequence counter, then filler.
    Pdv,
}

#[inline]
pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// The uncomplemented partial checksum stored at `offset`; the additive
/// starting point for the incremental per-frame update.
#[inline]
pub fn uncomplemented_checksum(buf: &[u8], offset: usize) -> u16 {
    !read_u16(buf, offset)
}

fn write_payload(data: &mut [u8], payload: TestPayload) {
    let filler_start = match payload {
        TestPayload::Normal => {
            data[..8].copy_from_slice(&MAGIC_TEST);
            8
        }
        TestPayload::Latency(id) => {
            data[..8].copy_from_slice(&MAGIC_LATENCY);
            data[8..10].copy_from_slice(&id.to_le_bytes());
            10
        }
        TestPayload::Pdv => {
            data[..8].copy_from_slice(&MAGIC_TEST);
            data[8..16].fill(0);
            16
        }
    };
    for (i, byte) in data[filler_start..].iter_mut().enumerate() {
        *byte = i as u8;
    }
}

fn write_eth_header(buf: &mut [u8], dst_mac: MacAddr, src_mac: MacAddr, ethertype: u16) {
    buf[..6].copy_from_slice(&dst_mac.0);
    buf[6..12].copy_from_slice(&src_mac.0);
    write_u16(buf, 12, ethertype);
}

/// Builds an IPv4 test frame. `frame_size` includes the FCS.
pub fn test_frame_ipv4(
    frame_size: u16,
    dst_mac: MacAddr,
    src_mac: MacAddr,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    payload: TestPayload,
) -> Vec<u8> {
    let len = usize::from(frame_size) - ETHER_CRC_LEN;
    let mut buf = vec![0u8; len];
    write_eth_header(&mut buf, dst_mac, src_mac, ETHERTYPE_IPV4);

    let ip_length = (len - 14) as u16;
    let udp_length = ip_length - 20;
    {
        let ip = &mut buf[14..34];
        ip[0] = 0x45; // version 4, IHL 5
        write_u16(ip, 2, ip_length);
        ip[8] = 0x0a; // TTL
        ip[9] = 0x11; // UDP
        ip[12..16].copy_from_slice(&src.octets());
        ip[16..20].copy_from_slice(&dst.octets());
    }
    write_u16(&mut buf, 38, udp_length);
    write_payload(&mut buf[ipv4_offsets::UDP_DATA..], payload);

    // UDP checksum first; the header checksum covers a finished header.
    let mut sum = raw_sum(&src.octets()) + raw_sum(&dst.octets());
    sum += 0x11 + u32::from(udp_length);
    sum += raw_sum(&buf[34..]);
    write_u16(&mut buf, ipv4_offsets::UDP_CHKSUM, finalize(sum));

    let hdr_chksum = finalize(raw_sum(&buf[14..34]));
    write_u16(&mut buf, ipv4_offsets::HDR_CHKSUM, hdr_chksum);
    buf
}

/// Builds an IPv6 test frame. `frame_size` includes the FCS.
pub fn test_frame_ipv6(
    frame_size: u16,
    dst_mac: MacAddr,
    src_mac: MacAddr,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    payload: TestPayload,
) -> Vec<u8> {
    let len = usize::from(frame_size) - ETHER_CRC_LEN;
    let mut buf = vec![0u8; len];
    write_eth_header(&mut buf, dst_mac, src_mac, ETHERTYPE_IPV6);

    let payload_length = (len - 54) as u16;
    {
        let ip = &mut buf[14..54];
        ip[0] = 0x60; // version 6, traffic class 0, flow label 0
        write_u16(ip, 4, payload_length);
        ip[6] = 0x11; // UDP
        ip[7] = 0x0a; // hop limit
        ip[8..24].copy_from_slice(&src.octets());
        ip[24..40].copy_from_slice(&dst.octets());
    }
    write_u16(&mut buf, 58, payload_length);
    write_payload(&mut buf[ipv6_offsets::UDP_DATA..], payload);

    let mut sum = raw_sum(&src.octets()) + raw_sum(&dst.octets());
    sum += u32::from(payload_length) + 0x11;
    sum += raw_sum(&buf[54..]);
    write_u16(&mut buf, ipv6_offsets::UDP_CHKSUM, finalize(sum));
    buf
}

/// Recomputes the UDP checksum of a finished frame from scratch.
/// The slow reference the incremental sender path is tested against.
pub fn recompute_udp_checksum(frame: &[u8]) -> u16 {
    match read_u16(frame, 12) {
        ETHERTYPE_IPV4 => {
            let mut sum = raw_sum(&frame[26..34]); // src + dst
            sum += 0x11 + u32::from(read_u16(frame, 38));
            sum += raw_sum(&frame[34..40]);
            sum += raw_sum(&frame[42..]);
            finalize(sum)
        }
        ETHERTYPE_IPV6 => {
            let mut sum = raw_sum(&frame[22..54]); // src + dst
            sum += u32::from(read_u16(frame, 58)) + 0x11;
            sum += raw_sum(&frame[54..60]);
            sum += raw_sum(&frame[62..]);
            finalize(sum)
        }
        other => unreachable!("not a test frame, ethertype {other:#06x}"),
    }
}

/// Recomputes the IPv4 header checksum of a finished frame from scratch.
pub fn recompute_ipv4_header_checksum(frame: &[u8]) -> u16 {
    let mut sum = raw_sum(&frame[14..24]);
    sum += raw_sum(&frame[26..34]); // skip the stored checksum field
    finalize(sum)
}

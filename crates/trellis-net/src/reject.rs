//! Reject packet synthesis
//!
//! When policy refuses a packet the node can answer the sender instead of
//! silently dropping: TCP gets a RST with the tuple flipped, everything else
//! gets an ICMP destination-unreachable (administratively prohibited). Only
//! IPv4 packets produce rejects; ICMP errors are never answered with more
//! ICMP errors.

use crate::packet::{PROTO_ICMP, PROTO_TCP};

/// Upper bound on a reject packet sent over the mesh (the IPv6 minimum MTU)
pub const MAX_REJECT_PACKET_SIZE: usize = 1280;

const TCP_FLAG_FIN: u8 = 0x01;
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_RST: u8 = 0x04;
const TCP_FLAG_ACK: u8 = 0x10;

const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_CODE_ADMIN_PROHIBITED: u8 = 10;
const ICMP_ECHO_REQUEST: u8 = 8;

/// Build a reject reply for `orig` into `out`.
///
/// Returns `false` when no reject should be sent: non-IPv4 packets, packets
/// that are already RSTs, and ICMP messages other than echo requests.
pub fn create_reject_packet(orig: &[u8], out: &mut Vec<u8>) -> bool {
    out.clear();

    if orig.len() < 20 || orig[0] >> 4 != 4 {
        return false;
    }
    let ihl = ((orig[0] & 0x0F) as usize) * 4;
    if ihl < 20 || orig.len() < ihl {
        return false;
    }

    match orig[9] {
        PROTO_TCP => build_tcp_rst(orig, ihl, out),
        PROTO_ICMP => {
            // Answer echo requests only, never other ICMP
            if orig.len() > ihl && orig[ihl] == ICMP_ECHO_REQUEST {
                build_icmp_prohibited(orig, ihl, out)
            } else {
                false
            }
        }
        _ => build_icmp_prohibited(orig, ihl, out),
    }
}

fn push_ipv4_header(out: &mut Vec<u8>, total_len: u16, protocol: u8, orig: &[u8]) {
    out.push(0x45);
    out.push(0);
    out.extend_from_slice(&total_len.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]); // id, flags, fragment offset
    out.push(64); // ttl
    out.push(protocol);
    out.extend_from_slice(&[0, 0]); // checksum, filled below
    out.extend_from_slice(&orig[16..20]); // our src = their dst
    out.extend_from_slice(&orig[12..16]); // our dst = their src
}

fn build_tcp_rst(orig: &[u8], ihl: usize, out: &mut Vec<u8>) -> bool {
    if orig.len() < ihl + 20 {
        return false;
    }

    let flags = orig[ihl + 13];
    if flags & TCP_FLAG_RST != 0 {
        return false;
    }

    let src_port = [orig[ihl], orig[ihl + 1]];
    let dst_port = [orig[ihl + 2], orig[ihl + 3]];
    let seq = u32::from_be_bytes([orig[ihl + 4], orig[ihl + 5], orig[ihl + 6], orig[ihl + 7]]);
    let ack = u32::from_be_bytes([orig[ihl + 8], orig[ihl + 9], orig[ihl + 10], orig[ihl + 11]]);
    let data_offset = ((orig[ihl + 12] >> 4) as usize) * 4;

    let total_len = (u16::from_be_bytes([orig[2], orig[3]]) as usize).min(orig.len());
    let seg_len = total_len.saturating_sub(ihl + data_offset) as u32;

    let (out_seq, out_ack, out_flags) = if flags & TCP_FLAG_ACK != 0 {
        (ack, 0, TCP_FLAG_RST)
    } else {
        let mut acknowledged = seq.wrapping_add(seg_len);
        if flags & TCP_FLAG_SYN != 0 {
            acknowledged = acknowledged.wrapping_add(1);
        }
        if flags & TCP_FLAG_FIN != 0 {
            acknowledged = acknowledged.wrapping_add(1);
        }
        (0, acknowledged, TCP_FLAG_RST | TCP_FLAG_ACK)
    };

    push_ipv4_header(out, 40, PROTO_TCP, orig);

    out.extend_from_slice(&dst_port); // our src port = their dst port
    out.extend_from_slice(&src_port);
    out.extend_from_slice(&out_seq.to_be_bytes());
    out.extend_from_slice(&out_ack.to_be_bytes());
    out.push(5 << 4); // data offset, no options
    out.push(out_flags);
    out.extend_from_slice(&[0, 0]); // window
    out.extend_from_slice(&[0, 0]); // checksum, filled below
    out.extend_from_slice(&[0, 0]); // urgent pointer

    let tcp_sum = finish_checksum(sum_bytes(&out[20..40], pseudo_header_sum(out, 20)));
    out[36..38].copy_from_slice(&tcp_sum.to_be_bytes());

    let ip_sum = finish_checksum(sum_bytes(&out[..20], 0));
    out[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    true
}

fn build_icmp_prohibited(orig: &[u8], ihl: usize, out: &mut Vec<u8>) -> bool {
    // Quote the original header plus up to eight payload bytes
    let quoted = (ihl + 8).min(orig.len());
    let total_len = (20 + 8 + quoted) as u16;

    push_ipv4_header(out, total_len, PROTO_ICMP, orig);

    out.push(ICMP_DEST_UNREACHABLE);
    out.push(ICMP_CODE_ADMIN_PROHIBITED);
    out.extend_from_slice(&[0, 0]); // checksum, filled below
    out.extend_from_slice(&[0, 0, 0, 0]); // unused
    out.extend_from_slice(&orig[..quoted]);

    let icmp_sum = finish_checksum(sum_bytes(&out[20..], 0));
    out[22..24].copy_from_slice(&icmp_sum.to_be_bytes());

    let ip_sum = finish_checksum(sum_bytes(&out[..20], 0));
    out[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    true
}

/// Ones'-complement sum of `data` folded into a running 32-bit accumulator
fn sum_bytes(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// Pseudo-header contribution for the TCP checksum
fn pseudo_header_sum(packet: &[u8], tcp_len: u16) -> u32 {
    let mut sum = sum_bytes(&packet[12..20], 0); // src + dst
    sum += u32::from(PROTO_TCP);
    sum += u32::from(tcp_len);
    sum
}

fn finish_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

use std::fmt;

/// Fixed payload carried by every echo request, long enough that a
/// truncated reply is rejected instead of misparsed.
pub const ECHO_PAYLOAD: &[u8] = b"worldping-probe/pinger";

const ICMP_HEADER_LEN: usize = 8;
const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct EchoReply {
    pub id: u16,
    pub seq: u16,
}

/// Build an echo request. The ICMPv6 checksum is left zero: the kernel
/// fills it in (it covers an IPv6 pseudo-header we cannot see).
pub fn build_echo_request(family: Family, id: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_LEN + ECHO_PAYLOAD.len()];
    packet[0] = match family {
        Family::V4 => ICMPV4_ECHO_REQUEST,
        Family::V6 => ICMPV6_ECHO_REQUEST,
    };
    packet[1] = 0;
    packet[4..6].copy_from_slice(&id.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet[8..].copy_from_slice(ECHO_PAYLOAD);

    if family == Family::V4 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// Parse a raw-socket read into an echo reply, or `None` for anything
/// else (other ICMP types, short packets, foreign payloads). Raw IPv4
/// sockets deliver the IP header; IPv6 sockets do not.
pub fn parse_echo_reply(family: Family, buf: &[u8]) -> Option<EchoReply> {
    let icmp = match family {
        Family::V4 => {
            let ihl = (*buf.first()? & 0x0f) as usize * 4;
            if buf.first()? >> 4 != 4 || buf.len() < ihl {
                return None;
            }
            &buf[ihl..]
        }
        Family::V6 => buf,
    };
    if icmp.len() < ICMP_HEADER_LEN + ECHO_PAYLOAD.len() {
        return None;
    }
    let expected = match family {
        Family::V4 => ICMPV4_ECHO_REPLY,
        Family::V6 => ICMPV6_ECHO_REPLY,
    };
    if icmp[0] != expected {
        return None;
    }
    Some(EchoReply {
        id: u16::from_be_bytes([icmp[4], icmp[5]]),
        seq: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [odd] = chunks.remainder() {
        sum += u32::from(*odd) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

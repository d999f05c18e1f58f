//! Decodes raw frames into a fixed [`ParsedPacket`] record without copying
//! the payload. See [`crate::parser::app`] for the best-effort
//! application-layer peek (DNS/TLS SNI/HTTP Host).

pub mod app;

use std::net::IpAddr;
use std::time::SystemTime;

use crate::flow::MacAddr;

/// TCP flag bits, packed into one byte (FIN=0x01 ... CWR=0x80).
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Arp,
    Other(u8),
}

impl Protocol {
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Icmp => 1,
            Protocol::Arp => 0, // not an IP protocol number; ARP has no transport header
            Protocol::Other(n) => n,
        }
    }
}

/// Application-layer hints extracted by a best-effort peek. Absence of a
/// field is not an error: a failed peek simply leaves it `None`/empty.
#[derive(Debug, Clone, Default)]
pub struct AppHints {
    pub dns_answers: Vec<(IpAddr, String, u32)>, // (answer_ip, query_name, ttl_secs)
    pub tls_sni: Option<String>,
    pub http_host: Option<String>,
    pub http_method: Option<String>,
}

/// A single decoded frame, valid only for the lifetime of the borrowed buffer.
#[derive(Debug, Clone)]
pub struct ParsedPacket<'a> {
    pub timestamp: SystemTime,
    pub frame_len: usize,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub ttl: Option<u8>,
    /// IPv4 identification field (0 for IPv6, which has none outside fragment headers).
    pub ip_id: u16,
    pub protocol: Protocol,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,
    pub tcp_seq: u32,
    pub tcp_ack: u32,
    pub tcp_window: u16,
    pub payload: &'a [u8],
    pub app: AppHints,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    MalformedShort(usize),
    Rejected(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MalformedShort(len) => write!(f, "frame too short ({len} bytes)"),
            ParseError::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

/// Ports that trigger an application-layer peek attempt, by protocol label.
const DNS_PORTS: [u16; 1] = [53];
const TLS_PORTS: [u16; 5] = [443, 8443, 993, 995, 465];
const HTTP_PORTS: [u16; 3] = [80, 8080, 8000];

pub fn decode(frame: &[u8], timestamp: SystemTime) -> Result<ParsedPacket<'_>, ParseError> {
    if frame.len() < 20 {
        return Err(ParseError::MalformedShort(frame.len()));
    }

    let headers = etherparse::PacketHeaders::from_ethernet_slice(frame)
        .map_err(|_| ParseError::Rejected("unparsable link/network header"))?;

    let link = headers
        .link
        .as_ref()
        .ok_or(ParseError::Rejected("missing ethernet header"))?;
    let src_mac = MacAddr(link.source);
    let dst_mac = MacAddr(link.destination);

    // ARP is accepted (non-IP exception) but carries no transport tuple.
    if headers.ip.is_none() {
        if is_arp(frame) {
            return Ok(ParsedPacket {
                timestamp,
                frame_len: frame.len(),
                src_mac,
                dst_mac,
                src_ip: None,
                dst_ip: None,
                ttl: None,
                ip_id: 0,
                protocol: Protocol::Arp,
                src_port: 0,
                dst_port: 0,
                tcp_flags: 0,
                tcp_seq: 0,
                tcp_ack: 0,
                tcp_window: 0,
                payload: headers.payload,
                app: AppHints::default(),
            });
        }
        return Err(ParseError::Rejected("non-IP, non-ARP ethertype"));
    }

    let (src_ip, dst_ip, ttl, ip_proto, ip_id) = match headers.ip.as_ref().unwrap() {
        etherparse::IpHeader::Version4(h, _) => (
            IpAddr::V4(h.source.into()),
            IpAddr::V4(h.destination.into()),
            h.time_to_live,
            h.protocol,
            h.identification,
        ),
        etherparse::IpHeader::Version6(h, ext) => {
            // Walk extension headers until a transport header or depth 8.
            if ext.hop_by_hop_options.is_some() && ext_depth(ext) > 8 {
                return Err(ParseError::Rejected("ipv6 extension header depth exceeded"));
            }
            (
                IpAddr::V6(h.source.into()),
                IpAddr::V6(h.destination.into()),
                h.hop_limit,
                h.next_header,
                0u16,
            )
        }
    };

    let (src_port, dst_port, tcp_flags, tcp_seq, tcp_ack, tcp_window, protocol) =
        match headers.transport {
            Some(etherparse::TransportHeader::Tcp(t)) => {
                let mut flags = 0u8;
                if t.fin { flags |= tcp_flags::FIN; }
                if t.syn { flags |= tcp_flags::SYN; }
                if t.rst { flags |= tcp_flags::RST; }
                if t.psh { flags |= tcp_flags::PSH; }
                if t.ack { flags |= tcp_flags::ACK; }
                if t.urg { flags |= tcp_flags::URG; }
                (
                    t.source_port,
                    t.destination_port,
                    flags,
                    t.sequence_number,
                    t.acknowledgment_number,
                    t.window_size,
                    Protocol::Tcp,
                )
            }
            Some(etherparse::TransportHeader::Udp(u)) => {
                (u.source_port, u.destination_port, 0, 0, 0, 0, Protocol::Udp)
            }
            Some(etherparse::TransportHeader::Icmpv4(_))
            | Some(etherparse::TransportHeader::Icmpv6(_)) => {
                (0, 0, 0, 0, 0, 0, Protocol::Icmp)
            }
            None => (0, 0, 0, 0, 0, 0, Protocol::Other(ip_proto)),
        };

    let mut app = AppHints::default();
    if DNS_PORTS.contains(&dst_port) || DNS_PORTS.contains(&src_port) {
        app.dns_answers = app::parse_dns_answers(headers.payload);
    } else if TLS_PORTS.contains(&dst_port) {
        app.tls_sni = app::parse_tls_sni(headers.payload);
    } else if HTTP_PORTS.contains(&dst_port) {
        let (host, method) = app::parse_http_request_line(headers.payload);
        app.http_host = host;
        app.http_method = method;
    }

    Ok(ParsedPacket {
        timestamp,
        frame_len: frame.len(),
        src_mac,
        dst_mac,
        src_ip: Some(src_ip),
        dst_ip: Some(dst_ip),
        ttl: Some(ttl),
        ip_id,
        protocol,
        src_port,
        dst_port,
        tcp_flags,
        tcp_seq,
        tcp_ack,
        tcp_window,
        payload: headers.payload,
        app,
    })
}

fn is_arp(frame: &[u8]) -> bool {
    frame.len() >= 14 && frame[12] == 0x08 && frame[13] == 0x06
}

fn ext_depth(ext: &etherparse::Ipv6ExtensionHeaders) -> u8 {
    // Each `Some` extension header present counts as one hop in the chain;
    // etherparse only models the common set so this is a conservative count.
    let mut depth = 0u8;
    if ext.hop_by_hop_options.is_some() {
        depth += 1;
    }
    if ext.destination_options.is_some() {
        depth += 1;
    }
    if ext.routing.is_some() {
        depth += 1;
    }
    if ext.fragment.is_some() {
        depth += 1;
    }
    if ext.auth.is_some() {
        depth += 1;
    }
    depth
}

//! DNS check executor.
//!
//! Queries are built and parsed at the wire level (header, question,
//! answer scan) rather than through a resolver: the check measures a
//! specific server over a specific transport, which the OS resolver
//! cannot express.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout};

use crate::models::Settings;

use super::settings::{self, SettingsError};

/// Per-server exchange budget; the overall check deadline still wins
/// when it is shorter.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);
const UDP_RESPONSE_MAX: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Ns,
    Ptr,
    Soa,
    Srv,
    Txt,
}

impl RecordType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "A" => Some(RecordType::A),
            "AAAA" => Some(RecordType::Aaaa),
            "CNAME" => Some(RecordType::Cname),
            "MX" => Some(RecordType::Mx),
            "NS" => Some(RecordType::Ns),
            "PTR" => Some(RecordType::Ptr),
            "SOA" => Some(RecordType::Soa),
            "SRV" => Some(RecordType::Srv),
            "TXT" => Some(RecordType::Txt),
            _ => None,
        }
    }

    fn wire_type(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DnsResult {
    /// Round-trip time in milliseconds.
    pub time: Option<f64>,
    /// TTL of the first answer, when any answers came back.
    pub ttl: Option<u32>,
    pub answers: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct DnsCheck {
    /// Fully qualified query name (trailing dot enforced).
    name: String,
    record_type: RecordType,
    servers: Vec<String>,
    port: u16,
    protocol: DnsProtocol,
    timeout: Duration,
}

impl DnsCheck {
    pub fn new(config: &Settings) -> Result<Self, SettingsError> {
        let mut name = settings::req_string(config, "name")?;
        if !name.ends_with('.') {
            name.push('.');
        }
        let record_type = RecordType::from_name(&settings::req_string(config, "type")?)
            .ok_or(SettingsError::Invalid("type"))?;

        let servers: Vec<String> = settings::req_string(config, "server")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if servers.is_empty() {
            return Err(SettingsError::Missing("server"));
        }

        let protocol = match settings::opt_string(config, "protocol")?
            .map(|p| p.to_lowercase())
            .as_deref()
        {
            None | Some("") | Some("udp") => DnsProtocol::Udp,
            Some("tcp") => DnsProtocol::Tcp,
            Some(_) => return Err(SettingsError::Invalid("protocol")),
        };

        Ok(Self {
            name,
            record_type,
            servers,
            port: settings::port(config, "port", 53)?,
            protocol,
            timeout: settings::timeout(config, 5.0)?,
        })
    }

    /// Query the servers in order until one answers or the deadline is
    /// spent. Any reply with our transaction id counts as a success,
    /// NXDOMAIN included: the check measures the server, not the name.
    pub async fn run(&self) -> DnsResult {
        let deadline = Instant::now() + self.timeout;
        for server in &self.servers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let budget = remaining.min(EXCHANGE_TIMEOUT);
            match self.exchange(server, budget).await {
                Ok((time, answers, ttl)) => {
                    return DnsResult { time: Some(time), ttl, answers: Some(answers), error: None };
                }
                Err(err) => {
                    tracing::debug!(server = %server, "dns exchange failed: {err}");
                }
            }
        }
        DnsResult {
            error: Some("All target servers failed to respond".to_string()),
            ..Default::default()
        }
    }

    async fn exchange(
        &self,
        server: &str,
        budget: Duration,
    ) -> Result<(f64, u16, Option<u32>), String> {
        let query = build_query(rand::random(), &self.name, self.record_type.wire_type())?;
        let txid = u16::from_be_bytes([query[0], query[1]]);

        let addr = timeout(budget, tokio::net::lookup_host((server, self.port)))
            .await
            .map_err(|_| "timed out resolving server".to_string())?
            .map_err(|err| format!("failed to resolve server: {err}"))?
            .next()
            .ok_or_else(|| "server has no addresses".to_string())?;

        let start = Instant::now();
        let response = match self.protocol {
            DnsProtocol::Udp => exchange_udp(addr, &query, budget).await?,
            DnsProtocol::Tcp => exchange_tcp(addr, &query, budget).await?,
        };
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;

        let (answers, ttl) = parse_response(&response, txid)?;
        Ok((elapsed, answers, ttl))
    }
}

async fn exchange_udp(addr: SocketAddr, query: &[u8], budget: Duration) -> Result<Vec<u8>, String> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket =
        UdpSocket::bind(bind_addr).await.map_err(|err| format!("failed to bind: {err}"))?;
    socket.connect(addr).await.map_err(|err| format!("failed to connect: {err}"))?;
    socket.send(query).await.map_err(|err| format!("failed to send: {err}"))?;

    let mut buf = vec![0u8; UDP_RESPONSE_MAX];
    let len = timeout(budget, socket.recv(&mut buf))
        .await
        .map_err(|_| "timed out waiting for response".to_string())?
        .map_err(|err| format!("failed to receive: {err}"))?;
    buf.truncate(len);
    Ok(buf)
}

async fn exchange_tcp(addr: SocketAddr, query: &[u8], budget: Duration) -> Result<Vec<u8>, String> {
    let mut stream = timeout(budget, TcpStream::connect(addr))
        .await
        .map_err(|_| "timed out connecting".to_string())?
        .map_err(|err| format!("failed to connect: {err}"))?;

    // tcp transport carries a two-byte length prefix
    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    timeout(budget, stream.write_all(&framed))
        .await
        .map_err(|_| "timed out sending".to_string())?
        .map_err(|err| format!("failed to send: {err}"))?;

    let mut len_buf = [0u8; 2];
    timeout(budget, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| "timed out waiting for response".to_string())?
        .map_err(|err| format!("failed to receive: {err}"))?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    timeout(budget, stream.read_exact(&mut buf))
        .await
        .map_err(|_| "timed out waiting for response".to_string())?
        .map_err(|err| format!("failed to receive: {err}"))?;
    Ok(buf)
}

/// Standard recursion-desired query with a single question.
fn build_query(txid: u16, name: &str, wire_type: u16) -> Result<Vec<u8>, String> {
    let mut packet = Vec::with_capacity(12 + name.len() + 6);
    packet.extend_from_slice(&txid.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0u8; 6]); // AN/NS/AR

    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(format!("label too long in name {name:?}"));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&wire_type.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // IN
    Ok(packet)
}

/// Pull the answer count and the first answer's TTL out of a response.
fn parse_response(buf: &[u8], expected_txid: u16) -> Result<(u16, Option<u32>), String> {
    if buf.len() < 12 {
        return Err(format!("response too short: {} bytes", buf.len()));
    }
    let txid = u16::from_be_bytes([buf[0], buf[1]]);
    if txid != expected_txid {
        return Err(format!("transaction id mismatch: got {txid}, expected {expected_txid}"));
    }
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(buf, pos)?;
        pos = pos.checked_add(4).filter(|p| *p <= buf.len()).ok_or("truncated question")?;
    }

    let mut ttl = None;
    if ancount > 0 {
        pos = skip_name(buf, pos)?;
        if pos + 10 > buf.len() {
            return Err("truncated answer".to_string());
        }
        ttl = Some(u32::from_be_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]));
    }
    Ok((ancount, ttl))
}

/// Advance past an encoded name: a label sequence, a compression
/// pointer, or labels ending in a pointer.
fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize, String> {
    loop {
        let len = *buf.get(pos).ok_or("truncated name")? as usize;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xc0 == 0xc0 {
            return Ok(pos + 2);
        }
        pos += 1 + len;
    }
}

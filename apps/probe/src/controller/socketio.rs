//! Minimal socket.io client framing (engine.io protocol 3).
//!
//! Only what the control session needs: the open handshake, the
//! ping/pong heartbeat, and event frames. An engine.io frame is one
//! digit for the transport type; a message frame (`4`) nests one digit
//! for the socket.io type, and events carry a JSON array of
//! `[name, args...]`.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Client heartbeat frame.
pub const PING_FRAME: &str = "2";
pub const PONG_FRAME: &str = "3";

const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("malformed packet: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Handshake {
    pub sid: String,
    #[serde(rename = "pingInterval", default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(rename = "pingTimeout", default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_ping_timeout() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}

#[derive(Debug, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    /// socket.io namespace connect ("40").
    Connect,
    /// socket.io namespace disconnect ("41").
    Disconnect,
    Event {
        name: String,
        args: Vec<Value>,
    },
    Ack,
    /// socket.io error frame ("44...").
    Error(Value),
    /// Anything this client does not speak.
    Unknown(String),
}

pub fn parse(text: &str) -> Result<Packet, PacketError> {
    let mut chars = text.chars();
    let engine_type = chars.next().ok_or(PacketError::Empty)?;
    let rest = chars.as_str();
    match engine_type {
        '0' => {
            let handshake: Handshake = serde_json::from_str(rest)
                .map_err(|err| PacketError::Malformed(format!("open frame: {err}")))?;
            Ok(Packet::Open(handshake))
        }
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => parse_message(rest),
        _ => Ok(Packet::Unknown(text.to_string())),
    }
}

fn parse_message(text: &str) -> Result<Packet, PacketError> {
    let mut chars = text.chars();
    let socket_type = chars.next().ok_or_else(|| PacketError::Malformed("bare message frame".to_string()))?;
    let rest = chars.as_str();
    match socket_type {
        '0' => Ok(Packet::Connect),
        '1' => Ok(Packet::Disconnect),
        '2' => parse_event(rest),
        '3' => Ok(Packet::Ack),
        '4' => {
            let value = serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string()));
            Ok(Packet::Error(value))
        }
        _ => Ok(Packet::Unknown(format!("4{text}"))),
    }
}

fn parse_event(body: &str) -> Result<Packet, PacketError> {
    let mut items: Vec<Value> = serde_json::from_str(body)
        .map_err(|err| PacketError::Malformed(format!("event frame: {err}")))?;
    if items.is_empty() {
        return Err(PacketError::Malformed("event frame without a name".to_string()));
    }
    let name = match items.remove(0) {
        Value::String(name) => name,
        other => {
            return Err(PacketError::Malformed(format!("event name is not a string: {other}")));
        }
    };
    Ok(Packet::Event { name, args: items })
}

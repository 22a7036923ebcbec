//! Ingestion frame format: a 1-byte format tag, an 8-byte big-endian
//! correlation id (nanosecond epoch), then a msgpack body. The whole
//! frame is snappy-framed just before the HTTP POST.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use snap::write::FrameEncoder;
use thiserror::Error;

use crate::models::event::LegacyProbeEvent;
use crate::models::{MetricData, ProbeEvent};

pub const FORMAT_METRIC_DATA_ARRAY_MSGP: u8 = 1;
pub const FORMAT_PROBE_EVENT_JSON: u8 = 0;
pub const FORMAT_PROBE_EVENT_MSGP: u8 = 1;
pub const FORMAT_PROBE_EVENTS_MSGP: u8 = 2;

const HEADER_LEN: usize = 9;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too small")]
    TooSmall,
    #[error("unknown format {0}")]
    UnknownFormat(u8),
    #[error("failed to marshal payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to unmarshal payload: {0}")]
    Decode(String),
}

pub fn create_metrics_frame(metrics: &[MetricData]) -> Result<Vec<u8>, FrameError> {
    let body = rmp_serde::to_vec_named(metrics)?;
    Ok(frame(FORMAT_METRIC_DATA_ARRAY_MSGP, &body))
}

#[allow(dead_code)] // single-event framing is part of the gateway contract
pub fn create_event_frame(event: &ProbeEvent) -> Result<Vec<u8>, FrameError> {
    let body = rmp_serde::to_vec_named(event)?;
    Ok(frame(FORMAT_PROBE_EVENT_MSGP, &body))
}

pub fn create_events_frame(events: &[ProbeEvent]) -> Result<Vec<u8>, FrameError> {
    let body = rmp_serde::to_vec_named(events)?;
    Ok(frame(FORMAT_PROBE_EVENTS_MSGP, &body))
}

/// Decode an inbound event frame. Msgpack single events and arrays are
/// the live formats; tag 0 is the legacy JSON shape with `"k:v"` tag
/// lists. The probe only encodes; the decoder pins down the gateway
/// contract.
#[allow(dead_code)]
pub fn probe_events_from_frame(buf: &[u8]) -> Result<Vec<ProbeEvent>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::TooSmall);
    }
    let body = &buf[HEADER_LEN..];
    match buf[0] {
        FORMAT_PROBE_EVENT_JSON => {
            let legacy: LegacyProbeEvent =
                serde_json::from_slice(body).map_err(|err| FrameError::Decode(err.to_string()))?;
            Ok(vec![legacy.into()])
        }
        FORMAT_PROBE_EVENT_MSGP => {
            let event: ProbeEvent =
                rmp_serde::from_slice(body).map_err(|err| FrameError::Decode(err.to_string()))?;
            Ok(vec![event])
        }
        FORMAT_PROBE_EVENTS_MSGP => {
            rmp_serde::from_slice(body).map_err(|err| FrameError::Decode(err.to_string()))
        }
        other => Err(FrameError::UnknownFormat(other)),
    }
}

pub fn correlation_id(frame: &[u8]) -> Option<i64> {
    let id: [u8; 8] = frame.get(1..HEADER_LEN)?.try_into().ok()?;
    Some(i64::from_be_bytes(id))
}

/// Snappy-frame a wire frame for transport.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = FrameEncoder::new(Vec::with_capacity(data.len() / 2 + 16));
    encoder.write_all(data).expect("snappy write to Vec");
    encoder.into_inner().expect("snappy flush to Vec")
}

fn frame(format: u8, body: &[u8]) -> Vec<u8> {
    let id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default();
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(format);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(body);
    out
}

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MType {
    Gauge,
    Rate,
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MType::Gauge => write!(f, "gauge"),
            MType::Rate => write!(f, "rate"),
        }
    }
}

/// One time-series sample headed for the ingestion gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricData {
    pub org_id: i64,
    /// Full series name: `worldping.<endpoint>.<probe>.<type>.<measurement>`.
    pub name: String,
    /// Short name without the endpoint/probe dimensions.
    pub metric: String,
    pub interval: i64,
    pub unit: String,
    pub mtype: MType,
    /// Unix seconds.
    pub time: i64,
    pub tags: Vec<String>,
    pub value: f64,
}

impl MetricData {
    /// Append a stable series key (everything except time and value) to
    /// `buf`. Used to pick a publisher shard, so equal series must always
    /// produce equal bytes.
    pub fn key_by_series(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.unit.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.mtype.to_string().as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.interval.to_string().as_bytes());
        for tag in &self.tags {
            buf.push(0);
            buf.extend_from_slice(tag.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, value: f64) -> MetricData {
        MetricData {
            org_id: 1,
            name: name.to_string(),
            metric: "worldping.http.total".to_string(),
            interval: 60,
            unit: "ms".to_string(),
            mtype: MType::Gauge,
            time: 1_700_000_000,
            tags: vec!["endpoint:example".into(), "collector:dev".into()],
            value,
        }
    }

    #[test]
    fn series_key_ignores_time_and_value() {
        let a = sample("worldping.example.dev.http.total", 1.0);
        let mut b = sample("worldping.example.dev.http.total", 99.0);
        b.time += 60;

        let mut ka = Vec::new();
        let mut kb = Vec::new();
        a.key_by_series(&mut ka);
        b.key_by_series(&mut kb);
        assert_eq!(ka, kb);
    }

    #[test]
    fn series_key_distinguishes_names() {
        let a = sample("worldping.example.dev.http.total", 1.0);
        let b = sample("worldping.example.dev.http.recv", 1.0);

        let mut ka = Vec::new();
        let mut kb = Vec::new();
        a.key_by_series(&mut ka);
        b.key_by_series(&mut kb);
        assert_ne!(ka, kb);
    }

    #[test]
    fn mtype_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&MType::Gauge).unwrap(), "\"gauge\"");
        assert_eq!(serde_json::to_string(&MType::Rate).unwrap(), "\"rate\"");
    }
}

//! Check executors and the mapping from their results to time series.

pub mod dns;
pub mod http;
pub mod ping;
pub mod settings;

use std::sync::Arc;

use thiserror::Error;

pub use dns::{DnsCheck, DnsResult};
pub use http::{HttpCheck, HttpResult};
pub use ping::{PING_COUNT, PingCheck, PingResult};
pub use settings::SettingsError;

use crate::models::{Check, CheckType, MType, MetricData};
use crate::pinger::{PingError, Pinger};

/// Engine-level failure: the check could not be executed at all, as
/// opposed to a target that failed to respond (which lands in the
/// result's error field).
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Ping(#[from] PingError),
}

#[derive(Debug)]
pub enum Executor {
    Http(HttpCheck),
    Https(HttpCheck),
    Ping(PingCheck),
    Dns(DnsCheck),
}

impl Executor {
    pub fn for_check(check: &Check, pinger: &Arc<Pinger>) -> Result<Self, SettingsError> {
        match check.check_type {
            CheckType::Http => Ok(Executor::Http(HttpCheck::new_http(&check.settings)?)),
            CheckType::Https => Ok(Executor::Https(HttpCheck::new_https(&check.settings)?)),
            CheckType::Ping => {
                Ok(Executor::Ping(PingCheck::new(&check.settings, Arc::clone(pinger))?))
            }
            CheckType::Dns => Ok(Executor::Dns(DnsCheck::new(&check.settings)?)),
        }
    }

    pub async fn run(&self) -> Result<CheckResult, RunError> {
        match self {
            Executor::Http(check) => Ok(CheckResult::Http(check.run().await)),
            Executor::Https(check) => Ok(CheckResult::Https(check.run().await)),
            Executor::Ping(check) => Ok(CheckResult::Ping(check.run().await?)),
            Executor::Dns(check) => Ok(CheckResult::Dns(check.run().await)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckResult {
    Http(HttpResult),
    Https(HttpResult),
    Ping(PingResult),
    Dns(DnsResult),
}

impl CheckResult {
    pub fn error_msg(&self) -> Option<&str> {
        match self {
            CheckResult::Http(r) | CheckResult::Https(r) => r.error.as_deref(),
            CheckResult::Ping(r) => r.error.as_deref(),
            CheckResult::Dns(r) => r.error.as_deref(),
        }
    }

    /// Translate the measurements into named series. Absent measurements
    /// emit nothing. The summary measurement (total / avg / time) is
    /// duplicated under `<type>.default` for the stock dashboards.
    pub fn metrics(&self, time: i64, check: &Check, probe_slug: &str) -> Vec<MetricData> {
        let mut series = SeriesBuilder::new(check, probe_slug, time);
        match self {
            CheckResult::Http(r) | CheckResult::Https(r) => {
                series.push("dns", "ms", r.dns);
                series.push("connect", "ms", r.connect);
                series.push("send", "ms", r.send);
                series.push("wait", "ms", r.wait);
                series.push("recv", "ms", r.recv);
                series.push("total", "ms", r.total);
                series.push("default", "ms", r.total);
                series.push("dataLength", "B", r.data_length);
                series.push("throughput", "B/s", r.throughput);
                series.push("statusCode", "code", r.status_code);
                series.push("expiry", "s", r.expiry);
            }
            CheckResult::Ping(r) => {
                series.push("loss", "percent", r.loss);
                series.push("min", "ms", r.min);
                series.push("max", "ms", r.max);
                series.push("avg", "ms", r.avg);
                series.push("default", "ms", r.avg);
                series.push("median", "ms", r.median);
                series.push("mdev", "ms", r.mdev);
            }
            CheckResult::Dns(r) => {
                series.push("time", "ms", r.time);
                series.push("default", "ms", r.time);
                series.push("ttl", "s", r.ttl.map(f64::from));
                series.push("answers", "count", r.answers.map(f64::from));
            }
        }
        series.finish()
    }
}

/// Shared tags for every series a check emits.
pub fn series_tags(check: &Check, probe_slug: &str) -> Vec<String> {
    vec![
        format!("endpoint:{}", check.slug),
        format!("collector:{probe_slug}"),
        format!("monitor_type:{}", check.check_type),
    ]
}

struct SeriesBuilder<'a> {
    check: &'a Check,
    probe_slug: &'a str,
    time: i64,
    out: Vec<MetricData>,
}

impl<'a> SeriesBuilder<'a> {
    fn new(check: &'a Check, probe_slug: &'a str, time: i64) -> Self {
        Self { check, probe_slug, time, out: Vec::new() }
    }

    fn push(&mut self, measurement: &str, unit: &str, value: Option<f64>) {
        let Some(value) = value else { return };
        self.out.push(MetricData {
            org_id: self.check.org_id,
            name: format!(
                "worldping.{}.{}.{}.{measurement}",
                self.check.slug, self.probe_slug, self.check.check_type
            ),
            metric: format!("worldping.{}.{measurement}", self.check.check_type),
            interval: self.check.frequency,
            unit: unit.to_string(),
            mtype: MType::Gauge,
            time: self.time,
            tags: series_tags(self.check, self.probe_slug),
            value,
        });
    }

    fn finish(self) -> Vec<MetricData> {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_check() -> Check {
        serde_json::from_value(json!({
            "id": 1,
            "org_id": 3,
            "endpoint_id": 10,
            "slug": "example_org",
            "type": "http",
            "frequency": 60,
            "offset": 5,
            "enabled": true,
            "updated": "2024-05-01T10:00:00Z",
            "settings": {"host": "example.org", "port": 80}
        }))
        .unwrap()
    }

    #[test]
    fn http_metrics_cover_all_measurements() {
        let result = CheckResult::Http(HttpResult {
            dns: Some(1.0),
            connect: Some(2.0),
            send: Some(0.5),
            wait: Some(3.0),
            recv: Some(4.0),
            total: Some(10.5),
            data_length: Some(542.0),
            throughput: Some(135.5),
            status_code: Some(200.0),
            expiry: None,
            error: None,
        });
        let metrics = result.metrics(1_700_000_000, &http_check(), "dev-probe");

        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"worldping.example_org.dev-probe.http.total"));
        assert!(names.contains(&"worldping.example_org.dev-probe.http.default"));
        assert!(names.contains(&"worldping.example_org.dev-probe.http.dataLength"));
        assert!(!names.iter().any(|n| n.ends_with(".expiry")));

        let default =
            metrics.iter().find(|m| m.name.ends_with(".default")).expect("default series");
        assert_eq!(default.value, 10.5);
        assert_eq!(default.metric, "worldping.http.default");
        assert_eq!(default.interval, 60);
        assert_eq!(
            default.tags,
            vec![
                "endpoint:example_org".to_string(),
                "collector:dev-probe".to_string(),
                "monitor_type:http".to_string(),
            ]
        );
    }

    #[test]
    fn absent_measurements_emit_nothing() {
        let result = CheckResult::Http(HttpResult {
            dns: Some(1.0),
            error: Some("connect error. refused".to_string()),
            ..Default::default()
        });
        let metrics = result.metrics(1_700_000_000, &http_check(), "dev-probe");
        assert_eq!(metrics.len(), 1);
        assert!(metrics[0].name.ends_with(".dns"));
    }

    #[test]
    fn ping_default_duplicates_avg() {
        let mut check = http_check();
        check.check_type = CheckType::Ping;
        let result = CheckResult::Ping(PingResult {
            loss: Some(0.0),
            min: Some(9.0),
            max: Some(11.0),
            avg: Some(10.0),
            median: Some(10.0),
            mdev: Some(0.5),
            error: None,
        });
        let metrics = result.metrics(1_700_000_000, &check, "dev-probe");
        let default = metrics.iter().find(|m| m.name.ends_with(".default")).unwrap();
        assert_eq!(default.value, 10.0);
        assert_eq!(default.name, "worldping.example_org.dev-probe.ping.default");
    }

    #[test]
    fn dns_default_duplicates_time() {
        let mut check = http_check();
        check.check_type = CheckType::Dns;
        let result = CheckResult::Dns(DnsResult {
            time: Some(23.0),
            ttl: Some(300),
            answers: Some(2),
            error: None,
        });
        let metrics = result.metrics(1_700_000_000, &check, "dev-probe");
        let default = metrics.iter().find(|m| m.name.ends_with(".default")).unwrap();
        assert_eq!(default.value, 23.0);
        let ttl = metrics.iter().find(|m| m.name.ends_with(".ttl")).unwrap();
        assert_eq!(ttl.value, 300.0);
        assert_eq!(ttl.unit, "s");
    }
}

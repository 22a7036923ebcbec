use std::sync::Arc;
use std::time::Duration;

use crate::models::Settings;
use crate::pinger::{PingError, PingStats, Pinger};

use super::settings::{self, IpVersion, SettingsError, resolve_host};

/// Echo requests sent per execution.
pub const PING_COUNT: usize = 5;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PingResult {
    /// Packet loss in percent.
    pub loss: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub median: Option<f64>,
    pub mdev: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct PingCheck {
    hostname: String,
    timeout: Duration,
    ipversion: IpVersion,
    pinger: Arc<Pinger>,
}

impl PingCheck {
    pub fn new(config: &Settings, pinger: Arc<Pinger>) -> Result<Self, SettingsError> {
        Ok(Self {
            hostname: settings::req_string(config, "hostname")?,
            timeout: settings::timeout(config, 5.0)?,
            ipversion: IpVersion::from_settings(config)?,
            pinger,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Run one execution. Reachability problems land in the result;
    /// only an unusable engine (shutdown, wrong family, send failure)
    /// is an `Err`.
    pub async fn run(&self) -> Result<PingResult, PingError> {
        let resolved =
            tokio::time::timeout(self.timeout, resolve_host(&self.hostname, self.ipversion)).await;
        let ip = match resolved {
            Err(_) => {
                return Ok(PingResult {
                    error: Some("timeout resolving IP address of hostname.".to_string()),
                    ..Default::default()
                });
            }
            Ok(Err(message)) => {
                return Ok(PingResult { error: Some(message), ..Default::default() });
            }
            Ok(Ok(ip)) => ip,
        };

        let stats = self.pinger.ping(ip, PING_COUNT, self.timeout).await?;
        Ok(stats_to_result(&stats))
    }
}

/// Derive the reported statistics from raw echo latencies.
pub(crate) fn stats_to_result(stats: &PingStats) -> PingResult {
    let mut result = PingResult::default();

    let sent = stats.sent as f64;
    let failed = (stats.sent - stats.received) as f64;
    result.loss = Some(if failed == 0.0 { 0.0 } else { 100.0 * failed / sent });

    if stats.received > 0 {
        let mut latencies: Vec<f64> =
            stats.latency.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).expect("latency is finite"));

        let count = latencies.len() as f64;
        let sum: f64 = latencies.iter().sum();
        let sum_sq: f64 = latencies.iter().map(|v| v * v).sum();
        let avg = sum / count;

        result.min = latencies.first().copied();
        result.max = latencies.last().copied();
        result.avg = Some(avg);
        result.median = Some(latencies[latencies.len() / 2]);
        result.mdev = Some((sum_sq / count - avg * avg).max(0.0).sqrt());
    }

    if result.loss == Some(100.0) {
        result.error = Some("100% packet loss".to_string());
    }
    result
}

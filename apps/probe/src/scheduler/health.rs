//! Probe self-health supervisor.
//!
//! Pings the configured health hosts every couple of seconds. When a
//! majority of them stop answering, the problem is assumed to be on our
//! side and every check is paused until the hosts come back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio::sync::watch;
use tracing::warn;

use crate::checks::PingCheck;
use crate::models::Settings;

use super::Scheduler;

const CHECK_INTERVAL: Duration = Duration::from_secs(2);
const PING_TIMEOUT_SECS: f64 = 1.0;

/// Run the supervisor loop until shutdown. Failing to build the health
/// checks is a startup error.
pub async fn run(
    scheduler: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let pinger = Arc::clone(scheduler.pinger());
    let checks: Vec<PingCheck> = scheduler
        .health_hosts()
        .iter()
        .map(|host| {
            let settings: Settings = [
                ("hostname".to_string(), json!(host)),
                ("timeout".to_string(), json!(PING_TIMEOUT_SECS)),
            ]
            .into_iter()
            .collect();
            PingCheck::new(&settings, Arc::clone(&pinger))
        })
        .collect::<Result<_, _>>()
        .context("unable to create health check")?;

    let mut last_healthy = false;
    let mut ticker = tokio::time::interval(CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let outcomes = futures::future::join_all(checks.iter().map(|check| check.run())).await;
        let mut score = 0;
        for (check, outcome) in checks.iter().zip(outcomes) {
            match outcome {
                // the engine itself is unusable, assume the worst
                Err(err) => {
                    warn!("health check to {} could not run: {err}", check.hostname());
                    score = checks.len();
                    break;
                }
                Ok(result) => {
                    if let Some(message) = result.error {
                        warn!("health check to {} failed: {message}", check.hostname());
                        score += 1;
                    }
                }
            }
        }

        // more than half the hosts unreachable means the probe itself
        // is suspect
        let healthy = 2 * score <= checks.len();
        if healthy != last_healthy {
            last_healthy = healthy;
            scheduler.set_healthy(healthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinger::Pinger;
    use crate::publisher::Publisher;

    fn scheduler_with_hosts(hosts: &str) -> Arc<Scheduler> {
        let pinger = Arc::new(Pinger::disconnected());
        let url = url::Url::parse("http://127.0.0.1:9/").unwrap();
        let publisher = Publisher::new(&url, "test", 1).unwrap();
        Scheduler::new(hosts, pinger, publisher)
    }

    #[tokio::test(start_paused = true)]
    async fn no_health_hosts_means_healthy() {
        let scheduler = scheduler_with_hosts("");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(Arc::clone(&scheduler), rx));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(scheduler.is_healthy());

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_engine_keeps_the_probe_unhealthy() {
        // the disconnected engine can ping nothing, so the single host
        // scores as down and the majority rule trips
        let scheduler = scheduler_with_hosts("localhost");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(Arc::clone(&scheduler), rx));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!scheduler.is_healthy());

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}

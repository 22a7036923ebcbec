//! Check scheduling: owns every active check instance, applies
//! control-plane mutations, gates execution on probe health, and turns
//! executor results into metrics and state-change events.

pub mod health;
mod ticker;

pub use ticker::Ticker;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::checks::{CheckResult, Executor, series_tags};
use crate::models::{Check, MType, MetricData, ProbeEvent};
use crate::pinger::Pinger;
use crate::probe;
use crate::publisher::Publisher;

/// Ticks delivered later than this trigger a warning.
const LATE_WARNING: Duration = Duration::from_millis(100);
/// A check stuck in error state re-emits its event this often.
const ERROR_EVENT_REFRESH: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Ok,
    Crit,
    Unknown,
}

pub struct Scheduler {
    checks: RwLock<HashMap<i64, Arc<CheckInstance>>>,
    healthy: AtomicBool,
    health_hosts: Vec<String>,
    pinger: Arc<Pinger>,
    publisher: Publisher,
}

impl Scheduler {
    pub fn new(health_hosts: &str, pinger: Arc<Pinger>, publisher: Publisher) -> Arc<Self> {
        let hosts = health_hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(String::from)
            .collect();
        Arc::new(Self {
            checks: RwLock::new(HashMap::new()),
            healthy: AtomicBool::new(false),
            health_hosts: hosts,
            pinger,
            publisher,
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn health_hosts(&self) -> &[String] {
        &self.health_hosts
    }

    pub fn pinger(&self) -> &Arc<Pinger> {
        &self.pinger
    }

    /// Reconcile against the full assignment: create unknown enabled
    /// checks, update known ones whose definition advanced, and drop
    /// everything the server no longer assigns to this probe.
    pub fn refresh(&self, incoming: Vec<Check>) {
        info!("refreshing checks, there are {}", incoming.len());
        let mut checks = self.checks.write().expect("scheduler lock poisoned");
        let healthy = self.healthy.load(Ordering::Acquire);

        let mut seen = HashSet::new();
        for check in incoming {
            if !check.enabled {
                continue;
            }
            seen.insert(check.id);
            let id = check.id;
            match checks.get(&id) {
                Some(existing) => {
                    debug!("check {id} already running");
                    if check.updated > existing.updated() {
                        info!("syncing update to check {id}");
                        if let Err(err) = existing.update(check, healthy, &self.pinger) {
                            error!("unable to update check instance for check {id}: {err:#}");
                            existing.delete();
                            checks.remove(&id);
                        }
                    }
                }
                None => {
                    debug!("new check definition found for check {id}");
                    match CheckInstance::spawn(check, healthy, &self.pinger, &self.publisher) {
                        Ok(instance) => {
                            checks.insert(id, instance);
                        }
                        Err(err) => {
                            error!("unable to create check instance for check {id}: {err:#}")
                        }
                    }
                }
            }
        }

        checks.retain(|id, instance| {
            if seen.contains(id) {
                true
            } else {
                info!("check {id} no longer scheduled to this probe, removing it");
                instance.delete();
                false
            }
        });
        debug!("refresh complete");
    }

    pub fn create(&self, check: Check) {
        info!("creating {} check for {}", check.check_type, check.slug);
        let mut checks = self.checks.write().expect("scheduler lock poisoned");
        let healthy = self.healthy.load(Ordering::Acquire);

        if let Some(existing) = checks.remove(&check.id) {
            warn!("received create event for a check that is already running: {}", check.id);
            existing.delete();
        }
        let id = check.id;
        match CheckInstance::spawn(check, healthy, &self.pinger, &self.publisher) {
            Ok(instance) => {
                checks.insert(id, instance);
            }
            Err(err) => error!("unable to create check instance for check {id}: {err:#}"),
        }
    }

    pub fn update(&self, check: Check) {
        info!("updating {} check for {}", check.check_type, check.slug);
        let mut checks = self.checks.write().expect("scheduler lock poisoned");
        let healthy = self.healthy.load(Ordering::Acquire);
        let id = check.id;

        match checks.get(&id) {
            None => {
                warn!("received update event for a check that is not running: {id}");
                match CheckInstance::spawn(check, healthy, &self.pinger, &self.publisher) {
                    Ok(instance) => {
                        checks.insert(id, instance);
                    }
                    Err(err) => error!("unable to create check instance for check {id}: {err:#}"),
                }
            }
            Some(existing) => {
                if let Err(err) = existing.update(check, healthy, &self.pinger) {
                    error!("unable to update check instance for check {id}: {err:#}");
                    existing.delete();
                    checks.remove(&id);
                }
            }
        }
    }

    pub fn remove(&self, check: &Check) {
        info!("removing {} check for {}", check.check_type, check.slug);
        let mut checks = self.checks.write().expect("scheduler lock poisoned");
        match checks.remove(&check.id) {
            Some(instance) => instance.delete(),
            None => warn!("received remove event for a check that is not running: {}", check.id),
        }
    }

    /// Flip probe health: pausing stops every instance in place,
    /// recovery re-arms them. Holding the map lock makes the flip
    /// atomic with respect to concurrent creates.
    pub fn set_healthy(&self, healthy: bool) {
        let checks = self.checks.write().expect("scheduler lock poisoned");
        self.healthy.store(healthy, Ordering::Release);
        if healthy {
            warn!("this probe is now healthy again, resuming execution of checks");
            for instance in checks.values() {
                instance.resume();
            }
        } else {
            warn!("this probe is in an unhealthy state, stopping execution of checks");
            for instance in checks.values() {
                instance.stop();
            }
        }
    }

    /// Tear down every instance; used at process shutdown.
    pub fn close(&self) {
        let mut checks = self.checks.write().expect("scheduler lock poisoned");
        for (_, instance) in checks.drain() {
            instance.delete();
        }
    }

    #[cfg(test)]
    pub(crate) fn instance(&self, id: i64) -> Option<Arc<CheckInstance>> {
        self.checks.read().expect("scheduler lock poisoned").get(&id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn check_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> =
            self.checks.read().expect("scheduler lock poisoned").keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

struct InstanceState {
    check: Check,
    exec: Arc<Executor>,
    state: CheckState,
    state_change: SystemTime,
    last_error: String,
}

/// The runtime half of one enabled check: a ticker and the execution
/// loop fed by it. Mutations swap the executor and re-phase the ticker;
/// the loop snapshots both under the lock and runs without it.
pub struct CheckInstance {
    ticker: Ticker,
    state: Mutex<InstanceState>,
}

impl CheckInstance {
    fn spawn(
        check: Check,
        probe_healthy: bool,
        pinger: &Arc<Pinger>,
        publisher: &Publisher,
    ) -> anyhow::Result<Arc<Self>> {
        info!("creating new check instance for {} check for {}", check.check_type, check.slug);
        check.validate().context("invalid check definition")?;
        let exec = Executor::for_check(&check, pinger).context("invalid check settings")?;

        let (ticker, mut ticks) = Ticker::new(check.frequency, check.offset);
        let instance = Arc::new(Self {
            ticker,
            state: Mutex::new(InstanceState {
                check,
                exec: Arc::new(exec),
                state: CheckState::Unknown,
                state_change: SystemTime::now(),
                last_error: String::new(),
            }),
        });

        let loop_instance = Arc::clone(&instance);
        let publisher = publisher.clone();
        tokio::spawn(async move {
            while let Some(tick) = ticks.recv().await {
                loop_instance.run_once(tick, &publisher).await;
            }
        });

        if probe_healthy {
            instance.ticker.start();
        }
        Ok(instance)
    }

    fn updated(&self) -> DateTime<Utc> {
        self.state.lock().expect("instance lock poisoned").check.updated
    }

    fn update(&self, check: Check, probe_healthy: bool, pinger: &Arc<Pinger>) -> anyhow::Result<()> {
        check.validate().context("invalid check definition")?;
        let exec = Executor::for_check(&check, pinger).context("invalid check settings")?;

        let (frequency, offset) = (check.frequency, check.offset);
        {
            let mut state = self.state.lock().expect("instance lock poisoned");
            state.check = check;
            state.exec = Arc::new(exec);
        }
        self.ticker.update(frequency, offset);
        if probe_healthy {
            self.ticker.start();
        } else {
            self.ticker.stop();
        }
        Ok(())
    }

    fn stop(&self) {
        self.ticker.stop();
    }

    fn resume(&self) {
        self.ticker.start();
    }

    fn delete(&self) {
        self.ticker.delete();
    }

    async fn run_once(&self, tick: SystemTime, publisher: &Publisher) {
        let delay = SystemTime::now().duration_since(tick).unwrap_or_default();

        let (exec, check) = {
            let state = self.state.lock().expect("instance lock poisoned");
            let frequency = Duration::from_secs(state.check.frequency.max(0) as u64);
            if delay > frequency {
                warn!(
                    "dropping tick for {} check for {}: {}ms late",
                    state.check.check_type,
                    state.check.slug,
                    delay.as_millis()
                );
                return;
            }
            if delay > LATE_WARNING {
                warn!(
                    "{} check for {} is running late by {}ms",
                    state.check.check_type,
                    state.check.slug,
                    delay.as_millis()
                );
            }
            (Arc::clone(&state.exec), state.check.clone())
        };

        let desc = format!("{} check for {}", check.check_type, check.slug);
        debug!("running {desc}");
        let result = match exec.run().await {
            Ok(result) => result,
            Err(err) => {
                error!("failed to execute {desc}: {err}");
                return;
            }
        };

        let probe_slug = probe::slug();
        let time = unix_seconds(tick);
        let mut metrics = result.metrics(time, &check, &probe_slug);
        debug!("got {} metrics for {desc}", metrics.len());

        let (state, event) = self.evaluate(&check, &result, tick, &probe_slug, &desc);
        push_state_metrics(&mut metrics, &check, &probe_slug, time, state);

        publisher.add_metrics(metrics).await;
        if let Some(event) = event {
            publisher.add_event(event).await;
        }
    }

    /// Update the instance state from a result and decide whether a
    /// state-change event is due: on OK↔CRIT transitions, on a changed
    /// error message, and every ten minutes while stuck in CRIT.
    fn evaluate(
        &self,
        check: &Check,
        result: &CheckResult,
        tick: SystemTime,
        probe_slug: &str,
        desc: &str,
    ) -> (CheckState, Option<ProbeEvent>) {
        let message = result.error_msg().unwrap_or_default();
        let mut state = self.state.lock().expect("instance lock poisoned");
        let now = SystemTime::now();

        if !message.is_empty() {
            debug!("{desc} failed: {message}");
            let state_age = now.duration_since(state.state_change).unwrap_or_default();
            if state.state != CheckState::Crit
                || message != state.last_error
                || state_age > ERROR_EVENT_REFRESH
            {
                state.state = CheckState::Crit;
                state.last_error = message.to_string();
                state.state_change = now;
                info!("{desc} is in error state");
                let event = state_event(check, "ERROR", message, tick, probe_slug);
                return (CheckState::Crit, Some(event));
            }
            return (CheckState::Crit, None);
        }

        if state.state != CheckState::Ok {
            state.state = CheckState::Ok;
            state.state_change = now;
            info!("{desc} is now in OK state");
            let event = state_event(check, "OK", "Monitor now Ok.", tick, probe_slug);
            return (CheckState::Ok, Some(event));
        }
        (CheckState::Ok, None)
    }

    #[cfg(test)]
    fn force_state(&self, state: CheckState, last_error: &str, state_change: SystemTime) {
        let mut inner = self.state.lock().expect("instance lock poisoned");
        inner.state = state;
        inner.last_error = last_error.to_string();
        inner.state_change = state_change;
    }
}

fn state_event(
    check: &Check,
    severity: &str,
    message: &str,
    tick: SystemTime,
    probe_slug: &str,
) -> ProbeEvent {
    ProbeEvent {
        id: String::new(),
        event_type: "monitor_state".to_string(),
        org_id: check.org_id,
        severity: severity.to_string(),
        source: "monitor_collector".to_string(),
        timestamp: unix_millis(tick),
        message: message.to_string(),
        tags: [
            ("endpoint".to_string(), check.slug.clone()),
            ("collector".to_string(), probe_slug.to_string()),
            ("monitor_type".to_string(), check.check_type.to_string()),
        ]
        .into_iter()
        .collect(),
    }
}

/// The two always-emitted health series for a check execution.
fn push_state_metrics(
    metrics: &mut Vec<MetricData>,
    check: &Check,
    probe_slug: &str,
    time: i64,
    state: CheckState,
) {
    let (ok_state, error_state) = if state == CheckState::Crit { (0.0, 1.0) } else { (1.0, 0.0) };
    for (measurement, value) in [("ok_state", ok_state), ("error_state", error_state)] {
        metrics.push(MetricData {
            org_id: check.org_id,
            name: format!(
                "worldping.{}.{}.{}.{measurement}",
                check.slug, probe_slug, check.check_type
            ),
            metric: format!("worldping.{}.{measurement}", check.check_type),
            interval: check.frequency,
            unit: "state".to_string(),
            mtype: MType::Gauge,
            time,
            tags: series_tags(check, probe_slug),
            value,
        });
    }
}

fn unix_seconds(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn unix_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::HttpResult;
    use chrono::TimeZone;
    use serde_json::json;

    fn check(id: i64, enabled: bool, updated_secs: i64) -> Check {
        serde_json::from_value(json!({
            "id": id,
            "org_id": 3,
            "endpoint_id": id * 10,
            "slug": format!("endpoint_{id}"),
            "type": "http",
            "frequency": 60,
            "offset": 5,
            "enabled": enabled,
            "updated": Utc.timestamp_opt(updated_secs, 0).unwrap().to_rfc3339(),
            "settings": {"host": "example.org", "port": 80}
        }))
        .unwrap()
    }

    fn test_scheduler() -> Arc<Scheduler> {
        let pinger = Arc::new(Pinger::disconnected());
        let url = url::Url::parse("http://127.0.0.1:9/").unwrap();
        let publisher = Publisher::new(&url, "test", 1).unwrap();
        Scheduler::new("", pinger, publisher)
    }

    #[tokio::test]
    async fn refresh_reconciles_the_local_set() {
        let scheduler = test_scheduler();

        // locally running: c1 and c4
        scheduler.refresh(vec![check(1, true, 100), check(4, true, 100)]);
        assert_eq!(scheduler.check_ids(), vec![1, 4]);
        let c1_before = scheduler.instance(1).unwrap();

        // incoming: c1 unchanged, c2 disabled, c3 new
        scheduler.refresh(vec![check(1, true, 100), check(2, false, 100), check(3, true, 100)]);
        assert_eq!(scheduler.check_ids(), vec![1, 3]);
        // c1 did not advance, so the instance is untouched
        assert!(Arc::ptr_eq(&c1_before, &scheduler.instance(1).unwrap()));
    }

    #[tokio::test]
    async fn refresh_with_unchanged_input_is_a_noop() {
        let scheduler = test_scheduler();
        scheduler.refresh(vec![check(1, true, 100)]);
        let before = scheduler.instance(1).unwrap();

        scheduler.refresh(vec![check(1, true, 100)]);
        assert!(Arc::ptr_eq(&before, &scheduler.instance(1).unwrap()));

        // an older definition must not regress the instance either
        scheduler.refresh(vec![check(1, true, 50)]);
        assert!(Arc::ptr_eq(&before, &scheduler.instance(1).unwrap()));
    }

    #[tokio::test]
    async fn refresh_applies_newer_definitions_in_place() {
        let scheduler = test_scheduler();
        scheduler.refresh(vec![check(1, true, 100)]);
        let instance = scheduler.instance(1).unwrap();

        scheduler.refresh(vec![check(1, true, 200)]);
        // updated in place, same instance with the new timestamp
        assert!(Arc::ptr_eq(&instance, &scheduler.instance(1).unwrap()));
        assert_eq!(instance.updated(), Utc.timestamp_opt(200, 0).unwrap());
    }

    #[tokio::test]
    async fn create_replaces_a_colliding_instance() {
        let scheduler = test_scheduler();
        scheduler.create(check(7, true, 100));
        let first = scheduler.instance(7).unwrap();

        scheduler.create(check(7, true, 100));
        assert_eq!(scheduler.check_ids(), vec![7]);
        assert!(!Arc::ptr_eq(&first, &scheduler.instance(7).unwrap()));
    }

    #[tokio::test]
    async fn update_creates_missing_instances() {
        let scheduler = test_scheduler();
        scheduler.update(check(9, true, 100));
        assert_eq!(scheduler.check_ids(), vec![9]);

        scheduler.remove(&check(9, true, 100));
        assert!(scheduler.check_ids().is_empty());
    }

    #[tokio::test]
    async fn invalid_definitions_never_become_instances() {
        let scheduler = test_scheduler();
        let mut bad = check(5, true, 100);
        bad.frequency = 45; // not in the valid frequency map
        scheduler.create(bad);
        assert!(scheduler.check_ids().is_empty());

        let mut bad = check(6, true, 100);
        bad.settings.remove("host");
        scheduler.create(bad);
        assert!(scheduler.check_ids().is_empty());
    }

    fn ok_result() -> CheckResult {
        CheckResult::Http(HttpResult { total: Some(10.0), ..Default::default() })
    }

    fn failed_result(message: &str) -> CheckResult {
        CheckResult::Http(HttpResult { error: Some(message.to_string()), ..Default::default() })
    }

    #[tokio::test]
    async fn events_fire_on_the_three_conditions_only() {
        let scheduler = test_scheduler();
        scheduler.create(check(1, true, 100));
        let instance = scheduler.instance(1).unwrap();
        let c = check(1, true, 100);
        let now = SystemTime::now();

        // unknown -> ok is a state change
        let (state, event) = instance.evaluate(&c, &ok_result(), now, "dev", "http check");
        assert_eq!(state, CheckState::Ok);
        let event = event.expect("first OK emits an event");
        assert_eq!(event.severity, "OK");
        assert_eq!(event.message, "Monitor now Ok.");
        assert_eq!(event.tags["endpoint"], "endpoint_1");

        // ok -> ok stays quiet
        let (_, event) = instance.evaluate(&c, &ok_result(), now, "dev", "http check");
        assert!(event.is_none());

        // ok -> crit emits ERROR with the check's message
        let (state, event) = instance.evaluate(&c, &failed_result("boom"), now, "dev", "http check");
        assert_eq!(state, CheckState::Crit);
        let event = event.expect("transition to CRIT emits");
        assert_eq!(event.severity, "ERROR");
        assert_eq!(event.message, "boom");

        // same failure again stays quiet
        let (_, event) = instance.evaluate(&c, &failed_result("boom"), now, "dev", "http check");
        assert!(event.is_none());

        // a different message re-emits
        let (_, event) = instance.evaluate(&c, &failed_result("other"), now, "dev", "http check");
        assert!(event.is_some());

        // a long-lived error state re-emits after ten minutes
        instance.force_state(
            CheckState::Crit,
            "other",
            SystemTime::now() - Duration::from_secs(601),
        );
        let (_, event) = instance.evaluate(&c, &failed_result("other"), now, "dev", "http check");
        assert!(event.is_some());
    }

    #[tokio::test]
    async fn state_metrics_reflect_the_outcome() {
        let c = check(1, true, 100);
        let mut metrics = Vec::new();
        push_state_metrics(&mut metrics, &c, "dev", 1_700_000_000, CheckState::Ok);
        push_state_metrics(&mut metrics, &c, "dev", 1_700_000_000, CheckState::Crit);

        assert_eq!(metrics.len(), 4);
        let ok_when_ok = &metrics[0];
        assert!(ok_when_ok.name.ends_with(".ok_state"));
        assert_eq!(ok_when_ok.value, 1.0);
        assert_eq!(metrics[1].value, 0.0);
        // crit flips both
        assert_eq!(metrics[2].value, 0.0);
        assert_eq!(metrics[3].value, 1.0);
        assert!(metrics.iter().all(|m| m.unit == "state"));
    }

    #[tokio::test]
    async fn set_healthy_flips_the_flag() {
        let scheduler = test_scheduler();
        scheduler.create(check(1, true, 100));
        assert!(!scheduler.is_healthy());
        scheduler.set_healthy(true);
        assert!(scheduler.is_healthy());
        scheduler.set_healthy(false);
        assert!(!scheduler.is_healthy());
        scheduler.close();
        assert!(scheduler.check_ids().is_empty());
    }
}

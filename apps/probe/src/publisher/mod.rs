//! Backpressured sink for metrics and events.
//!
//! Two pipelines of the same shape: an input queue feeding an
//! orchestrator that batches into per-shard buffers, and workers that
//! snappy-frame each batch and POST it to the gateway, retrying with
//! backoff until it lands. Metrics are sharded by a fingerprint of the
//! series key so a series always travels the same lane.

pub mod msg;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::models::{MetricData, ProbeEvent};

const MAX_METRICS_PER_FLUSH: usize = 10_000;
const MAX_EVENTS_PER_FLUSH: usize = 10_000;
const MAX_FLUSH_WAIT: Duration = Duration::from_millis(500);
const METRICS_IN_CAPACITY: usize = 1_000_000;
const EVENTS_IN_CAPACITY: usize = 50_000;
const WRITE_QUEUE_CAPACITY: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_DEADLINE: Duration = Duration::from_secs(60);

/// Cloneable handle to the pipelines; `stop` drains and joins them.
#[derive(Clone)]
pub struct Publisher {
    metrics_tx: mpsc::Sender<MetricData>,
    events_tx: mpsc::Sender<ProbeEvent>,
    inner: Arc<Inner>,
}

struct Inner {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Publisher {
    pub fn new(tsdb_url: &Url, api_key: &str, concurrency: usize) -> anyhow::Result<Publisher> {
        let base = tsdb_url.as_str().trim_end_matches('/').to_string();
        // http/1.1 only: some gateway frontends mishandle h2 POST streams
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).http1_only().build()?;

        let (metrics_tx, metrics_rx) = mpsc::channel(METRICS_IN_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENTS_IN_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::with_capacity(concurrency + 2);
        let mut frame_txs = Vec::with_capacity(concurrency);
        for shard in 0..concurrency {
            let (frame_tx, frame_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
            frame_txs.push(frame_tx);
            tasks.push(tokio::spawn(run_worker(
                client.clone(),
                format!("{base}/metrics"),
                api_key.to_string(),
                format!("metrics[{shard}]"),
                frame_rx,
            )));
        }
        let (events_frame_tx, events_frame_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        tasks.push(tokio::spawn(run_worker(
            client,
            format!("{base}/events"),
            api_key.to_string(),
            "events".to_string(),
            events_frame_rx,
        )));
        tasks.push(tokio::spawn(run_orchestrator(
            metrics_rx,
            events_rx,
            frame_txs,
            events_frame_tx,
            shutdown_rx,
        )));

        Ok(Publisher {
            metrics_tx,
            events_tx,
            inner: Arc::new(Inner { shutdown_tx, tasks: Mutex::new(tasks) }),
        })
    }

    /// Queue metric samples. Blocks only when the large input buffer is
    /// full; samples submitted after shutdown are discarded.
    pub async fn add_metrics(&self, metrics: Vec<MetricData>) {
        for metric in metrics {
            if self.metrics_tx.send(metric).await.is_err() {
                return;
            }
        }
    }

    /// Queue a state-change event. Structurally invalid events are
    /// dropped here so the gateway never sees them.
    pub async fn add_event(&self, event: ProbeEvent) {
        if let Err(err) = event.validate() {
            warn!("discarding event: {err}");
            return;
        }
        let _ = self.events_tx.send(event).await;
    }

    /// Flush buffered data and wait for the workers, up to one minute.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let tasks =
            std::mem::take(&mut *self.inner.tasks.lock().expect("publisher tasks lock poisoned"));
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(STOP_DEADLINE, drain).await.is_err() {
            info!("timed out waiting for publisher to stop");
        }
    }
}

async fn run_orchestrator(
    mut metrics_rx: mpsc::Receiver<MetricData>,
    mut events_rx: mpsc::Receiver<ProbeEvent>,
    frame_txs: Vec<mpsc::Sender<Vec<u8>>>,
    events_frame_tx: mpsc::Sender<Vec<u8>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let concurrency = frame_txs.len();
    let mut buffers: Vec<Vec<MetricData>> =
        (0..concurrency).map(|_| Vec::with_capacity(MAX_METRICS_PER_FLUSH)).collect();
    let mut events: Vec<ProbeEvent> = Vec::with_capacity(MAX_EVENTS_PER_FLUSH);
    let mut key_buf = Vec::new();

    let mut ticker = tokio::time::interval(MAX_FLUSH_WAIT);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(metric) = metrics_rx.recv() => {
                let shard = shard_for(&metric, &mut key_buf, concurrency);
                buffers[shard].push(metric);
                if buffers[shard].len() >= MAX_METRICS_PER_FLUSH {
                    flush_metrics(&mut buffers[shard], &frame_txs[shard]).await;
                }
            }
            Some(event) = events_rx.recv() => {
                events.push(event);
                if events.len() >= MAX_EVENTS_PER_FLUSH {
                    flush_events(&mut events, &events_frame_tx).await;
                }
            }
            _ = ticker.tick() => {
                for shard in 0..concurrency {
                    flush_metrics(&mut buffers[shard], &frame_txs[shard]).await;
                }
                flush_events(&mut events, &events_frame_tx).await;
            }
            _ = shutdown_rx.changed() => {
                // pick up anything still sitting in the input queues,
                // then flush every buffer and let the queues close
                while let Ok(metric) = metrics_rx.try_recv() {
                    let shard = shard_for(&metric, &mut key_buf, concurrency);
                    buffers[shard].push(metric);
                    if buffers[shard].len() >= MAX_METRICS_PER_FLUSH {
                        flush_metrics(&mut buffers[shard], &frame_txs[shard]).await;
                    }
                }
                while let Ok(event) = events_rx.try_recv() {
                    events.push(event);
                    if events.len() >= MAX_EVENTS_PER_FLUSH {
                        flush_events(&mut events, &events_frame_tx).await;
                    }
                }
                for shard in 0..concurrency {
                    flush_metrics(&mut buffers[shard], &frame_txs[shard]).await;
                }
                flush_events(&mut events, &events_frame_tx).await;
                return;
            }
        }
    }
}

fn shard_for(metric: &MetricData, key_buf: &mut Vec<u8>, concurrency: usize) -> usize {
    key_buf.clear();
    metric.key_by_series(key_buf);
    fnv32a(key_buf) as usize % concurrency
}

async fn flush_metrics(buffer: &mut Vec<MetricData>, tx: &mpsc::Sender<Vec<u8>>) {
    if buffer.is_empty() {
        return;
    }
    match msg::create_metrics_frame(buffer) {
        Ok(frame) => {
            let _ = tx.send(frame).await;
        }
        Err(err) => error!("failed to encode metrics frame: {err}"),
    }
    buffer.clear();
}

async fn flush_events(buffer: &mut Vec<ProbeEvent>, tx: &mpsc::Sender<Vec<u8>>) {
    if buffer.is_empty() {
        return;
    }
    match msg::create_events_frame(buffer) {
        Ok(frame) => {
            let _ = tx.send(frame).await;
        }
        Err(err) => error!("failed to encode events frame: {err}"),
    }
    buffer.clear();
}

/// Deliver frames until the queue closes. A frame is retried forever:
/// delivery gives up only when the process does.
async fn run_worker(
    client: reqwest::Client,
    url: String,
    api_key: String,
    label: String,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut backoff =
        Backoff::new(Duration::from_millis(100), Duration::from_secs(60), 1.5, true);
    while let Some(frame) = rx.recv().await {
        let body = msg::compress(&frame);
        loop {
            let started = Instant::now();
            let outcome = client
                .post(&url)
                .header("Content-Type", "rt-metric-binary-snappy")
                .bearer_auth(&api_key)
                .body(body.clone())
                .send()
                .await;
            let took = started.elapsed();
            match outcome {
                Ok(response) if response.status().is_success() => {
                    backoff.reset();
                    debug!(
                        "{label}: sent {} bytes in {took:?} (batch {})",
                        body.len(),
                        msg::correlation_id(&frame).unwrap_or_default()
                    );
                    break;
                }
                Ok(response) => {
                    let delay = backoff.duration();
                    let status = response.status();
                    let detail: String = response
                        .text()
                        .await
                        .unwrap_or_default()
                        .chars()
                        .take(300)
                        .collect();
                    warn!(
                        "{label}: failed to submit: http {status} - {detail}; will try again in {delay:?} (this attempt took {took:?})"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    let delay = backoff.duration();
                    warn!(
                        "{label}: failed to submit: {err}; will try again in {delay:?} (this attempt took {took:?})"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn fnv32a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

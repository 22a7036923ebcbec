//! Control-plane client: a reconnecting socket.io session that turns
//! server events into scheduler mutations.

pub mod socketio;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::models::Check;
use crate::probe::{self, ReadyPayload};
use crate::scheduler::Scheduler;

use socketio::Packet;

/// A session with no refresh for this long is assumed dead.
const MAX_INACTIVITY: Duration = Duration::from_secs(30 * 60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct ControllerConfig {
    pub server_url: String,
    pub api_key: String,
    pub node_name: String,
    pub version: String,
}

pub struct Controller {
    url: Url,
    scheduler: Arc<Scheduler>,
}

enum SessionEnd {
    Disconnected,
    Shutdown,
}

impl Controller {
    pub fn new(config: &ControllerConfig, scheduler: Arc<Scheduler>) -> anyhow::Result<Self> {
        Ok(Self { url: build_url(config)?, scheduler })
    }

    /// The controller URL with the apiKey stripped, safe for logs.
    pub fn address(&self) -> String {
        redacted(&self.url)
    }

    /// Drive the connect/session loop until shutdown or a fatal server
    /// error. A failure to establish the very first session is fatal;
    /// later failures reconnect with jittered backoff.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut first_session = true;
        loop {
            let Some(stream) = self.connect(&mut shutdown, first_session).await? else {
                return Ok(());
            };
            first_session = false;
            match self.session(stream, &mut shutdown).await? {
                SessionEnd::Shutdown => {
                    info!("controller loop exiting");
                    return Ok(());
                }
                SessionEnd::Disconnected => continue,
            }
        }
    }

    async fn connect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        first_session: bool,
    ) -> anyhow::Result<Option<WsStream>> {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, true);
        loop {
            info!("attempting to connect to controller at {}", self.address());
            match connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => {
                    info!("connected to controller");
                    return Ok(Some(stream));
                }
                Err(err) if first_session => {
                    bail!("unable to connect to controller on url {}: {err}", self.address());
                }
                Err(err) => {
                    error!("failed to connect to controller: {err}");
                    let delay = backoff.duration();
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn session(
        &mut self,
        stream: WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<SessionEnd> {
        let (mut sink, mut source) = stream.split();
        let mut ping_period = Duration::from_secs(25);
        let mut next_ping = Instant::now() + ping_period;
        let mut inactivity_deadline = Instant::now() + MAX_INACTIVITY;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = tokio::time::sleep_until(next_ping) => {
                    if sink.send(Message::Text(socketio::PING_FRAME.to_string())).await.is_err() {
                        error!("disconnected from controller");
                        return Ok(SessionEnd::Disconnected);
                    }
                    next_ping = Instant::now() + ping_period;
                }
                _ = tokio::time::sleep_until(inactivity_deadline) => {
                    warn!("no refresh received for maxInactivity time, closing connection to controller");
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Disconnected);
                }
                frame = source.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            error!("controller connection failed: {err}");
                            return Ok(SessionEnd::Disconnected);
                        }
                        None => {
                            error!("disconnected from controller");
                            return Ok(SessionEnd::Disconnected);
                        }
                    };
                    match message {
                        Message::Text(text) => {
                            match socketio::parse(&text) {
                                Ok(Packet::Open(handshake)) => {
                                    debug!(
                                        "controller handshake sid {} (ping every {}ms, timeout {}ms)",
                                        handshake.sid, handshake.ping_interval, handshake.ping_timeout
                                    );
                                    ping_period = Duration::from_millis(handshake.ping_interval);
                                    next_ping = Instant::now() + ping_period;
                                    inactivity_deadline = Instant::now() + MAX_INACTIVITY;
                                }
                                Ok(Packet::Ping) => {
                                    let _ = sink.send(Message::Text(socketio::PONG_FRAME.to_string())).await;
                                    inactivity_deadline = Instant::now() + MAX_INACTIVITY;
                                }
                                Ok(Packet::Pong) | Ok(Packet::Connect) => {
                                    inactivity_deadline = Instant::now() + MAX_INACTIVITY;
                                }
                                Ok(Packet::Close) | Ok(Packet::Disconnect) => {
                                    error!("disconnected from controller");
                                    return Ok(SessionEnd::Disconnected);
                                }
                                Ok(Packet::Event { name, args }) => {
                                    if self.on_event(&name, args)? {
                                        inactivity_deadline = Instant::now() + MAX_INACTIVITY;
                                    }
                                }
                                Ok(Packet::Error(reason)) => {
                                    error!("controller rejected the session: {reason}");
                                    return Ok(SessionEnd::Disconnected);
                                }
                                Ok(Packet::Ack) | Ok(Packet::Unknown(_)) => {}
                                Err(err) => debug!("ignoring unparseable frame: {err}"),
                            }
                        }
                        Message::Ping(payload) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Message::Close(_) => {
                            error!("disconnected from controller");
                            return Ok(SessionEnd::Disconnected);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Apply one server event. Returns whether the event counts as
    /// session activity. A server `error` event is fatal.
    fn on_event(&mut self, name: &str, mut args: Vec<Value>) -> anyhow::Result<bool> {
        let payload = if args.is_empty() { Value::Null } else { args.remove(0) };
        match name {
            "refresh" => {
                debug!("refresh event received");
                match serde_json::from_value::<Vec<Check>>(payload) {
                    Ok(checks) => self.scheduler.refresh(checks),
                    Err(err) => error!("undecodable refresh payload: {err}"),
                }
                Ok(true)
            }
            "created" => {
                self.with_check(payload, |scheduler, check| scheduler.create(check));
                Ok(false)
            }
            "updated" => {
                self.with_check(payload, |scheduler, check| scheduler.update(check));
                Ok(false)
            }
            "removed" => {
                self.with_check(payload, |scheduler, check| scheduler.remove(&check));
                Ok(false)
            }
            "ready" => {
                match serde_json::from_value::<ReadyPayload>(payload) {
                    Ok(ready) => {
                        info!("server sent ready event, probe id {}", ready.collector.id);
                        if let Some(previous) = probe::identity() {
                            if previous.id != ready.collector.id {
                                warn!(
                                    "probe was re-registered, id changed from {} to {}",
                                    previous.id, ready.collector.id
                                );
                            }
                        }
                        probe::set_identity(ready.collector);
                        // carry the socket id on the next reconnect so the
                        // server can resume the session
                        set_query_param(&mut self.url, "lastSocketId", &ready.socket_id);
                    }
                    Err(err) => error!("undecodable ready payload: {err}"),
                }
                Ok(true)
            }
            "error" => {
                let reason = payload.as_str().map(String::from).unwrap_or_else(|| payload.to_string());
                bail!("controller emitted an error: {reason}");
            }
            other => {
                debug!("ignoring unknown event {other:?}");
                Ok(false)
            }
        }
    }

    fn with_check(&self, payload: Value, apply: impl FnOnce(&Scheduler, Check)) {
        match serde_json::from_value::<Check>(payload) {
            Ok(check) => apply(&self.scheduler, check),
            Err(err) => error!("undecodable check payload: {err}"),
        }
    }
}

fn build_url(config: &ControllerConfig) -> anyhow::Result<Url> {
    let mut url = Url::parse(&config.server_url).context("unable to parse server-url")?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => bail!("invalid server-url, scheme must be ws or wss, was {other:?}"),
    }
    url.set_path(&socketio_path(url.path()));
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", "3")
        .append_pair("transport", "websocket")
        .append_pair("apiKey", &config.api_key)
        .append_pair("name", &config.node_name)
        .append_pair("version", &config.version);
    Ok(url)
}

/// Normalize the configured path to end in `/socket.io`.
fn socketio_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.ends_with("/socket.io") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/socket.io")
    }
}

fn set_query_param(url: &mut Url, key: &str, value: &str) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(existing, _)| existing != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (k, v) in &retained {
        pairs.append_pair(k, v);
    }
    pairs.append_pair(key, value);
}

fn redacted(url: &Url) -> String {
    let mut clean = url.clone();
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "apiKey")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut pairs = clean.query_pairs_mut();
    pairs.clear();
    for (k, v) in &retained {
        pairs.append_pair(k, v);
    }
    drop(pairs);
    clean.to_string()
}

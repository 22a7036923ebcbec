mod backoff;
mod checks;
mod config;
mod controller;
mod healthz;
mod models;
mod pinger;
mod probe;
mod publisher;
mod scheduler;

use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, error, info};
use url::Url;

use config::{Config, Flags};
use controller::{Controller, ControllerConfig};
use healthz::Healthz;
use pinger::{IpProtocol, Pinger};
use publisher::Publisher;
use scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    let config = Config::load(&flags)?;

    logger::init_tracing_with_level(config.log_level)
        .ok_or_else(|| anyhow!("unknown log level {}", config.log_level))?;
    config.validate()?;

    if config.stats.enabled {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        debug!("stats instrumentation configured with prefix {}", config.stats_prefix(&hostname));
    }

    let tsdb_url = Url::parse(&config.tsdb_url).context("unable to parse tsdb-url")?;

    let icmp_protocol = match config.icmp_protocol.as_str() {
        "v4" => IpProtocol::V4Only,
        "v6" => IpProtocol::V6Only,
        _ => IpProtocol::Both,
    };

    // raw sockets: a deployment without CAP_NET_RAW dies here, before
    // anything is scheduled
    let pinger = Arc::new(
        Pinger::new(icmp_protocol).context("unable to open raw ICMP sockets")?,
    );
    pinger.start().context("unable to start ICMP engine")?;

    let publisher = Publisher::new(&tsdb_url, &config.api_key, config.concurrency)?;
    let scheduler =
        Scheduler::new(&config.health_hosts, Arc::clone(&pinger), publisher.clone());

    let (shutdown_tx, _) = watch::channel(false);

    let mut health_task =
        tokio::spawn(scheduler::health::run(Arc::clone(&scheduler), shutdown_tx.subscribe()));

    let healthz = Healthz::start(Arc::clone(&scheduler), &config.healthz_listen_addr)?;

    let controller = Controller::new(
        &ControllerConfig {
            server_url: config.server_url.clone(),
            api_key: config.api_key.clone(),
            node_name: config.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        Arc::clone(&scheduler),
    )?;
    let mut controller_task = tokio::spawn(controller.run(shutdown_tx.subscribe()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt"),
        _ = sigterm() => info!("terminated"),
        result = &mut controller_task => match result {
            Ok(Ok(())) => info!("controller loop ended"),
            Ok(Err(err)) => error!("{err:#}"),
            Err(err) => error!("controller task failed: {err}"),
        },
        result = &mut health_task => match result {
            Ok(Ok(())) => info!("health loop ended"),
            Ok(Err(err)) => error!("{err:#}"),
            Err(err) => error!("health task failed: {err}"),
        },
    }

    let _ = shutdown_tx.send(true);
    healthz.stop().await;
    scheduler.close();
    publisher.stop().await;
    pinger.stop().await;
    info!("exiting");
    Ok(())
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await
}

//! Liveness/readiness endpoints.
//!
//! `/alive` answers 200 while the process runs; `/ready` reports 503
//! while the probe considers itself unhealthy. The server runs on its
//! own thread with its own actix system so it stays responsive while
//! the tokio runtime is busy draining at shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpResponse, HttpServer, Responder, get, web};
use anyhow::Context;
use tracing::{error, info};

use crate::scheduler::Scheduler;

pub struct Healthz {
    handle: ServerHandle,
}

impl Healthz {
    pub fn start(scheduler: Arc<Scheduler>, listen_addr: &str) -> anyhow::Result<Self> {
        let addr: SocketAddr =
            listen_addr.parse().context("invalid healthz-listen-addr")?;

        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        thread::Builder::new()
            .name("healthz".to_string())
            .spawn(move || {
                let system = actix_web::rt::System::new();
                system.block_on(async move {
                    let data = web::Data::new(scheduler);
                    let bound = HttpServer::new(move || {
                        App::new().app_data(data.clone()).service(alive).service(ready)
                    })
                    .workers(1)
                    .bind(addr);
                    match bound {
                        Ok(server) => {
                            let server = server.run();
                            let _ = handle_tx.send(Ok(server.handle()));
                            if let Err(err) = server.await {
                                error!("healthz server error: {err}");
                            }
                        }
                        Err(err) => {
                            let _ = handle_tx.send(Err(err));
                        }
                    }
                });
            })
            .context("failed to spawn healthz thread")?;

        let handle = handle_rx
            .recv()
            .context("healthz server did not start")?
            .context("failed to bind healthz listener")?;
        Ok(Self { handle })
    }

    pub async fn stop(&self) {
        self.handle.stop(true).await;
        info!("healthz server closed");
    }
}

#[get("/alive")]
async fn alive() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

#[get("/ready")]
async fn ready(scheduler: web::Data<Arc<Scheduler>>) -> impl Responder {
    if scheduler.is_healthy() {
        HttpResponse::Ok().body("OK")
    } else {
        HttpResponse::ServiceUnavailable().body("Not Ready")
    }
}

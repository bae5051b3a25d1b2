use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tiny_http::{Header, Response, Server};

/// Counters describing the poller itself. Parser gauges live in the same registry.
#[derive(Clone)]
pub struct ExporterMetrics {
    pub cycles: IntCounter,
    pub fetched: IntCounterVec,
    pub dispatched: IntCounterVec,
    pub skipped: IntCounterVec,
    pub dispatch_failures: IntCounterVec,
    pub provider_errors: IntCounterVec,
    pub last_cycle: Gauge,
}

impl ExporterMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let per_sender = |name: &str, help: &str| -> prometheus::Result<IntCounterVec> {
            let c = IntCounterVec::new(Opts::new(name, help), &["sender"])?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let cycles = IntCounter::new("mail_exporter_cycles_total", "Completed polling passes")?;
        registry.register(Box::new(cycles.clone()))?;

        let provider_errors = IntCounterVec::new(
            Opts::new(
                "mail_exporter_provider_errors_total",
                "Failed provider requests",
            ),
            &["sender", "kind"],
        )?;
        registry.register(Box::new(provider_errors.clone()))?;

        let last_cycle = Gauge::new(
            "mail_exporter_last_cycle_timestamp_seconds",
            "Unix time the last polling pass finished",
        )?;
        registry.register(Box::new(last_cycle.clone()))?;

        Ok(Self {
            cycles,
            fetched: per_sender(
                "mail_exporter_messages_fetched_total",
                "Messages retrieved from the provider",
            )?,
            dispatched: per_sender(
                "mail_exporter_messages_dispatched_total",
                "Messages handed to the parser",
            )?,
            skipped: per_sender(
                "mail_exporter_messages_skipped_total",
                "Messages skipped for being older than the poll period",
            )?,
            dispatch_failures: per_sender(
                "mail_exporter_dispatch_failures_total",
                "Messages whose body could not be decoded or parsed",
            )?,
            provider_errors,
            last_cycle,
        })
    }
}

/// Renders the registry in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

/// `GET /metrics` on its own thread until [`shutdown`](Self::shutdown) or drop.
pub struct MetricsServer {
    server: Arc<Server>,
    handle: Option<JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn start(port: u16, registry: Registry) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let server = Arc::new(
            Server::http(addr)
                .map_err(|e| anyhow!("Failed to bind metrics endpoint on {addr}: {e}"))?,
        );
        let addr = server.server_addr();

        let s2 = server.clone();
        let handle = thread::spawn(move || {
            for request in s2.incoming_requests() {
                let path = request.url().split('?').next().unwrap_or("");
                let response = match path {
                    "/metrics" | "/" => match render(&registry) {
                        Ok(body) => {
                            let mut r = Response::from_string(body);
                            if let Ok(h) = Header::from_bytes(
                                &b"Content-Type"[..],
                                TextEncoder::new().format_type().as_bytes(),
                            ) {
                                r = r.with_header(h);
                            }
                            r
                        }
                        Err(e) => {
                            warn!("Could not render metrics: {e}");
                            Response::from_string("internal error").with_status_code(500)
                        }
                    },
                    _ => Response::from_string("not found").with_status_code(404),
                };
                if let Err(e) = request.respond(response) {
                    debug!("Metrics client went away: {e}");
                }
            }
        });

        info!("Metrics endpoint listening on {addr}");
        Ok(Self {
            server,
            handle: Some(handle),
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.server.unblock();
        if handle.join().is_err() {
            warn!("Metrics thread panicked");
        }
        info!("Metrics endpoint stopped");
    }
}

/// Early returns on the startup path still release the port.
impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

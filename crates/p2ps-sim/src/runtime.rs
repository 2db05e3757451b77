//! Wiring of the simulated app and device.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use p2ps_core::harness::LocalPair;
use p2ps_core::{Endpoint, EndpointError, EndpointEvent, LatencySample, Snapshot};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::output::{FlowReport, OutputFormatter};

/// Both endpoints on one in-process broker.
pub struct Runtime {
    pair: LocalPair,
    keepalive_budget: Duration,
    printers: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let (app, device) = config.endpoint_settings()?;
        let api = config.session_api()?;
        match &api {
            Some(_) => info!(base_url = %config.api.base_url, "using HTTP session service"),
            None => info!("using in-process session service"),
        }

        let keepalive_budget = app.keepalive.default_interval * app.keepalive.max_ticks.saturating_add(1);
        let pair = LocalPair::start(app, device, api)
            .await
            .context("failed to start endpoints")?;
        Ok(Self {
            pair,
            keepalive_budget,
            printers: Vec::new(),
        })
    }

    pub fn app(&self) -> &Endpoint {
        &self.pair.app
    }

    pub fn device(&self) -> &Endpoint {
        &self.pair.device
    }

    pub async fn snapshots(&self) -> Vec<Snapshot> {
        vec![self.pair.app.snapshot().await, self.pair.device.snapshot().await]
    }

    /// Print every event of both endpoints as it happens.
    pub fn print_events(&mut self, out: Arc<OutputFormatter>) {
        if out.is_quiet() {
            return;
        }
        for endpoint in [self.pair.app.clone(), self.pair.device.clone()] {
            let mut events = endpoint.events();
            let out = Arc::clone(&out);
            let role = endpoint.role().to_string();
            self.printers.push(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => println!("{}", out.format_event(&role, &event)),
                        Err(broadcast::error::RecvError::Lagged(n)) => debug!(missed = n, "event printer lagged"),
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
    }

    /// Run the automated flow from the app side and collect what both
    /// sides measured.
    pub async fn run_flow(&self, hold: Option<Duration>) -> (FlowReport, Result<(), EndpointError>) {
        let mut app_events = self.pair.app.events();
        let mut device_events = self.pair.device.events();

        let result = self.pair.app.run_automated().await;
        if result.is_ok() {
            if let Some(hold) = hold {
                self.hold(hold, &mut app_events).await;
            }
        }

        let mut latencies = drain_latencies(&mut app_events);
        latencies.extend(drain_latencies(&mut device_events));

        let (session_id, result) = match result {
            Ok(session_id) => (Some(session_id), Ok(())),
            Err(e) => (self.pair.app.current_session_id().await, Err(e)),
        };
        let report = FlowReport {
            session_id,
            connected: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
            latencies,
            endpoints: self.snapshots().await,
        };
        (report, result)
    }

    /// Keep the session up for `hold` or until the app's keepalive budget
    /// is spent, whichever comes first, then close it.
    async fn hold(&self, hold: Duration, events: &mut broadcast::Receiver<EndpointEvent>) {
        let wait = hold.min(self.keepalive_budget);
        let stopped = async {
            loop {
                match events.recv().await {
                    Ok(EndpointEvent::KeepaliveStopped { .. }) | Err(broadcast::error::RecvError::Closed) => return,
                    _ => {}
                }
            }
        };
        if tokio::time::timeout(wait, stopped).await.is_err() {
            debug!(wait_ms = wait.as_millis() as u64, "hold elapsed");
        }
        if let Err(e) = self.pair.app.end_session("simulation finished").await {
            debug!(error = %e, "session already ended");
        }
        // let the device see the bye
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for printer in &self.printers {
            printer.abort();
        }
    }
}

fn drain_latencies(events: &mut broadcast::Receiver<EndpointEvent>) -> Vec<LatencySample> {
    let mut samples = Vec::new();
    loop {
        match events.try_recv() {
            Ok(EndpointEvent::Latency { sample, .. }) => samples.push(sample),
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    samples
}

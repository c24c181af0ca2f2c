//! Sweep scheduling and the transport seam.
//!
//! The scheduler owns the only lock around the subnet context and holds it
//! for a whole sweep cycle: decision, probes, finish and downstream
//! programming. Probes go out concurrently, bounded by `max_wire_smps`.

use crate::discovery::{ProbeOutcome, ProbeRequest};
use crate::error::{SmError, SmResult};
use crate::plugin::{ForwardingTable, InstallError};
use crate::subnet::Subnet;
use crate::sweep::{LidUpdate, SweepReport};
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Sends probes and programs ports and switches.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn probe(&self, request: &ProbeRequest) -> ProbeOutcome;

    async fn program_lid(&self, update: &LidUpdate) -> Result<(), InstallError>;

    async fn install_forwarding(&self, table: &ForwardingTable) -> Result<(), InstallError>;
}

/// Current time on the tokio clock, so paused test time drives the sweep
/// controller too.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

pub struct SweepScheduler {
    subnet: Arc<Mutex<Subnet>>,
    transport: Arc<dyn ProbeTransport>,
    wake: Arc<Notify>,
    poll_period: Duration,
    reports: Option<mpsc::UnboundedSender<SweepReport>>,
}

impl SweepScheduler {
    pub fn new(subnet: Arc<Mutex<Subnet>>, transport: Arc<dyn ProbeTransport>) -> Self {
        Self {
            subnet,
            transport,
            wake: Arc::new(Notify::new()),
            poll_period: DEFAULT_POLL_PERIOD,
            reports: None,
        }
    }

    /// How often the sweep controller is consulted between wake-ups.
    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    /// Reports of cycles run by [`SweepScheduler::run`] are sent here.
    pub fn with_report_channel(mut self, tx: mpsc::UnboundedSender<SweepReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub fn subnet(&self) -> Arc<Mutex<Subnet>> {
        self.subnet.clone()
    }

    /// Runs the next cycle without waiting for the poll period.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Runs one sweep cycle. Returns `None` when the controller decided
    /// there was nothing to do.
    pub async fn run_cycle(&self) -> SmResult<Option<SweepReport>> {
        self.run_cycle_until(&CancellationToken::new()).await
    }

    /// Runs one sweep cycle that stops probing once `cancel` fires. The
    /// sweep is then aborted and its report comes back with `aborted` set.
    #[instrument(skip_all, level = "debug")]
    pub async fn run_cycle_until(&self, cancel: &CancellationToken) -> SmResult<Option<SweepReport>> {
        let mut subnet = self.subnet.lock().await;
        let Some(start) = subnet.begin_sweep(now())? else {
            return Ok(None);
        };
        let max_in_flight = usize::try_from(subnet.options().max_wire_smps.max(1)).unwrap_or(1);
        let timeout = subnet.options().transaction_timeout();

        let mut queue: VecDeque<ProbeRequest> = start.requests.into();
        let mut in_flight = FuturesUnordered::new();
        loop {
            while in_flight.len() < max_in_flight {
                let Some(request) = queue.pop_front() else { break };
                let transport = self.transport.clone();
                in_flight.push(async move {
                    let outcome = tokio::time::timeout(timeout, transport.probe(&request))
                        .await
                        .unwrap_or(ProbeOutcome::Timeout);
                    (request, outcome)
                });
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    subnet.abort_sweep();
                    break;
                }
                next = in_flight.next() => next,
            };
            let Some((request, outcome)) = next else { break };
            let follow_up = subnet.on_probe_result(&request, outcome, now());
            queue.extend(follow_up);
        }

        let Some(mut report) = subnet.finish_sweep(now()) else {
            return Ok(None);
        };

        let transport = &self.transport;
        let lid_results = join_all(report.lid_updates.iter().map(|update| async move {
            (*update, transport.program_lid(update).await)
        }))
        .await;
        let table_results = join_all(report.forwarding.iter().map(|table| async move {
            (table.clone(), transport.install_forwarding(table).await)
        }))
        .await;
        debug!(
            lids = lid_results.len(),
            tables = table_results.len(),
            "downstream programming done"
        );
        subnet.complete_programming(&mut report, lid_results, table_results);
        Ok(Some(report))
    }

    /// Ages peers and runs sweep cycles until cancelled or a fatal desync
    /// asks the process to exit.
    pub async fn run(&self, cancel: CancellationToken) -> SmResult<()> {
        let mut ticker = tokio::time::interval(self.poll_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll_ms = self.poll_period.as_millis() as u64, "sweep scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("sweep scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            {
                let mut subnet = self.subnet.lock().await;
                if let Err(e) = subnet.age_peers(now()) {
                    warn!(error = %e, "peer aging failed");
                }
            }

            let report = match self.run_cycle_until(&cancel).await {
                Ok(Some(report)) => report,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "sweep cycle failed");
                    continue;
                }
            };
            debug!(sweep_id = report.sweep_id, kind = ?report.kind(), clean = report.is_clean(), "cycle done");
            let fatal = report.fatal_reason();
            let sweep_id = report.sweep_id;
            if let Some(tx) = &self.reports {
                // A dropped receiver only loses reports.
                let _ = tx.send(report);
            }
            if let Some(reason) = fatal {
                error!(sweep_id, reason = reason.as_str(), "exiting on fatal desync");
                return Err(SmError::FatalTopologyDesync { reason });
            }
        }
        Ok(())
    }
}

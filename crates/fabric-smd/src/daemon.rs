//! Daemon orchestration: builds the subnet context from configuration,
//! drives the sweep scheduler and persists LID bindings.

use crate::config_file::SmdConfig;
use crate::error::{Result, SmdError};
use crate::guid2lid::Guid2LidStore;
use fabric_sm_core::{
    ProbeTransport, SimulatedFabric, SmError, Subnet, SweepKind, SweepReport, SweepScheduler,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Loads a simulated fabric from a JSON topology file.
pub fn load_topology(path: &Path) -> Result<SimulatedFabric> {
    let content = fs::read_to_string(path)
        .map_err(|e| SmdError::Topology(format!("{}: {}", path.display(), e)))?;
    SimulatedFabric::from_json(&content)
        .map_err(|e| SmdError::Topology(format!("{}: {}", path.display(), e)))
}

pub struct SmDaemon {
    subnet: Arc<Mutex<Subnet>>,
    scheduler: SweepScheduler,
    store: Guid2LidStore,
    reports: mpsc::UnboundedReceiver<SweepReport>,
    max_once_cycles: u32,
}

impl SmDaemon {
    /// Validates the configuration, seeds persisted bindings when they are
    /// honored, and activates the manager.
    pub fn new(config: &SmdConfig, transport: Arc<dyn ProbeTransport>) -> Result<Self> {
        config.validate()?;
        let store = Guid2LidStore::new(&config.daemon.guid2lid_file);

        let mut subnet = Subnet::new(config.subnet.clone())?;
        info!(
            routing_engine = config.subnet.routing_engine.as_str(),
            "forwarding tables are left to an external routing engine"
        );
        if config.subnet.honor_guid2lid_file {
            let saved = store.load()?;
            info!(bindings = saved.len(), "honoring persisted LIDs");
            subnet.seed_lid_bindings(saved);
        }
        subnet.activate()?;

        let subnet = Arc::new(Mutex::new(subnet));
        let (tx, reports) = mpsc::unbounded_channel();
        let scheduler = SweepScheduler::new(subnet.clone(), transport)
            .with_poll_period(config.poll_period())
            .with_report_channel(tx);

        Ok(Self {
            subnet,
            scheduler,
            store,
            reports,
            max_once_cycles: config.daemon.max_once_cycles,
        })
    }

    pub fn subnet(&self) -> Arc<Mutex<Subnet>> {
        self.subnet.clone()
    }

    /// Runs cycles until the controller has nothing left to do, bounded by
    /// `max_once_cycles`. Returns the reports of the cycles that swept.
    pub async fn run_once(&mut self) -> Result<Vec<SweepReport>> {
        let mut reports = Vec::new();
        for _ in 0..self.max_once_cycles {
            let Some(report) = self.scheduler.run_cycle().await? else {
                break;
            };
            persist(&self.subnet, &self.store, &report).await?;
            if let Some(reason) = report.fatal_reason() {
                return Err(SmError::FatalTopologyDesync { reason }.into());
            }
            let settled = report.kind() == SweepKind::Heavy && report.is_clean();
            reports.push(report);
            let subnet = self.subnet.lock().await;
            if settled && subnet.next_decision(tokio::time::Instant::now().into_std()).is_idle() {
                break;
            }
        }
        Ok(reports)
    }

    /// Runs the scheduler until cancelled or a fatal desync.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let run = self.scheduler.run(cancel);
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => {
                    while let Ok(report) = self.reports.try_recv() {
                        self.persist_logged(&report).await;
                    }
                    return result.map_err(SmdError::from);
                }
                Some(report) = self.reports.recv() => {
                    self.persist_logged(&report).await;
                }
            }
        }
    }

    /// A failed save is retried after the next heavy sweep.
    async fn persist_logged(&self, report: &SweepReport) {
        if let Err(e) = persist(&self.subnet, &self.store, report).await {
            warn!(error = %e, sweep_id = report.sweep_id, "failed to persist LID bindings");
        }
    }
}

/// Saves the current bindings after a heavy sweep that assigned addresses.
async fn persist(subnet: &Mutex<Subnet>, store: &Guid2LidStore, report: &SweepReport) -> Result<()> {
    let assigned = report.kind() == SweepKind::Heavy
        && report.decision.assign_addresses
        && !report.degraded
        && !report.aborted;
    if !assigned {
        return Ok(());
    }
    let bindings = subnet.lock().await.lid_bindings();
    store.save(bindings)
}

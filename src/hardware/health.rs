//! Health Monitor
//!
//! Periodically scans disks through the [`DiskProbe`] port, applies the
//! samples to the inventory and classifies each disk against configured
//! thresholds. Status transitions are recorded as [`HealthEvent`]s; disks
//! that start failing or disappear are handed to the RAID engine as
//! membership loss.
//!
//! FAILED is sticky: a disk that once failed stays failed even if its
//! counters later look better.

use crate::config::HealthConfig;
use crate::domain::events::{EventBus, StorageEvent};
use crate::domain::ports::DiskProbe;
use crate::domain::types::DiskId;
use crate::error::Result;
use crate::hardware::inventory::{DiskHealth, DiskInventory, HealthSample};
use crate::raid::RaidEngine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Health Events
// =============================================================================

/// Severity of a health event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl From<DiskHealth> for Severity {
    fn from(health: DiskHealth) -> Self {
        match health {
            DiskHealth::Healthy => Severity::Info,
            DiskHealth::Warning => Severity::Warning,
            DiskHealth::Failing | DiskHealth::Failed | DiskHealth::Missing => Severity::Critical,
        }
    }
}

/// A recorded disk health transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub disk: DiskId,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub from: DiskHealth,
    pub to: DiskHealth,
    pub message: String,
}

/// Result of one polling cycle
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    pub discovered: usize,
    pub disappeared: usize,
    pub transitions: usize,
}

// =============================================================================
// Threshold Evaluation
// =============================================================================

/// Classify a sample; returns the status and the thresholds that tripped
pub fn evaluate(sample: &HealthSample, config: &HealthConfig) -> (DiskHealth, Vec<String>) {
    let mut failed = Vec::new();
    let mut failing = Vec::new();
    let mut warning = Vec::new();

    if config.io_error_failure_count > 0 && sample.io_errors >= config.io_error_failure_count {
        failed.push(format!("{} uncorrectable I/O errors", sample.io_errors));
    }

    if sample.predictive_failure {
        failing.push("drive predicts failure".to_string());
    }

    if let Some(temp) = sample.temperature_celsius {
        if temp >= config.temperature_critical_celsius {
            failing.push(format!("temperature {}C", temp));
        } else if temp >= config.temperature_warning_celsius {
            warning.push(format!("temperature {}C", temp));
        }
    }

    for (what, value, warn_at, crit_at) in [
        (
            "reallocated sectors",
            sample.reallocated_sectors,
            config.reallocated_sectors_warning,
            config.reallocated_sectors_critical,
        ),
        (
            "pending sectors",
            sample.pending_sectors,
            config.pending_sectors_warning,
            config.pending_sectors_critical,
        ),
    ] {
        if crit_at > 0 && value >= crit_at {
            failing.push(format!("{} {}", value, what));
        } else if warn_at > 0 && value >= warn_at {
            warning.push(format!("{} {}", value, what));
        }
    }

    if !failed.is_empty() {
        (DiskHealth::Failed, failed)
    } else if !failing.is_empty() {
        (DiskHealth::Failing, failing)
    } else if !warning.is_empty() {
        (DiskHealth::Warning, warning)
    } else {
        (DiskHealth::Healthy, Vec::new())
    }
}

// =============================================================================
// Health Monitor
// =============================================================================

/// Polls disk health and reacts to degradation
pub struct HealthMonitor {
    config: HealthConfig,
    probe: Arc<dyn DiskProbe>,
    inventory: Arc<DiskInventory>,
    raid: Arc<RaidEngine>,
    events: EventBus,
    log: Mutex<VecDeque<HealthEvent>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("probe", &self.probe.name())
            .field("events", &self.log.lock().len())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        probe: Arc<dyn DiskProbe>,
        inventory: Arc<DiskInventory>,
        raid: Arc<RaidEngine>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            probe,
            inventory,
            raid,
            events,
            log: Mutex::new(VecDeque::new()),
        })
    }

    /// Run the polling loop until `shutdown` is cancelled
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                "Health monitor started (probe {}, every {:?})",
                monitor.probe.name(),
                monitor.config.poll_interval()
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.poll_once().await {
                            warn!("Health poll failed: {}", e);
                        }
                    }
                }
            }

            info!("Health monitor stopped");
        })
    }

    /// Scan once and act on every change
    pub async fn poll_once(&self) -> Result<PollReport> {
        let samples = self.probe.scan().await?;
        let scan = self.inventory.apply_scan(samples);

        let mut report = PollReport {
            discovered: scan.discovered.len(),
            disappeared: scan.disappeared.len(),
            transitions: 0,
        };

        for id in &scan.disappeared {
            let previous = self
                .inventory
                .get_disk(id)
                .map(|d| d.health)
                .unwrap_or(DiskHealth::Healthy);
            self.record(id, previous, DiskHealth::Missing, "disk disappeared".into());
            report.transitions += 1;
            if let Err(e) = self.raid.handle_disk_missing(id) {
                error!("Could not handle missing disk {}: {}", id, e);
            }
        }

        let seen: BTreeSet<&DiskId> = scan
            .discovered
            .iter()
            .chain(&scan.refreshed)
            .chain(&scan.reappeared)
            .collect();

        for id in seen {
            match self.check_disk(id) {
                Ok(true) => report.transitions += 1,
                Ok(false) => {}
                Err(e) => warn!("Health check of disk {} failed: {}", id, e),
            }
        }

        debug!(
            "Health poll: {} discovered, {} disappeared, {} transition(s)",
            report.discovered, report.disappeared, report.transitions
        );
        Ok(report)
    }

    /// Evaluate one disk; returns whether its status changed
    fn check_disk(&self, id: &DiskId) -> Result<bool> {
        let disk = self.inventory.get_disk(id)?;
        if disk.health == DiskHealth::Failed {
            return Ok(false);
        }

        let (next, reasons) = evaluate(&disk.sample, &self.config);
        if next == disk.health {
            return Ok(false);
        }

        let previous = self.inventory.set_health(id, next)?;
        let message = if reasons.is_empty() {
            "all thresholds clear".to_string()
        } else {
            reasons.join(", ")
        };
        self.record(id, previous, next, message);

        if next.is_lost() && !previous.is_lost() {
            self.raid.handle_member_failure(id)?;
        }
        Ok(true)
    }

    fn record(&self, disk: &DiskId, from: DiskHealth, to: DiskHealth, message: String) {
        let event = HealthEvent {
            disk: disk.clone(),
            severity: Severity::from(to),
            timestamp: Utc::now(),
            from,
            to,
            message,
        };

        match event.severity {
            Severity::Critical => warn!("Disk {} is {}: {}", disk, to, event.message),
            _ => info!("Disk {} is {}: {}", disk, to, event.message),
        }

        {
            let mut log = self.log.lock();
            log.push_back(event.clone());
            while log.len() > self.config.event_retention.max(1) {
                log.pop_front();
            }
        }
        self.events.publish(StorageEvent::Health(event));
    }

    /// Recorded health events, oldest first
    pub fn get_health_events(&self, since: Option<DateTime<Utc>>) -> Vec<HealthEvent> {
        self.log
            .lock()
            .iter()
            .filter(|e| since.map_or(true, |since| e.timestamp >= since))
            .cloned()
            .collect()
    }
}

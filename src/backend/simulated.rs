//! Simulated Storage Backend
//!
//! Performs every operation as a sequence of timed steps with a checkpoint
//! after each one. Failures can be scripted per task kind and a task kind
//! can be held at its first checkpoint, which makes interleavings
//! reproducible in tests and in the daemon's demo mode.

use crate::domain::ports::StorageBackend;
use crate::domain::types::{DiskId, GroupId, PoolId, TaskId, VolumeId};
use crate::error::{Error, Result};
use crate::scheduler::{TaskContext, TaskKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Step layout of simulated operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedBackendConfig {
    /// Checkpointed steps per operation
    pub steps: u64,
    /// Delay before each step
    pub step_delay_ms: u64,
}

impl Default for SimulatedBackendConfig {
    fn default() -> Self {
        Self {
            steps: 20,
            step_delay_ms: 100,
        }
    }
}

/// Scripted behavior of the next attempt of a task kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    /// Fail with a retryable I/O error after the first step
    Transient,
    /// Fail permanently after the first step
    Permanent,
    /// Stall forever after the first step
    Hang,
}

/// Backend that simulates long-running I/O
pub struct SimulatedBackend {
    config: SimulatedBackendConfig,
    scripts: Mutex<HashMap<TaskKind, VecDeque<Scripted>>>,
    /// Kinds currently held at their first checkpoint
    held: watch::Sender<HashSet<TaskKind>>,
    /// Number of attempts that reached their first checkpoint, per kind
    arrivals: watch::Sender<HashMap<TaskKind, usize>>,
    executed: Mutex<Vec<(TaskKind, TaskId)>>,
    steps_run: Mutex<HashMap<TaskKind, u64>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    attempts: AtomicU64,
}

impl std::fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("config", &self.config)
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(SimulatedBackendConfig::default())
    }
}

impl SimulatedBackend {
    pub fn new(config: SimulatedBackendConfig) -> Self {
        let (held, _) = watch::channel(HashSet::new());
        let (arrivals, _) = watch::channel(HashMap::new());
        Self {
            config,
            scripts: Mutex::new(HashMap::new()),
            held,
            arrivals,
            executed: Mutex::new(Vec::new()),
            steps_run: Mutex::new(HashMap::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            attempts: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Script the behavior of the next attempt of `kind`
    pub fn fail_next(&self, kind: TaskKind, behavior: Scripted) {
        self.scripts
            .lock()
            .entry(kind)
            .or_default()
            .push_back(behavior);
    }

    /// Hold every attempt of `kind` at its first checkpoint
    pub fn hold(&self, kind: TaskKind) {
        self.held.send_modify(|held| {
            held.insert(kind);
        });
    }

    /// Let held attempts of `kind` continue
    pub fn release(&self, kind: TaskKind) {
        self.held.send_modify(|held| {
            held.remove(&kind);
        });
    }

    /// Wait until `count` attempts of `kind` reached their first checkpoint
    pub async fn wait_for_arrivals(&self, kind: TaskKind, count: usize) {
        let mut rx = self.arrivals.subscribe();
        let _ = rx
            .wait_for(|arrivals| arrivals.get(&kind).copied().unwrap_or(0) >= count)
            .await;
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Tasks of `kind` in the order their attempts started
    pub fn executed(&self, kind: TaskKind) -> Vec<TaskId> {
        self.executed
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Steps completed for `kind` across all attempts
    pub fn steps_run(&self, kind: TaskKind) -> u64 {
        self.steps_run.lock().get(&kind).copied().unwrap_or(0)
    }

    /// Highest number of attempts observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn run(&self, what: String, ctx: &TaskContext) -> Result<()> {
        let kind = ctx.kind();
        let _running = RunningGuard::enter(self);
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.executed.lock().push((kind, ctx.task_id()));

        let mut script = self
            .scripts
            .lock()
            .get_mut(&kind)
            .and_then(|queue| queue.pop_front());

        let steps = self.config.steps.max(1);
        let first = ctx.resume_from().map_or(1, |step| step + 1);
        debug!("Simulating {} (steps {}..={})", what, first, steps);

        for step in first..=steps {
            tokio::time::sleep(Duration::from_millis(self.config.step_delay_ms)).await;
            ctx.checkpoint(step, step as f64 / steps as f64).await?;
            *self.steps_run.lock().entry(kind).or_default() += 1;

            if step != first {
                continue;
            }

            self.arrivals.send_modify(|arrivals| {
                *arrivals.entry(kind).or_default() += 1;
            });
            self.wait_released(kind, ctx).await;
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match script.take() {
                Some(Scripted::Transient) => {
                    return Err(Error::TransientIo {
                        operation: what,
                        reason: "simulated medium error".into(),
                    })
                }
                Some(Scripted::Permanent) => {
                    return Err(Error::Backend {
                        operation: what,
                        reason: "simulated device fault".into(),
                    })
                }
                Some(Scripted::Hang) => std::future::pending::<()>().await,
                None => {}
            }
        }

        Ok(())
    }

    async fn wait_released(&self, kind: TaskKind, ctx: &TaskContext) {
        let mut rx = self.held.subscribe();
        tokio::select! {
            _ = rx.wait_for(|held| !held.contains(&kind)) => {}
            _ = ctx.cancelled() => {}
        }
    }
}

/// Tracks concurrently running attempts
struct RunningGuard<'a> {
    backend: &'a SimulatedBackend,
}

impl<'a> RunningGuard<'a> {
    fn enter(backend: &'a SimulatedBackend) -> Self {
        let now = backend.running.fetch_add(1, Ordering::SeqCst) + 1;
        backend.peak.fetch_max(now, Ordering::SeqCst);
        Self { backend }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.backend.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn initialize_pool(&self, pool: &PoolId, groups: &[GroupId], ctx: &TaskContext)
        -> Result<()> {
        self.run(format!("initialize pool {} over {} group(s)", pool, groups.len()), ctx)
            .await
    }

    async fn expand_pool(&self, pool: &PoolId, groups: &[GroupId], ctx: &TaskContext) -> Result<()> {
        self.run(format!("expand pool {} by {} group(s)", pool, groups.len()), ctx)
            .await
    }

    async fn rebuild_member(
        &self,
        group: &GroupId,
        slot: usize,
        disk: &DiskId,
        ctx: &TaskContext,
    ) -> Result<()> {
        self.run(format!("rebuild {} slot {} onto {}", group, slot, disk), ctx)
            .await
    }

    async fn scrub_group(&self, group: &GroupId, ctx: &TaskContext) -> Result<()> {
        self.run(format!("scrub {}", group), ctx).await
    }

    async fn format_volume(
        &self,
        volume: &VolumeId,
        pool: &PoolId,
        size_bytes: u64,
        ctx: &TaskContext,
    ) -> Result<()> {
        self.run(
            format!("format {} ({} bytes) in {}", volume, size_bytes, pool),
            ctx,
        )
        .await
    }

    async fn resize_volume(
        &self,
        volume: &VolumeId,
        pool: &PoolId,
        from_bytes: u64,
        to_bytes: u64,
        ctx: &TaskContext,
    ) -> Result<()> {
        self.run(
            format!("resize {} in {} from {} to {}", volume, pool, from_bytes, to_bytes),
            ctx,
        )
        .await
    }

    async fn destroy_volume(&self, volume: &VolumeId, pool: &PoolId, ctx: &TaskContext)
        -> Result<()> {
        self.run(format!("destroy {} in {}", volume, pool), ctx).await
    }
}

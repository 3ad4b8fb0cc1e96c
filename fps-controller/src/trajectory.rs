//! # trajectory
//!
//! Time-parameterised moves for the whole array: validation, chunked
//! upload, per-axis receipt confirmation, start (broadcast or hardware
//! sync line), completion monitoring and the abort path.
//!
//! A trajectory maps positioner ids to two waypoint sequences, one per
//! axis. Points are `(angle_degrees, time_seconds)`; on the wire each
//! point becomes a signed step count plus a millisecond timestamp in one
//! 8-byte frame.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::config::SafeMode;
use crate::error::{FpsError, Result};
use crate::fps::Fps;
use crate::positioner::Positioner;
use crate::registry::CommandRegistry;

/// Extra wait beyond the nominal path duration before the monitor gives
/// up.
const MONITOR_SLACK: Duration = Duration::from_secs(5);

/// Monitor poll period while a trajectory is running.
const MONITOR_PERIOD: Duration = Duration::from_millis(200);

/// Window for the trajectory-received bits after DATA_END.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(3);

// ── Sync line ─────────────────────────────────────────────────────────────────

/// External hardware signal that starts all pre-loaded trajectories
/// simultaneously. When a trajectory is started over the sync line, no
/// START_TRAJECTORY broadcast is sent.
#[async_trait]
pub trait SyncLine: Send + Sync {
    async fn fire(&self) -> Result<()>;
}

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPoint {
    /// Degrees.
    pub angle: f64,
    /// Seconds from trajectory start.
    pub time: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PathPair {
    pub alpha: Vec<TrajectoryPoint>,
    pub beta: Vec<TrajectoryPoint>,
}

impl PathPair {
    fn end_time(&self) -> f64 {
        self.alpha
            .last()
            .map(|p| p.time)
            .unwrap_or(0.0)
            .max(self.beta.last().map(|p| p.time).unwrap_or(0.0))
    }

    fn final_angles(&self) -> Option<(f64, f64)> {
        Some((self.alpha.last()?.angle, self.beta.last()?.angle))
    }
}

/// A whole-array trajectory.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    paths: BTreeMap<u16, PathPair>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one positioner's path pair from `(angle, time)` tuples.
    pub fn insert<A, B>(&mut self, positioner_id: u16, alpha: A, beta: B)
    where
        A: IntoIterator<Item = (f64, f64)>,
        B: IntoIterator<Item = (f64, f64)>,
    {
        let collect = |points: &mut Vec<TrajectoryPoint>, source: &mut dyn Iterator<Item = (f64, f64)>| {
            points.extend(source.map(|(angle, time)| TrajectoryPoint { angle, time }));
        };
        let mut pair = PathPair::default();
        collect(&mut pair.alpha, &mut alpha.into_iter());
        collect(&mut pair.beta, &mut beta.into_iter());
        self.paths.insert(positioner_id, pair);
    }

    pub fn positioner_ids(&self) -> Vec<u16> {
        self.paths.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Nominal duration: the latest end time over all paths, seconds.
    pub fn duration(&self) -> f64 {
        self.paths.values().map(PathPair::end_time).fold(0.0, f64::max)
    }

    /// Check every invariant before a single frame is sent: positioners
    /// known and enabled, times strictly increasing, axis start/end times
    /// identical, angles in range, beta above the safe-mode floor.
    pub fn validate(
        &self,
        positioners: &BTreeMap<u16, Arc<Positioner>>,
        safe_mode: SafeMode,
    ) -> Result<()> {
        if self.is_empty() {
            return Err(FpsError::Validation("trajectory is empty".into()));
        }

        for (pid, pair) in &self.paths {
            let positioner = positioners.get(pid).ok_or_else(|| {
                FpsError::Validation(format!("positioner_id={pid} is unknown"))
            })?;
            if positioner.disabled() {
                return Err(FpsError::Validation(format!("positioner_id={pid} is disabled")));
            }

            for (axis, points) in [("alpha", &pair.alpha), ("beta", &pair.beta)] {
                if points.is_empty() {
                    return Err(FpsError::Validation(format!(
                        "positioner_id={pid}: {axis} path is empty"
                    )));
                }
                for window in points.windows(2) {
                    if window[1].time <= window[0].time {
                        return Err(FpsError::Validation(format!(
                            "positioner_id={pid}: {axis} times are not strictly increasing"
                        )));
                    }
                }
                for point in points {
                    if point.time < 0.0 {
                        return Err(FpsError::Validation(format!(
                            "positioner_id={pid}: {axis} time {} is negative",
                            point.time
                        )));
                    }
                    if !(0.0..360.0).contains(&point.angle) {
                        return Err(FpsError::Validation(format!(
                            "positioner_id={pid}: {axis}={} out of range [0, 360)",
                            point.angle
                        )));
                    }
                }
            }

            let (a_first, a_last) = (pair.alpha[0].time, pair.alpha[pair.alpha.len() - 1].time);
            let (b_first, b_last) = (pair.beta[0].time, pair.beta[pair.beta.len() - 1].time);
            if (a_first - b_first).abs() > 1e-6 || (a_last - b_last).abs() > 1e-6 {
                return Err(FpsError::Validation(format!(
                    "positioner_id={pid}: alpha and beta paths must share start and end times"
                )));
            }

            if let Some(min_beta) = safe_mode.min_beta() {
                if let Some(point) = pair.beta.iter().find(|p| p.angle < min_beta) {
                    return Err(FpsError::Validation(format!(
                        "safe mode is on: positioner_id={pid} beta dips to {} \
                         (minimum {min_beta})",
                        point.angle
                    )));
                }
            }
        }
        Ok(())
    }
}

// ── Upload ────────────────────────────────────────────────────────────────────

async fn upload_path(
    registry: Arc<CommandRegistry>,
    positioner_id: u16,
    pair: PathPair,
    motor_steps: u32,
) -> Result<()> {
    let announce = Command::send_new_trajectory(
        positioner_id,
        pair.alpha.len() as u32,
        pair.beta.len() as u32,
    );
    registry.send(announce).await?[0].accepted()?;

    // Alpha points first, then beta; the device splits on the announced
    // counts. One point per frame.
    for point in pair.alpha.iter().chain(pair.beta.iter()) {
        let time_ms = (point.time * 1000.0).round() as u32;
        let cmd = Command::send_trajectory_data(positioner_id, point.angle, time_ms, motor_steps);
        registry.send(cmd).await?[0].accepted()?;
    }

    registry.send(Command::trajectory_data_end(positioner_id)).await?[0].accepted()?;
    debug!(
        "trajectory: positioner {positioner_id} uploaded ({} + {} points)",
        pair.alpha.len(),
        pair.beta.len()
    );
    Ok(())
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Upload, start and monitor a trajectory. See the module docs for the
/// protocol; on any failure the abort path (STOP_TRAJECTORY broadcast)
/// runs before the error is surfaced.
pub(crate) async fn send_trajectory(
    fps: &Fps,
    trajectory: Trajectory,
    use_sync_line: bool,
) -> Result<()> {
    // 1. Validate before any frame is sent.
    {
        let positioners = fps.positioners.read().unwrap();
        trajectory.validate(&positioners, fps.config.safe_mode)?;
    }

    // 2. One trajectory at a time, array-wide.
    let _guard = fps.trajectory_lock.try_lock().map_err(|_| FpsError::Trajectory {
        failed: BTreeSet::new(),
        message: "a trajectory is already running".into(),
    })?;

    let pollers_were_running = fps.pollers.running();
    if pollers_were_running {
        fps.pollers.stop().await;
    }

    let result = run_trajectory(fps, &trajectory, use_sync_line).await;

    if pollers_were_running {
        fps.pollers.start();
    }
    result
}

async fn run_trajectory(fps: &Fps, trajectory: &Trajectory, use_sync_line: bool) -> Result<()> {
    let participants = trajectory.positioner_ids();
    let motor_steps = fps.config.positioner.motor_steps;
    let duration = trajectory.duration();
    info!(
        "trajectory: {} positioner(s), {:.1}s nominal duration",
        participants.len(),
        duration
    );

    // 3. Chunked upload, concurrently across positioners. The underlying
    // channel keeps each positioner's frames in submission order.
    let mut uploads = JoinSet::new();
    for (&pid, pair) in &trajectory.paths {
        let registry = fps.registry.clone();
        let pair = pair.clone();
        uploads.spawn(async move { (pid, upload_path(registry, pid, pair, motor_steps).await) });
    }
    let mut failed = BTreeSet::new();
    while let Some(joined) = uploads.join_next().await {
        match joined {
            Ok((pid, Err(e))) => {
                warn!("trajectory: upload to positioner {pid} failed: {e}");
                failed.insert(pid);
            }
            Ok((_, Ok(()))) => {}
            Err(e) => warn!("trajectory: upload task panicked: {e}"),
        }
    }
    if !failed.is_empty() {
        return abort(fps, failed, "trajectory upload failed").await;
    }

    // 4. Every participant must report both axis trajectories received.
    let receipt_deadline = Instant::now() + RECEIPT_TIMEOUT;
    loop {
        let _ = fps.update_status().await;
        let missing: BTreeSet<u16> = participants
            .iter()
            .copied()
            .filter(|&pid| {
                fps.positioner(pid)
                    .map(|p| !p.status().trajectory_received())
                    .unwrap_or(true)
            })
            .collect();
        if missing.is_empty() {
            break;
        }
        if Instant::now() >= receipt_deadline {
            return abort(fps, missing, "trajectory data end was not confirmed").await;
        }
        tokio::time::sleep(MONITOR_PERIOD).await;
    }

    // 5. Start: hardware sync line, or a START_TRAJECTORY broadcast.
    if use_sync_line {
        let Some(line) = fps.sync_line() else {
            return abort(fps, BTreeSet::new(), "no sync line is configured").await;
        };
        info!("trajectory: starting over the sync line");
        if let Err(e) = line.fire().await {
            return abort(fps, BTreeSet::new(), &format!("sync line failed: {e}")).await;
        }
    } else {
        info!("trajectory: starting via broadcast");
        let start = Command::start_trajectory(fps.active_positioner_ids());
        let outcome = fps.registry.submit(start).await;
        if let Some(e) = outcome.error {
            return abort(fps, BTreeSet::new(), &format!("start broadcast failed: {e}")).await;
        }
    }

    // 6. Monitor until every participant reports displacement completed,
    // surfacing collisions immediately.
    let deadline = Instant::now() + Duration::from_secs_f64(duration) + MONITOR_SLACK;
    loop {
        tokio::time::sleep(MONITOR_PERIOD).await;
        let _ = fps.update_status().await;

        let mut collided = BTreeSet::new();
        let mut moving = BTreeSet::new();
        for &pid in &participants {
            let Ok(positioner) = fps.positioner(pid) else { continue };
            let status = positioner.status();
            if status.collided() {
                collided.insert(pid);
            } else if !status.displacement_done() {
                moving.insert(pid);
            }
        }
        if !collided.is_empty() {
            return abort(fps, collided, "collision detected during trajectory").await;
        }
        if moving.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            return abort(fps, moving, "trajectory did not complete in time").await;
        }
    }

    // Refresh the models with where everything actually ended up.
    let _ = fps.update_position().await;
    for (&pid, pair) in &trajectory.paths {
        if let (Ok(positioner), Some((alpha, beta))) = (fps.positioner(pid), pair.final_angles()) {
            // The poll above already set real positions; this is the
            // fallback when a position reply went missing.
            if positioner.last_seen().is_none() {
                positioner.set_local_position(alpha, beta);
            }
        }
    }
    info!("trajectory: completed");
    Ok(())
}

/// Step 7: the error path. Broadcast STOP_TRAJECTORY, then surface a
/// `Trajectory` error naming the positioners involved.
async fn abort(fps: &Fps, failed: BTreeSet<u16>, message: &str) -> Result<()> {
    warn!("trajectory: aborting ({message})");
    let active = fps.active_positioner_ids();
    if !active.is_empty() {
        let _ = fps.registry.submit(Command::stop_trajectory(active)).await;
    }
    Err(FpsError::Trajectory { failed, message: message.into() })
}

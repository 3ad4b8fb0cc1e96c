//! # positioner
//!
//! The live model of one two-axis robot: position, speed, firmware,
//! status word, and the operations that act on a single positioner
//! (goto, home, status waits). Status mutations run an ordered listener
//! list and feed a watch channel, which is what `wait_for_status` blocks
//! on.
//!
//! There is no separate state field: the state machine is derived from
//! the status bits on demand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fps_types::{CommandId, PositionerStatus};

use crate::command::{
    decode_firmware, decode_position, decode_positioner_status, firmware_is_bootloader, Command,
};
use crate::config::{FpsConfig, SafeMode};
use crate::error::{FpsError, Result};
use crate::registry::CommandRegistry;

/// Slack added on top of the estimated travel time when waiting for a
/// move to complete.
const MOVE_SLACK: Duration = Duration::from_secs(3);

/// Window for datum initialisation; homing both axes from anywhere takes
/// up to about a minute on real hardware.
const DATUM_TIMEOUT: Duration = Duration::from_secs(120);

/// Consecutive missed poll replies before a positioner is flagged offline.
pub const OFFLINE_AFTER_MISSES: u32 = 3;

/// Period of the self-driven status polls inside motion waits.
const STATUS_POLL_PERIOD: Duration = Duration::from_millis(100);

// ── Settings ──────────────────────────────────────────────────────────────────

/// The slice of the configuration a positioner needs for its own
/// operations.
#[derive(Debug, Clone)]
pub struct PositionerSettings {
    pub motor_steps: u32,
    pub motor_speed: (u32, u32),
    pub reduction_ratio: f64,
    pub safe_mode: SafeMode,
}

impl From<&FpsConfig> for PositionerSettings {
    fn from(config: &FpsConfig) -> Self {
        Self {
            motor_steps: config.positioner.motor_steps,
            motor_speed: config.positioner.motor_speed,
            reduction_ratio: config.positioner.reduction_ratio,
            safe_mode: config.safe_mode,
        }
    }
}

/// Travel time for one axis move at the given motor RPM through the gear
/// reduction.
pub(crate) fn move_time(delta_deg: f64, rpm: u32, reduction: f64) -> Duration {
    if rpm == 0 {
        return Duration::ZERO;
    }
    let output_deg_per_sec = f64::from(rpm) / 60.0 / reduction * 360.0;
    Duration::from_secs_f64(delta_deg.abs() / output_deg_per_sec)
}

// ── Goto parameters ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct GotoParams {
    pub alpha: f64,
    pub beta: f64,
    /// Optional (alpha, beta) RPM override sent before the move.
    pub speed: Option<(u32, u32)>,
    /// Interpret the angles as offsets from the current position.
    pub relative: bool,
}

impl GotoParams {
    pub fn absolute(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta, ..Default::default() }
    }

    pub fn relative(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta, relative: true, ..Default::default() }
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionerState {
    /// Never seen, or firmware not yet through boot initialisation.
    Unknown,
    /// Stopped answering polls.
    Offline,
    /// Firmware is running the bootloader.
    Bootloader,
    /// Booted but datums not established.
    Initialised,
    /// Datums established, no motion in progress.
    Ready,
    /// A move is in progress.
    Moving,
    /// A calibration sequence is running.
    Calibrating,
    /// A collision bit is set. Terminal until manual recovery.
    Collided,
}

// ── Positioner ────────────────────────────────────────────────────────────────

type StatusListener = Box<dyn Fn(u16, PositionerStatus) + Send + Sync>;

struct Dynamics {
    alpha: f64,
    beta: f64,
    speed: (u32, u32),
    firmware: Option<String>,
    disabled: bool,
    last_seen: Option<DateTime<Utc>>,
    missed_replies: u32,
}

pub struct Positioner {
    pub id: u16,
    settings: PositionerSettings,
    registry: Arc<CommandRegistry>,
    dynamics: StdRwLock<Dynamics>,
    status_tx: watch::Sender<PositionerStatus>,
    listeners: StdMutex<Vec<StatusListener>>,
    calibrating: AtomicBool,
    offline: AtomicBool,
}

impl Positioner {
    pub fn new(id: u16, registry: Arc<CommandRegistry>, settings: PositionerSettings) -> Self {
        let (status_tx, _) = watch::channel(PositionerStatus::UNKNOWN);
        let motor_speed = settings.motor_speed;
        Self {
            id,
            settings,
            registry,
            dynamics: StdRwLock::new(Dynamics {
                alpha: 0.0,
                beta: 0.0,
                speed: motor_speed,
                firmware: None,
                disabled: false,
                last_seen: None,
                missed_replies: 0,
            }),
            status_tx,
            listeners: StdMutex::new(Vec::new()),
            calibrating: AtomicBool::new(false),
            offline: AtomicBool::new(false),
        }
    }

    // ── Model accessors ───────────────────────────────────────────────────

    pub fn status(&self) -> PositionerStatus {
        *self.status_tx.borrow()
    }

    pub fn position(&self) -> (f64, f64) {
        let d = self.dynamics.read().unwrap();
        (d.alpha, d.beta)
    }

    pub fn speed(&self) -> (u32, u32) {
        self.dynamics.read().unwrap().speed
    }

    pub fn firmware(&self) -> Option<String> {
        self.dynamics.read().unwrap().firmware.clone()
    }

    pub fn is_bootloader(&self) -> bool {
        self.dynamics
            .read()
            .unwrap()
            .firmware
            .as_deref()
            .map(firmware_is_bootloader)
            .unwrap_or(false)
    }

    pub fn disabled(&self) -> bool {
        self.dynamics.read().unwrap().disabled
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.dynamics.write().unwrap().disabled = disabled;
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.dynamics.read().unwrap().last_seen
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    /// Derive the state machine position from the live status bits.
    pub fn state(&self) -> PositionerState {
        if self.is_offline() {
            return PositionerState::Offline;
        }
        if self.is_bootloader() {
            return PositionerState::Bootloader;
        }
        let status = self.status();
        if status.collided() {
            return PositionerState::Collided;
        }
        if !status.initialised() {
            return PositionerState::Unknown;
        }
        if self.calibrating.load(Ordering::Relaxed) {
            return PositionerState::Calibrating;
        }
        if !status.datums_initialised() {
            return PositionerState::Initialised;
        }
        if status.displacement_done() {
            PositionerState::Ready
        } else {
            PositionerState::Moving
        }
    }

    // ── Status mutation ───────────────────────────────────────────────────

    /// Register a callback run (in registration order) on every status
    /// change.
    pub fn add_status_listener(&self, listener: StatusListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Apply a freshly received status word. Listeners and the status
    /// signal fire only when the word actually changed.
    pub fn update_status_word(&self, status: PositionerStatus) {
        self.record_seen();
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!("positioner {}: status {:?}", self.id, status);
            for listener in self.listeners.lock().unwrap().iter() {
                listener(self.id, status);
            }
        }
    }

    pub fn set_local_position(&self, alpha: f64, beta: f64) {
        let mut d = self.dynamics.write().unwrap();
        d.alpha = alpha;
        d.beta = beta;
    }

    pub(crate) fn record_seen(&self) {
        let mut d = self.dynamics.write().unwrap();
        d.last_seen = Some(Utc::now());
        d.missed_replies = 0;
        self.offline.store(false, Ordering::Relaxed);
    }

    /// Count a missed poll reply; flips the offline flag after
    /// [`OFFLINE_AFTER_MISSES`] consecutive misses.
    pub(crate) fn record_missed_reply(&self) {
        let mut d = self.dynamics.write().unwrap();
        d.missed_replies += 1;
        if d.missed_replies >= OFFLINE_AFTER_MISSES && !self.offline.swap(true, Ordering::Relaxed) {
            warn!("positioner {}: no reply to {} polls, flagging offline", self.id, d.missed_replies);
        }
    }

    /// Block until every bit in `mask` is present in the status word.
    pub async fn wait_for_status(&self, mask: PositionerStatus, timeout: Duration) -> Result<()> {
        let mut rx = self.status_tx.subscribe();
        if rx.borrow().contains(mask) {
            return Ok(());
        }
        tokio::time::timeout(timeout, async {
            loop {
                rx.changed()
                    .await
                    .map_err(|_| FpsError::Cancelled { command: CommandId::GetStatus })?;
                if rx.borrow().contains(mask) {
                    return Ok(());
                }
            }
        })
        .await
        .map_err(|_| FpsError::Timeout { command: CommandId::GetStatus, missing: vec![self.id] })?
    }

    /// Poll GET_STATUS until every bit in `mask` is present. Unlike
    /// [`wait_for_status`](Self::wait_for_status) this drives its own
    /// refresh, so it works while the array pollers are stopped.
    pub async fn poll_until_status(
        &self,
        mask: PositionerStatus,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.update_status().await?;
            if status.contains(mask) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FpsError::Timeout {
                    command: CommandId::GetStatus,
                    missing: vec![self.id],
                });
            }
            tokio::time::sleep(STATUS_POLL_PERIOD).await;
        }
    }

    /// Poll for the displacement-completed bits, failing immediately if a
    /// collision bit asserts mid-move.
    async fn wait_move_done(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.update_status().await?;
            if status.collided() {
                return Err(FpsError::Collision { positioner_id: self.id, status });
            }
            if status.displacement_done() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FpsError::Timeout {
                    command: CommandId::GetStatus,
                    missing: vec![self.id],
                });
            }
            tokio::time::sleep(STATUS_POLL_PERIOD).await;
        }
    }

    // ── Bus operations ────────────────────────────────────────────────────

    /// Refresh firmware, status and position, and apply the default
    /// motor speed. Called once per positioner during array initialise.
    pub async fn initialise(&self) -> Result<()> {
        self.update_firmware_version().await?;
        if self.is_bootloader() {
            warn!("positioner {}: in bootloader mode, skipping setup", self.id);
            return Ok(());
        }
        self.update_status().await?;
        let (alpha_rpm, beta_rpm) = self.settings.motor_speed;
        self.set_speed(alpha_rpm, beta_rpm).await?;
        self.update_position().await?;
        Ok(())
    }

    pub async fn update_firmware_version(&self) -> Result<String> {
        let replies = self.registry.send(Command::get_firmware_version(self.id)).await?;
        let firmware = decode_firmware(replies[0].accepted()?)?;
        self.dynamics.write().unwrap().firmware = Some(firmware.clone());
        self.record_seen();
        Ok(firmware)
    }

    pub async fn update_status(&self) -> Result<PositionerStatus> {
        let replies = self.registry.send(Command::get_status(self.id)).await?;
        let status = decode_positioner_status(replies[0].accepted()?)?;
        self.update_status_word(status);
        Ok(status)
    }

    pub async fn update_position(&self) -> Result<(f64, f64)> {
        let replies = self.registry.send(Command::get_actual_position(self.id)).await?;
        let (alpha, beta) =
            decode_position(replies[0].accepted()?, self.settings.motor_steps)?;
        self.set_local_position(alpha, beta);
        self.record_seen();
        Ok((alpha, beta))
    }

    /// Overwrite the device's notion of its current position.
    pub async fn set_position(&self, alpha: f64, beta: f64) -> Result<()> {
        let cmd = Command::set_actual_position(self.id, alpha, beta, self.settings.motor_steps);
        self.registry.send(cmd).await?[0].accepted()?;
        self.set_local_position(alpha, beta);
        Ok(())
    }

    pub async fn set_speed(&self, alpha_rpm: u32, beta_rpm: u32) -> Result<()> {
        let replies = self.registry.send(Command::set_speed(self.id, alpha_rpm, beta_rpm)).await?;
        replies[0].accepted()?;
        self.dynamics.write().unwrap().speed = (alpha_rpm, beta_rpm);
        Ok(())
    }

    pub async fn hall(&self, on: bool) -> Result<()> {
        self.registry.send(Command::hall(self.id, on)).await?[0].accepted()?;
        Ok(())
    }

    /// Validate and execute a direct move, then wait for the
    /// displacement-completed bits on both axes.
    pub async fn goto(&self, params: GotoParams) -> Result<()> {
        if self.disabled() {
            return Err(FpsError::Validation(format!(
                "positioner_id={} is disabled",
                self.id
            )));
        }

        let (current_alpha, current_beta) = self.position();
        let (target_alpha, target_beta) = if params.relative {
            (current_alpha + params.alpha, current_beta + params.beta)
        } else {
            (params.alpha, params.beta)
        };

        for (axis, target) in [("alpha", target_alpha), ("beta", target_beta)] {
            if !(0.0..360.0).contains(&target) {
                return Err(FpsError::Validation(format!(
                    "{axis}={target} out of range [0, 360) for positioner {}",
                    self.id
                )));
            }
        }
        if let Some(min_beta) = self.settings.safe_mode.min_beta() {
            if target_beta < min_beta {
                return Err(FpsError::Validation(format!(
                    "beta={target_beta} below the safe mode limit {min_beta} \
                     for positioner {}",
                    self.id
                )));
            }
        }

        let delta_alpha = target_alpha - current_alpha;
        let delta_beta = target_beta - current_beta;
        if delta_alpha.abs() < 1e-4 && delta_beta.abs() < 1e-4 {
            info!("positioner {}: already at target, did not move", self.id);
            return Ok(());
        }

        if let Some((alpha_rpm, beta_rpm)) = params.speed {
            self.set_speed(alpha_rpm, beta_rpm).await?;
        }

        let (alpha_rpm, beta_rpm) = self.speed();
        let reduction = self.settings.reduction_ratio;
        let travel = move_time(delta_alpha, alpha_rpm, reduction)
            .max(move_time(delta_beta, beta_rpm, reduction));

        let cmd = if params.relative {
            Command::goto_relative(self.id, params.alpha, params.beta, self.settings.motor_steps)
        } else {
            Command::goto_absolute(self.id, target_alpha, target_beta, self.settings.motor_steps)
        };
        info!(
            "positioner {}: goto ({target_alpha:.3}, {target_beta:.3}), estimated {:.1}s",
            self.id,
            travel.as_secs_f64()
        );
        self.registry.send(cmd).await?[0].accepted()?;

        self.wait_move_done(travel + MOVE_SLACK).await?;
        self.set_local_position(target_alpha, target_beta);
        Ok(())
    }

    /// Home both axes: initialise the datums and wait for the datum bits.
    pub async fn home(&self) -> Result<()> {
        if self.disabled() {
            return Err(FpsError::Validation(format!(
                "positioner_id={} is disabled",
                self.id
            )));
        }
        self.registry.send(Command::initialize_datums(self.id)).await?[0].accepted()?;
        self.poll_until_status(
            PositionerStatus::DATUM_ALPHA_INITIALIZED | PositionerStatus::DATUM_BETA_INITIALIZED,
            DATUM_TIMEOUT,
        )
        .await?;
        self.set_local_position(0.0, 0.0);
        Ok(())
    }

    /// Stop whatever motion is in progress on this positioner.
    pub async fn abort(&self) -> Result<()> {
        let replies = self
            .registry
            .send(Command::new(CommandId::StopTrajectory, self.id))
            .await?;
        replies[0].accepted()?;
        Ok(())
    }

    pub(crate) fn set_calibrating(&self, on: bool) {
        self.calibrating.store(on, Ordering::Relaxed);
    }
}

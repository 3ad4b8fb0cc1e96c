//! # fps
//!
//! The array controller: owns the bus channels, the notifier, the
//! command registry, every positioner record and the pollers. External
//! components act on the array through this façade; they hold read-only
//! positioner handles at most.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use fps_types::PositionerStatus;

use crate::channel::{BusChannel, CannetChannel};
use crate::command::{decode_position, decode_positioner_status, Command};
use crate::config::{ChannelType, FpsConfig};
use crate::error::{FpsError, Result};
use crate::notifier::Notifier;
use crate::poller::{Poller, PollerSet};
use crate::positioner::{GotoParams, Positioner, PositionerSettings};
use crate::registry::CommandRegistry;
use crate::trajectory::{self, SyncLine, Trajectory};
use crate::virtual_bus::VirtualBus;

/// Angular tolerance when deciding whether the array sits at the fold
/// position.
const FOLD_TOLERANCE: f64 = 1.0;

/// Calibration phases wait on their status bits for at most this long.
const MOTOR_CALIBRATION_TIMEOUT: Duration = Duration::from_secs(300);
const DATUM_CALIBRATION_TIMEOUT: Duration = Duration::from_secs(300);
const COGGING_CALIBRATION_TIMEOUT: Duration = Duration::from_secs(5400);

pub struct Fps {
    pub config: FpsConfig,
    pub(crate) channels: Vec<Arc<dyn BusChannel>>,
    pub(crate) notifier: Notifier,
    pub(crate) registry: Arc<CommandRegistry>,
    pub(crate) positioners: StdRwLock<BTreeMap<u16, Arc<Positioner>>>,
    pub pollers: PollerSet,
    pub(crate) trajectory_lock: tokio::sync::Mutex<()>,
    sync_line: StdMutex<Option<Arc<dyn SyncLine>>>,
    started: AtomicBool,
}

impl Fps {
    /// Build the controller from the active configuration profile.
    pub fn new(config: FpsConfig) -> Result<Arc<Self>> {
        let (name, profile) = config.active_profile()?;
        info!("fps: using profile {name:?} ({:?})", profile.channel_type);

        let channels: Vec<Arc<dyn BusChannel>> = match profile.channel_type {
            ChannelType::Cannet => profile
                .channels
                .iter()
                .map(|address| {
                    Arc::new(CannetChannel::new(
                        address.clone(),
                        profile.gateway_channel,
                        profile.bitrate,
                    )) as Arc<dyn BusChannel>
                })
                .collect(),
            ChannelType::Virtual => {
                let bus = VirtualBus::new();
                profile
                    .channels
                    .iter()
                    .map(|_| Arc::new(bus.channel()) as Arc<dyn BusChannel>)
                    .collect()
            }
        };
        if channels.is_empty() {
            return Err(FpsError::Config(format!("profile {name:?} declares no channels")));
        }
        Ok(Self::with_channels(config, channels))
    }

    /// Build the controller over externally constructed channels (tests,
    /// the simulator).
    pub fn with_channels(config: FpsConfig, channels: Vec<Arc<dyn BusChannel>>) -> Arc<Self> {
        let registry = Arc::new(CommandRegistry::new(channels.clone()));
        let status_delay = Duration::from_secs_f64(config.fps.status_poller_delay);
        let position_delay = Duration::from_secs_f64(config.fps.position_poller_delay);

        Arc::new_cyclic(|weak: &Weak<Fps>| {
            let status_weak = weak.clone();
            let position_weak = weak.clone();
            Fps {
                config,
                channels,
                notifier: Notifier::new(),
                registry,
                positioners: StdRwLock::new(BTreeMap::new()),
                pollers: PollerSet {
                    status: Poller::new("status", status_delay, move || {
                        let weak = status_weak.clone();
                        async move {
                            if let Some(fps) = weak.upgrade() {
                                if let Err(e) = fps.update_status().await {
                                    warn!("status poller: {e}");
                                }
                            }
                        }
                    }),
                    position: Poller::new("position", position_delay, move || {
                        let weak = position_weak.clone();
                        async move {
                            if let Some(fps) = weak.upgrade() {
                                if let Err(e) = fps.update_position().await {
                                    warn!("position poller: {e}");
                                }
                            }
                        }
                    }),
                },
                trajectory_lock: tokio::sync::Mutex::new(()),
                sync_line: StdMutex::new(None),
                started: AtomicBool::new(false),
            }
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Open the channels, discover the array and set every positioner up.
    ///
    /// Discovery broadcasts GET_ID and collects replies for the
    /// configured window; each replying positioner is then asked for its
    /// firmware, status and position, and given the default motor speed.
    pub async fn initialise(self: &Arc<Self>, start_pollers: bool) -> Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            for channel in &self.channels {
                channel.open().await?;
            }
            self.notifier.add_listener(self.registry.clone()).await;
            for (index, channel) in self.channels.iter().enumerate() {
                self.notifier.add_channel(index, channel.clone());
            }
        }

        let window = Duration::from_secs_f64(self.config.fps.initialise_timeouts);
        let replies = self.registry.send(Command::get_id().collect_window(window)).await?;

        let settings = PositionerSettings::from(&self.config);
        let mut discovered = Vec::new();
        {
            let mut positioners = self.positioners.write().unwrap();
            for reply in &replies {
                let pid = reply.positioner_id;
                positioners.entry(pid).or_insert_with(|| {
                    discovered.push(pid);
                    Arc::new(Positioner::new(pid, self.registry.clone(), settings.clone()))
                });
            }
        }
        info!(
            "fps: discovered {} positioner(s) ({} new)",
            replies.len(),
            discovered.len()
        );

        let mut tasks = JoinSet::new();
        for positioner in self.positioners() {
            tasks.spawn(async move {
                let result = positioner.initialise().await;
                (positioner, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let Ok((positioner, result)) = joined else { continue };
            if let Err(e) = result {
                warn!("positioner {}: initialise failed ({e}), disabling", positioner.id);
                positioner.set_disabled(true);
            }
        }

        if start_pollers {
            self.pollers.start();
        }
        Ok(())
    }

    /// Stop polling, quiesce the bus and tear the channels down.
    pub async fn shutdown(&self) -> Result<()> {
        self.pollers.stop().await;
        // Best effort: leave no positioner moving.
        let active = self.active_positioner_ids();
        if !active.is_empty() {
            let _ = self.registry.submit(Command::stop_trajectory(active)).await;
        }
        self.notifier.shutdown().await;
        for channel in &self.channels {
            let _ = channel.shutdown().await;
        }
        info!("fps: shut down");
        Ok(())
    }

    /// Direct access to the command registry, for callers that build
    /// their own [`Command`]s.
    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    // ── Positioner access ─────────────────────────────────────────────────

    pub fn positioner(&self, positioner_id: u16) -> Result<Arc<Positioner>> {
        self.positioners
            .read()
            .unwrap()
            .get(&positioner_id)
            .cloned()
            .ok_or_else(|| {
                FpsError::Validation(format!("positioner_id={positioner_id} is unknown"))
            })
    }

    pub fn positioners(&self) -> Vec<Arc<Positioner>> {
        self.positioners.read().unwrap().values().cloned().collect()
    }

    pub fn positioner_ids(&self) -> Vec<u16> {
        self.positioners.read().unwrap().keys().copied().collect()
    }

    /// Ids of the known, non-disabled positioners: the population a
    /// broadcast expects replies from.
    pub fn active_positioner_ids(&self) -> Vec<u16> {
        self.positioners
            .read()
            .unwrap()
            .values()
            .filter(|p| !p.disabled())
            .map(|p| p.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.positioners.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positioners.read().unwrap().is_empty()
    }

    // ── Array-wide refresh ────────────────────────────────────────────────

    /// Broadcast GET_STATUS and fold the replies into the models.
    /// Replies that did arrive are applied even when the broadcast times
    /// out; missing positioners get a missed-reply mark.
    pub async fn update_status(&self) -> Result<()> {
        let active = self.active_positioner_ids();
        if active.is_empty() {
            return Ok(());
        }
        let outcome = self.registry.submit(Command::broadcast(
            fps_types::CommandId::GetStatus,
            active.clone(),
        ))
        .await;

        let mut replied = std::collections::HashSet::new();
        for reply in &outcome.replies {
            let Ok(positioner) = self.positioner(reply.positioner_id) else {
                debug!("status poll: reply from undiscovered positioner {}", reply.positioner_id);
                continue;
            };
            if let Ok(status) = decode_positioner_status(reply) {
                positioner.update_status_word(status);
                replied.insert(reply.positioner_id);
            }
        }
        for pid in active {
            if !replied.contains(&pid) {
                if let Ok(positioner) = self.positioner(pid) {
                    positioner.record_missed_reply();
                }
            }
        }
        outcome.into_result().map(|_| ())
    }

    /// Broadcast GET_ACTUAL_POSITION and fold the replies into the
    /// models, with the same partial-result behaviour as
    /// [`update_status`](Self::update_status).
    pub async fn update_position(&self) -> Result<()> {
        let active = self.active_positioner_ids();
        if active.is_empty() {
            return Ok(());
        }
        let outcome = self.registry.submit(Command::broadcast(
            fps_types::CommandId::GetActualPosition,
            active.clone(),
        ))
        .await;

        let motor_steps = self.config.positioner.motor_steps;
        for reply in &outcome.replies {
            let Ok(positioner) = self.positioner(reply.positioner_id) else { continue };
            if let Ok((alpha, beta)) = decode_position(reply, motor_steps) {
                positioner.set_local_position(alpha, beta);
                positioner.record_seen();
            }
        }
        outcome.into_result().map(|_| ())
    }

    // ── Motion ────────────────────────────────────────────────────────────

    /// Move several positioners concurrently with direct goto commands.
    pub async fn goto(&self, targets: BTreeMap<u16, (f64, f64)>, relative: bool) -> Result<()> {
        let mut tasks = JoinSet::new();
        for (pid, (alpha, beta)) in targets {
            let positioner = self.positioner(pid)?;
            tasks.spawn(async move {
                let params = if relative {
                    GotoParams::relative(alpha, beta)
                } else {
                    GotoParams::absolute(alpha, beta)
                };
                (pid, positioner.goto(params).await)
            });
        }
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            if let Ok((pid, Err(e))) = joined {
                warn!("goto: positioner {pid} failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Home every active positioner (datum initialisation).
    pub async fn home(&self) -> Result<()> {
        let mut tasks = JoinSet::new();
        for positioner in self.positioners() {
            if positioner.disabled() {
                continue;
            }
            tasks.spawn(async move { positioner.home().await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| FpsError::Bus(format!("home task panicked: {e}")))??;
        }
        Ok(())
    }

    /// True when every active positioner sits at the configured fold
    /// (lattice) position.
    pub fn is_folded(&self) -> bool {
        let (fold_alpha, fold_beta) = self.config.kaiju.lattice_position;
        self.positioners
            .read()
            .unwrap()
            .values()
            .filter(|p| !p.disabled())
            .all(|p| {
                let (alpha, beta) = p.position();
                (alpha - fold_alpha).abs() <= FOLD_TOLERANCE
                    && (beta - fold_beta).abs() <= FOLD_TOLERANCE
            })
    }

    /// Upload and execute a trajectory for part or all of the array.
    pub async fn send_trajectory(&self, trajectory: Trajectory, use_sync_line: bool) -> Result<()> {
        trajectory::send_trajectory(self, trajectory, use_sync_line).await
    }

    /// Broadcast STOP_TRAJECTORY to the whole array.
    pub async fn stop_trajectory(&self) -> Result<()> {
        let active = self.active_positioner_ids();
        if active.is_empty() {
            return Ok(());
        }
        self.registry.send(Command::stop_trajectory(active)).await?;
        Ok(())
    }

    // ── Calibration ───────────────────────────────────────────────────────

    /// Run the calibration sequence (motor, datum, cogging, save) on one
    /// positioner. Pollers are stopped for the duration and restored
    /// afterwards.
    pub async fn calibrate_positioner(
        &self,
        positioner_id: u16,
        motors: bool,
        datums: bool,
        cogging: bool,
    ) -> Result<()> {
        let positioner = self.positioner(positioner_id)?;
        info!("calibrating positioner {positioner_id}");

        let pollers_were_running = self.pollers.running();
        if pollers_were_running {
            debug!("stopping pollers for calibration");
            self.pollers.stop().await;
        }
        positioner.set_calibrating(true);

        let result = self
            .run_calibration(&positioner, motors, datums, cogging)
            .await;

        positioner.set_calibrating(false);
        if pollers_were_running {
            self.pollers.start();
        }
        result
    }

    async fn run_calibration(
        &self,
        positioner: &Arc<Positioner>,
        motors: bool,
        datums: bool,
        cogging: bool,
    ) -> Result<()> {
        let pid = positioner.id;

        if motors {
            info!("positioner {pid}: motor calibration");
            self.registry.send(Command::start_motor_calibration(pid)).await?[0].accepted()?;
            positioner
                .poll_until_status(
                    PositionerStatus::DISPLACEMENT_COMPLETED
                        | PositionerStatus::MOTOR_ALPHA_CALIBRATED
                        | PositionerStatus::MOTOR_BETA_CALIBRATED,
                    MOTOR_CALIBRATION_TIMEOUT,
                )
                .await?;
        } else {
            warn!("positioner {pid}: skipping motor calibration");
        }

        if datums {
            info!("positioner {pid}: datum calibration");
            self.registry.send(Command::start_datum_calibration(pid)).await?[0].accepted()?;
            positioner
                .poll_until_status(
                    PositionerStatus::DISPLACEMENT_COMPLETED
                        | PositionerStatus::DATUM_ALPHA_CALIBRATED
                        | PositionerStatus::DATUM_BETA_CALIBRATED,
                    DATUM_CALIBRATION_TIMEOUT,
                )
                .await?;
        } else {
            warn!("positioner {pid}: skipping datum calibration");
        }

        if cogging {
            info!("positioner {pid}: cogging calibration (this can take over an hour)");
            self.registry.send(Command::start_cogging_calibration(pid)).await?[0].accepted()?;
            positioner
                .poll_until_status(
                    PositionerStatus::COGGING_ALPHA_CALIBRATED
                        | PositionerStatus::COGGING_BETA_CALIBRATED,
                    COGGING_CALIBRATION_TIMEOUT,
                )
                .await?;
        } else {
            warn!("positioner {pid}: skipping cogging calibration");
        }

        if motors || datums || cogging {
            info!("positioner {pid}: saving calibration");
            self.registry.send(Command::save_internal_calibration(pid)).await?[0].accepted()?;
        }
        Ok(())
    }

    // ── Sync line ─────────────────────────────────────────────────────────

    /// Install the hardware sync line used to start pre-loaded
    /// trajectories without a broadcast command.
    pub fn set_sync_line(&self, line: Arc<dyn SyncLine>) {
        *self.sync_line.lock().unwrap() = Some(line);
    }

    pub(crate) fn sync_line(&self) -> Option<Arc<dyn SyncLine>> {
        self.sync_line.lock().unwrap().clone()
    }
}

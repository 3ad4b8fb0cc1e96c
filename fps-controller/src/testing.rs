//! # testing
//!
//! A mock focal-plane array for tests and the simulator. `VirtualFps`
//! attaches one channel to a [`VirtualBus`] and answers every command the
//! way real positioner firmware would: tag echo on accepted replies,
//! response code in the low byte on rejections, status bits that follow
//! moves, datum initialisation, calibration and the trajectory protocol.
//!
//! Moves complete after a short simulated delay rather than the nominal
//! travel time, so tests stay fast while still exercising the
//! in-motion → completed bit transitions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use fps_types::{
    angle_to_motor_steps, bytes_to_int, int_to_bytes, motor_steps_to_angle, BootloaderStatus,
    CommandId, Endian, Frame, Identifier, PositionerStatus, ResponseCode,
};

use crate::channel::BusChannel;
use crate::virtual_bus::{VirtualBus, VirtualChannel};

/// Firmware version the mock array reports.
pub const VIRTUAL_FIRMWARE: (u8, u8, u8) = (10, 11, 12);

/// How long a simulated move takes before the completion bits assert.
const DEFAULT_MOVE_DELAY: Duration = Duration::from_millis(25);

fn ready_status() -> PositionerStatus {
    PositionerStatus::SYSTEM_INITIALIZED
        | PositionerStatus::DATUM_ALPHA_INITIALIZED
        | PositionerStatus::DATUM_BETA_INITIALIZED
        | PositionerStatus::POSITION_RESTORED
        | PositionerStatus::DISPLACEMENT_COMPLETED
        | PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA
        | PositionerStatus::DISPLACEMENT_COMPLETED_BETA
}

const DISPLACEMENT_BITS: PositionerStatus = PositionerStatus::DISPLACEMENT_COMPLETED
    .union(PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA)
    .union(PositionerStatus::DISPLACEMENT_COMPLETED_BETA);

// ── Virtual positioner record ─────────────────────────────────────────────────

struct VirtualPositioner {
    alpha: f64,
    beta: f64,
    speed: (u32, u32),
    firmware: (u8, u8, u8),
    status: PositionerStatus,
    /// When set, the positioner never answers — used to exercise
    /// timeout and offline paths.
    silent: bool,
    // Trajectory upload bookkeeping.
    receiving: bool,
    expect_alpha: u32,
    expect_beta: u32,
    points_alpha: Vec<(i32, u32)>,
    points_beta: Vec<(i32, u32)>,
}

impl VirtualPositioner {
    fn new() -> Self {
        Self {
            alpha: 0.0,
            beta: 180.0,
            speed: (0, 0),
            firmware: VIRTUAL_FIRMWARE,
            status: ready_status(),
            silent: false,
            receiving: false,
            expect_alpha: 0,
            expect_beta: 0,
            points_alpha: Vec::new(),
            points_beta: Vec::new(),
        }
    }

    fn is_bootloader(&self) -> bool {
        self.firmware.1 == 80
    }
}

// ── Virtual FPS ───────────────────────────────────────────────────────────────

struct Inner {
    positioners: StdMutex<BTreeMap<u16, VirtualPositioner>>,
    channel: VirtualChannel,
    motor_steps: u32,
    move_delay: Duration,
}

/// The mock array. Construct it on the same [`VirtualBus`] as the
/// controller's channel and it responds from a background task until
/// dropped or shut down.
pub struct VirtualFps {
    inner: Arc<Inner>,
    task: JoinHandle<()>,
}

impl Drop for VirtualFps {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl VirtualFps {
    pub fn new(bus: &VirtualBus, ids: impl IntoIterator<Item = u16>, motor_steps: u32) -> Self {
        let positioners = ids.into_iter().map(|id| (id, VirtualPositioner::new())).collect();
        let inner = Arc::new(Inner {
            positioners: StdMutex::new(positioners),
            channel: bus.channel(),
            motor_steps,
            move_delay: DEFAULT_MOVE_DELAY,
        });

        let worker = inner.clone();
        let task = tokio::spawn(async move {
            loop {
                let frame = match worker.channel.receive().await {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                handle_frame(&worker, frame).await;
            }
        });

        Self { inner, task }
    }

    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.inner.channel.shutdown().await;
    }

    // ── Test controls ─────────────────────────────────────────────────────

    pub fn set_position(&self, positioner_id: u16, alpha: f64, beta: f64) {
        if let Some(p) = self.inner.positioners.lock().unwrap().get_mut(&positioner_id) {
            p.alpha = alpha;
            p.beta = beta;
        }
    }

    pub fn position(&self, positioner_id: u16) -> Option<(f64, f64)> {
        self.inner
            .positioners
            .lock()
            .unwrap()
            .get(&positioner_id)
            .map(|p| (p.alpha, p.beta))
    }

    pub fn status(&self, positioner_id: u16) -> Option<PositionerStatus> {
        self.inner.positioners.lock().unwrap().get(&positioner_id).map(|p| p.status)
    }

    pub fn set_status(&self, positioner_id: u16, status: PositionerStatus) {
        if let Some(p) = self.inner.positioners.lock().unwrap().get_mut(&positioner_id) {
            p.status = status;
        }
    }

    pub fn or_status(&self, positioner_id: u16, bits: PositionerStatus) {
        if let Some(p) = self.inner.positioners.lock().unwrap().get_mut(&positioner_id) {
            p.status |= bits;
        }
    }

    /// Make a positioner stop answering anything.
    pub fn silence(&self, positioner_id: u16) {
        if let Some(p) = self.inner.positioners.lock().unwrap().get_mut(&positioner_id) {
            p.silent = true;
        }
    }

    /// Drop the firmware into bootloader mode (middle version `80`).
    pub fn set_bootloader(&self, positioner_id: u16) {
        if let Some(p) = self.inner.positioners.lock().unwrap().get_mut(&positioner_id) {
            p.firmware = (VIRTUAL_FIRMWARE.0, 80, VIRTUAL_FIRMWARE.2);
            p.status = PositionerStatus::from_bits_retain(BootloaderStatus::BOOTLOADER_INIT.bits());
        }
    }
}

// ── Frame handling ────────────────────────────────────────────────────────────

enum Answer {
    Accept(Vec<u8>),
    Reject(ResponseCode),
    Silent,
}

async fn handle_frame(inner: &Arc<Inner>, frame: Frame) {
    let Ok(identifier) = frame.parse_identifier() else { return };
    let Ok(command) = identifier.command() else { return };
    let uid = identifier.code;

    let targets: Vec<u16> = if identifier.is_broadcast() {
        inner.positioners.lock().unwrap().keys().copied().collect()
    } else if inner.positioners.lock().unwrap().contains_key(&identifier.positioner_id) {
        vec![identifier.positioner_id]
    } else {
        return;
    };

    for pid in targets {
        let answer = respond(inner, pid, command, frame.payload());
        let (code_byte, data) = match answer {
            Answer::Accept(data) => (uid, data),
            Answer::Reject(code) => (code.into(), Vec::new()),
            Answer::Silent => continue,
        };
        debug!("virtual fps: {command:?} -> positioner {pid}");
        let reply_id = Identifier::new(pid, command.into(), code_byte).expect("valid reply id");
        let reply = Frame::new(reply_id, &data).expect("reply payload fits");
        let _ = inner.channel.send(reply).await;
    }
}

fn respond(inner: &Arc<Inner>, pid: u16, command: CommandId, payload: &[u8]) -> Answer {
    let mut positioners = inner.positioners.lock().unwrap();
    let Some(p) = positioners.get_mut(&pid) else { return Answer::Silent };
    if p.silent {
        return Answer::Silent;
    }
    let motor_steps = inner.motor_steps;

    match command {
        CommandId::GetId => Answer::Accept(Vec::new()),

        CommandId::GetFirmwareVersion => {
            Answer::Accept(vec![p.firmware.0, p.firmware.1, p.firmware.2])
        }

        CommandId::GetStatus => Answer::Accept(int_to_bytes(p.status.bits(), Endian::Big)),

        CommandId::GetActualPosition => {
            let mut data = int_to_bytes(angle_to_motor_steps(p.alpha, motor_steps), Endian::Big);
            data.extend(int_to_bytes(angle_to_motor_steps(p.beta, motor_steps), Endian::Big));
            Answer::Accept(data)
        }

        CommandId::SetActualPosition => match step_pair(payload) {
            Some((alpha, beta)) => {
                p.alpha = motor_steps_to_angle(alpha, motor_steps);
                p.beta = motor_steps_to_angle(beta, motor_steps);
                Answer::Accept(Vec::new())
            }
            None => Answer::Reject(ResponseCode::ValueOutOfRange),
        },

        CommandId::SetSpeed => match u32_pair(payload) {
            Some((alpha, beta)) => {
                p.speed = (alpha, beta);
                Answer::Accept(Vec::new())
            }
            None => Answer::Reject(ResponseCode::ValueOutOfRange),
        },

        CommandId::GotoAbsolutePosition | CommandId::GotoRelativePosition => {
            if !p.status.displacement_done() {
                return Answer::Reject(ResponseCode::AlreadyInMotion);
            }
            let Some((alpha_steps, beta_steps)) = step_pair(payload) else {
                return Answer::Reject(ResponseCode::ValueOutOfRange);
            };
            let (mut alpha, mut beta) = (
                motor_steps_to_angle(alpha_steps, motor_steps),
                motor_steps_to_angle(beta_steps, motor_steps),
            );
            if command == CommandId::GotoRelativePosition {
                alpha += p.alpha;
                beta += p.beta;
            }
            if !(0.0..360.0).contains(&alpha) || !(0.0..360.0).contains(&beta) {
                return Answer::Reject(ResponseCode::ValueOutOfRange);
            }
            p.status -= DISPLACEMENT_BITS;
            schedule(inner, pid, inner.move_delay, move |p| {
                p.alpha = alpha;
                p.beta = beta;
                p.status |= DISPLACEMENT_BITS;
            });
            Answer::Accept(Vec::new())
        }

        CommandId::InitializeDatums => {
            p.status -= DISPLACEMENT_BITS;
            p.status -= PositionerStatus::DATUM_ALPHA_INITIALIZED
                | PositionerStatus::DATUM_BETA_INITIALIZED;
            schedule(inner, pid, inner.move_delay, |p| {
                p.alpha = 0.0;
                p.beta = 0.0;
                p.status |= DISPLACEMENT_BITS
                    | PositionerStatus::DATUM_ALPHA_INITIALIZED
                    | PositionerStatus::DATUM_BETA_INITIALIZED;
            });
            Answer::Accept(Vec::new())
        }

        CommandId::SendNewTrajectory => match u32_pair(payload) {
            Some((n_alpha, n_beta)) if n_alpha > 0 && n_beta > 0 => {
                p.receiving = true;
                p.expect_alpha = n_alpha;
                p.expect_beta = n_beta;
                p.points_alpha.clear();
                p.points_beta.clear();
                p.status |= PositionerStatus::RECEIVING_TRAJECTORY;
                p.status -= PositionerStatus::TRAJECTORY_ALPHA_RECEIVED
                    | PositionerStatus::TRAJECTORY_BETA_RECEIVED;
                Answer::Accept(Vec::new())
            }
            _ => Answer::Reject(ResponseCode::InvalidTrajectory),
        },

        CommandId::SendTrajectoryData => {
            if !p.receiving {
                return Answer::Reject(ResponseCode::InvalidTrajectory);
            }
            let Some((steps, time_ms)) = step_time_pair(payload) else {
                return Answer::Reject(ResponseCode::InvalidTrajectory);
            };
            if (p.points_alpha.len() as u32) < p.expect_alpha {
                p.points_alpha.push((steps, time_ms));
            } else if (p.points_beta.len() as u32) < p.expect_beta {
                p.points_beta.push((steps, time_ms));
            } else {
                return Answer::Reject(ResponseCode::InvalidTrajectory);
            }
            Answer::Accept(Vec::new())
        }

        CommandId::TrajectoryDataEnd => {
            let complete = p.receiving
                && p.points_alpha.len() as u32 == p.expect_alpha
                && p.points_beta.len() as u32 == p.expect_beta;
            p.receiving = false;
            p.status -= PositionerStatus::RECEIVING_TRAJECTORY;
            if complete {
                p.status |= PositionerStatus::TRAJECTORY_ALPHA_RECEIVED
                    | PositionerStatus::TRAJECTORY_BETA_RECEIVED;
                Answer::Accept(Vec::new())
            } else {
                Answer::Reject(ResponseCode::InvalidTrajectory)
            }
        }

        CommandId::TrajectoryTransmissionAbort => {
            p.receiving = false;
            p.points_alpha.clear();
            p.points_beta.clear();
            p.status -= PositionerStatus::RECEIVING_TRAJECTORY
                | PositionerStatus::TRAJECTORY_ALPHA_RECEIVED
                | PositionerStatus::TRAJECTORY_BETA_RECEIVED;
            Answer::Accept(Vec::new())
        }

        CommandId::StartTrajectory => {
            if !p.status.trajectory_received() {
                // Not a participant: acknowledge and stay put.
                return Answer::Accept(Vec::new());
            }
            let final_alpha =
                p.points_alpha.last().map(|&(s, _)| motor_steps_to_angle(s, motor_steps));
            let final_beta =
                p.points_beta.last().map(|&(s, _)| motor_steps_to_angle(s, motor_steps));
            p.status -= DISPLACEMENT_BITS;
            schedule(inner, pid, inner.move_delay, move |p| {
                if let Some(alpha) = final_alpha {
                    p.alpha = alpha;
                }
                if let Some(beta) = final_beta {
                    p.beta = beta;
                }
                p.status |= DISPLACEMENT_BITS;
            });
            Answer::Accept(Vec::new())
        }

        CommandId::StopTrajectory => {
            p.receiving = false;
            p.status |= DISPLACEMENT_BITS;
            Answer::Accept(Vec::new())
        }

        CommandId::HallOn => {
            p.status -= PositionerStatus::HALL_ALPHA_DISABLE | PositionerStatus::HALL_BETA_DISABLE;
            Answer::Accept(Vec::new())
        }
        CommandId::HallOff => {
            p.status |= PositionerStatus::HALL_ALPHA_DISABLE | PositionerStatus::HALL_BETA_DISABLE;
            Answer::Accept(Vec::new())
        }

        CommandId::StartMotorCalibration => {
            schedule(inner, pid, inner.move_delay, |p| {
                p.status |= DISPLACEMENT_BITS
                    | PositionerStatus::MOTOR_ALPHA_CALIBRATED
                    | PositionerStatus::MOTOR_BETA_CALIBRATED;
            });
            Answer::Accept(Vec::new())
        }
        CommandId::StartDatumCalibration => {
            schedule(inner, pid, inner.move_delay, |p| {
                p.status |= DISPLACEMENT_BITS
                    | PositionerStatus::DATUM_ALPHA_CALIBRATED
                    | PositionerStatus::DATUM_BETA_CALIBRATED;
            });
            Answer::Accept(Vec::new())
        }
        CommandId::StartCoggingCalibration => {
            schedule(inner, pid, inner.move_delay, |p| {
                p.status |= PositionerStatus::COGGING_ALPHA_CALIBRATED
                    | PositionerStatus::COGGING_BETA_CALIBRATED;
            });
            Answer::Accept(Vec::new())
        }
        CommandId::SaveInternalCalibration => Answer::Accept(Vec::new()),

        CommandId::GetCurrent | CommandId::GetHoldingCurrent | CommandId::GetOffsets => {
            Answer::Accept(vec![0; 8])
        }
        CommandId::SetCurrent | CommandId::SetHoldingCurrent | CommandId::SetOffsets => {
            Answer::Accept(Vec::new())
        }
        CommandId::SwitchLedOn | CommandId::SwitchLedOff => Answer::Accept(Vec::new()),
        CommandId::GetNumberTrajectories => Answer::Accept(int_to_bytes(0u32, Endian::Big)),

        CommandId::AlphaClosedLoop | CommandId::BetaClosedLoop => {
            p.status |= if command == CommandId::AlphaClosedLoop {
                PositionerStatus::CLOSED_LOOP_ALPHA
            } else {
                PositionerStatus::CLOSED_LOOP_BETA
            };
            Answer::Accept(Vec::new())
        }
        CommandId::AlphaOpenLoop | CommandId::BetaOpenLoop => {
            p.status -= if command == CommandId::AlphaOpenLoop {
                PositionerStatus::CLOSED_LOOP_ALPHA
            } else {
                PositionerStatus::CLOSED_LOOP_BETA
            };
            Answer::Accept(Vec::new())
        }
        CommandId::CollisionDetectOn => {
            p.status -= PositionerStatus::COLLISION_DETECT_ALPHA_DISABLE
                | PositionerStatus::COLLISION_DETECT_BETA_DISABLE;
            Answer::Accept(Vec::new())
        }
        CommandId::CollisionDetectOff => {
            p.status |= PositionerStatus::COLLISION_DETECT_ALPHA_DISABLE
                | PositionerStatus::COLLISION_DETECT_BETA_DISABLE;
            Answer::Accept(Vec::new())
        }

        CommandId::StartFirmwareUpgrade | CommandId::SendFirmwareData => {
            if p.is_bootloader() {
                Answer::Accept(Vec::new())
            } else {
                Answer::Reject(ResponseCode::InvalidBootloaderCommand)
            }
        }
        CommandId::GetBootloaderStatus => {
            if p.is_bootloader() {
                Answer::Accept(int_to_bytes(BootloaderStatus::BOOTLOADER_INIT.bits(), Endian::Big))
            } else {
                Answer::Reject(ResponseCode::InvalidBootloaderCommand)
            }
        }
    }
}

/// Apply a mutation to one positioner after a simulated motion delay.
/// The spawned task runs after `respond` has released the table lock.
fn schedule<F>(inner: &Arc<Inner>, pid: u16, delay: Duration, mutate: F)
where
    F: FnOnce(&mut VirtualPositioner) + Send + 'static,
{
    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut positioners = inner.positioners.lock().unwrap();
        if let Some(p) = positioners.get_mut(&pid) {
            mutate(p);
        }
    });
}

// ── Payload helpers ───────────────────────────────────────────────────────────

fn step_pair(payload: &[u8]) -> Option<(i32, i32)> {
    if payload.len() != 8 {
        return None;
    }
    Some((
        bytes_to_int::<i32>(&payload[0..4], Endian::Big).ok()?,
        bytes_to_int::<i32>(&payload[4..8], Endian::Big).ok()?,
    ))
}

fn u32_pair(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.len() != 8 {
        return None;
    }
    Some((
        bytes_to_int::<u32>(&payload[0..4], Endian::Big).ok()?,
        bytes_to_int::<u32>(&payload[4..8], Endian::Big).ok()?,
    ))
}

fn step_time_pair(payload: &[u8]) -> Option<(i32, u32)> {
    if payload.len() != 8 {
        return None;
    }
    Some((
        bytes_to_int::<i32>(&payload[0..4], Endian::Big).ok()?,
        bytes_to_int::<u32>(&payload[4..8], Endian::Big).ok()?,
    ))
}

//! # command
//!
//! Typed request/reply envelopes for the bus opcodes. A [`Command`] is
//! what callers hand to the registry: opcode, target, payload, reply
//! expectations. The payload builders in this module are the only place
//! where argument-to-byte packing happens, and the decoders the only
//! place replies are unpacked.
//!
//! Payload integers are big-endian. Angles never cross this layer in
//! degrees: they are converted to signed motor steps with the configured
//! steps-per-revolution.

use std::time::Duration;

use fps_types::{
    angle_to_motor_steps, bytes_to_int, int_to_bytes, motor_steps_to_angle, CommandId, Endian,
    PositionerStatus, ResponseCode, BROADCAST_ID,
};

use crate::error::{FpsError, Result};

// ── Reply ─────────────────────────────────────────────────────────────────────

/// One reply frame, already correlated to its command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub positioner_id: u16,
    pub command: CommandId,
    pub uid: u8,
    pub response_code: ResponseCode,
    pub data: Vec<u8>,
}

impl Reply {
    /// Fail with a `Protocol` error unless the device accepted the command.
    pub fn accepted(&self) -> Result<&Self> {
        if self.response_code.is_accepted() {
            Ok(self)
        } else {
            Err(FpsError::Protocol {
                positioner_id: self.positioner_id,
                command: self.command,
                code: self.response_code,
            })
        }
    }
}

// ── Command ───────────────────────────────────────────────────────────────────

/// What completes a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// One reply from the addressed positioner.
    Unicast,
    /// One reply from each listed positioner (broadcast).
    All(Vec<u16>),
    /// Collect whatever arrives until the timeout, then succeed.
    /// Used by discovery, where the population is unknown.
    Window,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub id: CommandId,
    /// Target positioner, or [`BROADCAST_ID`] for all.
    pub positioner_id: u16,
    pub payload: Vec<u8>,
    /// Overrides the opcode default when set.
    pub timeout: Option<Duration>,
    pub replies: ReplyPolicy,
}

impl Command {
    pub fn new(id: CommandId, positioner_id: u16) -> Self {
        Self {
            id,
            positioner_id,
            payload: Vec::new(),
            timeout: None,
            replies: ReplyPolicy::Unicast,
        }
    }

    /// Broadcast expecting one reply from each listed positioner.
    pub fn broadcast(id: CommandId, positioner_ids: Vec<u16>) -> Self {
        Self {
            id,
            positioner_id: BROADCAST_ID,
            payload: Vec::new(),
            timeout: None,
            replies: ReplyPolicy::All(positioner_ids),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= 8);
        self.payload = payload;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn collect_window(mut self, window: Duration) -> Self {
        self.replies = ReplyPolicy::Window;
        self.timeout = Some(window);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.positioner_id == BROADCAST_ID
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| self.id.default_timeout())
    }

    // ── Typed constructors ────────────────────────────────────────────────

    /// Discovery broadcast: collects replies for the configured window,
    /// the population being unknown beforehand.
    pub fn get_id() -> Self {
        let mut cmd = Self::broadcast(CommandId::GetId, Vec::new());
        cmd.replies = ReplyPolicy::Window;
        cmd
    }

    pub fn get_firmware_version(positioner_id: u16) -> Self {
        Self::new(CommandId::GetFirmwareVersion, positioner_id)
    }

    pub fn get_status(positioner_id: u16) -> Self {
        Self::new(CommandId::GetStatus, positioner_id)
    }

    pub fn get_actual_position(positioner_id: u16) -> Self {
        Self::new(CommandId::GetActualPosition, positioner_id)
    }

    pub fn set_actual_position(positioner_id: u16, alpha: f64, beta: f64, motor_steps: u32) -> Self {
        Self::new(CommandId::SetActualPosition, positioner_id)
            .with_payload(angle_pair_payload(alpha, beta, motor_steps))
    }

    pub fn goto_absolute(positioner_id: u16, alpha: f64, beta: f64, motor_steps: u32) -> Self {
        Self::new(CommandId::GotoAbsolutePosition, positioner_id)
            .with_payload(angle_pair_payload(alpha, beta, motor_steps))
    }

    pub fn goto_relative(positioner_id: u16, alpha: f64, beta: f64, motor_steps: u32) -> Self {
        Self::new(CommandId::GotoRelativePosition, positioner_id)
            .with_payload(angle_pair_payload(alpha, beta, motor_steps))
    }

    pub fn set_speed(positioner_id: u16, alpha_rpm: u32, beta_rpm: u32) -> Self {
        Self::new(CommandId::SetSpeed, positioner_id)
            .with_payload(speed_payload(alpha_rpm, beta_rpm))
    }

    pub fn set_current(positioner_id: u16, alpha: u32, beta: u32) -> Self {
        Self::new(CommandId::SetCurrent, positioner_id).with_payload(u32_pair_payload(alpha, beta))
    }

    pub fn set_holding_current(positioner_id: u16, alpha: u32, beta: u32) -> Self {
        Self::new(CommandId::SetHoldingCurrent, positioner_id)
            .with_payload(u32_pair_payload(alpha, beta))
    }

    pub fn get_holding_current(positioner_id: u16) -> Self {
        Self::new(CommandId::GetHoldingCurrent, positioner_id)
    }

    pub fn get_offsets(positioner_id: u16) -> Self {
        Self::new(CommandId::GetOffsets, positioner_id)
    }

    pub fn set_offsets(positioner_id: u16, alpha: f64, beta: f64, motor_steps: u32) -> Self {
        Self::new(CommandId::SetOffsets, positioner_id)
            .with_payload(angle_pair_payload(alpha, beta, motor_steps))
    }

    pub fn send_new_trajectory(positioner_id: u16, n_alpha: u32, n_beta: u32) -> Self {
        Self::new(CommandId::SendNewTrajectory, positioner_id)
            .with_payload(u32_pair_payload(n_alpha, n_beta))
    }

    /// One trajectory point: angle as signed motor steps, time as
    /// milliseconds from trajectory start.
    pub fn send_trajectory_data(
        positioner_id: u16,
        angle: f64,
        time_ms: u32,
        motor_steps: u32,
    ) -> Self {
        let mut payload = int_to_bytes(angle_to_motor_steps(angle, motor_steps), Endian::Big);
        payload.extend(int_to_bytes(time_ms, Endian::Big));
        Self::new(CommandId::SendTrajectoryData, positioner_id).with_payload(payload)
    }

    pub fn trajectory_data_end(positioner_id: u16) -> Self {
        Self::new(CommandId::TrajectoryDataEnd, positioner_id)
    }

    pub fn trajectory_transmission_abort(positioner_id: u16) -> Self {
        Self::new(CommandId::TrajectoryTransmissionAbort, positioner_id)
    }

    pub fn start_trajectory(positioner_ids: Vec<u16>) -> Self {
        Self::broadcast(CommandId::StartTrajectory, positioner_ids)
    }

    pub fn stop_trajectory(positioner_ids: Vec<u16>) -> Self {
        Self::broadcast(CommandId::StopTrajectory, positioner_ids)
    }

    pub fn initialize_datums(positioner_id: u16) -> Self {
        Self::new(CommandId::InitializeDatums, positioner_id)
    }

    pub fn hall(positioner_id: u16, on: bool) -> Self {
        let id = if on { CommandId::HallOn } else { CommandId::HallOff };
        Self::new(id, positioner_id)
    }

    pub fn switch_led(positioner_id: u16, on: bool) -> Self {
        let id = if on { CommandId::SwitchLedOn } else { CommandId::SwitchLedOff };
        Self::new(id, positioner_id)
    }

    pub fn start_datum_calibration(positioner_id: u16) -> Self {
        Self::new(CommandId::StartDatumCalibration, positioner_id)
    }

    pub fn start_motor_calibration(positioner_id: u16) -> Self {
        Self::new(CommandId::StartMotorCalibration, positioner_id)
    }

    pub fn start_cogging_calibration(positioner_id: u16) -> Self {
        Self::new(CommandId::StartCoggingCalibration, positioner_id)
    }

    pub fn save_internal_calibration(positioner_id: u16) -> Self {
        Self::new(CommandId::SaveInternalCalibration, positioner_id)
    }

    pub fn get_number_trajectories(positioner_id: u16) -> Self {
        Self::new(CommandId::GetNumberTrajectories, positioner_id)
    }

    pub fn start_firmware_upgrade(positioner_id: u16) -> Self {
        Self::new(CommandId::StartFirmwareUpgrade, positioner_id)
    }

    /// One chunk (up to 8 bytes) of a firmware image.
    pub fn send_firmware_data(positioner_id: u16, chunk: &[u8]) -> Self {
        debug_assert!(chunk.len() <= 8);
        Self::new(CommandId::SendFirmwareData, positioner_id).with_payload(chunk.to_vec())
    }

    pub fn get_bootloader_status(positioner_id: u16) -> Self {
        Self::new(CommandId::GetBootloaderStatus, positioner_id)
    }
}

// ── Payload packing ───────────────────────────────────────────────────────────

/// The one place the (alpha, beta) speed axis order is decided. The wire
/// order is alpha first, beta second; if the firmware reference ever says
/// otherwise, swap it here and nowhere else.
pub fn speed_payload(alpha_rpm: u32, beta_rpm: u32) -> Vec<u8> {
    u32_pair_payload(alpha_rpm, beta_rpm)
}

fn u32_pair_payload(alpha: u32, beta: u32) -> Vec<u8> {
    let mut payload = int_to_bytes(alpha, Endian::Big);
    payload.extend(int_to_bytes(beta, Endian::Big));
    payload
}

fn angle_pair_payload(alpha: f64, beta: f64, motor_steps: u32) -> Vec<u8> {
    let mut payload = int_to_bytes(angle_to_motor_steps(alpha, motor_steps), Endian::Big);
    payload.extend(int_to_bytes(angle_to_motor_steps(beta, motor_steps), Endian::Big));
    payload
}

// ── Reply decoding ────────────────────────────────────────────────────────────

fn require_len(reply: &Reply, len: usize) -> Result<()> {
    if reply.data.len() == len {
        Ok(())
    } else {
        Err(FpsError::Validation(format!(
            "{:?} reply from positioner {} has {} bytes, expected {len}",
            reply.command,
            reply.positioner_id,
            reply.data.len()
        )))
    }
}

/// Firmware version triplet, e.g. `"10.11.12"`.
pub fn decode_firmware(reply: &Reply) -> Result<String> {
    require_len(reply, 3)?;
    Ok(format!("{:02}.{:02}.{:02}", reply.data[0], reply.data[1], reply.data[2]))
}

/// A firmware in bootloader mode reports `80` as its middle component.
pub fn firmware_is_bootloader(firmware: &str) -> bool {
    firmware.split('.').nth(1) == Some("80")
}

pub fn decode_status_word(reply: &Reply) -> Result<u32> {
    require_len(reply, 4)?;
    Ok(bytes_to_int::<u32>(&reply.data, Endian::Big)?)
}

pub fn decode_positioner_status(reply: &Reply) -> Result<PositionerStatus> {
    Ok(PositionerStatus::from_bits_retain(decode_status_word(reply)?))
}

/// `(alpha, beta)` in degrees from a pair of signed step counts.
pub fn decode_position(reply: &Reply, motor_steps: u32) -> Result<(f64, f64)> {
    let (alpha, beta) = decode_step_pair(reply)?;
    Ok((
        motor_steps_to_angle(alpha, motor_steps),
        motor_steps_to_angle(beta, motor_steps),
    ))
}

pub fn decode_step_pair(reply: &Reply) -> Result<(i32, i32)> {
    require_len(reply, 8)?;
    Ok((
        bytes_to_int::<i32>(&reply.data[0..4], Endian::Big)?,
        bytes_to_int::<i32>(&reply.data[4..8], Endian::Big)?,
    ))
}

pub fn decode_u32_pair(reply: &Reply) -> Result<(u32, u32)> {
    require_len(reply, 8)?;
    Ok((
        bytes_to_int::<u32>(&reply.data[0..4], Endian::Big)?,
        bytes_to_int::<u32>(&reply.data[4..8], Endian::Big)?,
    ))
}

pub fn decode_u32(reply: &Reply) -> Result<u32> {
    require_len(reply, 4)?;
    Ok(bytes_to_int::<u32>(&reply.data, Endian::Big)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOTOR_STEPS: u32 = 1_968_000;

    fn reply(command: CommandId, data: Vec<u8>) -> Reply {
        Reply {
            positioner_id: 4,
            command,
            uid: 20,
            response_code: ResponseCode::CommandAccepted,
            data,
        }
    }

    #[test]
    fn goto_payload_is_step_pair() {
        let cmd = Command::goto_absolute(4, 90.0, 180.0, MOTOR_STEPS);
        assert_eq!(cmd.payload.len(), 8);
        let alpha = bytes_to_int::<i32>(&cmd.payload[0..4], Endian::Big).unwrap();
        let beta = bytes_to_int::<i32>(&cmd.payload[4..8], Endian::Big).unwrap();
        assert_eq!(alpha, 492_000);
        assert_eq!(beta, 984_000);
    }

    #[test]
    fn trajectory_point_payload() {
        let cmd = Command::send_trajectory_data(4, -1.0, 2_500, MOTOR_STEPS);
        let steps = bytes_to_int::<i32>(&cmd.payload[0..4], Endian::Big).unwrap();
        let time = bytes_to_int::<u32>(&cmd.payload[4..8], Endian::Big).unwrap();
        assert_eq!(steps, angle_to_motor_steps(-1.0, MOTOR_STEPS));
        assert_eq!(time, 2_500);
    }

    #[test]
    fn firmware_decoding_and_bootloader_detection() {
        let r = reply(CommandId::GetFirmwareVersion, vec![10, 11, 12]);
        let fw = decode_firmware(&r).unwrap();
        assert_eq!(fw, "10.11.12");
        assert!(!firmware_is_bootloader(&fw));

        let r = reply(CommandId::GetFirmwareVersion, vec![10, 80, 12]);
        assert!(firmware_is_bootloader(&decode_firmware(&r).unwrap()));
    }

    #[test]
    fn position_decoding_round_trips() {
        let cmd = Command::set_actual_position(4, 12.5, 170.0, MOTOR_STEPS);
        let r = reply(CommandId::GetActualPosition, cmd.payload);
        let (alpha, beta) = decode_position(&r, MOTOR_STEPS).unwrap();
        assert!((alpha - 12.5).abs() < 1e-3);
        assert!((beta - 170.0).abs() < 1e-3);
    }

    #[test]
    fn rejected_reply_maps_to_protocol_error() {
        let mut r = reply(CommandId::GotoAbsolutePosition, vec![]);
        r.response_code = ResponseCode::AlreadyInMotion;
        match r.accepted() {
            Err(FpsError::Protocol { positioner_id: 4, code, .. }) => {
                assert_eq!(code, ResponseCode::AlreadyInMotion)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn short_reply_is_rejected() {
        let r = reply(CommandId::GetStatus, vec![0, 1]);
        assert!(matches!(decode_status_word(&r), Err(FpsError::Validation(_))));
    }
}

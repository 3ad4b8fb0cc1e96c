//! Command opcodes and their protocol attributes.
//!
//! Every opcode carries three attributes the scheduler needs before a frame
//! ever leaves the controller:
//!
//! - `broadcastable`: may be addressed to positioner 0.
//! - `is_move`: takes the per-positioner move lock; at most one such
//!   command per positioner may be in flight.
//! - `is_safe`: may be interleaved with a move on the same positioner.

use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize,
)]
#[repr(u16)]
pub enum CommandId {
    GetId = 1,
    GetFirmwareVersion = 2,
    GetStatus = 3,
    GetCurrent = 4,

    SendNewTrajectory = 10,
    SendTrajectoryData = 11,
    TrajectoryDataEnd = 12,
    TrajectoryTransmissionAbort = 13,
    StartTrajectory = 14,
    StopTrajectory = 15,

    InitializeDatums = 20,
    StartDatumCalibration = 21,
    StartMotorCalibration = 22,
    StartCoggingCalibration = 23,
    SaveInternalCalibration = 24,

    GotoAbsolutePosition = 30,
    GotoRelativePosition = 31,
    GetActualPosition = 32,
    SetActualPosition = 33,
    SetSpeed = 34,
    SetCurrent = 35,
    SetHoldingCurrent = 36,
    GetHoldingCurrent = 37,
    GetOffsets = 38,
    SetOffsets = 39,

    HallOn = 40,
    HallOff = 41,
    AlphaClosedLoop = 42,
    AlphaOpenLoop = 43,
    BetaClosedLoop = 44,
    BetaOpenLoop = 45,
    CollisionDetectOn = 46,
    CollisionDetectOff = 47,
    SwitchLedOn = 48,
    SwitchLedOff = 49,
    GetNumberTrajectories = 50,

    StartFirmwareUpgrade = 200,
    SendFirmwareData = 201,
    GetBootloaderStatus = 202,
}

impl CommandId {
    /// May this command be sent to the broadcast address (positioner 0)?
    pub fn broadcastable(self) -> bool {
        matches!(
            self,
            Self::GetId
                | Self::GetFirmwareVersion
                | Self::GetStatus
                | Self::GetActualPosition
                | Self::StartTrajectory
                | Self::StopTrajectory
                | Self::TrajectoryTransmissionAbort
                | Self::InitializeDatums
                | Self::GetBootloaderStatus
        )
    }

    /// Does this command start a physical motion and therefore take the
    /// per-positioner move lock?
    pub fn is_move(self) -> bool {
        matches!(
            self,
            Self::GotoAbsolutePosition
                | Self::GotoRelativePosition
                | Self::StartTrajectory
                | Self::InitializeDatums
                | Self::StartDatumCalibration
                | Self::StartMotorCalibration
                | Self::StartCoggingCalibration
        )
    }

    /// May this command be issued while a move is in flight on the same
    /// positioner?
    pub fn is_safe(self) -> bool {
        matches!(
            self,
            Self::GetId
                | Self::GetFirmwareVersion
                | Self::GetStatus
                | Self::GetCurrent
                | Self::GetActualPosition
                | Self::GetHoldingCurrent
                | Self::SetHoldingCurrent
                | Self::GetOffsets
                | Self::GetNumberTrajectories
                | Self::StopTrajectory
                | Self::TrajectoryTransmissionAbort
                | Self::HallOn
                | Self::HallOff
                | Self::SwitchLedOn
                | Self::SwitchLedOff
                | Self::GetBootloaderStatus
        )
    }

    /// Reply window before the registry fails the command with a timeout.
    /// Broadcast discovery overrides this with the configured window.
    pub fn default_timeout(self) -> Duration {
        match self {
            Self::StartDatumCalibration
            | Self::StartMotorCalibration
            | Self::StartCoggingCalibration
            | Self::SaveInternalCalibration
            | Self::StartFirmwareUpgrade => Duration::from_secs(5),
            Self::SendFirmwareData => Duration::from_secs(15),
            _ => Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_wire_round_trip() {
        for cid in [
            CommandId::GetId,
            CommandId::SendTrajectoryData,
            CommandId::GotoAbsolutePosition,
            CommandId::GetBootloaderStatus,
        ] {
            let raw: u16 = cid.into();
            assert_eq!(CommandId::try_from(raw).unwrap(), cid);
        }
        assert!(CommandId::try_from(999u16).is_err());
    }

    #[test]
    fn move_commands_are_not_safe() {
        for cid in [
            CommandId::GotoAbsolutePosition,
            CommandId::GotoRelativePosition,
            CommandId::StartTrajectory,
            CommandId::InitializeDatums,
            CommandId::StartMotorCalibration,
        ] {
            assert!(cid.is_move());
            assert!(!cid.is_safe(), "{cid:?} cannot be both move and safe");
        }
    }

    #[test]
    fn stop_is_safe_during_motion() {
        assert!(CommandId::StopTrajectory.is_safe());
        assert!(CommandId::GetStatus.is_safe());
    }
}

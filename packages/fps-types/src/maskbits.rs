//! Status flag words reported by positioner firmware.
//!
//! The firmware reports a 32-bit mask via GET_STATUS. A separate mask
//! applies while the firmware is in bootloader mode; the controller picks
//! the interpretation from the reported firmware version.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Normal-mode positioner status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PositionerStatus: u32 {
        const SYSTEM_INITIALIZED            = 0x0000_0001;
        const CONFIG_CHANGED                = 0x0000_0002;
        const BSETTINGS_CHANGED             = 0x0000_0004;
        const DATA_STREAMING                = 0x0000_0008;
        const RECEIVING_TRAJECTORY          = 0x0000_0010;
        const TRAJECTORY_ALPHA_RECEIVED     = 0x0000_0020;
        const TRAJECTORY_BETA_RECEIVED      = 0x0000_0040;
        const LOW_POWER_AFTER_MOVE          = 0x0000_0080;
        const DISPLACEMENT_COMPLETED        = 0x0000_0100;
        const DISPLACEMENT_COMPLETED_ALPHA  = 0x0000_0200;
        const DISPLACEMENT_COMPLETED_BETA   = 0x0000_0400;
        const COLLISION_ALPHA               = 0x0000_0800;
        const COLLISION_BETA                = 0x0000_1000;
        const CLOSED_LOOP_ALPHA             = 0x0000_2000;
        const CLOSED_LOOP_BETA              = 0x0000_4000;
        const PRECISE_POSITIONING_ALPHA     = 0x0000_8000;
        const PRECISE_POSITIONING_BETA      = 0x0001_0000;
        const COLLISION_DETECT_ALPHA_DISABLE = 0x0002_0000;
        const COLLISION_DETECT_BETA_DISABLE = 0x0004_0000;
        const MOTOR_ALPHA_CALIBRATED        = 0x0008_0000;
        const MOTOR_BETA_CALIBRATED         = 0x0010_0000;
        const DATUM_ALPHA_CALIBRATED        = 0x0020_0000;
        const DATUM_BETA_CALIBRATED         = 0x0040_0000;
        const COGGING_ALPHA_CALIBRATED      = 0x0080_0000;
        const COGGING_BETA_CALIBRATED       = 0x0100_0000;
        const ESTIMATED_POSITION            = 0x0200_0000;
        const POSITION_RESTORED             = 0x0400_0000;
        const DATUM_ALPHA_INITIALIZED       = 0x0800_0000;
        const DATUM_BETA_INITIALIZED        = 0x1000_0000;
        const HALL_ALPHA_DISABLE            = 0x2000_0000;
        const HALL_BETA_DISABLE             = 0x4000_0000;
        const UNKNOWN                       = 0x8000_0000;
    }
}

impl PositionerStatus {
    /// The firmware has completed its boot-time initialisation.
    pub fn initialised(self) -> bool {
        self.contains(Self::SYSTEM_INITIALIZED)
    }

    /// Both axes have established their datum.
    pub fn datums_initialised(self) -> bool {
        self.contains(Self::DATUM_ALPHA_INITIALIZED | Self::DATUM_BETA_INITIALIZED)
    }

    /// The last commanded move finished on both axes.
    pub fn displacement_done(self) -> bool {
        self.contains(
            Self::DISPLACEMENT_COMPLETED
                | Self::DISPLACEMENT_COMPLETED_ALPHA
                | Self::DISPLACEMENT_COMPLETED_BETA,
        )
    }

    /// Either axis reports a collision.
    pub fn collided(self) -> bool {
        self.intersects(Self::COLLISION_ALPHA | Self::COLLISION_BETA)
    }

    /// Both axis trajectories have been received and checked.
    pub fn trajectory_received(self) -> bool {
        self.contains(Self::TRAJECTORY_ALPHA_RECEIVED | Self::TRAJECTORY_BETA_RECEIVED)
    }

    /// All calibrations (motor, datum, cogging) completed on both axes.
    pub fn fully_calibrated(self) -> bool {
        self.contains(
            Self::MOTOR_ALPHA_CALIBRATED
                | Self::MOTOR_BETA_CALIBRATED
                | Self::DATUM_ALPHA_CALIBRATED
                | Self::DATUM_BETA_CALIBRATED
                | Self::COGGING_ALPHA_CALIBRATED
                | Self::COGGING_BETA_CALIBRATED,
        )
    }
}

bitflags! {
    /// Status word while the firmware runs in bootloader mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BootloaderStatus: u32 {
        const BOOTLOADER_INIT        = 0x0000_0001;
        const BOOTLOADER_TIMEOUT     = 0x0000_0002;
        const BSETTINGS_CHANGED      = 0x0000_0200;
        const RECEIVING_NEW_FIRMWARE = 0x0001_0000;
        const NEW_FIRMWARE_RECEIVED  = 0x0100_0000;
        const NEW_FIRMWARE_CHECK_OK  = 0x0200_0000;
        const NEW_FIRMWARE_CHECK_BAD = 0x0400_0000;
        const UNKNOWN                = 0x4000_0000;
    }
}

/// Low byte of a reply identifier. Zero means the command was accepted;
/// anything else classifies the rejection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ResponseCode {
    CommandAccepted = 0,
    ValueOutOfRange = 1,
    InvalidTrajectory = 2,
    AlreadyInMotion = 3,
    NotInitialized = 4,
    InvalidBroadcastCommand = 10,
    InvalidBootloaderCommand = 11,
    InvalidCommand = 12,
    UnknownCommand = 13,
}

impl ResponseCode {
    pub fn is_accepted(self) -> bool {
        self == Self::CommandAccepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_require_all_bits() {
        let partial = PositionerStatus::DISPLACEMENT_COMPLETED
            | PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA;
        assert!(!partial.displacement_done());

        let done = partial | PositionerStatus::DISPLACEMENT_COMPLETED_BETA;
        assert!(done.displacement_done());
    }

    #[test]
    fn collision_is_either_axis() {
        assert!(PositionerStatus::COLLISION_ALPHA.collided());
        assert!(PositionerStatus::COLLISION_BETA.collided());
        assert!(!PositionerStatus::SYSTEM_INITIALIZED.collided());
    }

    #[test]
    fn response_code_from_wire_byte() {
        assert_eq!(ResponseCode::try_from(0u8).unwrap(), ResponseCode::CommandAccepted);
        assert_eq!(ResponseCode::try_from(10u8).unwrap(), ResponseCode::InvalidBroadcastCommand);
        assert!(ResponseCode::try_from(99u8).is_err());
    }

    #[test]
    fn status_word_survives_unknown_bits() {
        // Firmware may set bits this build does not name yet.
        let raw = 0x0000_0101u32 | 0x0000_0008;
        let status = PositionerStatus::from_bits_retain(raw);
        assert!(status.contains(PositionerStatus::SYSTEM_INITIALIZED));
        assert!(status.contains(PositionerStatus::DISPLACEMENT_COMPLETED));
    }
}

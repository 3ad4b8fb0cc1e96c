//! # fps-types
//!
//! Shared CAN wire structures for the FPS positioner array controller.
//!
//! These types are used by:
//! - `fps-controller`: building command frames and parsing positioner replies
//! - `fps-simulator`: answering frames as if real positioners were on the bus
//!
//! ## Wire Conventions
//!
//! - Extended (29-bit) identifiers only; standard frames are rejected.
//! - Identifier layout, high to low: positioner id (11 bits), command id
//!   (10 bits), response code or transaction tag (8 bits).
//! - Positioner id 0 is the broadcast address.
//! - Multi-byte payload integers are big-endian unless a command says
//!   otherwise. There is deliberately no native-endian option.
//! - Motor positions travel as signed 32-bit step counts; the steps per
//!   revolution constant is configuration-provided, never hard-coded here.

use serde::{Deserialize, Serialize};

mod command_id;
mod maskbits;

pub use command_id::CommandId;
pub use maskbits::{BootloaderStatus, PositionerStatus, ResponseCode};

/// Broadcast address: a frame sent to positioner 0 targets every positioner.
pub const BROADCAST_ID: u16 = 0;

/// Highest addressable positioner id (11-bit field).
pub const MAX_POSITIONER_ID: u16 = 0x7FF;

/// Highest command id (10-bit field).
pub const MAX_COMMAND_ID: u16 = 0x3FF;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("positioner id {0} exceeds 11 bits")]
    PositionerIdRange(u16),
    #[error("command id {0} exceeds 10 bits")]
    CommandIdRange(u16),
    #[error("identifier {0:#x} exceeds 29 bits")]
    IdentifierRange(u32),
    #[error("payload of {0} bytes does not fit in an 8-byte frame")]
    PayloadTooLong(usize),
    #[error("expected {expected} payload bytes, got {got}")]
    PayloadLength { expected: usize, got: usize },
    #[error("unknown command id {0}")]
    UnknownCommand(u16),
    #[error("unknown response code {0}")]
    UnknownResponseCode(u8),
}

// ── Identifier ────────────────────────────────────────────────────────────────

/// The 29-bit extended frame identifier, unpacked.
///
/// The low byte carries the response code on replies and the transaction
/// tag on outgoing commands; the device echoes the tag back, which is what
/// makes reply correlation possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub positioner_id: u16,
    pub command_id: u16,
    pub code: u8,
}

impl Identifier {
    pub fn new(positioner_id: u16, command_id: u16, code: u8) -> Result<Self, WireError> {
        if positioner_id > MAX_POSITIONER_ID {
            return Err(WireError::PositionerIdRange(positioner_id));
        }
        if command_id > MAX_COMMAND_ID {
            return Err(WireError::CommandIdRange(command_id));
        }
        Ok(Self { positioner_id, command_id, code })
    }

    /// Pack into the 29-bit wire representation:
    /// `(pid << 18) | (command << 8) | code`.
    pub fn pack(&self) -> u32 {
        (u32::from(self.positioner_id) << 18)
            | (u32::from(self.command_id) << 8)
            | u32::from(self.code)
    }

    /// Unpack a raw 29-bit identifier into its fields.
    pub fn unpack(raw: u32) -> Result<Self, WireError> {
        if raw >= 1 << 29 {
            return Err(WireError::IdentifierRange(raw));
        }
        Ok(Self {
            positioner_id: ((raw >> 18) & 0x7FF) as u16,
            command_id: ((raw >> 8) & 0x3FF) as u16,
            code: (raw & 0xFF) as u8,
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.positioner_id == BROADCAST_ID
    }

    pub fn command(&self) -> Result<CommandId, WireError> {
        CommandId::try_from(self.command_id).map_err(|_| WireError::UnknownCommand(self.command_id))
    }

    /// Interpret the low byte as a reply response code.
    pub fn response_code(&self) -> Result<ResponseCode, WireError> {
        ResponseCode::try_from(self.code).map_err(|_| WireError::UnknownResponseCode(self.code))
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One fixed-width CAN frame: 29-bit identifier plus 0..8 payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub identifier: u32,
    /// Always true on this bus; carried so gateway codecs can reject
    /// standard-id traffic explicitly.
    pub extended: bool,
    pub dlc: u8,
    pub data: [u8; 8],
}

impl Frame {
    pub fn new(identifier: Identifier, payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() > 8 {
            return Err(WireError::PayloadTooLong(payload.len()));
        }
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            identifier: identifier.pack(),
            extended: true,
            dlc: payload.len() as u8,
            data,
        })
    }

    /// The valid payload slice (`dlc` bytes).
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    pub fn parse_identifier(&self) -> Result<Identifier, WireError> {
        Identifier::unpack(self.identifier)
    }
}

// ── Byte helpers ──────────────────────────────────────────────────────────────

/// Explicit byte order for payload integers. Native order is not
/// representable on purpose: the wire contract is always explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for i16 {}
    impl Sealed for i32 {}
}

/// Integers that can cross the bus. Widths up to 32 bits.
pub trait WireInt: sealed::Sealed + Copy {
    const WIDTH: usize;
    fn to_wire(self, endian: Endian) -> Vec<u8>;
    fn from_wire(bytes: &[u8], endian: Endian) -> Result<Self, WireError>
    where
        Self: Sized;
}

macro_rules! impl_wire_int {
    ($($ty:ty),+) => {$(
        impl WireInt for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn to_wire(self, endian: Endian) -> Vec<u8> {
                match endian {
                    Endian::Big => self.to_be_bytes().to_vec(),
                    Endian::Little => self.to_le_bytes().to_vec(),
                }
            }

            fn from_wire(bytes: &[u8], endian: Endian) -> Result<Self, WireError> {
                let arr: [u8; std::mem::size_of::<$ty>()] = bytes
                    .try_into()
                    .map_err(|_| WireError::PayloadLength {
                        expected: std::mem::size_of::<$ty>(),
                        got: bytes.len(),
                    })?;
                Ok(match endian {
                    Endian::Big => <$ty>::from_be_bytes(arr),
                    Endian::Little => <$ty>::from_le_bytes(arr),
                })
            }
        }
    )+};
}

impl_wire_int!(u8, u16, u32, i16, i32);

/// Serialize an integer for the wire. Big-endian is the protocol default.
pub fn int_to_bytes<T: WireInt>(value: T, endian: Endian) -> Vec<u8> {
    value.to_wire(endian)
}

/// Deserialize an integer from exactly `T::WIDTH` bytes.
pub fn bytes_to_int<T: WireInt>(bytes: &[u8], endian: Endian) -> Result<T, WireError> {
    T::from_wire(bytes, endian)
}

// ── Motor step conversion ─────────────────────────────────────────────────────

/// Convert a signed motor step count to degrees, given the configured
/// steps-per-revolution for the axis reduction.
pub fn motor_steps_to_angle(steps: i32, motor_steps: u32) -> f64 {
    f64::from(steps) / f64::from(motor_steps) * 360.0
}

/// Convert degrees to the nearest signed motor step count.
pub fn angle_to_motor_steps(angle: f64, motor_steps: u32) -> i32 {
    (angle / 360.0 * f64::from(motor_steps)).round() as i32
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_pack_known_values() {
        let id = Identifier::new(5, 17, 0).unwrap();
        assert_eq!(id.pack(), 1_315_072);

        let id = Identifier::new(450, 5, 1).unwrap();
        assert_eq!(id.pack(), 117_966_081);
    }

    #[test]
    fn identifier_unpack_known_values() {
        let id = Identifier::unpack(1_315_074).unwrap();
        assert_eq!(
            id,
            Identifier { positioner_id: 5, command_id: 17, code: 2 }
        );
        assert_eq!(id.response_code().unwrap(), ResponseCode::InvalidTrajectory);
    }

    #[test]
    fn identifier_round_trip_field_extremes() {
        for (pid, cid, code) in [
            (0u16, 0u16, 0u8),
            (MAX_POSITIONER_ID, MAX_COMMAND_ID, 0xFF),
            (1, MAX_COMMAND_ID, 0),
            (MAX_POSITIONER_ID, 0, 0xFF),
        ] {
            let id = Identifier::new(pid, cid, code).unwrap();
            assert_eq!(Identifier::unpack(id.pack()).unwrap(), id);
        }
    }

    #[test]
    fn identifier_rejects_out_of_range() {
        assert_eq!(
            Identifier::new(2048, 0, 0),
            Err(WireError::PositionerIdRange(2048))
        );
        assert_eq!(
            Identifier::new(0, 1024, 0),
            Err(WireError::CommandIdRange(1024))
        );
        assert!(matches!(
            Identifier::unpack(1 << 29),
            Err(WireError::IdentifierRange(_))
        ));
    }

    #[test]
    fn int_to_bytes_both_endians() {
        assert_eq!(int_to_bytes(5u32, Endian::Big), vec![0, 0, 0, 5]);
        assert_eq!(int_to_bytes(5u32, Endian::Little), vec![5, 0, 0, 0]);
        assert_eq!(int_to_bytes(5u16, Endian::Big), vec![0, 5]);
        assert_eq!(int_to_bytes(-2i32, Endian::Big), vec![0xFF, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn bytes_to_int_round_trip() {
        assert_eq!(bytes_to_int::<u16>(&[0, 5], Endian::Big).unwrap(), 5);
        for v in [0i32, 1, -1, i32::MAX, i32::MIN, 123_456] {
            let bytes = int_to_bytes(v, Endian::Big);
            assert_eq!(bytes_to_int::<i32>(&bytes, Endian::Big).unwrap(), v);
            let bytes = int_to_bytes(v, Endian::Little);
            assert_eq!(bytes_to_int::<i32>(&bytes, Endian::Little).unwrap(), v);
        }
    }

    #[test]
    fn bytes_to_int_length_mismatch() {
        assert!(matches!(
            bytes_to_int::<u32>(&[0, 5], Endian::Big),
            Err(WireError::PayloadLength { expected: 4, got: 2 })
        ));
    }

    #[test]
    fn frame_payload_bounds() {
        let id = Identifier::new(1, 3, 0).unwrap();
        let frame = Frame::new(id, &[1, 2, 3]).unwrap();
        assert_eq!(frame.dlc, 3);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert!(frame.extended);

        assert_eq!(Frame::new(id, &[0; 9]), Err(WireError::PayloadTooLong(9)));
    }

    #[test]
    fn step_angle_conversion() {
        let motor_steps: u32 = 1_968_000;
        assert_eq!(angle_to_motor_steps(360.0, motor_steps), 1_968_000);
        assert_eq!(angle_to_motor_steps(-180.0, motor_steps), -984_000);
        let steps = angle_to_motor_steps(123.4, motor_steps);
        let angle = motor_steps_to_angle(steps, motor_steps);
        assert!((angle - 123.4).abs() < 1e-3);
    }
}

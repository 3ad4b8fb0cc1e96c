//! # error
//!
//! Closed error taxonomy for the controller. Every fallible path in the
//! crate resolves to one of these kinds; nothing is retried silently.

use std::collections::BTreeSet;

use fps_types::{CommandId, PositionerStatus, ResponseCode, WireError};

pub type Result<T> = std::result::Result<T, FpsError>;

#[derive(Debug, thiserror::Error)]
pub enum FpsError {
    /// Transport failure: connection lost, malformed line, gateway error.
    /// Unrecoverable on the affected channel.
    #[error("bus error: {0}")]
    Bus(String),

    /// The device answered with a non-zero response code.
    #[error("positioner {positioner_id} rejected {command:?}: {code:?}")]
    Protocol {
        positioner_id: u16,
        command: CommandId,
        code: ResponseCode,
    },

    /// No reply (or not enough replies for a broadcast) within the window.
    /// `missing` lists the positioners that never answered.
    #[error("{command:?} timed out ({} positioner(s) missing)", .missing.len())]
    Timeout {
        command: CommandId,
        missing: Vec<u16>,
    },

    /// A caller-supplied argument violates a declared invariant.
    #[error("validation: {0}")]
    Validation(String),

    /// Trajectory upload, start, or monitoring failed.
    #[error("trajectory failed ({}): {message}", format_pids(.failed))]
    Trajectory {
        failed: BTreeSet<u16>,
        message: String,
    },

    /// A collision bit asserted during motion.
    #[error("collision on positioner {positioner_id} (status {status:?})")]
    Collision {
        positioner_id: u16,
        status: PositionerStatus,
    },

    /// The configuration mapping is missing or inconsistent.
    #[error("configuration: {0}")]
    Config(String),

    /// The awaiting side of a command went away before completion.
    #[error("{command:?} was cancelled")]
    Cancelled { command: CommandId },

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl FpsError {
    /// Convenience constructor for transport errors wrapping I/O failures.
    pub fn bus(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Bus(format!("{context}: {err}"))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

fn format_pids(pids: &BTreeSet<u16>) -> String {
    let mut s = String::new();
    for (i, pid) in pids.iter().enumerate() {
        if i > 0 {
            s.push_str(", ");
        }
        s.push_str(&pid.to_string());
    }
    if s.is_empty() {
        s.push_str("none");
    }
    s
}
